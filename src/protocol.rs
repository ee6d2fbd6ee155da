/// Modbus TCP framing for holding-register reads
///
/// The meter is only ever asked for holding registers (function 0x03), so
/// this module carries exactly that slice of the protocol: MBAP header
/// handling, request/response encoding for both client and simulator side,
/// exception codes and word helpers.
///
/// Frame layout:
///
/// ```text
/// | transaction id (2) | protocol id (2) | length (2) | unit id (1) | function (1) | data ... |
/// ```
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MeterError, MeterResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier (1-247)
pub type UnitId = u8;

/// Read Holding Registers function code
pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;

/// MBAP header size, excluding the unit id
pub const MBAP_HEADER_SIZE: usize = 6;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum number of registers in one read request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code is not supported by the meter",
            ModbusException::IllegalDataAddress => "The register address is not exposed by the meter",
            ModbusException::IllegalDataValue => "A value in the request is not allowed",
            ModbusException::ServerDeviceFailure => "The meter failed while processing the request",
            ModbusException::Acknowledge => "The meter accepted the request but needs more time",
            ModbusException::ServerDeviceBusy => "The meter is busy with a long-running command",
            ModbusException::MemoryParityError => "The meter detected a memory parity error",
            ModbusException::GatewayPathUnavailable => "Gateway could not allocate a path to the meter",
            ModbusException::GatewayTargetDeviceFailedToRespond => "The meter behind the gateway did not respond",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Parsed MBAP header plus unit id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Number of bytes following the length field (unit id + PDU)
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Size of the header including the unit id byte
    pub const SIZE: usize = MBAP_HEADER_SIZE + 1;

    /// Parse the first seven bytes of a frame
    pub fn parse(frame: &[u8]) -> MeterResult<Self> {
        if frame.len() < Self::SIZE {
            return Err(MeterError::frame("Frame too short for MBAP header"));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            protocol_id: u16::from_be_bytes([frame[2], frame[3]]),
            length: u16::from_be_bytes([frame[4], frame[5]]),
            unit_id: frame[6],
        };

        if header.protocol_id != 0 {
            return Err(MeterError::frame(format!(
                "Invalid protocol id: {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || MBAP_HEADER_SIZE + header.length as usize > MAX_TCP_FRAME_SIZE {
            return Err(MeterError::frame(format!(
                "Invalid MBAP length: {}",
                header.length
            )));
        }

        Ok(header)
    }

    /// Total frame size announced by this header
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_SIZE + self.length as usize
    }
}

/// Holding register read request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub unit_id: UnitId,
    pub address: ModbusAddress,
    pub quantity: u16,
}

impl ReadRequest {
    /// Create a new read request
    pub fn new(unit_id: UnitId, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            unit_id,
            address,
            quantity,
        }
    }

    /// Validate the request against protocol limits
    pub fn validate(&self) -> MeterResult<()> {
        if self.unit_id == 0 || self.unit_id > 247 {
            return Err(MeterError::invalid_data(format!(
                "Invalid unit id: {}",
                self.unit_id
            )));
        }

        if self.quantity == 0 || self.quantity > MAX_REGISTERS_PER_REQUEST {
            return Err(MeterError::invalid_address(self.address, self.quantity));
        }

        if self.address as u32 + self.quantity as u32 > 65536 {
            return Err(MeterError::invalid_address(self.address, self.quantity));
        }

        Ok(())
    }

    /// Encode as a Modbus TCP frame
    pub fn encode(&self, transaction_id: u16) -> Vec<u8> {
        let mut frame = BytesMut::with_capacity(MbapHeader::SIZE + 5);

        // unit id + function + address + quantity
        let length: u16 = 1 + 1 + 4;

        frame.put_u16(transaction_id);
        frame.put_u16(0);
        frame.put_u16(length);
        frame.put_u8(self.unit_id);
        frame.put_u8(FUNCTION_READ_HOLDING_REGISTERS);
        frame.put_u16(self.address);
        frame.put_u16(self.quantity);

        frame.to_vec()
    }

    /// Decode a request frame (simulator side)
    ///
    /// Returns the header, the function code and the request built from the
    /// PDU. Requests for other function codes are returned with `None` so the
    /// caller can answer with an exception.
    pub fn decode(frame: &[u8]) -> MeterResult<(MbapHeader, u8, Option<Self>)> {
        let header = MbapHeader::parse(frame)?;
        if frame.len() < header.frame_len() {
            return Err(MeterError::frame("Incomplete request frame"));
        }

        let function = frame[MbapHeader::SIZE];
        if function != FUNCTION_READ_HOLDING_REGISTERS {
            return Ok((header, function, None));
        }

        let data = &frame[MbapHeader::SIZE + 1..header.frame_len()];
        if data.len() < 4 {
            return Err(MeterError::frame("Invalid read holding registers request"));
        }

        let request = Self {
            unit_id: header.unit_id,
            address: u16::from_be_bytes([data[0], data[1]]),
            quantity: u16::from_be_bytes([data[2], data[3]]),
        };

        Ok((header, function, Some(request)))
    }
}

/// Holding register read response
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub transaction_id: u16,
    pub unit_id: UnitId,
    pub function: u8,
    /// PDU data after the function code (byte count + register bytes)
    pub data: Vec<u8>,
    pub exception: Option<u8>,
}

impl ReadResponse {
    /// Decode a complete response frame
    pub fn decode(frame: &[u8]) -> MeterResult<Self> {
        let header = MbapHeader::parse(frame)?;
        if frame.len() < header.frame_len() {
            return Err(MeterError::frame("Incomplete frame"));
        }

        let function_code = frame[MbapHeader::SIZE];

        if function_code & 0x80 != 0 {
            if header.frame_len() < MbapHeader::SIZE + 2 {
                return Err(MeterError::frame("Invalid exception response"));
            }
            return Ok(Self {
                transaction_id: header.transaction_id,
                unit_id: header.unit_id,
                function: function_code & 0x7F,
                data: Vec::new(),
                exception: Some(frame[MbapHeader::SIZE + 1]),
            });
        }

        Ok(Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            function: function_code,
            data: frame[MbapHeader::SIZE + 1..header.frame_len()].to_vec(),
            exception: None,
        })
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Match this response against the request that produced it and extract
    /// the register words
    pub fn into_registers(self, transaction_id: u16, request: &ReadRequest) -> MeterResult<Vec<u16>> {
        if self.transaction_id != transaction_id {
            return Err(MeterError::protocol(format!(
                "Transaction id mismatch: expected {}, got {}",
                transaction_id, self.transaction_id
            )));
        }
        if self.unit_id != request.unit_id {
            return Err(MeterError::protocol(format!(
                "Unit id mismatch: expected {}, got {}",
                request.unit_id, self.unit_id
            )));
        }
        if let Some(code) = self.exception {
            return Err(MeterError::exception(self.function, code));
        }
        if self.function != FUNCTION_READ_HOLDING_REGISTERS {
            return Err(MeterError::protocol(format!(
                "Unexpected function code: 0x{:02X}",
                self.function
            )));
        }

        let Some((&byte_count, payload)) = self.data.split_first() else {
            return Err(MeterError::frame("Empty response data"));
        };
        let expected = request.quantity as usize * 2;
        if byte_count as usize != expected || payload.len() < expected {
            return Err(MeterError::protocol(format!(
                "Byte count mismatch: expected {}, got {}",
                expected, byte_count
            )));
        }

        data_utils::bytes_to_registers(&payload[..expected])
    }
}

/// Encode a successful read response (simulator side)
pub fn encode_read_response(transaction_id: u16, unit_id: UnitId, registers: &[u16]) -> Vec<u8> {
    let byte_count = registers.len() * 2;
    let length = (1 + 1 + 1 + byte_count) as u16;
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_SIZE + length as usize);

    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16(length);
    frame.put_u8(unit_id);
    frame.put_u8(FUNCTION_READ_HOLDING_REGISTERS);
    frame.put_u8(byte_count as u8);
    for &register in registers {
        frame.put_u16(register);
    }

    frame.to_vec()
}

/// Encode an exception response (simulator side)
pub fn encode_exception_response(transaction_id: u16, unit_id: UnitId, function: u8, code: u8) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(MbapHeader::SIZE + 2);

    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16(3);
    frame.put_u8(unit_id);
    frame.put_u8(function | 0x80);
    frame.put_u8(code);

    frame.to_vec()
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> MeterResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(MeterError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Convert u32 to two u16 registers (high word first)
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Convert two u16 registers to u32 (high word first)
    pub fn registers_to_u32(registers: &[u16]) -> MeterResult<u32> {
        if registers.len() < 2 {
            return Err(MeterError::invalid_data("Need at least 2 registers for u32"));
        }
        Ok(((registers[0] as u32) << 16) | (registers[1] as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02), Some(ModbusException::IllegalDataAddress));
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert_eq!(ModbusException::from_u8(0x07), None);
    }

    #[test]
    fn test_request_validation() {
        assert!(ReadRequest::new(1, 100, 2).validate().is_ok());
        assert!(ReadRequest::new(0, 100, 2).validate().is_err());
        assert!(ReadRequest::new(1, 100, 0).validate().is_err());
        assert!(ReadRequest::new(1, 100, 200).validate().is_err());
        assert!(ReadRequest::new(1, 65535, 2).validate().is_err());
    }

    #[test]
    fn test_request_encoding() {
        let frame = ReadRequest::new(1, 0x0010, 2).encode(7);
        assert_eq!(
            frame,
            vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x10, 0x00, 0x02]
        );

        let (header, function, request) = ReadRequest::decode(&frame).unwrap();
        assert_eq!(header.transaction_id, 7);
        assert_eq!(function, FUNCTION_READ_HOLDING_REGISTERS);
        assert_eq!(request, Some(ReadRequest::new(1, 0x0010, 2)));
    }

    #[test]
    fn test_response_parsing() {
        let request = ReadRequest::new(1, 0, 2);
        let frame = encode_read_response(9, 1, &[0x1234, 0x5678]);

        let response = ReadResponse::decode(&frame).unwrap();
        assert!(!response.is_exception());
        assert_eq!(response.into_registers(9, &request).unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_response_mismatch_is_protocol_error() {
        let request = ReadRequest::new(1, 0, 2);

        let stale = ReadResponse::decode(&encode_read_response(8, 1, &[1, 2])).unwrap();
        assert!(matches!(stale.into_registers(9, &request), Err(MeterError::Protocol { .. })));

        let short = ReadResponse::decode(&encode_read_response(9, 1, &[1])).unwrap();
        assert!(matches!(short.into_registers(9, &request), Err(MeterError::Protocol { .. })));
    }

    #[test]
    fn test_exception_response() {
        let request = ReadRequest::new(1, 0, 1);
        let frame = encode_exception_response(3, 1, FUNCTION_READ_HOLDING_REGISTERS, 0x02);

        let response = ReadResponse::decode(&frame).unwrap();
        assert!(response.is_exception());
        match response.into_registers(3, &request) {
            Err(MeterError::Exception { function, code, .. }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_header_rejects_bad_protocol_id() {
        let mut frame = ReadRequest::new(1, 0, 1).encode(1);
        frame[3] = 0x01;
        assert!(MbapHeader::parse(&frame).is_err());
    }

    #[test]
    fn test_u32_words() {
        assert_eq!(data_utils::registers_to_u32(&[0x1234, 0x5678]).unwrap(), 0x1234_5678);
        assert_eq!(data_utils::u32_to_registers(0xFFFF_0001), [0xFFFF, 0x0001]);
        assert!(data_utils::registers_to_u32(&[1]).is_err());
    }
}
