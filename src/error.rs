//! # Meter Poller Error Handling
//!
//! Error taxonomy for the polling engine. Every fallible operation in the
//! crate returns [`MeterResult<T>`], and the variants line up with the way the
//! engine recovers from each class of fault.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket failures while talking to the meter
//! - **Connection Errors**: connect refused, not connected, connection lost
//! - **Timeout Errors**: any bounded wait that expired
//!
//! Recovered locally by the connection manager's capped, deduplicated
//! reconnect. Never surfaced to the host as a hard failure.
//!
//! ### Protocol Errors
//! - **Protocol Errors**: response does not match the request
//! - **Frame Errors**: malformed MBAP frames
//! - **Exception Responses**: Modbus exception codes returned by the meter
//!
//! Recovered by skipping the affected register for the current cycle.
//!
//! ### Configuration Errors
//! - **Configuration**: missing host, zero port, bad unit id, zero timeouts
//! - **Invalid Interval**: non-positive polling interval
//!
//! Raised synchronously by the call that introduced them.
//!
//! ### Terminal Errors
//! - **Reconnect Exhausted**: the reconnect budget is spent; the instance
//!   must be discarded and recreated.
//!
//! ## Usage
//!
//! ```rust
//! use meter_poller::{MeterError, MeterResult};
//!
//! fn handle(result: MeterResult<Vec<u16>>) {
//!     match result {
//!         Ok(words) => println!("read {} words", words.len()),
//!         Err(error) if error.is_terminal() => eprintln!("giving up: {}", error),
//!         Err(error) if error.is_recoverable() => println!("will retry: {}", error),
//!         Err(error) => eprintln!("skipping: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for meter poller operations
pub type MeterResult<T> = Result<T, MeterError>;

/// Errors produced by the polling engine
///
/// Each variant carries enough context to be logged as-is; the classification
/// helpers ([`is_recoverable`](MeterError::is_recoverable),
/// [`is_transport_error`](MeterError::is_transport_error),
/// [`is_protocol_error`](MeterError::is_protocol_error),
/// [`is_terminal`](MeterError::is_terminal)) drive the recovery decisions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeterError {
    /// Socket-level I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance problem
    ///
    /// # Examples
    /// - Connection refused by the meter
    /// - Read attempted while no stream is open
    /// - Peer closed the connection
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Bounded wait expired
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Response does not belong to the request that was sent
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Malformed MBAP frame
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Decoded data does not fit what the register descriptor expects
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Address/quantity outside protocol limits
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Operator or programmer configuration fault
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Polling interval must be strictly positive
    #[error("Invalid polling interval: {interval_ms}ms (must be > 0)")]
    InvalidInterval { interval_ms: u64 },

    /// Reconnect budget spent; the instance stays idle until recreated
    #[error("Reconnection exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Operation attempted on an instance that was stopped
    #[error("Polling engine is stopped")]
    Stopped,

    /// Lock poisoning, task join failures and similar internal faults
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MeterError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to their names.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an invalid interval error
    pub fn invalid_interval(interval_ms: u64) -> Self {
        Self::InvalidInterval { interval_ms }
    }

    /// Create a reconnect-exhausted error
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::ReconnectExhausted { attempts }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (a later attempt may succeed)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use meter_poller::MeterError;
    ///
    /// assert!(MeterError::timeout("read register", 3000).is_recoverable());
    /// assert!(!MeterError::reconnect_exhausted(10).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Protocol { .. } => true,
            Self::Frame { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge / Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Exception { .. } | Self::Frame { .. }
        )
    }

    /// Check if the error leaves the instance permanently idle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReconnectExhausted { .. } | Self::Stopped)
    }

    /// Check if the error is a configuration fault
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::InvalidInterval { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for MeterError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed error carries no duration; call sites that know the timeout
/// build [`MeterError::timeout`] directly.
impl From<tokio::time::error::Elapsed> for MeterError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for MeterError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for MeterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
