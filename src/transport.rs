//! # Meter Transport Layer
//!
//! One persistent Modbus TCP connection to one meter.
//!
//! The [`RegisterTransport`] trait is the seam between the connection manager
//! and the wire: connect, close, read holding registers, and report liveness.
//! [`TcpTransport`] is the production implementation; tests substitute their
//! own.
//!
//! ## Liveness
//!
//! `is_connected()` reflects the transport's own flag, which degrades on any
//! socket error, timeout or close. `is_healthy()` is stricter: it also asks the
//! kernel whether the socket has a pending error or has seen EOF, so a dead
//! peer is detected even while the flag is still set. An idle socket (nothing
//! to read) is healthy.
//!
//! ## Fault handlers
//!
//! A single [`FaultHandler`] can be installed. It is invoked synchronously from
//! inside the failing operation and must only flip flags or schedule work;
//! installing a new handler replaces the old one.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meter_poller::transport::{RegisterTransport, TcpTransport, TcpTransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::new(TcpTransportConfig::new("192.168.1.50", 502));
//!     transport.connect().await?;
//!
//!     let words = transport.read_holding_registers(0x0000, 2).await?;
//!     println!("words: {:?}", words);
//!
//!     let stats = transport.get_stats();
//!     println!("requests sent: {}", stats.requests_sent);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;
use crate::protocol::{MbapHeader, ReadRequest, ReadResponse, UnitId};

/// Socket-level fault observed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// I/O error on the socket
    Error(String),
    /// A write or read did not complete within the response timeout
    Timeout,
    /// The peer closed the connection
    Closed,
    /// The byte stream no longer lines up with our requests
    Desync(String),
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::Error(message) => write!(f, "socket error: {}", message),
            TransportFault::Timeout => write!(f, "socket timeout"),
            TransportFault::Closed => write!(f, "socket closed"),
            TransportFault::Desync(message) => write!(f, "stream desynchronised: {}", message),
        }
    }
}

/// Callback invoked when the transport observes a fault
pub type FaultHandler = Arc<dyn Fn(TransportFault) + Send + Sync>;

/// Transport abstraction for register reads
///
/// All implementations must be `Send + Sync` so the connection manager can
/// hold them behind an async mutex shared with background reconnect tasks.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    /// Open a fresh connection, dropping any previous one
    async fn connect(&mut self) -> MeterResult<()>;

    /// Close the connection; closing a closed transport is a no-op
    async fn close(&mut self) -> MeterResult<()>;

    /// Read `quantity` holding registers starting at `address`
    ///
    /// # Errors
    ///
    /// - `MeterError::Connection` - no open connection
    /// - `MeterError::Timeout` - the meter did not answer in time
    /// - `MeterError::Exception` - the meter answered with an exception
    /// - `MeterError::Protocol` / `MeterError::Frame` - unusable response
    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> MeterResult<Vec<u16>>;

    /// Transport-level liveness flag
    fn is_connected(&self) -> bool;

    /// Stricter liveness probe; see the module docs
    fn is_healthy(&self) -> bool;

    /// Apply the protocol-level response timeout
    fn set_response_timeout(&mut self, timeout: Duration);

    /// Enable TCP keep-alive probing with the given idle time
    fn enable_keepalive(&mut self, idle: Duration) -> MeterResult<()>;

    /// Install (or with `None`, remove) the fault handler
    fn set_fault_handler(&mut self, handler: Option<FaultHandler>);

    /// Communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransportStats {
    pub connects: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Settings for [`TcpTransport`]
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: UnitId,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl TcpTransportConfig {
    /// Create a config with default unit id and timeouts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id: crate::DEFAULT_UNIT_ID,
            connect_timeout: Duration::from_millis(crate::DEFAULT_CONNECT_TIMEOUT_MS),
            response_timeout: Duration::from_millis(crate::DEFAULT_RESPONSE_TIMEOUT_MS),
        }
    }

    /// Set the unit id
    pub fn with_unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Modbus TCP transport
pub struct TcpTransport {
    config: TcpTransportConfig,
    stream: Option<TcpStream>,
    /// Cleared on any socket error, timeout or close
    alive: bool,
    /// Set while a request is on the wire; still set on entry means the
    /// previous request future was dropped half way
    in_flight: bool,
    transaction_id: u16,
    stats: TransportStats,
    fault_handler: Option<FaultHandler>,
    logger: CallbackLogger,
}

impl TcpTransport {
    /// Create a new, unconnected TCP transport
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            stream: None,
            alive: false,
            in_flight: false,
            transaction_id: 0,
            stats: TransportStats::default(),
            fault_handler: None,
            logger: CallbackLogger::disabled(),
        }
    }

    /// Create a transport that logs register traffic to the given sink
    pub fn with_logger(config: TcpTransportConfig, logger: CallbackLogger) -> Self {
        let mut transport = Self::new(config);
        transport.logger = logger;
        transport
    }

    /// Target as `host:port`
    pub fn target(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Current response timeout
    pub fn response_timeout(&self) -> Duration {
        self.config.response_timeout
    }

    /// Get next transaction ID
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Drop the stream, clear the liveness flag and notify the fault handler
    fn fail(&mut self, fault: TransportFault) {
        self.stream = None;
        self.alive = false;
        self.in_flight = false;
        self.stats.errors += 1;
        if fault == TransportFault::Timeout {
            self.stats.timeouts += 1;
        }

        warn!("[transport] {} on {}", fault, self.target());
        if let Some(handler) = &self.fault_handler {
            handler(fault);
        }
    }

    /// Write one request frame and read back one response frame
    async fn exchange(stream: &mut TcpStream, frame: &[u8], limit: Duration) -> Result<Vec<u8>, TransportFault> {
        match timeout(limit, stream.write_all(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(io_fault(e)),
            Err(_) => return Err(TransportFault::Timeout),
        }

        let mut header_buf = [0u8; MbapHeader::SIZE];
        match timeout(limit, stream.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(io_fault(e)),
            Err(_) => return Err(TransportFault::Timeout),
        }

        let header = MbapHeader::parse(&header_buf).map_err(|e| TransportFault::Desync(e.to_string()))?;

        let mut response = vec![0u8; header.frame_len()];
        response[..MbapHeader::SIZE].copy_from_slice(&header_buf);
        match timeout(limit, stream.read_exact(&mut response[MbapHeader::SIZE..])).await {
            Ok(Ok(_)) => Ok(response),
            Ok(Err(e)) => Err(io_fault(e)),
            Err(_) => Err(TransportFault::Timeout),
        }
    }
}

fn io_fault(error: std::io::Error) -> TransportFault {
    match error.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            TransportFault::Closed
        }
        _ => TransportFault::Error(error.to_string()),
    }
}

#[async_trait]
impl RegisterTransport for TcpTransport {
    async fn connect(&mut self) -> MeterResult<()> {
        self.stream = None;
        self.alive = false;
        self.in_flight = false;

        let target = self.target();
        let limit = self.config.connect_timeout;
        let stream = match timeout(limit, TcpStream::connect((self.config.host.as_str(), self.config.port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MeterError::connection(format!("Failed to connect to {}: {}", target, e)));
            }
            Err(_) => {
                return Err(MeterError::timeout(format!("connect to {}", target), limit.as_millis() as u64));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("[transport] Failed to set TCP_NODELAY on {}: {}", target, e);
        }

        self.stream = Some(stream);
        self.alive = true;
        self.stats.connects += 1;
        debug!("[transport] Connected to {}", target);
        Ok(())
    }

    async fn close(&mut self) -> MeterResult<()> {
        self.alive = false;
        self.in_flight = false;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("[transport] Closed connection to {}", self.target());
        }
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        let request = ReadRequest::new(self.config.unit_id, address, quantity);
        request.validate()?;

        if self.in_flight {
            self.fail(TransportFault::Desync("previous request abandoned mid-flight".to_string()));
            return Err(MeterError::protocol("Previous request was abandoned mid-flight"));
        }
        if self.stream.is_none() || !self.alive {
            return Err(MeterError::connection(format!("Not connected to {}", self.target())));
        }

        let transaction_id = self.next_transaction_id();
        let frame = request.encode(transaction_id);
        let limit = self.config.response_timeout;

        self.logger.log_read_request(transaction_id, &request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        self.in_flight = true;
        let exchanged = match self.stream.as_mut() {
            Some(stream) => Self::exchange(stream, &frame, limit).await,
            None => Err(TransportFault::Closed),
        };
        self.in_flight = false;

        let response_frame = match exchanged {
            Ok(response_frame) => response_frame,
            Err(fault) => {
                let error = match &fault {
                    TransportFault::Timeout => {
                        MeterError::timeout(format!("read {} registers at {}", quantity, address), limit.as_millis() as u64)
                    }
                    TransportFault::Closed => MeterError::connection("Connection closed by meter"),
                    TransportFault::Error(message) => MeterError::io(message.clone()),
                    TransportFault::Desync(message) => MeterError::frame(message.clone()),
                };
                self.fail(fault);
                return Err(error);
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_frame.len() as u64;

        let registers = ReadResponse::decode(&response_frame).and_then(|response| response.into_registers(transaction_id, &request));
        match registers {
            Ok(registers) => {
                self.logger.log_read_response(transaction_id, &request, &response_frame, &registers);
                Ok(registers)
            }
            Err(error @ MeterError::Exception { .. }) => {
                self.stats.errors += 1;
                Err(error)
            }
            Err(error) => {
                self.fail(TransportFault::Desync(error.to_string()));
                Err(error)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some() && self.alive
    }

    fn is_healthy(&self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        if !self.alive || self.in_flight {
            return false;
        }

        let socket = SockRef::from(stream);
        match socket.take_error() {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => return false,
        }

        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        match socket.peek(&mut probe) {
            // Peer sent FIN
            Ok(0) => false,
            // Unsolicited bytes would be read as the next response
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    fn set_response_timeout(&mut self, timeout: Duration) {
        self.config.response_timeout = timeout;
    }

    fn enable_keepalive(&mut self, idle: Duration) -> MeterResult<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(MeterError::connection("Cannot enable keep-alive without a connection"));
        };

        let keepalive = TcpKeepalive::new().with_time(idle);
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
        let keepalive = keepalive.with_interval(Duration::from_secs(crate::DEFAULT_KEEPALIVE_INTERVAL_SECS));

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        Ok(())
    }

    fn set_fault_handler(&mut self, handler: Option<FaultHandler>) {
        self.fault_handler = handler;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
