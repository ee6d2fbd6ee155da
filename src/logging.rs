use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{ReadRequest, FUNCTION_READ_HOLDING_REGISTERS};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for register traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw frame bytes only
    Raw,
    /// Show interpreted request/response fields
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// One structured log entry handed to the sink
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Engine component that produced the record (`connection`, `reader`, ...)
    pub component: &'static str,
    pub message: String,
}

/// Type alias for log callback functions
pub type LogCallback = Box<dyn Fn(&LogRecord) + Send + Sync>;

/// Structured log sink
///
/// Every message is emitted through `tracing` and, when a callback is
/// installed and the level passes the filter, also handed to the callback as a
/// [`LogRecord`]. Cloning shares the callback.
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|record| {
            let timestamp = record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
            match record.level {
                LogLevel::Error | LogLevel::Warn => eprintln!(
                    "[{}] {} [{}] {}",
                    timestamp,
                    record.level.as_str(),
                    record.component,
                    record.message
                ),
                LogLevel::Info | LogLevel::Debug => println!(
                    "[{}] {} [{}] {}",
                    timestamp,
                    record.level.as_str(),
                    record.component,
                    record.message
                ),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger without a sink (tracing output only)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, component: &'static str, message: &str) {
        match level {
            LogLevel::Error => tracing::error!("[{}] {}", component, message),
            LogLevel::Warn => tracing::warn!("[{}] {}", component, message),
            LogLevel::Info => tracing::info!("[{}] {}", component, message),
            LogLevel::Debug => tracing::debug!("[{}] {}", component, message),
        }

        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(&LogRecord {
                    timestamp: Utc::now(),
                    level,
                    component,
                    message: message.to_string(),
                });
            }
        }
    }

    /// Log an error message
    pub fn error(&self, component: &'static str, message: &str) {
        self.log(LogLevel::Error, component, message);
    }

    /// Log a warning message
    pub fn warn(&self, component: &'static str, message: &str) {
        self.log(LogLevel::Warn, component, message);
    }

    /// Log an info message
    pub fn info(&self, component: &'static str, message: &str) {
        self.log(LogLevel::Info, component, message);
    }

    /// Log a debug message
    pub fn debug(&self, component: &'static str, message: &str) {
        self.log(LogLevel::Debug, component, message);
    }

    /// Check if a message at the given level reaches the callback
    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log an outgoing register read
    pub fn log_read_request(&self, transaction_id: u16, request: &ReadRequest) {
        match self.mode {
            LoggingMode::Raw => {
                let raw = hex::encode_upper(request.encode(transaction_id));
                self.debug("transport", &format!("Read request -> Raw: {}", raw));
            }
            LoggingMode::Interpreted => {
                self.debug("transport", &Self::interpret_request(transaction_id, request));
            }
            LoggingMode::Both => {
                self.debug("transport", &Self::interpret_request(transaction_id, request));
                let raw = hex::encode_upper(request.encode(transaction_id));
                self.debug("transport", &format!("Read request -> Raw: {}", raw));
            }
        }
    }

    /// Log the words returned for a register read
    pub fn log_read_response(&self, transaction_id: u16, request: &ReadRequest, frame: &[u8], registers: &[u16]) {
        match self.mode {
            LoggingMode::Raw => {
                self.debug("transport", &format!("Read response <- Raw: {}", hex::encode_upper(frame)));
            }
            LoggingMode::Interpreted => {
                self.debug("transport", &Self::interpret_response(transaction_id, request, registers));
            }
            LoggingMode::Both => {
                self.debug("transport", &Self::interpret_response(transaction_id, request, registers));
                self.debug("transport", &format!("Read response <- Raw: {}", hex::encode_upper(frame)));
            }
        }
    }

    fn interpret_request(transaction_id: u16, request: &ReadRequest) -> String {
        format!(
            "Read request -> TID: {}, Unit: {}, Function: Read Holding Registers (0x{:02X}), Address: {}, Quantity: {}",
            transaction_id, request.unit_id, FUNCTION_READ_HOLDING_REGISTERS, request.address, request.quantity
        )
    }

    fn interpret_response(transaction_id: u16, request: &ReadRequest, registers: &[u16]) -> String {
        format!(
            "Read response <- TID: {}, Unit: {}, Address: {}, Registers: {:?}",
            transaction_id, request.unit_id, request.address, registers
        )
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("has_callback", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}
