//! # Meter Poller - Resilient Modbus TCP Energy Meter Polling
//!
//! Polls one energy meter over Modbus TCP on a fixed schedule, rides out
//! network and device faults without operator intervention, and turns the
//! meter's coarse disconnection-alarm registers into a smooth countdown.
//!
//! ## Features
//!
//! - **Fixed-interval scheduling** with overlap protection and a stuck-task
//!   circuit breaker
//! - **Lazy reconnects** with a strict liveness check, deduplicated retries and
//!   a hard attempt cap
//! - **Per-register isolation**: one slow or failing register never aborts a
//!   cycle
//! - **Disconnection countdown** extrapolated from wall-clock time between
//!   device updates
//! - **Typed events** through a callback or a channel, and side-effect-free
//!   diagnostics snapshots
//! - **Meter simulator** with fault injection for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meter_poller::{PollEvent, PollingConfig, PollingService, MeterResult};
//!
//! #[tokio::main]
//! async fn main() -> MeterResult<()> {
//!     let config = PollingConfig::new("192.168.1.40").with_export_energy(true);
//!
//!     let service = PollingService::new(config, Arc::new(|event| match event {
//!         PollEvent::CycleCompleted(readings) => println!("{} readings", readings.len()),
//!         PollEvent::FirstDisconnectionWarning { seconds_remaining } => {
//!             println!("Power will be cut in {}s", seconds_remaining)
//!         }
//!         PollEvent::ReconnectExhausted { .. } => println!("Meter unavailable"),
//!         _ => {}
//!     }))?;
//!
//!     service.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     service.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ PollingService  │──► PollEvent callback / channel
//! └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │    Scheduler    │───►│ ReadCycleExec.  │──► DisconnectionCountdown
//! └─────────────────┘    └─────────────────┘
//!                                 │
//!                        ┌─────────────────┐
//!                        │ ConnectionMgr   │──► Diagnostics
//!                        └─────────────────┘
//!                                 │
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │  TcpTransport   │◄──►│ MeterSimulator  │
//!                        │  (Async I/O)    │    │ (Register Bank) │
//!                        └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus TCP framing for holding-register reads
pub mod protocol;

/// Network transport layer
pub mod transport;

/// Register descriptors, tables and decoded readings
pub mod register;

/// Engine counters and failure alerts
pub mod diagnostics;

/// Lazy connect, health check and capped reconnects
pub mod connection;

/// Per-cycle register reads
pub mod reader;

/// Disconnection countdown state machine
pub mod countdown;

/// Fixed-interval scheduler
pub mod scheduler;

/// Composition root for one meter
pub mod service;

/// Per-meter configuration
pub mod config;

/// Thread-safe register storage for the simulator
pub mod register_bank;

/// Modbus TCP meter simulator
pub mod simulator;

/// Utility functions
pub mod utils;

/// Logging system for the library
pub mod logging;

// Re-export main types for convenience
pub use error::{MeterError, MeterResult};
pub use protocol::{ReadRequest, ReadResponse, ModbusException};
pub use transport::{RegisterTransport, TcpTransport, TcpTransportConfig, TransportStats, TransportFault};
pub use register::{RegisterDescriptor, RegisterTable, SensorReading, WordType};
pub use diagnostics::{AlertSeverity, Diagnostics};
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use reader::ReadCycleExecutor;
pub use countdown::{CountdownEvent, CountdownState, DisconnectionCountdown};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use service::{EventCallback, PollEvent, PollingService};
pub use config::PollingConfig;
pub use register_bank::{MeterRegisterBank, RegisterBankStats, RegisterFault};
pub use simulator::{MeterSimulator, SimulatorConfig, SimulatorStats};
pub use utils::OperationTimer;
pub use logging::{LogLevel, LogCallback, LogRecord, CallbackLogger, LoggingMode};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default Modbus unit id
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Default polling interval (30 seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Protocol-level response timeout, kept below the register read timeout
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2500;

/// Upper bound for one register read
pub const DEFAULT_REGISTER_READ_TIMEOUT_MS: u64 = 3000;

/// Default connect timeout (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Flat delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Reconnect attempts before the instance gives up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// TCP keep-alive idle time
pub const DEFAULT_KEEPALIVE_IDLE_SECS: u64 = 10;

/// TCP keep-alive probe interval
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// Register id of the disconnection event timestamp
pub const DEFAULT_EVENT_TIMESTAMP_REGISTER: &str = "disconnect_event_timestamp";

/// Register id of the device's remaining seconds before disconnection
pub const DEFAULT_REMAINING_SECONDS_REGISTER: &str = "disconnect_remaining_seconds";

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Meter Poller v{} - resilient Modbus TCP energy meter polling", VERSION)
}
