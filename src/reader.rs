/// Per-cycle register reads
///
/// One cycle reads every register in the table once, in declared order. A
/// register that errors or times out is skipped and logged; the cycle only
/// fails when it produced no readings at all.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionManager;
use crate::diagnostics::{AlertSeverity, DiagnosticsRecorder};
use crate::error::{MeterError, MeterResult};
use crate::logging::CallbackLogger;
use crate::register::{RegisterDescriptor, RegisterTable, SensorReading};
use crate::transport::RegisterTransport;
use crate::utils::OperationTimer;

const COMPONENT: &str = "reader";

/// Called when the failed-cycle streak reaches an alert threshold
pub type AlertCallback = Arc<dyn Fn(u32, AlertSeverity) + Send + Sync>;

/// Clears the in-progress flag however the cycle ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reads a [`RegisterTable`] over a [`ConnectionManager`]
pub struct ReadCycleExecutor<T: RegisterTransport + 'static> {
    connection: ConnectionManager<T>,
    diagnostics: DiagnosticsRecorder,
    logger: CallbackLogger,
    read_timeout: Duration,
    in_progress: AtomicBool,
    on_alert: Option<AlertCallback>,
}

impl<T: RegisterTransport + 'static> ReadCycleExecutor<T> {
    pub fn new(
        connection: ConnectionManager<T>,
        diagnostics: DiagnosticsRecorder,
        logger: CallbackLogger,
        read_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            diagnostics,
            logger,
            read_timeout,
            in_progress: AtomicBool::new(false),
            on_alert: None,
        }
    }

    /// Install the consecutive-failure alert callback
    pub fn with_alert_callback(mut self, callback: AlertCallback) -> Self {
        self.on_alert = Some(callback);
        self
    }

    /// Whether a cycle is currently running
    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run one cycle and return whatever readings it obtained
    ///
    /// Returns an empty list when another cycle is in progress, when the meter
    /// cannot be reached, or when every register failed.
    pub async fn run_cycle(&self, table: &RegisterTable) -> Vec<SensorReading> {
        self.try_run_cycle(table).await.unwrap_or_default()
    }

    /// Run one cycle, reporting why it produced nothing
    ///
    /// A rejected overlapping call returns an error without touching the
    /// transport or the diagnostics.
    pub async fn try_run_cycle(&self, table: &RegisterTable) -> MeterResult<Vec<SensorReading>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.logger.warn(COMPONENT, "Read cycle already in progress, skipping");
            return Err(MeterError::internal("Read cycle already in progress"));
        }
        let _guard = CycleGuard(&self.in_progress);
        let timer = OperationTimer::start("read cycle");

        if !self.connection.ensure_connected().await {
            let state = self.connection.state();
            let error = if self.connection.is_stopped() {
                MeterError::Stopped
            } else if state.exhausted {
                MeterError::reconnect_exhausted(state.reconnect_attempts)
            } else {
                MeterError::connection("Meter is not reachable")
            };
            self.fail_cycle(&error, timer.stop());
            return Err(error);
        }

        let mut readings = Vec::with_capacity(table.len());
        let mut last_error = None;
        for descriptor in table {
            if self.connection.is_stopped() {
                break;
            }
            match self.read_register(descriptor).await {
                Ok(reading) => readings.push(reading),
                Err(error) => {
                    let message = format!(
                        "Failed to read {} at 0x{:04X}: {}",
                        descriptor.id, descriptor.start_address, error
                    );
                    self.logger.warn(COMPONENT, &message);
                    self.diagnostics.record_register_failure(&message);
                    // Exception and decode errors leave the stream in sync
                    if !matches!(error, MeterError::Exception { .. } | MeterError::InvalidData { .. }) {
                        self.connection.mark_unhealthy(&message);
                    }
                    last_error = Some(error);
                }
            }
        }

        let duration = timer.stop();
        if readings.is_empty() {
            let error = match last_error {
                Some(error) => error,
                None if self.connection.is_stopped() => MeterError::Stopped,
                None => MeterError::configuration("Register table is empty"),
            };
            self.fail_cycle(&error, duration);
            return Err(error);
        }

        self.diagnostics.record_cycle_success(duration);
        self.logger.debug(
            COMPONENT,
            &format!("Read {}/{} registers in {:?}", readings.len(), table.len(), duration),
        );
        Ok(readings)
    }

    /// Read and decode one register, racing the read against the timeout
    async fn read_register(&self, descriptor: &RegisterDescriptor) -> MeterResult<SensorReading> {
        let read = self
            .connection
            .read_holding_registers(descriptor.start_address, descriptor.word_count());

        let words = match tokio::time::timeout(self.read_timeout, read).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(MeterError::timeout(
                    format!("read {}", descriptor.id),
                    self.read_timeout.as_millis() as u64,
                ))
            }
        };
        descriptor.decode(&words)
    }

    fn fail_cycle(&self, error: &MeterError, duration: Duration) {
        let (streak, alert) = self.diagnostics.record_cycle_failure(&error.to_string(), duration);
        self.logger.warn(
            COMPONENT,
            &format!("Read cycle failed ({} consecutive): {}", streak, error),
        );

        if let Some(severity) = alert {
            let message = format!("{} consecutive failed read cycles", streak);
            match severity {
                AlertSeverity::Warning => self.logger.warn(COMPONENT, &message),
                AlertSeverity::Critical => self.logger.error(COMPONENT, &message),
            }
            if let Some(callback) = &self.on_alert {
                callback(streak, severity);
            }
        }
    }
}
