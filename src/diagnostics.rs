/// Engine diagnostics
///
/// Counters only ever grow, except the consecutive-failure streak which a
/// successful cycle or a successful connect resets. The recorder is shared by
/// the connection manager and the read cycle executor; the host only ever sees
/// [`Diagnostics`] snapshots.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Consecutive failed cycles that raise a warning alert
pub const FAILURE_ALERT_WARNING: u32 = 5;

/// Consecutive failed cycles that raise a critical alert
pub const FAILURE_ALERT_CRITICAL: u32 = 20;

/// Severity of a consecutive-failure alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub cycles_run: u64,
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub register_read_failures: u64,
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub socket_resets: u64,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
}

impl Diagnostics {
    /// Share of cycles that produced at least one reading, in percent
    pub fn success_rate(&self) -> f64 {
        if self.cycles_run == 0 {
            return 0.0;
        }
        (self.cycles_succeeded as f64 / self.cycles_run as f64) * 100.0
    }
}

/// Shared, clonable handle to the live counters
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsRecorder {
    inner: Arc<Mutex<Diagnostics>>,
}

impl DiagnosticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    // Counters stay meaningful after a panic elsewhere, so poisoning is ignored
    fn lock(&self) -> MutexGuard<'_, Diagnostics> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current counters; no side effects
    pub fn snapshot(&self) -> Diagnostics {
        self.lock().clone()
    }

    /// A cycle produced at least one reading
    pub fn record_cycle_success(&self, duration: Duration) {
        let mut diagnostics = self.lock();
        diagnostics.cycles_run += 1;
        diagnostics.cycles_succeeded += 1;
        diagnostics.consecutive_failures = 0;
        diagnostics.last_success_at = Some(Utc::now());
        diagnostics.last_cycle_duration_ms = Some(duration.as_millis() as u64);
    }

    /// A cycle produced no readings
    ///
    /// Returns the new streak length and, when the streak just reached one of
    /// the alert thresholds, the alert severity.
    pub fn record_cycle_failure(&self, error: &str, duration: Duration) -> (u32, Option<AlertSeverity>) {
        let mut diagnostics = self.lock();
        diagnostics.cycles_run += 1;
        diagnostics.cycles_failed += 1;
        diagnostics.consecutive_failures += 1;
        diagnostics.last_error = Some(error.to_string());
        diagnostics.last_failure_at = Some(Utc::now());
        diagnostics.last_cycle_duration_ms = Some(duration.as_millis() as u64);

        let streak = diagnostics.consecutive_failures;
        let alert = match streak {
            FAILURE_ALERT_WARNING => Some(AlertSeverity::Warning),
            FAILURE_ALERT_CRITICAL => Some(AlertSeverity::Critical),
            _ => None,
        };
        (streak, alert)
    }

    pub fn record_register_failure(&self, error: &str) {
        let mut diagnostics = self.lock();
        diagnostics.register_read_failures += 1;
        diagnostics.last_error = Some(error.to_string());
    }

    pub fn record_connect_attempt(&self) {
        self.lock().connect_attempts += 1;
    }

    /// A connect succeeded; the failure streak starts over
    pub fn record_connect_success(&self) {
        let mut diagnostics = self.lock();
        diagnostics.successful_connects += 1;
        diagnostics.consecutive_failures = 0;
    }

    pub fn record_connect_failure(&self, error: &str) {
        self.lock().last_error = Some(error.to_string());
    }

    pub fn record_socket_reset(&self) {
        self.lock().socket_resets += 1;
    }
}
