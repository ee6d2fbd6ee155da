/// Utility functions and helpers
///
/// This module contains validation helpers shared by the config layer,
/// formatting helpers for logs and the command-line tools, and the operation
/// timer used to measure read cycles.

use std::time::{Duration, Instant};
use log::{debug, info, warn};
use crate::error::{MeterError, MeterResult};

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Time elapsed so far, without stopping
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            info!("Operation '{}' succeeded in {}", self.operation_name, format::format_duration(duration));
        } else {
            warn!("Operation '{}' failed after {}", self.operation_name, format::format_duration(duration));
        }
        duration
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate unit ID (1-247)
    pub fn validate_unit_id(unit_id: u8) -> MeterResult<()> {
        if unit_id == 0 || unit_id > 247 {
            return Err(MeterError::configuration(
                format!("Invalid unit ID: {} (must be 1-247)", unit_id)
            ));
        }
        Ok(())
    }

    /// Validate address range
    pub fn validate_address_range(start: u16, count: u16) -> MeterResult<()> {
        if count == 0 {
            return Err(MeterError::invalid_address(start, count));
        }

        if (start as u32 + count as u32) > 65536 {
            return Err(MeterError::invalid_address(start, count));
        }

        Ok(())
    }

    /// Validate a millisecond setting that must be strictly positive
    pub fn validate_positive_millis(name: &str, value: u64) -> MeterResult<()> {
        if value == 0 {
            return Err(MeterError::configuration(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;
    use crate::register::SensorReading;

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers.iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format a countdown in seconds as `HH:MM:SS`
    pub fn format_countdown(seconds: i64) -> String {
        let seconds = seconds.max(0);
        format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    }

    /// Format one cycle's readings as a table
    pub fn format_readings(readings: &[SensorReading]) -> String {
        let mut lines = Vec::with_capacity(readings.len());
        for (index, reading) in readings.iter().enumerate() {
            let branch = if index + 1 == readings.len() { "└─" } else { "├─" };
            lines.push(format!(
                "{} {}: {} {}",
                branch,
                reading.display_name,
                reading.value,
                reading.unit
            ).trim_end().to_string());
        }
        lines.join("\n")
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RegisterDescriptor, WordType};

    #[test]
    fn test_validation() {
        assert!(validation::validate_unit_id(1).is_ok());
        assert!(validation::validate_unit_id(247).is_ok());
        assert!(validation::validate_unit_id(0).is_err());
        assert!(validation::validate_unit_id(248).is_err());

        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 5).is_ok());
        assert!(validation::validate_address_range(65530, 10).is_err());

        assert!(validation::validate_positive_millis("poll interval", 0).is_err());
    }

    #[test]
    fn test_formatting() {
        let registers = vec![0x1234, 0x5678];
        assert_eq!(format::registers_to_hex(&registers), "1234 5678");

        let duration = Duration::from_millis(1500);
        assert_eq!(format::format_duration(duration), "1.50s");
        assert_eq!(format::format_countdown(3725), "01:02:05");
        assert_eq!(format::format_countdown(-4), "00:00:00");
    }

    #[test]
    fn test_format_readings() {
        let voltage = RegisterDescriptor::new("v", "Voltage", 0, WordType::Uint16, "dV")
            .decode(&[2301])
            .unwrap();
        let count = RegisterDescriptor::new("c", "Count", 1, WordType::Uint16, "")
            .decode(&[7])
            .unwrap();

        assert_eq!(format::format_readings(&[voltage, count]), "├─ Voltage: 2301 dV\n└─ Count: 7");
    }

    #[test]
    fn test_timer() {
        logging::init_test_logger();
        let timer = OperationTimer::start("noop");
        assert!(timer.stop_and_log(true) < Duration::from_secs(1));
    }
}
