//! Per-meter polling configuration
//!
//! One [`PollingConfig`] value describes one meter. It is handed to the
//! service at construction and never shared between instances. It can be
//! built in code with the `with_*` methods or loaded from YAML or JSON:
//!
//! ```yaml
//! host: 192.168.1.40
//! port: 502
//! poll_interval_ms: 15000
//! include_export_energy: true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ReconnectPolicy;
use crate::error::{MeterError, MeterResult};
use crate::register::RegisterTable;
use crate::transport::TcpTransportConfig;
use crate::utils::validation;

/// Polling configuration for one meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Meter host name or IP address
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Read the export-energy registers as well
    #[serde(default)]
    pub include_export_energy: bool,
    /// Protocol-level timeout for one request/response exchange
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Upper bound for one register read, including lock wait
    #[serde(default = "default_register_read_timeout_ms")]
    pub register_read_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,
    /// Register id holding the disconnection event timestamp
    #[serde(default = "default_event_timestamp_register")]
    pub event_timestamp_register: String,
    /// Register id holding the device's remaining seconds
    #[serde(default = "default_remaining_seconds_register")]
    pub remaining_seconds_register: String,
    /// Register map; the built-in three-phase map when absent
    #[serde(default)]
    pub registers: Option<RegisterTable>,
}

// Default value functions
fn default_port() -> u16 {
    crate::DEFAULT_TCP_PORT
}

fn default_unit_id() -> u8 {
    crate::DEFAULT_UNIT_ID
}

fn default_poll_interval_ms() -> u64 {
    crate::DEFAULT_POLL_INTERVAL_SECS * 1000
}

fn default_response_timeout_ms() -> u64 {
    crate::DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_register_read_timeout_ms() -> u64 {
    crate::DEFAULT_REGISTER_READ_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    crate::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_reconnect_delay_ms() -> u64 {
    crate::DEFAULT_RECONNECT_DELAY_MS
}

fn default_max_reconnect_attempts() -> u32 {
    crate::DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_keepalive_idle_secs() -> u64 {
    crate::DEFAULT_KEEPALIVE_IDLE_SECS
}

fn default_event_timestamp_register() -> String {
    crate::DEFAULT_EVENT_TIMESTAMP_REGISTER.to_string()
}

fn default_remaining_seconds_register() -> String {
    crate::DEFAULT_REMAINING_SECONDS_REGISTER.to_string()
}

impl PollingConfig {
    /// Configuration with every default and the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            unit_id: default_unit_id(),
            poll_interval_ms: default_poll_interval_ms(),
            include_export_energy: false,
            response_timeout_ms: default_response_timeout_ms(),
            register_read_timeout_ms: default_register_read_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            keepalive_idle_secs: default_keepalive_idle_secs(),
            event_timestamp_register: default_event_timestamp_register(),
            remaining_seconds_register: default_remaining_seconds_register(),
            registers: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_export_energy(mut self, include: bool) -> Self {
        self.include_export_energy = include;
        self
    }

    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_registers(mut self, registers: RegisterTable) -> Self {
        self.registers = Some(registers);
        self
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> MeterResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> MeterResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> MeterResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MeterError::configuration(format!("Failed to read {}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(MeterError::configuration(format!(
                "Unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Reject values that can never work
    pub fn validate(&self) -> MeterResult<()> {
        if self.host.trim().is_empty() {
            return Err(MeterError::configuration("Meter host is required"));
        }
        if self.port == 0 {
            return Err(MeterError::configuration("Port must not be 0"));
        }
        validation::validate_unit_id(self.unit_id)?;
        if self.poll_interval_ms == 0 {
            return Err(MeterError::invalid_interval(0));
        }
        validation::validate_positive_millis("response_timeout_ms", self.response_timeout_ms)?;
        validation::validate_positive_millis("register_read_timeout_ms", self.register_read_timeout_ms)?;
        validation::validate_positive_millis("connect_timeout_ms", self.connect_timeout_ms)?;
        if self.event_timestamp_register == self.remaining_seconds_register {
            return Err(MeterError::configuration("Alarm register ids must differ"));
        }
        if let Some(registers) = &self.registers {
            for descriptor in registers {
                validation::validate_address_range(descriptor.start_address, descriptor.word_count())?;
            }
        }

        let table = self.register_table();
        for id in [&self.event_timestamp_register, &self.remaining_seconds_register] {
            if table.get(id).is_none() {
                return Err(MeterError::configuration(format!(
                    "Alarm register '{}' is not in the polled register table",
                    id
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn register_read_timeout(&self) -> Duration {
        Duration::from_millis(self.register_read_timeout_ms)
    }

    /// `host:port`
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transport_config(&self) -> TcpTransportConfig {
        TcpTransportConfig::new(self.host.clone(), self.port)
            .with_unit_id(self.unit_id)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            keepalive_idle: Duration::from_secs(self.keepalive_idle_secs),
        }
    }

    /// The register table to poll, with export registers filtered out
    /// unless enabled
    pub fn register_table(&self) -> RegisterTable {
        match &self.registers {
            Some(registers) => registers.for_config(self.include_export_energy),
            None => RegisterTable::default_meter().for_config(self.include_export_energy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RegisterDescriptor, WordType};

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config = PollingConfig::from_yaml_str("host: 10.0.0.7\n").unwrap();
        assert_eq!(config, PollingConfig::new("10.0.0.7"));
        assert_eq!(config.port, 502);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.reconnect_policy().max_attempts, 10);
        assert_eq!(config.reconnect_policy().delay, Duration::from_secs(5));
        assert!(config.response_timeout_ms < config.register_read_timeout_ms);
    }

    #[test]
    fn test_json_overrides() {
        let json = r#"{"host": "meter.local", "port": 1502, "poll_interval_ms": 10000, "include_export_energy": true}"#;
        let config = PollingConfig::from_json_str(json).unwrap();
        assert_eq!(config.target(), "meter.local:1502");
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.register_table().len(), RegisterTable::default_meter().len());
    }

    #[test]
    fn test_export_registers_filtered_by_default() {
        let config = PollingConfig::new("meter.local");
        let table = config.register_table();
        assert!(table.iter().all(|descriptor| !descriptor.export_energy));
        assert!(table.get(&config.event_timestamp_register).is_some());
    }

    #[test]
    fn test_invalid_configs_fail_fast() {
        assert!(matches!(
            PollingConfig::from_yaml_str("port: 502\n"),
            Err(MeterError::Configuration { .. })
        ));
        assert!(matches!(
            PollingConfig::new("  ").validate(),
            Err(MeterError::Configuration { .. })
        ));
        assert!(matches!(
            PollingConfig::new("meter").with_poll_interval(Duration::ZERO).validate(),
            Err(MeterError::InvalidInterval { .. })
        ));
        assert!(PollingConfig::new("meter").with_unit_id(0).validate().is_err());
    }

    #[test]
    fn test_alarm_registers_must_be_polled() {
        let typo = "host: meter.local\nevent_timestamp_register: disconnect_event_timstamp\n";
        let err = PollingConfig::from_yaml_str(typo).unwrap_err();
        assert!(matches!(err, MeterError::Configuration { ref message } if message.contains("disconnect_event_timstamp")));

        let without_alarms = RegisterTable::new(vec![RegisterDescriptor::new(
            "power",
            "Power",
            0x10,
            WordType::Uint32,
            "W",
        )])
        .unwrap();
        let config = PollingConfig::new("meter.local").with_registers(without_alarms);
        assert!(matches!(config.validate(), Err(MeterError::Configuration { .. })));

        let alarms_only = RegisterTable::new(vec![
            RegisterDescriptor::new("ts", "Event", 0x40, WordType::Uint32, "s").internal(),
            RegisterDescriptor::new("left", "Remaining", 0x42, WordType::Uint32, "s").internal(),
        ])
        .unwrap();
        let mut config = PollingConfig::new("meter.local").with_registers(alarms_only);
        config.event_timestamp_register = "ts".into();
        config.remaining_seconds_register = "left".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sub_second_poll_interval_is_kept() {
        let config = PollingConfig::new("meter.local").with_poll_interval(Duration::from_millis(1500));
        assert_eq!(config.poll_interval(), Duration::from_millis(1500));
        assert!(config.validate().is_ok());

        let config = PollingConfig::new("meter.local").with_poll_interval(Duration::from_millis(500));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let path = std::env::temp_dir().join("meter_poller_config_test.toml");
        std::fs::write(&path, "host = 'x'").unwrap();
        assert!(PollingConfig::from_file(&path).is_err());
        let _ = std::fs::remove_file(path);
    }
}
