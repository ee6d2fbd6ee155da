/// Register descriptors, the register table and decoded readings
///
/// The table is built and validated once at startup; after that every read
/// cycle walks it in declared order and decodes words without re-checking
/// descriptor shape.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{MeterError, MeterResult};
use crate::protocol::data_utils;

/// Width of a register value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordType {
    /// One 16-bit word
    Uint16,
    /// Two 16-bit words, high word first
    Uint32,
}

impl WordType {
    /// Number of 16-bit words this type occupies
    pub fn word_count(self) -> u16 {
        match self {
            WordType::Uint16 => 1,
            WordType::Uint32 => 2,
        }
    }

    /// Decode the words returned for one register
    ///
    /// `uint32` combines `[hi, lo]` as `hi << 16 | lo`; `uint16` passes the
    /// single word through.
    pub fn decode(self, words: &[u16]) -> MeterResult<i64> {
        match self {
            WordType::Uint16 => match words {
                [word] => Ok(*word as i64),
                _ => Err(MeterError::invalid_data(format!("uint16 expects 1 word, got {}", words.len()))),
            },
            WordType::Uint32 => {
                if words.len() != 2 {
                    return Err(MeterError::invalid_data(format!("uint32 expects 2 words, got {}", words.len())));
                }
                Ok(data_utils::registers_to_u32(words)? as i64)
            }
        }
    }
}

/// Static description of one meter register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Unique id used by the host to map readings to capabilities
    pub id: String,
    /// Whether the host exposes this reading as an addressable capability
    #[serde(default = "default_true")]
    pub addressable: bool,
    pub display_name: String,
    pub start_address: u16,
    pub word_type: WordType,
    #[serde(default)]
    pub unit: String,
    /// Export-energy registers are skipped unless the config enables them
    #[serde(default)]
    pub export_energy: bool,
}

fn default_true() -> bool {
    true
}

impl RegisterDescriptor {
    /// Create an addressable descriptor
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        start_address: u16,
        word_type: WordType,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            addressable: true,
            display_name: display_name.into(),
            start_address,
            word_type,
            unit: unit.into(),
            export_energy: false,
        }
    }

    /// Mark as not addressable by the host
    pub fn internal(mut self) -> Self {
        self.addressable = false;
        self
    }

    /// Mark as an export-energy register
    pub fn export(mut self) -> Self {
        self.export_energy = true;
        self
    }

    /// Number of words to request
    pub fn word_count(&self) -> u16 {
        self.word_type.word_count()
    }

    /// Build the reading for this descriptor from raw words
    pub fn decode(&self, words: &[u16]) -> MeterResult<SensorReading> {
        Ok(SensorReading {
            id: self.id.clone(),
            addressable: self.addressable,
            display_name: self.display_name.clone(),
            value: self.word_type.decode(words)?,
            unit: self.unit.clone(),
            word_type: self.word_type,
        })
    }
}

/// One decoded register value from one read cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: String,
    pub addressable: bool,
    pub display_name: String,
    pub value: i64,
    pub unit: String,
    pub word_type: WordType,
}

/// Ordered, validated list of register descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterTable {
    descriptors: Vec<RegisterDescriptor>,
}

impl RegisterTable {
    /// Validate and build a table
    ///
    /// Fails on duplicate ids, empty ids, or a register whose words would run
    /// past address 65535.
    pub fn new(descriptors: Vec<RegisterDescriptor>) -> MeterResult<Self> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if descriptor.id.is_empty() {
                return Err(MeterError::configuration("Register id must not be empty"));
            }
            if !seen.insert(descriptor.id.as_str()) {
                return Err(MeterError::configuration(format!("Duplicate register id: {}", descriptor.id)));
            }
            if descriptor.start_address as u32 + descriptor.word_count() as u32 > 65536 {
                return Err(MeterError::invalid_address(descriptor.start_address, descriptor.word_count()));
            }
        }
        Ok(Self { descriptors })
    }

    /// Drop export-energy registers unless `include_export_energy` is set
    pub fn for_config(&self, include_export_energy: bool) -> Self {
        Self {
            descriptors: self
                .descriptors
                .iter()
                .filter(|descriptor| include_export_energy || !descriptor.export_energy)
                .cloned()
                .collect(),
        }
    }

    /// Representative three-phase meter map
    pub fn default_meter() -> Self {
        Self {
            descriptors: vec![
                RegisterDescriptor::new("voltage_l1", "Voltage L1", 0x0000, WordType::Uint16, "dV"),
                RegisterDescriptor::new("voltage_l2", "Voltage L2", 0x0001, WordType::Uint16, "dV"),
                RegisterDescriptor::new("voltage_l3", "Voltage L3", 0x0002, WordType::Uint16, "dV"),
                RegisterDescriptor::new("current_l1", "Current L1", 0x0003, WordType::Uint16, "cA"),
                RegisterDescriptor::new("current_l2", "Current L2", 0x0004, WordType::Uint16, "cA"),
                RegisterDescriptor::new("current_l3", "Current L3", 0x0005, WordType::Uint16, "cA"),
                RegisterDescriptor::new("active_power_import", "Active Power Import", 0x0010, WordType::Uint32, "W"),
                RegisterDescriptor::new("active_power_export", "Active Power Export", 0x0012, WordType::Uint32, "W").export(),
                RegisterDescriptor::new("energy_import_total", "Energy Import Total", 0x0020, WordType::Uint32, "Wh"),
                RegisterDescriptor::new("energy_export_total", "Energy Export Total", 0x0022, WordType::Uint32, "Wh").export(),
                RegisterDescriptor::new(
                    crate::DEFAULT_EVENT_TIMESTAMP_REGISTER,
                    "Disconnection Event Timestamp",
                    0x0040,
                    WordType::Uint32,
                    "s",
                )
                .internal(),
                RegisterDescriptor::new(
                    crate::DEFAULT_REMAINING_SECONDS_REGISTER,
                    "Disconnection Remaining Seconds",
                    0x0042,
                    WordType::Uint32,
                    "s",
                )
                .internal(),
            ],
        }
    }

    /// Descriptors in declared order
    pub fn descriptors(&self) -> &[RegisterDescriptor] {
        &self.descriptors
    }

    /// Look up a descriptor by id
    pub fn get(&self, id: &str) -> Option<&RegisterDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.id == id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegisterDescriptor> {
        self.descriptors.iter()
    }
}

impl<'de> Deserialize<'de> for RegisterTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let descriptors = Vec::<RegisterDescriptor>::deserialize(deserializer)?;
        RegisterTable::new(descriptors).map_err(serde::de::Error::custom)
    }
}

impl<'a> IntoIterator for &'a RegisterTable {
    type Item = &'a RegisterDescriptor;
    type IntoIter = std::slice::Iter<'a, RegisterDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}
