/// Holding register storage for the meter simulator
///
/// This module provides thread-safe storage for the simulator's holding
/// registers plus per-address fault injection, so tests can make individual
/// registers stall or answer with an exception.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use crate::error::{MeterError, MeterResult};
use crate::register::{RegisterTable, WordType};

/// Fault the simulator injects when a read touches an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFault {
    /// Answer normally, but only after the delay
    Delay(Duration),
    /// Answer with a Modbus exception code
    Exception(u8),
    /// Never answer; the connection stays open
    Silent,
}

/// Holding register bank
///
/// Cloning shares the underlying storage. All addressing is 0-based.
#[derive(Debug, Clone, Default)]
pub struct MeterRegisterBank {
    /// Holding registers (read/write) - 16 bits each
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
    /// Injected faults by address
    faults: Arc<RwLock<HashMap<u16, RegisterFault>>>,
}

impl MeterRegisterBank {
    /// Create a new register bank with empty data
    pub fn new() -> Self {
        Self::default()
    }

    /// Bank pre-loaded with plausible values for every register in `table`
    ///
    /// Alarm registers are seeded with the "no alarm" pattern.
    pub fn for_table(table: &RegisterTable) -> MeterResult<Self> {
        let bank = Self::new();
        for (index, descriptor) in table.iter().enumerate() {
            let alarm = descriptor.id == crate::DEFAULT_EVENT_TIMESTAMP_REGISTER
                || descriptor.id == crate::DEFAULT_REMAINING_SECONDS_REGISTER;
            match (descriptor.word_type, alarm) {
                (WordType::Uint16, _) => bank.set_u16(descriptor.start_address, 2300 + index as u16)?,
                (WordType::Uint32, true) => bank.set_u32(descriptor.start_address, u32::MAX)?,
                (WordType::Uint32, false) => bank.set_u32(descriptor.start_address, 100_000 + index as u32 * 1000)?,
            }
        }
        Ok(bank)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> MeterResult<Vec<u16>> {
        let registers = self.holding_registers.read().map_err(|_| MeterError::internal("Failed to lock holding registers"))?;
        let mut result = Vec::with_capacity(quantity as usize);

        for i in 0..quantity {
            let addr = address.wrapping_add(i);
            result.push(registers.get(&addr).copied().unwrap_or(0));
        }

        Ok(result)
    }

    /// Write a single register
    pub fn set_u16(&self, address: u16, value: u16) -> MeterResult<()> {
        let mut registers = self.holding_registers.write().map_err(|_| MeterError::internal("Failed to lock holding registers"))?;
        registers.insert(address, value);
        Ok(())
    }

    /// Write a 32-bit value as two registers, high word first
    pub fn set_u32(&self, address: u16, value: u32) -> MeterResult<()> {
        if address == u16::MAX {
            return Err(MeterError::invalid_address(address, 2));
        }
        let mut registers = self.holding_registers.write().map_err(|_| MeterError::internal("Failed to lock holding registers"))?;
        registers.insert(address, (value >> 16) as u16);
        registers.insert(address + 1, value as u16);
        Ok(())
    }

    /// Make reads that touch `address` misbehave
    pub fn inject_fault(&self, address: u16, fault: RegisterFault) -> MeterResult<()> {
        let mut faults = self.faults.write().map_err(|_| MeterError::internal("Failed to lock faults"))?;
        faults.insert(address, fault);
        Ok(())
    }

    pub fn clear_fault(&self, address: u16) -> MeterResult<()> {
        let mut faults = self.faults.write().map_err(|_| MeterError::internal("Failed to lock faults"))?;
        faults.remove(&address);
        Ok(())
    }

    /// First injected fault inside `address..address + quantity`
    pub fn fault_for(&self, address: u16, quantity: u16) -> Option<RegisterFault> {
        let faults = self.faults.read().ok()?;
        (0..quantity).find_map(|i| faults.get(&address.wrapping_add(i)).copied())
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> RegisterBankStats {
        let registers = self.holding_registers.read().map(|r| r.len()).unwrap_or(0);
        let faults = self.faults.read().map(|f| f.len()).unwrap_or(0);

        RegisterBankStats {
            holding_registers_count: registers,
            injected_faults_count: faults,
        }
    }
}

/// Register bank statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBankStats {
    pub holding_registers_count: usize,
    pub injected_faults_count: usize,
}
