//! Stepper unit tests
//!
//! Organized into:
//! - instructions.rs: individual instructions and instruction families
//! - modes.rs: reset state, mode predicates, flag image behaviour
//!
//! Tests drive the stepper over a sparse RAM bus so any physical address
//! the reset vectors land on is writable.

use super::*;
use crate::bus::{AddressSpace, Bus};
use crate::traits::{CpuFamily, CpuSubtype, CpuTraits};
use std::collections::HashMap;

mod instructions;
mod modes;

// ========== Test Helpers ==========

/// Sparse RAM covering the full physical space.
pub struct RamBus {
    pub memory: HashMap<u64, u8>,
    pub ports: HashMap<u16, u8>,
}

impl RamBus {
    pub fn new() -> Self {
        Self {
            memory: HashMap::new(),
            ports: HashMap::new(),
        }
    }

    pub fn load(&mut self, address: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, byte);
        }
    }

    pub fn read_u16(&self, address: u64) -> u16 {
        u16::from(*self.memory.get(&address).unwrap_or(&0))
            | (u16::from(*self.memory.get(&(address + 1)).unwrap_or(&0)) << 8)
    }
}

impl Bus for RamBus {
    fn memory_read(&mut self, _space: AddressSpace, address: u64, buffer: &mut [u8]) {
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = *self.memory.get(&(address + i as u64)).unwrap_or(&0);
        }
    }

    fn memory_write(&mut self, _space: AddressSpace, address: u64, buffer: &[u8]) {
        for (i, &byte) in buffer.iter().enumerate() {
            self.memory.insert(address + i as u64, byte);
        }
    }

    fn port_read(&mut self, port: u16, buffer: &mut [u8]) {
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = *self.ports.get(&(port + i as u16)).unwrap_or(&0xFF);
        }
    }

    fn port_write(&mut self, port: u16, buffer: &[u8]) {
        for (i, &byte) in buffer.iter().enumerate() {
            self.ports.insert(port + i as u16, byte);
        }
    }
}

/// A real-mode 8086 with code loaded at 0000:0100.
pub fn setup_8086(code: &[u8]) -> (Cpu, RamBus) {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(crate::regs::seg::CS, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::DS, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::ES, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::SS, 0x0000);
    cpu.set_xip(0x0100);
    cpu.register_set16(crate::regs::gpr::SP, 0x8000);
    bus.load(0x0100, code);
    (cpu, bus)
}

/// Same setup on a 386 so 32-bit prefixes and the 0F map decode.
pub fn setup_386(code: &[u8]) -> (Cpu, RamBus) {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(crate::regs::seg::CS, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::DS, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::ES, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::SS, 0x0000);
    cpu.set_xip(0x0100);
    cpu.register_set16(crate::regs::gpr::SP, 0x8000);
    bus.load(0x0100, code);
    (cpu, bus)
}
