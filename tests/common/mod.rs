//! Shared test fixtures: a sparse RAM bus over the full physical space
//! and mode setup helpers.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::HashMap;
use x86_core::bus::{AddressSpace, Bus};
use x86_core::regs::{gpr, seg};
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::Cpu;

pub struct RamBus {
    pub memory: HashMap<u64, u8>,
    pub ports: HashMap<u16, u8>,
    /// Every port write in order, for observing I/O side effects.
    pub port_log: Vec<(u16, u8)>,
}

impl RamBus {
    pub fn new() -> Self {
        Self {
            memory: HashMap::new(),
            ports: HashMap::new(),
            port_log: Vec::new(),
        }
    }

    pub fn load(&mut self, address: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, byte);
        }
    }

    pub fn read8(&self, address: u64) -> u8 {
        *self.memory.get(&address).unwrap_or(&0)
    }

    pub fn read16(&self, address: u64) -> u16 {
        u16::from(self.read8(address)) | (u16::from(self.read8(address + 1)) << 8)
    }

    pub fn read32(&self, address: u64) -> u32 {
        u32::from(self.read16(address)) | (u32::from(self.read16(address + 2)) << 16)
    }

    pub fn write16(&mut self, address: u64, value: u16) {
        self.load(address, &value.to_le_bytes());
    }

    pub fn write32(&mut self, address: u64, value: u32) {
        self.load(address, &value.to_le_bytes());
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
            self.port_log.push((port + i as u16, byte));
        }
    }
}

/// Real-mode CPU of the given family with flat zero segments, code loaded
/// at 0000:0100 and a stack at 0000:8000.
pub fn real_mode_cpu(family: CpuFamily, code: &[u8]) -> (Cpu, RamBus) {
    let mut cpu = Cpu::new(CpuTraits::new(family, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    for segment in [seg::CS, seg::DS, seg::ES, seg::SS] {
        cpu.segment_load_real_mode(segment, 0x0000);
    }
    cpu.set_xip(0x0100);
    cpu.register_set16(gpr::SP, 0x8000);
    bus.load(0x0100, code);
    (cpu, bus)
}

/// Build an 8-byte descriptor image.
pub fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> [u8; 8] {
    [
        limit as u8,
        (limit >> 8) as u8,
        base as u8,
        (base >> 8) as u8,
        (base >> 16) as u8,
        access,
        ((limit >> 16) as u8 & 0x0F) | (flags << 4),
        (base >> 24) as u8,
    ]
}

/// A 386 in protected mode with flat 4 GiB code/data/stack descriptors:
/// GDT at 0x10000 (1 = code, 2 = data), CS:EIP = 8:0x0100.
pub fn protected_mode_cpu(code: &[u8]) -> (Cpu, RamBus) {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    let mut bus = RamBus::new();

    let gdt = 0x10000u64;
    bus.load(gdt + 8, &descriptor(0, 0xFFFFF, 0x9A, 0xC)); // ring 0 code, 32-bit
    bus.load(gdt + 16, &descriptor(0, 0xFFFFF, 0x92, 0xC)); // ring 0 data

    cpu.sr[seg::GDTR].base = gdt;
    cpu.sr[seg::GDTR].limit = 0xFF;
    cpu.cr[0] |= 1;

    // load the descriptor caches directly the way a LOADALL-style setup
    // would
    for segment in [seg::CS, seg::DS, seg::ES, seg::SS] {
        cpu.sr[segment].selector = if segment == seg::CS { 0x08 } else { 0x10 };
        cpu.sr[segment].base = 0;
        cpu.sr[segment].limit = 0xFFFF_FFFF;
        cpu.sr[segment].access = if segment == seg::CS {
            0x9A00 | x86_core::regs::desc::D | x86_core::regs::desc::G
        } else {
            0x9200 | x86_core::regs::desc::D | x86_core::regs::desc::G
        };
    }
    cpu.set_cpl(0);
    cpu.set_xip(0x0100);
    cpu.register_set32(gpr::SP, 0x2_0000);
    bus.load(0x0100, code);
    (cpu, bus)
}
