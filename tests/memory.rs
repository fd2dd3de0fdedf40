//! Memory substrate: segment wrap on the 8086 generation, access round
//! trips, limit checks and the on-chip port windows.

mod common;

use common::{real_mode_cpu, RamBus};
use x86_core::regs::{gpr, seg};
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::{Cpu, StepResult};

#[test]
fn test_8086_segment_wrap() {
    // DS:SI = FFFF:0010 reads physical 0x00000000, not 0x00100000
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I8086, &[0xAC]); // lodsb
    cpu.segment_load_real_mode(seg::DS, 0xFFFF);
    cpu.register_set16(gpr::SI, 0x0010);
    bus.load(0x0000_0000, &[0x5A]);
    bus.load(0x0010_0000, &[0xA5]);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x5A);
}

#[test]
fn test_8086_offset_wrap_inside_segment() {
    // a word read at offset 0xFFFF wraps to offset 0 of the same segment
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::DS, 0x1000);
    bus.load(0x1FFFF, &[0x34]);
    bus.load(0x10000, &[0x12]);
    let value = cpu.segmented_read16(&mut bus, seg::DS, 0xFFFF).unwrap();
    assert_eq!(value, 0x1234);
}

#[test]
fn test_286_no_wrap_checks_limit() {
    // the 286 faults instead of wrapping
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I286, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::DS, 0x1000);
    assert!(cpu.segmented_read16(&mut bus, seg::DS, 0xFFFF).is_err());
}

#[test]
fn test_read_write_round_trips() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::DS, 0x0000);

    cpu.segmented_write8(&mut bus, seg::DS, 0x100, 0xAB).unwrap();
    assert_eq!(cpu.segmented_read8(&mut bus, seg::DS, 0x100).unwrap(), 0xAB);

    cpu.segmented_write16(&mut bus, seg::DS, 0x200, 0xBEEF).unwrap();
    assert_eq!(cpu.segmented_read16(&mut bus, seg::DS, 0x200).unwrap(), 0xBEEF);

    cpu.segmented_write32(&mut bus, seg::DS, 0x300, 0xDEAD_BEEF).unwrap();
    assert_eq!(cpu.segmented_read32(&mut bus, seg::DS, 0x300).unwrap(), 0xDEAD_BEEF);

    cpu.segmented_write64(&mut bus, seg::DS, 0x400, 0x0123_4567_89AB_CDEF).unwrap();
    assert_eq!(
        cpu.segmented_read64(&mut bus, seg::DS, 0x400).unwrap(),
        0x0123_4567_89AB_CDEF
    );
}

#[test]
fn test_segmented_to_linear_round_trip() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    cpu.segment_load_real_mode(seg::DS, 0x2345);
    let linear = cpu.segmented_to_linear(seg::DS, 0x0123).unwrap();
    assert_eq!(linear, 0x2345 * 16 + 0x0123);
    // subtracting the base recovers the offset while the base is unchanged
    assert_eq!(linear - cpu.sr[seg::DS].base, 0x0123);
}

#[test]
fn test_push_pop_restores_sp() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::SS, 0x0000);
    cpu.register_set16(gpr::SP, 0x8000);
    for value in [0u16, 1, 0x7FFF, 0x8000, 0xFFFF] {
        cpu.push16(&mut bus, value).unwrap();
        assert_eq!(cpu.pop16(&mut bus).unwrap(), value);
        assert_eq!(cpu.register_get16(gpr::SP), 0x8000);
    }
    for value in [0u32, 0xDEAD_BEEF, 0xFFFF_FFFF] {
        cpu.push32(&mut bus, value).unwrap();
        assert_eq!(cpu.pop32(&mut bus).unwrap(), value);
    }
}

#[test]
fn test_186_pcb_io_window() {
    // the 186 peripheral block answers port reads at its relocated base
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I186, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    // reset puts the window at I/O FF00; the relocation register itself
    // sits at FFFE
    let pcr = cpu.input16(&mut bus, 0xFFFE).unwrap();
    assert_eq!(pcr, 0x20FF);
    // writes into the window stick without reaching the host
    cpu.output16(&mut bus, 0xFF22, 0x1234).unwrap();
    assert!(bus.ports.is_empty());
    assert_eq!(cpu.input16(&mut bus, 0xFF22).unwrap(), 0x1234);
    // ports outside the window reach the host
    bus.ports.insert(0x60, 0x99);
    assert_eq!(cpu.input8(&mut bus, 0x60).unwrap(), 0x99);
}

#[test]
fn test_v33_internal_io_block() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V33, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.output8(&mut bus, 0xFF10, 0x42).unwrap();
    assert_eq!(cpu.input8(&mut bus, 0xFF10).unwrap(), 0x42);
    assert!(bus.ports.is_empty());
}

#[test]
fn test_cyrix_config_port_pair() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::Cyrix, CpuSubtype::Cx6x86));
    let mut bus = RamBus::new();
    // CCR registers are always reachable through 22h/23h
    cpu.output8(&mut bus, 0x22, 0xC1).unwrap();
    cpu.output8(&mut bus, 0x23, 0x55).unwrap();
    assert_eq!(cpu.cyrix.ccr[1], 0x55);
    cpu.output8(&mut bus, 0x22, 0xC1).unwrap();
    assert_eq!(cpu.input8(&mut bus, 0x23).unwrap(), 0x55);

    // a plain port in between clears the handshake
    cpu.output8(&mut bus, 0x22, 0xC0).unwrap();
    cpu.output8(&mut bus, 0x40, 0x00).unwrap();
    let value = cpu.input8(&mut bus, 0x23).unwrap();
    assert_eq!(value, 0xFF); // host default, not the config register
}

#[test]
fn test_prefetch_queue_flush_on_branch() {
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I8086, &[0xEB, 0x00, 0x90]); // jmp +0; nop
    cpu.prefetch_queue_fill(&mut bus);
    assert!(cpu.prefetch_len > 0);
    cpu.step(&mut bus); // the branch flushes
    assert_eq!(cpu.prefetch_len, 0);
    assert_eq!(cpu.prefetch_pointer, cpu.xip);
}

#[test]
fn test_prefetch_fault_is_swallowed() {
    // filling past the end of a tiny protected-mode code segment must not
    // deliver an exception
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I286, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.cr[0] |= 1;
    cpu.sr[seg::CS].base = 0x1000;
    cpu.sr[seg::CS].limit = 0x02; // three bytes of code
    cpu.sr[seg::CS].access = 0x9B00;
    cpu.set_xip(0x0000);
    bus.load(0x1000, &[0x40, 0x40, 0x40]);
    cpu.prefetch_queue_fill(&mut bus);
    assert!(cpu.prefetch_len <= 3);
    // and the queued bytes still execute fine
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
}

#[test]
fn test_v25_iram_overlay() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V25, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    // IDB resets to 0xFF: the internal data area sits at 0xFFE00..0xFFFFF
    // and the PRC SFR (internal offset 0x1EB) reads back its reset value
    let mut byte = [0u8];
    cpu.memory_read_no_paging(&mut bus, 0xFFE00 + 0x1EB, &mut byte);
    assert_eq!(byte[0], 0x4E);
    // writes through the window land in IRAM, not host memory
    cpu.memory_write_no_paging(&mut bus, 0xFFE10, &[0x77]);
    assert!(bus.memory.get(&0xFFE10).is_none());
    assert_eq!(cpu.iram[0x10], 0x77);
}
