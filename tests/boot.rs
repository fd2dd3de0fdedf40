//! Reset and first-fetch behaviour per family.

mod common;

use common::RamBus;
use x86_core::regs::{gpr, seg};
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::{Cpu, StepResult};

#[test]
fn test_286_hard_reset_boot() {
    // after hard reset of a 286: CS:xIP = F000:FFF0, CS.base = 0x00FF0000,
    // flags cleared, first fetch from physical 0x00FFFFF0
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I286, CpuSubtype::Classic));
    let mut bus = RamBus::new();

    assert_eq!(cpu.sr[seg::CS].selector, 0xF000);
    assert_eq!(cpu.xip, 0xFFF0);
    assert_eq!(cpu.sr[seg::CS].base, 0x00FF_0000);
    assert!(!cpu.cf && !cpu.zf && !cpu.sf && !cpu.tf && !cpu.intf);

    // inc ax at the reset vector proves the fetch address
    bus.load(0x00FF_FFF0, &[0x40]);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.register_get16(gpr::AX), 1);
}

#[test]
fn test_8086_reset_boot() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    assert_eq!(cpu.sr[seg::CS].base + cpu.xip, 0x000F_FFF0);
    bus.load(0x000F_FFF0, &[0xEA, 0x00, 0x01, 0x00, 0x00]); // jmp 0000:0100
    bus.load(0x0100, &[0xF4]);
    cpu.step(&mut bus);
    assert_eq!(cpu.sr[seg::CS].selector, 0x0000);
    assert_eq!(cpu.xip, 0x0100);
    assert_eq!(cpu.step(&mut bus), StepResult::Halt);
}

#[test]
fn test_386_reset_high_alias() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    assert_eq!(cpu.sr[seg::CS].base + cpu.xip, 0xFFFF_FFF0);
    bus.load(0xFFFF_FFF0, &[0x90, 0xF4]);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.step(&mut bus), StepResult::Halt);
}

#[test]
fn test_v25_reset_bank_and_sfr_defaults() {
    let cpu = Cpu::new(CpuTraits::new(CpuFamily::V25, CpuSubtype::Classic));
    assert_eq!(cpu.rb, 7);
    assert_eq!(cpu.iram[x86_core::regs::sfr::IDB], 0xFF);
    assert_eq!(cpu.iram[x86_core::regs::sfr::PRC], 0x4E);
}

#[test]
fn test_hlt_wakes_on_interrupt() {
    let (mut cpu, mut bus) = common::real_mode_cpu(CpuFamily::I8086, &[0xFB, 0xF4]);
    // IVT[0x08] = 0000:0200; handler: iret
    bus.write16(0x08 * 4, 0x0200);
    bus.write16(0x08 * 4 + 2, 0x0000);
    bus.load(0x0200, &[0xCF]);

    cpu.step(&mut bus); // sti
    assert_eq!(cpu.step(&mut bus), StepResult::Halt);
    assert!(cpu.halted);

    let delivered = cpu.hardware_interrupt(&mut bus, x86_core::InterruptLine::Intr(0x08), &[]);
    assert!(delivered);
    assert!(!cpu.halted);
    assert_eq!(cpu.xip, 0x0200);

    // iret returns to the instruction after hlt
    cpu.step(&mut bus);
    assert_eq!(cpu.xip, 0x0102);
}

#[test]
fn test_intr_masked_by_if() {
    let (mut cpu, mut bus) = common::real_mode_cpu(CpuFamily::I8086, &[0xFA, 0x90]);
    cpu.step(&mut bus); // cli
    let delivered = cpu.hardware_interrupt(&mut bus, x86_core::InterruptLine::Intr(0x08), &[]);
    assert!(!delivered);
    // NMI goes through regardless
    bus.write16(2 * 4, 0x0300);
    bus.write16(2 * 4 + 2, 0x0000);
    let delivered = cpu.hardware_interrupt(&mut bus, x86_core::InterruptLine::Nmi, &[]);
    assert!(delivered);
    assert_eq!(cpu.xip, 0x0300);
}
