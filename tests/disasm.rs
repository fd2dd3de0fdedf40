//! Disassembly text rendering, including the NEC mnemonic variants.

mod common;

use common::RamBus;
use x86_core::regs::seg;
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::Cpu;

fn disassemble(family: CpuFamily, code: &[u8]) -> String {
    let mut cpu = Cpu::new(CpuTraits::new(family, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::CS, 0x0000);
    bus.load(0x0100, code);
    cpu.disassemble(&mut bus, 0x0100)
}

#[test]
fn test_basic_mnemonics() {
    assert_eq!(disassemble(CpuFamily::I8086, &[0x90]), "nop");
    assert_eq!(disassemble(CpuFamily::I8086, &[0xF4]), "hlt");
    assert_eq!(disassemble(CpuFamily::I8086, &[0xCC]), "int3");
    assert_eq!(disassemble(CpuFamily::I8086, &[0xCF]), "iret");
}

#[test]
fn test_immediate_operands() {
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0xB8, 0x34, 0x12]),
        "mov ax, 0x1234"
    );
    assert_eq!(disassemble(CpuFamily::I8086, &[0xB0, 0xFF]), "mov al, 0xff");
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0xCD, 0x21]),
        "int 0x21"
    );
}

#[test]
fn test_modrm_operands() {
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0x8B, 0x07]),
        "mov ax, [bx]"
    );
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0x8B, 0x47, 0x10]),
        "mov ax, [bx+0x10]"
    );
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0x89, 0xD8]),
        "mov ax, bx"
    );
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0xA1, 0x00, 0x20]),
        "mov ax, [0x2000]"
    );
}

#[test]
fn test_segment_override_rendering() {
    assert_eq!(
        disassemble(CpuFamily::I8086, &[0x2E, 0x8B, 0x07]),
        "mov ax, [cs:bx]"
    );
}

#[test]
fn test_nec_register_names() {
    // the V-series renders AW/BW and IX/IY and DS0/PS
    assert_eq!(
        disassemble(CpuFamily::V20, &[0xB8, 0x34, 0x12]),
        "mov aw, 0x1234"
    );
    assert_eq!(
        disassemble(CpuFamily::V20, &[0x8B, 0x04]),
        "mov aw, [ix]"
    );
    assert_eq!(
        disassemble(CpuFamily::V20, &[0x2E, 0x8B, 0x07]),
        "mov aw, [ps:bw]"
    );
}

#[test]
fn test_prefix_rendering() {
    assert_eq!(disassemble(CpuFamily::I8086, &[0xF3, 0xA4]), "rep movsb");
    assert_eq!(
        disassemble(CpuFamily::I386, &[0xF0, 0x0F, 0xAB, 0x07]),
        "lock bts [bx], ax"
    );
}

#[test]
fn test_0f_map() {
    assert_eq!(disassemble(CpuFamily::I486, &[0x0F, 0xA2]), "cpuid");
    assert_eq!(disassemble(CpuFamily::I486, &[0x0F, 0x06]), "clts");
    assert_eq!(
        disassemble(CpuFamily::I486, &[0x0F, 0x01, 0x17]),
        "lgdt [bx]"
    );
    assert_eq!(
        disassemble(CpuFamily::I486, &[0x0F, 0xB6, 0xC3]),
        "movzx ax, bl"
    );
}

#[test]
fn test_disassembly_is_pure() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::CS, 0x0000);
    bus.load(0x0100, &[0xB8, 0x34, 0x12]);
    let xip = cpu.xip;
    let ax = cpu.register_get16(x86_core::regs::gpr::AX);
    let _ = cpu.disassemble(&mut bus, 0x0100);
    assert_eq!(cpu.xip, xip);
    assert_eq!(cpu.register_get16(x86_core::regs::gpr::AX), ax);
}
