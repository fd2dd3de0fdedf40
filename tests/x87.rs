//! x87 FPU: stack discipline, tag word, arithmetic, comparisons, control
//! words and the environment/state images.

mod common;

use common::{real_mode_cpu, RamBus};
use x86_core::regs::{gpr, seg};
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits, FpuType};
use x86_core::x87::{float80::Float80, SW_C0, SW_C2, SW_C3, TAG_EMPTY, TAG_VALID, TAG_ZERO};
use x86_core::{Cpu, StepResult};

fn fpu_cpu(code: &[u8]) -> (Cpu, RamBus) {
    let mut traits = CpuTraits::new(CpuFamily::I486, CpuSubtype::Classic);
    traits.fpu_type = FpuType::Integrated;
    let mut cpu = Cpu::new(traits);
    let mut bus = RamBus::new();
    for segment in [seg::CS, seg::DS, seg::ES, seg::SS] {
        cpu.segment_load_real_mode(segment, 0x0000);
    }
    cpu.set_xip(0x0100);
    cpu.register_set16(gpr::SP, 0x8000);
    bus.load(0x0100, code);
    (cpu, bus)
}

#[test]
fn test_fld_fstp_roundtrip() {
    // fld dword [0x2000]; fstp dword [0x2004]
    let (mut cpu, mut bus) = fpu_cpu(&[
        0xD9, 0x06, 0x00, 0x20, // fld m32
        0xD9, 0x1E, 0x04, 0x20, // fstp m32
    ]);
    bus.write32(0x2000, 3.5f32.to_bits());
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    // the load classified the slot as valid and moved TOP
    assert_eq!(cpu.x87.top(), 7);
    assert_eq!(cpu.x87.tag_get(7), TAG_VALID);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(f32::from_bits(bus.read32(0x2004)), 3.5);
    // the pop emptied the slot and restored TOP
    assert_eq!(cpu.x87.top(), 0);
    assert_eq!(cpu.x87.tag_get(7), TAG_EMPTY);
}

#[test]
fn test_fldz_tag_classification() {
    let (mut cpu, mut bus) = fpu_cpu(&[0xD9, 0xEE]); // fldz
    cpu.step(&mut bus);
    assert_eq!(cpu.x87.tag_get(cpu.x87.slot(0)), TAG_ZERO);
}

#[test]
fn test_fadd_memory_operand() {
    // fld1; fadd dword [0x2000] (2.5) -> 3.5
    let (mut cpu, mut bus) = fpu_cpu(&[0xD9, 0xE8, 0xD8, 0x06, 0x00, 0x20]);
    bus.write32(0x2000, 2.5f32.to_bits());
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    let top = cpu.x87.slot(0);
    assert_eq!(cpu.x87.bank[0][top].to_f64(), 3.5);
}

#[test]
fn test_faddp_register_form() {
    // fld1; fld1; faddp st(1), st -> 2.0, one slot left
    let (mut cpu, mut bus) = fpu_cpu(&[0xD9, 0xE8, 0xD9, 0xE8, 0xDE, 0xC1]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.x87.top(), 7);
    let top = cpu.x87.slot(0);
    assert_eq!(cpu.x87.bank[0][top].to_f64(), 2.0);
}

#[test]
fn test_fcom_condition_codes() {
    // fldz; fld1; fcom st(1): ST0=1 > ST1=0 -> C0=C2=C3=0
    let (mut cpu, mut bus) = fpu_cpu(&[0xD9, 0xEE, 0xD9, 0xE8, 0xD8, 0xD1]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.x87.sw & (SW_C0 | SW_C2 | SW_C3), 0);
}

#[test]
fn test_fnstsw_ax_and_fnstcw() {
    // fnstsw ax; fnstcw [0x2000]
    let (mut cpu, mut bus) = fpu_cpu(&[0xDF, 0xE0, 0xD9, 0x3E, 0x00, 0x20]);
    cpu.x87.sw = 0x1234 & !0x8000;
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX), cpu.x87.sw);
    cpu.step(&mut bus);
    assert_eq!(bus.read16(0x2000), cpu.x87.cw);
}

#[test]
fn test_fldcw_precision_and_rounding() {
    let (mut cpu, mut bus) = fpu_cpu(&[0xD9, 0x2E, 0x00, 0x20]); // fldcw [0x2000]
    bus.write16(0x2000, 0x0C7F); // round toward zero
    cpu.step(&mut bus);
    assert_eq!(cpu.x87.cw, 0x0C7F);
    assert_eq!(
        cpu.x87.rounding(),
        x86_core::x87::float80::Rounding::Zero
    );
}

#[test]
fn test_fild_fistp() {
    // fild word [0x2000]; fistp word [0x2002]
    let (mut cpu, mut bus) = fpu_cpu(&[0xDF, 0x06, 0x00, 0x20, 0xDF, 0x1E, 0x02, 0x20]);
    bus.write16(0x2000, (-321i16) as u16);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(bus.read16(0x2002) as i16, -321);
    assert_eq!(cpu.x87.top(), 0);
}

#[test]
fn test_stack_overflow_signals_invalid() {
    // nine pushes overflow the eight-slot stack
    let mut code = Vec::new();
    for _ in 0..9 {
        code.extend_from_slice(&[0xD9, 0xE8]); // fld1
    }
    let (mut cpu, mut bus) = fpu_cpu(&code);
    for _ in 0..9 {
        cpu.step(&mut bus);
    }
    assert_ne!(cpu.x87.sw & x86_core::x87::SW_IE, 0);
    assert_ne!(cpu.x87.sw & x86_core::x87::SW_SF, 0);
}

#[test]
fn test_fnsave_frstor_duality() {
    // fld1; fldz; fnsave [0x3000]; frstor [0x3000]
    let (mut cpu, mut bus) = fpu_cpu(&[
        0xD9, 0xE8, 0xD9, 0xEE, 0xDD, 0x36, 0x00, 0x30, 0xDD, 0x26, 0x00, 0x30,
    ]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    let tw_before = cpu.x87.tw;
    let top_before = cpu.x87.top();
    cpu.step(&mut bus); // fnsave reinitializes
    assert_eq!(cpu.x87.tw, 0xFFFF);
    cpu.step(&mut bus); // frstor brings the state back
    assert_eq!(cpu.x87.tw, tw_before);
    assert_eq!(cpu.x87.top(), top_before);
    let top = cpu.x87.slot(0);
    assert!(cpu.x87.bank[0][top].is_zero());
}

#[test]
fn test_missing_fpu_faults_nm() {
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I386, &[0xD9, 0xE8]);
    assert_eq!(cpu.x87.fpu_type, FpuType::None);
    bus.write16(7 * 4, 0x0600); // IVT[7]
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(7));
}

#[test]
fn test_float80_memory_format_is_bit_exact() {
    // fld tbyte [0x2000]; fstp tbyte [0x2010]
    let (mut cpu, mut bus) = fpu_cpu(&[0xDB, 0x2E, 0x00, 0x20, 0xDB, 0x3E, 0x10, 0x20]);
    // 1.5 in extended format: fraction C000..., exponent 3FFF
    let image = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0xFF, 0x3F];
    bus.load(0x2000, &image);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    for (i, &byte) in image.iter().enumerate() {
        assert_eq!(bus.read8(0x2010 + i as u64), byte, "byte {i}");
    }
}

#[test]
fn test_soft_float_div_precision() {
    let a = Float80::from_i64(1);
    let b = Float80::from_i64(10);
    let tenth = a.div(
        b,
        x86_core::x87::float80::Precision::Extended,
        x86_core::x87::float80::Rounding::Nearest,
    );
    // 0.1 at 64-bit precision: fraction CCCC...CCCD
    assert_eq!(tenth.fraction, 0xCCCC_CCCC_CCCC_CCCD);
    assert_eq!(tenth.exponent, 0x3FFB);
}
