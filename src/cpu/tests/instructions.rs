//! Instruction-level tests
//!
//! One instruction family per test, driven through `step` over the sparse
//! RAM bus: moves, arithmetic, flag behaviour, stack, control transfer,
//! string operations, I/O, shifts, multiply/divide and BCD adjustment.

use super::*;
use crate::exception::StepResult;
use crate::regs::gpr;

#[test]
fn test_mov_immediate_to_register() {
    let (mut cpu, mut bus) = setup_8086(&[0xB8, 0x34, 0x12]); // mov ax, 0x1234
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.register_get16(gpr::AX), 0x1234);
    assert_eq!(cpu.xip, 0x0103);
}

#[test]
fn test_mov_register_to_memory() {
    // mov [0x2000], ax
    let (mut cpu, mut bus) = setup_8086(&[0xA3, 0x00, 0x20]);
    cpu.register_set16(gpr::AX, 0xBEEF);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(bus.read_u16(0x2000), 0xBEEF);
}

#[test]
fn test_add_sets_carry_and_overflow() {
    // mov al, 0x7F; add al, 1
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x7F, 0x04, 0x01]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x80);
    assert!(cpu.of);
    assert!(!cpu.cf);
    assert!(cpu.sf);
    assert!(cpu.af);
}

#[test]
fn test_sub_borrow() {
    // mov al, 0; sub al, 1
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x00, 0x2C, 0x01]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0xFF);
    assert!(cpu.cf);
    assert!(cpu.sf);
    assert!(!cpu.zf);
}

#[test]
fn test_parity_flag_example() {
    // mov al, 3; or al, 0 -> PF=1 ZF=0 SF=0 CF=0 OF=0
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x03, 0x0C, 0x00]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.pf);
    assert!(!cpu.zf);
    assert!(!cpu.sf);
    assert!(!cpu.cf);
    assert!(!cpu.of);
}

#[test]
fn test_adc_uses_carry() {
    // stc; mov al, 1; adc al, 1
    let (mut cpu, mut bus) = setup_8086(&[0xF9, 0xB0, 0x01, 0x14, 0x01]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 3);
}

#[test]
fn test_inc_preserves_carry() {
    // stc; inc ax
    let (mut cpu, mut bus) = setup_8086(&[0xF9, 0x40]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.cf);
    assert_eq!(cpu.register_get16(gpr::AX), 1);
}

#[test]
fn test_push_pop_duality() {
    // push ax; pop bx
    let (mut cpu, mut bus) = setup_8086(&[0x50, 0x5B]);
    cpu.register_set16(gpr::AX, 0xCAFE);
    let sp = cpu.register_get16(gpr::SP);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::SP), sp - 2);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::BX), 0xCAFE);
    assert_eq!(cpu.register_get16(gpr::SP), sp);
}

#[test]
fn test_jmp_short() {
    // jmp +2; (skipped: inc ax; inc ax); inc bx
    let (mut cpu, mut bus) = setup_8086(&[0xEB, 0x02, 0x40, 0x40, 0x43]);
    cpu.step(&mut bus);
    assert_eq!(cpu.xip, 0x0104);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::BX), 1);
    assert_eq!(cpu.register_get16(gpr::AX), 0);
}

#[test]
fn test_conditional_jump_taken_and_not() {
    // xor ax, ax; jz +1; inc bx(skipped); inc cx
    let (mut cpu, mut bus) = setup_8086(&[0x31, 0xC0, 0x74, 0x01, 0x43, 0x41]);
    cpu.step(&mut bus);
    assert!(cpu.zf);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::CX), 1);
    assert_eq!(cpu.register_get16(gpr::BX), 0);
}

#[test]
fn test_call_ret_near() {
    // call +3; hlt; (target): ret
    let (mut cpu, mut bus) = setup_8086(&[0xE8, 0x01, 0x00, 0xF4, 0xC3]);
    cpu.step(&mut bus);
    assert_eq!(cpu.xip, 0x0104);
    cpu.step(&mut bus); // ret
    assert_eq!(cpu.xip, 0x0103);
    assert_eq!(cpu.step(&mut bus), StepResult::Halt);
}

#[test]
fn test_loop_decrements_cx() {
    // (loop body at 0x100): loop -2
    let (mut cpu, mut bus) = setup_8086(&[0xE2, 0xFE]);
    cpu.register_set16(gpr::CX, 3);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::CX), 2);
    assert_eq!(cpu.xip, 0x0100);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::CX), 0);
    assert_eq!(cpu.xip, 0x0102);
}

#[test]
fn test_mul_wide_result() {
    // mov ax, 0x1234; mov bx, 0x100; mul bx
    let (mut cpu, mut bus) = setup_8086(&[0xB8, 0x34, 0x12, 0xBB, 0x00, 0x01, 0xF7, 0xE3]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX), 0x3400);
    assert_eq!(cpu.register_get16(gpr::DX), 0x0012);
    assert!(cpu.cf);
}

#[test]
fn test_div_and_divide_error() {
    // mov ax, 100; mov bl, 7; div bl
    let (mut cpu, mut bus) = setup_8086(&[0xB8, 0x64, 0x00, 0xB3, 0x07, 0xF6, 0xF3]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 14); // quotient
    assert_eq!(cpu.register_get8_high(gpr::AX), 2); // remainder

    // div by zero delivers #DE through the IVT
    let (mut cpu, mut bus) = setup_8086(&[0xB3, 0x00, 0xF6, 0xF3]);
    bus.load(0, &[0x00, 0x90, 0x00, 0x10]); // IVT[0] = 1000:9000
    cpu.step(&mut bus);
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(0));
    assert_eq!(cpu.sr[crate::regs::seg::CS].selector, 0x1000);
    assert_eq!(cpu.xip, 0x9000);
}

#[test]
fn test_shifts() {
    // mov al, 0x81; shl al, 1
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x81, 0xD0, 0xE0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x02);
    assert!(cpu.cf);
    assert!(cpu.of); // sign changed

    // mov al, 2; sar al, 1
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x02, 0xD0, 0xF8]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x01);
    assert!(!cpu.cf);
}

#[test]
fn test_rcl_through_carry() {
    // stc; mov al, 0x80; rcl al, 1
    let (mut cpu, mut bus) = setup_8086(&[0xF9, 0xB0, 0x80, 0xD0, 0xD0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x01);
    assert!(cpu.cf);
}

#[test]
fn test_rep_movsb() {
    // rep movsb with cx=4
    let (mut cpu, mut bus) = setup_8086(&[0xF3, 0xA4]);
    cpu.register_set16(gpr::SI, 0x3000);
    cpu.register_set16(gpr::DI, 0x4000);
    cpu.register_set16(gpr::CX, 4);
    bus.load(0x3000, b"abcd");
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::CX), 0);
    assert_eq!(cpu.register_get16(gpr::SI), 0x3004);
    assert_eq!(cpu.register_get16(gpr::DI), 0x4004);
    assert_eq!(bus.memory[&0x4000], b'a');
    assert_eq!(bus.memory[&0x4003], b'd');
}

#[test]
fn test_repne_scasb_finds_byte() {
    // repne scasb over "xxZy"
    let (mut cpu, mut bus) = setup_8086(&[0xF2, 0xAE]);
    cpu.register_set8_low(gpr::AX, b'Z');
    cpu.register_set16(gpr::DI, 0x3000);
    cpu.register_set16(gpr::CX, 10);
    bus.load(0x3000, b"xxZy");
    cpu.step(&mut bus);
    assert!(cpu.zf);
    assert_eq!(cpu.register_get16(gpr::DI), 0x3003);
    assert_eq!(cpu.register_get16(gpr::CX), 7);
}

#[test]
fn test_std_reverses_string_direction() {
    // std; lodsb
    let (mut cpu, mut bus) = setup_8086(&[0xFD, 0xAC]);
    cpu.register_set16(gpr::SI, 0x3000);
    bus.load(0x3000, &[0x42]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x42);
    assert_eq!(cpu.register_get16(gpr::SI), 0x2FFF);
}

#[test]
fn test_in_out_ports() {
    // in al, 0x60; out 0x61, al
    let (mut cpu, mut bus) = setup_8086(&[0xE4, 0x60, 0xE6, 0x61]);
    bus.ports.insert(0x60, 0x55);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x55);
    cpu.step(&mut bus);
    assert_eq!(bus.ports[&0x61], 0x55);
}

#[test]
fn test_xchg_and_xlat() {
    // xchg ax, bx
    let (mut cpu, mut bus) = setup_8086(&[0x93]);
    cpu.register_set16(gpr::AX, 1);
    cpu.register_set16(gpr::BX, 2);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX), 2);
    assert_eq!(cpu.register_get16(gpr::BX), 1);

    // xlat
    let (mut cpu, mut bus) = setup_8086(&[0xD7]);
    cpu.register_set16(gpr::BX, 0x3000);
    cpu.register_set8_low(gpr::AX, 2);
    bus.load(0x3000, &[10, 20, 30]);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 30);
}

#[test]
fn test_aam_and_daa() {
    // mov al, 0x45; aam
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x45, 0xD4, 0x0A]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_high(gpr::AX), 6);
    assert_eq!(cpu.register_get8_low(gpr::AX), 9);

    // mov al, 0x0F; add al, 1; daa -> BCD 0x16
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x0F, 0x04, 0x01, 0x27]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::AX), 0x16);
}

#[test]
fn test_lea_and_modrm16() {
    // lea ax, [bx+si+0x10]
    let (mut cpu, mut bus) = setup_8086(&[0x8D, 0x40, 0x10]);
    cpu.register_set16(gpr::BX, 0x1000);
    cpu.register_set16(gpr::SI, 0x0200);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX), 0x1210);
}

#[test]
fn test_modrm_bp_defaults_to_ss() {
    // mov ax, [bp+2] reads through SS
    let (mut cpu, mut bus) = setup_8086(&[0x8B, 0x46, 0x02]);
    cpu.segment_load_real_mode(crate::regs::seg::SS, 0x0800);
    cpu.register_set16(gpr::BP, 0x0100);
    bus.load(0x8000 + 0x0102, &[0x77, 0x66]);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX), 0x6677);
}

#[test]
fn test_undefined_opcode_8086_continues() {
    // 0F is POP CS on the 8086; D6 (SALC) executes; genuine undefined
    // encodings still retire with a report
    let (mut cpu, mut bus) = setup_8086(&[0x0F]);
    cpu.push16(&mut bus, 0x2222).unwrap();
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.sr[crate::regs::seg::CS].selector, 0x2222);
}

#[test]
fn test_undefined_opcode_286_faults() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I286, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(crate::regs::seg::CS, 0x0000);
    cpu.segment_load_real_mode(crate::regs::seg::SS, 0x0000);
    cpu.register_set16(gpr::SP, 0x8000);
    cpu.set_xip(0x0100);
    bus.load(0x0100, &[0xF1]); // ICEBP does not exist yet
    bus.load(6 * 4, &[0x00, 0x90, 0x00, 0x10]); // IVT[6]
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(6));
    // fault: the pushed IP points back at the undefined opcode
    let sp = u64::from(cpu.register_get16(gpr::SP));
    let pushed_ip = bus.read_u16(sp);
    assert_eq!(pushed_ip, 0x0100);
}

#[test]
fn test_386_operand_size_prefix() {
    // 66 b8 imm32: mov eax, 0x11223344 in 16-bit code
    let (mut cpu, mut bus) = setup_386(&[0x66, 0xB8, 0x44, 0x33, 0x22, 0x11]);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get32(gpr::AX), 0x1122_3344);
}

#[test]
fn test_386_movzx_movsx() {
    // mov bl, 0x80; movzx ax, bl; movsx cx, bl
    let (mut cpu, mut bus) = setup_386(&[0xB3, 0x80, 0x0F, 0xB6, 0xC3, 0x0F, 0xBE, 0xCB]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX), 0x0080);
    assert_eq!(cpu.register_get16(gpr::CX), 0xFF80);
}

#[test]
fn test_386_bit_test() {
    // mov ax, 0x0004; bt ax, 2
    let (mut cpu, mut bus) = setup_386(&[0xB8, 0x04, 0x00, 0x0F, 0xBA, 0xE0, 0x02]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.cf);
}

#[test]
fn test_386_setcc() {
    // cmp ax, ax; setz bl
    let (mut cpu, mut bus) = setup_386(&[0x39, 0xC0, 0x0F, 0x94, 0xC3]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get8_low(gpr::BX), 1);
}

#[test]
fn test_hlt_latches() {
    let (mut cpu, mut bus) = setup_8086(&[0xF4]);
    assert_eq!(cpu.step(&mut bus), StepResult::Halt);
    assert_eq!(cpu.step(&mut bus), StepResult::Halt);
    assert!(cpu.halted);
}

#[test]
fn test_pushf_popf_duality() {
    // stc; pushf; clc; popf
    let (mut cpu, mut bus) = setup_8086(&[0xF9, 0x9C, 0xF8, 0x9D]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(!cpu.cf);
    cpu.step(&mut bus);
    assert!(cpu.cf);
}

#[test]
fn test_cbw_cwd() {
    let (mut cpu, mut bus) = setup_8086(&[0xB0, 0x80, 0x98, 0x99]);
    cpu.step(&mut bus);
    cpu.step(&mut bus); // cbw
    assert_eq!(cpu.register_get16(gpr::AX), 0xFF80);
    cpu.step(&mut bus); // cwd
    assert_eq!(cpu.register_get16(gpr::DX), 0xFFFF);
}
