//! Protection machinery: data segment loads, call gates with parameter
//! copy, stack switching, LAR/LSL probes and far returns across rings.

mod common;

use common::{descriptor, protected_mode_cpu};
use x86_core::regs::{desc, gpr, seg};
use x86_core::StepResult;

#[test]
fn test_data_segment_load_checks() {
    // mov ds, ax with a good data selector
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x8E, 0xD8]);
    cpu.register_set16(gpr::AX, 0x10);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.sr[seg::DS].selector, 0x10);
    assert_eq!(cpu.sr[seg::DS].limit, 0xFFFF_FFFF);
    // the accessed bit got written back to the GDT
    assert_ne!(bus.read8(0x10000 + 16 + 5) & 0x01, 0);
}

#[test]
fn test_null_selector_into_ss_faults() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x8E, 0xD0]); // mov ss, ax
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    bus.load(idt + 13 * 8, &[0x00, 0x04, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00]);
    cpu.register_set16(gpr::AX, 0x0000);
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(13));
}

#[test]
fn test_null_selector_into_ds_allowed() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x8E, 0xD8]);
    cpu.register_set16(gpr::AX, 0x0003); // null with RPL 3
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.sr[seg::DS].selector, 0x0003);
    // but reading through it faults
    assert!(cpu.segmented_read8(&mut bus, seg::DS, 0).is_err());
}

#[test]
fn test_lar_lsl() {
    // lar bx, ax; lsl cx, ax
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x0F, 0x02, 0xD8, 0x0F, 0x03, 0xC8]);
    cpu.register_set16(gpr::AX, 0x10);
    cpu.step(&mut bus);
    assert!(cpu.zf);
    assert_eq!(cpu.register_get16(gpr::BX) & 0xFF00, 0x9200);
    cpu.step(&mut bus);
    assert!(cpu.zf);
    assert_eq!(cpu.register_get16(gpr::CX), 0xFFFF);

    // a junk selector clears ZF without faulting
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x0F, 0x02, 0xD8]);
    cpu.register_set16(gpr::AX, 0x7FF8);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert!(!cpu.zf);
}

#[test]
fn test_call_gate_parameter_copy() {
    // a call through a 32-bit call gate with parameter count 2 from ring 3
    // copies two dwords to the inner stack and builds the frame
    // old_ss, old_esp, param1, param0, old_cs, old_eip (top last)
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x9A, 0x00, 0x00, 0x00, 0x00, 0x28, 0x00]);
    let gdt = 0x10000u64;
    // ring 3 code/data and a TSS with the ring-0 stack
    bus.load(gdt + 0x18, &descriptor(0, 0xFFFFF, 0xFA, 0xC)); // 0x18: ring3 code
    bus.load(gdt + 0x20, &descriptor(0, 0xFFFFF, 0xF2, 0xC)); // 0x20: ring3 data
    // 0x28: call gate -> selector 8, offset 0x0800, 2 parameters
    bus.load(gdt + 0x28, &[0x00, 0x08, 0x08, 0x00, 0x02, 0xEC, 0x00, 0x00]);
    // 0x30: 32-bit TSS descriptor at 0x30000
    bus.load(gdt + 0x30, &[0x67, 0x00, 0x00, 0x00, 0x03, 0x89, 0x00, 0x00]);
    // TSS: ESP0 = 0x40000, SS0 = 0x10
    bus.write32(0x30000 + 4, 0x0004_0000);
    bus.write16(0x30000 + 8, 0x0010);
    cpu.sr[seg::TR].selector = 0x30;
    cpu.sr[seg::TR].base = 0x30000;
    cpu.sr[seg::TR].limit = 0x67;
    cpu.sr[seg::TR].access = desc::TYPE_TSS32_BUSY | desc::P;

    // drop to ring 3 on the ring-3 stack with two parameters pushed
    cpu.sr[seg::CS].selector = 0x1B;
    cpu.sr[seg::CS].access = 0x9A00 | desc::D | desc::G | (3 << desc::DPL_SHIFT);
    cpu.sr[seg::SS].selector = 0x23;
    cpu.sr[seg::SS].access = 0x9200 | desc::D | desc::G | (3 << desc::DPL_SHIFT);
    cpu.set_cpl(3);
    cpu.register_set32(gpr::SP, 0x2_0000);
    cpu.push32(&mut bus, 0x1111_1111).unwrap();
    cpu.push32(&mut bus, 0x2222_2222).unwrap();
    let old_esp = cpu.register_get32(gpr::SP);

    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.cpl(), 0);
    assert_eq!(cpu.sr[seg::CS].selector & !3, 0x08);
    assert_eq!(cpu.xip, 0x0800);
    assert_eq!(cpu.sr[seg::SS].selector, 0x10);

    // inner stack, top to bottom: eip, cs, param0, param1, old_esp, old_ss
    let sp = cpu.register_get32(gpr::SP) as u64;
    assert_eq!(bus.read32(sp), 0x0107); // return eip (after the far call)
    assert_eq!(bus.read32(sp + 4) & !3, 0x18); // old cs
    assert_eq!(bus.read32(sp + 8), 0x2222_2222); // param0 (top of outer stack)
    assert_eq!(bus.read32(sp + 12), 0x1111_1111); // param1
    assert_eq!(bus.read32(sp + 16), old_esp);
    assert_eq!(bus.read32(sp + 20) & 0xFFFF, 0x23); // old ss
}

#[test]
fn test_far_return_to_outer_ring() {
    // retf from ring 0 to ring 3 pops CS/EIP then SS/ESP and nulls the
    // more-privileged data segments
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xCB]);
    let gdt = 0x10000u64;
    bus.load(gdt + 0x18, &descriptor(0, 0xFFFFF, 0xFA, 0xC));
    bus.load(gdt + 0x20, &descriptor(0, 0xFFFFF, 0xF2, 0xC));

    cpu.push32(&mut bus, 0x23).unwrap(); // outer ss
    cpu.push32(&mut bus, 0x0003_0000).unwrap(); // outer esp
    cpu.push32(&mut bus, 0x1B).unwrap(); // outer cs
    cpu.push32(&mut bus, 0x0000_0900).unwrap(); // outer eip

    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.cpl(), 3);
    assert_eq!(cpu.xip, 0x0900);
    assert_eq!(cpu.register_get32(gpr::SP), 0x0003_0000);
    assert_eq!(cpu.sr[seg::SS].selector, 0x23);
    // DS was ring 0 data and must now be null
    assert_eq!(cpu.sr[seg::DS].selector & !3, 0);
}

#[test]
fn test_conforming_code_keeps_cpl() {
    // far jmp into conforming ring-0 code from ring 3 stays at CPL 3
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xEA, 0x00, 0x09, 0x00, 0x00, 0x28, 0x00]);
    let gdt = 0x10000u64;
    bus.load(gdt + 0x28, &descriptor(0, 0xFFFFF, 0x9E, 0xC)); // DPL0 conforming
    cpu.sr[seg::CS].selector = 0x1B;
    cpu.sr[seg::CS].access |= 3 << desc::DPL_SHIFT;
    cpu.sr[seg::SS].access |= 3 << desc::DPL_SHIFT;
    cpu.set_cpl(3);

    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.cpl(), 3);
    assert_eq!(cpu.sr[seg::CS].selector & 3, 3); // RPL forced to CPL
    assert_eq!(cpu.xip, 0x0900);
}

#[test]
fn test_lgdt_lidt_sgdt() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[
        0x0F, 0x01, 0x16, 0x00, 0x50, // lgdt [0x5000]
        0x0F, 0x01, 0x1E, 0x08, 0x50, // lidt [0x5008]
        0x0F, 0x01, 0x06, 0x00, 0x60, // sgdt [0x6000]
    ]);
    bus.write16(0x5000, 0x1FFF);
    bus.write32(0x5002, 0x0004_5000);
    bus.write16(0x5008, 0x07FF);
    bus.write32(0x500A, 0x0004_6000);

    cpu.step(&mut bus);
    assert_eq!(cpu.sr[seg::GDTR].base, 0x0004_5000);
    assert_eq!(cpu.sr[seg::GDTR].limit, 0x1FFF);
    cpu.step(&mut bus);
    assert_eq!(cpu.sr[seg::IDTR].base, 0x0004_6000);
    assert_eq!(cpu.sr[seg::IDTR].limit, 0x07FF);
    cpu.step(&mut bus);
    assert_eq!(bus.read16(0x6000), 0x1FFF);
    assert_eq!(bus.read32(0x6002), 0x0004_5000);
}

#[test]
fn test_expand_down_limit_rule() {
    // expand-down data: valid offsets lie strictly above the limit
    let (mut cpu, mut bus) = protected_mode_cpu(&[]);
    cpu.sr[seg::DS].access = 0x9600 | desc::D; // expand-down, writable
    cpu.sr[seg::DS].limit = 0x0FFF;
    cpu.sr[seg::DS].base = 0;
    assert!(cpu.segmented_read8(&mut bus, seg::DS, 0x0800).is_err());
    assert!(cpu.segmented_read8(&mut bus, seg::DS, 0x1000).is_ok());
}

#[test]
fn test_smsw_lmsw() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[
        0x0F, 0x01, 0xE0, // smsw ax
        0x0F, 0x01, 0xF0, // lmsw ax
    ]);
    cpu.step(&mut bus);
    assert_eq!(cpu.register_get16(gpr::AX) & 1, 1); // PE visible
    cpu.register_set16(gpr::AX, 0x000B);
    cpu.step(&mut bus);
    assert_eq!(cpu.cr[0] & 0x0F, 0x0B);
}

#[test]
fn test_push_operand_size_is_stack_width() {
    // 16-bit push in 32-bit-stack protected mode still moves SP by 2 when
    // the operand size says so
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x66, 0x50]); // push ax (66 toggles 32->16)
    let sp_before = cpu.register_get32(gpr::SP);
    let _ = cpu.step(&mut bus);
    assert_eq!(cpu.register_get32(gpr::SP), sp_before.wrapping_sub(2));
}
