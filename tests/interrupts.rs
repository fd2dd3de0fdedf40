//! Interrupt delivery: real-mode frames, IRET duality, software interrupt
//! privilege, and the double/triple-fault escalation matrix.

mod common;

use common::{descriptor, protected_mode_cpu, real_mode_cpu};
use x86_core::regs::{gpr, seg};
use x86_core::traits::CpuFamily;
use x86_core::StepResult;

#[test]
fn test_real_mode_int3_frame() {
    // with IVT[3] = 1234:5678, int3 from 0000:0100 pushes FLAGS, CS=0,
    // IP=0x0101 and clears IF/TF
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I8086, &[0xCC]);
    bus.write16(3 * 4, 0x5678);
    bus.write16(3 * 4 + 2, 0x1234);
    cpu.intf = true;
    cpu.tf = true;
    let flags_before = cpu.flags_get16();

    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(3));
    assert_eq!(cpu.sr[seg::CS].selector, 0x1234);
    assert_eq!(cpu.xip, 0x5678);
    assert!(!cpu.intf);
    assert!(!cpu.tf);

    let sp = u64::from(cpu.register_get16(gpr::SP));
    assert_eq!(bus.read16(sp), 0x0101); // return IP past the int3
    assert_eq!(bus.read16(sp + 2), 0x0000); // return CS
    assert_eq!(bus.read16(sp + 4), flags_before);
}

#[test]
fn test_iret_duality() {
    // int3 then iret restores CS, IP and the flag image
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I8086, &[0xCC, 0x90]);
    bus.write16(3 * 4, 0x0200);
    bus.write16(3 * 4 + 2, 0x0000);
    bus.load(0x0200, &[0xCF]); // iret
    cpu.intf = true;
    cpu.cf = true;

    let sp_before = cpu.register_get16(gpr::SP);
    cpu.step(&mut bus);
    assert!(!cpu.intf);
    cpu.step(&mut bus); // iret
    assert_eq!(cpu.xip, 0x0101);
    assert_eq!(cpu.sr[seg::CS].selector, 0x0000);
    assert!(cpu.intf);
    assert!(cpu.cf);
    assert_eq!(cpu.register_get16(gpr::SP), sp_before);
}

#[test]
fn test_int_n_vector() {
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I8086, &[0xCD, 0x21]);
    bus.write16(0x21 * 4, 0x0400);
    bus.write16(0x21 * 4 + 2, 0x2000);
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(0x21));
    assert_eq!(cpu.sr[seg::CS].selector, 0x2000);
    assert_eq!(cpu.xip, 0x0400);
}

#[test]
fn test_into_only_fires_on_overflow() {
    let (mut cpu, mut bus) = real_mode_cpu(CpuFamily::I8086, &[0xCE, 0xCE]);
    bus.write16(4 * 4, 0x0500);
    cpu.of = false;
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    cpu.of = true;
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(4));
}

#[test]
fn test_protected_int_gate_delivery() {
    // int 0x40 through a 32-bit interrupt gate; IF clears
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xCD, 0x40]);
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    // gate: offset 0x0400, selector 8, type 0x8E (present int gate 32)
    bus.load(
        idt + 0x40 * 8,
        &[0x00, 0x04, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00],
    );
    cpu.intf = true;

    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(0x40));
    assert_eq!(cpu.xip, 0x0400);
    assert_eq!(cpu.sr[seg::CS].selector, 0x08);
    assert!(!cpu.intf);
}

#[test]
fn test_protected_trap_gate_keeps_if() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xCD, 0x41]);
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    // type 0x8F = trap gate 32
    bus.load(
        idt + 0x41 * 8,
        &[0x00, 0x04, 0x08, 0x00, 0x00, 0x8F, 0x00, 0x00],
    );
    cpu.intf = true;
    cpu.step(&mut bus);
    assert!(cpu.intf);
}

#[test]
fn test_error_code_pushed_for_gp() {
    // a protected-mode #GP pushes its error code after the frame
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x8E, 0xD8]); // mov ds, ax
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    bus.load(
        idt + 13 * 8,
        &[0x00, 0x04, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00],
    );
    // AX selects a selector past the GDT limit
    cpu.register_set16(gpr::AX, 0x7FF8);
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(13));
    let sp = cpu.register_get32(gpr::SP) as u64;
    assert_eq!(bus.read32(sp), 0x7FF8); // error code = faulting selector
    assert_eq!(bus.read32(sp + 4), 0x0100); // EIP rolled back to the fault
}

#[test]
fn test_double_fault_escalation() {
    // #GP with an IDT whose #GP gate is itself junk escalates to #DF
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x8E, 0xD8]);
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    // IDT entry 13 names a null code selector -> #GP during delivery
    bus.load(
        idt + 13 * 8,
        &[0x00, 0x04, 0x00, 0x00, 0x00, 0x8E, 0x00, 0x00],
    );
    // #DF gate is good and lands at 0x0800
    bus.load(
        idt + 8 * 8,
        &[0x00, 0x08, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00],
    );
    cpu.register_set16(gpr::AX, 0x7FF8);
    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(8));
    assert_eq!(cpu.xip, 0x0800);
    // #DF pushes error code 0
    let sp = cpu.register_get32(gpr::SP) as u64;
    assert_eq!(bus.read32(sp), 0);
}

#[test]
fn test_triple_fault_shuts_down() {
    // nothing in the IDT is usable: #GP -> #DF -> shutdown
    let (mut cpu, mut bus) = protected_mode_cpu(&[0x8E, 0xD8]);
    cpu.sr[seg::IDTR].base = 0x20000;
    cpu.sr[seg::IDTR].limit = 0; // every gate fetch overruns
    cpu.register_set16(gpr::AX, 0x7FF8);
    assert_eq!(cpu.step(&mut bus), StepResult::TripleFault);
}

#[test]
fn test_software_int_needs_gate_privilege() {
    // INT n from CPL 3 through a DPL 0 gate -> #GP
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xCD, 0x40]);
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    bus.load(
        idt + 0x40 * 8,
        &[0x00, 0x04, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00],
    );
    // #GP gate DPL 0 is fine for the resulting hardware-sourced fault;
    // make it conforming ring-3-reachable code instead of switching stacks
    bus.load(0x10000 + 24, &descriptor(0, 0xFFFFF, 0xFE, 0xC)); // ring3 conforming code
    bus.load(
        idt + 13 * 8,
        &[0x00, 0x06, 0x18, 0x00, 0x00, 0xEE, 0x00, 0x00],
    );
    // drop to CPL 3 with ring-3 stack state
    cpu.sr[seg::CS].selector = 0x1B;
    cpu.sr[seg::CS].access |= 3 << x86_core::regs::desc::DPL_SHIFT;
    cpu.sr[seg::SS].access |= 3 << x86_core::regs::desc::DPL_SHIFT;
    cpu.set_cpl(3);
    cpu.iopl = 0;

    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(13));
    assert_eq!(cpu.xip, 0x0600);
}
