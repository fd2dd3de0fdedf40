//! SMM entry, resume duality and the ICE LOADALL images.

mod common;

use common::RamBus;
use x86_core::regs::{gpr, seg};
use x86_core::smm::SmiAttributes;
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits, SmmFormat};
use x86_core::{AddressSpace, Cpu, InterruptLine};

fn pentium() -> Cpu {
    Cpu::new(CpuTraits::new(CpuFamily::I586, CpuSubtype::Classic))
}

#[test]
fn test_smi_enters_smm() {
    let mut cpu = pentium();
    let mut bus = RamBus::new();
    assert_eq!(cpu.traits.smm_format, SmmFormat::P5);
    cpu.register_set32(gpr::AX, 0x1234_5678);
    cpu.set_xip(0x0100);
    cpu.segment_load_real_mode(seg::CS, 0x2000);

    let accepted = cpu.hardware_interrupt(&mut bus, InterruptLine::Smi, &[]);
    assert!(accepted);
    assert_eq!(cpu.cpu_level, AddressSpace::Smm);
    assert_eq!(cpu.xip, 0x8000);
    assert_eq!(cpu.sr[seg::CS].base, 0x30000);
    assert_eq!(cpu.sr[seg::CS].selector, 0x3000);
    // protection torn down, flags at the reserved bit only
    assert_eq!(cpu.cr[0] & 0x8000_000F, 0);
    assert!(!cpu.intf && !cpu.tf && !cpu.cf);
}

#[test]
fn test_smm_save_resume_duality() {
    let mut cpu = pentium();
    let mut bus = RamBus::new();
    // distinctive state before the SMI
    cpu.register_set32(gpr::AX, 0x1111_2222);
    cpu.register_set32(gpr::BX, 0x3333_4444);
    cpu.register_set32(gpr::SI, 0x5555_6666);
    cpu.segment_load_real_mode(seg::CS, 0x2000);
    cpu.segment_load_real_mode(seg::DS, 0x3000);
    cpu.set_xip(0x0123);
    cpu.cf = true;
    cpu.zf = true;
    cpu.intf = true;
    cpu.dr[7] = 0x0000_0400;
    cpu.cr[3] = 0x0005_5000;

    cpu.smm_enter(&mut bus, SmiAttributes::external()).unwrap();
    assert_eq!(cpu.cpu_level, AddressSpace::Smm);
    assert!(!cpu.cf);

    cpu.smm_resume(&mut bus).unwrap();
    assert_eq!(cpu.cpu_level, AddressSpace::Supervisor);
    assert_eq!(cpu.register_get32(gpr::AX), 0x1111_2222);
    assert_eq!(cpu.register_get32(gpr::BX), 0x3333_4444);
    assert_eq!(cpu.register_get32(gpr::SI), 0x5555_6666);
    assert_eq!(cpu.xip, 0x0123);
    assert_eq!(cpu.sr[seg::CS].selector, 0x2000);
    assert_eq!(cpu.sr[seg::CS].base, 0x20000);
    assert_eq!(cpu.sr[seg::DS].base, 0x30000);
    assert!(cpu.cf);
    assert!(cpu.zf);
    assert!(cpu.intf);
    assert_eq!(cpu.cr[3], 0x0005_5000);
}

#[test]
fn test_amd64_save_resume_duality() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::Intel64, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    assert_eq!(cpu.traits.smm_format, SmmFormat::Amd64);
    cpu.register_set64(gpr::AX, 0x1122_3344_5566_7788);
    cpu.register_set64(15, 0x99AA_BBCC_DDEE_FF00);
    cpu.efer = 0x500;
    cpu.cr[4] = 0x20;
    cpu.set_xip(0xFFF0_1234);

    cpu.smm_enter(&mut bus, SmiAttributes::external()).unwrap();
    assert_eq!(cpu.efer, 0); // SMM runs without long mode
    cpu.smm_resume(&mut bus).unwrap();
    assert_eq!(cpu.register_get64(gpr::AX), 0x1122_3344_5566_7788);
    assert_eq!(cpu.register_get64(15), 0x99AA_BBCC_DDEE_FF00);
    assert_eq!(cpu.efer, 0x500);
    assert_eq!(cpu.cr[4], 0x20);
    assert_eq!(cpu.xip, 0xFFF0_1234);
}

#[test]
fn test_cyrix_smm_header_flags() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::Cyrix, CpuSubtype::CxM2));
    let mut bus = RamBus::new();
    assert_eq!(cpu.traits.smm_format, SmmFormat::CxM2);
    // SMAR: base 0x0A0000 (bits 31:12 in the register's 23:4), size code 3
    cpu.cyrix.arr[3] = 0x0000_00A3;
    cpu.halted = true;

    cpu.smm_enter(&mut bus, SmiAttributes::external()).unwrap();
    assert_eq!(cpu.sr[seg::CS].base, 0x000A_0000);
    assert_eq!(cpu.xip, 0);

    // header word at top-0x24 carries the halted bit
    let top = u64::from(cpu.cyrix.smm_hdr & !1);
    let header = bus.read16(top - 0x24);
    assert_ne!(header & 0x0010, 0, "halted flag");
}

#[test]
fn test_ice_storeall_loadall_286() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I286, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.register_set16(gpr::AX, 0xAAAA);
    cpu.register_set16(gpr::DI, 0x1234);
    cpu.segment_load_real_mode(seg::DS, 0x4000);
    cpu.set_xip(0x0456);

    cpu.ice_storeall_286(&mut bus).unwrap();
    // the dump landed at the architectural 0x800 area
    assert_eq!(bus.read16(0x00834), 0xAAAA);
    assert_eq!(bus.read16(0x00826), 0x1234);
    // and the CPU is at the ICE entry point
    assert_eq!(cpu.sr[seg::CS].selector, 0xF000);

    // LOADALL restores it
    cpu.register_set16(gpr::AX, 0);
    bus.write16(0x00804, 0xFFF0);
    cpu.ice_loadall_286(&mut bus).unwrap();
    assert_eq!(cpu.register_get16(gpr::AX), 0xAAAA);
    assert_eq!(cpu.register_get16(gpr::DI), 0x1234);
    assert_eq!(cpu.xip, 0x0456);
    assert_eq!(cpu.sr[seg::DS].selector, 0x4000);
    assert_eq!(cpu.sr[seg::DS].base, 0x40000);
}

#[test]
fn test_ice_storeall_loadall_386() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.register_set32(gpr::AX, 0xDEAD_BEEF);
    cpu.segment_load_real_mode(seg::SS, 0x5000);
    cpu.set_xip(0x0789);
    cpu.dr[7] = 0x0000_0155;

    cpu.ice_storeall_386(&mut bus, 0x60000).unwrap();
    assert_eq!(cpu.cpu_level, AddressSpace::Ice);
    cpu.register_set32(gpr::AX, 0);
    cpu.ice_loadall_386(&mut bus, 0x60000).unwrap();
    assert_eq!(cpu.register_get32(gpr::AX), 0xDEAD_BEEF);
    assert_eq!(cpu.xip, 0x0789);
    assert_eq!(cpu.dr[7], 0x0000_0155);
    assert_eq!(cpu.sr[seg::SS].base, 0x50000);
    assert_eq!(cpu.cpu_level, AddressSpace::Supervisor);
}

#[test]
fn test_rsm_outside_smm_is_undefined() {
    let mut cpu = pentium();
    assert!(!cpu.smm_instruction_valid());
    cpu.cpu_level = AddressSpace::Smm;
    assert!(cpu.smm_instruction_valid());
}
