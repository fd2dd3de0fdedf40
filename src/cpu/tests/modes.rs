//! Mode and architectural state tests
//!
//! Reset values per family, the raw/image flag split, register bank
//! switching on the V25/V55, REX byte aliasing, and the 8080 emulation
//! mode register aliasing.

use super::*;
use crate::regs::{flags, gpr, seg};

#[test]
fn test_8086_reset_vector() {
    let cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    assert_eq!(cpu.sr[seg::CS].selector, 0xFFFF);
    assert_eq!(cpu.sr[seg::CS].base, 0x000F_FFF0);
    assert_eq!(cpu.xip, 0x0000);
}

#[test]
fn test_286_reset_vector() {
    let cpu = Cpu::new(CpuTraits::new(CpuFamily::I286, CpuSubtype::Classic));
    assert_eq!(cpu.sr[seg::CS].selector, 0xF000);
    assert_eq!(cpu.sr[seg::CS].base, 0x00FF_0000);
    assert_eq!(cpu.xip, 0xFFF0);
    assert_eq!(cpu.cr[0], 0xFFF0);
    // first fetch comes from physical 0x00FFFFF0
    assert_eq!(cpu.sr[seg::CS].base + cpu.xip, 0x00FF_FFF0);
}

#[test]
fn test_386_reset_vector_and_cr0() {
    let cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    assert_eq!(cpu.sr[seg::CS].base, 0xFFFF_0000);
    assert_eq!(cpu.xip, 0xFFF0);
    assert_eq!(cpu.cr[0] & 0x6000_0000, 0x6000_0000);
    assert_eq!(cpu.dr[6], 0xFFFF_0FF0);
}

#[test]
fn test_warm_reset_preserves_msrs() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::Intel64, CpuSubtype::Classic));
    cpu.tsc = 0x1234;
    cpu.star = 0x5678;
    cpu.reset(false);
    assert_eq!(cpu.tsc, 0x1234);
    assert_eq!(cpu.star, 0x5678);
    cpu.reset(true);
    assert_eq!(cpu.tsc, 0);
    assert_eq!(cpu.star, 0);
}

#[test]
fn test_real_mode_segment_load() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    cpu.segment_load_real_mode(seg::DS, 0x1234);
    assert_eq!(cpu.sr[seg::DS].selector, 0x1234);
    assert_eq!(cpu.sr[seg::DS].base, 0x12340);
}

#[test]
fn test_v55_extended_segment_shift() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V55, CpuSubtype::Classic));
    cpu.segment_load_real_mode(seg::DS2, 0x1234);
    assert_eq!(cpu.sr[seg::DS2].base, 0x12_3400);
    cpu.segment_load_real_mode(seg::DS, 0x1234);
    assert_eq!(cpu.sr[seg::DS].base, 0x1_2340);
}

#[test]
fn test_flags_image_8086_high_bits() {
    let cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    // bits 12-15 read as ones on the 8086
    assert_eq!(cpu.flags_get16() & 0xF000, 0xF000);
    assert_eq!(cpu.flags_get16() & 0x0002, 0x0002);
}

#[test]
fn test_flags_image_roundtrip() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    cpu.cf = true;
    cpu.zf = true;
    cpu.intf = true;
    let image = cpu.flags_get_image16();
    cpu.cf = false;
    cpu.zf = false;
    cpu.flags_set_image16(image);
    assert!(cpu.cf);
    assert!(cpu.zf);
    assert!(cpu.intf);
}

#[test]
fn test_iopl_write_needs_ring0() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    cpu.cr[0] |= 1; // protected mode
    cpu.set_cpl(3);
    cpu.flags_set_image16(3u16 << flags::IOPL_SHIFT);
    assert_eq!(cpu.iopl, 0); // masked back for CPL 3
    cpu.set_cpl(0);
    cpu.flags_set16(cpu.flags_get16() | (3 << flags::IOPL_SHIFT) as u16);
    assert_eq!(cpu.iopl, 3);
}

#[test]
fn test_v25_register_bank_switch() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V25, CpuSubtype::Classic));
    assert_eq!(cpu.rb, 7);
    cpu.register_set16(gpr::AX, 0x1111);
    cpu.segment_load_real_mode(seg::DS, 0x2222);
    cpu.set_register_bank(3);
    assert_eq!(cpu.rb, 3);
    cpu.register_set16(gpr::AX, 0x3333);
    cpu.set_register_bank(7);
    // the old bank's values come back
    assert_eq!(cpu.register_get16(gpr::AX), 0x1111);
    assert_eq!(cpu.sr[seg::DS].selector, 0x2222);
    cpu.set_register_bank(3);
    assert_eq!(cpu.register_get16(gpr::AX), 0x3333);
}

#[test]
fn test_rb_field_in_flags_switches_banks() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V25, CpuSubtype::Classic));
    cpu.register_set16(gpr::AX, 0xAAAA);
    let old_flags = cpu.flags_get16();
    let new_flags = (old_flags & !(flags::V25_RB_MASK as u16)) | (2 << flags::RB_SHIFT) as u16;
    cpu.flags_set16(new_flags);
    assert_eq!(cpu.rb, 2);
    cpu.register_set16(gpr::AX, 0xBBBB);
    cpu.flags_set16(old_flags);
    assert_eq!(cpu.register_get16(gpr::AX), 0xAAAA);
}

#[test]
fn test_rex_byte_aliasing() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::Intel64, CpuSubtype::Classic));
    cpu.register_set64(gpr::AX, 0x1122_3344_5566_7788);
    cpu.register_set64(gpr::SP, 0x0000_0000_0000_00AB);

    // without REX: index 4 selects AH
    cpu.parser.rex_prefix = false;
    assert_eq!(cpu.register_get8(4), 0x66); // AH of AX value

    // with REX: index 4 selects SPL
    cpu.parser.rex_prefix = true;
    assert_eq!(cpu.register_get8(4), 0xAB);
}

#[test]
fn test_32bit_write_zero_extends() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::Intel64, CpuSubtype::Classic));
    cpu.register_set64(gpr::AX, 0xFFFF_FFFF_FFFF_FFFF);
    cpu.register_set32(gpr::AX, 0x1234);
    assert_eq!(cpu.register_get64(gpr::AX), 0x1234);
    // 16-bit writes merge instead
    cpu.register_set64(gpr::BX, 0xFFFF_FFFF_FFFF_FFFF);
    cpu.register_set16(gpr::BX, 0x1234);
    assert_eq!(cpu.register_get64(gpr::BX), 0xFFFF_FFFF_FFFF_1234);
}

#[test]
fn test_v20_brkem_enters_emulation() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V20, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    cpu.segment_load_real_mode(seg::CS, 0x0000);
    cpu.segment_load_real_mode(seg::DS, 0x0000);
    cpu.segment_load_real_mode(seg::SS, 0x0000);
    cpu.register_set16(gpr::SP, 0x8000);
    cpu.set_xip(0x0100);
    // brkem 0x20; vector 0x20 -> 1000:0000
    bus.load(0x0100, &[0x0F, 0xFF, 0x20]);
    bus.load(0x20 * 4, &[0x00, 0x00, 0x00, 0x10]);
    // 8080 code at the handler: mvi a, 0x42 (3E 42); hlt (76)
    bus.load(0x1_0000, &[0x3E, 0x42, 0x76]);

    assert!(cpu.md); // native before
    cpu.step(&mut bus);
    assert!(cpu.is_emulation_mode());
    // DS serves as the 8080 code segment
    cpu.segment_load_real_mode(seg::DS, 0x1000);
    cpu.x80.pc = 0;
    cpu.step(&mut bus);
    assert_eq!(cpu.x80.a(), 0x42);
    assert_eq!(cpu.step(&mut bus), crate::exception::StepResult::Halt);
}

#[test]
fn test_emulation_mode_register_aliasing() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V20, CpuSubtype::Classic));
    cpu.register_set16(gpr::CX, 0x1234);
    cpu.register_set16(gpr::BX, 0x5678);
    cpu.register_set8_low(gpr::AX, 0x9A);
    cpu.load_x80_registers();
    assert_eq!(cpu.x80.bank[0].bc, 0x1234);
    assert_eq!(cpu.x80.bank[0].hl, 0x5678);
    assert_eq!(cpu.x80.a(), 0x9A);

    cpu.md = false; // emulation active
    cpu.x80.bank[0].bc = 0x4321;
    cpu.store_x80_registers();
    assert_eq!(cpu.register_get16(gpr::CX), 0x4321);
}

#[test]
fn test_code_size_tracks_cs_descriptor() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic));
    assert_eq!(cpu.code_size(), crate::cpu::OpSize::Word);
    cpu.sr[seg::CS].access |= crate::regs::desc::D;
    assert_eq!(cpu.code_size(), crate::cpu::OpSize::Dword);
}

#[test]
fn test_prefetch_queue_invariant() {
    let (mut cpu, mut bus) = setup_8086(&[0x90, 0x90, 0x90, 0x90]);
    cpu.prefetch_queue_fill(&mut bus);
    assert_eq!(
        cpu.prefetch_pointer,
        cpu.xip + cpu.prefetch_len as u64
    );
    cpu.step(&mut bus);
    // consuming a byte preserves the invariant
    assert_eq!(
        cpu.prefetch_pointer,
        cpu.xip + cpu.prefetch_len as u64
    );
}
