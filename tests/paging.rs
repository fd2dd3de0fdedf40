//! Paging walks: translation, accessed/dirty maintenance, fault error
//! codes, large pages and the V33 expanded-address mode.

mod common;

use common::{protected_mode_cpu, RamBus};
use x86_core::paging::PageEntry;
use x86_core::regs::{gpr, seg};
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::{Cpu, StepResult};

/// Identity-map the first 4 MiB with a 2-level table at 0x100000.
fn enable_paging(cpu: &mut Cpu, bus: &mut RamBus) {
    let directory = 0x10_0000u64;
    let table = 0x10_1000u64;
    bus.write32(directory, (table as u32) | 0x007); // present, rw, user
    for page in 0..1024u64 {
        bus.write32(table + page * 4, ((page << 12) as u32) | 0x007);
    }
    cpu.cr[3] = directory;
    cpu.cr[0] |= 1 << 31;
}

#[test]
fn test_identity_translation_and_accessed_bits() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xA1, 0x00, 0x30, 0x00, 0x00]); // mov eax, [0x3000]
    enable_paging(&mut cpu, &mut bus);
    bus.write32(0x3000, 0xDEAD_BEEF);

    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.register_get32(gpr::AX), 0xDEAD_BEEF);

    // the walk set A in the directory and table entries
    let directory_entry = bus.read32(0x10_0000);
    let table_entry = bus.read32(0x10_1000 + 3 * 4);
    assert_ne!(u64::from(directory_entry) & PageEntry::A.bits(), 0);
    assert_ne!(u64::from(table_entry) & PageEntry::A.bits(), 0);
    assert_eq!(u64::from(table_entry) & PageEntry::D.bits(), 0);
}

#[test]
fn test_write_sets_dirty() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xA3, 0x00, 0x30, 0x00, 0x00]); // mov [0x3000], eax
    enable_paging(&mut cpu, &mut bus);
    cpu.register_set32(gpr::AX, 0x1234_5678);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(bus.read32(0x3000), 0x1234_5678);
    let table_entry = bus.read32(0x10_1000 + 3 * 4);
    assert_ne!(u64::from(table_entry) & PageEntry::D.bits(), 0);
}

#[test]
fn test_not_present_page_faults_with_cr2() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xA1, 0x00, 0x00, 0x40, 0x00]); // mov eax, [0x400000]
    enable_paging(&mut cpu, &mut bus);
    // IDT: #PF gate at 0x0700
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    bus.load(idt + 14 * 8, &[0x00, 0x07, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00]);
    // 0x400000 is beyond the single mapped directory entry
    // the IDT itself must stay reachable: map its directory slot too
    bus.write32(0x10_0000 + 0, bus.read32(0x10_0000));

    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(14));
    assert_eq!(cpu.cr[2], 0x0040_0000);
    // error code: not-present read in supervisor mode
    let sp = cpu.register_get32(gpr::SP) as u64;
    assert_eq!(bus.read32(sp), 0);
}

#[test]
fn test_pse_large_page() {
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xA1, 0x00, 0x30, 0x40, 0x00]); // mov eax, [0x403000]
    let directory = 0x10_0000u64;
    // directory slot 1 maps a 4 MiB page at 0x400000
    bus.write32(directory, bus.read32(directory)); // slot 0 left empty on purpose
    bus.write32(directory + 4, 0x0040_0000 | 0x087); // PS, present, rw
    // slot 0 still needs the small table for code fetches
    let table = 0x10_1000u64;
    for page in 0..1024u64 {
        bus.write32(table + page * 4, ((page << 12) as u32) | 0x007);
    }
    bus.write32(directory, (table as u32) | 0x007);
    cpu.cr[3] = directory;
    cpu.cr[4] |= 1 << 4; // PSE
    cpu.cr[0] |= 1 << 31;

    bus.write32(0x0040_3000, 0xCAFE_F00D);
    assert_eq!(cpu.step(&mut bus), StepResult::Success);
    assert_eq!(cpu.register_get32(gpr::AX), 0xCAFE_F00D);
}

#[test]
fn test_supervisor_write_protect() {
    // CR0.WP makes read-only pages fault even for ring 0 writes
    let (mut cpu, mut bus) = protected_mode_cpu(&[0xA3, 0x00, 0x30, 0x00, 0x00]);
    let directory = 0x10_0000u64;
    let table = 0x10_1000u64;
    for page in 0..1024u64 {
        // read-only mapping
        bus.write32(table + page * 4, ((page << 12) as u32) | 0x005);
    }
    bus.write32(directory, (table as u32) | 0x005);
    cpu.cr[3] = directory;
    cpu.cr[0] |= (1 << 31) | (1 << 16);
    let idt = 0x20000u64;
    cpu.sr[seg::IDTR].base = idt;
    cpu.sr[seg::IDTR].limit = 0xFFF;
    bus.load(idt + 14 * 8, &[0x00, 0x07, 0x08, 0x00, 0x00, 0x8E, 0x00, 0x00]);
    // the fault frame needs a writable stack: map the stack pages rw
    for page in 0x1F..=0x20u64 {
        bus.write32(table + page * 4, ((page << 12) as u32) | 0x007);
    }

    assert_eq!(cpu.step(&mut bus), StepResult::CpuInterrupt(14));
    // error code: protection violation (P) + write
    let sp = cpu.register_get32(gpr::SP) as u64;
    assert_eq!(bus.read32(sp), 0b011);
}

#[test]
fn test_v33_expanded_address_mode() {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::V33, CpuSubtype::Classic));
    let mut bus = RamBus::new();
    // page register 2 maps linear 0x8000..0xBFFF to physical page 0x3C
    cpu.v33_pgr[2] = 0x3C;
    cpu.v33_xam = 0x01;
    let (physical, run) = cpu.page_translate(&mut bus, 0x8004, false, false, false).unwrap();
    assert_eq!(physical, (0x3C << 14) + 4);
    assert_eq!(run, 0x4000 - 4);

    // without XA the V33 is a straight 20-bit machine
    cpu.v33_xam = 0;
    let (physical, _) = cpu.page_translate(&mut bus, 0xF_0004, false, false, false).unwrap();
    assert_eq!(physical, 0xF_0004);
}
