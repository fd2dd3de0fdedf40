//! 8089 I/O processor: attention protocol, task-block execution and the
//! DMA transfer engine.

mod common;

use common::RamBus;
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::x89::{CC_F0, CC_F1, CC_TBC_SHIFT, PSW_XF, R_BC, R_CC, R_GA, R_GB, R_TP};
use x86_core::Cpu;

fn iop_cpu() -> (Cpu, RamBus) {
    let mut cpu = Cpu::new(CpuTraits::new(CpuFamily::I8086, CpuSubtype::Classic));
    cpu.x89.present = true;
    (cpu, RamBus::new())
}

/// Lay down the configuration chain: SYSBUS/SCB pointer at 0xFFFF6, SCB
/// at 0x200, channel control block at 0x400.
fn initialize(cpu: &mut Cpu, bus: &mut RamBus) {
    bus.write16(0xFFFF6, 0x0001); // sysbus
    bus.write16(0xFFFF8, 0x0200); // scb offset
    bus.write16(0xFFFFA, 0x0000); // scb segment
    bus.write16(0x0200, 0x0001); // soc
    bus.write16(0x0202, 0x0400); // cb offset
    bus.write16(0x0204, 0x0000); // cb segment
    cpu.x89_channel_attention(bus);
    assert!(cpu.x89.initialized);
    assert_eq!(cpu.x89.cp, 0x0400);
}

#[test]
fn test_first_attention_initializes() {
    let (mut cpu, mut bus) = iop_cpu();
    initialize(&mut cpu, &mut bus);
    // channel 0 busy byte cleared
    assert_eq!(bus.read8(0x0400), 0x00);
    assert!(!cpu.x89.channel[0].running);
}

#[test]
fn test_start_channel_and_run_program() {
    let (mut cpu, mut bus) = iop_cpu();
    initialize(&mut cpu, &mut bus);

    // CCW 3: start channel 0 in system space; parameter block at 0x500
    bus.load(0x0400, &[0x03]);
    bus.write16(0x0402, 0x0500);
    bus.write16(0x0404, 0x0000);
    // task block pointer inside the parameter block -> 0x600
    bus.write16(0x0500, 0x0600);
    bus.write16(0x0502, 0x0000);
    // program: MOVI GA, 0x1234 (opc 0x0C, reg GA, wide, 16-bit immediate)
    let movi = (0x0Cu16 << 10) | (0 << 5) | (2 << 3) | 1;
    bus.write16(0x0600, movi);
    bus.write16(0x0602, 0x1234);
    // then HLT (opc 0x3F)
    bus.write16(0x0604, 0x3F << 10);

    cpu.x89_channel_attention(&mut bus);
    assert!(cpu.x89.channel[0].running);
    assert_eq!(cpu.x89.channel[0].r[R_TP].address, 0x0600);

    cpu.iop_step(&mut bus);
    assert_eq!(cpu.x89.channel[0].r[R_GA].address, 0x1234);
    cpu.iop_step(&mut bus);
    assert!(!cpu.x89.channel[0].running);
    assert_eq!(bus.read8(0x0400), 0x00);
}

#[test]
fn test_transfer_engine_memory_to_memory() {
    let (mut cpu, mut bus) = iop_cpu();
    initialize(&mut cpu, &mut bus);

    let channel = &mut cpu.x89.channel[0];
    channel.running = true;
    channel.psw = PSW_XF; // byte source and destination
    channel.r[R_GA].address = 0x1000;
    channel.r[R_GA].tag = false;
    channel.r[R_GB].address = 0x2000;
    channel.r[R_GB].tag = false;
    // source GA, post-increment both, terminate on BC = 0 (offset 0)
    channel.r[R_CC].address = u32::from(CC_F0 | CC_F1 | (1 << CC_TBC_SHIFT));
    channel.r[R_BC].address = 3;
    bus.load(0x1000, b"abc");

    for _ in 0..3 {
        cpu.iop_step(&mut bus);
        assert_ne!(cpu.x89.channel[0].psw & PSW_XF, 0);
    }
    // the fourth step sees BC == 0 and stops the transfer
    cpu.iop_step(&mut bus);
    assert_eq!(cpu.x89.channel[0].psw & PSW_XF, 0);
    assert_eq!(&[bus.read8(0x2000), bus.read8(0x2001), bus.read8(0x2002)], b"abc");
    assert_eq!(cpu.x89.channel[0].r[R_GA].address, 0x1003);
    assert_eq!(cpu.x89.channel[0].r[R_BC].address & 0xFFFF, 0);
}

#[test]
fn test_transfer_to_io_space() {
    let (mut cpu, mut bus) = iop_cpu();
    initialize(&mut cpu, &mut bus);

    let channel = &mut cpu.x89.channel[0];
    channel.running = true;
    channel.psw = PSW_XF;
    channel.r[R_GA].address = 0x1000;
    channel.r[R_GA].tag = false;
    channel.r[R_GB].address = 0x60; // port
    channel.r[R_GB].tag = true;
    channel.r[R_CC].address = u32::from(CC_F0 | (1 << CC_TBC_SHIFT));
    channel.r[R_BC].address = 2;
    bus.load(0x1000, &[0x11, 0x22]);

    cpu.iop_step(&mut bus);
    cpu.iop_step(&mut bus);
    assert_eq!(bus.ports[&0x60], 0x22); // both bytes went to the same port
}

#[test]
fn test_halt_ccw_saves_state() {
    let (mut cpu, mut bus) = iop_cpu();
    initialize(&mut cpu, &mut bus);

    cpu.x89.channel[0].running = true;
    cpu.x89.channel[0].pp = 0x0500;
    cpu.x89.channel[0].r[R_TP].address = 0x0678;
    cpu.x89.channel[0].r[R_TP].tag = true;
    cpu.x89.channel[0].psw = 0x42;

    // CCW 6: halt and save TP/PSW into the parameter block
    bus.load(0x0400, &[0x06]);
    cpu.x89_channel_attention(&mut bus);
    assert!(!cpu.x89.channel[0].running);
    assert_eq!(bus.read16(0x0500), 0x0678);
    assert_eq!(bus.read8(0x0502) & 0x08, 0x08); // tag bit
    assert_eq!(bus.read8(0x0503), 0x42); // psw
}
