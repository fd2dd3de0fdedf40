//! 8080/Z80 submachine: separate-bus operation and interrupt modes.

use x86_core::bus::X80Bus;
use x86_core::interrupt::InterruptLine;
use x86_core::x80::{self, Outcome, SeparateBus, X80, X80CpuType, X80Method};

struct FlatBus {
    memory: Vec<u8>,
    ports: Vec<u8>,
}

impl FlatBus {
    fn new() -> Self {
        Self {
            memory: vec![0; 0x10000],
            ports: vec![0xFF; 0x10000],
        }
    }

    fn load(&mut self, address: u16, bytes: &[u8]) {
        let address = usize::from(address);
        self.memory[address..address + bytes.len()].copy_from_slice(bytes);
    }
}

impl X80Bus for FlatBus {
    fn memory_fetch(&mut self, address: u16, buffer: &mut [u8]) {
        self.memory_read(address, buffer);
    }

    fn memory_read(&mut self, address: u16, buffer: &mut [u8]) {
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = self.memory[usize::from(address.wrapping_add(i as u16))];
        }
    }

    fn memory_write(&mut self, address: u16, buffer: &[u8]) {
        for (i, &byte) in buffer.iter().enumerate() {
            self.memory[usize::from(address.wrapping_add(i as u16))] = byte;
        }
    }

    fn port_read(&mut self, port: u16) -> u8 {
        self.ports[usize::from(port) & 0xFF]
    }

    fn port_write(&mut self, port: u16, value: u8) {
        self.ports[usize::from(port) & 0xFF] = value;
    }
}

fn z80(code: &[u8]) -> (X80, FlatBus) {
    let mut state = X80 {
        cpu_type: X80CpuType::Z80,
        method: X80Method::Separate,
        ..X80::default()
    };
    state.sp = 0xF000;
    let mut bus = FlatBus::new();
    bus.load(0, code);
    (state, bus)
}

fn run(state: &mut X80, bus: &mut FlatBus, steps: usize) {
    for _ in 0..steps {
        let mut adapter = SeparateBus { bus };
        x80::execute(state, &mut adapter).unwrap();
    }
}

#[test]
fn test_ld_and_alu() {
    // ld a, 0x15; ld b, 0x27; add a, b
    let (mut state, mut bus) = z80(&[0x3E, 0x15, 0x06, 0x27, 0x80]);
    run(&mut state, &mut bus, 3);
    assert_eq!(state.a(), 0x3C);
    assert!(!state.flag(x86_core::regs::flags::CF));
    assert!(!state.flag(x86_core::regs::flags::ZF));
}

#[test]
fn test_memory_and_hl() {
    // ld hl, 0x4000; ld (hl), 0x5A; ld a, (hl)
    let (mut state, mut bus) = z80(&[0x21, 0x00, 0x40, 0x36, 0x5A, 0x7E]);
    run(&mut state, &mut bus, 3);
    assert_eq!(bus.memory[0x4000], 0x5A);
    assert_eq!(state.a(), 0x5A);
}

#[test]
fn test_push_pop_and_call_ret() {
    // ld bc, 0x1234; push bc; pop de
    let (mut state, mut bus) = z80(&[0x01, 0x34, 0x12, 0xC5, 0xD1]);
    run(&mut state, &mut bus, 3);
    assert_eq!(state.bank[0].de, 0x1234);
    assert_eq!(state.sp, 0xF000);

    // call 0x0010; ... at 0x0010: ret
    let (mut state, mut bus) = z80(&[0xCD, 0x10, 0x00]);
    bus.load(0x0010, &[0xC9]);
    run(&mut state, &mut bus, 1);
    assert_eq!(state.pc, 0x0010);
    run(&mut state, &mut bus, 1);
    assert_eq!(state.pc, 0x0003);
}

#[test]
fn test_djnz_and_jr() {
    // ld b, 3; (loop): djnz loop
    let (mut state, mut bus) = z80(&[0x06, 0x03, 0x10, 0xFE]);
    run(&mut state, &mut bus, 3); // ld + 2 taken djnz
    assert_eq!(state.bank[0].bc >> 8, 1);
    assert_eq!(state.pc, 0x0002);
    run(&mut state, &mut bus, 1); // final djnz falls through
    assert_eq!(state.pc, 0x0004);
}

#[test]
fn test_exx_and_ex_af() {
    // ld a, 1; ex af, af'; ld a, 2; ex af, af'
    let (mut state, mut bus) = z80(&[0x3E, 0x01, 0x08, 0x3E, 0x02, 0x08]);
    run(&mut state, &mut bus, 6);
    assert_eq!(state.a(), 1);
    assert_eq!(state.bank[1].af >> 8, 2);
}

#[test]
fn test_cb_bit_operations() {
    // ld a, 0x02; bit 1, a; set 7, a; res 1, a
    let (mut state, mut bus) = z80(&[0x3E, 0x02, 0xCB, 0x4F, 0xCB, 0xFF, 0xCB, 0x8F]);
    run(&mut state, &mut bus, 2);
    assert!(!state.flag(x86_core::regs::flags::ZF)); // bit set
    run(&mut state, &mut bus, 2);
    assert_eq!(state.a(), 0x80);
}

#[test]
fn test_indexed_addressing() {
    // ld ix, 0x4000; ld (ix+2), 0x77
    let (mut state, mut bus) = z80(&[0xDD, 0x21, 0x00, 0x40, 0xDD, 0x36, 0x02, 0x77]);
    run(&mut state, &mut bus, 2);
    assert_eq!(state.ix, 0x4000);
    assert_eq!(bus.memory[0x4002], 0x77);
}

#[test]
fn test_ldir_block_copy() {
    // ld hl, 0x1000; ld de, 0x2000; ld bc, 4; ldir
    let (mut state, mut bus) = z80(&[
        0x21, 0x00, 0x10, 0x11, 0x00, 0x20, 0x01, 0x04, 0x00, 0xED, 0xB0,
    ]);
    bus.load(0x1000, b"wxyz");
    run(&mut state, &mut bus, 3);
    // each LDIR iteration is one step
    run(&mut state, &mut bus, 4);
    assert_eq!(&bus.memory[0x2000..0x2004], b"wxyz");
    assert_eq!(state.bank[0].bc, 0);
    assert_eq!(state.pc, 0x000B);
}

#[test]
fn test_io_ports() {
    // ld a, 0x42; out (0x10), a; in a, (0x20)
    let (mut state, mut bus) = z80(&[0x3E, 0x42, 0xD3, 0x10, 0xDB, 0x20]);
    bus.ports[0x20] = 0x99;
    run(&mut state, &mut bus, 3);
    assert_eq!(bus.ports[0x10], 0x42);
    assert_eq!(state.a(), 0x99);
}

#[test]
fn test_im1_interrupt() {
    // ei; im 1; halt
    let (mut state, mut bus) = z80(&[0xFB, 0xED, 0x56, 0x76]);
    run(&mut state, &mut bus, 3);
    assert!(state.halted);
    let mut adapter = SeparateBus { bus: &mut bus };
    let accepted = x80::hardware_interrupt(&mut state, &mut adapter, InterruptLine::Intr(0), &[]);
    assert!(accepted);
    assert_eq!(state.pc, 0x0038);
    assert!(!state.iff1);
    assert!(!state.halted);
}

#[test]
fn test_im2_vector_table() {
    let (mut state, mut bus) = z80(&[0xFB, 0xED, 0x5E, 0x76]); // ei; im 2; halt
    run(&mut state, &mut bus, 3);
    state.i = 0x30;
    bus.load(0x3040, &[0x00, 0x50]); // vector slot -> 0x5000
    let mut adapter = SeparateBus { bus: &mut bus };
    let accepted =
        x80::hardware_interrupt(&mut state, &mut adapter, InterruptLine::Intr(0), &[0x40]);
    assert!(accepted);
    assert_eq!(state.pc, 0x5000);
}

#[test]
fn test_nmi_stashes_iff1() {
    let (mut state, mut bus) = z80(&[0xFB, 0x00]); // ei; nop
    run(&mut state, &mut bus, 2);
    assert!(state.iff1);
    let mut adapter = SeparateBus { bus: &mut bus };
    let accepted = x80::hardware_interrupt(&mut state, &mut adapter, InterruptLine::Nmi, &[]);
    assert!(accepted);
    assert_eq!(state.pc, 0x0066);
    assert!(!state.iff1);
    assert!(state.iff2); // old IFF1 preserved for RETN
}

#[test]
fn test_halt_outcome() {
    let (mut state, mut bus) = z80(&[0x76]);
    let mut adapter = SeparateBus { bus: &mut bus };
    assert_eq!(x80::execute(&mut state, &mut adapter).unwrap(), Outcome::Halt);
    assert!(state.halted);
}

#[test]
fn test_daa_bcd() {
    // ld a, 0x09; add a, 0x01; daa -> 0x10
    let (mut state, mut bus) = z80(&[0x3E, 0x09, 0xC6, 0x01, 0x27]);
    run(&mut state, &mut bus, 3);
    assert_eq!(state.a(), 0x10);
}
