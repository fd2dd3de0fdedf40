//! 8080/8085/Z80 submachine
//!
//! Certain CPU variants (V20 → 8080, µPD9002 → Z80) embed an emulation
//! mode where the 8-bit machine shares the x86 register file:
//!
//! ```text
//! A ↔ AL    F ↔ FLAGS[7:0]   BC ↔ CX   DE ↔ DX   HL ↔ BX
//! PC ↔ IP   SP ↔ BP          IX ↔ SI   IY ↔ DI   IFF1 ↔ IF
//! ```
//!
//! Memory goes through DS; the register synchronization lives in
//! [`crate::regs`]. The same execution core also drives a *separate*
//! 8080/Z80 with its own [`crate::bus::X80Bus`].

mod execute;

pub use execute::{execute, Outcome};

use crate::bus::X80Bus;
use crate::exception::Fallible;
use crate::regs::flags;

/// Which 8-bit processor is being modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum X80CpuType {
    #[default]
    I80,
    I85,
    Z80,
}

/// Emulated (sharing the x86 registers) or a separate part on its own bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum X80Method {
    #[default]
    Emulated,
    Separate,
}

/// Index register prefix state (Z80 DD/FD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexPrefix {
    #[default]
    None,
    Ix,
    Iy,
}

/// One AF/BC/DE/HL register bank; the Z80 keeps two and exchanges them
/// with EX AF,AF' and EXX.
#[derive(Debug, Clone, Copy, Default)]
pub struct X80Bank {
    pub af: u16,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
}

/// 8080/8085/Z80 machine state.
#[derive(Debug, Clone, Default)]
pub struct X80 {
    pub cpu_type: X80CpuType,
    pub method: X80Method,
    pub bank: [X80Bank; 2],
    /// Active AF bank (EX AF,AF').
    pub af_bank: usize,
    /// Active BC/DE/HL bank (EXX).
    pub main_bank: usize,
    pub ix: u16,
    pub iy: u16,
    pub sp: u16,
    pub pc: u16,
    /// Interrupt vector base (I register).
    pub i: u16,
    /// Refresh counter (bit 7 preserved).
    pub r: u8,
    pub iff1: bool,
    pub iff2: bool,
    pub im: u8,
    /// 8085 RST mask bits (set = masked).
    pub m5_5: bool,
    pub m6_5: bool,
    pub m7_5: bool,
    pub halted: bool,
    /// IM0 instruction bytes injected by the interrupting peripheral.
    pub peripheral_data: Vec<u8>,
    pub peripheral_pointer: usize,
}

impl X80 {
    pub fn reset(&mut self, hard: bool) {
        self.pc = 0;
        self.iff1 = false;
        self.iff2 = false;
        self.i = 0;
        self.r = 0;
        self.im = 0;
        self.af_bank = 0;
        self.main_bank = 0;
        self.m5_5 = true;
        self.m6_5 = true;
        self.m7_5 = true;
        self.halted = false;
        self.peripheral_data.clear();
        self.peripheral_pointer = 0;
        if hard {
            self.bank = [X80Bank::default(); 2];
            self.ix = 0;
            self.iy = 0;
            self.sp = 0;
        }
    }

    // ========== Register Accessors ==========

    pub fn a(&self) -> u8 {
        (self.bank[self.af_bank].af >> 8) as u8
    }

    pub fn set_a(&mut self, value: u8) {
        let af = &mut self.bank[self.af_bank].af;
        *af = (*af & 0x00FF) | (u16::from(value) << 8);
    }

    pub fn f(&self) -> u8 {
        self.bank[self.af_bank].af as u8
    }

    pub fn set_f(&mut self, value: u8) {
        let af = &mut self.bank[self.af_bank].af;
        *af = (*af & 0xFF00) | u16::from(value);
    }

    pub fn flag(&self, bit: u64) -> bool {
        u64::from(self.f()) & bit != 0
    }

    pub fn set_flag(&mut self, bit: u64, value: bool) {
        let f = self.f();
        self.set_f(if value { f | bit as u8 } else { f & !(bit as u8) });
    }

    pub fn hl(&self) -> u16 {
        self.bank[self.main_bank].hl
    }

    /// HL, or the active index register under a DD/FD prefix.
    pub fn hl_indexed(&self, prefix: IndexPrefix) -> u16 {
        match prefix {
            IndexPrefix::None => self.hl(),
            IndexPrefix::Ix => self.ix,
            IndexPrefix::Iy => self.iy,
        }
    }

    pub fn set_hl_indexed(&mut self, prefix: IndexPrefix, value: u16) {
        match prefix {
            IndexPrefix::None => self.bank[self.main_bank].hl = value,
            IndexPrefix::Ix => self.ix = value,
            IndexPrefix::Iy => self.iy = value,
        }
    }

    /// 16-bit register pair by index (0=BC, 1=DE, 2=HL/IX/IY, 3=SP).
    pub fn rp(&self, index: u8, prefix: IndexPrefix) -> u16 {
        match index & 3 {
            0 => self.bank[self.main_bank].bc,
            1 => self.bank[self.main_bank].de,
            2 => self.hl_indexed(prefix),
            _ => self.sp,
        }
    }

    pub fn set_rp(&mut self, index: u8, prefix: IndexPrefix, value: u16) {
        match index & 3 {
            0 => self.bank[self.main_bank].bc = value,
            1 => self.bank[self.main_bank].de = value,
            2 => self.set_hl_indexed(prefix, value),
            _ => self.sp = value,
        }
    }

    /// PUSH/POP register pair by index (0=BC, 1=DE, 2=HL/IX/IY, 3=AF).
    pub fn rp2(&self, index: u8, prefix: IndexPrefix) -> u16 {
        match index & 3 {
            0 => self.bank[self.main_bank].bc,
            1 => self.bank[self.main_bank].de,
            2 => self.hl_indexed(prefix),
            _ => self.bank[self.af_bank].af,
        }
    }

    pub fn set_rp2(&mut self, index: u8, prefix: IndexPrefix, value: u16) {
        match index & 3 {
            0 => self.bank[self.main_bank].bc = value,
            1 => self.bank[self.main_bank].de = value,
            2 => self.set_hl_indexed(prefix, value),
            _ => self.bank[self.af_bank].af = value,
        }
    }

    /// Condition code check (0=NZ, 1=Z, 2=NC, 3=C, 4=PO, 5=PE, 6=P, 7=M).
    pub fn check_cc(&self, cc: u8) -> bool {
        match cc & 7 {
            0 => !self.flag(flags::ZF),
            1 => self.flag(flags::ZF),
            2 => !self.flag(flags::CF),
            3 => self.flag(flags::CF),
            4 => !self.flag(flags::PF),
            5 => self.flag(flags::PF),
            6 => !self.flag(flags::SF),
            _ => self.flag(flags::SF),
        }
    }

    /// Bump the refresh counter the way the silicon does: bit 7 sticks.
    pub fn bump_r(&mut self) {
        self.r = (self.r & 0x80) | (self.r.wrapping_add(1) & 0x7F);
    }
}

/// Memory and port access abstraction shared by the emulated and separate
/// operation modes. Emulated accesses route through the x86 DS segment and
/// can fault; separate-bus accesses cannot.
pub trait X80Mem {
    fn fetch8(&mut self, address: u16) -> Fallible<u8>;
    fn read8(&mut self, address: u16) -> Fallible<u8>;
    fn write8(&mut self, address: u16, value: u8) -> Fallible<()>;
    fn input8(&mut self, port: u16) -> Fallible<u8>;
    fn output8(&mut self, port: u16, value: u8) -> Fallible<()>;

    fn read16(&mut self, address: u16) -> Fallible<u16> {
        let low = self.read8(address)?;
        let high = self.read8(address.wrapping_add(1))?;
        Ok(u16::from(low) | (u16::from(high) << 8))
    }

    fn write16(&mut self, address: u16, value: u16) -> Fallible<()> {
        self.write8(address, value as u8)?;
        self.write8(address.wrapping_add(1), (value >> 8) as u8)
    }
}

/// Adapter running a separate 8080/Z80 over its host bus.
pub struct SeparateBus<'a> {
    pub bus: &'a mut dyn X80Bus,
}

impl X80Mem for SeparateBus<'_> {
    fn fetch8(&mut self, address: u16) -> Fallible<u8> {
        let mut byte = [0u8];
        self.bus.memory_fetch(address, &mut byte);
        Ok(byte[0])
    }

    fn read8(&mut self, address: u16) -> Fallible<u8> {
        let mut byte = [0u8];
        self.bus.memory_read(address, &mut byte);
        Ok(byte[0])
    }

    fn write8(&mut self, address: u16, value: u8) -> Fallible<()> {
        self.bus.memory_write(address, &[value]);
        Ok(())
    }

    fn input8(&mut self, port: u16) -> Fallible<u8> {
        Ok(self.bus.port_read(port))
    }

    fn output8(&mut self, port: u16, value: u8) -> Fallible<()> {
        self.bus.port_write(port, value);
        Ok(())
    }
}

/// Interrupt delivery for a separate 8080/Z80.
pub fn hardware_interrupt(
    state: &mut X80,
    mem: &mut dyn X80Mem,
    line: crate::interrupt::InterruptLine,
    data: &[u8],
) -> bool {
    use crate::interrupt::InterruptLine;

    fn push16(state: &mut X80, mem: &mut dyn X80Mem, value: u16) -> bool {
        state.sp = state.sp.wrapping_sub(2);
        mem.write16(state.sp, value).is_ok()
    }

    match line {
        InterruptLine::Intr(_) => {
            if !state.iff1 {
                return false;
            }
            match state.im {
                0 => {
                    if !state.peripheral_data.is_empty() {
                        return false;
                    }
                    state.peripheral_data = data.to_vec();
                    state.peripheral_pointer = 0;
                }
                1 => {
                    let pc = state.pc;
                    if !push16(state, mem, pc) {
                        return false;
                    }
                    state.pc = 0x0038;
                }
                _ => {
                    if data.is_empty() {
                        return false;
                    }
                    let pc = state.pc;
                    if !push16(state, mem, pc) {
                        return false;
                    }
                    let slot = (state.i << 8) | u16::from(data[0]);
                    match mem.read16(slot) {
                        Ok(target) => state.pc = target,
                        Err(_) => return false,
                    }
                }
            }
            state.iff1 = false;
            state.iff2 = false;
            state.halted = false;
            true
        }
        InterruptLine::Nmi => match state.cpu_type {
            X80CpuType::I85 => {
                let pc = state.pc;
                if !push16(state, mem, pc) {
                    return false;
                }
                state.pc = 0x0024;
                state.iff1 = false;
                state.halted = false;
                true
            }
            X80CpuType::Z80 => {
                state.iff2 = state.iff1;
                let pc = state.pc;
                if !push16(state, mem, pc) {
                    return false;
                }
                state.pc = 0x0066;
                state.iff1 = false;
                state.halted = false;
                true
            }
            // the 8080 has no NMI pin
            X80CpuType::I80 => false,
        },
        InterruptLine::Rst75 | InterruptLine::Rst65 | InterruptLine::Rst55 => {
            if state.cpu_type != X80CpuType::I85 || !state.iff1 {
                return false;
            }
            let (masked, target) = match line {
                InterruptLine::Rst75 => (state.m7_5, 0x003C),
                InterruptLine::Rst65 => (state.m6_5, 0x0034),
                _ => (state.m5_5, 0x002C),
            };
            if masked {
                return false;
            }
            let pc = state.pc;
            if !push16(state, mem, pc) {
                return false;
            }
            state.pc = target;
            state.iff1 = false;
            state.halted = false;
            true
        }
        _ => false,
    }
}
