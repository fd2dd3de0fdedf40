//! 8080/8085/Z80 instruction execution
//!
//! One instruction per call, decoded with the x-y-z-p-q decomposition of
//! the opcode byte:
//!
//! ```text
//! x = opcode[7:6]   y = opcode[5:3]   z = opcode[2:0]
//! p = y[2:1]        q = y[0]
//! ```
//!
//! The Z80-only pages (CB/ED/DD/FD) decode as their 8080 aliases on the
//! 8080/8085. The V20 emulation-mode escapes (ED ED = CALLN, ED FD =
//! RETEM) are reported through [`Outcome`] so the embedding x86 can act on
//! them after the register files are synchronized.

use super::{IndexPrefix, X80, X80CpuType, X80Mem};
use crate::exception::Fallible;
use crate::regs::flags;

/// What the instruction asked of the embedding processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Normal,
    Halt,
    /// V20 CALLN n: deliver INT n on the x86 side.
    Calln(u8),
    /// V20 RETEM: leave emulation mode.
    Retem,
}

// Z80 flag aliases over the shared bit positions.
const FL_C: u64 = flags::CF;
const FL_N: u64 = flags::IBRK; // bit 1 is N on the Z80
const FL_PV: u64 = flags::PF;
const FL_X3: u64 = flags::F0;
const FL_H: u64 = flags::AF;
const FL_X5: u64 = flags::F1;
const FL_Z: u64 = flags::ZF;
const FL_S: u64 = flags::SF;

fn parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}

struct Ctx<'a> {
    st: &'a mut X80,
    mem: &'a mut dyn X80Mem,
    prefix: IndexPrefix,
    /// Displacement fetched for (IX+d)/(IY+d) operands.
    displacement: i8,
}

impl Ctx<'_> {
    fn fetch8(&mut self) -> Fallible<u8> {
        if self.st.peripheral_pointer < self.st.peripheral_data.len() {
            // IM0: the interrupting peripheral injects the opcode stream
            let byte = self.st.peripheral_data[self.st.peripheral_pointer];
            self.st.peripheral_pointer += 1;
            if self.st.peripheral_pointer == self.st.peripheral_data.len() {
                self.st.peripheral_data.clear();
                self.st.peripheral_pointer = 0;
            }
            return Ok(byte);
        }
        let pc = self.st.pc;
        self.st.pc = pc.wrapping_add(1);
        self.mem.fetch8(pc)
    }

    fn fetch16(&mut self) -> Fallible<u16> {
        let low = self.fetch8()?;
        let high = self.fetch8()?;
        Ok(u16::from(low) | (u16::from(high) << 8))
    }

    fn is_z80(&self) -> bool {
        self.st.cpu_type == X80CpuType::Z80
    }

    fn indexed_address(&self) -> u16 {
        match self.prefix {
            IndexPrefix::None => self.st.hl(),
            IndexPrefix::Ix => self.st.ix.wrapping_add(self.displacement as u16),
            IndexPrefix::Iy => self.st.iy.wrapping_add(self.displacement as u16),
        }
    }

    /// Fetch the displacement byte when an indexed memory operand is about
    /// to be used.
    fn load_displacement(&mut self) -> Fallible<()> {
        if self.prefix != IndexPrefix::None {
            self.displacement = self.fetch8()? as i8;
        }
        Ok(())
    }

    /// 8-bit register by index: 0=B 1=C 2=D 3=E 4=H 5=L 6=(HL) 7=A, with
    /// DD/FD remapping H/L/(HL) to the index register halves.
    fn reg8(&mut self, index: u8) -> Fallible<u8> {
        let bank = &self.st.bank[self.st.main_bank];
        Ok(match index & 7 {
            0 => (bank.bc >> 8) as u8,
            1 => bank.bc as u8,
            2 => (bank.de >> 8) as u8,
            3 => bank.de as u8,
            4 => (self.st.hl_indexed(self.prefix) >> 8) as u8,
            5 => self.st.hl_indexed(self.prefix) as u8,
            6 => {
                let address = self.indexed_address();
                self.mem.read8(address)?
            }
            _ => self.st.a(),
        })
    }

    fn set_reg8(&mut self, index: u8, value: u8) -> Fallible<()> {
        let bank = &mut self.st.bank[self.st.main_bank];
        match index & 7 {
            0 => bank.bc = (bank.bc & 0x00FF) | (u16::from(value) << 8),
            1 => bank.bc = (bank.bc & 0xFF00) | u16::from(value),
            2 => bank.de = (bank.de & 0x00FF) | (u16::from(value) << 8),
            3 => bank.de = (bank.de & 0xFF00) | u16::from(value),
            4 => {
                let hl = self.st.hl_indexed(self.prefix);
                self.st
                    .set_hl_indexed(self.prefix, (hl & 0x00FF) | (u16::from(value) << 8));
            }
            5 => {
                let hl = self.st.hl_indexed(self.prefix);
                self.st
                    .set_hl_indexed(self.prefix, (hl & 0xFF00) | u16::from(value));
            }
            6 => {
                let address = self.indexed_address();
                self.mem.write8(address, value)?;
            }
            _ => self.st.set_a(value),
        }
        Ok(())
    }

    fn push16(&mut self, value: u16) -> Fallible<()> {
        self.st.sp = self.st.sp.wrapping_sub(2);
        self.mem.write16(self.st.sp, value)
    }

    fn pop16(&mut self) -> Fallible<u16> {
        let value = self.mem.read16(self.st.sp)?;
        self.st.sp = self.st.sp.wrapping_add(2);
        Ok(value)
    }

    // ========== Flag Helpers ==========

    fn set_sz(&mut self, result: u8) {
        self.st.set_flag(FL_Z, result == 0);
        self.st.set_flag(FL_S, result & 0x80 != 0);
        if self.is_z80() {
            self.st.set_flag(FL_X3, result & FL_X3 as u8 != 0);
            self.st.set_flag(FL_X5, result & FL_X5 as u8 != 0);
        }
    }

    /// P/V is overflow for add/sub on the Z80, parity on the 8080/8085.
    fn set_pv_arith(&mut self, overflow: bool, result: u8) {
        if self.is_z80() {
            self.st.set_flag(FL_PV, overflow);
        } else {
            self.st.set_flag(FL_PV, parity(result));
        }
    }

    // ========== ALU ==========

    fn alu_add(&mut self, value: u8, carry: bool) {
        let a = self.st.a();
        let c = u16::from(carry && self.st.flag(FL_C));
        let result = u16::from(a) + u16::from(value) + c;
        let half = (a & 0x0F) + (value & 0x0F) + c as u8 > 0x0F;
        let overflow = (a ^ value) & 0x80 == 0 && (a ^ result as u8) & 0x80 != 0;
        self.st.set_a(result as u8);
        self.set_sz(result as u8);
        self.st.set_flag(FL_C, result > 0xFF);
        self.st.set_flag(FL_H, half);
        self.set_pv_arith(overflow, result as u8);
        self.st.set_flag(FL_N, false);
    }

    fn alu_sub(&mut self, value: u8, carry: bool, store: bool) {
        let a = self.st.a();
        let c = u16::from(carry && self.st.flag(FL_C));
        let result = u16::from(a).wrapping_sub(u16::from(value)).wrapping_sub(c);
        let half = (a & 0x0F) < (value & 0x0F) + c as u8;
        let overflow = (a ^ value) & 0x80 != 0 && (a ^ result as u8) & 0x80 != 0;
        if store {
            self.st.set_a(result as u8);
        }
        self.set_sz(result as u8);
        self.st.set_flag(FL_C, result > 0xFF);
        self.st.set_flag(FL_H, half);
        self.set_pv_arith(overflow, result as u8);
        self.st.set_flag(FL_N, true);
    }

    fn alu_logic(&mut self, index: u8, value: u8) {
        let result = match index {
            4 => self.st.a() & value,
            5 => self.st.a() ^ value,
            _ => self.st.a() | value,
        };
        self.st.set_a(result);
        self.set_sz(result);
        self.st.set_flag(FL_C, false);
        self.st.set_flag(FL_H, index == 4);
        self.st.set_flag(FL_PV, parity(result));
        self.st.set_flag(FL_N, false);
    }

    fn alu(&mut self, index: u8, value: u8) {
        match index & 7 {
            0 => self.alu_add(value, false),
            1 => self.alu_add(value, true),
            2 => self.alu_sub(value, false, true),
            3 => self.alu_sub(value, true, true),
            4 | 5 | 6 => self.alu_logic(index & 7, value),
            _ => self.alu_sub(value, false, false),
        }
    }

    fn alu_inc(&mut self, value: u8) -> u8 {
        let result = value.wrapping_add(1);
        self.set_sz(result);
        self.st.set_flag(FL_H, value & 0x0F == 0x0F);
        self.set_pv_arith(value == 0x7F, result);
        self.st.set_flag(FL_N, false);
        result
    }

    fn alu_dec(&mut self, value: u8) -> u8 {
        let result = value.wrapping_sub(1);
        self.set_sz(result);
        self.st.set_flag(FL_H, value & 0x0F == 0);
        self.set_pv_arith(value == 0x80, result);
        self.st.set_flag(FL_N, true);
        result
    }

    fn add16(&mut self, a: u16, b: u16, carry: i32) -> u16 {
        // ADD HL,rp / ADC HL,rp / SBC HL,rp depending on carry sense
        match carry {
            0 => {
                let result = u32::from(a) + u32::from(b);
                self.st.set_flag(FL_H, (a & 0x0FFF) + (b & 0x0FFF) > 0x0FFF);
                self.st.set_flag(FL_C, result > 0xFFFF);
                self.st.set_flag(FL_N, false);
                result as u16
            }
            1 => {
                let c = u32::from(self.st.flag(FL_C));
                let result = u32::from(a) + u32::from(b) + c;
                self.st.set_flag(FL_H, (a & 0x0FFF) + (b & 0x0FFF) + c as u16 > 0x0FFF);
                self.st.set_flag(FL_C, result > 0xFFFF);
                self.st
                    .set_flag(FL_PV, (a ^ b) & 0x8000 == 0 && (a ^ result as u16) & 0x8000 != 0);
                self.st.set_flag(FL_N, false);
                self.st.set_flag(FL_Z, result as u16 == 0);
                self.st.set_flag(FL_S, result & 0x8000 != 0);
                result as u16
            }
            _ => {
                let c = u32::from(self.st.flag(FL_C));
                let result = u32::from(a).wrapping_sub(u32::from(b)).wrapping_sub(c);
                self.st.set_flag(FL_H, (a & 0x0FFF) < (b & 0x0FFF) + c as u16);
                self.st.set_flag(FL_C, result > 0xFFFF);
                self.st
                    .set_flag(FL_PV, (a ^ b) & 0x8000 != 0 && (a ^ result as u16) & 0x8000 != 0);
                self.st.set_flag(FL_N, true);
                self.st.set_flag(FL_Z, result as u16 == 0);
                self.st.set_flag(FL_S, result & 0x8000 != 0);
                result as u16
            }
        }
    }

    // ========== Rotates and Shifts ==========

    fn rotate(&mut self, operation: u8, value: u8) -> u8 {
        let carry_in = self.st.flag(FL_C);
        let (result, carry) = match operation & 7 {
            0 => (value.rotate_left(1), value & 0x80 != 0),
            1 => (value.rotate_right(1), value & 1 != 0),
            2 => ((value << 1) | u8::from(carry_in), value & 0x80 != 0),
            3 => ((value >> 1) | (u8::from(carry_in) << 7), value & 1 != 0),
            4 => (value << 1, value & 0x80 != 0),
            5 => ((value >> 1) | (value & 0x80), value & 1 != 0),
            6 => ((value << 1) | 1, value & 0x80 != 0), // SLL (undocumented)
            _ => (value >> 1, value & 1 != 0),
        };
        self.set_sz(result);
        self.st.set_flag(FL_C, carry);
        self.st.set_flag(FL_H, false);
        self.st.set_flag(FL_N, false);
        self.st.set_flag(FL_PV, parity(result));
        result
    }

    fn daa(&mut self) {
        let a = self.st.a();
        let n = self.is_z80() && self.st.flag(FL_N);
        let mut correction = 0u8;
        let mut carry = self.st.flag(FL_C);
        if self.st.flag(FL_H) || a & 0x0F > 9 {
            correction |= 0x06;
        }
        if carry || a > 0x99 {
            correction |= 0x60;
            carry = true;
        }
        let result = if n { a.wrapping_sub(correction) } else { a.wrapping_add(correction) };
        let half = if n {
            self.st.flag(FL_H) && a & 0x0F < 6
        } else {
            a & 0x0F > 9
        };
        self.st.set_a(result);
        self.set_sz(result);
        self.st.set_flag(FL_C, carry);
        self.st.set_flag(FL_H, half);
        self.st.set_flag(FL_PV, parity(result));
    }

    // ========== Instruction Groups ==========

    fn execute_x0(&mut self, y: u8, z: u8, p: u8, q: u8) -> Fallible<Outcome> {
        match z {
            0 => match y {
                0 => {}
                1 if self.is_z80() => {
                    self.st.af_bank ^= 1;
                }
                2 if self.is_z80() => {
                    // DJNZ d
                    let d = self.fetch8()? as i8;
                    let bank = &mut self.st.bank[self.st.main_bank];
                    bank.bc = bank.bc.wrapping_sub(0x100);
                    if bank.bc & 0xFF00 != 0 {
                        self.st.pc = self.st.pc.wrapping_add(d as u16);
                    }
                }
                3 if self.is_z80() => {
                    let d = self.fetch8()? as i8;
                    self.st.pc = self.st.pc.wrapping_add(d as u16);
                }
                4..=7 if self.is_z80() => {
                    let d = self.fetch8()? as i8;
                    if self.st.check_cc(y - 4) {
                        self.st.pc = self.st.pc.wrapping_add(d as u16);
                    }
                }
                // 8085 RIM/SIM live at 0x20/0x30
                4 if self.st.cpu_type == X80CpuType::I85 => {
                    let mut value = 0u8;
                    if self.st.m5_5 {
                        value |= 0x01;
                    }
                    if self.st.m6_5 {
                        value |= 0x02;
                    }
                    if self.st.m7_5 {
                        value |= 0x04;
                    }
                    if self.st.iff1 {
                        value |= 0x08;
                    }
                    self.st.set_a(value);
                }
                6 if self.st.cpu_type == X80CpuType::I85 => {
                    let value = self.st.a();
                    if value & 0x08 != 0 {
                        self.st.m5_5 = value & 0x01 != 0;
                        self.st.m6_5 = value & 0x02 != 0;
                        self.st.m7_5 = value & 0x04 != 0;
                    }
                }
                _ => {} // 8080: all x=0 z=0 slots are NOPs
            },
            1 => {
                if q == 0 {
                    let value = self.fetch16()?;
                    self.st.set_rp(p, self.prefix, value);
                } else {
                    let hl = self.st.hl_indexed(self.prefix);
                    let rp = self.st.rp(p, self.prefix);
                    let result = self.add16(hl, rp, 0);
                    self.st.set_hl_indexed(self.prefix, result);
                }
            }
            2 => match (p, q) {
                (0, 0) => {
                    let address = self.st.bank[self.st.main_bank].bc;
                    let a = self.st.a();
                    self.mem.write8(address, a)?;
                }
                (1, 0) => {
                    let address = self.st.bank[self.st.main_bank].de;
                    let a = self.st.a();
                    self.mem.write8(address, a)?;
                }
                (2, 0) => {
                    let address = self.fetch16()?;
                    let value = self.st.hl_indexed(self.prefix);
                    self.mem.write16(address, value)?;
                }
                (3, 0) => {
                    let address = self.fetch16()?;
                    let a = self.st.a();
                    self.mem.write8(address, a)?;
                }
                (0, _) => {
                    let address = self.st.bank[self.st.main_bank].bc;
                    let value = self.mem.read8(address)?;
                    self.st.set_a(value);
                }
                (1, _) => {
                    let address = self.st.bank[self.st.main_bank].de;
                    let value = self.mem.read8(address)?;
                    self.st.set_a(value);
                }
                (2, _) => {
                    let address = self.fetch16()?;
                    let value = self.mem.read16(address)?;
                    self.st.set_hl_indexed(self.prefix, value);
                }
                _ => {
                    let address = self.fetch16()?;
                    let value = self.mem.read8(address)?;
                    self.st.set_a(value);
                }
            },
            3 => {
                let value = self.st.rp(p, self.prefix);
                let value = if q == 0 { value.wrapping_add(1) } else { value.wrapping_sub(1) };
                self.st.set_rp(p, self.prefix, value);
            }
            4 => {
                self.load_displacement()?;
                let value = self.reg8(y)?;
                let result = self.alu_inc(value);
                self.set_reg8(y, result)?;
            }
            5 => {
                self.load_displacement()?;
                let value = self.reg8(y)?;
                let result = self.alu_dec(value);
                self.set_reg8(y, result)?;
            }
            6 => {
                self.load_displacement()?;
                let value = self.fetch8()?;
                self.set_reg8(y, value)?;
            }
            _ => match y {
                0 => {
                    let a = self.st.a();
                    let carry = a & 0x80 != 0;
                    self.st.set_a(a.rotate_left(1));
                    self.st.set_flag(FL_C, carry);
                    self.st.set_flag(FL_H, false);
                    self.st.set_flag(FL_N, false);
                }
                1 => {
                    let a = self.st.a();
                    let carry = a & 1 != 0;
                    self.st.set_a(a.rotate_right(1));
                    self.st.set_flag(FL_C, carry);
                    self.st.set_flag(FL_H, false);
                    self.st.set_flag(FL_N, false);
                }
                2 => {
                    let a = self.st.a();
                    let carry = a & 0x80 != 0;
                    let result = (a << 1) | u8::from(self.st.flag(FL_C));
                    self.st.set_a(result);
                    self.st.set_flag(FL_C, carry);
                    self.st.set_flag(FL_H, false);
                    self.st.set_flag(FL_N, false);
                }
                3 => {
                    let a = self.st.a();
                    let carry = a & 1 != 0;
                    let result = (a >> 1) | (u8::from(self.st.flag(FL_C)) << 7);
                    self.st.set_a(result);
                    self.st.set_flag(FL_C, carry);
                    self.st.set_flag(FL_H, false);
                    self.st.set_flag(FL_N, false);
                }
                4 => self.daa(),
                5 => {
                    let a = !self.st.a();
                    self.st.set_a(a);
                    self.st.set_flag(FL_H, true);
                    self.st.set_flag(FL_N, true);
                }
                6 => {
                    self.st.set_flag(FL_C, true);
                    self.st.set_flag(FL_H, false);
                    self.st.set_flag(FL_N, false);
                }
                _ => {
                    let carry = self.st.flag(FL_C);
                    self.st.set_flag(FL_H, carry);
                    self.st.set_flag(FL_C, !carry);
                    self.st.set_flag(FL_N, false);
                }
            },
        }
        Ok(Outcome::Normal)
    }

    fn execute_cb(&mut self) -> Fallible<Outcome> {
        if !self.is_z80() {
            // 8080/8085 alias: JP nn
            let target = self.fetch16()?;
            self.st.pc = target;
            return Ok(Outcome::Normal);
        }
        // DD CB d op: displacement precedes the sub-opcode
        if self.prefix != IndexPrefix::None {
            self.displacement = self.fetch8()? as i8;
        }
        let opcode = self.fetch8()?;
        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        // indexed forms always operate on memory
        let operand_index = if self.prefix != IndexPrefix::None { 6 } else { z };
        match x {
            0 => {
                let value = self.reg8(operand_index)?;
                let result = self.rotate(y, value);
                self.set_reg8(operand_index, result)?;
                if self.prefix != IndexPrefix::None && z != 6 {
                    self.set_reg8_plain(z, result);
                }
            }
            1 => {
                let value = self.reg8(operand_index)?;
                let set = value & (1 << y) != 0;
                self.st.set_flag(FL_Z, !set);
                self.st.set_flag(FL_PV, !set);
                self.st.set_flag(FL_S, y == 7 && set);
                self.st.set_flag(FL_H, true);
                self.st.set_flag(FL_N, false);
            }
            2 => {
                let value = self.reg8(operand_index)? & !(1 << y);
                self.set_reg8(operand_index, value)?;
                if self.prefix != IndexPrefix::None && z != 6 {
                    self.set_reg8_plain(z, value);
                }
            }
            _ => {
                let value = self.reg8(operand_index)? | (1 << y);
                self.set_reg8(operand_index, value)?;
                if self.prefix != IndexPrefix::None && z != 6 {
                    self.set_reg8_plain(z, value);
                }
            }
        }
        Ok(Outcome::Normal)
    }

    /// Plain register write ignoring the index prefix (DD CB result
    /// copy-back).
    fn set_reg8_plain(&mut self, index: u8, value: u8) {
        let bank = &mut self.st.bank[self.st.main_bank];
        match index & 7 {
            0 => bank.bc = (bank.bc & 0x00FF) | (u16::from(value) << 8),
            1 => bank.bc = (bank.bc & 0xFF00) | u16::from(value),
            2 => bank.de = (bank.de & 0x00FF) | (u16::from(value) << 8),
            3 => bank.de = (bank.de & 0xFF00) | u16::from(value),
            4 => bank.hl = (bank.hl & 0x00FF) | (u16::from(value) << 8),
            5 => bank.hl = (bank.hl & 0xFF00) | u16::from(value),
            _ => self.st.set_a(value),
        }
    }

    fn block_transfer(&mut self, y: u8) -> Fallible<bool> {
        // LDI/LDD/LDIR/LDDR and CPI/CPD/CPIR/CPDR and the I/O forms
        let delta: u16 = if y & 1 == 0 { 1 } else { 0xFFFF };
        let bank = self.st.main_bank;
        let hl = self.st.bank[bank].hl;
        let de = self.st.bank[bank].de;
        let bc = self.st.bank[bank].bc;
        let value = self.mem.read8(hl)?;
        self.mem.write8(de, value)?;
        self.st.bank[bank].hl = hl.wrapping_add(delta);
        self.st.bank[bank].de = de.wrapping_add(delta);
        self.st.bank[bank].bc = bc.wrapping_sub(1);
        self.st.set_flag(FL_H, false);
        self.st.set_flag(FL_N, false);
        self.st.set_flag(FL_PV, self.st.bank[bank].bc != 0);
        Ok(self.st.bank[bank].bc != 0)
    }

    fn block_compare(&mut self, y: u8) -> Fallible<bool> {
        let delta: u16 = if y & 1 == 0 { 1 } else { 0xFFFF };
        let bank = self.st.main_bank;
        let hl = self.st.bank[bank].hl;
        let value = self.mem.read8(hl)?;
        let carry = self.st.flag(FL_C);
        self.alu_sub(value, false, false);
        self.st.set_flag(FL_C, carry);
        self.st.bank[bank].hl = hl.wrapping_add(delta);
        self.st.bank[bank].bc = self.st.bank[bank].bc.wrapping_sub(1);
        self.st.set_flag(FL_PV, self.st.bank[bank].bc != 0);
        self.st.set_flag(FL_N, true);
        Ok(self.st.bank[bank].bc != 0 && !self.st.flag(FL_Z))
    }

    fn execute_ed(&mut self) -> Fallible<Outcome> {
        let opcode = self.fetch8()?;

        // V20 emulation escapes ride on the ED page
        if opcode == 0xED {
            let vector = self.fetch8()?;
            return Ok(Outcome::Calln(vector));
        }
        if opcode == 0xFD {
            return Ok(Outcome::Retem);
        }

        if !self.is_z80() {
            // the 8080 treats ED as an alias of CALL nn
            let target = self.fetch16()?;
            let pc = self.st.pc;
            self.push16(pc)?;
            self.st.pc = target;
            return Ok(Outcome::Normal);
        }

        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        let p = y >> 1;
        let q = y & 1;
        match x {
            1 => match z {
                0 => {
                    // IN r,(C)
                    let port = self.st.bank[self.st.main_bank].bc;
                    let value = self.mem.input8(port)?;
                    if y != 6 {
                        self.set_reg8_plain(y, value);
                    }
                    self.set_sz(value);
                    self.st.set_flag(FL_H, false);
                    self.st.set_flag(FL_N, false);
                    self.st.set_flag(FL_PV, parity(value));
                }
                1 => {
                    let port = self.st.bank[self.st.main_bank].bc;
                    let value = if y == 6 { 0 } else { self.reg8(y)? };
                    self.mem.output8(port, value)?;
                }
                2 => {
                    let hl = self.st.hl();
                    let rp = self.st.rp(p, IndexPrefix::None);
                    let result = self.add16(hl, rp, if q == 0 { 2 } else { 1 });
                    self.st.set_hl_indexed(IndexPrefix::None, result);
                }
                3 => {
                    let address = self.fetch16()?;
                    if q == 0 {
                        let value = self.st.rp(p, IndexPrefix::None);
                        self.mem.write16(address, value)?;
                    } else {
                        let value = self.mem.read16(address)?;
                        self.st.set_rp(p, IndexPrefix::None, value);
                    }
                }
                4 => {
                    // NEG
                    let a = self.st.a();
                    self.st.set_a(0);
                    self.alu_sub(a, false, true);
                }
                5 => {
                    // RETN/RETI
                    self.st.iff1 = self.st.iff2;
                    let target = self.pop16()?;
                    self.st.pc = target;
                }
                6 => {
                    self.st.im = match y & 3 {
                        0 | 1 => 0,
                        2 => 1,
                        _ => 2,
                    };
                }
                _ => match y {
                    0 => self.st.i = (self.st.i & 0xFF00) | u16::from(self.st.a()),
                    1 => self.st.r = self.st.a(),
                    2 => {
                        let value = self.st.i as u8;
                        self.st.set_a(value);
                        self.set_sz(value);
                        self.st.set_flag(FL_H, false);
                        self.st.set_flag(FL_N, false);
                        self.st.set_flag(FL_PV, self.st.iff2);
                    }
                    3 => {
                        let value = self.st.r;
                        self.st.set_a(value);
                        self.set_sz(value);
                        self.st.set_flag(FL_H, false);
                        self.st.set_flag(FL_N, false);
                        self.st.set_flag(FL_PV, self.st.iff2);
                    }
                    4 => {
                        // RRD
                        let hl = self.st.hl();
                        let memory = self.mem.read8(hl)?;
                        let a = self.st.a();
                        let result = (a & 0xF0) | (memory & 0x0F);
                        self.mem.write8(hl, (memory >> 4) | (a << 4))?;
                        self.st.set_a(result);
                        self.set_sz(result);
                        self.st.set_flag(FL_H, false);
                        self.st.set_flag(FL_N, false);
                        self.st.set_flag(FL_PV, parity(result));
                    }
                    5 => {
                        // RLD
                        let hl = self.st.hl();
                        let memory = self.mem.read8(hl)?;
                        let a = self.st.a();
                        let result = (a & 0xF0) | (memory >> 4);
                        self.mem.write8(hl, (memory << 4) | (a & 0x0F))?;
                        self.st.set_a(result);
                        self.set_sz(result);
                        self.st.set_flag(FL_H, false);
                        self.st.set_flag(FL_N, false);
                        self.st.set_flag(FL_PV, parity(result));
                    }
                    _ => {}
                },
            },
            2 if z == 0 && y >= 4 => {
                // LDI/LDD/LDIR/LDDR
                let again = self.block_transfer(y)?;
                if y >= 6 && again {
                    self.st.pc = self.st.pc.wrapping_sub(2);
                }
            }
            2 if z == 1 && y >= 4 => {
                let again = self.block_compare(y)?;
                if y >= 6 && again {
                    self.st.pc = self.st.pc.wrapping_sub(2);
                }
            }
            2 if (z == 2 || z == 3) && y >= 4 => {
                // INI/IND/INIR/INDR and OUTI/OUTD/OTIR/OTDR
                let delta: u16 = if y & 1 == 0 { 1 } else { 0xFFFF };
                let bank = self.st.main_bank;
                let hl = self.st.bank[bank].hl;
                let port = self.st.bank[bank].bc;
                if z == 2 {
                    let value = self.mem.input8(port)?;
                    self.mem.write8(hl, value)?;
                } else {
                    let value = self.mem.read8(hl)?;
                    self.mem.output8(port, value)?;
                }
                self.st.bank[bank].hl = hl.wrapping_add(delta);
                let b = (self.st.bank[bank].bc >> 8).wrapping_sub(1) as u8;
                self.st.bank[bank].bc =
                    (self.st.bank[bank].bc & 0x00FF) | (u16::from(b) << 8);
                self.st.set_flag(FL_Z, b == 0);
                self.st.set_flag(FL_N, true);
                if y >= 6 && b != 0 {
                    self.st.pc = self.st.pc.wrapping_sub(2);
                }
            }
            _ => {}
        }
        Ok(Outcome::Normal)
    }

    fn execute_x3(&mut self, y: u8, z: u8, p: u8, q: u8) -> Fallible<Outcome> {
        match z {
            0 => {
                if self.st.check_cc(y) {
                    let target = self.pop16()?;
                    self.st.pc = target;
                }
            }
            1 => {
                if q == 0 {
                    let value = self.pop16()?;
                    self.st.set_rp2(p, self.prefix, value);
                } else {
                    match p {
                        0 => {
                            let target = self.pop16()?;
                            self.st.pc = target;
                        }
                        1 if self.is_z80() => {
                            self.st.main_bank ^= 1;
                        }
                        2 => {
                            self.st.pc = self.st.hl_indexed(self.prefix);
                        }
                        _ => {
                            self.st.sp = self.st.hl_indexed(self.prefix);
                        }
                    }
                }
            }
            2 => {
                let target = self.fetch16()?;
                if self.st.check_cc(y) {
                    self.st.pc = target;
                }
            }
            3 => match y {
                0 => {
                    let target = self.fetch16()?;
                    self.st.pc = target;
                }
                1 => return self.execute_cb(),
                2 => {
                    let port = u16::from(self.fetch8()?);
                    let a = self.st.a();
                    self.mem.output8(port | (u16::from(a) << 8), a)?;
                }
                3 => {
                    let port = u16::from(self.fetch8()?);
                    let a = self.st.a();
                    let value = self.mem.input8(port | (u16::from(a) << 8))?;
                    self.st.set_a(value);
                }
                4 => {
                    // EX (SP),HL
                    let sp = self.st.sp;
                    let memory = self.mem.read16(sp)?;
                    let hl = self.st.hl_indexed(self.prefix);
                    self.mem.write16(sp, hl)?;
                    self.st.set_hl_indexed(self.prefix, memory);
                }
                5 => {
                    let bank = self.st.main_bank;
                    core::mem::swap(
                        &mut self.st.bank[bank].de,
                        &mut self.st.bank[bank].hl,
                    );
                }
                6 => {
                    self.st.iff1 = false;
                    self.st.iff2 = false;
                }
                _ => {
                    self.st.iff1 = true;
                    self.st.iff2 = true;
                }
            },
            4 => {
                let target = self.fetch16()?;
                if self.st.check_cc(y) {
                    let pc = self.st.pc;
                    self.push16(pc)?;
                    self.st.pc = target;
                }
            }
            5 => {
                if q == 0 {
                    let value = self.st.rp2(p, self.prefix);
                    self.push16(value)?;
                } else {
                    match p {
                        0 => {
                            let target = self.fetch16()?;
                            let pc = self.st.pc;
                            self.push16(pc)?;
                            self.st.pc = target;
                        }
                        1 if self.is_z80() => {
                            // DD: decode the next opcode with IX
                            return self.execute_prefixed(IndexPrefix::Ix);
                        }
                        2 => return self.execute_ed(),
                        _ if self.is_z80() => {
                            return self.execute_prefixed(IndexPrefix::Iy);
                        }
                        // 8080 aliases: DD/FD behave as CALL nn
                        _ => {
                            let target = self.fetch16()?;
                            let pc = self.st.pc;
                            self.push16(pc)?;
                            self.st.pc = target;
                        }
                    }
                }
            }
            6 => {
                let value = self.fetch8()?;
                self.alu(y, value);
            }
            _ => {
                let pc = self.st.pc;
                self.push16(pc)?;
                self.st.pc = u16::from(y) * 8;
            }
        }
        Ok(Outcome::Normal)
    }

    fn execute_prefixed(&mut self, prefix: IndexPrefix) -> Fallible<Outcome> {
        self.prefix = prefix;
        self.execute_one()
    }

    fn execute_one(&mut self) -> Fallible<Outcome> {
        let opcode = self.fetch8()?;
        self.st.bump_r();

        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        let p = (y >> 1) & 3;
        let q = y & 1;

        match x {
            0 => self.execute_x0(y, z, p, q),
            1 => {
                if y == 6 && z == 6 {
                    self.st.halted = true;
                    Ok(Outcome::Halt)
                } else {
                    // LD r,r'; with an index prefix only one side uses the
                    // remapped registers when (HL) is involved
                    self.load_displacement()?;
                    if self.prefix != IndexPrefix::None && (y == 6 || z == 6) {
                        if y == 6 {
                            let value = {
                                let bank = &self.st.bank[self.st.main_bank];
                                match z {
                                    0 => (bank.bc >> 8) as u8,
                                    1 => bank.bc as u8,
                                    2 => (bank.de >> 8) as u8,
                                    3 => bank.de as u8,
                                    4 => (bank.hl >> 8) as u8,
                                    5 => bank.hl as u8,
                                    _ => self.st.a(),
                                }
                            };
                            let address = self.indexed_address();
                            self.mem.write8(address, value)?;
                        } else {
                            let address = self.indexed_address();
                            let value = self.mem.read8(address)?;
                            self.set_reg8_plain(y, value);
                        }
                    } else {
                        let value = self.reg8(z)?;
                        self.set_reg8(y, value)?;
                    }
                    Ok(Outcome::Normal)
                }
            }
            2 => {
                self.load_displacement()?;
                let value = self.reg8(z)?;
                self.alu(y, value);
                Ok(Outcome::Normal)
            }
            _ => self.execute_x3(y, z, p, q),
        }
    }
}

/// Execute one 8080/8085/Z80 instruction (including any prefix chain).
pub fn execute(state: &mut X80, mem: &mut dyn X80Mem) -> Fallible<Outcome> {
    if state.halted {
        return Ok(Outcome::Halt);
    }
    let mut ctx = Ctx {
        st: state,
        mem,
        prefix: IndexPrefix::None,
        displacement: 0,
    };
    ctx.execute_one()
}
