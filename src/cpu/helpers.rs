//! Stepper helper functions
//!
//! Instruction fetch through the prefetch queue, stack primitives sized by
//! the SS descriptor, near control transfers, and the ALU flag helpers the
//! opcode semantics are written against.
//!
//! Flag rules: an addition carries out of bit N when any two of
//! {x, y, ¬result} have their top bit set; the auxiliary flag is the same
//! rule at bit 4; overflow is the xor of the sign carries; parity counts
//! the low byte only.

use super::{Cpu, OpSize};
use crate::bus::Bus;
use crate::exception::Fallible;
use crate::regs::{gpr, seg};

impl Cpu {
    // ========== Instruction Fetch ==========

    /// Advance xIP with the code-size wrap.
    pub fn advance_ip(&mut self, count: u64) {
        self.xip = match self.parser.code_size {
            OpSize::Byte | OpSize::Word => (self.xip + count) & 0xFFFF,
            OpSize::Dword => (self.xip + count) & 0xFFFF_FFFF,
            OpSize::Qword => self.xip.wrapping_add(count),
        };
    }

    pub fn fetch8(&mut self, bus: &mut dyn Bus) -> Fallible<u8> {
        let ip = self.xip;
        self.advance_ip(1);
        self.segmented_read8_exec(bus, seg::CS, ip)
    }

    pub fn fetch16(&mut self, bus: &mut dyn Bus) -> Fallible<u16> {
        let ip = self.xip;
        self.advance_ip(2);
        self.segmented_read16_exec(bus, seg::CS, ip)
    }

    pub fn fetch32(&mut self, bus: &mut dyn Bus) -> Fallible<u32> {
        let ip = self.xip;
        self.advance_ip(4);
        self.segmented_read32_exec(bus, seg::CS, ip)
    }

    pub fn fetch64(&mut self, bus: &mut dyn Bus) -> Fallible<u64> {
        let low = self.fetch32(bus)?;
        let high = self.fetch32(bus)?;
        Ok(u64::from(low) | (u64::from(high) << 32))
    }

    /// Immediate of the current operand size. 64-bit operands take a
    /// sign-extended 32-bit immediate except where the opcode says
    /// otherwise (MOV reg,imm64 fetches the full width itself).
    pub fn fetch_immediate(&mut self, bus: &mut dyn Bus) -> Fallible<u64> {
        Ok(match self.parser.operation_size {
            OpSize::Byte => u64::from(self.fetch8(bus)?),
            OpSize::Word => u64::from(self.fetch16(bus)?),
            OpSize::Dword => u64::from(self.fetch32(bus)?),
            OpSize::Qword => self.fetch32(bus)? as i32 as i64 as u64,
        })
    }

    pub fn fetch_address_size(&mut self, bus: &mut dyn Bus) -> Fallible<u64> {
        Ok(match self.parser.address_size {
            OpSize::Byte | OpSize::Word => u64::from(self.fetch16(bus)?),
            OpSize::Dword => u64::from(self.fetch32(bus)?),
            OpSize::Qword => self.fetch64(bus)?,
        })
    }

    // ========== Near Control Transfer ==========

    /// Near jump target: limit and canonical checks, then the xIP write
    /// (which flushes the queue).
    pub fn jump_near(&mut self, value: u64) -> Fallible<()> {
        self.segment_check_limit(seg::CS, value, 1, 0)?;
        self.check_canonical(Some(seg::CS), value, 0)?;
        self.set_xip(value);
        Ok(())
    }

    // ========== Stack ==========

    pub fn stack_pointer(&self) -> u64 {
        match self.stack_size() {
            OpSize::Word => u64::from(self.register_get16(gpr::SP)),
            OpSize::Dword => u64::from(self.register_get32(gpr::SP)),
            _ => self.gpr[gpr::SP],
        }
    }

    pub fn stack_adjust(&mut self, value: u64) {
        match self.stack_size() {
            OpSize::Word => {
                let sp = self.register_get16(gpr::SP).wrapping_add(value as u16);
                self.register_set16(gpr::SP, sp);
            }
            OpSize::Dword => {
                let sp = self.register_get32(gpr::SP).wrapping_add(value as u32);
                self.register_set32(gpr::SP, sp);
            }
            _ => self.gpr[gpr::SP] = self.gpr[gpr::SP].wrapping_add(value),
        }
    }

    fn stack_retreat(&mut self, value: u64) -> u64 {
        match self.stack_size() {
            OpSize::Word => {
                let sp = self.register_get16(gpr::SP).wrapping_sub(value as u16);
                self.register_set16(gpr::SP, sp);
                u64::from(sp)
            }
            OpSize::Dword => {
                let sp = self.register_get32(gpr::SP).wrapping_sub(value as u32);
                self.register_set32(gpr::SP, sp);
                u64::from(sp)
            }
            _ => {
                self.gpr[gpr::SP] = self.gpr[gpr::SP].wrapping_sub(value);
                self.gpr[gpr::SP]
            }
        }
    }

    /// 8086 quirk: a byte push still decrements SP by two.
    pub fn push8(&mut self, bus: &mut dyn Bus, value: u8) -> Fallible<()> {
        let sp = self.register_get16(gpr::SP).wrapping_sub(2);
        self.segmented_write8(bus, seg::SS, u64::from(sp), value)?;
        self.register_set16(gpr::SP, sp);
        Ok(())
    }

    pub fn push16(&mut self, bus: &mut dyn Bus, value: u16) -> Fallible<()> {
        let sp = self.stack_retreat(2);
        match self.segmented_write16(bus, seg::SS, sp, value) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.stack_adjust(2);
                Err(error)
            }
        }
    }

    pub fn pop16(&mut self, bus: &mut dyn Bus) -> Fallible<u16> {
        let sp = self.stack_pointer();
        let value = self.segmented_read16(bus, seg::SS, sp)?;
        self.stack_adjust(2);
        Ok(value)
    }

    pub fn push32(&mut self, bus: &mut dyn Bus, value: u32) -> Fallible<()> {
        let sp = self.stack_retreat(4);
        match self.segmented_write32(bus, seg::SS, sp, value) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.stack_adjust(4);
                Err(error)
            }
        }
    }

    pub fn pop32(&mut self, bus: &mut dyn Bus) -> Fallible<u32> {
        let sp = self.stack_pointer();
        let value = self.segmented_read32(bus, seg::SS, sp)?;
        self.stack_adjust(4);
        Ok(value)
    }

    pub fn push64(&mut self, bus: &mut dyn Bus, value: u64) -> Fallible<()> {
        let sp = self.stack_retreat(8);
        match self.segmented_write64(bus, seg::SS, sp, value) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.stack_adjust(8);
                Err(error)
            }
        }
    }

    pub fn pop64(&mut self, bus: &mut dyn Bus) -> Fallible<u64> {
        let sp = self.stack_pointer();
        let value = self.segmented_read64(bus, seg::SS, sp)?;
        self.stack_adjust(8);
        Ok(value)
    }

    pub fn push_size(&mut self, bus: &mut dyn Bus, size: OpSize, value: u64) -> Fallible<()> {
        match size {
            OpSize::Byte | OpSize::Word => self.push16(bus, value as u16),
            OpSize::Dword => self.push32(bus, value as u32),
            OpSize::Qword => self.push64(bus, value),
        }
    }

    pub fn pop_size(&mut self, bus: &mut dyn Bus, size: OpSize) -> Fallible<u64> {
        Ok(match size {
            OpSize::Byte | OpSize::Word => u64::from(self.pop16(bus)?),
            OpSize::Dword => u64::from(self.pop32(bus)?),
            OpSize::Qword => self.pop64(bus)?,
        })
    }

    /// Peek the `slot`-th stack entry of width `size` without popping.
    pub fn read_stack_size(&mut self, bus: &mut dyn Bus, size: OpSize, slot: u64) -> Fallible<u64> {
        self.read_stack_at(bus, size, slot * size.bytes() as u64)
    }

    pub fn read_stack_at(&mut self, bus: &mut dyn Bus, size: OpSize, byte_offset: u64) -> Fallible<u64> {
        let sp = self.stack_pointer().wrapping_add(byte_offset);
        Ok(match size {
            OpSize::Byte | OpSize::Word => u64::from(self.segmented_read16(bus, seg::SS, sp)?),
            OpSize::Dword => u64::from(self.segmented_read32(bus, seg::SS, sp)?),
            OpSize::Qword => self.segmented_read64(bus, seg::SS, sp)?,
        })
    }

    // ========== Sized Register File Views ==========

    pub fn register_get_size(&self, size: OpSize, number: usize) -> u64 {
        match size {
            OpSize::Byte => u64::from(self.register_get8(number)),
            OpSize::Word => u64::from(self.register_get16(number)),
            OpSize::Dword => u64::from(self.register_get32(number)),
            OpSize::Qword => self.register_get64(number),
        }
    }

    pub fn register_set_size(&mut self, size: OpSize, number: usize, value: u64) {
        match size {
            OpSize::Byte => self.register_set8(number, value as u8),
            OpSize::Word => self.register_set16(number, value as u16),
            OpSize::Dword => self.register_set32(number, value as u32),
            OpSize::Qword => self.register_set64(number, value),
        }
    }

    // ========== Flag Computation ==========

    fn sign_bit(size: OpSize) -> u64 {
        match size {
            OpSize::Byte => 0x80,
            OpSize::Word => 0x8000,
            OpSize::Dword => 0x8000_0000,
            OpSize::Qword => 0x8000_0000_0000_0000,
        }
    }

    pub fn parity8(value: u8) -> bool {
        value.count_ones() % 2 == 0
    }

    /// Set SF/ZF/PF from a result.
    pub fn set_szp(&mut self, size: OpSize, result: u64) {
        let result = result & size.mask();
        self.zf = result == 0;
        self.sf = result & Self::sign_bit(size) != 0;
        self.pf = Self::parity8(result as u8);
    }

    /// Full flag update for an addition, returning the masked result.
    pub fn alu_add(&mut self, size: OpSize, x: u64, y: u64, carry_in: bool) -> u64 {
        let mask = size.mask();
        let x = x & mask;
        let y = y & mask;
        let c = u64::from(carry_in);
        let result = x.wrapping_add(y).wrapping_add(c) & mask;
        let sign = Self::sign_bit(size);
        // carry out of the top bit: any two of {x, y, ~result}
        self.cf = ((x & y) | (x & !result) | (y & !result)) & sign != 0;
        self.af = (x ^ y ^ result) & 0x10 != 0;
        self.of = ((x & y & !result) | (!x & !y & result)) & sign != 0;
        self.set_szp(size, result);
        result
    }

    /// Full flag update for a subtraction (`x - y`).
    pub fn alu_sub(&mut self, size: OpSize, x: u64, y: u64, borrow_in: bool) -> u64 {
        let mask = size.mask();
        let x = x & mask;
        let y = y & mask;
        let b = u64::from(borrow_in);
        let result = x.wrapping_sub(y).wrapping_sub(b) & mask;
        let sign = Self::sign_bit(size);
        // borrow into the top bit
        self.cf = ((x & !y) | (x & !result) | (!y & !result)) & sign == 0;
        self.af = (x ^ y ^ result) & 0x10 != 0;
        self.of = ((x & !y & !result) | (!x & y & result)) & sign != 0;
        self.set_szp(size, result);
        result
    }

    /// Flag update for AND/OR/XOR/TEST: CF and OF clear.
    pub fn alu_logic_flags(&mut self, size: OpSize, result: u64) {
        self.cf = false;
        self.of = false;
        self.af = false;
        self.set_szp(size, result);
    }

    /// INC: everything but CF.
    pub fn alu_inc(&mut self, size: OpSize, value: u64) -> u64 {
        let carry = self.cf;
        let result = self.alu_add(size, value, 1, false);
        self.cf = carry;
        result
    }

    /// DEC: everything but CF.
    pub fn alu_dec(&mut self, size: OpSize, value: u64) -> u64 {
        let carry = self.cf;
        let result = self.alu_sub(size, value, 1, false);
        self.cf = carry;
        result
    }

    /// Jcc/SETcc/CMOVcc condition codes (Intel numbering).
    pub fn check_condition(&self, code: u8) -> bool {
        let result = match code >> 1 {
            0 => self.of,
            1 => self.cf,
            2 => self.zf,
            3 => self.cf || self.zf,
            4 => self.sf,
            5 => self.pf,
            6 => self.sf != self.of,
            _ => self.sf != self.of || self.zf,
        };
        if code & 1 != 0 {
            !result
        } else {
            result
        }
    }

    /// Whether a REP-prefixed iteration continues (checked after the
    /// unit).
    pub fn rep_condition(&self) -> bool {
        match self.parser.rep_prefix {
            super::RepPrefix::Repz => self.zf,
            super::RepPrefix::Repnz => !self.zf,
            super::RepPrefix::Repc => self.cf,
            super::RepPrefix::Repnc => !self.cf,
            super::RepPrefix::None => true,
        }
    }

    /// Sign extend a value of the given size to 64 bits.
    pub fn sign_extend(size: OpSize, value: u64) -> i64 {
        match size {
            OpSize::Byte => value as u8 as i8 as i64,
            OpSize::Word => value as u16 as i16 as i64,
            OpSize::Dword => value as u32 as i32 as i64,
            OpSize::Qword => value as i64,
        }
    }
}
