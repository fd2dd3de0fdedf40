//! Per-opcode semantics
//!
//! The one-byte map and the 0F map, with the family-specific corners
//! (8086 opcode aliases, NEC bit-field and BCD string extensions, the
//! 80386B0 IBTS/XBTS pair, Cyrix SMINT, the V55 queue operations) gated on
//! the capability structure. Undefined encodings fault with #UD on
//! 186-class and later parts and report `StepResult::Undefined` on
//! 8086-class parts.

use super::{Cpu, OpSize, RepPrefix, SimdPrefix};
use crate::bus::Bus;
use crate::exception::{vector, Exception, Fallible, StepResult};
use crate::regs::{desc, flags, gpr, seg, Cr0, Cr4};
use crate::smm::{SmiAttributes, SmiSource};
use crate::traits::{CpuFamily, CpuSubtype, CPUID1_EDX_FXSR, CPUID1_EDX_MMX, CPUID1_EDX_SEP, CPUID1_EDX_SSE, CPUID1_EDX_TSC};

impl Cpu {
    /// Record an undefined encoding: fault on 186-class and later parts,
    /// report-and-continue on the 8086 generation.
    fn undefined(&mut self, opcode: u8) -> Fallible<()> {
        if self.traits.family == CpuFamily::I186
            || self.traits.family == CpuFamily::V60
            || self.traits.family >= CpuFamily::I286
        {
            Err(Exception::ud())
        } else {
            self.result = StepResult::Undefined(opcode);
            Ok(())
        }
    }

    fn privileged(&self) -> Fallible<()> {
        if self.is_protected_mode() && self.cpl != 0 {
            return Err(Exception::gp(0));
        }
        Ok(())
    }

    /// I/O sensitivity: IOPL in protected/V86 mode, the IBRK bit on the
    /// NEC single-chip parts.
    fn check_io_permission(&self) -> Fallible<()> {
        if matches!(self.traits.family, CpuFamily::V25 | CpuFamily::V55) && !self.ibrk {
            return Err(Exception::fault(vector::IO));
        }
        if self.is_protected_mode() || self.is_v86_mode() {
            let needed = if self.is_v86_mode() { 3 } else { self.cpl };
            if needed > self.iopl {
                return Err(Exception::gp(0));
            }
        }
        Ok(())
    }

    fn operand_size(&self) -> OpSize {
        self.parser.operation_size
    }

    // ========== Primary Opcode Map ==========

    pub(super) fn execute_primary(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        // the 8086 generation aliases 60-6F onto the Jcc block
        let opcode = if opcode & 0xF0 == 0x60
            && (self.traits.family == CpuFamily::I8086 || self.traits.family == CpuFamily::V60)
        {
            opcode | 0x10
        } else {
            opcode
        };

        match opcode {
            // ---- ALU block: 00-3F in the op<<3 pattern ----
            0x00..=0x05 | 0x08..=0x0D | 0x10..=0x15 | 0x18..=0x1D | 0x20..=0x25 | 0x28..=0x2D
            | 0x30..=0x35 | 0x38..=0x3D => {
                let operation = (opcode >> 3) & 7;
                let form = opcode & 7;
                self.alu_instruction(bus, operation, form)?;
            }

            0x06 => {
                let value = self.segment_get(seg::ES);
                self.push_operand(bus, u64::from(value))?;
            }
            0x07 => {
                let value = self.pop_operand(bus)?;
                self.segment_set(bus, seg::ES, value as u16)?;
            }
            0x0E => {
                let value = self.segment_get(seg::CS);
                self.push_operand(bus, u64::from(value))?;
            }
            0x16 => {
                let value = self.segment_get(seg::SS);
                self.push_operand(bus, u64::from(value))?;
            }
            0x17 => {
                let value = self.pop_operand(bus)?;
                self.segment_set(bus, seg::SS, value as u16)?;
            }
            0x1E => {
                let value = self.segment_get(seg::DS);
                self.push_operand(bus, u64::from(value))?;
            }
            0x1F => {
                let value = self.pop_operand(bus)?;
                self.segment_set(bus, seg::DS, value as u16)?;
            }
            0x0F => {
                // only reachable on the 8086: POP CS
                let value = self.pop_operand(bus)?;
                self.segment_load_real_mode(seg::CS, value as u16);
            }

            0x27 => self.daa(false),
            0x2F => self.daa(true),
            0x37 => self.aaa(false),
            0x3F => self.aaa(true),

            0x40..=0x47 => {
                let size = self.operand_size();
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                let value = self.register_get_size(size, number);
                let result = self.alu_inc(size, value);
                self.register_set_size(size, number, result);
            }
            0x48..=0x4F => {
                let size = self.operand_size();
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                let value = self.register_get_size(size, number);
                let result = self.alu_dec(size, value);
                self.register_set_size(size, number, result);
            }

            0x50..=0x57 => {
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                let size = self.push_operand_size();
                let value = self.register_get_size(size, number);
                self.push_size(bus, size, value)?;
            }
            0x58..=0x5F => {
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                let size = self.push_operand_size();
                let value = self.pop_size(bus, size)?;
                self.register_set_size(size, number, value);
            }

            0x60 => {
                // PUSHA
                let size = self.operand_size();
                let sp = self.stack_pointer();
                for number in 0..8 {
                    let value = if number == gpr::SP {
                        sp
                    } else {
                        self.register_get_size(size, number)
                    };
                    self.push_size(bus, size, value)?;
                }
            }
            0x61 => {
                // POPA skips the stored SP
                let size = self.operand_size();
                for number in (0..8).rev() {
                    let value = self.pop_size(bus, size)?;
                    if number != gpr::SP {
                        self.register_set_size(size, number, value);
                    }
                }
            }
            0x62 => {
                // BOUND r, m (two packed signed limits)
                self.parse_modrm(bus)?;
                if self.modrm_is_register() {
                    return self.undefined(opcode);
                }
                let size = self.operand_size();
                self.finish_operand_address();
                let segment = self.operand_segment();
                let offset = self.parser.address_offset;
                let (lower, upper) = match size {
                    OpSize::Word => (
                        i64::from(self.segmented_read16(bus, segment, offset)? as i16),
                        i64::from(self.segmented_read16(bus, segment, offset + 2)? as i16),
                    ),
                    _ => (
                        i64::from(self.segmented_read32(bus, segment, offset)? as i32),
                        i64::from(self.segmented_read32(bus, segment, offset + 4)? as i32),
                    ),
                };
                let index = Self::sign_extend(size, self.register_get_size(size, self.modrm_reg()));
                if index < lower || index > upper {
                    return Err(Exception::fault(vector::BR));
                }
            }
            0x63 => {
                if self.is_64bit_mode() {
                    // MOVSXD
                    self.parse_modrm(bus)?;
                    let value = self.read_rm(bus, OpSize::Dword)? as i32 as i64 as u64;
                    let size = self.operand_size();
                    self.register_set_size(size, self.modrm_reg(), value);
                } else if self.traits.family >= CpuFamily::I286 {
                    // ARPL
                    self.parse_modrm(bus)?;
                    if self.is_real_mode() || self.is_v86_mode() {
                        return Err(Exception::ud());
                    }
                    let destination = self.read_rm(bus, OpSize::Word)? as u16;
                    let source = self.register_get16(self.modrm_reg());
                    if destination & 3 < source & 3 {
                        let adjusted = (destination & !3) | (source & 3);
                        self.write_rm(bus, OpSize::Word, u64::from(adjusted))?;
                        self.zf = true;
                    } else {
                        self.zf = false;
                    }
                } else {
                    return self.undefined(opcode);
                }
            }

            0x68 => {
                let value = self.fetch_immediate(bus)?;
                self.push_operand(bus, value)?;
            }
            0x69 | 0x6B => {
                self.parse_modrm(bus)?;
                let size = self.operand_size();
                let immediate = if opcode == 0x6B {
                    self.fetch8(bus)? as i8 as i64
                } else {
                    Self::sign_extend(size, self.fetch_immediate(bus)?)
                };
                let multiplicand = Self::sign_extend(size, self.read_rm(bus, size)?);
                self.imul_flags(size, multiplicand, immediate);
                let product = multiplicand.wrapping_mul(immediate) as u64;
                self.register_set_size(size, self.modrm_reg(), product);
            }
            0x6C | 0x6D => self.string_instruction(bus, opcode)?,
            0x6E | 0x6F => self.string_instruction(bus, opcode)?,

            0x70..=0x7F => {
                let displacement = self.fetch8(bus)? as i8 as i64;
                if self.check_condition(opcode & 0x0F) {
                    let target = self.relative_target(displacement);
                    self.jump_near(target)?;
                }
            }

            0x80 | 0x82 => self.group1(bus, OpSize::Byte, false)?,
            0x81 => {
                let size = self.operand_size();
                self.group1(bus, size, false)?;
            }
            0x83 => {
                let size = self.operand_size();
                self.group1(bus, size, true)?;
            }

            0x84 | 0x85 => {
                self.parse_modrm(bus)?;
                let size = if opcode == 0x84 { OpSize::Byte } else { self.operand_size() };
                let a = self.read_rm(bus, size)?;
                let b = self.register_get_size(size, self.modrm_reg());
                self.alu_logic_flags(size, a & b);
            }
            0x86 | 0x87 => {
                self.parse_modrm(bus)?;
                let size = if opcode == 0x86 { OpSize::Byte } else { self.operand_size() };
                let memory = self.read_rm(bus, size)?;
                let register = self.register_get_size(size, self.modrm_reg());
                self.write_rm(bus, size, register)?;
                self.register_set_size(size, self.modrm_reg(), memory);
            }

            0x88 | 0x89 => {
                self.parse_modrm(bus)?;
                let size = if opcode == 0x88 { OpSize::Byte } else { self.operand_size() };
                let value = self.register_get_size(size, self.modrm_reg());
                self.write_rm(bus, size, value)?;
            }
            0x8A | 0x8B => {
                self.parse_modrm(bus)?;
                let size = if opcode == 0x8A { OpSize::Byte } else { self.operand_size() };
                let value = self.read_rm(bus, size)?;
                self.register_set_size(size, self.modrm_reg(), value);
            }
            0x8C => {
                self.parse_modrm(bus)?;
                let segment = self.segment_number(self.modrm_reg() & !8)?;
                let value = self.segment_get(segment);
                self.write_rm(bus, OpSize::Word, u64::from(value))?;
            }
            0x8D => {
                self.parse_modrm(bus)?;
                if self.modrm_is_register() {
                    return self.undefined(opcode);
                }
                self.finish_operand_address();
                let size = self.operand_size();
                let offset = self.parser.address_offset;
                self.register_set_size(size, self.modrm_reg(), offset & size.mask());
            }
            0x8E => {
                self.parse_modrm(bus)?;
                let value = self.read_rm(bus, OpSize::Word)? as u16;
                self.segment_set(bus, self.modrm_reg() & !8, value)?;
            }
            0x8F => {
                // POP r/m: SP is already adjusted when the store happens
                self.parse_modrm(bus)?;
                let value = self.pop_operand(bus)?;
                self.write_rm(bus, self.operand_size(), value)?;
            }

            0x90..=0x97 => {
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                if number != gpr::AX {
                    let size = self.operand_size();
                    let a = self.register_get_size(size, gpr::AX);
                    let b = self.register_get_size(size, number);
                    self.register_set_size(size, gpr::AX, b);
                    self.register_set_size(size, number, a);
                }
            }

            0x98 => {
                // CBW / CWDE / CDQE
                let size = self.operand_size();
                let half = match size {
                    OpSize::Word => OpSize::Byte,
                    OpSize::Dword => OpSize::Word,
                    _ => OpSize::Dword,
                };
                let value = Self::sign_extend(half, self.register_get_size(half, gpr::AX));
                self.register_set_size(size, gpr::AX, value as u64);
            }
            0x99 => {
                // CWD / CDQ / CQO
                let size = self.operand_size();
                let value = Self::sign_extend(size, self.register_get_size(size, gpr::AX));
                let high = if value < 0 { size.mask() } else { 0 };
                self.register_set_size(size, gpr::DX, high);
            }
            0x9A => {
                if self.is_64bit_mode() {
                    return Err(Exception::ud());
                }
                let offset = self.fetch_immediate(bus)?;
                let selector = self.fetch16(bus)?;
                let size = self.operand_size();
                self.call_far(bus, size, selector, offset)?;
            }
            0x9B => {
                // WAIT: surfaces any pending FPU fault
                if self.cr[0] & (Cr0::MP.bits() | Cr0::TS.bits())
                    == (Cr0::MP.bits() | Cr0::TS.bits())
                {
                    return Err(Exception::nm());
                }
                self.x87_check_pending_fault()?;
            }
            0x9C => {
                // PUSHF
                if self.is_v86_mode() && self.iopl < 3 && self.cr[4] & Cr4::VME.bits() == 0 {
                    return Err(Exception::gp(0));
                }
                let size = self.push_operand_size();
                let image = match size {
                    OpSize::Word => u64::from(self.flags_get_image16()),
                    _ => self.flags_get_image64(),
                };
                self.push_size(bus, size, image)?;
            }
            0x9D => {
                // POPF
                if self.is_v86_mode() && self.iopl < 3 && self.cr[4] & Cr4::VME.bits() == 0 {
                    return Err(Exception::gp(0));
                }
                let size = self.push_operand_size();
                let value = self.pop_size(bus, size)?;
                match size {
                    OpSize::Word => self.flags_set_image16(value as u16),
                    OpSize::Dword => self.flags_set_image32(value as u32),
                    _ => self.flags_set_image64(value),
                }
            }
            0x9E => {
                // SAHF
                let value = self.register_get8_high(gpr::AX);
                let keep = self.flags_get8() & !(0xD5);
                self.flags_set8((value & 0xD5) | keep | 0x02);
            }
            0x9F => {
                let value = self.flags_get_image8();
                self.register_set8_high(gpr::AX, value);
            }

            0xA0 | 0xA1 => {
                let size = if opcode == 0xA0 { OpSize::Byte } else { self.operand_size() };
                let offset = self.fetch_address_size(bus)?;
                let segment = self.parser.segment.unwrap_or(seg::DS);
                let value = match size {
                    OpSize::Byte => u64::from(self.segmented_read8(bus, segment, offset)?),
                    OpSize::Word => u64::from(self.segmented_read16(bus, segment, offset)?),
                    OpSize::Dword => u64::from(self.segmented_read32(bus, segment, offset)?),
                    OpSize::Qword => self.segmented_read64(bus, segment, offset)?,
                };
                self.register_set_size(size, gpr::AX, value);
            }
            0xA2 | 0xA3 => {
                let size = if opcode == 0xA2 { OpSize::Byte } else { self.operand_size() };
                let offset = self.fetch_address_size(bus)?;
                let segment = self.parser.segment.unwrap_or(seg::DS);
                let value = self.register_get_size(size, gpr::AX);
                match size {
                    OpSize::Byte => self.segmented_write8(bus, segment, offset, value as u8)?,
                    OpSize::Word => self.segmented_write16(bus, segment, offset, value as u16)?,
                    OpSize::Dword => self.segmented_write32(bus, segment, offset, value as u32)?,
                    OpSize::Qword => self.segmented_write64(bus, segment, offset, value)?,
                }
            }

            0xA4..=0xA7 | 0xAA..=0xAF => self.string_instruction(bus, opcode)?,

            0xA8 | 0xA9 => {
                let size = if opcode == 0xA8 { OpSize::Byte } else { self.operand_size() };
                let immediate = if size == OpSize::Byte {
                    u64::from(self.fetch8(bus)?)
                } else {
                    self.fetch_immediate(bus)?
                };
                let value = self.register_get_size(size, gpr::AX);
                self.alu_logic_flags(size, value & immediate);
            }

            0xB0..=0xB7 => {
                let value = self.fetch8(bus)?;
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                self.register_set8(number, value);
            }
            0xB8..=0xBF => {
                let size = self.operand_size();
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                let value = if size == OpSize::Qword {
                    // the one true 64-bit immediate
                    self.fetch64(bus)?
                } else {
                    self.fetch_immediate(bus)?
                };
                self.register_set_size(size, number, value);
            }

            0xC0 | 0xC1 => {
                if self.traits.family < CpuFamily::I186 {
                    return self.undefined(opcode);
                }
                self.parse_modrm(bus)?;
                let size = if opcode == 0xC0 { OpSize::Byte } else { self.operand_size() };
                let count = self.fetch8(bus)?;
                self.shift_group(bus, size, count)?;
            }
            0xC2 => {
                let bytes = u64::from(self.fetch16(bus)?);
                let size = self.push_operand_size();
                let target = self.pop_size(bus, size)?;
                self.stack_adjust(bytes);
                self.jump_near(target)?;
            }
            0xC3 => {
                let size = self.push_operand_size();
                let target = self.pop_size(bus, size)?;
                self.jump_near(target)?;
            }
            0xC4 | 0xC5 => {
                if self.is_64bit_mode() {
                    // the VEX space replaces LES/LDS in 64-bit mode
                    return Err(Exception::ud());
                }
                let segment = if opcode == 0xC4 { seg::ES } else { seg::DS };
                self.load_far_pointer(bus, segment)?;
            }
            0xC6 | 0xC7 => {
                self.parse_modrm(bus)?;
                let size = if opcode == 0xC6 { OpSize::Byte } else { self.operand_size() };
                let value = if size == OpSize::Byte {
                    u64::from(self.fetch8(bus)?)
                } else {
                    self.fetch_immediate(bus)?
                };
                self.write_rm(bus, size, value)?;
            }
            0xC8 => {
                if self.traits.family < CpuFamily::I186 {
                    return self.undefined(opcode);
                }
                self.enter(bus)?;
            }
            0xC9 => {
                if self.traits.family < CpuFamily::I186 {
                    return self.undefined(opcode);
                }
                // LEAVE
                let size = self.push_operand_size();
                let bp = self.register_get_size(self.stack_size(), gpr::BP);
                self.register_set_size(self.stack_size(), gpr::SP, bp);
                let value = self.pop_size(bus, size)?;
                self.register_set_size(size, gpr::BP, value);
            }
            0xCA => {
                let bytes = u64::from(self.fetch16(bus)?);
                let size = self.operand_size();
                self.return_far(bus, size, bytes)?;
            }
            0xCB => {
                let size = self.operand_size();
                self.return_far(bus, size, 0)?;
            }
            0xCC => return Err(Exception::software(vector::BP)),
            0xCD => {
                let number = self.fetch8(bus)?;
                return Err(Exception::int_n(number));
            }
            0xCE => {
                if self.of {
                    return Err(Exception::software(vector::OF));
                }
            }
            0xCF => {
                let size = self.operand_size();
                self.return_interrupt(bus, size)?;
            }

            0xD0..=0xD3 => {
                self.parse_modrm(bus)?;
                let size = if opcode & 1 == 0 { OpSize::Byte } else { self.operand_size() };
                let count = if opcode >= 0xD2 { self.register_get8_low(gpr::CX) } else { 1 };
                self.shift_group(bus, size, count)?;
            }
            0xD4 => {
                let base = self.fetch8(bus)?;
                self.aam(base)?;
            }
            0xD5 => {
                let base = self.fetch8(bus)?;
                let al = self.register_get8_low(gpr::AX);
                let ah = self.register_get8_high(gpr::AX);
                let result = al.wrapping_add(ah.wrapping_mul(base));
                self.register_set8_low(gpr::AX, result);
                self.register_set8_high(gpr::AX, 0);
                self.set_szp(OpSize::Byte, u64::from(result));
            }
            0xD6 => {
                // SALC
                if self.is_64bit_mode() {
                    return Err(Exception::ud());
                }
                self.register_set8_low(gpr::AX, if self.cf { 0xFF } else { 0 });
            }
            0xD7 => {
                // XLAT
                let table = self.register_get_size(self.parser.address_size, gpr::BX);
                let index = u64::from(self.register_get8_low(gpr::AX));
                let segment = self.parser.segment.unwrap_or(seg::DS);
                let address = table.wrapping_add(index) & self.parser.address_size.mask();
                let value = self.segmented_read8(bus, segment, address)?;
                self.register_set8_low(gpr::AX, value);
            }

            0xD8..=0xDF => {
                self.x87_instruction_begin()?;
                self.parse_modrm(bus)?;
                self.finish_operand_address();
                let modrm = self.parser.modrm;
                let segment = self.operand_segment();
                let offset = self.parser.address_offset;
                if self.x87.is_external() {
                    self.x87_defer(bus, opcode, modrm, segment, offset)?;
                } else {
                    self.x87_execute(bus, opcode, modrm, segment, offset)?;
                }
            }

            0xE0..=0xE2 => {
                // LOOPNZ/LOOPZ/LOOP on the address-size counter
                let displacement = self.fetch8(bus)? as i8 as i64;
                let size = self.parser.address_size;
                let count = self.register_get_size(size, gpr::CX).wrapping_sub(1) & size.mask();
                self.register_set_size(size, gpr::CX, count);
                let condition = match opcode {
                    0xE0 => !self.zf,
                    0xE1 => self.zf,
                    _ => true,
                };
                if count != 0 && condition {
                    let target = self.relative_target(displacement);
                    self.jump_near(target)?;
                }
            }
            0xE3 => {
                let displacement = self.fetch8(bus)? as i8 as i64;
                let size = self.parser.address_size;
                if self.register_get_size(size, gpr::CX) == 0 {
                    let target = self.relative_target(displacement);
                    self.jump_near(target)?;
                }
            }

            0xE4 | 0xE5 => {
                self.check_io_permission()?;
                let port = u16::from(self.fetch8(bus)?);
                let size = if opcode == 0xE4 { OpSize::Byte } else { self.operand_size() };
                let value = self.port_in(bus, port, size)?;
                self.register_set_size(size, gpr::AX, value);
            }
            0xE6 | 0xE7 => {
                self.check_io_permission()?;
                let port = u16::from(self.fetch8(bus)?);
                let size = if opcode == 0xE6 { OpSize::Byte } else { self.operand_size() };
                let value = self.register_get_size(size, gpr::AX);
                self.port_out(bus, port, size, value)?;
            }
            0xEC | 0xED => {
                self.check_io_permission()?;
                let port = self.register_get16(gpr::DX);
                let size = if opcode == 0xEC { OpSize::Byte } else { self.operand_size() };
                let value = self.port_in(bus, port, size)?;
                self.register_set_size(size, gpr::AX, value);
            }
            0xEE | 0xEF => {
                self.check_io_permission()?;
                let port = self.register_get16(gpr::DX);
                let size = if opcode == 0xEE { OpSize::Byte } else { self.operand_size() };
                let value = self.register_get_size(size, gpr::AX);
                self.port_out(bus, port, size, value)?;
            }

            0xE8 => {
                let displacement = Self::sign_extend(
                    if self.operand_size() == OpSize::Word { OpSize::Word } else { OpSize::Dword },
                    self.fetch_immediate(bus)?,
                );
                let size = self.push_operand_size();
                let xip = self.xip;
                self.push_size(bus, size, xip)?;
                let target = self.relative_target(displacement);
                self.jump_near(target)?;
            }
            0xE9 => {
                let displacement = Self::sign_extend(
                    if self.operand_size() == OpSize::Word { OpSize::Word } else { OpSize::Dword },
                    self.fetch_immediate(bus)?,
                );
                let target = self.relative_target(displacement);
                self.jump_near(target)?;
            }
            0xEA => {
                if self.is_64bit_mode() {
                    return Err(Exception::ud());
                }
                let offset = self.fetch_immediate(bus)?;
                let selector = self.fetch16(bus)?;
                self.jump_far(bus, selector, offset)?;
            }
            0xEB => {
                let displacement = self.fetch8(bus)? as i8 as i64;
                let target = self.relative_target(displacement);
                self.jump_near(target)?;
            }

            0xF1 => {
                // ICEBP / INT1
                if self.traits.family >= CpuFamily::I386 {
                    return Err(Exception::software(vector::DB));
                }
                return self.undefined(opcode);
            }
            0xF4 => {
                self.privileged()?;
                self.halted = true;
                self.result = StepResult::Halt;
            }
            0xF5 => self.cf = !self.cf,
            0xF6 => self.group3(bus, OpSize::Byte)?,
            0xF7 => {
                let size = self.operand_size();
                self.group3(bus, size)?;
            }
            0xF8 => self.cf = false,
            0xF9 => self.cf = true,
            0xFA => {
                // CLI honours IOPL and the VME virtual interrupt flag
                if self.is_protected_mode() || self.is_v86_mode() {
                    let threshold = if self.is_v86_mode() { 3 } else { self.cpl };
                    if threshold > self.iopl {
                        if self.is_v86_mode() && self.cr[4] & Cr4::VME.bits() != 0 {
                            self.vif = false;
                            return Ok(());
                        }
                        return Err(Exception::gp(0));
                    }
                }
                self.intf = false;
            }
            0xFB => {
                if self.is_protected_mode() || self.is_v86_mode() {
                    let threshold = if self.is_v86_mode() { 3 } else { self.cpl };
                    if threshold > self.iopl {
                        if self.is_v86_mode() && self.cr[4] & Cr4::VME.bits() != 0 {
                            self.vif = true;
                            return Ok(());
                        }
                        return Err(Exception::gp(0));
                    }
                }
                self.intf = true;
            }
            0xFC => self.df = false,
            0xFD => self.df = true,
            0xFE => {
                self.parse_modrm(bus)?;
                let value = self.read_rm(bus, OpSize::Byte)?;
                match self.parser.modrm >> 3 & 7 {
                    0 => {
                        let result = self.alu_inc(OpSize::Byte, value);
                        self.write_rm(bus, OpSize::Byte, result)?;
                    }
                    1 => {
                        let result = self.alu_dec(OpSize::Byte, value);
                        self.write_rm(bus, OpSize::Byte, result)?;
                    }
                    _ => return self.undefined(opcode),
                }
            }
            0xFF => self.group5(bus)?,

            _ => return self.undefined(opcode),
        }
        Ok(())
    }

    /// Operand size of pushes/pops/near calls: 64-bit code promotes to 8
    /// bytes regardless of the 66h prefix state.
    fn push_operand_size(&self) -> OpSize {
        if self.parser.code_size == OpSize::Qword {
            OpSize::Qword
        } else {
            self.operand_size()
        }
    }

    fn push_operand(&mut self, bus: &mut dyn Bus, value: u64) -> Fallible<()> {
        let size = self.push_operand_size();
        self.push_size(bus, size, value)
    }

    fn pop_operand(&mut self, bus: &mut dyn Bus) -> Fallible<u64> {
        let size = self.push_operand_size();
        self.pop_size(bus, size)
    }

    fn relative_target(&self, displacement: i64) -> u64 {
        let target = self.xip.wrapping_add(displacement as u64);
        match self.parser.code_size {
            OpSize::Byte | OpSize::Word => target & 0xFFFF,
            OpSize::Dword => target & 0xFFFF_FFFF,
            OpSize::Qword => target,
        }
    }

    // ========== ALU Block ==========

    fn apply_alu(&mut self, operation: u8, size: OpSize, x: u64, y: u64) -> (u64, bool) {
        // returns (result, writes_back)
        match operation {
            0 => (self.alu_add(size, x, y, false), true),
            1 => {
                let result = x | y;
                self.alu_logic_flags(size, result);
                (result & size.mask(), true)
            }
            2 => {
                let carry = self.cf;
                (self.alu_add(size, x, y, carry), true)
            }
            3 => {
                let carry = self.cf;
                (self.alu_sub(size, x, y, carry), true)
            }
            4 => {
                let result = x & y;
                self.alu_logic_flags(size, result);
                (result & size.mask(), true)
            }
            5 => (self.alu_sub(size, x, y, false), true),
            6 => {
                let result = x ^ y;
                self.alu_logic_flags(size, result);
                (result & size.mask(), true)
            }
            _ => (self.alu_sub(size, x, y, false), false),
        }
    }

    fn alu_instruction(&mut self, bus: &mut dyn Bus, operation: u8, form: u8) -> Fallible<()> {
        match form {
            0 | 1 => {
                // r/m, r
                self.parse_modrm(bus)?;
                let size = if form == 0 { OpSize::Byte } else { self.operand_size() };
                let x = self.read_rm(bus, size)?;
                let y = self.register_get_size(size, self.modrm_reg());
                let (result, write) = self.apply_alu(operation, size, x, y);
                if write {
                    self.write_rm(bus, size, result)?;
                }
            }
            2 | 3 => {
                // r, r/m
                self.parse_modrm(bus)?;
                let size = if form == 2 { OpSize::Byte } else { self.operand_size() };
                let x = self.register_get_size(size, self.modrm_reg());
                let y = self.read_rm(bus, size)?;
                let (result, write) = self.apply_alu(operation, size, x, y);
                if write {
                    self.register_set_size(size, self.modrm_reg(), result);
                }
            }
            _ => {
                // AL/AX, imm
                let size = if form == 4 { OpSize::Byte } else { self.operand_size() };
                let y = if size == OpSize::Byte {
                    u64::from(self.fetch8(bus)?)
                } else {
                    self.fetch_immediate(bus)?
                };
                let x = self.register_get_size(size, gpr::AX);
                let (result, write) = self.apply_alu(operation, size, x, y);
                if write {
                    self.register_set_size(size, gpr::AX, result);
                }
            }
        }
        Ok(())
    }

    fn group1(&mut self, bus: &mut dyn Bus, size: OpSize, sign_extend_imm8: bool) -> Fallible<()> {
        self.parse_modrm(bus)?;
        let operation = (self.parser.modrm >> 3) & 7;
        let y = if sign_extend_imm8 {
            self.fetch8(bus)? as i8 as i64 as u64
        } else if size == OpSize::Byte {
            u64::from(self.fetch8(bus)?)
        } else {
            self.fetch_immediate(bus)?
        };
        let x = self.read_rm(bus, size)?;
        let (result, write) = self.apply_alu(operation, size, x, y);
        if write {
            self.write_rm(bus, size, result)?;
        }
        Ok(())
    }

    // ========== Shifts and Rotates ==========

    fn shift_group(&mut self, bus: &mut dyn Bus, size: OpSize, count: u8) -> Fallible<()> {
        let operation = (self.parser.modrm >> 3) & 7;
        let bits = size.bytes() as u32 * 8;
        // 286+ masks the count; 64-bit operands mask to 6 bits
        let count = if self.traits.family >= CpuFamily::I286 {
            if size == OpSize::Qword {
                u32::from(count) & 63
            } else {
                u32::from(count) & 31
            }
        } else {
            u32::from(count)
        };
        let value = self.read_rm(bus, size)?;
        if count == 0 {
            // flags untouched (the 286+ masked case)
            if operation != 6 {
                return Ok(());
            }
        }
        let mask = size.mask();
        let value = value & mask;
        let result = match operation {
            0 => {
                // ROL
                let count = count % bits;
                let result = (value << count | value >> (bits - count) % bits) & mask;
                if count != 0 {
                    self.cf = result & 1 != 0;
                    self.of = ((result >> (bits - 1)) ^ u64::from(self.cf)) & 1 != 0;
                }
                result
            }
            1 => {
                // ROR
                let count = count % bits;
                let result = (value >> count | value << (bits - count) % bits) & mask;
                if count != 0 {
                    self.cf = result >> (bits - 1) & 1 != 0;
                    self.of = ((result >> (bits - 1)) ^ (result >> (bits - 2))) & 1 != 0;
                }
                result
            }
            2 => {
                // RCL through CF
                let mut result = value;
                let mut carry = self.cf;
                for _ in 0..count % (bits + 1) {
                    let new_carry = result >> (bits - 1) & 1 != 0;
                    result = (result << 1 | u64::from(carry)) & mask;
                    carry = new_carry;
                }
                self.cf = carry;
                self.of = ((result >> (bits - 1)) ^ u64::from(self.cf)) & 1 != 0;
                result
            }
            3 => {
                // RCR
                let mut result = value;
                let mut carry = self.cf;
                for _ in 0..count % (bits + 1) {
                    let new_carry = result & 1 != 0;
                    result = (result >> 1 | u64::from(carry) << (bits - 1)) & mask;
                    carry = new_carry;
                }
                self.cf = carry;
                self.of = ((result >> (bits - 1)) ^ (result >> (bits - 2))) & 1 != 0;
                result
            }
            4 | 6 => {
                // SHL
                let result = if count >= bits { 0 } else { (value << count) & mask };
                if count != 0 {
                    self.cf = count <= bits && value >> (bits - count.min(bits)) & 1 != 0;
                    self.of = ((result >> (bits - 1)) ^ u64::from(self.cf)) & 1 != 0;
                    self.set_szp(size, result);
                }
                result
            }
            5 => {
                // SHR
                let result = if count >= bits { 0 } else { value >> count };
                if count != 0 {
                    self.cf = count <= bits && value >> (count - 1) & 1 != 0;
                    self.of = value >> (bits - 1) & 1 != 0;
                    self.set_szp(size, result);
                }
                result
            }
            _ => {
                // SAR
                let signed = Self::sign_extend(size, value);
                let result = (signed >> count.min(bits - 1)) as u64 & mask;
                if count != 0 {
                    self.cf = count <= bits && (signed >> (count - 1).min(bits as u32 - 1)) & 1 != 0;
                    self.of = false;
                    self.set_szp(size, result);
                }
                result
            }
        };
        self.write_rm(bus, size, result)
    }

    // ========== Group 3: TEST/NOT/NEG/MUL/DIV ==========

    fn group3(&mut self, bus: &mut dyn Bus, size: OpSize) -> Fallible<()> {
        self.parse_modrm(bus)?;
        let operation = (self.parser.modrm >> 3) & 7;
        match operation {
            0 | 1 => {
                let y = if size == OpSize::Byte {
                    u64::from(self.fetch8(bus)?)
                } else {
                    self.fetch_immediate(bus)?
                };
                let x = self.read_rm(bus, size)?;
                self.alu_logic_flags(size, x & y);
            }
            2 => {
                let value = self.read_rm(bus, size)?;
                self.write_rm(bus, size, !value & size.mask())?;
            }
            3 => {
                let value = self.read_rm(bus, size)?;
                let result = self.alu_sub(size, 0, value, false);
                self.write_rm(bus, size, result)?;
            }
            4 => {
                // MUL
                let x = self.register_get_size(size, gpr::AX);
                let y = self.read_rm(bus, size)?;
                match size {
                    OpSize::Byte => {
                        let product = u64::from(x as u8) * u64::from(y as u8);
                        self.register_set16(gpr::AX, product as u16);
                        self.cf = product > 0xFF;
                    }
                    OpSize::Qword => {
                        let product = u128::from(x) * u128::from(y);
                        self.register_set64(gpr::AX, product as u64);
                        self.register_set64(gpr::DX, (product >> 64) as u64);
                        self.cf = product >> 64 != 0;
                    }
                    _ => {
                        let product = (x & size.mask()) as u128 * (y & size.mask()) as u128;
                        self.register_set_size(size, gpr::AX, product as u64 & size.mask());
                        let high = (product >> (size.bytes() * 8)) as u64 & size.mask();
                        self.register_set_size(size, gpr::DX, high);
                        self.cf = high != 0;
                    }
                }
                self.of = self.cf;
            }
            5 => {
                // IMUL one-operand
                let x = Self::sign_extend(size, self.register_get_size(size, gpr::AX));
                let y = Self::sign_extend(size, self.read_rm(bus, size)?);
                let product = i128::from(x) * i128::from(y);
                match size {
                    OpSize::Byte => {
                        self.register_set16(gpr::AX, product as u16);
                        self.cf = product != i128::from(product as i8);
                    }
                    OpSize::Qword => {
                        self.register_set64(gpr::AX, product as u64);
                        self.register_set64(gpr::DX, (product >> 64) as u64);
                        self.cf = product != i128::from(product as i64);
                    }
                    _ => {
                        self.register_set_size(size, gpr::AX, product as u64 & size.mask());
                        let high = (product >> (size.bytes() * 8)) as u64 & size.mask();
                        self.register_set_size(size, gpr::DX, high);
                        self.cf = match size {
                            OpSize::Word => product != i128::from(product as i16),
                            _ => product != i128::from(product as i32),
                        };
                    }
                }
                self.of = self.cf;
            }
            6 => {
                // DIV
                let divisor = self.read_rm(bus, size)? & size.mask();
                if divisor == 0 {
                    return Err(Exception::fault(vector::DE));
                }
                match size {
                    OpSize::Byte => {
                        let dividend = u64::from(self.register_get16(gpr::AX));
                        let quotient = dividend / divisor;
                        if quotient > 0xFF {
                            return Err(Exception::fault(vector::DE));
                        }
                        self.register_set8_low(gpr::AX, quotient as u8);
                        self.register_set8_high(gpr::AX, (dividend % divisor) as u8);
                    }
                    _ => {
                        let bits = size.bytes() * 8;
                        let dividend = (u128::from(self.register_get_size(size, gpr::DX)) << bits)
                            | u128::from(self.register_get_size(size, gpr::AX));
                        let quotient = dividend / u128::from(divisor);
                        if quotient > u128::from(size.mask()) {
                            return Err(Exception::fault(vector::DE));
                        }
                        self.register_set_size(size, gpr::AX, quotient as u64);
                        self.register_set_size(size, gpr::DX, (dividend % u128::from(divisor)) as u64);
                    }
                }
            }
            _ => {
                // IDIV
                let divisor = Self::sign_extend(size, self.read_rm(bus, size)?);
                if divisor == 0 {
                    return Err(Exception::fault(vector::DE));
                }
                match size {
                    OpSize::Byte => {
                        let dividend = i64::from(self.register_get16(gpr::AX) as i16);
                        let quotient = dividend / divisor;
                        if quotient > 0x7F || quotient < -0x80 {
                            return Err(Exception::fault(vector::DE));
                        }
                        self.register_set8_low(gpr::AX, quotient as u8);
                        self.register_set8_high(gpr::AX, (dividend % divisor) as u8);
                    }
                    _ => {
                        let bits = size.bytes() * 8;
                        let dividend = ((i128::from(self.register_get_size(size, gpr::DX)) << bits)
                            | i128::from(self.register_get_size(size, gpr::AX)))
                            << (128 - 2 * bits)
                            >> (128 - 2 * bits);
                        let quotient = dividend / i128::from(divisor);
                        let limit = i128::from(size.mask() >> 1);
                        if quotient > limit || quotient < -limit - 1 {
                            return Err(Exception::fault(vector::DE));
                        }
                        self.register_set_size(size, gpr::AX, quotient as u64 & size.mask());
                        self.register_set_size(
                            size,
                            gpr::DX,
                            (dividend % i128::from(divisor)) as u64 & size.mask(),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn imul_flags(&mut self, size: OpSize, x: i64, y: i64) {
        let product = i128::from(x) * i128::from(y);
        let truncated = match size {
            OpSize::Byte => i128::from(product as i8),
            OpSize::Word => i128::from(product as i16),
            OpSize::Dword => i128::from(product as i32),
            OpSize::Qword => i128::from(product as i64),
        };
        self.cf = product != truncated;
        self.of = self.cf;
    }

    // ========== Group 5: INC/DEC/CALL/JMP/PUSH r/m ==========

    fn group5(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        self.parse_modrm(bus)?;
        let operation = (self.parser.modrm >> 3) & 7;
        match operation {
            0 => {
                let size = self.operand_size();
                let value = self.read_rm(bus, size)?;
                let result = self.alu_inc(size, value);
                self.write_rm(bus, size, result)?;
            }
            1 => {
                let size = self.operand_size();
                let value = self.read_rm(bus, size)?;
                let result = self.alu_dec(size, value);
                self.write_rm(bus, size, result)?;
            }
            2 => {
                let size = self.push_operand_size();
                let target = self.read_rm(bus, size)?;
                let xip = self.xip;
                self.push_size(bus, size, xip)?;
                self.jump_near(target)?;
            }
            3 => {
                // CALL far m16:xx
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                let (selector, offset) = self.read_far_pointer(bus)?;
                let size = self.operand_size();
                self.call_far(bus, size, selector, offset)?;
            }
            4 => {
                let size = self.push_operand_size();
                let target = self.read_rm(bus, size)?;
                self.jump_near(target)?;
            }
            5 => {
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                let (selector, offset) = self.read_far_pointer(bus)?;
                self.jump_far(bus, selector, offset)?;
            }
            6 => {
                let size = self.push_operand_size();
                let value = self.read_rm(bus, size)?;
                self.push_size(bus, size, value)?;
            }
            _ => return Err(Exception::ud()),
        }
        Ok(())
    }

    fn read_far_pointer(&mut self, bus: &mut dyn Bus) -> Fallible<(u16, u64)> {
        self.finish_operand_address();
        let segment = self.operand_segment();
        let offset = self.parser.address_offset;
        let size = self.operand_size();
        let target = match size {
            OpSize::Word => u64::from(self.segmented_read16(bus, segment, offset)?),
            OpSize::Dword => u64::from(self.segmented_read32(bus, segment, offset)?),
            _ => self.segmented_read64(bus, segment, offset)?,
        };
        let selector =
            self.segmented_read16(bus, segment, offset + size.bytes() as u64)?;
        Ok((selector, target))
    }

    fn load_far_pointer(&mut self, bus: &mut dyn Bus, segment: usize) -> Fallible<()> {
        self.parse_modrm(bus)?;
        if self.modrm_is_register() {
            return Err(Exception::ud());
        }
        let (selector, offset) = self.read_far_pointer(bus)?;
        self.segment_set(bus, segment, selector)?;
        let size = self.operand_size();
        self.register_set_size(size, self.modrm_reg(), offset);
        Ok(())
    }

    // ========== BCD Adjustments ==========

    fn daa(&mut self, subtract: bool) {
        let al = self.register_get8_low(gpr::AX);
        let mut result = al;
        let mut carry = self.cf;
        if self.af || al & 0x0F > 9 {
            result = if subtract {
                result.wrapping_sub(6)
            } else {
                result.wrapping_add(6)
            };
            self.af = true;
        } else {
            self.af = false;
        }
        if carry || al > 0x99 {
            result = if subtract {
                result.wrapping_sub(0x60)
            } else {
                result.wrapping_add(0x60)
            };
            carry = true;
        }
        self.register_set8_low(gpr::AX, result);
        self.cf = carry;
        self.set_szp(OpSize::Byte, u64::from(result));
    }

    fn aaa(&mut self, subtract: bool) {
        let al = self.register_get8_low(gpr::AX);
        if self.af || al & 0x0F > 9 {
            let ah = self.register_get8_high(gpr::AX);
            if subtract {
                self.register_set8_low(gpr::AX, al.wrapping_sub(6) & 0x0F);
                self.register_set8_high(gpr::AX, ah.wrapping_sub(1));
            } else {
                self.register_set8_low(gpr::AX, al.wrapping_add(6) & 0x0F);
                self.register_set8_high(gpr::AX, ah.wrapping_add(1));
            }
            self.af = true;
            self.cf = true;
        } else {
            self.register_set8_low(gpr::AX, al & 0x0F);
            self.af = false;
            self.cf = false;
        }
    }

    fn aam(&mut self, base: u8) -> Fallible<()> {
        if base == 0 {
            return Err(Exception::fault(vector::DE));
        }
        let al = self.register_get8_low(gpr::AX);
        self.register_set8_high(gpr::AX, al / base);
        let result = al % base;
        self.register_set8_low(gpr::AX, result);
        self.set_szp(OpSize::Byte, u64::from(result));
        Ok(())
    }

    // ========== ENTER ==========

    fn enter(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let frame_size = u64::from(self.fetch16(bus)?);
        let nesting = self.fetch8(bus)? & 0x1F;
        let size = self.push_operand_size();
        let bp = self.register_get_size(self.stack_size(), gpr::BP);
        self.push_size(bus, size, bp)?;
        let frame_pointer = self.stack_pointer();
        if nesting > 0 {
            for level in 1..nesting {
                let width = size.bytes() as u64;
                let from = bp.wrapping_sub(u64::from(level) * width);
                let value = self.read_stack_at(bus, size, from.wrapping_sub(self.stack_pointer()))?;
                self.push_size(bus, size, value)?;
            }
            self.push_size(bus, size, frame_pointer)?;
        }
        self.register_set_size(self.stack_size(), gpr::BP, frame_pointer);
        self.stack_adjust(frame_size.wrapping_neg());
        Ok(())
    }

    // ========== I/O Units ==========

    fn port_in(&mut self, bus: &mut dyn Bus, port: u16, size: OpSize) -> Fallible<u64> {
        Ok(match size {
            OpSize::Byte => u64::from(self.input8(bus, port)?),
            OpSize::Word => u64::from(self.input16(bus, port)?),
            _ => u64::from(self.input32(bus, port)?),
        })
    }

    fn port_out(&mut self, bus: &mut dyn Bus, port: u16, size: OpSize, value: u64) -> Fallible<()> {
        match size {
            OpSize::Byte => self.output8(bus, port, value as u8),
            OpSize::Word => self.output16(bus, port, value as u16),
            _ => self.output32(bus, port, value as u32),
        }
    }

    // ========== String Instructions ==========

    fn string_instruction(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        let size = if opcode & 1 == 0 { OpSize::Byte } else { self.operand_size() };
        let address_size = self.parser.address_size;
        let delta = |cpu: &Cpu| -> u64 {
            let step = size.bytes() as u64;
            if cpu.df {
                step.wrapping_neg()
            } else {
                step
            }
        };

        let repeated = self.parser.rep_prefix != RepPrefix::None;
        if matches!(opcode, 0x6C..=0x6F) {
            self.check_io_permission()?;
            // capture the restart registers for SMM I/O restart
            self.io_restart.xsi = self.gpr[gpr::SI];
            self.io_restart.xcx = self.gpr[gpr::CX];
            self.io_restart.xdi = self.gpr[gpr::DI];
        }

        loop {
            if repeated {
                let count = self.register_get_size(address_size, gpr::CX);
                if count == 0 {
                    break;
                }
            }

            let source_segment = self
                .parser
                .segment
                .unwrap_or(self.parser.source_segment);
            let si = self.register_get_size(address_size, gpr::SI);
            let di = self.register_get_size(address_size, gpr::DI);
            let step = delta(self);

            match opcode {
                0xA4 | 0xA5 => {
                    // MOVS
                    let value = self.string_read(bus, size, source_segment, si)?;
                    self.string_write(bus, size, seg::ES, di, value)?;
                    self.advance_string(address_size, gpr::SI, step);
                    self.advance_string(address_size, gpr::DI, step);
                }
                0xA6 | 0xA7 => {
                    // CMPS
                    let a = self.string_read(bus, size, source_segment, si)?;
                    let b = self.string_read(bus, size, seg::ES, di)?;
                    self.alu_sub(size, a, b, false);
                    self.advance_string(address_size, gpr::SI, step);
                    self.advance_string(address_size, gpr::DI, step);
                }
                0xAA | 0xAB => {
                    // STOS
                    let value = self.register_get_size(size, gpr::AX);
                    self.string_write(bus, size, seg::ES, di, value)?;
                    self.advance_string(address_size, gpr::DI, step);
                }
                0xAC | 0xAD => {
                    // LODS
                    let value = self.string_read(bus, size, source_segment, si)?;
                    self.register_set_size(size, gpr::AX, value);
                    self.advance_string(address_size, gpr::SI, step);
                }
                0xAE | 0xAF => {
                    // SCAS
                    let a = self.register_get_size(size, gpr::AX);
                    let b = self.string_read(bus, size, seg::ES, di)?;
                    self.alu_sub(size, a, b, false);
                    self.advance_string(address_size, gpr::DI, step);
                }
                0x6C | 0x6D => {
                    // INS
                    let port = self.register_get16(gpr::DX);
                    let value = self.port_in(bus, port, size)?;
                    self.string_write(bus, size, seg::ES, di, value)?;
                    self.advance_string(address_size, gpr::DI, step);
                }
                _ => {
                    // OUTS
                    let port = self.register_get16(gpr::DX);
                    let value = self.string_read(bus, size, source_segment, si)?;
                    self.port_out(bus, port, size, value)?;
                    self.advance_string(address_size, gpr::SI, step);
                }
            }

            if !repeated {
                break;
            }
            let count = self
                .register_get_size(address_size, gpr::CX)
                .wrapping_sub(1)
                & address_size.mask();
            self.register_set_size(address_size, gpr::CX, count);

            // the per-prefix condition only gates the comparing forms
            if matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF) && !self.rep_condition() {
                break;
            }
        }
        Ok(())
    }

    fn string_read(&mut self, bus: &mut dyn Bus, size: OpSize, segment: usize, offset: u64) -> Fallible<u64> {
        Ok(match size {
            OpSize::Byte => u64::from(self.segmented_read8(bus, segment, offset)?),
            OpSize::Word => u64::from(self.segmented_read16(bus, segment, offset)?),
            OpSize::Dword => u64::from(self.segmented_read32(bus, segment, offset)?),
            OpSize::Qword => self.segmented_read64(bus, segment, offset)?,
        })
    }

    fn string_write(&mut self, bus: &mut dyn Bus, size: OpSize, segment: usize, offset: u64, value: u64) -> Fallible<()> {
        match size {
            OpSize::Byte => self.segmented_write8(bus, segment, offset, value as u8),
            OpSize::Word => self.segmented_write16(bus, segment, offset, value as u16),
            OpSize::Dword => self.segmented_write32(bus, segment, offset, value as u32),
            OpSize::Qword => self.segmented_write64(bus, segment, offset, value),
        }
    }

    fn advance_string(&mut self, address_size: OpSize, register: usize, step: u64) {
        let value = self
            .register_get_size(address_size, register)
            .wrapping_add(step)
            & address_size.mask();
        self.register_set_size(address_size, register, value);
    }

    // ========== External FPU Deferral ==========

    fn x87_defer(
        &mut self,
        bus: &mut dyn Bus,
        opcode: u8,
        modrm: u8,
        segment: usize,
        offset: u64,
    ) -> Fallible<()> {
        use crate::x87::SW_B;
        if self.x87.sw & SW_B != 0 {
            if self.x87.fpu_type == crate::traits::FpuType::I8087 {
                // the 8087 relies on the software WAIT convention
                return Ok(());
            }
            // 287+: stall the instruction until the FPU drains
            let old = self.old_xip;
            self.set_xip(old);
            return Ok(());
        }
        self.x87.pending = crate::x87::PendingInstruction {
            fop: (u16::from(opcode & 7) << 8) | u16::from(modrm),
            fcs: self.sr[seg::CS].selector,
            fip: self.old_xip,
            fds: self.sr[segment.min(seg::COUNT - 1)].selector,
            fdp: offset,
            opcode,
            modrm,
            segment,
            offset,
            has_operand: modrm < 0xC0,
        };
        self.x87.sw |= SW_B;
        let _ = bus;
        Ok(())
    }

    // ========== 0F Map ==========

    pub(super) fn execute_0f(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        // NEC families use the 0F map for their own extension set
        if matches!(
            self.traits.family,
            CpuFamily::V20 | CpuFamily::V33 | CpuFamily::V25 | CpuFamily::V55 | CpuFamily::Upd9002
        ) {
            return self.execute_0f_nec(bus, opcode);
        }

        match opcode {
            0x00 => self.group6(bus)?,
            0x01 => self.group7(bus)?,
            0x02 | 0x03 => {
                // LAR / LSL
                if self.is_real_mode() || self.is_v86_mode() {
                    return Err(Exception::ud());
                }
                self.parse_modrm(bus)?;
                let selector = self.read_rm(bus, OpSize::Word)? as u16;
                let size = self.operand_size();
                match self.probe_descriptor(bus, selector)? {
                    Some(descriptor) => {
                        self.zf = true;
                        if opcode == 0x02 {
                            let rights = descriptor.access_rights(size != OpSize::Word);
                            self.register_set_size(size, self.modrm_reg(), u64::from(rights));
                        } else {
                            let limit = descriptor.limit(self.traits.family >= CpuFamily::I386);
                            self.register_set_size(size, self.modrm_reg(), limit & size.mask());
                        }
                    }
                    None => self.zf = false,
                }
            }
            0x05 => {
                if self.traits.family == CpuFamily::I286 {
                    // 286 LOADALL
                    self.privileged()?;
                    self.ice_loadall_286(bus)?;
                } else if self.traits.cpuid_ext1.edx & crate::traits::CPUID_EXT1_EDX_SYSCALL != 0 {
                    self.syscall(bus)?;
                } else {
                    return self.undefined(opcode);
                }
            }
            0x06 => {
                // CLTS
                self.privileged()?;
                self.cr[0] &= !Cr0::TS.bits();
            }
            0x07 => {
                if matches!(self.traits.family, CpuFamily::I386 | CpuFamily::I486) {
                    self.privileged()?;
                    self.ice_loadall_386(bus, 0x60000)?;
                } else if self.traits.cpuid_ext1.edx & crate::traits::CPUID_EXT1_EDX_SYSCALL != 0 {
                    self.sysret(bus)?;
                } else {
                    return self.undefined(opcode);
                }
            }
            0x08 | 0x09 => {
                // INVD / WBINVD: cache maintenance is invisible here
                self.privileged()?;
            }
            0x0B => return Err(Exception::ud()),
            0x1F if self.traits.multibyte_nop => {
                self.parse_modrm(bus)?;
            }

            0x10 | 0x11 | 0x28 | 0x29 => self.sse_move(bus, opcode)?,
            0x6E | 0x7E | 0x6F | 0x7F => self.mmx_move(bus, opcode)?,
            0x77 => {
                // EMMS
                if self.traits.cpuid1.edx & CPUID1_EDX_MMX == 0 {
                    return Err(Exception::ud());
                }
                self.x87.tw = 0xFFFF;
            }

            0x20..=0x23 => {
                self.privileged()?;
                self.parse_modrm(bus)?;
                let number = self.modrm_reg();
                let size = if self.is_64bit_mode() { OpSize::Qword } else { OpSize::Dword };
                match opcode {
                    0x20 => {
                        let value = self.control_register_get(number)?;
                        self.register_set_size(size, self.modrm_rm(), value);
                    }
                    0x22 => {
                        let value = self.register_get_size(size, self.modrm_rm());
                        self.control_register_set(number, value)?;
                    }
                    0x21 => {
                        let value = self.debug_register_get(number)?;
                        self.register_set_size(size, self.modrm_rm(), value);
                    }
                    _ => {
                        let value = self.register_get_size(size, self.modrm_rm());
                        self.debug_register_set(number, value)?;
                    }
                }
            }
            0x24 | 0x26 => {
                // MOV from/to test registers (386/486 era)
                if self.traits.family > CpuFamily::I486 {
                    return Err(Exception::ud());
                }
                self.privileged()?;
                self.parse_modrm(bus)?;
                let number = self.modrm_reg();
                if opcode == 0x24 {
                    let value = self.test_register_get(number)?;
                    self.register_set32(self.modrm_rm(), value);
                } else {
                    let value = self.register_get32(self.modrm_rm());
                    self.test_register_set(number, value)?;
                }
            }

            0x30 => {
                // WRMSR
                self.privileged()?;
                let index = self.register_get32(gpr::CX);
                let value = u64::from(self.register_get32(gpr::AX))
                    | (u64::from(self.register_get32(gpr::DX)) << 32);
                self.msr_set(index, value)?;
            }
            0x31 => {
                // RDTSC
                if self.traits.cpuid1.edx & CPUID1_EDX_TSC == 0 {
                    return Err(Exception::ud());
                }
                if self.cr[4] & Cr4::TSD.bits() != 0 && self.cpl != 0 {
                    return Err(Exception::gp(0));
                }
                self.tsc = self.tsc.wrapping_add(1);
                let tsc = self.tsc;
                self.register_set32(gpr::AX, tsc as u32);
                self.register_set32(gpr::DX, (tsc >> 32) as u32);
            }
            0x32 => {
                // RDMSR
                self.privileged()?;
                let index = self.register_get32(gpr::CX);
                let value = self.msr_get(index)?;
                self.register_set32(gpr::AX, value as u32);
                self.register_set32(gpr::DX, (value >> 32) as u32);
            }
            0x34 => self.sysenter(bus)?,
            0x35 => self.sysexit(bus)?,
            0x38 if self.traits.family == CpuFamily::Cyrix => {
                // SMINT
                if !self.smint_instruction_valid() {
                    return Err(Exception::ud());
                }
                let mut attributes = SmiAttributes::external();
                attributes.source = SmiSource::Smint;
                self.smm_enter(bus, attributes)?;
            }

            0x40..=0x4F => {
                // CMOVcc
                self.parse_modrm(bus)?;
                let size = self.operand_size();
                let value = self.read_rm(bus, size)?;
                if self.check_condition(opcode & 0x0F) {
                    self.register_set_size(size, self.modrm_reg(), value);
                }
            }

            0x80..=0x8F => {
                let displacement = Self::sign_extend(
                    if self.operand_size() == OpSize::Word { OpSize::Word } else { OpSize::Dword },
                    self.fetch_immediate(bus)?,
                );
                if self.check_condition(opcode & 0x0F) {
                    let target = self.relative_target(displacement);
                    self.jump_near(target)?;
                }
            }
            0x90..=0x9F => {
                self.parse_modrm(bus)?;
                let value = u64::from(self.check_condition(opcode & 0x0F));
                self.write_rm(bus, OpSize::Byte, value)?;
            }

            0xA0 => {
                let value = self.segment_get(seg::FS);
                self.push_operand(bus, u64::from(value))?;
            }
            0xA1 => {
                let value = self.pop_operand(bus)?;
                self.segment_set(bus, seg::FS, value as u16)?;
            }
            0xA2 => self.cpuid(),
            0xA3 | 0xAB | 0xB3 | 0xBB => self.bit_test(bus, opcode, None)?,
            0xA4 | 0xA5 | 0xAC | 0xAD => self.double_shift(bus, opcode)?,
            0xA6 | 0xA7 => {
                // 80386 B0 stepping only: IBTS/XBTS
                if !(self.traits.family == CpuFamily::I386
                    && self.traits.subtype == CpuSubtype::Classic)
                {
                    return Err(Exception::ud());
                }
                self.bitfield_386b0(bus, opcode)?;
            }
            0xA8 => {
                let value = self.segment_get(seg::GS);
                self.push_operand(bus, u64::from(value))?;
            }
            0xA9 => {
                let value = self.pop_operand(bus)?;
                self.segment_set(bus, seg::GS, value as u16)?;
            }
            0xAA => {
                // RSM
                if !self.smm_instruction_valid() {
                    return Err(Exception::ud());
                }
                self.smm_resume(bus)?;
            }
            0xAE => self.group15(bus)?,
            0xAF => {
                self.parse_modrm(bus)?;
                let size = self.operand_size();
                let x = Self::sign_extend(size, self.register_get_size(size, self.modrm_reg()));
                let y = Self::sign_extend(size, self.read_rm(bus, size)?);
                self.imul_flags(size, x, y);
                self.register_set_size(size, self.modrm_reg(), x.wrapping_mul(y) as u64);
            }

            0xB0 | 0xB1 => {
                // CMPXCHG
                self.parse_modrm(bus)?;
                let size = if opcode == 0xB0 { OpSize::Byte } else { self.operand_size() };
                let destination = self.read_rm(bus, size)?;
                let accumulator = self.register_get_size(size, gpr::AX);
                self.alu_sub(size, accumulator, destination, false);
                if self.zf {
                    let source = self.register_get_size(size, self.modrm_reg());
                    self.write_rm(bus, size, source)?;
                } else {
                    self.register_set_size(size, gpr::AX, destination);
                }
            }
            0xB2 => self.load_far_pointer(bus, seg::SS)?,
            0xB4 => self.load_far_pointer(bus, seg::FS)?,
            0xB5 => self.load_far_pointer(bus, seg::GS)?,
            0xB6 | 0xB7 => {
                self.parse_modrm(bus)?;
                let from = if opcode == 0xB6 { OpSize::Byte } else { OpSize::Word };
                let size = self.operand_size();
                let value = self.read_rm(bus, from)?;
                self.register_set_size(size, self.modrm_reg(), value & from.mask());
            }
            0xBA => {
                self.parse_modrm(bus)?;
                let operation = (self.parser.modrm >> 3) & 7;
                if operation < 4 {
                    return Err(Exception::ud());
                }
                let bit = self.fetch8(bus)?;
                self.bit_test(bus, 0xA3 + ((operation - 4) << 3), Some(bit))?;
            }
            0xBC | 0xBD => {
                // BSF / BSR
                self.parse_modrm(bus)?;
                let size = self.operand_size();
                let value = self.read_rm(bus, size)? & size.mask();
                if value == 0 {
                    self.zf = true;
                } else {
                    self.zf = false;
                    let index = if opcode == 0xBC {
                        value.trailing_zeros()
                    } else {
                        63 - value.leading_zeros()
                    };
                    self.register_set_size(size, self.modrm_reg(), u64::from(index));
                }
            }
            0xBE | 0xBF => {
                self.parse_modrm(bus)?;
                let from = if opcode == 0xBE { OpSize::Byte } else { OpSize::Word };
                let size = self.operand_size();
                let value = Self::sign_extend(from, self.read_rm(bus, from)?);
                self.register_set_size(size, self.modrm_reg(), value as u64);
            }

            0xC0 | 0xC1 => {
                // XADD
                self.parse_modrm(bus)?;
                let size = if opcode == 0xC0 { OpSize::Byte } else { self.operand_size() };
                let destination = self.read_rm(bus, size)?;
                let source = self.register_get_size(size, self.modrm_reg());
                let sum = self.alu_add(size, destination, source, false);
                self.register_set_size(size, self.modrm_reg(), destination);
                self.write_rm(bus, size, sum)?;
            }
            0xC7 => {
                // CMPXCHG8B / CMPXCHG16B
                self.parse_modrm(bus)?;
                if self.modrm_is_register() || (self.parser.modrm >> 3) & 7 != 1 {
                    return Err(Exception::ud());
                }
                self.finish_operand_address();
                let segment = self.operand_segment();
                let offset = self.parser.address_offset;
                let wide = self.parser.operation_size == OpSize::Qword;
                let width = if wide { 8 } else { 4 };
                let low = self.read_memory_unit(bus, segment, offset, width)?;
                let high = self.read_memory_unit(bus, segment, offset + width as u64, width)?;
                let expect_low = self.register_get_unit(gpr::AX, width);
                let expect_high = self.register_get_unit(gpr::DX, width);
                if low == expect_low && high == expect_high {
                    self.zf = true;
                    let new_low = self.register_get_unit(gpr::BX, width);
                    let new_high = self.register_get_unit(gpr::CX, width);
                    self.write_memory_unit(bus, segment, offset, width, new_low)?;
                    self.write_memory_unit(bus, segment, offset + width as u64, width, new_high)?;
                } else {
                    self.zf = false;
                    self.register_set_unit(gpr::AX, width, low);
                    self.register_set_unit(gpr::DX, width, high);
                }
            }
            0xC8..=0xCF => {
                // BSWAP
                let number = usize::from(opcode & 7) | self.parser.rex_b;
                if self.parser.operation_size == OpSize::Qword {
                    let value = self.register_get64(number);
                    self.register_set64(number, value.swap_bytes());
                } else {
                    let value = self.register_get32(number);
                    self.register_set32(number, value.swap_bytes());
                }
            }

            0xE0..=0xE2 if self.traits.family == CpuFamily::Extended => {
                self.queue_operation(bus, opcode)?;
            }

            _ => return self.undefined(opcode),
        }
        Ok(())
    }

    fn read_memory_unit(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, width: usize) -> Fallible<u64> {
        Ok(if width == 8 {
            self.segmented_read64(bus, segment, offset)?
        } else {
            u64::from(self.segmented_read32(bus, segment, offset)?)
        })
    }

    fn write_memory_unit(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, width: usize, value: u64) -> Fallible<()> {
        if width == 8 {
            self.segmented_write64(bus, segment, offset, value)
        } else {
            self.segmented_write32(bus, segment, offset, value as u32)
        }
    }

    fn register_get_unit(&self, number: usize, width: usize) -> u64 {
        if width == 8 {
            self.register_get64(number)
        } else {
            u64::from(self.register_get32(number))
        }
    }

    fn register_set_unit(&mut self, number: usize, width: usize, value: u64) {
        if width == 8 {
            self.register_set64(number, value);
        } else {
            self.register_set32(number, value as u32);
        }
    }

    // ========== BT Group ==========

    fn bit_test(&mut self, bus: &mut dyn Bus, opcode: u8, immediate: Option<u8>) -> Fallible<()> {
        if immediate.is_none() {
            self.parse_modrm(bus)?;
        }
        let size = self.operand_size();
        let bits = size.bytes() as u64 * 8;
        let offset_value = match immediate {
            Some(bit) => u64::from(bit),
            None => self.register_get_size(size, self.modrm_reg()),
        };

        let (value, bit_index) = if self.modrm_is_register() || immediate.is_some() {
            // register forms and immediate bit numbers wrap inside the
            // operand
            (self.read_rm(bus, size)?, offset_value % bits)
        } else {
            // register-indexed memory forms address beyond the operand
            let signed = Self::sign_extend(size, offset_value);
            let unit_offset = signed.div_euclid(bits as i64);
            let bit_index = signed.rem_euclid(bits as i64) as u64;
            self.finish_operand_address();
            self.parser.address_offset = self
                .parser
                .address_offset
                .wrapping_add((unit_offset * size.bytes() as i64) as u64)
                & self.parser.address_size.mask();
            (self.read_rm(bus, size)?, bit_index)
        };

        self.cf = value >> bit_index & 1 != 0;
        let modified = match opcode {
            0xAB => Some(value | (1 << bit_index)),
            0xB3 => Some(value & !(1 << bit_index)),
            0xBB => Some(value ^ (1 << bit_index)),
            _ => None,
        };
        if let Some(result) = modified {
            self.write_rm(bus, size, result)?;
        }
        Ok(())
    }

    fn double_shift(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        self.parse_modrm(bus)?;
        let size = self.operand_size();
        let bits = size.bytes() as u32 * 8;
        let count = if opcode & 1 == 0 {
            self.fetch8(bus)?
        } else {
            self.register_get8_low(gpr::CX)
        };
        let count = u32::from(count) & if size == OpSize::Qword { 63 } else { 31 };
        if count == 0 {
            return Ok(());
        }
        let destination = self.read_rm(bus, size)? & size.mask();
        let source = self.register_get_size(size, self.modrm_reg()) & size.mask();
        let left = opcode & 8 == 0;
        let wide = if left {
            (u128::from(destination) << bits) | u128::from(source)
        } else {
            (u128::from(source) << bits) | u128::from(destination)
        };
        let result = if left {
            ((wide << count) >> bits) as u64 & size.mask()
        } else {
            (wide >> count) as u64 & size.mask()
        };
        self.cf = if left {
            destination >> (bits - count) & 1 != 0
        } else {
            destination >> (count - 1) & 1 != 0
        };
        self.of = count == 1
            && (result ^ destination) & (1 << (bits - 1)) != 0;
        self.set_szp(size, result);
        self.write_rm(bus, size, result)
    }

    /// The 80386 B0 stepping's short-lived bit field pair. XBTS extracts
    /// `CL` bits starting at `AX` from the operand; IBTS inserts them.
    fn bitfield_386b0(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        self.parse_modrm(bus)?;
        let size = self.operand_size();
        let start = u32::from(self.register_get8_low(gpr::AX)) & 31;
        let length = u32::from(self.register_get8_low(gpr::CX)) & 31;
        let mask = if length >= 63 { u64::MAX } else { (1u64 << length) - 1 };
        let value = self.read_rm(bus, size)?;
        if opcode == 0xA6 {
            // XBTS r, r/m
            let extracted = (value >> start) & mask;
            self.register_set_size(size, self.modrm_reg(), extracted);
        } else {
            // IBTS r/m, r
            let source = self.register_get_size(size, self.modrm_reg()) & mask;
            let result = (value & !(mask << start)) | (source << start);
            self.write_rm(bus, size, result & size.mask())?;
        }
        Ok(())
    }

    // ========== Group 6/7: System Table Instructions ==========

    fn group6(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        if self.traits.family < CpuFamily::I286 {
            return self.undefined(0x00);
        }
        self.parse_modrm(bus)?;
        let operation = (self.parser.modrm >> 3) & 7;
        match operation {
            0 => {
                // SLDT
                if self.is_real_mode() || self.is_v86_mode() {
                    return Err(Exception::ud());
                }
                let selector = self.sr[seg::LDTR].selector;
                self.write_rm(bus, OpSize::Word, u64::from(selector))?;
            }
            1 => {
                if self.is_real_mode() || self.is_v86_mode() {
                    return Err(Exception::ud());
                }
                let selector = self.sr[seg::TR].selector;
                self.write_rm(bus, OpSize::Word, u64::from(selector))?;
            }
            2 => {
                self.privileged()?;
                let selector = self.read_rm(bus, OpSize::Word)? as u16;
                self.ldtr_load(bus, selector)?;
            }
            3 => {
                self.privileged()?;
                let selector = self.read_rm(bus, OpSize::Word)? as u16;
                self.tr_load(bus, selector)?;
            }
            4 | 5 => {
                // VERR / VERW
                if self.is_real_mode() || self.is_v86_mode() {
                    return Err(Exception::ud());
                }
                let selector = self.read_rm(bus, OpSize::Word)? as u16;
                self.zf = match self.probe_descriptor(bus, selector)? {
                    Some(descriptor) if !descriptor.is_system() => {
                        if operation == 4 {
                            !descriptor.is_executable() || descriptor.is_readable()
                        } else {
                            !descriptor.is_executable() && descriptor.is_writable()
                        }
                    }
                    _ => false,
                };
            }
            _ => return Err(Exception::ud()),
        }
        Ok(())
    }

    fn group7(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        if self.traits.family < CpuFamily::I286 {
            return self.undefined(0x01);
        }
        self.parse_modrm(bus)?;
        let operation = (self.parser.modrm >> 3) & 7;
        let base_width: u64 = if self.is_long_mode() {
            8
        } else {
            4
        };
        match operation {
            0 | 1 => {
                // SGDT / SIDT
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                let table = if operation == 0 { seg::GDTR } else { seg::IDTR };
                self.finish_operand_address();
                let segment = self.operand_segment();
                let offset = self.parser.address_offset;
                let limit = self.sr[table].limit as u16;
                let base = self.sr[table].base;
                self.segmented_write16(bus, segment, offset, limit)?;
                if base_width == 8 {
                    self.segmented_write64(bus, segment, offset + 2, base)?;
                } else {
                    // the 286 stores a 24-bit base with an FF top byte
                    let stored = if self.traits.family < CpuFamily::I386 {
                        (base as u32 & 0x00FF_FFFF) | 0xFF00_0000
                    } else {
                        base as u32
                    };
                    self.segmented_write32(bus, segment, offset + 2, stored)?;
                }
            }
            2 | 3 => {
                // LGDT / LIDT
                self.privileged()?;
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                let table = if operation == 2 { seg::GDTR } else { seg::IDTR };
                self.finish_operand_address();
                let segment = self.operand_segment();
                let offset = self.parser.address_offset;
                let limit = self.segmented_read16(bus, segment, offset)?;
                let base = if base_width == 8 {
                    self.segmented_read64(bus, segment, offset + 2)?
                } else {
                    let raw = self.segmented_read32(bus, segment, offset + 2)?;
                    if self.traits.family < CpuFamily::I386
                        || self.parser.operation_size == OpSize::Word
                    {
                        u64::from(raw & 0x00FF_FFFF)
                    } else {
                        u64::from(raw)
                    }
                };
                self.sr[table].limit = u32::from(limit);
                self.sr[table].base = base;
                log::trace!(
                    "{} base {:#x} limit {:#x}",
                    if table == seg::GDTR { "lgdt" } else { "lidt" },
                    base,
                    limit
                );
            }
            4 => {
                // SMSW
                let value = self.cr[0] as u16;
                self.write_rm(bus, OpSize::Word, u64::from(value))?;
            }
            6 => {
                // LMSW: can set PE but never clear it
                self.privileged()?;
                let value = self.read_rm(bus, OpSize::Word)?;
                let keep = self.cr[0] & !0xE;
                self.cr[0] = keep | (value & 0xE) | (self.cr[0] & 1) | (value & 1);
                self.prefetch_queue_flush();
            }
            7 => {
                // INVLPG: no TLB is modelled, but the encoding must exist
                self.privileged()?;
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
            }
            _ => return Err(Exception::ud()),
        }
        Ok(())
    }

    // ========== SYSENTER / SYSEXIT / SYSCALL / SYSRET ==========

    fn sysenter(&mut self, _bus: &mut dyn Bus) -> Fallible<()> {
        if self.traits.cpuid1.edx & CPUID1_EDX_SEP == 0 {
            return Err(Exception::ud());
        }
        if self.sysenter_cs & 0xFFFC == 0 {
            return Err(Exception::gp(0));
        }
        let cs = self.sysenter_cs as u16 & !3;
        self.sr[seg::CS] = crate::regs::Segment {
            selector: cs,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: desc::P | desc::S | desc::X | desc::WR | desc::A | desc::D | desc::G,
        };
        self.sr[seg::SS] = crate::regs::Segment {
            selector: cs + 8,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: desc::P | desc::S | desc::WR | desc::A | desc::D | desc::G,
        };
        self.set_cpl(0);
        self.intf = false;
        self.vm = false;
        self.gpr[gpr::SP] = self.sysenter_esp;
        self.set_xip(self.sysenter_eip);
        Ok(())
    }

    fn sysexit(&mut self, _bus: &mut dyn Bus) -> Fallible<()> {
        if self.traits.cpuid1.edx & CPUID1_EDX_SEP == 0 {
            return Err(Exception::ud());
        }
        self.privileged()?;
        if self.sysenter_cs & 0xFFFC == 0 {
            return Err(Exception::gp(0));
        }
        let cs = (self.sysenter_cs as u16 + 16) | 3;
        self.sr[seg::CS] = crate::regs::Segment {
            selector: cs,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: desc::P | desc::S | desc::X | desc::WR | desc::A | desc::D | desc::G
                | (3 << desc::DPL_SHIFT),
        };
        self.sr[seg::SS] = crate::regs::Segment {
            selector: cs + 8,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: desc::P | desc::S | desc::WR | desc::A | desc::D | desc::G
                | (3 << desc::DPL_SHIFT),
        };
        self.set_cpl(3);
        self.gpr[gpr::SP] = u64::from(self.register_get32(gpr::CX));
        let target = u64::from(self.register_get32(gpr::DX));
        self.set_xip(target);
        Ok(())
    }

    fn syscall(&mut self, _bus: &mut dyn Bus) -> Fallible<()> {
        if self.efer & crate::regs::Efer::SCE.bits() == 0 {
            return Err(Exception::ud());
        }
        let cs_base = ((self.star >> 32) & 0xFFFF) as u16 & !3;
        if self.is_long_mode() {
            self.register_set64(gpr::CX, self.xip);
            let flags = self.flags_get64();
            self.register_set64(11, flags);
            let masked = flags & !self.fmask;
            self.flags_set64(masked & !flags::RF);
            self.sr[seg::CS] = crate::regs::Segment {
                selector: cs_base,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::X | desc::WR | desc::A | desc::L | desc::G,
            };
            self.sr[seg::SS] = crate::regs::Segment {
                selector: cs_base + 8,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::WR | desc::A | desc::D | desc::G,
            };
            self.set_cpl(0);
            self.set_xip(self.lstar);
        } else {
            self.register_set32(gpr::CX, self.xip as u32);
            self.sr[seg::CS] = crate::regs::Segment {
                selector: cs_base,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::X | desc::WR | desc::A | desc::D | desc::G,
            };
            self.sr[seg::SS] = crate::regs::Segment {
                selector: cs_base + 8,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::WR | desc::A | desc::D | desc::G,
            };
            self.set_cpl(0);
            self.intf = false;
            let target = self.star & 0xFFFF_FFFF;
            self.set_xip(target);
        }
        Ok(())
    }

    fn sysret(&mut self, _bus: &mut dyn Bus) -> Fallible<()> {
        if self.efer & crate::regs::Efer::SCE.bits() == 0 {
            return Err(Exception::ud());
        }
        self.privileged()?;
        let cs_base = ((self.star >> 48) & 0xFFFF) as u16;
        if self.is_long_mode() && self.parser.operation_size == OpSize::Qword {
            let target = self.register_get64(gpr::CX);
            self.check_canonical(Some(seg::CS), target, 0)?;
            let flags = self.register_get64(11);
            self.flags_set64(flags);
            self.sr[seg::CS] = crate::regs::Segment {
                selector: (cs_base + 16) | 3,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::X | desc::WR | desc::A | desc::L | desc::G
                    | (3 << desc::DPL_SHIFT),
            };
            self.set_cpl(3);
            self.set_xip(target);
        } else {
            let target = u64::from(self.register_get32(gpr::CX));
            self.sr[seg::CS] = crate::regs::Segment {
                selector: cs_base | 3,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::X | desc::WR | desc::A | desc::D | desc::G
                    | (3 << desc::DPL_SHIFT),
            };
            self.set_cpl(3);
            self.set_xip(target);
        }
        self.sr[seg::SS] = crate::regs::Segment {
            selector: (cs_base + 8) | 3,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: desc::P | desc::S | desc::WR | desc::A | desc::D | desc::G
                | (3 << desc::DPL_SHIFT),
        };
        Ok(())
    }

    // ========== CPUID ==========

    fn cpuid(&mut self) {
        let leaf = self.register_get32(gpr::AX);
        let highest_standard = self.traits.cpuid0.eax;
        let highest_extended = self.traits.cpuid_ext0.eax;
        let leaf = if leaf < 0x8000_0000 {
            leaf.min(highest_standard)
        } else if leaf > highest_extended {
            highest_standard
        } else {
            leaf
        };
        let image = match leaf {
            0 => self.traits.cpuid0,
            1 => self.traits.cpuid1,
            7 => {
                if self.register_get32(gpr::CX) == 0 {
                    self.traits.cpuid7_0
                } else {
                    self.traits.cpuid7_1
                }
            }
            0x8000_0000 => self.traits.cpuid_ext0,
            0x8000_0001 => self.traits.cpuid_ext1,
            _ => crate::traits::CpuidLeaf::default(),
        };
        self.register_set32(gpr::AX, image.eax);
        self.register_set32(gpr::BX, image.ebx);
        self.register_set32(gpr::CX, image.ecx);
        self.register_set32(gpr::DX, image.edx);
    }

    // ========== MMX / SSE Moves ==========

    fn mmx_move(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        if self.traits.cpuid1.edx & CPUID1_EDX_MMX == 0 {
            return Err(Exception::ud());
        }
        let sse = self.parser.simd_prefix != SimdPrefix::None
            && self.traits.cpuid1.edx & CPUID1_EDX_SSE != 0;
        self.parse_modrm(bus)?;
        let register = self.modrm_reg();
        match opcode {
            0x6E => {
                // MOVD/MOVQ to vector register
                let size = if self.parser.rex_w { OpSize::Qword } else { OpSize::Dword };
                let value = self.read_rm(bus, size)?;
                if sse {
                    self.xmm[register].q = [value & size.mask(), 0, 0, 0, 0, 0, 0, 0];
                } else {
                    self.mmx_set(register, value & size.mask())?;
                }
            }
            0x7E => {
                if self.parser.simd_prefix == SimdPrefix::OpF3 {
                    // MOVQ xmm, xmm/m64
                    let value = if self.modrm_is_register() {
                        self.xmm[self.modrm_rm()].q[0]
                    } else {
                        self.finish_operand_address();
                        let segment = self.operand_segment();
                        let offset = self.parser.address_offset;
                        self.segmented_read64(bus, segment, offset)?
                    };
                    self.xmm[register].q = [value, 0, 0, 0, 0, 0, 0, 0];
                } else {
                    let size = if self.parser.rex_w { OpSize::Qword } else { OpSize::Dword };
                    let value = if sse {
                        self.xmm[register].q[0]
                    } else {
                        self.mmx_get(register)?
                    };
                    self.write_rm(bus, size, value & size.mask())?;
                }
            }
            0x6F => {
                if sse {
                    let (low, high) = if self.modrm_is_register() {
                        (self.xmm[self.modrm_rm()].q[0], self.xmm[self.modrm_rm()].q[1])
                    } else {
                        self.finish_operand_address();
                        let segment = self.operand_segment();
                        let offset = self.parser.address_offset;
                        self.segmented_read128(bus, segment, offset)?
                    };
                    self.xmm[register].q[0] = low;
                    self.xmm[register].q[1] = high;
                } else {
                    let value = if self.modrm_is_register() {
                        self.mmx_get(self.modrm_rm())?
                    } else {
                        self.finish_operand_address();
                        let segment = self.operand_segment();
                        let offset = self.parser.address_offset;
                        self.segmented_read64(bus, segment, offset)?
                    };
                    self.mmx_set(register, value)?;
                }
            }
            _ => {
                // 0x7F: stores
                if sse {
                    let low = self.xmm[register].q[0];
                    let high = self.xmm[register].q[1];
                    if self.modrm_is_register() {
                        self.xmm[self.modrm_rm()].q[0] = low;
                        self.xmm[self.modrm_rm()].q[1] = high;
                    } else {
                        self.finish_operand_address();
                        let segment = self.operand_segment();
                        let offset = self.parser.address_offset;
                        self.segmented_write128(bus, segment, offset, low, high)?;
                    }
                } else {
                    let value = self.mmx_get(register)?;
                    if self.modrm_is_register() {
                        self.mmx_set(self.modrm_rm(), value)?;
                    } else {
                        self.finish_operand_address();
                        let segment = self.operand_segment();
                        let offset = self.parser.address_offset;
                        self.segmented_write64(bus, segment, offset, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn sse_move(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        if self.traits.cpuid1.edx & CPUID1_EDX_SSE == 0 {
            return Err(Exception::ud());
        }
        if self.cr[4] & Cr4::OSFXSR.bits() == 0 {
            return Err(Exception::ud());
        }
        self.parse_modrm(bus)?;
        let register = self.modrm_reg();
        let load = opcode & 1 == 0;
        if self.modrm_is_register() {
            let other = self.modrm_rm();
            if load {
                self.xmm[register].q[0] = self.xmm[other].q[0];
                self.xmm[register].q[1] = self.xmm[other].q[1];
            } else {
                self.xmm[other].q[0] = self.xmm[register].q[0];
                self.xmm[other].q[1] = self.xmm[register].q[1];
            }
            return Ok(());
        }
        self.finish_operand_address();
        let segment = self.operand_segment();
        let offset = self.parser.address_offset;
        if load {
            let (low, high) = self.segmented_read128(bus, segment, offset)?;
            self.xmm[register].q[0] = low;
            self.xmm[register].q[1] = high;
        } else {
            let low = self.xmm[register].q[0];
            let high = self.xmm[register].q[1];
            self.segmented_write128(bus, segment, offset, low, high)?;
        }
        Ok(())
    }

    fn group15(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        self.parse_modrm(bus)?;
        let operation = (self.parser.modrm >> 3) & 7;
        match operation {
            0 | 1 => {
                // FXSAVE / FXRSTOR
                if self.traits.cpuid1.edx & CPUID1_EDX_FXSR == 0 {
                    return Err(Exception::ud());
                }
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                self.finish_operand_address();
                let segment = self.operand_segment();
                let offset = self.parser.address_offset;
                let wide = self.parser.rex_w;
                if operation == 0 {
                    self.fxsave(bus, segment, offset, wide)?;
                } else {
                    self.fxrstor(bus, segment, offset, wide)?;
                }
            }
            2 => {
                // LDMXCSR
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                let value = self.read_rm(bus, OpSize::Dword)? as u32;
                if value & !0xFFFF != 0 {
                    return Err(Exception::gp(0));
                }
                self.mxcsr = value;
            }
            3 => {
                if self.modrm_is_register() {
                    return Err(Exception::ud());
                }
                let value = self.mxcsr;
                self.write_rm(bus, OpSize::Dword, u64::from(value))?;
            }
            // fences are serialization points the interpreter already has
            5..=7 if self.modrm_is_register() => {}
            _ => return Err(Exception::ud()),
        }
        Ok(())
    }

    // ========== NEC 0F Map ==========

    fn execute_0f_nec(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        match opcode {
            0x10..=0x17 => {
                // TEST1/CLR1/SET1/NOT1 with the bit index in CL
                self.parse_modrm(bus)?;
                let size = if opcode & 1 == 0 { OpSize::Byte } else { self.operand_size() };
                let bit = u64::from(self.register_get8_low(gpr::CX))
                    % (size.bytes() as u64 * 8);
                self.nec_bit_operation(bus, opcode, size, bit)?;
            }
            0x18..=0x1F => {
                // same group with an immediate bit index
                self.parse_modrm(bus)?;
                let size = if opcode & 1 == 0 { OpSize::Byte } else { self.operand_size() };
                let bit = u64::from(self.fetch8(bus)?) % (size.bytes() as u64 * 8);
                self.nec_bit_operation(bus, opcode, size, bit)?;
            }
            0x20 | 0x22 | 0x26 => {
                // ADD4S / SUB4S / CMP4S packed BCD strings
                self.nec_bcd_string(bus, opcode)?;
            }
            0x28 | 0x2A => {
                // ROL4 / ROR4: rotate AL through a memory nibble
                self.parse_modrm(bus)?;
                let value = self.read_rm(bus, OpSize::Byte)? as u8;
                let al = self.register_get8_low(gpr::AX);
                if opcode == 0x28 {
                    let result = (value << 4) | (al & 0x0F);
                    self.register_set8_low(gpr::AX, (al & 0xF0) | (value >> 4));
                    self.write_rm(bus, OpSize::Byte, u64::from(result))?;
                } else {
                    let result = (value >> 4) | (al << 4);
                    self.register_set8_low(gpr::AX, (al & 0xF0) | (value & 0x0F));
                    self.write_rm(bus, OpSize::Byte, u64::from(result))?;
                }
            }
            0x31 | 0x39 => {
                // INS reg8, reg8 / INS reg8, imm4 bit field insert
                self.parse_modrm(bus)?;
                let length = if opcode == 0x31 {
                    self.register_get8(self.modrm_reg()) & 0x0F
                } else {
                    self.fetch8(bus)? & 0x0F
                };
                self.nec_bitfield_insert(bus, u32::from(length) + 1)?;
            }
            0x33 | 0x3B => {
                // EXT reg8, reg8 / EXT reg8, imm4 bit field extract
                self.parse_modrm(bus)?;
                let length = if opcode == 0x33 {
                    self.register_get8(self.modrm_reg()) & 0x0F
                } else {
                    self.fetch8(bus)? & 0x0F
                };
                self.nec_bitfield_extract(bus, u32::from(length) + 1)?;
            }
            0xE0 if self.traits.family == CpuFamily::V55 => self.queue_operation(bus, 0xE0)?,
            0xE1 if self.traits.family == CpuFamily::V55 => self.queue_operation(bus, 0xE1)?,
            0xE2 if self.traits.family == CpuFamily::V55 => self.queue_operation(bus, 0xE2)?,
            0xFF => {
                // BRKEM: enter 8080/Z80 emulation through an interrupt
                if !self.traits.has_x80_mode() {
                    return self.undefined(opcode);
                }
                let number = self.fetch8(bus)?;
                self.md_enabled = true;
                self.enter_interrupt(bus, Exception::int_n(number))?;
                self.md = false;
                self.load_x80_registers();
                self.result = StepResult::CpuInterrupt(number);
            }
            _ => return self.undefined(opcode),
        }
        Ok(())
    }

    fn nec_bit_operation(&mut self, bus: &mut dyn Bus, opcode: u8, size: OpSize, bit: u64) -> Fallible<()> {
        let value = self.read_rm(bus, size)?;
        match (opcode >> 1) & 3 {
            0 => {
                // TEST1
                self.zf = value >> bit & 1 == 0;
                self.cf = false;
                self.of = false;
            }
            1 => {
                self.write_rm(bus, size, value & !(1 << bit))?;
            }
            2 => {
                self.write_rm(bus, size, value | (1 << bit))?;
            }
            _ => {
                self.write_rm(bus, size, value ^ (1 << bit))?;
            }
        }
        Ok(())
    }

    /// Packed decimal string arithmetic over CL digits at DS:SI and ES:DI.
    fn nec_bcd_string(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        let digits = u64::from(self.register_get8_low(gpr::CX));
        let bytes = digits.div_ceil(2);
        let source_segment = self.parser.segment.unwrap_or(seg::DS);
        let si = u64::from(self.register_get16(gpr::SI));
        let di = u64::from(self.register_get16(gpr::DI));
        let mut borrow_or_carry = 0u8;
        let mut all_zero = true;
        for index in 0..bytes {
            let source = self.segmented_read8(bus, source_segment, si + index)?;
            let destination = self.segmented_read8(bus, seg::ES, di + index)?;
            let (mut low, mut high);
            match opcode {
                0x20 => {
                    // ADD4S
                    low = (destination & 0x0F) + (source & 0x0F) + borrow_or_carry;
                    borrow_or_carry = u8::from(low > 9);
                    if low > 9 {
                        low -= 10;
                    }
                    high = (destination >> 4) + (source >> 4) + borrow_or_carry;
                    borrow_or_carry = u8::from(high > 9);
                    if high > 9 {
                        high -= 10;
                    }
                }
                _ => {
                    // SUB4S / CMP4S
                    let mut l = i16::from(destination & 0x0F)
                        - i16::from(source & 0x0F)
                        - i16::from(borrow_or_carry);
                    borrow_or_carry = u8::from(l < 0);
                    if l < 0 {
                        l += 10;
                    }
                    let mut h = i16::from(destination >> 4)
                        - i16::from(source >> 4)
                        - i16::from(borrow_or_carry);
                    borrow_or_carry = u8::from(h < 0);
                    if h < 0 {
                        h += 10;
                    }
                    low = l as u8;
                    high = h as u8;
                }
            }
            if low != 0 || high != 0 {
                all_zero = false;
            }
            let result = (high << 4) | low;
            if opcode != 0x26 {
                self.segmented_write8(bus, seg::ES, di + index, result)?;
            }
        }
        self.cf = borrow_or_carry != 0;
        self.zf = all_zero;
        Ok(())
    }

    fn nec_bitfield_insert(&mut self, bus: &mut dyn Bus, length: u32) -> Fallible<()> {
        // destination bit address in ES:DI.AH (bit offset in AH low bits)
        let offset = u32::from(self.register_get8_high(gpr::AX)) & 15;
        let value = self.register_get16(gpr::AX) & ((1 << length) - 1) as u16;
        let di = u64::from(self.register_get16(gpr::DI));
        let byte_count = (offset + length + 7) / 8;
        let mut buffer = [0u8; 4];
        for (i, slot) in buffer.iter_mut().take(byte_count as usize).enumerate() {
            *slot = self.segmented_read8(bus, seg::ES, di + i as u64)?;
        }
        let mut field = u32::from_le_bytes(buffer);
        let mask = ((1u32 << length) - 1) << offset;
        field = (field & !mask) | ((u32::from(value) << offset) & mask);
        let stored = field.to_le_bytes();
        for i in 0..byte_count as usize {
            self.segmented_write8(bus, seg::ES, di + i as u64, stored[i])?;
        }
        // advance the bit pointer
        let new_offset = offset + length;
        self.register_set8_high(gpr::AX, (new_offset & 15) as u8);
        let di = self.register_get16(gpr::DI).wrapping_add((new_offset / 16 * 2) as u16);
        self.register_set16(gpr::DI, di);
        Ok(())
    }

    fn nec_bitfield_extract(&mut self, bus: &mut dyn Bus, length: u32) -> Fallible<()> {
        // source bit address in DS:SI.AH
        let offset = u32::from(self.register_get8_high(gpr::AX)) & 15;
        let si = u64::from(self.register_get16(gpr::SI));
        let source_segment = self.parser.segment.unwrap_or(seg::DS);
        let byte_count = (offset + length + 7) / 8;
        let mut buffer = [0u8; 4];
        for (i, slot) in buffer.iter_mut().take(byte_count as usize).enumerate() {
            *slot = self.segmented_read8(bus, source_segment, si + i as u64)?;
        }
        let field = u32::from_le_bytes(buffer);
        let value = (field >> offset) & ((1u32 << length) - 1);
        self.register_set16(gpr::AX, value as u16);
        let new_offset = offset + length;
        self.register_set8_high(gpr::AX, (new_offset & 15) as u8);
        let si = self.register_get16(gpr::SI).wrapping_add((new_offset / 16 * 2) as u16);
        self.register_set16(gpr::SI, si);
        Ok(())
    }

    // ========== V55 Queue Operations ==========

    /// Linked-list queue primitives over a four-word parameter table at
    /// DS:SI: {queue offset, queue segment, link value, link offset}.
    fn queue_operation(&mut self, bus: &mut dyn Bus, opcode: u8) -> Fallible<()> {
        let si = u64::from(self.register_get16(gpr::SI));
        let segment = self.parser.segment.unwrap_or(seg::DS);
        let mut table = [0u16; 4];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = self.segmented_read16(bus, segment, si + 2 * i as u64)?;
        }
        let queue = (u64::from(table[1]) << 4) + u64::from(table[0]);
        let link_of = |link: u16, link_offset: u16| (u64::from(link) << 4) + u64::from(link_offset);

        match opcode {
            0xE0 => {
                // QHOUT: unlink and return the queue head
                let head = self.memory_read16(bus, queue)?;
                if head == 0 {
                    self.zf = true;
                } else {
                    self.segmented_write16(bus, segment, si + 4, head)?;
                    let tail = self.memory_read16(bus, queue + 2)?;
                    if head == tail {
                        self.memory_write16(bus, queue, 0)?;
                    } else {
                        let next = self.memory_read16(bus, link_of(head, table[3]))?;
                        self.memory_write16(bus, queue, next)?;
                    }
                    self.zf = false;
                }
            }
            0xE1 => {
                // QTIN: append a link at the tail
                let head = self.memory_read16(bus, queue)?;
                if head == 0 {
                    self.memory_write16(bus, queue, table[2])?;
                } else {
                    let tail = self.memory_read16(bus, queue + 2)?;
                    self.memory_write16(bus, link_of(tail, table[3]), table[2])?;
                    self.memory_write16(bus, link_of(table[2], table[3]) + 2, tail)?;
                }
                self.memory_write16(bus, queue + 2, table[2])?;
            }
            _ => {
                // QOUT: unlink a specific element
                let head = self.memory_read16(bus, queue)?;
                if head == 0 {
                    self.zf = true;
                    return Ok(());
                }
                let tail = self.memory_read16(bus, queue + 2)?;
                if head == table[2] {
                    if head == tail {
                        self.memory_write16(bus, queue, 0)?;
                    } else {
                        let next = self.memory_read16(bus, link_of(head, table[3]))?;
                        self.memory_write16(bus, queue, next)?;
                    }
                } else {
                    let mut current = head;
                    loop {
                        let next = self.memory_read16(bus, link_of(current, table[3]))?;
                        if next == table[2] {
                            let following = self.memory_read16(bus, link_of(next, table[3]))?;
                            self.memory_write16(bus, link_of(current, table[3]), following)?;
                            if next == tail {
                                self.memory_write16(bus, queue + 2, current)?;
                            }
                            break;
                        }
                        if current == tail {
                            break;
                        }
                        current = next;
                    }
                }
                self.zf = false;
            }
        }
        Ok(())
    }
}
