//! Prefix loop and ModRM/SIB decoding
//!
//! Every step begins with the parser block at its defaults; the prefix
//! loop folds segment overrides, size toggles, LOCK, REP classes and
//! REX/SIMD prefixes into it, then hands the opcode to the executor.
//! The effective-address computation is keyed on (mod, rm) and the address
//! size, producing the numeric offset, the default segment (SS when the
//! base involves a BP flavour), and the REG field extended by REX.R.

use super::{Cpu, OpSize, RepPrefix, SimdPrefix};
use crate::bus::Bus;
use crate::exception::Fallible;
use crate::regs::{gpr, seg};
use crate::traits::{CpuFamily, CpuSubtype};

impl Cpu {
    /// V25S software guard: opcodes are scrambled through a table.
    fn translate_opcode(&self, opcode: u8) -> u8 {
        if self.traits.family == CpuFamily::V25 && self.traits.subtype == CpuSubtype::V25S {
            if let Some(table) = &self.traits.opcode_translation {
                return table[usize::from(opcode)];
            }
        }
        opcode
    }

    /// Fetch, decode and execute one instruction.
    pub(super) fn execute_instruction(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        loop {
            let opcode = self.fetch8(bus)?;
            let opcode = self.translate_opcode(opcode);
            match opcode {
                0x26 => {
                    self.parser.segment = Some(seg::ES);
                    self.parser.source_segment = seg::ES;
                }
                0x2E => {
                    self.parser.segment = Some(seg::CS);
                    self.parser.source_segment = seg::CS;
                }
                0x36 => {
                    self.parser.segment = Some(seg::SS);
                    self.parser.source_segment = seg::SS;
                }
                0x3E => {
                    self.parser.segment = Some(seg::DS);
                    self.parser.source_segment = seg::DS;
                }
                0x64 | 0x65 if self.traits.family >= CpuFamily::I386 => {
                    let segment = if opcode == 0x64 { seg::FS } else { seg::GS };
                    self.parser.segment = Some(segment);
                    self.parser.source_segment = segment;
                }
                0x64 | 0x65 if self.traits.family == CpuFamily::V55 => {
                    // V55 extended segment overrides
                    let segment = if opcode == 0x64 { seg::DS2 } else { seg::DS3 };
                    self.parser.segment = Some(segment);
                    self.parser.source_segment = segment;
                }
                0x66 if self.traits.family >= CpuFamily::I386 => {
                    self.parser.operation_size = if self.parser.code_size == OpSize::Word {
                        OpSize::Dword
                    } else {
                        OpSize::Word
                    };
                    if self.parser.simd_prefix == SimdPrefix::None {
                        self.parser.simd_prefix = SimdPrefix::Op66;
                    }
                }
                0x67 if self.traits.family >= CpuFamily::I386 => {
                    self.parser.address_size = match self.parser.code_size {
                        OpSize::Qword => OpSize::Dword,
                        OpSize::Dword => OpSize::Word,
                        _ => OpSize::Dword,
                    };
                }
                0xF0 => self.parser.lock_prefix = true,
                0xF2 => {
                    self.parser.rep_prefix = RepPrefix::Repnz;
                    self.parser.simd_prefix = SimdPrefix::OpF2;
                }
                0xF3 => {
                    self.parser.rep_prefix = RepPrefix::Repz;
                    self.parser.simd_prefix = SimdPrefix::OpF3;
                }
                0x65 if self.traits.family == CpuFamily::V25
                    || self.traits.family == CpuFamily::V20 =>
                {
                    // NEC REPC
                    self.parser.rep_prefix = RepPrefix::Repc;
                }
                0x64 if self.traits.family == CpuFamily::V25
                    || self.traits.family == CpuFamily::V20 =>
                {
                    // NEC REPNC
                    self.parser.rep_prefix = RepPrefix::Repnc;
                }
                0x40..=0x4F if self.is_64bit_mode() => {
                    // REX must immediately precede the opcode
                    self.parser.rex_prefix = true;
                    self.parser.rex_w = opcode & 0x08 != 0;
                    self.parser.rex_r = if opcode & 0x04 != 0 { 8 } else { 0 };
                    self.parser.rex_x = if opcode & 0x02 != 0 { 8 } else { 0 };
                    self.parser.rex_b = if opcode & 0x01 != 0 { 8 } else { 0 };
                    if self.parser.rex_w {
                        self.parser.operation_size = OpSize::Qword;
                    }
                    let opcode = self.fetch8(bus)?;
            let opcode = self.translate_opcode(opcode);
                    return if opcode == 0x0F {
                        let second = self.fetch8(bus)?;
                        self.parser.opcode_map = 1;
                        self.execute_0f(bus, second)
                    } else {
                        self.execute_primary(bus, opcode)
                    };
                }
                0x0F if self.traits.family >= CpuFamily::I286
                    || self.traits.family == CpuFamily::V20
                    || self.traits.family == CpuFamily::V25
                    || self.traits.family == CpuFamily::V55
                    || self.traits.family == CpuFamily::Upd9002 =>
                {
                    let second = self.fetch8(bus)?;
                    self.parser.opcode_map = 1;
                    return self.execute_0f(bus, second);
                }
                _ => return self.execute_primary(bus, opcode),
            }
        }
    }

    // ========== ModRM / SIB ==========

    /// Fetch the ModRM byte and compute the effective address for memory
    /// operands. Register operands (`mod == 3`) leave the offset untouched.
    pub(super) fn parse_modrm(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let modrm = self.fetch8(bus)?;
        self.parser.modrm = modrm;
        self.parser.register_field = usize::from((modrm >> 3) & 7) | self.parser.rex_r;
        if modrm >= 0xC0 {
            return Ok(());
        }
        match self.parser.address_size {
            OpSize::Byte | OpSize::Word => self.parse_modrm16(bus),
            OpSize::Dword => self.parse_modrm32(bus),
            OpSize::Qword => self.parse_modrm64(bus),
        }
    }

    fn apply_default_segment(&mut self, default_segment: usize) {
        if self.parser.segment.is_none() {
            self.parser.segment = Some(default_segment);
        }
    }

    fn parse_modrm16(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let modrm = self.parser.modrm;
        let mut disp_size = modrm >> 6;
        let (mut offset, default_segment) = match modrm & 7 {
            0 => (
                u64::from(self.register_get16(gpr::BX)) + u64::from(self.register_get16(gpr::SI)),
                seg::DS,
            ),
            1 => (
                u64::from(self.register_get16(gpr::BX)) + u64::from(self.register_get16(gpr::DI)),
                seg::DS,
            ),
            2 => (
                u64::from(self.register_get16(gpr::BP)) + u64::from(self.register_get16(gpr::SI)),
                seg::SS,
            ),
            3 => (
                u64::from(self.register_get16(gpr::BP)) + u64::from(self.register_get16(gpr::DI)),
                seg::SS,
            ),
            4 => (u64::from(self.register_get16(gpr::SI)), seg::DS),
            5 => (u64::from(self.register_get16(gpr::DI)), seg::DS),
            6 => {
                if disp_size == 0 {
                    disp_size = 2;
                    (0, seg::DS)
                } else {
                    (u64::from(self.register_get16(gpr::BP)), seg::SS)
                }
            }
            _ => (u64::from(self.register_get16(gpr::BX)), seg::DS),
        };
        match disp_size {
            1 => offset = offset.wrapping_add(self.fetch8(bus)? as i8 as i64 as u64),
            2 => offset = offset.wrapping_add(u64::from(self.fetch16(bus)?)),
            _ => {}
        }
        self.parser.address_offset = offset & 0xFFFF;
        self.apply_default_segment(default_segment);
        Ok(())
    }

    fn parse_modrm32(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let modrm = self.parser.modrm;
        let mut disp_size = modrm >> 6;
        let rm = usize::from(modrm & 7);
        let mut offset: u64;
        let default_segment;

        if rm == 4 {
            let sib = self.fetch8(bus)?;
            let base = usize::from(sib & 7);
            let index = usize::from((sib >> 3) & 7);
            let scale = sib >> 6;
            offset = if index == 4 {
                0
            } else {
                u64::from(self.register_get32(index)) << scale
            };
            if base == 5 && disp_size == 0 {
                default_segment = seg::DS;
                disp_size = 2;
            } else {
                offset = offset.wrapping_add(u64::from(self.register_get32(base)));
                default_segment = if base == 4 || base == 5 { seg::SS } else { seg::DS };
            }
        } else if rm == 5 && disp_size == 0 {
            offset = 0;
            default_segment = seg::DS;
            disp_size = 2;
        } else {
            offset = u64::from(self.register_get32(rm));
            default_segment = if rm == 5 { seg::SS } else { seg::DS };
        }

        match disp_size {
            1 => offset = offset.wrapping_add(self.fetch8(bus)? as i8 as i64 as u64),
            2 => offset = offset.wrapping_add(u64::from(self.fetch32(bus)?)),
            _ => {}
        }
        self.parser.address_offset = offset & 0xFFFF_FFFF;
        self.apply_default_segment(default_segment);
        Ok(())
    }

    fn parse_modrm64(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let modrm = self.parser.modrm;
        let mut disp_size = modrm >> 6;
        let rm = usize::from(modrm & 7) | self.parser.rex_b;
        let mut offset: u64;

        if rm & 7 == 4 {
            let sib = self.fetch8(bus)?;
            let base = usize::from(sib & 7) | self.parser.rex_b;
            let index = usize::from((sib >> 3) & 7) | self.parser.rex_x;
            let scale = sib >> 6;
            offset = if index == 4 {
                // index 4 without REX.X means "no index"
                0
            } else {
                self.register_get64(index) << scale
            };
            if base & 7 == 5 && disp_size == 0 {
                disp_size = 2;
            } else {
                offset = offset.wrapping_add(self.register_get64(base));
            }
        } else if rm & 7 == 5 && disp_size == 0 {
            // RIP-relative in 64-bit code
            self.parser.ip_relative = true;
            offset = 0;
            disp_size = 2;
        } else {
            offset = self.register_get64(rm);
        }

        match disp_size {
            1 => offset = offset.wrapping_add(self.fetch8(bus)? as i8 as i64 as u64),
            2 => offset = offset.wrapping_add(self.fetch32(bus)? as i32 as i64 as u64),
            _ => {}
        }
        self.parser.address_offset = offset;
        self.apply_default_segment(seg::DS);
        Ok(())
    }

    /// RIP-relative displacements resolve against the address of the
    /// *next* instruction, which is only known once decoding finished.
    pub(super) fn finish_operand_address(&mut self) {
        if self.parser.ip_relative {
            self.parser.address_offset = self.parser.address_offset.wrapping_add(self.xip);
            self.parser.ip_relative = false;
        }
        match self.parser.address_size {
            OpSize::Byte | OpSize::Word => self.parser.address_offset &= 0xFFFF,
            OpSize::Dword => self.parser.address_offset &= 0xFFFF_FFFF,
            OpSize::Qword => {}
        }
    }

    // ========== Operand Accessors ==========

    pub(super) fn modrm_is_register(&self) -> bool {
        self.parser.modrm >= 0xC0
    }

    pub(super) fn modrm_rm(&self) -> usize {
        usize::from(self.parser.modrm & 7) | self.parser.rex_b
    }

    pub(super) fn modrm_reg(&self) -> usize {
        self.parser.register_field
    }

    pub(super) fn operand_segment(&self) -> usize {
        self.parser.segment.unwrap_or(seg::DS)
    }

    /// Read the r/m operand of the given size. The first memory access of
    /// a handler resolves any pending RIP-relative displacement, so
    /// immediates must already have been fetched by then.
    pub(super) fn read_rm(&mut self, bus: &mut dyn Bus, size: OpSize) -> Fallible<u64> {
        if self.modrm_is_register() {
            Ok(self.register_get_size(size, self.modrm_rm()))
        } else {
            self.finish_operand_address();
            let segment = self.operand_segment();
            let offset = self.parser.address_offset;
            Ok(match size {
                OpSize::Byte => u64::from(self.segmented_read8(bus, segment, offset)?),
                OpSize::Word => u64::from(self.segmented_read16(bus, segment, offset)?),
                OpSize::Dword => u64::from(self.segmented_read32(bus, segment, offset)?),
                OpSize::Qword => self.segmented_read64(bus, segment, offset)?,
            })
        }
    }

    pub(super) fn write_rm(&mut self, bus: &mut dyn Bus, size: OpSize, value: u64) -> Fallible<()> {
        if self.modrm_is_register() {
            self.register_set_size(size, self.modrm_rm(), value);
            Ok(())
        } else {
            self.finish_operand_address();
            let segment = self.operand_segment();
            let offset = self.parser.address_offset;
            match size {
                OpSize::Byte => self.segmented_write8(bus, segment, offset, value as u8),
                OpSize::Word => self.segmented_write16(bus, segment, offset, value as u16),
                OpSize::Dword => self.segmented_write32(bus, segment, offset, value as u32),
                OpSize::Qword => self.segmented_write64(bus, segment, offset, value),
            }
        }
    }
}
