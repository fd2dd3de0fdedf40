//! System management mode and ICE state images
//!
//! Each supported family dumps its state to a fixed linear-address field
//! schedule on SMI (or ICE break) and reloads it on RSM (or LOADALL).
//! The 32-bit Intel-style formats share the classic SMRAM register map and
//! differ in their descriptor-cache extension records; AMD's 64-bit format
//! and the Cyrix header-word formats are their own layouts.
//!
//! Entry tears down protection (PE/MP/EM/TS/PG cleared), loads CS with the
//! SMM base and jumps to the SMM entry point; resume reverses the store.

use crate::bus::{AddressSpace, Bus};
use crate::cpu::{Cpu, OpSize};
use crate::desc::Descriptor;
use crate::exception::Fallible;
use crate::regs::{desc, seg, Cr0, Segment};
use crate::traits::SmmFormat;

/// Where an SMI came from and what it interrupted; feeds the Cyrix header
/// word and the I/O restart slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmiSource {
    External,
    Internal,
    Io,
    Memory,
    Smint,
}

/// I/O instruction shape for the restart slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoType {
    #[default]
    None,
    In,
    Out,
    Ins,
    Outs,
    RepIns,
    RepOuts,
}

impl IoType {
    fn has_rep(self) -> bool {
        matches!(self, IoType::RepIns | IoType::RepOuts)
    }

    fn is_string(self) -> bool {
        matches!(self, IoType::Ins | IoType::Outs | IoType::RepIns | IoType::RepOuts)
    }

    fn encoding(self) -> u32 {
        match self {
            IoType::None => 0,
            IoType::In => 1,
            IoType::Out => 2,
            IoType::Ins => 3,
            IoType::Outs => 4,
            IoType::RepIns => 5,
            IoType::RepOuts => 6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmiAttributes {
    pub source: SmiSource,
    pub io_type: IoType,
    pub write_size: Option<OpSize>,
    pub write_address: u64,
    pub write_data: u64,
    pub nested_smi: bool,
    pub vga_access: bool,
}

impl SmiAttributes {
    pub fn external() -> Self {
        Self {
            source: SmiSource::External,
            io_type: IoType::None,
            write_size: None,
            write_address: 0,
            write_data: 0,
            nested_smi: false,
            vga_access: false,
        }
    }

    pub fn io(io_type: IoType, port: u16, size: OpSize, data: u64) -> Self {
        Self {
            source: SmiSource::Io,
            io_type,
            write_size: Some(size),
            write_address: u64::from(port),
            write_data: data,
            nested_smi: false,
            vga_access: false,
        }
    }
}

/// SMM revision identifier advertised in the 32-bit save areas: I/O restart
/// and SMBASE relocation supported.
const SMM_REVISION: u32 = 0x0003_0000;

impl Cpu {
    // ========== Descriptor Cache Codecs ==========

    fn cache_write_286(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let s = self.sr[segment];
        let base = (s.base as u32).to_le_bytes();
        self.memory_write_system(bus, offset, &base[..3])?;
        self.memory_write8(bus, offset + 3, (s.access >> 8) as u8)?;
        self.memory_write16(bus, offset + 4, s.limit as u16)
    }

    fn cache_read_286(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let mut base = [0u8; 4];
        self.memory_read_system(bus, offset, &mut base[..3])?;
        let access = self.memory_read8(bus, offset + 3)?;
        let limit = self.memory_read16(bus, offset + 4)?;
        self.sr[segment].base = u64::from(u32::from_le_bytes(base));
        self.sr[segment].access = u32::from(access) << 8;
        self.sr[segment].limit = u32::from(limit);
        Ok(())
    }

    /// 386 LOADALL record: access dword, base dword, limit dword.
    fn cache_write_386(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let s = self.sr[segment];
        self.memory_write32(bus, offset, s.access)?;
        self.memory_write32(bus, offset + 4, s.base as u32)?;
        self.memory_write32(bus, offset + 8, s.limit)
    }

    fn cache_read_386(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let access = self.memory_read32(bus, offset)?;
        let base = self.memory_read32(bus, offset + 4)?;
        let limit = self.memory_read32(bus, offset + 8)?;
        self.sr[segment].access = access;
        self.sr[segment].base = u64::from(base);
        self.sr[segment].limit = limit;
        Ok(())
    }

    /// P5/P6 extension record: base dword, limit dword, access dword.
    fn cache_write_p5(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let s = self.sr[segment];
        self.memory_write32(bus, offset, s.base as u32)?;
        self.memory_write32(bus, offset + 4, s.limit)?;
        self.memory_write32(bus, offset + 8, s.access)
    }

    fn cache_read_p5(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let base = self.memory_read32(bus, offset)?;
        let limit = self.memory_read32(bus, offset + 4)?;
        let access = self.memory_read32(bus, offset + 8)?;
        self.sr[segment].base = u64::from(base);
        self.sr[segment].limit = limit;
        self.sr[segment].access = access;
        Ok(())
    }

    /// P4 record: selector word, access word, limit dword, base dword.
    fn cache_write_p4(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let s = self.sr[segment];
        self.memory_write16(bus, offset, s.selector)?;
        self.memory_write16(bus, offset + 2, (s.access >> 8) as u16)?;
        self.memory_write32(bus, offset + 4, s.limit)?;
        self.memory_write32(bus, offset + 8, s.base as u32)
    }

    fn cache_read_p4(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let selector = self.memory_read16(bus, offset)?;
        let access = self.memory_read16(bus, offset + 2)?;
        let limit = self.memory_read32(bus, offset + 4)?;
        let base = self.memory_read32(bus, offset + 8)?;
        self.sr[segment] = Segment {
            selector,
            access: u32::from(access) << 8,
            limit,
            base: u64::from(base),
        };
        Ok(())
    }

    /// AMD 64-bit record: selector, attributes, limit, 64-bit base.
    fn cache_write_64(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let s = self.sr[segment];
        self.memory_write16(bus, offset, s.selector)?;
        self.memory_write16(bus, offset + 2, (s.access >> 8) as u16)?;
        self.memory_write32(bus, offset + 4, s.limit)?;
        self.memory_write64(bus, offset + 8, s.base)
    }

    fn cache_read_64(&mut self, bus: &mut dyn Bus, offset: u64, segment: usize) -> Fallible<()> {
        let selector = self.memory_read16(bus, offset)?;
        let access = self.memory_read16(bus, offset + 2)?;
        let limit = self.memory_read32(bus, offset + 4)?;
        let base = self.memory_read64(bus, offset + 8)?;
        self.sr[segment] = Segment {
            selector,
            access: u32::from(access) << 8,
            limit,
            base,
        };
        Ok(())
    }

    // ========== ICE STOREALL / LOADALL ==========

    /// 286 LOADALL image at physical 0x800; the dump variant used by the
    /// in-circuit-emulator break.
    pub fn ice_storeall_286(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        self.cpu_level = AddressSpace::Ice;
        self.memory_write16(bus, 0x00806, self.cr[0] as u16 & 0xFFF0)?;
        let flags16 = (self.flags_get16() & 0x7FD5) | 0x0002;
        self.memory_write16(bus, 0x00818, flags16)?;
        self.memory_write16(bus, 0x0081A, self.xip as u16)?;
        self.memory_write16(bus, 0x0081C, self.sr[seg::LDTR].selector)?;
        self.memory_write16(bus, 0x0081E, self.sr[seg::DS].selector)?;
        self.memory_write16(bus, 0x00820, self.sr[seg::SS].selector)?;
        self.memory_write16(bus, 0x00822, self.sr[seg::CS].selector)?;
        self.memory_write16(bus, 0x00824, self.sr[seg::ES].selector)?;
        for (i, r) in [7usize, 6, 5, 4, 3, 2, 1, 0].into_iter().enumerate() {
            let value = self.register_get16(r);
            self.memory_write16(bus, 0x00826 + 2 * i as u64, value)?;
        }
        self.cache_write_286(bus, 0x00836, seg::ES)?;
        self.cache_write_286(bus, 0x0083C, seg::CS)?;
        self.cache_write_286(bus, 0x00842, seg::SS)?;
        self.cache_write_286(bus, 0x00848, seg::DS)?;
        self.cache_write_286(bus, 0x0084E, seg::GDTR)?;
        self.cache_write_286(bus, 0x00854, seg::LDTR)?;
        self.cache_write_286(bus, 0x0085A, seg::IDTR)?;
        self.cache_write_286(bus, 0x00860, seg::TR)?;

        // enter the ICE monitor through the reset vector shape
        for segment in [seg::ES, seg::CS, seg::SS, seg::DS] {
            self.sr[segment] = Segment {
                selector: 0,
                base: 0,
                limit: 0xFFFF,
                access: desc::P | desc::S | desc::WR | desc::A,
            };
        }
        self.set_xip(0xFFF0);
        self.sr[seg::CS].selector = 0xF000;
        self.sr[seg::CS].base = 0xFFFF_F000;
        self.sr[seg::IDTR].base = 0;
        self.sr[seg::IDTR].limit = 0xFFFF;
        self.sr[seg::IDTR].access = 0x8200;
        self.sr[seg::LDTR].selector = 0;
        self.sr[seg::TR].selector = 0;
        self.cpl = 0;
        self.cr[0] = 0xFFF0;
        self.clear_arithmetic_flags();
        self.md = false;
        self.iopl = 0;
        self.nt = false;
        Ok(())
    }

    pub fn ice_loadall_286(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let msw = self.memory_read16(bus, 0x00804)?;
        self.cr[0] = (self.cr[0] & !0xFFFE) | u64::from(msw & 0xFFFE);
        self.sr[seg::TR].selector = self.memory_read16(bus, 0x00816)?;
        let flags16 = (self.memory_read16(bus, 0x00818)? & 0x7FD5) | 0x0002;
        self.flags_set16(flags16);
        let xip = self.memory_read16(bus, 0x0081A)?;
        self.set_xip(u64::from(xip));
        self.sr[seg::LDTR].selector = self.memory_read16(bus, 0x0081C)?;
        self.sr[seg::DS].selector = self.memory_read16(bus, 0x0081E)?;
        self.sr[seg::SS].selector = self.memory_read16(bus, 0x00820)?;
        self.sr[seg::CS].selector = self.memory_read16(bus, 0x00822)?;
        self.sr[seg::ES].selector = self.memory_read16(bus, 0x00824)?;
        for (i, r) in [7usize, 6, 5, 4, 3, 2, 1, 0].into_iter().enumerate() {
            let value = self.memory_read16(bus, 0x00826 + 2 * i as u64)?;
            self.register_set16(r, value);
        }
        self.cache_read_286(bus, 0x00836, seg::ES)?;
        self.cache_read_286(bus, 0x0083C, seg::CS)?;
        self.cache_read_286(bus, 0x00842, seg::SS)?;
        self.cache_read_286(bus, 0x00848, seg::DS)?;
        self.cache_read_286(bus, 0x0084E, seg::GDTR)?;
        self.cache_read_286(bus, 0x00854, seg::LDTR)?;
        self.cache_read_286(bus, 0x0085A, seg::IDTR)?;
        self.cache_read_286(bus, 0x00860, seg::TR)?;
        let cpl = desc::dpl(self.sr[seg::SS].access);
        self.set_cpl(cpl);
        self.cpu_level = AddressSpace::Supervisor;
        self.prefetch_queue_flush();
        Ok(())
    }

    /// 386/486 STOREALL image at a linear offset (the ICE area).
    pub fn ice_storeall_386(&mut self, bus: &mut dyn Bus, offset: u64) -> Fallible<()> {
        self.cpu_level = AddressSpace::Ice;
        self.memory_write32(bus, offset, self.cr[0] as u32)?;
        let flags32 = self.flags_get32();
        self.memory_write32(bus, offset + 0x04, flags32)?;
        self.memory_write32(bus, offset + 0x08, self.xip as u32)?;
        for (i, r) in [7usize, 6, 5, 4, 3, 2, 1, 0].into_iter().enumerate() {
            let value = self.register_get32(r);
            self.memory_write32(bus, offset + 0x0C + 4 * i as u64, value)?;
        }
        self.memory_write32(bus, offset + 0x2C, self.dr[6] as u32)?;
        self.memory_write32(bus, offset + 0x30, self.dr[7] as u32)?;
        self.memory_write32(bus, offset + 0x34, u32::from(self.sr[seg::TR].selector))?;
        self.memory_write32(bus, offset + 0x38, u32::from(self.sr[seg::LDTR].selector))?;
        for (i, segment) in [seg::GS, seg::FS, seg::DS, seg::SS, seg::CS, seg::ES]
            .into_iter()
            .enumerate()
        {
            let value = u32::from(self.sr[segment].selector);
            self.memory_write32(bus, offset + 0x3C + 4 * i as u64, value)?;
        }
        for (i, segment) in [
            seg::TR,
            seg::IDTR,
            seg::GDTR,
            seg::LDTR,
            seg::GS,
            seg::FS,
            seg::DS,
            seg::SS,
            seg::CS,
            seg::ES,
        ]
        .into_iter()
        .enumerate()
        {
            self.cache_write_386(bus, offset + 0x54 + 12 * i as u64, segment)?;
        }

        // reset-like entry into the ICE monitor
        for r in self.gpr.iter_mut().take(8) {
            *r = 0;
        }
        for segment in 0..seg::USER_COUNT {
            self.sr[segment] = Segment {
                selector: 0,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: desc::P | desc::S | desc::WR | desc::A | desc::D,
            };
        }
        self.set_xip(0xFFF0);
        self.sr[seg::CS].selector = 0xF000;
        self.sr[seg::CS].base = 0xFFFF_F000;
        for table in [seg::GDTR, seg::IDTR, seg::LDTR, seg::TR] {
            self.sr[table].base = 0;
            self.sr[table].limit = 0xFFFF;
            self.sr[table].access = 0x8200;
        }
        self.cpl = 0;
        self.cr[0] = 0x6000_0000;
        self.cr[2] = 0;
        self.cr[3] = 0;
        self.cr[4] = 0;
        self.dr[6] = 0xFFFF_0FF0;
        self.dr[7] = 0;
        self.clear_arithmetic_flags();
        self.md = false;
        self.iopl = 0;
        self.nt = false;
        self.rf = false;
        self.vm = false;
        self.ac = false;
        Ok(())
    }

    pub fn ice_loadall_386(&mut self, bus: &mut dyn Bus, offset: u64) -> Fallible<()> {
        self.cr[0] = u64::from(self.memory_read32(bus, offset)?);
        let flags32 = self.memory_read32(bus, offset + 0x04)?;
        self.flags_set32(flags32);
        let xip = self.memory_read32(bus, offset + 0x08)?;
        self.set_xip(u64::from(xip));
        for (i, r) in [7usize, 6, 5, 4, 3, 2, 1, 0].into_iter().enumerate() {
            let value = self.memory_read32(bus, offset + 0x0C + 4 * i as u64)?;
            self.register_set32(r, value);
        }
        self.dr[6] = u64::from(self.memory_read32(bus, offset + 0x2C)?);
        self.dr[7] = u64::from(self.memory_read32(bus, offset + 0x30)?);
        self.sr[seg::TR].selector = self.memory_read16(bus, offset + 0x34)?;
        self.sr[seg::LDTR].selector = self.memory_read16(bus, offset + 0x38)?;
        for (i, segment) in [seg::GS, seg::FS, seg::DS, seg::SS, seg::CS, seg::ES]
            .into_iter()
            .enumerate()
        {
            self.sr[segment].selector = self.memory_read16(bus, offset + 0x3C + 4 * i as u64)?;
        }
        for (i, segment) in [
            seg::TR,
            seg::IDTR,
            seg::GDTR,
            seg::LDTR,
            seg::GS,
            seg::FS,
            seg::DS,
            seg::SS,
            seg::CS,
            seg::ES,
        ]
        .into_iter()
        .enumerate()
        {
            self.cache_read_386(bus, offset + 0x54 + 12 * i as u64, segment)?;
        }
        let cpl = desc::dpl(self.sr[seg::SS].access);
        self.set_cpl(cpl);
        self.cpu_level = AddressSpace::Supervisor;
        self.prefetch_queue_flush();
        Ok(())
    }

    // ========== 32-bit Intel-style Save Area ==========

    /// Classic SMRAM register map shared by the 32-bit Intel formats; the
    /// per-format descriptor-cache extension records follow below 0x7F30.
    fn smm_store_state32(
        &mut self,
        bus: &mut dyn Bus,
        top: u64,
        attributes: SmiAttributes,
    ) -> Fallible<()> {
        let base = top - 0x8000;
        let is_io = attributes.source == SmiSource::Io;

        self.memory_write32(bus, base + 0x7FFC, self.cr[0] as u32)?;
        self.memory_write32(bus, base + 0x7FF8, self.cr[3] as u32)?;
        let flags32 = self.flags_get32();
        self.memory_write32(bus, base + 0x7FF4, flags32)?;
        self.memory_write32(bus, base + 0x7FF0, self.xip as u32)?;
        for (i, r) in [7usize, 6, 5, 4, 3, 2, 1, 0].into_iter().enumerate() {
            let value = self.register_get32(r);
            self.memory_write32(bus, base + 0x7FEC - 4 * i as u64, value)?;
        }
        self.memory_write32(bus, base + 0x7FCC, self.dr[6] as u32)?;
        self.memory_write32(bus, base + 0x7FC8, self.dr[7] as u32)?;
        self.memory_write32(bus, base + 0x7FC4, u32::from(self.sr[seg::TR].selector))?;
        self.memory_write32(bus, base + 0x7FC0, u32::from(self.sr[seg::LDTR].selector))?;
        for (i, segment) in [seg::GS, seg::FS, seg::DS, seg::SS, seg::CS, seg::ES]
            .into_iter()
            .enumerate()
        {
            let value = u32::from(self.sr[segment].selector);
            self.memory_write32(bus, base + 0x7FBC - 4 * i as u64, value)?;
        }
        // I/O restart slots and control words
        self.memory_write16(bus, base + 0x7F02, u16::from(self.halted))?;
        self.memory_write16(bus, base + 0x7F00, u16::from(is_io))?;
        self.memory_write32(bus, base + 0x7EFC, SMM_REVISION)?;
        self.memory_write32(bus, base + 0x7EF8, self.smbase as u32)?;

        match self.traits.smm_format {
            SmmFormat::I80386Sl | SmmFormat::P5 => {
                for (i, segment) in [
                    seg::TR,
                    seg::IDTR,
                    seg::GDTR,
                    seg::LDTR,
                    seg::GS,
                    seg::FS,
                    seg::DS,
                    seg::SS,
                    seg::CS,
                    seg::ES,
                ]
                .into_iter()
                .enumerate()
                {
                    let write = if self.traits.smm_format == SmmFormat::I80386Sl {
                        Cpu::cache_write_386
                    } else {
                        Cpu::cache_write_p5
                    };
                    write(self, bus, base + 0x7F9C - 12 * i as u64, segment)?;
                }
                self.memory_write32(bus, base + 0x7F28, self.cr[4] as u32)?;
            }
            SmmFormat::P6 => {
                for (i, segment) in [
                    seg::SS,
                    seg::CS,
                    seg::ES,
                    seg::LDTR,
                    seg::GDTR,
                    seg::TR,
                    seg::IDTR,
                    seg::GS,
                    seg::FS,
                    seg::DS,
                ]
                .into_iter()
                .enumerate()
                {
                    self.cache_write_p5(bus, base + 0x7F9C - 12 * i as u64, segment)?;
                }
                self.memory_write32(bus, base + 0x7F14, self.cr[4] as u32)?;
            }
            SmmFormat::P4 => {
                self.cache_write_p4(bus, base + 0x7F6C, seg::TR)?;
                self.memory_write32(bus, base + 0x7F68, flags32)?;
                self.cache_write_p4(bus, base + 0x7F5C, seg::LDTR)?;
                self.memory_write32(bus, base + 0x7F58, self.sr[seg::IDTR].limit)?;
                self.memory_write32(bus, base + 0x7F54, self.sr[seg::IDTR].base as u32)?;
                self.memory_write32(bus, base + 0x7F50, self.sr[seg::GDTR].limit)?;
                self.memory_write32(bus, base + 0x7F4C, self.sr[seg::GDTR].base as u32)?;
                self.cache_write_p4(bus, base + 0x7F40, seg::GS)?;
                self.cache_write_p4(bus, base + 0x7F34, seg::FS)?;
                self.cache_write_p4(bus, base + 0x7F28, seg::DS)?;
                self.cache_write_p4(bus, base + 0x7F1C, seg::SS)?;
                self.cache_write_p4(bus, base + 0x7F10, seg::CS)?;
                if is_io {
                    let size_code = match attributes.write_size {
                        Some(OpSize::Byte) => 1u32,
                        Some(OpSize::Word) => 2,
                        Some(OpSize::Dword) => 4,
                        _ => 0,
                    };
                    self.memory_write32(
                        bus,
                        base + 0x7FA4,
                        0x0001
                            | (size_code << 1)
                            | (attributes.io_type.encoding() << 4)
                            | ((attributes.write_address as u32) << 16),
                    )?;
                }
            }
            SmmFormat::K5 | SmmFormat::K6 => {
                let is_string = attributes.io_type.is_string();
                let had_rep = attributes.io_type.has_rep();
                self.memory_write32(
                    bus,
                    base + 0x7FA4,
                    (if is_io { 0x0000_0001 } else { 0 })
                        | (if is_string { 0x0000_0004 } else { 0 })
                        | (if had_rep { 0x0000_0008 } else { 0 })
                        | ((attributes.write_address as u32) << 16),
                )?;
            }
            _ => {}
        }

        if is_io {
            self.memory_write32(bus, base + 0x7F10, self.old_xip as u32)?;
            self.memory_write32(bus, base + 0x7F0C, self.io_restart.xsi as u32)?;
            self.memory_write32(bus, base + 0x7F08, self.io_restart.xcx as u32)?;
            self.memory_write32(bus, base + 0x7F04, self.io_restart.xdi as u32)?;
        }
        Ok(())
    }

    fn smm_restore_state32(&mut self, bus: &mut dyn Bus, top: u64) -> Fallible<()> {
        let base = top - 0x8000;

        match self.traits.smm_format {
            SmmFormat::I80386Sl | SmmFormat::P5 => {
                for (i, segment) in [
                    seg::TR,
                    seg::IDTR,
                    seg::GDTR,
                    seg::LDTR,
                    seg::GS,
                    seg::FS,
                    seg::DS,
                    seg::SS,
                    seg::CS,
                    seg::ES,
                ]
                .into_iter()
                .enumerate()
                {
                    let read = if self.traits.smm_format == SmmFormat::I80386Sl {
                        Cpu::cache_read_386
                    } else {
                        Cpu::cache_read_p5
                    };
                    read(self, bus, base + 0x7F9C - 12 * i as u64, segment)?;
                }
                self.cr[4] = u64::from(self.memory_read32(bus, base + 0x7F28)?);
            }
            SmmFormat::P6 => {
                for (i, segment) in [
                    seg::SS,
                    seg::CS,
                    seg::ES,
                    seg::LDTR,
                    seg::GDTR,
                    seg::TR,
                    seg::IDTR,
                    seg::GS,
                    seg::FS,
                    seg::DS,
                ]
                .into_iter()
                .enumerate()
                {
                    self.cache_read_p5(bus, base + 0x7F9C - 12 * i as u64, segment)?;
                }
                self.cr[4] = u64::from(self.memory_read32(bus, base + 0x7F14)?);
            }
            SmmFormat::P4 => {
                self.cache_read_p4(bus, base + 0x7F6C, seg::TR)?;
                self.cache_read_p4(bus, base + 0x7F5C, seg::LDTR)?;
                self.sr[seg::IDTR].limit = self.memory_read32(bus, base + 0x7F58)?;
                self.sr[seg::IDTR].base = u64::from(self.memory_read32(bus, base + 0x7F54)?);
                self.sr[seg::GDTR].limit = self.memory_read32(bus, base + 0x7F50)?;
                self.sr[seg::GDTR].base = u64::from(self.memory_read32(bus, base + 0x7F4C)?);
                self.cache_read_p4(bus, base + 0x7F40, seg::GS)?;
                self.cache_read_p4(bus, base + 0x7F34, seg::FS)?;
                self.cache_read_p4(bus, base + 0x7F28, seg::DS)?;
                self.cache_read_p4(bus, base + 0x7F1C, seg::SS)?;
                self.cache_read_p4(bus, base + 0x7F10, seg::CS)?;
            }
            _ => {}
        }

        // selectors (where the format does not carry them in its records)
        if !matches!(self.traits.smm_format, SmmFormat::P4) {
            self.sr[seg::TR].selector = self.memory_read16(bus, base + 0x7FC4)?;
            self.sr[seg::LDTR].selector = self.memory_read16(bus, base + 0x7FC0)?;
            for (i, segment) in [seg::GS, seg::FS, seg::DS, seg::SS, seg::CS, seg::ES]
                .into_iter()
                .enumerate()
            {
                self.sr[segment].selector = self.memory_read16(bus, base + 0x7FBC - 4 * i as u64)?;
            }
        }

        for (i, r) in [7usize, 6, 5, 4, 3, 2, 1, 0].into_iter().enumerate() {
            let value = self.memory_read32(bus, base + 0x7FEC - 4 * i as u64)?;
            self.register_set32(r, value);
        }
        self.dr[6] = u64::from(self.memory_read32(bus, base + 0x7FCC)?);
        self.dr[7] = u64::from(self.memory_read32(bus, base + 0x7FC8)?);
        self.cr[0] = u64::from(self.memory_read32(bus, base + 0x7FFC)?);
        self.cr[3] = u64::from(self.memory_read32(bus, base + 0x7FF8)?);
        let flags32 = self.memory_read32(bus, base + 0x7FF4)?;
        self.flags_set32(flags32);
        let xip = self.memory_read32(bus, base + 0x7FF0)?;
        self.halted = self.memory_read16(bus, base + 0x7F02)? & 1 != 0;
        let io_restart = self.memory_read16(bus, base + 0x7F00)? == 0xFF;
        self.smbase = u64::from(self.memory_read32(bus, base + 0x7EF8)?);
        if io_restart {
            let rip = self.memory_read32(bus, base + 0x7F10)?;
            self.set_xip(u64::from(rip));
            let xsi = self.memory_read32(bus, base + 0x7F0C)?;
            let xcx = self.memory_read32(bus, base + 0x7F08)?;
            let xdi = self.memory_read32(bus, base + 0x7F04)?;
            self.register_set32(crate::regs::gpr::SI, xsi);
            self.register_set32(crate::regs::gpr::CX, xcx);
            self.register_set32(crate::regs::gpr::DI, xdi);
        } else {
            self.set_xip(u64::from(xip));
        }
        let cpl = desc::dpl(self.sr[seg::SS].access);
        self.set_cpl(cpl);
        Ok(())
    }

    // ========== 64-bit AMD Save Area ==========

    fn smm_store_state64(
        &mut self,
        bus: &mut dyn Bus,
        top: u64,
        attributes: SmiAttributes,
    ) -> Fallible<()> {
        let base = top - 0x10000 + 0xFE00;
        for (i, segment) in [
            seg::ES,
            seg::CS,
            seg::SS,
            seg::DS,
            seg::FS,
            seg::GS,
            seg::GDTR,
            seg::LDTR,
            seg::IDTR,
            seg::TR,
        ]
        .into_iter()
        .enumerate()
        {
            self.cache_write_64(bus, base + 0x10 * i as u64, segment)?;
        }
        self.memory_write64(bus, base + 0xD0, self.efer)?;
        self.memory_write32(bus, base + 0xFC, SMM_REVISION)?;
        self.memory_write32(bus, base + 0x100, self.smbase as u32)?;
        self.memory_write64(bus, base + 0x148, self.cr[4])?;
        self.memory_write64(bus, base + 0x150, self.cr[3])?;
        self.memory_write64(bus, base + 0x158, self.cr[0])?;
        self.memory_write64(bus, base + 0x160, self.dr[7])?;
        self.memory_write64(bus, base + 0x168, self.dr[6])?;
        let flags = self.flags_get64();
        self.memory_write64(bus, base + 0x170, flags)?;
        self.memory_write64(bus, base + 0x178, self.xip)?;
        for r in 0..16 {
            let value = self.gpr[15 - r];
            self.memory_write64(bus, base + 0x180 + 8 * r as u64, value)?;
        }
        if attributes.source == SmiSource::Io {
            self.memory_write64(bus, base + 0xC8, self.old_xip)?;
            self.memory_write64(bus, base + 0xC0, self.io_restart.xsi)?;
            self.memory_write64(bus, base + 0xB8, self.io_restart.xcx)?;
            self.memory_write64(bus, base + 0xB0, self.io_restart.xdi)?;
        }
        Ok(())
    }

    fn smm_restore_state64(&mut self, bus: &mut dyn Bus, top: u64) -> Fallible<()> {
        let base = top - 0x10000 + 0xFE00;
        for (i, segment) in [
            seg::ES,
            seg::CS,
            seg::SS,
            seg::DS,
            seg::FS,
            seg::GS,
            seg::GDTR,
            seg::LDTR,
            seg::IDTR,
            seg::TR,
        ]
        .into_iter()
        .enumerate()
        {
            self.cache_read_64(bus, base + 0x10 * i as u64, segment)?;
        }
        self.efer = self.memory_read64(bus, base + 0xD0)?;
        self.smbase = u64::from(self.memory_read32(bus, base + 0x100)?);
        self.cr[4] = self.memory_read64(bus, base + 0x148)?;
        self.cr[3] = self.memory_read64(bus, base + 0x150)?;
        self.cr[0] = self.memory_read64(bus, base + 0x158)?;
        self.dr[7] = self.memory_read64(bus, base + 0x160)?;
        self.dr[6] = self.memory_read64(bus, base + 0x168)?;
        let flags = self.memory_read64(bus, base + 0x170)?;
        self.flags_set64(flags);
        let rip = self.memory_read64(bus, base + 0x178)?;
        self.set_xip(rip);
        for r in 0..16 {
            self.gpr[15 - r] = self.memory_read64(bus, base + 0x180 + 8 * r as u64)?;
        }
        let cpl = desc::dpl(self.sr[seg::SS].access);
        self.set_cpl(cpl);
        Ok(())
    }

    // ========== Cyrix Save Area ==========

    /// Cyrix formats grow *down* from the top of the SMM region; a header
    /// word packs the instruction-classification flags.
    fn smm_store_state_cyrix(
        &mut self,
        bus: &mut dyn Bus,
        top: u64,
        attributes: SmiAttributes,
    ) -> Fallible<()> {
        let had_rep = attributes.source == SmiSource::Io && attributes.io_type.has_rep();
        let is_write = attributes.source == SmiSource::Memory;
        let smint = attributes.source == SmiSource::Smint;
        let halted = self.halted;
        let memory_access = attributes.source == SmiSource::Memory;
        let code_writable = !self.sr[seg::CS].is_executable() && self.sr[seg::CS].is_writable();
        let code_readable = !self.sr[seg::CS].is_executable() || self.sr[seg::CS].is_readable();
        let internal = attributes.source != SmiSource::External;
        let write_size = match attributes.write_size {
            Some(OpSize::Byte) => 1u16,
            Some(OpSize::Word) => 3,
            Some(OpSize::Dword) => 15,
            _ => 0,
        };

        let format = self.traits.smm_format;
        if format == SmmFormat::Gx2 {
            self.memory_write16(bus, top - 0x16, (self.sr[seg::CS].access >> 8) as u16)?;
            self.memory_write32(bus, top - 0x1C, self.sr[seg::CS].base as u32)?;
            self.memory_write32(bus, top - 0x22 + 2, self.sr[seg::CS].limit)?;
            self.memory_write16(bus, top - 0x22, (self.sr[seg::SS].access >> 8) as u16)?;
        } else {
            let code_descriptor = self.segment_store_protected_386(seg::CS);
            self.memory_write_system(bus, top - 0x20, &code_descriptor.bytes[..8])?;
        }
        if format == SmmFormat::Cx5x86 {
            self.memory_write16(bus, top - 0x16, u16::from(self.cpl) << 5)?;
        }
        if format == SmmFormat::CxM2 {
            self.memory_write16(bus, top - 0x22, u16::from(self.cpl) << 5)?;
        }

        let mut header = 0u16;
        if code_writable
            && matches!(format, SmmFormat::CxM2 | SmmFormat::MediaGx | SmmFormat::Gx2)
        {
            header |= 0x0001;
        }
        if is_write {
            header |= 0x0002;
        }
        if had_rep {
            header |= 0x0004;
        }
        if smint {
            header |= 0x0008;
        }
        if halted {
            header |= 0x0010;
        }
        if matches!(format, SmmFormat::MediaGx | SmmFormat::Gx2) {
            if memory_access {
                header |= 0x0020;
            }
            if !internal {
                header |= 0x0040;
            }
            if attributes.vga_access {
                header |= 0x0080;
            }
            if attributes.nested_smi {
                header |= 0x0100;
            }
        }
        if format == SmmFormat::CxM2 {
            if internal {
                header |= 0x2000;
            }
            if attributes.nested_smi {
                header |= 0x8000;
            }
        }
        if format == SmmFormat::Gx2 && code_readable {
            header |= 0x8000;
        }
        self.memory_write16(bus, top - 0x24, header)?;

        if format != SmmFormat::Cx486Slce {
            self.memory_write16(bus, top - 0x26, write_size)?;
            self.memory_write16(bus, top - 0x28, attributes.write_address as u16)?;
            self.memory_write16(bus, top - 0x2C, attributes.write_data as u16)?;
        }
        if !memory_access && had_rep {
            let pointer = if is_write { self.io_restart.xsi } else { self.io_restart.xdi };
            self.memory_write32(bus, top - 0x30, pointer as u32)?;
        }
        if format == SmmFormat::Gx2 {
            self.memory_write32(bus, top - 0x30, self.cyrix.smm_ctl)?;
        }

        self.memory_write32(bus, top - 0x04, self.dr[7] as u32)?;
        let flags32 = self.flags_get32();
        self.memory_write32(bus, top - 0x08, flags32)?;
        self.memory_write32(bus, top - 0x0C, self.cr[0] as u32)?;
        self.memory_write32(bus, top - 0x10, self.old_xip as u32)?;
        self.memory_write32(bus, top - 0x14, self.xip as u32)?;
        self.memory_write16(bus, top - 0x18, self.sr[seg::CS].selector)
    }

    fn smm_restore_state_cyrix(&mut self, bus: &mut dyn Bus, top: u64) -> Fallible<()> {
        if self.traits.smm_format == SmmFormat::Gx2 {
            let access = self.memory_read16(bus, top - 0x16)?;
            let base = self.memory_read32(bus, top - 0x1C)?;
            let limit = self.memory_read32(bus, top - 0x22 + 2)?;
            self.sr[seg::CS].access = u32::from(access) << 8;
            self.sr[seg::CS].base = u64::from(base);
            self.sr[seg::CS].limit = limit;
        } else {
            let mut code_descriptor = Descriptor::new(8);
            let mut bytes = [0u8; 8];
            self.memory_read_system(bus, top - 0x20, &mut bytes)?;
            code_descriptor.bytes[..8].copy_from_slice(&bytes);
            self.sr[seg::CS].base = code_descriptor.base(true);
            self.sr[seg::CS].limit = code_descriptor.limit(true) as u32;
            self.sr[seg::CS].access = code_descriptor.access_word()
                | (u32::from(code_descriptor.word(3) & 0x00F0) << 16);
        }

        self.dr[7] = u64::from(self.memory_read32(bus, top - 0x04)?);
        let flags32 = self.memory_read32(bus, top - 0x08)?;
        self.flags_set32(flags32);
        self.cr[0] = u64::from(self.memory_read32(bus, top - 0x0C)?);
        let xip = self.memory_read32(bus, top - 0x14)?;
        self.sr[seg::CS].selector = self.memory_read16(bus, top - 0x18)?;
        self.set_xip(u64::from(xip));
        Ok(())
    }

    /// Top of the Cyrix SMM region from ARR3 (SMAR): 24-bit base plus a
    /// power-of-two size code.
    fn cyrix_smm_top(&self) -> u64 {
        let arr3 = u64::from(self.cyrix.arr[3]);
        let size_code = arr3 & 0xF;
        let base = (arr3 & 0xFF_FFF0) << 12;
        if size_code == 0 {
            base
        } else if size_code < 15 {
            base + (0x2000u64 << (size_code - 1))
        } else {
            base + 0x1_0000_0000
        }
    }

    // ========== Entry and Resume ==========

    fn smm_flat_segments(&mut self) {
        for segment in seg::ES..=seg::GS {
            self.sr[segment].limit = 0xFFFF_FFFF;
            if segment == seg::CS {
                continue;
            }
            self.sr[segment].selector = 0;
            self.sr[segment].base = 0;
            self.sr[segment].access = desc::WR | desc::S | desc::P | desc::G;
        }
    }

    /// Enter system management mode, storing the save image for the
    /// configured format.
    pub fn smm_enter(&mut self, bus: &mut dyn Bus, mut attributes: SmiAttributes) -> Fallible<()> {
        let format = self.traits.smm_format;
        log::debug!("SMI ({:?}), entering SMM", format);
        match format {
            SmmFormat::None => Ok(()),
            SmmFormat::I80386Sl => {
                self.cpu_level = AddressSpace::Smm;
                self.smm_store_state32(bus, 0x30000 + 0x10000, attributes)?;
                self.smm_cpu_reset_32();
                self.sr[seg::CS].selector = 0x3000;
                self.sr[seg::CS].base = 0x30000;
                self.set_xip(0x8000);
                Ok(())
            }
            SmmFormat::P5 | SmmFormat::P6 | SmmFormat::P4 | SmmFormat::K5 | SmmFormat::K6 => {
                self.cpu_level = AddressSpace::Smm;
                let top = self.smbase + 0x10000;
                self.smm_store_state32(bus, top, attributes)?;
                self.smm_cpu_reset_32();
                self.sr[seg::CS].selector = if format == SmmFormat::P5 || format == SmmFormat::K5 {
                    0x3000
                } else {
                    (self.smbase >> 4) as u16
                };
                self.sr[seg::CS].base = self.smbase;
                self.set_xip(0x8000);
                Ok(())
            }
            SmmFormat::Amd64 => {
                self.cpu_level = AddressSpace::Smm;
                let top = self.smbase + 0x10000;
                self.smm_store_state64(bus, top, attributes)?;
                self.smm_cpu_reset_32();
                self.efer = 0;
                self.sr[seg::CS].selector = (self.smbase >> 4) as u16;
                self.sr[seg::CS].base = self.smbase;
                self.set_xip(0x8000);
                Ok(())
            }
            SmmFormat::Cx486Slce | SmmFormat::Cx5x86 => {
                self.cpu_level = AddressSpace::Smm;
                let top = self.cyrix_smm_top();
                self.smm_store_state_cyrix(bus, top, attributes)?;
                self.smm_cyrix_entry();
                Ok(())
            }
            SmmFormat::CxM2 | SmmFormat::MediaGx => {
                attributes.nested_smi = self.cpu_level == AddressSpace::Smm;
                self.cpu_level = AddressSpace::Smm;
                if self.cyrix.smm_hdr & 1 == 0 {
                    self.cyrix.smm_hdr = self.cyrix_smm_top() as u32 + 1;
                }
                let top = u64::from(self.cyrix.smm_hdr & !1);
                self.smm_store_state_cyrix(bus, top, attributes)?;
                self.smm_cyrix_entry();
                Ok(())
            }
            SmmFormat::Gx2 => {
                attributes.nested_smi = self.cpu_level == AddressSpace::Smm;
                self.cpu_level = AddressSpace::Smm;
                let top = u64::from(self.cyrix.smm_hdr);
                self.smm_store_state_cyrix(bus, top, attributes)?;
                self.sr[seg::CS].selector = (self.smm_region.base >> 4) as u16;
                self.sr[seg::CS].base = self.smm_region.base;
                if self.smm_region.limit < 0x10_0000 {
                    self.sr[seg::CS].limit = self.smm_region.limit as u32;
                    self.sr[seg::CS].access &= !desc::G;
                } else {
                    self.sr[seg::CS].limit = self.smm_region.limit as u32 | 0xFFF;
                    self.sr[seg::CS].access |= desc::G;
                }
                self.set_xip(0);
                Ok(())
            }
        }
    }

    /// Common 32-bit SMM entry tear-down: flags cleared to the reserved
    /// bit, flat segments, protection off.
    fn smm_cpu_reset_32(&mut self) {
        self.flags_set32(0x0002);
        self.smm_flat_segments();
        self.cr[0] &= !(Cr0::PE.bits()
            | Cr0::MP.bits()
            | Cr0::EM.bits()
            | Cr0::TS.bits()
            | Cr0::PG.bits());
        self.cr[4] = 0;
        self.dr[7] = 0x0000_0400;
        self.sr[seg::CS].access = desc::WR | desc::X | desc::S | desc::P | desc::G;
        self.set_cpl(0);
    }

    fn smm_cyrix_entry(&mut self) {
        let arr3 = self.cyrix.arr[3];
        self.sr[seg::CS].selector = (arr3 & 0xFFF0) as u16;
        self.sr[seg::CS].base = u64::from(arr3 & 0xFF_FFF0) << 12;
        self.cr[0] &= !(Cr0::PE.bits()
            | Cr0::MP.bits()
            | Cr0::EM.bits()
            | Cr0::TS.bits()
            | Cr0::PG.bits());
        self.set_cpl(0);
        self.set_xip(0);
    }

    /// RSM: restore the saved image and return to the interrupted mode.
    pub fn smm_resume(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let format = self.traits.smm_format;
        log::debug!("RSM ({:?})", format);
        match format {
            SmmFormat::None => {}
            SmmFormat::I80386Sl => {
                self.smm_restore_state32(bus, 0x30000 + 0x10000)?;
            }
            SmmFormat::P5 | SmmFormat::P6 | SmmFormat::P4 | SmmFormat::K5 | SmmFormat::K6 => {
                let top = self.smbase + 0x10000;
                self.smm_restore_state32(bus, top)?;
            }
            SmmFormat::Amd64 => {
                let top = self.smbase + 0x10000;
                self.smm_restore_state64(bus, top)?;
            }
            SmmFormat::Cx486Slce | SmmFormat::Cx5x86 => {
                let top = self.cyrix_smm_top();
                self.smm_restore_state_cyrix(bus, top)?;
            }
            SmmFormat::CxM2 | SmmFormat::MediaGx => {
                let top = u64::from(self.cyrix.smm_hdr & !1);
                self.smm_restore_state_cyrix(bus, top)?;
                self.cyrix.smm_hdr = 0;
            }
            SmmFormat::Gx2 => {
                let top = u64::from(self.cyrix.smm_hdr);
                self.smm_restore_state_cyrix(bus, top)?;
            }
        }
        self.cpu_level = AddressSpace::Supervisor;
        self.prefetch_queue_flush();
        Ok(())
    }

    /// RSM is only defined inside SMM.
    pub fn smm_instruction_valid(&self) -> bool {
        self.traits.smm_format != SmmFormat::None && self.cpu_level == AddressSpace::Smm
    }

    /// Cyrix SMINT: software entry, gated by CCR1.SMAC outside SMM.
    pub fn smint_instruction_valid(&self) -> bool {
        matches!(
            self.traits.smm_format,
            SmmFormat::Cx486Slce
                | SmmFormat::Cx5x86
                | SmmFormat::CxM2
                | SmmFormat::MediaGx
                | SmmFormat::Gx2
        ) && (self.cpu_level == AddressSpace::Smm || self.cyrix.ccr[1] & 0x04 != 0)
    }
}
