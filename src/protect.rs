//! Protection and descriptor logic
//!
//! Privilege levels, limit checks, selector loading, gate traversal, task
//! switching and the far control transfers (JMP/CALL/RET/IRET). Anything
//! here can fault; failures propagate as [`Exception`] values to the step
//! entry where delivery happens.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpSize};
use crate::desc::{Descriptor, BYTE_ACCESS};
use crate::exception::{Exception, Fallible};
use crate::regs::{desc, flags, seg, sel, Cr0, Dr7, Dr6, Efer};
use crate::traits::CpuFamily;

/// Range check helper: true when `base + count - 1` runs past `limit` (or
/// wraps the address space).
pub fn overflow(base: u64, count: u64, limit: u64) -> bool {
    if count == 0 {
        base > limit
    } else {
        base > u64::MAX - (count - 1) || base + (count - 1) > limit
    }
}

pub fn selector_is_null(selector: u16) -> bool {
    selector & !sel::RPL_MASK == 0
}

fn limit_fault(segment: usize, error_code: u64) -> Exception {
    if segment == seg::SS {
        Exception::ss_fault(error_code)
    } else {
        Exception::gp(error_code)
    }
}

impl Cpu {
    // ========== Limit Checks ==========

    /// Validate a byte range against a cached segment. Non-expand-down
    /// segments require `offset + count - 1 <= limit`; expand-down data
    /// segments require the range to live strictly above the limit, capped
    /// by the B-dependent top. 64-bit mode only checks when the AMD
    /// LMSLE extension is armed.
    pub fn segment_check_limit(
        &self,
        segment: usize,
        offset: u64,
        size: u64,
        error_code: u64,
    ) -> Fallible<()> {
        let s = &self.sr[segment];
        if self.is_64bit_mode() {
            if self.efer & Efer::LMSLE.bits() != 0
                && segment != seg::CS
                && segment != seg::GS
                && overflow(offset, size, 0xFFFF_FFFF_0000_0000 + u64::from(s.limit))
            {
                return Err(limit_fault(segment, error_code));
            }
            return Ok(());
        }
        if self.traits.family < CpuFamily::I286 {
            return Ok(());
        }

        if s.is_executable() || !s.is_expand_down() {
            if overflow(offset, size, u64::from(s.limit)) {
                return Err(limit_fault(segment, error_code));
            }
        } else if self.traits.family >= CpuFamily::I386 && s.is_big() {
            if offset <= u64::from(s.limit) || overflow(offset, size, 0xFFFF_FFFF) {
                return Err(limit_fault(segment, error_code));
            }
        } else if offset <= u64::from(s.limit) || overflow(offset, size, 0xFFFF) {
            return Err(limit_fault(segment, error_code));
        }
        Ok(())
    }

    /// The 287/387 signal the coprocessor segment overrun (#MP) when the
    /// part of an FPU operand beyond the first two bytes runs past the
    /// limit; the first two bytes still fault the usual way.
    pub fn x87_segment_check_limit(
        &self,
        segment: usize,
        x86_offset: u64,
        offset: u64,
        size: u64,
        error_code: u64,
    ) -> Fallible<()> {
        use crate::traits::FpuType;
        if matches!(self.x87.fpu_type, FpuType::I287 | FpuType::I387) {
            self.segment_check_limit(segment, x86_offset, 2, error_code)?;
            if size >= x86_offset.wrapping_sub(offset).wrapping_add(2) {
                let s = &self.sr[segment];
                let overrun = if s.is_executable() || !s.is_expand_down() {
                    overflow(offset, size, u64::from(s.limit))
                } else if self.traits.family >= CpuFamily::I386 && s.is_big() {
                    offset <= u64::from(s.limit) || overflow(offset, size, 0xFFFF)
                } else {
                    offset <= u64::from(s.limit) || overflow(offset, size, 0xFFFF_FFFF)
                };
                if overrun {
                    return Err(Exception::fault(crate::exception::vector::MP)
                        .with_error(error_code));
                }
            }
            Ok(())
        } else {
            self.segment_check_limit(segment, offset, size, error_code)
        }
    }

    /// Limit check against a descriptor image not yet loaded into the
    /// cache.
    pub fn descriptor_check_limit(
        &self,
        segment: usize,
        descriptor: &Descriptor,
        offset: u64,
        size: u64,
        error_code: u64,
    ) -> Fallible<()> {
        let limit = descriptor.limit(self.traits.family >= CpuFamily::I386);
        if descriptor.is_executable() || !descriptor.is_expand_down() {
            if overflow(offset, size, limit) {
                return Err(limit_fault(segment, error_code));
            }
        } else if self.traits.family >= CpuFamily::I386 && descriptor.is_big() {
            if offset <= limit || overflow(offset, size, 0xFFFF) {
                return Err(limit_fault(segment, error_code));
            }
        } else if offset <= limit || overflow(offset, size, 0xFFFF_FFFF) {
            return Err(limit_fault(segment, error_code));
        }
        Ok(())
    }

    fn descriptor_check_limit_64(
        &self,
        segment: usize,
        descriptor: &Descriptor,
        offset: u64,
        size: u64,
        error_code: u64,
    ) -> Fallible<()> {
        if self.efer & Efer::LMSLE.bits() != 0 && segment != seg::CS && segment != seg::GS {
            let limit = descriptor.limit(true);
            if overflow(offset, size, 0xFFFF_FFFF_0000_0000 + limit) {
                return Err(limit_fault(segment, error_code));
            }
        }
        Ok(())
    }

    /// Limit check for a code target against a descriptor, selecting the
    /// legacy or 64-bit rule by the descriptor's own L bit.
    fn code_target_check(
        &self,
        descriptor: &Descriptor,
        offset: u64,
        error_code: u64,
    ) -> Fallible<()> {
        if self.is_long_mode() && descriptor.is_long() {
            self.descriptor_check_limit_64(seg::CS, descriptor, offset, 1, error_code)?;
        } else {
            self.descriptor_check_limit(seg::CS, descriptor, offset, 1, error_code)?;
        }
        self.check_canonical(Some(seg::CS), offset, error_code)
    }

    /// Check that the stack can accept `count` more bytes before SS is
    /// reloaded, against a raw descriptor.
    fn stack_descriptor_check_limit(
        &self,
        ss: u16,
        descriptor: &Descriptor,
        sp: u64,
        count: u64,
    ) -> Fallible<()> {
        let masked = if descriptor.is_big() {
            sp.wrapping_sub(count) & 0xFFFF_FFFF
        } else {
            sp.wrapping_sub(count) & 0xFFFF
        };
        self.descriptor_check_limit(seg::SS, descriptor, masked, count, u64::from(ss))
    }

    /// Check that the current stack can accept `count` more bytes.
    pub fn stack_segment_check_limit(&self, count: u64, error_code: u64) -> Fallible<()> {
        let sp = self.stack_pointer();
        let masked = match self.stack_size() {
            OpSize::Word => sp.wrapping_sub(count) & 0xFFFF,
            OpSize::Dword => sp.wrapping_sub(count) & 0xFFFF_FFFF,
            _ => sp.wrapping_sub(count),
        };
        self.segment_check_limit(seg::SS, masked, count, error_code)
    }

    /// GDT/LDT/IDT limit checks.
    fn table_check_limit(
        &self,
        table: usize,
        offset: u64,
        size: u64,
        error: Exception,
    ) -> Fallible<()> {
        if overflow(offset, size, u64::from(self.sr[table].limit)) {
            Err(error)
        } else {
            Ok(())
        }
    }

    pub fn table_check_limit_selector(
        &self,
        selector: u16,
        selector_offset: u64,
        size: u64,
        vector: u8,
    ) -> Fallible<()> {
        let table = if selector & sel::LDT != 0 { seg::LDTR } else { seg::GDTR };
        self.table_check_limit(
            table,
            u64::from(selector & sel::INDEX_MASK) + selector_offset,
            size,
            Exception::fault(vector).with_error(u64::from(selector)),
        )
    }

    fn table_check_limit_vector(&self, vector: u8, entry_size: u64, error_code: u64) -> Fallible<()> {
        self.table_check_limit(
            seg::IDTR,
            u64::from(vector) * entry_size,
            entry_size,
            Exception::gp(error_code),
        )
    }

    // ========== Type Checks ==========

    /// A null selector can never be read through.
    pub fn segment_check_read(&self, segment: usize) -> Fallible<()> {
        if self.is_protected_mode() && !self.is_v86_mode() {
            if selector_is_null(self.sr[segment].selector) {
                return Err(Exception::gp(0));
            }
        }
        Ok(())
    }

    pub fn segment_check_write(&self, segment: usize) -> Fallible<()> {
        if self.is_protected_mode() && !self.is_v86_mode() {
            if selector_is_null(self.sr[segment].selector) {
                return Err(Exception::gp(0));
            }
            let s = &self.sr[segment];
            if s.is_executable() || !s.is_writable() {
                return Err(Exception::gp(0));
            }
        }
        Ok(())
    }

    // ========== Descriptor Table Access ==========

    pub fn descriptor_read_selector(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
        offset: u64,
        len: usize,
        vector: u8,
    ) -> Fallible<Descriptor> {
        self.table_check_limit_selector(selector, offset, len as u64, vector)?;
        let table = if selector & sel::LDT != 0 { seg::LDTR } else { seg::GDTR };
        let mut descriptor = Descriptor::new(len);
        let index = u64::from(selector & sel::INDEX_MASK);
        let mut bytes = [0u8; 16];
        self.segmented_read(bus, table, index + offset, &mut bytes[..len])?;
        descriptor.bytes[..len].copy_from_slice(&bytes[..len]);
        Ok(descriptor)
    }

    fn descriptor_write_byte(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
        offset: u64,
        value: u8,
    ) -> Fallible<()> {
        self.table_check_limit_selector(selector, offset, 1, crate::exception::vector::GP)?;
        let table = if selector & sel::LDT != 0 { seg::LDTR } else { seg::GDTR };
        let index = u64::from(selector & sel::INDEX_MASK);
        self.segmented_write(bus, table, index + offset, &[value])
    }

    /// Fetch a descriptor through GDT/LDT: 6 bytes on the 286, 8 on 386+.
    pub fn descriptor_load(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
        vector: u8,
    ) -> Fallible<Descriptor> {
        let len = if self.traits.family >= CpuFamily::I386 { 8 } else { 6 };
        self.descriptor_read_selector(bus, selector, 0, len, vector)
    }

    /// Fetch a system descriptor for LDTR/TR: 16 bytes in long mode.
    fn descriptor_load_system(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
        vector: u8,
    ) -> Fallible<Descriptor> {
        let len = if self.is_long_mode() {
            16
        } else if self.traits.family >= CpuFamily::I386 {
            8
        } else {
            6
        };
        self.descriptor_read_selector(bus, selector, 0, len, vector)
    }

    /// Fetch the second half of a 16-byte long mode descriptor once the
    /// first 8 bytes proved to be a gate or system type.
    fn descriptor_load_extension(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
        descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        let ext = self.descriptor_read_selector(bus, selector, 8, 8, crate::exception::vector::GP)?;
        descriptor.bytes[8..16].copy_from_slice(&ext.bytes[..8]);
        descriptor.len = 16;
        Ok(())
    }

    // ========== Segment Cache Loading ==========

    fn descriptor_mark_accessed(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
        descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        if descriptor.bytes[BYTE_ACCESS] & ((desc::A >> 8) as u8) == 0 {
            descriptor.bytes[BYTE_ACCESS] |= (desc::A >> 8) as u8;
            self.descriptor_write_byte(bus, selector, BYTE_ACCESS as u64, descriptor.bytes[BYTE_ACCESS])?;
        }
        Ok(())
    }

    pub fn segment_load_protected_286(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        selector: u16,
        descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        self.descriptor_mark_accessed(bus, selector, descriptor)?;
        self.sr[segment].selector = selector;
        self.sr[segment].limit = descriptor.word(0) as u32;
        self.sr[segment].base = descriptor.base(false);
        self.sr[segment].access = u32::from(descriptor.word(2) & 0xFF00);
        if segment == seg::CS || segment == seg::SS {
            // re-mirror the CPL into the freshly loaded access words
            let cpl = self.cpl;
            self.set_cpl(cpl);
        }
        Ok(())
    }

    pub fn segment_load_protected_386(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        selector: u16,
        descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        self.descriptor_mark_accessed(bus, selector, descriptor)?;
        let s = &mut self.sr[segment];
        s.selector = selector;
        let mut limit =
            u32::from(descriptor.word(0)) | (u32::from(descriptor.word(3) & 0x000F) << 16);
        s.base = descriptor.base(true);
        s.access = u32::from(descriptor.word(2) & 0xFF00)
            | (u32::from(descriptor.word(3) & 0x00F0) << 16);
        if s.access & desc::G != 0 {
            limit = (limit << 12) | 0xFFF;
        }
        s.limit = limit;
        if segment == seg::CS || segment == seg::SS {
            let cpl = self.cpl;
            self.set_cpl(cpl);
        }
        Ok(())
    }

    /// Write the cached segment state back into an 8-byte descriptor image
    /// (SMM save areas, ICE dumps).
    pub fn segment_store_protected_386(&self, segment: usize) -> Descriptor {
        let s = &self.sr[segment];
        let mut limit = s.limit;
        if s.access & desc::G != 0 {
            limit >>= 12;
        }
        let mut d = Descriptor::new(8);
        d.set_word(0, limit as u16);
        d.set_word(1, s.base as u16);
        d.set_word(2, ((s.base >> 16) as u16 & 0x00FF) | (s.access as u16 & 0xFF00));
        d.set_word(
            3,
            ((limit >> 16) as u16 & 0x000F)
                | ((s.access >> 16) as u16 & 0x00F0)
                | ((s.base >> 16) as u16 & 0xFF00),
        );
        d
    }

    /// LDTR/TR in long mode carry a 64-bit base split over the 16-byte
    /// descriptor form.
    fn segment_load_protected_64(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        selector: u16,
        descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        self.segment_load_protected_386(bus, segment, selector, descriptor)?;
        self.sr[segment].base |= descriptor.base_upper();
        self.check_canonical(None, self.sr[segment].base, 0)
    }

    /// A null selector only keeps its RPL; base and limit go stale.
    pub fn segment_load_null(&mut self, segment: usize, rpl: u16) {
        self.sr[segment].selector = rpl & sel::RPL_MASK;
        self.sr[segment].access &= !desc::P;
    }

    pub fn segment_load_protected(
        &mut self,
        bus: &mut dyn Bus,
        segment: usize,
        selector: u16,
        descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        if selector_is_null(selector) {
            self.segment_load_null(segment, selector);
            Ok(())
        } else if self.traits.family < CpuFamily::I386 {
            self.segment_load_protected_286(bus, segment, selector, descriptor)
        } else {
            self.segment_load_protected_386(bus, segment, selector, descriptor)
        }
    }

    // ========== LDTR / TR ==========

    pub fn ldtr_load(&mut self, bus: &mut dyn Bus, selector: u16) -> Fallible<()> {
        if self.is_real_mode() || self.is_v86_mode() {
            return Err(Exception::ud());
        }
        if selector_is_null(selector) {
            self.segment_load_null(seg::LDTR, selector);
            return Ok(());
        }
        if selector & sel::LDT != 0 {
            return Err(Exception::gp(u64::from(selector)));
        }
        let mut descriptor = self.descriptor_load_system(bus, selector, crate::exception::vector::GP)?;
        if descriptor.kind() != desc::TYPE_LDT {
            return Err(Exception::gp(u64::from(selector)));
        }
        if !descriptor.is_present() {
            return Err(Exception::np(u64::from(selector)));
        }
        if self.is_long_mode() {
            self.segment_load_protected_64(bus, seg::LDTR, selector, &mut descriptor)
        } else if self.traits.family >= CpuFamily::I386 {
            self.segment_load_protected_386(bus, seg::LDTR, selector, &mut descriptor)
        } else {
            self.segment_load_protected_286(bus, seg::LDTR, selector, &mut descriptor)
        }
    }

    /// LDTR reload during a task switch; identical checks but #TS faults.
    fn ldtr_load_switch_task(&mut self, bus: &mut dyn Bus, selector: u16) -> Fallible<()> {
        if selector_is_null(selector) {
            self.segment_load_null(seg::LDTR, selector);
            return Ok(());
        }
        if selector & sel::LDT != 0 {
            return Err(Exception::ts(u64::from(selector)));
        }
        let mut descriptor = self.descriptor_load(bus, selector, crate::exception::vector::TS)?;
        if descriptor.kind() != desc::TYPE_LDT {
            return Err(Exception::ts(u64::from(selector)));
        }
        if !descriptor.is_present() {
            return Err(Exception::ts(u64::from(selector)));
        }
        if self.traits.family >= CpuFamily::I386 {
            self.segment_load_protected_386(bus, seg::LDTR, selector, &mut descriptor)
        } else {
            self.segment_load_protected_286(bus, seg::LDTR, selector, &mut descriptor)
        }
    }

    /// LTR: GDT residency, available TSS type, then set the busy bit.
    pub fn tr_load(&mut self, bus: &mut dyn Bus, selector: u16) -> Fallible<()> {
        if self.is_real_mode() || self.is_v86_mode() {
            return Err(Exception::ud());
        }
        if selector_is_null(selector) {
            return Err(Exception::gp(0));
        }
        if selector & sel::LDT != 0 {
            return Err(Exception::gp(u64::from(selector)));
        }
        let mut descriptor = self.descriptor_load_system(bus, selector, crate::exception::vector::GP)?;
        match descriptor.kind() {
            desc::TYPE_TSS16_AVAILABLE => {
                if self.is_long_mode() || self.traits.is_32bit_only() {
                    return Err(Exception::np(u64::from(selector)));
                }
            }
            desc::TYPE_TSS32_AVAILABLE => {}
            _ => return Err(Exception::np(u64::from(selector))),
        }
        if !descriptor.is_present() {
            return Err(Exception::np(u64::from(selector)));
        }

        descriptor.bytes[BYTE_ACCESS] |= (desc::BUSY >> 8) as u8;
        self.descriptor_write_byte(bus, selector, BYTE_ACCESS as u64, descriptor.bytes[BYTE_ACCESS])?;

        if self.is_long_mode() {
            self.segment_load_protected_64(bus, seg::TR, selector, &mut descriptor)
        } else if self.traits.family >= CpuFamily::I386 {
            self.segment_load_protected_386(bus, seg::TR, selector, &mut descriptor)
        } else {
            self.segment_load_protected_286(bus, seg::TR, selector, &mut descriptor)
        }
    }

    // ========== Data Segment Loading (MOV sreg / POP sreg / LxS) ==========

    /// Load a user segment register with full protection checks. CS is
    /// rejected here; far transfers load CS through the gate machinery.
    pub fn segment_set(&mut self, bus: &mut dyn Bus, segment: usize, value: u16) -> Fallible<()> {
        let segment = self.segment_number(segment)?;
        if self.traits.family >= CpuFamily::I286 && segment == seg::CS {
            return Err(Exception::ud());
        }

        if self.is_real_mode() || self.is_v86_mode() {
            self.segment_load_real_mode(segment, value);
            if segment == seg::SS {
                self.pending_ss_load = true;
            }
            return Ok(());
        }

        if selector_is_null(value) {
            if segment == seg::SS {
                return Err(Exception::gp(0));
            }
            self.segment_load_null(segment, value);
            return Ok(());
        }

        let mut descriptor = self.descriptor_load(bus, value, crate::exception::vector::GP)?;
        let rpl = value & sel::RPL_MASK;
        let dpl = descriptor.dpl();

        if segment == seg::SS {
            if rpl != u16::from(self.cpl) || dpl != self.cpl {
                return Err(Exception::gp(u64::from(value)));
            }
            if descriptor.is_system() || descriptor.is_executable() || !descriptor.is_writable() {
                return Err(Exception::gp(u64::from(value)));
            }
            if !descriptor.is_present() {
                return Err(Exception::ss_fault(u64::from(value)));
            }
        } else {
            if descriptor.is_system() {
                return Err(Exception::gp(u64::from(value)));
            }
            if descriptor.is_executable() {
                // only readable code is loadable into data segments
                if !descriptor.is_readable() {
                    return Err(Exception::gp(u64::from(value)));
                }
                if !descriptor.is_conforming()
                    && dpl < self.cpl.max(rpl as u8)
                {
                    return Err(Exception::gp(u64::from(value)));
                }
            } else if dpl < self.cpl.max(rpl as u8) {
                return Err(Exception::gp(u64::from(value)));
            }
            if !descriptor.is_present() {
                return Err(Exception::np(u64::from(value)));
            }
        }

        self.segment_load_protected(bus, segment, value, &mut descriptor)?;
        if segment == seg::SS {
            // interrupts are held off until the instruction after an SS load
            self.pending_ss_load = true;
        }
        Ok(())
    }

    /// Task switch variant of [`Cpu::segment_set`]: raises #TS instead of
    /// #GP and also revalidates CS.
    fn segment_set_switch_task(&mut self, bus: &mut dyn Bus, segment: usize, value: u16) -> Fallible<()> {
        if selector_is_null(value) {
            if segment == seg::SS || segment == seg::CS {
                return Err(Exception::ts(0));
            }
            self.segment_load_null(segment, value);
            return Ok(());
        }

        let mut descriptor = self.descriptor_load(bus, value, crate::exception::vector::TS)?;
        let rpl = value & sel::RPL_MASK;
        let dpl = descriptor.dpl();

        match segment {
            seg::CS => {
                if descriptor.is_system() || !descriptor.is_executable() {
                    return Err(Exception::ts(u64::from(value)));
                }
                if descriptor.is_conforming() {
                    if dpl > self.cpl {
                        return Err(Exception::ts(u64::from(value)));
                    }
                } else if dpl != self.cpl {
                    return Err(Exception::ts(u64::from(value)));
                }
            }
            seg::SS => {
                if rpl != u16::from(self.cpl) || dpl != self.cpl {
                    return Err(Exception::ts(u64::from(value)));
                }
                if descriptor.is_system() || descriptor.is_executable() || !descriptor.is_writable() {
                    return Err(Exception::ts(u64::from(value)));
                }
            }
            _ => {
                if descriptor.is_system() {
                    return Err(Exception::ts(u64::from(value)));
                }
                if descriptor.is_executable() {
                    if !descriptor.is_readable() {
                        return Err(Exception::ts(u64::from(value)));
                    }
                    if !descriptor.is_conforming() && dpl < self.cpl.max(rpl as u8) {
                        return Err(Exception::ts(u64::from(value)));
                    }
                } else if dpl < self.cpl.max(rpl as u8) {
                    return Err(Exception::ts(u64::from(value)));
                }
            }
        }
        if !descriptor.is_present() {
            return Err(Exception::ts(u64::from(value)));
        }
        self.segment_load_protected(bus, segment, value, &mut descriptor)
    }

    // ========== Task Switching ==========

    /// Read the inner-ring stack pointer from the current TSS.
    pub fn load_task_stack(&mut self, bus: &mut dyn Bus, dpl: u8) -> Fallible<(u16, u64)> {
        let dpl = u64::from(dpl);
        let selector = u64::from(self.sr[seg::TR].selector);
        match desc::get_type(self.sr[seg::TR].access) {
            desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY => {
                if overflow(self.sr[seg::TR].base, dpl * 4 + 4, u64::from(self.sr[seg::TR].limit)) {
                    return Err(Exception::ts(selector));
                }
                let ss = self.segmented_read16(bus, seg::TR, dpl * 4 + 4)?;
                let sp = self.segmented_read16(bus, seg::TR, dpl * 4 + 2)?;
                Ok((ss, u64::from(sp)))
            }
            _ => {
                if self.is_long_mode() {
                    if overflow(self.sr[seg::TR].base, dpl * 8 + 12, u64::from(self.sr[seg::TR].limit)) {
                        return Err(Exception::ts(selector));
                    }
                    let rsp = self.segmented_read64(bus, seg::TR, dpl * 8 + 4)?;
                    Ok((dpl as u16, rsp)) // null selector with the new RPL
                } else {
                    if overflow(self.sr[seg::TR].base, dpl * 8 + 8, u64::from(self.sr[seg::TR].limit)) {
                        return Err(Exception::ts(selector));
                    }
                    let ss = self.segmented_read16(bus, seg::TR, dpl * 8 + 8)?;
                    let sp = self.segmented_read32(bus, seg::TR, dpl * 8 + 4)?;
                    Ok((ss, u64::from(sp)))
                }
            }
        }
    }

    /// Read an interrupt stack table slot from the 64-bit TSS.
    pub fn load_task_ist_stack(&mut self, bus: &mut dyn Bus, ist: usize) -> Fallible<u64> {
        let ist = ist as u64;
        if overflow(self.sr[seg::TR].base, ist * 8 + 0x2C, u64::from(self.sr[seg::TR].limit)) {
            return Err(Exception::ts(u64::from(self.sr[seg::TR].selector)));
        }
        self.segmented_read64(bus, seg::TR, ist * 8 + 0x24)
    }

    /// Store the outgoing context into the current TSS, load the incoming
    /// TSS, and update TR. Returns how many user segment selectors the new
    /// TSS supplied (4 for the 16-bit layout, 6 for the 32-bit one).
    fn switch_task(
        &mut self,
        bus: &mut dyn Bus,
        tss_selector: u16,
        tss_descriptor: &mut Descriptor,
    ) -> Fallible<usize> {
        let outgoing16 = matches!(
            desc::get_type(self.sr[seg::TR].access),
            desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY
        );
        if outgoing16 {
            let xip = self.xip as u16;
            let flags16 = self.flags_get16();
            self.segmented_write16(bus, seg::TR, 0x0E, xip)?;
            self.segmented_write16(bus, seg::TR, 0x10, flags16)?;
            for r in 0..8 {
                let value = self.register_get16(r);
                self.segmented_write16(bus, seg::TR, 0x12 + 2 * r as u64, value)?;
            }
            for (slot, segment) in [seg::ES, seg::CS, seg::SS, seg::DS].into_iter().enumerate() {
                let value = self.sr[segment].selector;
                self.segmented_write16(bus, seg::TR, 0x22 + 2 * slot as u64, value)?;
            }
        } else {
            let xip = self.xip as u32;
            let flags32 = self.flags_get32();
            self.segmented_write32(bus, seg::TR, 0x20, xip)?;
            self.segmented_write32(bus, seg::TR, 0x24, flags32)?;
            for r in 0..8 {
                let value = self.register_get32(r);
                self.segmented_write32(bus, seg::TR, 0x28 + 4 * r as u64, value)?;
            }
            for (slot, segment) in [seg::ES, seg::CS, seg::SS, seg::DS, seg::FS, seg::GS]
                .into_iter()
                .enumerate()
            {
                let value = self.sr[segment].selector;
                self.segmented_write16(bus, seg::TR, 0x48 + 4 * slot as u64, value)?;
            }
        }

        // From here on the outgoing state is committed.
        if self.traits.family >= CpuFamily::I386 {
            self.segment_load_protected_386(bus, seg::TR, tss_selector, tss_descriptor)?;
        } else {
            self.segment_load_protected_286(bus, seg::TR, tss_selector, tss_descriptor)?;
        }

        let incoming16 = matches!(
            desc::get_type(self.sr[seg::TR].access),
            desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY
        );
        let selector_count;
        if incoming16 {
            let xip = self.segmented_read16(bus, seg::TR, 0x0E)?;
            self.set_xip(u64::from(xip));
            let flags16 = self.segmented_read16(bus, seg::TR, 0x10)?;
            self.flags_set16(flags16);
            for r in 0..8 {
                let value = self.segmented_read16(bus, seg::TR, 0x12 + 2 * r as u64)?;
                self.gpr[r] = u64::from(value);
            }
            let ldtr = self.segmented_read16(bus, seg::TR, 0x2A)?;
            self.sr[seg::LDTR].selector = ldtr;
            selector_count = 4;
            for (slot, segment) in [seg::ES, seg::CS, seg::SS, seg::DS].into_iter().enumerate() {
                let value = self.segmented_read16(bus, seg::TR, 0x22 + 2 * slot as u64)?;
                self.sr[segment].selector = value;
            }
        } else {
            let xip = self.segmented_read32(bus, seg::TR, 0x20)?;
            self.set_xip(u64::from(xip));
            let flags32 = self.segmented_read32(bus, seg::TR, 0x24)?;
            self.flags_set32(flags32);
            for r in 0..8 {
                let value = self.segmented_read32(bus, seg::TR, 0x28 + 4 * r as u64)?;
                self.gpr[r] = u64::from(value);
            }
            let pdbr = self.segmented_read32(bus, seg::TR, 0x1C)?;
            if self.cr[0] & Cr0::PG.bits() != 0 {
                self.cr[3] = u64::from(pdbr);
            }
            let ldtr = self.segmented_read16(bus, seg::TR, 0x60)?;
            self.sr[seg::LDTR].selector = ldtr;
            selector_count = 6;
            for (slot, segment) in [seg::ES, seg::CS, seg::SS, seg::DS, seg::FS, seg::GS]
                .into_iter()
                .enumerate()
            {
                let value = self.segmented_read16(bus, seg::TR, 0x48 + 4 * slot as u64)?;
                self.sr[segment].selector = value;
            }
        }

        self.cr[0] |= Cr0::TS.bits();
        self.dr[7] &= !(Dr7::L0.bits() | Dr7::L1.bits() | Dr7::L2.bits() | Dr7::L3.bits());

        // The incoming task's debug-trap bit fires after the switch
        // completes.
        if self.segmented_read8(bus, seg::TR, 0x64)? & 0x01 != 0 {
            self.dr[6] |= Dr6::BT.bits();
            return Err(Exception::db_trap());
        }

        Ok(selector_count)
    }

    /// Clear the NT bit in the flags image saved inside the *outgoing* TSS
    /// (needed by the nested-task return).
    fn clear_old_nt(&mut self, bus: &mut dyn Bus, access: u32, tss_base: u64) -> Fallible<()> {
        let offset = match desc::get_type(access) {
            desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY => 0x10,
            _ => 0x24,
        };
        let address = tss_base + offset;
        let old = self.memory_read8(bus, address + 1)?;
        self.memory_write8(bus, address + 1, old & !((flags::NT >> 8) as u8))
    }

    /// Revalidate LDTR and the user segment selectors loaded from the new
    /// TSS; failures here are #TS.
    fn load_selectors_after_switch(&mut self, bus: &mut dyn Bus, selector_count: usize) -> Fallible<()> {
        let ldtr = self.sr[seg::LDTR].selector;
        self.ldtr_load_switch_task(bus, ldtr)?;

        const ORDER: [usize; 6] = [seg::CS, seg::SS, seg::DS, seg::ES, seg::FS, seg::GS];
        for &segment in ORDER.iter().take(selector_count.max(4).min(6)) {
            let selector = self.sr[segment].selector;
            self.segment_set_switch_task(bus, segment, selector)?;
        }
        Ok(())
    }

    fn tss_busy_byte(&self) -> u8 {
        (self.sr[seg::TR].access >> 8) as u8
    }

    fn tss_busy_clear(&mut self, bus: &mut dyn Bus, selector: u16, access: u8) -> Fallible<()> {
        let access = access & !((desc::BUSY >> 8) as u8);
        self.descriptor_write_byte(bus, selector, BYTE_ACCESS as u64, access)
    }

    fn tss_busy_set(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let access = self.tss_busy_byte() | (desc::BUSY >> 8) as u8;
        let selector = self.sr[seg::TR].selector;
        self.descriptor_write_byte(bus, selector, BYTE_ACCESS as u64, access)
    }

    fn tss_set_nt(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        self.nt = true;
        let offset = match desc::get_type(self.sr[seg::TR].access) {
            desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY => 0x10,
            _ => 0x24,
        };
        let old = self.segmented_read16(bus, seg::TR, offset)?;
        self.segmented_write16(bus, seg::TR, offset, old | flags::NT as u16)
    }

    fn tss_set_link(&mut self, bus: &mut dyn Bus, link: u16) -> Fallible<()> {
        self.segmented_write16(bus, seg::TR, 0x00, link)
    }

    /// Shared validation of a TSS descriptor about to be switched to.
    fn check_tss_target(&self, selector: u16, descriptor: &Descriptor) -> Fallible<()> {
        match descriptor.kind() {
            desc::TYPE_TSS16_AVAILABLE => {
                if descriptor.limit(self.traits.family >= CpuFamily::I386) < 0x2B {
                    return Err(Exception::ts(u64::from(selector)));
                }
            }
            desc::TYPE_TSS32_AVAILABLE => {
                if self.traits.family < CpuFamily::I386 {
                    return Err(Exception::gp(u64::from(selector)));
                }
                if descriptor.limit(true) < 0x67 {
                    return Err(Exception::ts(u64::from(selector)));
                }
            }
            _ => return Err(Exception::gp(u64::from(selector))),
        }
        if !descriptor.is_present() {
            return Err(Exception::np(u64::from(selector)));
        }
        Ok(())
    }

    // ========== Gate Traversal: JMP ==========

    fn jump_via_call_gate(
        &mut self,
        bus: &mut dyn Bus,
        gate_selector: u16,
        gate: &Descriptor,
    ) -> Fallible<()> {
        let segment_selector = gate.gate_selector();
        let cpl = self.cpl;
        if gate.dpl() < cpl || u16::from(gate.dpl()) < segment_selector & sel::RPL_MASK {
            return Err(Exception::gp(u64::from(gate_selector)));
        }
        if !gate.is_present() {
            return Err(Exception::np(u64::from(gate_selector)));
        }
        if selector_is_null(segment_selector) {
            return Err(Exception::gp(0));
        }

        let mut segment_descriptor =
            self.descriptor_load(bus, segment_selector, crate::exception::vector::GP)?;
        if segment_descriptor.is_system() || !segment_descriptor.is_executable() {
            return Err(Exception::gp(u64::from(segment_selector)));
        }
        let dpl = segment_descriptor.dpl();
        if segment_descriptor.is_conforming() {
            if dpl > cpl {
                return Err(Exception::gp(u64::from(segment_selector)));
            }
        } else if dpl != cpl {
            return Err(Exception::gp(u64::from(segment_selector)));
        }
        if !segment_descriptor.is_size_valid(self.is_long_mode()) {
            return Err(Exception::gp(u64::from(segment_selector)));
        }
        if !segment_descriptor.is_present() {
            return Err(Exception::np(u64::from(segment_selector)));
        }

        let offset = gate.gate_offset(self.traits.family >= CpuFamily::I386, self.is_long_mode());
        self.code_target_check(&segment_descriptor, offset, 0)?;

        self.segment_load_protected(
            bus,
            seg::CS,
            (segment_selector & !sel::RPL_MASK) | u16::from(cpl),
            &mut segment_descriptor,
        )?;
        self.set_xip(offset);
        Ok(())
    }

    fn jump_via_task_gate(
        &mut self,
        bus: &mut dyn Bus,
        gate_selector: u16,
        gate: &Descriptor,
    ) -> Fallible<()> {
        let tss_selector = gate.gate_selector();
        if gate.dpl() < self.cpl || u16::from(gate.dpl()) < tss_selector & sel::RPL_MASK {
            return Err(Exception::gp(u64::from(gate_selector)));
        }
        if !gate.is_present() {
            return Err(Exception::np(u64::from(gate_selector)));
        }
        if tss_selector & sel::LDT != 0 {
            return Err(Exception::np(u64::from(tss_selector)));
        }
        let mut tss_descriptor = self.descriptor_load(bus, tss_selector, crate::exception::vector::GP)?;
        self.check_tss_target(tss_selector, &tss_descriptor)?;

        let old_tr = self.sr[seg::TR].selector;
        let busy = self.tss_busy_byte();
        let selector_count = self.switch_task(bus, tss_selector, &mut tss_descriptor)?;
        self.tss_busy_clear(bus, old_tr, busy)?;
        if overflow(self.xip, 1, u64::from(self.sr[seg::CS].limit)) {
            return Err(Exception::gp(0));
        }
        self.tss_busy_set(bus)?;
        self.load_selectors_after_switch(bus, selector_count)
    }

    fn jump_via_task_segment(
        &mut self,
        bus: &mut dyn Bus,
        tss_selector: u16,
        tss_descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        let dpl = tss_descriptor.dpl();
        if dpl < self.cpl || u16::from(dpl) < tss_selector & sel::RPL_MASK {
            return Err(Exception::gp(u64::from(tss_selector)));
        }
        self.check_tss_target(tss_selector, tss_descriptor)?;

        let old_tr = self.sr[seg::TR].selector;
        let busy = self.tss_busy_byte();
        let selector_count = self.switch_task(bus, tss_selector, tss_descriptor)?;
        self.tss_busy_clear(bus, old_tr, busy)?;
        if overflow(self.xip, 1, u64::from(self.sr[seg::CS].limit)) {
            return Err(Exception::gp(0));
        }
        self.tss_busy_set(bus)?;
        self.load_selectors_after_switch(bus, selector_count)
    }

    /// Far JMP through a selector: direct code, call gate, task gate or
    /// TSS.
    pub fn jump_far(&mut self, bus: &mut dyn Bus, selector: u16, offset: u64) -> Fallible<()> {
        if self.is_real_mode() || self.is_v86_mode() {
            self.segment_check_limit(seg::CS, offset, 1, 0)?;
            self.segment_load_real_mode(seg::CS, selector);
            self.set_xip(offset);
            return Ok(());
        }

        let mut descriptor = self.descriptor_load(bus, selector, crate::exception::vector::GP)?;
        if !descriptor.is_system() {
            if !descriptor.is_executable() {
                return Err(Exception::gp(u64::from(selector)));
            }
            if !descriptor.is_size_valid(self.is_long_mode()) {
                return Err(Exception::gp(u64::from(selector)));
            }
            let cpl = self.cpl;
            let dpl = descriptor.dpl();
            if descriptor.is_conforming() {
                if dpl > cpl {
                    return Err(Exception::gp(u64::from(selector)));
                }
            } else {
                let rpl = (selector & sel::RPL_MASK) as u8;
                if rpl > cpl || dpl != cpl {
                    return Err(Exception::gp(u64::from(selector)));
                }
            }
            if !descriptor.is_present() {
                return Err(Exception::np(u64::from(selector)));
            }
            self.code_target_check(&descriptor, offset, 0)?;
            self.segment_load_protected(
                bus,
                seg::CS,
                (selector & !sel::RPL_MASK) | u16::from(cpl),
                &mut descriptor,
            )?;
            self.set_xip(offset);
            return Ok(());
        }

        match descriptor.kind() {
            desc::TYPE_CALL_GATE32 => {
                if self.traits.family < CpuFamily::I386 {
                    return Err(Exception::gp(u64::from(selector)));
                }
            }
            desc::TYPE_TASK_GATE => {
                if self.is_long_mode() {
                    return Err(Exception::gp(u64::from(selector)));
                }
            }
            desc::TYPE_CALL_GATE16 | desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY => {
                if self.is_long_mode() || self.traits.is_32bit_only() {
                    return Err(Exception::gp(u64::from(selector)));
                }
            }
            desc::TYPE_TSS32_AVAILABLE | desc::TYPE_TSS32_BUSY => {
                if self.traits.family < CpuFamily::I386 || self.is_long_mode() {
                    return Err(Exception::gp(u64::from(selector)));
                }
            }
            _ => return Err(Exception::gp(u64::from(selector))),
        }
        if self.is_long_mode() {
            self.descriptor_load_extension(bus, selector, &mut descriptor)?;
        }

        match descriptor.kind() {
            desc::TYPE_CALL_GATE16 | desc::TYPE_CALL_GATE32 => {
                self.jump_via_call_gate(bus, selector, &descriptor)
            }
            desc::TYPE_TASK_GATE => self.jump_via_task_gate(bus, selector, &descriptor),
            _ => self.jump_via_task_segment(bus, selector, &mut descriptor),
        }
    }

    // ========== Gate Traversal: CALL ==========

    fn call_via_call_gate(
        &mut self,
        bus: &mut dyn Bus,
        size: OpSize,
        gate_selector: u16,
        gate: &Descriptor,
    ) -> Fallible<()> {
        let is64 = size == OpSize::Qword;
        let segment_selector = gate.gate_selector();
        let cpl = self.cpl;
        let gate_rpl = gate_selector & sel::RPL_MASK;
        if gate.dpl() < cpl || gate_rpl > u16::from(gate.dpl()) {
            return Err(Exception::gp(u64::from(gate_selector)));
        }
        if !gate.is_present() {
            return Err(Exception::np(u64::from(gate_selector)));
        }
        if selector_is_null(segment_selector) {
            return Err(Exception::gp(0));
        }

        let mut segment_descriptor =
            self.descriptor_load(bus, segment_selector, crate::exception::vector::GP)?;
        if segment_descriptor.is_system() || !segment_descriptor.is_executable() {
            return Err(Exception::gp(u64::from(segment_selector)));
        }
        if segment_descriptor.dpl() > cpl {
            return Err(Exception::gp(u64::from(segment_selector)));
        }
        if is64 && !segment_descriptor.is_size_valid(true) {
            return Err(Exception::gp(u64::from(segment_selector)));
        }
        if !segment_descriptor.is_present() {
            return Err(Exception::np(u64::from(segment_selector)));
        }

        let new_ip = match size {
            OpSize::Word => gate.gate_offset(self.traits.family >= CpuFamily::I386, false) & 0xFFFF,
            OpSize::Dword => gate.gate_offset_32(),
            _ => gate.gate_offset_64(),
        };

        let mut new_cpl = cpl;
        if !segment_descriptor.is_conforming() {
            new_cpl = segment_descriptor.dpl().min(cpl);
        }

        if new_cpl < cpl {
            // inter-privilege call: pull the inner stack from the TSS
            let old_ss = self.sr[seg::SS].selector;
            let old_sp = self.gpr[crate::regs::gpr::SP];

            // legacy gates copy a parameter block from the outer stack
            let count = if is64 { 0 } else { gate.parameter_count() };
            let mut parameters = [0u64; 31];
            for (i, parameter) in parameters.iter_mut().take(count).enumerate() {
                *parameter = match size {
                    OpSize::Word => {
                        u64::from(self.segmented_read16(bus, seg::SS, old_sp + 2 * i as u64)?)
                    }
                    _ => u64::from(self.segmented_read32(bus, seg::SS, old_sp + 4 * i as u64)?),
                };
            }

            let (new_ss, new_sp) = self.load_task_stack(bus, new_cpl)?;
            if !is64 && selector_is_null(new_ss) {
                return Err(Exception::ts(u64::from(new_ss)));
            }
            let mut stack_descriptor = self.descriptor_load(bus, new_ss, crate::exception::vector::GP)?;
            if !is64 {
                if new_ss & sel::RPL_MASK != u16::from(new_cpl)
                    || stack_descriptor.dpl() != new_cpl
                {
                    return Err(Exception::ts(u64::from(new_ss)));
                }
                if stack_descriptor.is_system()
                    || stack_descriptor.is_executable()
                    || !stack_descriptor.is_writable()
                {
                    return Err(Exception::ts(u64::from(new_ss)));
                }
                if !stack_descriptor.is_present() {
                    return Err(Exception::ss_fault(u64::from(new_ss)));
                }
                let bytes = size.bytes() as u64 * (4 + count as u64);
                self.stack_descriptor_check_limit(new_ss, &stack_descriptor, new_sp, bytes)?;
                self.descriptor_check_limit(seg::CS, &segment_descriptor, new_ip, 1, 0)?;
            } else {
                self.check_canonical(Some(seg::CS), new_ip, 0)?;
            }

            log::trace!(
                "call gate to ring {}: ss:sp {:04x}:{:x} -> {:04x}:{:x}",
                new_cpl,
                old_ss,
                old_sp,
                new_ss,
                new_sp
            );

            self.set_cpl(new_cpl);
            if is64 && selector_is_null(new_ss) {
                self.segment_load_null(seg::SS, new_ss);
            } else {
                self.segment_load_protected(bus, seg::SS, new_ss, &mut stack_descriptor)?;
            }
            self.gpr[crate::regs::gpr::SP] = new_sp;

            self.push_size(bus, size, u64::from(old_ss))?;
            self.push_size(bus, size, old_sp)?;
            for i in (0..count).rev() {
                self.push_size(bus, size, parameters[i])?;
            }
        } else {
            if !is64 {
                self.stack_segment_check_limit(size.bytes() as u64 * 2, 0)?;
                self.descriptor_check_limit(seg::CS, &segment_descriptor, new_ip, 1, 0)?;
            } else {
                let sp = self.gpr[crate::regs::gpr::SP];
                self.check_canonical(Some(seg::SS), sp.wrapping_sub(16), 0)?;
                self.check_canonical(Some(seg::CS), new_ip, 0)?;
            }
        }

        let cs = u64::from(self.sr[seg::CS].selector);
        let xip = self.xip;
        self.push_size(bus, size, cs)?;
        self.push_size(bus, size, xip)?;
        self.segment_load_protected(
            bus,
            seg::CS,
            (segment_selector & !sel::RPL_MASK) | u16::from(new_cpl),
            &mut segment_descriptor,
        )?;
        self.set_xip(new_ip);
        Ok(())
    }

    fn call_via_task_gate(
        &mut self,
        bus: &mut dyn Bus,
        gate_selector: u16,
        gate: &Descriptor,
    ) -> Fallible<()> {
        let tss_selector = gate.gate_selector();
        if gate.dpl() < self.cpl || u16::from(gate.dpl()) < tss_selector & sel::RPL_MASK {
            return Err(Exception::gp(u64::from(gate_selector)));
        }
        if !gate.is_present() {
            return Err(Exception::np(u64::from(gate_selector)));
        }
        if tss_selector & sel::LDT != 0 {
            return Err(Exception::np(u64::from(tss_selector)));
        }
        let mut tss_descriptor = self.descriptor_load(bus, tss_selector, crate::exception::vector::GP)?;
        self.check_tss_target(tss_selector, &tss_descriptor)?;

        let old_tss = self.sr[seg::TR].selector;
        let selector_count = self.switch_task(bus, tss_selector, &mut tss_descriptor)?;
        if overflow(self.xip, 1, u64::from(self.sr[seg::CS].limit)) {
            return Err(Exception::gp(0));
        }
        self.tss_busy_set(bus)?;
        self.tss_set_nt(bus)?;
        self.tss_set_link(bus, old_tss)?;
        self.load_selectors_after_switch(bus, selector_count)
    }

    fn call_via_task_segment(
        &mut self,
        bus: &mut dyn Bus,
        tss_selector: u16,
        tss_descriptor: &mut Descriptor,
    ) -> Fallible<()> {
        let dpl = tss_descriptor.dpl();
        if dpl < self.cpl || u16::from(dpl) < tss_selector & sel::RPL_MASK {
            return Err(Exception::gp(u64::from(tss_selector)));
        }
        self.check_tss_target(tss_selector, tss_descriptor)?;

        let old_tss = self.sr[seg::TR].selector;
        let selector_count = self.switch_task(bus, tss_selector, tss_descriptor)?;
        if overflow(self.xip, 1, u64::from(self.sr[seg::CS].limit)) {
            return Err(Exception::gp(0));
        }
        self.tss_busy_set(bus)?;
        self.tss_set_nt(bus)?;
        self.tss_set_link(bus, old_tss)?;
        self.load_selectors_after_switch(bus, selector_count)
    }

    /// Far CALL through a selector.
    pub fn call_far(
        &mut self,
        bus: &mut dyn Bus,
        size: OpSize,
        selector: u16,
        offset: u64,
    ) -> Fallible<()> {
        let is64 = size == OpSize::Qword;
        if !is64 && (self.is_real_mode() || self.is_v86_mode()) {
            self.stack_segment_check_limit(size.bytes() as u64 * 2, 0)?;
            if size == OpSize::Word && offset & !0xFFFF != 0 {
                return Err(Exception::gp(0));
            }
            let cs = u64::from(self.sr[seg::CS].selector);
            let xip = self.xip;
            self.push_size(bus, size, cs)?;
            self.push_size(bus, size, xip)?;
            self.segment_load_real_mode(seg::CS, selector);
            self.set_xip(offset);
            return Ok(());
        }

        if selector_is_null(selector) {
            return Err(Exception::gp(0));
        }

        let mut descriptor = self.descriptor_load(bus, selector, crate::exception::vector::GP)?;
        if !descriptor.is_system() {
            if !descriptor.is_executable() {
                return Err(Exception::gp(u64::from(selector)));
            }
            if !descriptor.is_size_valid(self.is_long_mode()) {
                return Err(Exception::gp(u64::from(selector)));
            }
            let cpl = self.cpl;
            let dpl = descriptor.dpl();
            if descriptor.is_conforming() {
                if dpl > cpl {
                    return Err(Exception::gp(u64::from(selector)));
                }
            } else {
                let rpl = (selector & sel::RPL_MASK) as u8;
                if rpl > cpl || dpl != cpl {
                    return Err(Exception::gp(u64::from(selector)));
                }
            }
            if !descriptor.is_present() {
                return Err(Exception::np(u64::from(selector)));
            }
            self.stack_segment_check_limit(size.bytes() as u64 * 2, 0)?;
            self.code_target_check(&descriptor, offset, 0)?;

            let cs = u64::from(self.sr[seg::CS].selector);
            let xip = self.xip;
            self.push_size(bus, size, cs)?;
            self.push_size(bus, size, xip)?;
            self.segment_load_protected(
                bus,
                seg::CS,
                (selector & !sel::RPL_MASK) | u16::from(cpl),
                &mut descriptor,
            )?;
            self.set_xip(offset);
            return Ok(());
        }

        if is64 {
            if descriptor.kind() != desc::TYPE_CALL_GATE32 {
                return Err(Exception::gp(u64::from(selector)));
            }
        } else {
            match descriptor.kind() {
                desc::TYPE_TSS32_AVAILABLE | desc::TYPE_TSS32_BUSY => {
                    if self.traits.family < CpuFamily::I386 || self.is_long_mode() {
                        return Err(Exception::gp(u64::from(selector)));
                    }
                }
                desc::TYPE_TASK_GATE => {
                    if self.is_long_mode() {
                        return Err(Exception::gp(u64::from(selector)));
                    }
                }
                desc::TYPE_CALL_GATE32 => {
                    if self.traits.family < CpuFamily::I386 {
                        return Err(Exception::gp(u64::from(selector)));
                    }
                }
                desc::TYPE_CALL_GATE16 | desc::TYPE_TSS16_AVAILABLE | desc::TYPE_TSS16_BUSY => {
                    if self.is_long_mode() || self.traits.is_32bit_only() {
                        return Err(Exception::gp(u64::from(selector)));
                    }
                }
                _ => return Err(Exception::gp(u64::from(selector))),
            }
        }

        if self.is_long_mode() {
            self.descriptor_load_extension(bus, selector, &mut descriptor)?;
        }

        match descriptor.kind() {
            desc::TYPE_CALL_GATE16 => self.call_via_call_gate(bus, OpSize::Word, selector, &descriptor),
            desc::TYPE_CALL_GATE32 => {
                if self.is_long_mode() {
                    self.call_via_call_gate(bus, OpSize::Qword, selector, &descriptor)
                } else {
                    self.call_via_call_gate(bus, OpSize::Dword, selector, &descriptor)
                }
            }
            desc::TYPE_TASK_GATE => self.call_via_task_gate(bus, selector, &descriptor),
            _ => self.call_via_task_segment(bus, selector, &mut descriptor),
        }
    }

    // ========== Interrupt Gates ==========

    /// Dispatch through an interrupt or trap gate; `size` selects the
    /// 16/32/64-bit frame shape. Expects the gate's own type/presence
    /// checks to have already run.
    pub fn interrupt_via_gate(
        &mut self,
        bus: &mut dyn Bus,
        size: OpSize,
        exception: Exception,
        gate: &Descriptor,
        is_interrupt_gate: bool,
    ) -> Fallible<()> {
        let is64 = size == OpSize::Qword;
        let ext = u64::from(!exception.is_software());
        let segment_selector = gate.gate_selector();
        if selector_is_null(segment_selector) {
            return Err(Exception::gp(ext));
        }
        let error_code = u64::from(segment_selector & !sel::RPL_MASK) | ext;

        let mut segment_descriptor =
            self.descriptor_load(bus, segment_selector, crate::exception::vector::GP)?;
        if segment_descriptor.is_system() || !segment_descriptor.is_executable() {
            return Err(Exception::gp(error_code));
        }
        let dpl = segment_descriptor.dpl();
        if dpl > self.cpl {
            return Err(Exception::gp(error_code));
        }
        if !segment_descriptor.is_present() {
            return Err(Exception::np(error_code));
        }

        let cpl = self.cpl;
        let mut new_cpl = cpl;
        if !segment_descriptor.is_conforming() {
            new_cpl = dpl;
        }
        if self.vm && new_cpl != 0 {
            return Err(Exception::gp(error_code));
        }

        let offset = match size {
            OpSize::Word => gate.gate_offset(self.traits.family >= CpuFamily::I386, false) & 0xFFFF,
            OpSize::Dword => gate.gate_offset_32(),
            _ => gate.gate_offset_64(),
        };

        let from_v86 = self.vm;
        if is64 || new_cpl < cpl {
            let old_ss = self.sr[seg::SS].selector;
            let old_sp = self.gpr[crate::regs::gpr::SP];

            let ist = if is64 { gate.ist() } else { 0 };
            let (new_ss, new_sp);
            if is64 && ist != 0 {
                new_sp = self.load_task_ist_stack(bus, ist)?;
                new_ss = u16::from(new_cpl);
            } else if new_cpl < cpl {
                let pair = self.load_task_stack(bus, new_cpl)?;
                new_ss = pair.0;
                new_sp = pair.1;
            } else {
                new_ss = old_ss;
                new_sp = old_sp;
            }

            let mut stack_descriptor = None;
            if !is64 {
                if selector_is_null(new_ss) {
                    return Err(Exception::ts(ext));
                }
                if new_ss & sel::RPL_MASK != u16::from(new_cpl) {
                    return Err(Exception::ts(u64::from(new_ss & !sel::RPL_MASK) | ext));
                }
                let sd = self.descriptor_load(bus, new_ss, crate::exception::vector::GP)?;
                if sd.dpl() != new_cpl {
                    return Err(Exception::ts(u64::from(new_ss & !sel::RPL_MASK) | ext));
                }
                if sd.is_system() || sd.is_executable() || !sd.is_writable() {
                    return Err(Exception::ts(u64::from(new_ss & !sel::RPL_MASK) | ext));
                }
                if !sd.is_present() {
                    return Err(Exception::ss_fault(u64::from(new_ss & !sel::RPL_MASK) | ext));
                }
                let slots: u64 = if from_v86 { 9 } else { 5 }
                    + u64::from(exception.error_code.is_some());
                self.stack_descriptor_check_limit(
                    (new_ss & !sel::RPL_MASK) | (ext as u16),
                    &sd,
                    new_sp,
                    size.bytes() as u64 * slots,
                )?;
                self.descriptor_check_limit(seg::CS, &segment_descriptor, offset, 1, 0)?;
                stack_descriptor = Some(sd);
            } else {
                self.check_canonical(Some(seg::SS), new_sp, ext)?;
                self.check_canonical(Some(seg::CS), offset, ext)?;
            }

            self.set_cpl(new_cpl);
            if let Some(mut sd) = stack_descriptor.take() {
                self.segment_load_protected(bus, seg::SS, new_ss, &mut sd)?;
            } else {
                self.segment_load_null(seg::SS, new_ss);
            }
            let new_sp = if is64 { new_sp & !0xF } else { new_sp };
            self.gpr[crate::regs::gpr::SP] = new_sp;

            if from_v86 {
                // the V86 data segments ride along and are then nulled
                let (gs, fs, ds, es) = (
                    self.sr[seg::GS].selector,
                    self.sr[seg::FS].selector,
                    self.sr[seg::DS].selector,
                    self.sr[seg::ES].selector,
                );
                self.push_size(bus, size, u64::from(gs))?;
                self.push_size(bus, size, u64::from(fs))?;
                self.push_size(bus, size, u64::from(ds))?;
                self.push_size(bus, size, u64::from(es))?;
                for segment in [seg::ES, seg::DS, seg::FS, seg::GS] {
                    self.segment_load_null(segment, 0);
                }
            }
            self.push_size(bus, size, u64::from(old_ss))?;
            self.push_size(bus, size, old_sp)?;
        } else {
            let slots: u64 = 3 + u64::from(exception.error_code.is_some());
            self.stack_segment_check_limit(size.bytes() as u64 * slots, ext)?;
            self.descriptor_check_limit(seg::CS, &segment_descriptor, offset, 1, 0)?;
        }

        let flags = self.flags_get64();
        self.push_size(bus, size, flags)?;
        let cs = u64::from(self.sr[seg::CS].selector);
        let xip = self.xip;
        self.push_size(bus, size, cs)?;
        self.push_size(bus, size, xip)?;
        self.tf = false;
        self.vm = false;
        self.rf = false;
        self.nt = false;
        if is_interrupt_gate {
            self.intf = false;
        }
        self.segment_load_protected(
            bus,
            seg::CS,
            (segment_selector & !sel::RPL_MASK) | u16::from(cpl),
            &mut segment_descriptor,
        )?;
        self.set_xip(offset);

        if let Some(code) = exception.error_code {
            self.push_size(bus, size, code)?;
        }
        Ok(())
    }

    /// Dispatch through a task gate in the IDT.
    pub fn interrupt_via_task_gate(
        &mut self,
        bus: &mut dyn Bus,
        exception: Exception,
        gate: &Descriptor,
    ) -> Fallible<()> {
        let ext = u64::from(!exception.is_software());
        let tss_selector = gate.gate_selector();
        let error_code = u64::from(tss_selector & !sel::RPL_MASK) | ext;

        if tss_selector & sel::LDT != 0 {
            return Err(Exception::np(error_code));
        }
        let mut tss_descriptor = self.descriptor_load(bus, tss_selector, crate::exception::vector::GP)?;
        self.check_tss_target(tss_selector, &tss_descriptor)?;

        let old_tss = self.sr[seg::TR].selector;
        let selector_count = self.switch_task(bus, tss_selector, &mut tss_descriptor)?;
        if exception.error_code.is_some() {
            let width = if self.is_32bit_mode() { 4 } else { 2 };
            self.stack_segment_check_limit(width, 0)?;
        }
        if overflow(self.xip, 1, u64::from(self.sr[seg::CS].limit)) {
            return Err(Exception::gp(ext));
        }
        self.tss_busy_set(bus)?;
        self.tss_set_nt(bus)?;
        self.tss_set_link(bus, old_tss)?;
        self.load_selectors_after_switch(bus, selector_count)?;

        if let Some(code) = exception.error_code {
            if self.is_32bit_mode() {
                self.push32(bus, code as u32)?;
            } else {
                self.push16(bus, code as u16)?;
            }
        }
        Ok(())
    }

    // ========== IRET ==========

    /// IRET with NT set: unwind through the back link of the current TSS.
    fn return_via_nested_task(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        if overflow(0, 2, u64::from(self.sr[seg::TR].limit)) {
            return Err(Exception::ts(u64::from(self.sr[seg::TR].selector)));
        }
        let tss_selector = self.segmented_read16(bus, seg::TR, 0)?;
        if tss_selector & sel::LDT != 0 {
            return Err(Exception::gp(u64::from(tss_selector)));
        }
        let mut tss_descriptor = self.descriptor_load(bus, tss_selector, crate::exception::vector::GP)?;
        // the back link must name a *busy* TSS
        match tss_descriptor.kind() {
            desc::TYPE_TSS16_BUSY => {}
            desc::TYPE_TSS32_BUSY => {
                if self.traits.family < CpuFamily::I386 {
                    return Err(Exception::ts(u64::from(tss_selector)));
                }
            }
            _ => return Err(Exception::ts(u64::from(tss_selector))),
        }
        if !tss_descriptor.is_present() {
            return Err(Exception::np(u64::from(tss_selector)));
        }

        let old_tr = self.sr[seg::TR].selector;
        let busy = self.tss_busy_byte();
        let old_base = self.sr[seg::TR].base;
        let old_access = self.sr[seg::TR].access;
        let selector_count = self.switch_task(bus, tss_selector, &mut tss_descriptor)?;
        self.tss_busy_clear(bus, old_tr, busy)?;
        self.clear_old_nt(bus, old_access, old_base)?;
        if overflow(self.xip, 1, u64::from(self.sr[seg::CS].limit)) {
            return Err(Exception::gp(0));
        }
        self.load_selectors_after_switch(bus, selector_count)
    }

    /// IRET in all its modes. `size` is the operand size of the
    /// instruction.
    pub fn return_interrupt(&mut self, bus: &mut dyn Bus, size: OpSize) -> Fallible<()> {
        self.store_x80_registers();
        let result = self.return_interrupt_inner(bus, size);
        self.load_x80_if_emulation();
        result
    }

    fn return_interrupt_inner(&mut self, bus: &mut dyn Bus, size: OpSize) -> Fallible<()> {
        let is64 = size == OpSize::Qword;

        if !is64 && self.is_real_mode() {
            let ip = self.pop_size(bus, size)?;
            self.set_xip(ip);
            let cs = self.pop_size(bus, size)?;
            self.segment_load_real_mode(seg::CS, cs as u16);
            let old_flags = self.flags_get64();
            let popped = self.pop_size(bus, size)?;
            match size {
                OpSize::Word => self.flags_set16(popped as u16),
                _ => self.flags_set32(popped as u32),
            }
            if !self.md_enabled {
                self.md = old_flags & flags::MD != 0;
            }
            if size != OpSize::Word {
                self.vm = old_flags & flags::VM != 0;
                self.vif = old_flags & flags::VIF != 0;
                self.vip = old_flags & flags::VIP != 0;
            }
            return Ok(());
        }

        if !is64 && self.is_v86_mode() {
            if self.iopl != 3 {
                return Err(Exception::gp(0));
            }
            let ip = self.pop_size(bus, size)?;
            self.set_xip(ip);
            let cs = self.pop_size(bus, size)?;
            self.segment_load_real_mode(seg::CS, cs as u16);
            let old_flags = self.flags_get64();
            let popped = self.pop_size(bus, size)?;
            match size {
                OpSize::Word => self.flags_set16(popped as u16),
                _ => self.flags_set32(popped as u32),
            }
            self.iopl = 3;
            if !self.md_enabled {
                self.md = old_flags & flags::MD != 0;
            }
            if size != OpSize::Word {
                self.vm = old_flags & flags::VM != 0;
                self.vif = old_flags & flags::VIF != 0;
                self.vip = old_flags & flags::VIP != 0;
            }
            self.segment_check_limit(seg::CS, self.xip, 1, 0)?;
            return Ok(());
        }

        if !is64 && self.nt {
            if self.is_long_mode() {
                return Err(Exception::gp(0));
            }
            return self.return_via_nested_task(bus);
        }

        // protected mode return
        let width = size.bytes() as u64;
        let sp = self.stack_pointer();
        if !is64 {
            self.segment_check_limit(seg::SS, sp, width * 3, 0)?;
        }
        self.check_canonical(Some(seg::SS), sp + width * 3, 0)?;

        let rip = self.read_stack_size(bus, size, 0)?;
        let cs = self.read_stack_size(bus, size, 1)? as u16;
        let mut popped_flags = self.read_stack_size(bus, size, 2)?;

        if size != OpSize::Word
            && popped_flags & flags::VM != 0
            && self.cpl == 0
            && !self.is_long_mode()
        {
            // return to virtual 8086 mode: the frame carries SS:SP and the
            // four data segments
            let sp = self.stack_pointer();
            self.segment_check_limit(seg::SS, sp, width * 9, 0)?;
            self.segment_check_limit(seg::CS, rip, 1, 0)?;
            self.set_xip(rip);
            self.segment_load_real_mode_full(seg::CS, cs);
            self.flags_set32(popped_flags as u32);
            self.stack_adjust(width * 3);
            let esp = self.pop_size(bus, size)?;
            let ss = self.pop_size(bus, size)? as u16;
            let es = self.pop_size(bus, size)? as u16;
            let ds = self.pop_size(bus, size)? as u16;
            let fs = self.pop_size(bus, size)? as u16;
            let gs = self.pop_size(bus, size)? as u16;
            self.segment_load_real_mode_full(seg::ES, es);
            self.segment_load_real_mode_full(seg::DS, ds);
            self.segment_load_real_mode_full(seg::FS, fs);
            self.segment_load_real_mode_full(seg::GS, gs);
            self.segment_load_real_mode_full(seg::SS, ss);
            self.gpr[crate::regs::gpr::SP] = esp;
            self.set_cpl(3);
            return Ok(());
        }

        let mut restore_stack = false;
        let mut outer_privilege = false;
        if (cs & sel::RPL_MASK) as u8 > self.cpl {
            outer_privilege = true;
            restore_stack = true;
        } else if self.is_64bit_mode() {
            restore_stack = true;
        }

        let (mut rsp, mut ss) = (0u64, 0u16);
        if restore_stack {
            let sp = self.stack_pointer();
            if !is64 {
                self.segment_check_limit(seg::SS, sp, width * 5, 0)?;
            }
            self.check_canonical(Some(seg::SS), sp + width * 5, 0)?;
            rsp = self.read_stack_size(bus, size, 3)?;
            ss = self.read_stack_size(bus, size, 4)? as u16;
        }

        if selector_is_null(cs) {
            return Err(Exception::gp(0));
        }
        let mut descriptor = self.descriptor_load(bus, cs, crate::exception::vector::GP)?;
        if descriptor.is_system() || !descriptor.is_executable() {
            return Err(Exception::gp(u64::from(cs)));
        }
        if !descriptor.is_size_valid(self.is_long_mode()) {
            return Err(Exception::gp(u64::from(cs)));
        }
        let rpl = cs & sel::RPL_MASK;
        if descriptor.is_conforming() {
            if u16::from(descriptor.dpl()) > rpl {
                return Err(Exception::gp(u64::from(cs)));
            }
        } else if u16::from(descriptor.dpl()) != rpl {
            return Err(Exception::gp(u64::from(cs)));
        }
        if !descriptor.is_present() {
            return Err(Exception::np(u64::from(cs)));
        }

        let mut stack_descriptor = None;
        if restore_stack {
            if selector_is_null(ss) {
                if !(self.is_long_mode() && descriptor.is_long()) {
                    return Err(Exception::gp(0));
                }
            } else {
                let sd = self.descriptor_load(bus, ss, crate::exception::vector::GP)?;
                if ss & sel::RPL_MASK != rpl {
                    return Err(Exception::gp(u64::from(ss)));
                }
                if sd.is_system() || sd.is_executable() || !sd.is_writable() {
                    return Err(Exception::gp(u64::from(ss)));
                }
                if u16::from(sd.dpl()) != rpl {
                    return Err(Exception::gp(u64::from(ss)));
                }
                if !sd.is_present() {
                    return Err(Exception::np(u64::from(ss)));
                }
                stack_descriptor = Some(sd);
            }
        }

        if !is64 {
            self.descriptor_check_limit(seg::CS, &descriptor, rip, 1, 0)?;
        }
        self.check_canonical(Some(seg::CS), rip, 0)?;

        // IF and IOPL (and the VM/VIF/VIP group on 32-bit frames) stay put
        // when the returning ring lacks the privilege to touch them.
        if self.cpl > self.iopl {
            popped_flags =
                (popped_flags & !flags::IF) | (u64::from(self.intf) << 9);
        }
        if self.cpl != 0 {
            popped_flags = (popped_flags & !flags::IOPL_MASK)
                | (u64::from(self.iopl) << flags::IOPL_SHIFT);
            if size != OpSize::Word {
                popped_flags = (popped_flags & !flags::VM) | (u64::from(self.vm) << 17);
                popped_flags = (popped_flags & !flags::VIF) | (u64::from(self.vif) << 19);
                popped_flags = (popped_flags & !flags::VIP) | (u64::from(self.vip) << 20);
            }
        }

        match size {
            OpSize::Word => self.flags_set16(popped_flags as u16),
            OpSize::Dword => self.flags_set32(popped_flags as u32),
            _ => self.flags_set64(popped_flags),
        }
        self.set_xip(rip);
        self.segment_load_protected(bus, seg::CS, cs, &mut descriptor)?;
        self.set_cpl((cs & sel::RPL_MASK) as u8);

        if restore_stack {
            self.gpr[crate::regs::gpr::SP] = rsp;
            if let Some(mut sd) = stack_descriptor.take() {
                self.segment_load_protected(bus, seg::SS, ss, &mut sd)?;
            } else {
                self.segment_load_null(seg::SS, ss);
            }
        } else {
            self.stack_adjust(width * 3);
        }

        if outer_privilege {
            // any data segment now more privileged than the new CPL goes
            // null
            for segment in [seg::ES, seg::DS, seg::FS, seg::GS, seg::DS3, seg::DS2] {
                let access = self.sr[segment].access;
                if desc::dpl(access) < self.cpl
                    && (!desc::is_executable(access) || !desc::is_conforming(access))
                {
                    self.segment_load_null(segment, 0);
                }
            }
        }
        Ok(())
    }

    // ========== Far RET ==========

    pub fn return_far(&mut self, bus: &mut dyn Bus, size: OpSize, bytes: u64) -> Fallible<()> {
        let is64 = size == OpSize::Qword;
        let width = size.bytes() as u64;

        if !is64 && (self.is_real_mode() || self.is_v86_mode()) {
            self.segment_check_limit(seg::SS, self.stack_pointer(), width * 2, 0)?;
            let ip = self.pop_size(bus, size)?;
            self.set_xip(ip);
            let cs = self.pop_size(bus, size)?;
            self.segment_load_real_mode(seg::CS, cs as u16);
            if size == OpSize::Word {
                self.segment_check_limit(seg::CS, self.xip, 1, 0)?;
            }
            self.stack_adjust(bytes);
            return Ok(());
        }

        let sp = self.stack_pointer();
        if !is64 {
            self.segment_check_limit(seg::SS, sp, width * 2, 0)?;
        }
        self.check_canonical(Some(seg::SS), sp + width * 2, 0)?;
        let rip = self.read_stack_size(bus, size, 0)?;
        let cs = self.read_stack_size(bus, size, 1)? as u16;

        if selector_is_null(cs) {
            return Err(Exception::gp(0));
        }
        let mut descriptor = self.descriptor_load(bus, cs, crate::exception::vector::GP)?;
        if descriptor.is_system() || !descriptor.is_executable() {
            return Err(Exception::gp(u64::from(cs)));
        }
        if !descriptor.is_size_valid(self.is_long_mode()) {
            return Err(Exception::gp(u64::from(cs)));
        }
        let rpl = cs & sel::RPL_MASK;
        if (rpl as u8) < self.cpl {
            return Err(Exception::gp(u64::from(cs)));
        }
        if descriptor.is_conforming() {
            if u16::from(descriptor.dpl()) > rpl {
                return Err(Exception::gp(u64::from(cs)));
            }
        } else if u16::from(descriptor.dpl()) != rpl {
            return Err(Exception::gp(u64::from(cs)));
        }
        if !descriptor.is_present() {
            return Err(Exception::np(u64::from(cs)));
        }

        if (rpl as u8) > self.cpl {
            // return to outer privilege: unwind SS:SP from the frame
            let sp = self.stack_pointer();
            if !is64 {
                self.segment_check_limit(seg::SS, sp, width * 4 + bytes, 0)?;
            }
            self.check_canonical(Some(seg::SS), sp + width * 4 + bytes, 0)?;
            let rsp = self.read_stack_at(bus, size, width * 2 + bytes)?;
            let ss = self.read_stack_at(bus, size, width * 3 + bytes)? as u16;

            let mut stack_descriptor = None;
            if selector_is_null(ss) {
                if !(self.is_long_mode() && descriptor.is_long()) {
                    return Err(Exception::gp(0));
                }
            } else {
                let sd = self.descriptor_load(bus, ss, crate::exception::vector::GP)?;
                if ss & sel::RPL_MASK != rpl {
                    return Err(Exception::gp(u64::from(ss)));
                }
                if sd.is_system() || sd.is_executable() || !sd.is_writable() {
                    return Err(Exception::gp(u64::from(ss)));
                }
                if u16::from(sd.dpl()) != rpl {
                    return Err(Exception::gp(u64::from(ss)));
                }
                if !sd.is_present() {
                    return Err(Exception::np(u64::from(ss)));
                }
                stack_descriptor = Some(sd);
            }

            if !is64 {
                self.descriptor_check_limit(seg::CS, &descriptor, rip, 1, 0)?;
            }
            self.check_canonical(Some(seg::CS), rip, 0)?;

            self.set_xip(rip);
            self.segment_load_protected(bus, seg::CS, cs, &mut descriptor)?;
            self.set_cpl(rpl as u8);

            self.gpr[crate::regs::gpr::SP] = rsp.wrapping_add(bytes);
            if let Some(mut sd) = stack_descriptor.take() {
                self.segment_load_protected(bus, seg::SS, ss, &mut sd)?;
            } else {
                self.segment_load_null(seg::SS, ss);
            }

            for segment in [seg::ES, seg::DS, seg::FS, seg::GS, seg::DS3, seg::DS2] {
                let access = self.sr[segment].access;
                if desc::dpl(access) < self.cpl
                    && (!desc::is_executable(access) || !desc::is_conforming(access))
                {
                    self.segment_load_null(segment, 0);
                }
            }
        } else {
            if !is64 {
                self.descriptor_check_limit(seg::CS, &descriptor, rip, 1, 0)?;
            }
            self.check_canonical(Some(seg::CS), rip, 0)?;
            self.stack_adjust(width * 2 + bytes);
            self.set_xip(rip);
            self.segment_load_protected(bus, seg::CS, cs, &mut descriptor)?;
        }
        Ok(())
    }

    // ========== LAR / LSL / VERR / VERW ==========

    /// Shared descriptor probe: returns the descriptor when the selector
    /// is visible at the current privilege, or `None` (ZF:=0 semantics).
    pub fn probe_descriptor(
        &mut self,
        bus: &mut dyn Bus,
        selector: u16,
    ) -> Fallible<Option<Descriptor>> {
        if selector_is_null(selector) {
            return Ok(None);
        }
        let table = if selector & sel::LDT != 0 { seg::LDTR } else { seg::GDTR };
        let len = if self.traits.family >= CpuFamily::I386 { 8 } else { 6 };
        if overflow(
            u64::from(selector & sel::INDEX_MASK),
            len as u64,
            u64::from(self.sr[table].limit),
        ) {
            return Ok(None);
        }
        let descriptor = self.descriptor_read_selector(
            bus,
            selector,
            0,
            len,
            crate::exception::vector::GP,
        )?;
        let rpl = (selector & sel::RPL_MASK) as u8;
        if !descriptor.is_system()
            && !(descriptor.is_executable() && descriptor.is_conforming())
            && (descriptor.dpl() < self.cpl || descriptor.dpl() < rpl)
        {
            return Ok(None);
        }
        Ok(Some(descriptor))
    }
}
