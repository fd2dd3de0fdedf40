//! x87 floating point unit
//!
//! A stack-like bank of eight 80-bit registers indexed through the TOP
//! field of the status word, a tag word classifying every slot, and the
//! environment/state images for all documented layouts. External FPU
//! variants (8087/287/387/IIT) defer execution behind the busy bit and are
//! driven by [`crate::cpu::Cpu::fpu_step`]; the integrated FPU executes
//! eagerly.

pub mod float80;

use crate::bus::Bus;
use crate::cpu::{Cpu, OpSize};
use crate::exception::{Exception, Fallible, StepResult};
use crate::regs::{gpr, seg, Cr0, Segment};
use crate::traits::FpuType;
use float80::{Class, Float80, Precision, Rounding};

// Status word bits.
pub const SW_IE: u16 = 1 << 0;
pub const SW_DE: u16 = 1 << 1;
pub const SW_ZE: u16 = 1 << 2;
pub const SW_OE: u16 = 1 << 3;
pub const SW_UE: u16 = 1 << 4;
pub const SW_PE: u16 = 1 << 5;
pub const SW_SF: u16 = 1 << 6;
pub const SW_ES: u16 = 1 << 7;
pub const SW_C0: u16 = 1 << 8;
pub const SW_C1: u16 = 1 << 9;
pub const SW_C2: u16 = 1 << 10;
pub const SW_TOP_SHIFT: u32 = 11;
pub const SW_TOP_MASK: u16 = 7 << SW_TOP_SHIFT;
pub const SW_C3: u16 = 1 << 14;
pub const SW_B: u16 = 1 << 15;

// Control word bits.
pub const CW_IM: u16 = 1 << 0;
pub const CW_DM: u16 = 1 << 1;
pub const CW_ZM: u16 = 1 << 2;
pub const CW_OM: u16 = 1 << 3;
pub const CW_UM: u16 = 1 << 4;
pub const CW_PM: u16 = 1 << 5;
/// 8087 interrupt enable mask (interrupts disabled when set).
pub const CW_IEM: u16 = 1 << 7;

// Tag values.
pub const TAG_VALID: u16 = 0;
pub const TAG_ZERO: u16 = 1;
pub const TAG_SPECIAL: u16 = 2;
pub const TAG_EMPTY: u16 = 3;

/// Operation a busy external FPU committed for later (FSAVE/FSTENV replay
/// the segment state captured at queue time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuedOp {
    #[default]
    None,
    Fsave,
    Fstenv,
}

/// Instruction latched for a deferred external FPU step.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingInstruction {
    pub fop: u16,
    pub fcs: u16,
    pub fip: u64,
    pub fds: u16,
    pub fdp: u64,
    pub opcode: u8,
    pub modrm: u8,
    pub segment: usize,
    pub offset: u64,
    pub has_operand: bool,
}

/// FPU register bank and bookkeeping state.
#[derive(Debug, Clone)]
pub struct Fpu {
    pub fpu_type: FpuType,
    pub cw: u16,
    pub sw: u16,
    pub tw: u16,
    pub fop: u16,
    pub fip: u64,
    pub fcs: u16,
    pub fdp: u64,
    pub fds: u16,
    /// Eight registers per bank; only the IIT 3C87 uses more than bank 0.
    pub bank: [[Float80; 8]; 4],
    pub current_bank: usize,
    pub queued_operation: QueuedOp,
    pub queued_segment: Segment,
    pub queued_offset: u64,
    pub pending: PendingInstruction,
    pub protected_mode: bool,
    /// IIT device word and signature register.
    pub dw: u16,
    pub sg: u16,
}

impl Default for Fpu {
    fn default() -> Self {
        Self {
            fpu_type: FpuType::None,
            cw: 0x037F,
            sw: 0,
            tw: 0xFFFF,
            fop: 0,
            fip: 0,
            fcs: 0,
            fdp: 0,
            fds: 0,
            bank: [[Float80::zero(false); 8]; 4],
            current_bank: 0,
            queued_operation: QueuedOp::None,
            queued_segment: Segment::default(),
            queued_offset: 0,
            pending: PendingInstruction::default(),
            protected_mode: false,
            dw: 0,
            sg: 0x2310,
        }
    }
}

impl Fpu {
    pub fn top(&self) -> usize {
        usize::from((self.sw & SW_TOP_MASK) >> SW_TOP_SHIFT)
    }

    pub fn set_top(&mut self, top: usize) {
        self.sw = (self.sw & !SW_TOP_MASK) | (((top & 7) as u16) << SW_TOP_SHIFT);
    }

    /// Physical slot of ST(i).
    pub fn slot(&self, st: usize) -> usize {
        (self.top() + st) & 7
    }

    pub fn tag_get(&self, slot: usize) -> u16 {
        (self.tw >> (2 * slot)) & 3
    }

    pub fn tag_set(&mut self, slot: usize, tag: u16) {
        self.tw = (self.tw & !(3 << (2 * slot))) | ((tag & 3) << (2 * slot));
    }

    fn classify_tag(value: Float80) -> u16 {
        match value.classify() {
            Class::Zero => TAG_ZERO,
            Class::Normal => TAG_VALID,
            _ => TAG_SPECIAL,
        }
    }

    pub fn rounding(&self) -> Rounding {
        Rounding::from_cw(self.cw)
    }

    pub fn precision(&self) -> Precision {
        Precision::from_cw(self.cw)
    }

    pub fn is_external(&self) -> bool {
        matches!(
            self.fpu_type,
            FpuType::I8087 | FpuType::I287 | FpuType::I387 | FpuType::Iit
        )
    }
}

impl Cpu {
    // ========== Register Access ==========

    fn x87_get(&mut self, st: usize) -> Float80 {
        let slot = self.x87.slot(st);
        if self.x87.tag_get(slot) == TAG_EMPTY {
            // stack underflow: IE+SF with C1 clear
            self.x87.sw |= SW_IE | SW_SF;
            self.x87.sw &= !SW_C1;
            self.x87_note_exceptions();
            return Float80::indefinite();
        }
        self.x87.bank[self.x87.current_bank][slot]
    }

    fn x87_set(&mut self, st: usize, value: Float80) {
        let slot = self.x87.slot(st);
        self.x87.bank[self.x87.current_bank][slot] = value;
        self.x87.tag_set(slot, Fpu::classify_tag(value));
    }

    fn x87_free(&mut self, st: usize) {
        let slot = self.x87.slot(st);
        self.x87.tag_set(slot, TAG_EMPTY);
    }

    fn x87_push(&mut self, value: Float80) {
        let top = (self.x87.top().wrapping_sub(1)) & 7;
        if self.x87.tag_get(top) != TAG_EMPTY {
            // stack overflow: IE+SF with C1 set
            self.x87.sw |= SW_IE | SW_SF | SW_C1;
            self.x87_note_exceptions();
            self.x87.set_top(top);
            self.x87.bank[self.x87.current_bank][top] = Float80::indefinite();
            self.x87.tag_set(top, TAG_SPECIAL);
            return;
        }
        self.x87.set_top(top);
        self.x87.bank[self.x87.current_bank][top] = value;
        self.x87.tag_set(top, Fpu::classify_tag(value));
    }

    fn x87_pop(&mut self) -> Float80 {
        let value = self.x87_get(0);
        let top = self.x87.top();
        self.x87.tag_set(top, TAG_EMPTY);
        self.x87.set_top((top + 1) & 7);
        value
    }

    /// MMX registers alias the mantissa field of the FPU bank; touching
    /// them pins TOP at zero and marks every slot valid.
    pub fn mmx_get(&mut self, number: usize) -> Fallible<u64> {
        self.mmx_begin()?;
        Ok(self.x87.bank[self.x87.current_bank][number & 7].fraction)
    }

    pub fn mmx_set(&mut self, number: usize, value: u64) -> Fallible<()> {
        self.mmx_begin()?;
        let slot = number & 7;
        self.x87.bank[self.x87.current_bank][slot] =
            Float80::from_parts(value, 0xFFFF, false);
        Ok(())
    }

    fn mmx_begin(&mut self) -> Fallible<()> {
        if self.cr[0] & Cr0::EM.bits() != 0 {
            return Err(Exception::ud());
        }
        self.x87_check_pending_fault()?;
        self.x87.set_top(0);
        self.x87.tw = 0x0000;
        Ok(())
    }

    // ========== Exception Signalling ==========

    /// Record that an exception bit became unmasked-active. 8087 parts
    /// assert the interrupt line (unless IEM masks it); 287+ set ES and
    /// fault on the next waiting instruction.
    fn x87_note_exceptions(&mut self) {
        let unmasked = self.x87.sw & 0x3F & !(self.x87.cw & 0x3F);
        if unmasked == 0 {
            return;
        }
        self.x87.sw |= SW_ES;
        match self.x87.fpu_type {
            FpuType::I8087 => {
                if self.x87.cw & CW_IEM == 0 {
                    self.result = StepResult::Irq(13);
                }
            }
            FpuType::Integrated => {
                if self.cr[0] & Cr0::NE.bits() == 0 {
                    self.result = StepResult::Irq(13);
                }
            }
            _ => {}
        }
    }

    /// Raised at the start of the next FPU/WAIT instruction when ES is
    /// pending on a part that reports through #MF.
    pub fn x87_check_pending_fault(&mut self) -> Fallible<()> {
        if self.x87.sw & SW_ES == 0 {
            return Ok(());
        }
        match self.x87.fpu_type {
            FpuType::Integrated => {
                if self.cr[0] & Cr0::NE.bits() != 0 {
                    return Err(Exception::mf());
                }
            }
            FpuType::I287 | FpuType::I387 | FpuType::Iit => {
                return Err(Exception::mf());
            }
            _ => {}
        }
        Ok(())
    }

    /// #NM gate for every FPU opcode: emulate/task-switched bits first.
    pub fn x87_instruction_begin(&mut self) -> Fallible<()> {
        if self.x87.fpu_type == FpuType::None {
            return Err(Exception::nm());
        }
        if self.cr[0] & (Cr0::EM.bits() | Cr0::TS.bits()) != 0
            && self.traits.family >= crate::traits::CpuFamily::I286
        {
            return Err(Exception::nm());
        }
        Ok(())
    }

    // ========== Arithmetic Helpers ==========

    fn x87_arith(&mut self, op: u8, a: Float80, b: Float80) -> Float80 {
        let precision = self.x87.precision();
        let rounding = self.x87.rounding();
        let result = match op {
            0 => a.add(b, precision, rounding),
            1 => a.mul(b, precision, rounding),
            4 => a.sub(b, precision, rounding),
            5 => b.sub(a, precision, rounding),
            6 => a.div(b, precision, rounding),
            _ => b.div(a, precision, rounding),
        };
        if result.is_nan() && !(a.is_nan() || b.is_nan()) {
            self.x87.sw |= SW_IE;
            self.x87_note_exceptions();
        }
        if op >= 6 && b.is_zero() && !a.is_zero() && !a.is_nan() {
            self.x87.sw |= SW_ZE;
            self.x87_note_exceptions();
        }
        result
    }

    fn x87_compare(&mut self, a: Float80, b: Float80) {
        self.x87.sw &= !(SW_C0 | SW_C2 | SW_C3);
        match a.compare(b) {
            Some(core::cmp::Ordering::Greater) => {}
            Some(core::cmp::Ordering::Less) => self.x87.sw |= SW_C0,
            Some(core::cmp::Ordering::Equal) => self.x87.sw |= SW_C3,
            None => {
                self.x87.sw |= SW_C0 | SW_C2 | SW_C3 | SW_IE;
                self.x87_note_exceptions();
            }
        }
    }

    fn x87_compare_eflags(&mut self, a: Float80, b: Float80) {
        self.cf = false;
        self.zf = false;
        self.pf = false;
        match a.compare(b) {
            Some(core::cmp::Ordering::Greater) => {}
            Some(core::cmp::Ordering::Less) => self.cf = true,
            Some(core::cmp::Ordering::Equal) => self.zf = true,
            None => {
                self.cf = true;
                self.zf = true;
                self.pf = true;
                self.x87.sw |= SW_IE;
                self.x87_note_exceptions();
            }
        }
    }

    fn x87_fxam(&mut self) {
        let slot = self.x87.slot(0);
        let empty = self.x87.tag_get(slot) == TAG_EMPTY;
        let value = self.x87.bank[self.x87.current_bank][slot];
        self.x87.sw &= !(SW_C0 | SW_C1 | SW_C2 | SW_C3);
        if value.sign {
            self.x87.sw |= SW_C1;
        }
        let bits = if empty {
            SW_C0 | SW_C3
        } else {
            match value.classify() {
                Class::Nan => SW_C0,
                Class::Normal => SW_C2,
                Class::Infinity => SW_C0 | SW_C2,
                Class::Zero => SW_C3,
                Class::Denormal => SW_C2 | SW_C3,
            }
        };
        self.x87.sw |= bits;
    }

    // ========== Environment and State Images ==========
    //
    // Four legacy environment layouts (16/32-bit, real/protected), the
    // 94/108-byte FSAVE images built on them, and the 512-byte FXSAVE
    // forms.

    fn env_save_real16(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        let (cw, sw, tw) = (self.x87.cw, self.x87.sw, self.x87.tw);
        self.x87_write16(bus, segment, offset, offset, cw)?;
        self.x87_write16(bus, segment, offset, offset + 2, sw)?;
        self.x87_write16(bus, segment, offset, offset + 4, tw)?;
        let ip = (u64::from(self.x87.fcs) << 4).wrapping_add(self.x87.fip);
        self.x87_write16(bus, segment, offset, offset + 6, ip as u16)?;
        let word = (self.x87.fop & 0x07FF) | (((ip >> 16) as u16 & 0xF) << 12);
        self.x87_write16(bus, segment, offset, offset + 8, word)?;
        let dp = (u64::from(self.x87.fds) << 4).wrapping_add(self.x87.fdp);
        self.x87_write16(bus, segment, offset, offset + 10, dp as u16)?;
        self.x87_write16(bus, segment, offset, offset + 12, ((dp >> 16) as u16 & 0xF) << 12)?;
        Ok(())
    }

    fn env_restore_real16(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        self.x87.cw = self.x87_read16(bus, segment, offset, offset)?;
        self.x87.sw = self.x87_read16(bus, segment, offset, offset + 2)?;
        self.x87.tw = self.x87_read16(bus, segment, offset, offset + 4)?;
        let ip_low = self.x87_read16(bus, segment, offset, offset + 6)?;
        let word = self.x87_read16(bus, segment, offset, offset + 8)?;
        self.x87.fop = word & 0x07FF;
        self.x87.fip = u64::from(ip_low) | (u64::from(word >> 12) << 16);
        self.x87.fcs = 0;
        let dp_low = self.x87_read16(bus, segment, offset, offset + 10)?;
        let word = self.x87_read16(bus, segment, offset, offset + 12)?;
        self.x87.fdp = u64::from(dp_low) | (u64::from(word >> 12) << 16);
        self.x87.fds = 0;
        Ok(())
    }

    fn env_save_prot16(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        let (cw, sw, tw) = (self.x87.cw, self.x87.sw, self.x87.tw);
        self.x87_write16(bus, segment, offset, offset, cw)?;
        self.x87_write16(bus, segment, offset, offset + 2, sw)?;
        self.x87_write16(bus, segment, offset, offset + 4, tw)?;
        let (fip, fcs, fdp, fds) =
            (self.x87.fip as u16, self.x87.fcs, self.x87.fdp as u16, self.x87.fds);
        self.x87_write16(bus, segment, offset, offset + 6, fip)?;
        self.x87_write16(bus, segment, offset, offset + 8, fcs)?;
        self.x87_write16(bus, segment, offset, offset + 10, fdp)?;
        self.x87_write16(bus, segment, offset, offset + 12, fds)?;
        Ok(())
    }

    fn env_restore_prot16(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        self.x87.cw = self.x87_read16(bus, segment, offset, offset)?;
        self.x87.sw = self.x87_read16(bus, segment, offset, offset + 2)?;
        self.x87.tw = self.x87_read16(bus, segment, offset, offset + 4)?;
        self.x87.fip = u64::from(self.x87_read16(bus, segment, offset, offset + 6)?);
        self.x87.fcs = self.x87_read16(bus, segment, offset, offset + 8)?;
        self.x87.fdp = u64::from(self.x87_read16(bus, segment, offset, offset + 10)?);
        self.x87.fds = self.x87_read16(bus, segment, offset, offset + 12)?;
        Ok(())
    }

    fn env_save_real32(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        let (cw, sw, tw) = (self.x87.cw, self.x87.sw, self.x87.tw);
        self.x87_write32(bus, segment, offset, offset, u32::from(cw))?;
        self.x87_write32(bus, segment, offset, offset + 4, u32::from(sw))?;
        self.x87_write32(bus, segment, offset, offset + 8, u32::from(tw))?;
        // linear pointers: low 16 bits, then the upper bits alongside fop
        let ip = (u64::from(self.x87.fcs) << 4).wrapping_add(self.x87.fip);
        self.x87_write32(bus, segment, offset, offset + 12, ip as u32 & 0xFFFF)?;
        let word = u32::from(self.x87.fop & 0x07FF) | (((ip >> 16) as u32 & 0xFFFF) << 12);
        self.x87_write32(bus, segment, offset, offset + 16, word)?;
        let dp = (u64::from(self.x87.fds) << 4).wrapping_add(self.x87.fdp);
        self.x87_write32(bus, segment, offset, offset + 20, dp as u32 & 0xFFFF)?;
        self.x87_write32(bus, segment, offset, offset + 24, ((dp >> 16) as u32 & 0xFFFF) << 12)?;
        Ok(())
    }

    fn env_restore_real32(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        self.x87.cw = self.x87_read32(bus, segment, offset, offset)? as u16;
        self.x87.sw = self.x87_read32(bus, segment, offset, offset + 4)? as u16;
        self.x87.tw = self.x87_read32(bus, segment, offset, offset + 8)? as u16;
        let ip_low = self.x87_read32(bus, segment, offset, offset + 12)? & 0xFFFF;
        let word = self.x87_read32(bus, segment, offset, offset + 16)?;
        self.x87.fop = word as u16 & 0x07FF;
        self.x87.fip = u64::from(ip_low) | (u64::from(word >> 12) << 16);
        self.x87.fcs = 0;
        let dp_low = self.x87_read32(bus, segment, offset, offset + 20)? & 0xFFFF;
        let word = self.x87_read32(bus, segment, offset, offset + 24)?;
        self.x87.fdp = u64::from(dp_low) | (u64::from(word >> 12) << 16);
        self.x87.fds = 0;
        Ok(())
    }

    fn env_save_prot32(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        let (cw, sw, tw) = (self.x87.cw, self.x87.sw, self.x87.tw);
        self.x87_write32(bus, segment, offset, offset, u32::from(cw))?;
        self.x87_write32(bus, segment, offset, offset + 4, u32::from(sw))?;
        self.x87_write32(bus, segment, offset, offset + 8, u32::from(tw))?;
        let (fip, fcs, fop, fdp, fds) = (
            self.x87.fip as u32,
            self.x87.fcs,
            self.x87.fop,
            self.x87.fdp as u32,
            self.x87.fds,
        );
        self.x87_write32(bus, segment, offset, offset + 12, fip)?;
        self.x87_write32(
            bus,
            segment,
            offset,
            offset + 16,
            u32::from(fcs) | (u32::from(fop & 0x07FF) << 16),
        )?;
        self.x87_write32(bus, segment, offset, offset + 20, fdp)?;
        self.x87_write32(bus, segment, offset, offset + 24, u32::from(fds))?;
        Ok(())
    }

    fn env_restore_prot32(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64) -> Fallible<()> {
        self.x87.cw = self.x87_read32(bus, segment, offset, offset)? as u16;
        self.x87.sw = self.x87_read32(bus, segment, offset, offset + 4)? as u16;
        self.x87.tw = self.x87_read32(bus, segment, offset, offset + 8)? as u16;
        self.x87.fip = u64::from(self.x87_read32(bus, segment, offset, offset + 12)?);
        let word = self.x87_read32(bus, segment, offset, offset + 16)?;
        self.x87.fcs = word as u16;
        self.x87.fop = (word >> 16) as u16 & 0x07FF;
        self.x87.fdp = u64::from(self.x87_read32(bus, segment, offset, offset + 20)?);
        self.x87.fds = self.x87_read32(bus, segment, offset, offset + 24)? as u16;
        Ok(())
    }

    pub(crate) fn x87_env_save(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, size: OpSize) -> Fallible<u64> {
        // returns the environment length so FSAVE can append registers
        if size == OpSize::Word {
            if self.x87.protected_mode {
                self.env_save_prot16(bus, segment, offset)?;
            } else {
                self.env_save_real16(bus, segment, offset)?;
            }
            Ok(14)
        } else {
            if self.x87.protected_mode {
                self.env_save_prot32(bus, segment, offset)?;
            } else {
                self.env_save_real32(bus, segment, offset)?;
            }
            Ok(28)
        }
    }

    fn x87_env_restore(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, size: OpSize) -> Fallible<u64> {
        if size == OpSize::Word {
            if self.x87.protected_mode {
                self.env_restore_prot16(bus, segment, offset)?;
            } else {
                self.env_restore_real16(bus, segment, offset)?;
            }
            Ok(14)
        } else {
            if self.x87.protected_mode {
                self.env_restore_prot32(bus, segment, offset)?;
            } else {
                self.env_restore_real32(bus, segment, offset)?;
            }
            Ok(28)
        }
    }

    pub fn x87_state_save(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, size: OpSize) -> Fallible<()> {
        let env = self.x87_env_save(bus, segment, offset, size)?;
        for i in 0..8 {
            let slot = self.x87.slot(i);
            let value = self.x87.bank[self.x87.current_bank][slot];
            self.x87_write80(bus, segment, offset, offset + env + 10 * i as u64, value)?;
        }
        // FSAVE reinitializes
        self.x87_init();
        Ok(())
    }

    pub fn x87_state_restore(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, size: OpSize) -> Fallible<()> {
        let env = self.x87_env_restore(bus, segment, offset, size)?;
        for i in 0..8 {
            let value = self.x87_read80fp(bus, segment, offset, offset + env + 10 * i as u64)?;
            let slot = self.x87.slot(i);
            self.x87.bank[self.x87.current_bank][slot] = value;
        }
        Ok(())
    }

    fn x87_write80(&mut self, bus: &mut dyn Bus, segment: usize, x86_offset: u64, offset: u64, value: Float80) -> Fallible<()> {
        self.x87_write80fp(bus, segment, x86_offset, offset, value)
    }

    /// Abridged (FXSAVE) tag byte: one valid bit per slot.
    fn abridged_tw(&self) -> u8 {
        let mut abridged = 0u8;
        for slot in 0..8 {
            if self.x87.tag_get(slot) != TAG_EMPTY {
                abridged |= 1 << slot;
            }
        }
        abridged
    }

    fn expand_tw(&mut self, abridged: u8) {
        for slot in 0..8 {
            let tag = if abridged & (1 << slot) == 0 {
                TAG_EMPTY
            } else {
                Fpu::classify_tag(self.x87.bank[self.x87.current_bank][slot])
            };
            self.x87.tag_set(slot, tag);
        }
    }

    /// FXSAVE image: legacy header, 16-byte ST slots, XMM block.
    pub fn fxsave(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, wide: bool) -> Fallible<()> {
        let xmm_count = if self.is_64bit_mode() { 16 } else { 8 };
        let (cw, sw) = (self.x87.cw, self.x87.sw);
        self.segmented_write16(bus, segment, offset, cw)?;
        self.segmented_write16(bus, segment, offset + 2, sw)?;
        let tag = self.abridged_tw();
        self.segmented_write8(bus, segment, offset + 4, tag)?;
        self.segmented_write8(bus, segment, offset + 5, 0)?;
        let fop = self.x87.fop;
        self.segmented_write16(bus, segment, offset + 6, fop)?;
        if wide {
            let (fip, fdp) = (self.x87.fip, self.x87.fdp);
            self.segmented_write64(bus, segment, offset + 8, fip)?;
            self.segmented_write64(bus, segment, offset + 16, fdp)?;
        } else {
            let (fip, fcs, fdp, fds) =
                (self.x87.fip as u32, self.x87.fcs, self.x87.fdp as u32, self.x87.fds);
            self.segmented_write32(bus, segment, offset + 8, fip)?;
            self.segmented_write16(bus, segment, offset + 12, fcs)?;
            self.segmented_write16(bus, segment, offset + 14, 0)?;
            self.segmented_write32(bus, segment, offset + 16, fdp)?;
            self.segmented_write16(bus, segment, offset + 20, fds)?;
            self.segmented_write16(bus, segment, offset + 22, 0)?;
        }
        let mxcsr = self.mxcsr;
        self.segmented_write32(bus, segment, offset + 24, mxcsr)?;
        self.segmented_write32(bus, segment, offset + 28, 0xFFFF)?;
        for i in 0..8 {
            let slot = self.x87.slot(i);
            let value = self.x87.bank[self.x87.current_bank][slot];
            self.segmented_write80fp(bus, segment, offset + 32 + 16 * i as u64, value)?;
            self.segmented_write16(bus, segment, offset + 32 + 16 * i as u64 + 10, 0)?;
            self.segmented_write32(bus, segment, offset + 32 + 16 * i as u64 + 12, 0)?;
        }
        for i in 0..xmm_count {
            let (low, high) = (self.xmm[i].q[0], self.xmm[i].q[1]);
            self.segmented_write128(bus, segment, offset + 0xA0 + 16 * i as u64, low, high)?;
        }
        Ok(())
    }

    pub fn fxrstor(&mut self, bus: &mut dyn Bus, segment: usize, offset: u64, wide: bool) -> Fallible<()> {
        let xmm_count = if self.is_64bit_mode() { 16 } else { 8 };
        self.x87.cw = self.segmented_read16(bus, segment, offset)?;
        self.x87.sw = self.segmented_read16(bus, segment, offset + 2)?;
        let abridged = self.segmented_read8(bus, segment, offset + 4)?;
        self.x87.fop = self.segmented_read16(bus, segment, offset + 6)?;
        if wide {
            self.x87.fip = self.segmented_read64(bus, segment, offset + 8)?;
            self.x87.fdp = self.segmented_read64(bus, segment, offset + 16)?;
            self.x87.fcs = 0;
            self.x87.fds = 0;
        } else {
            self.x87.fip = u64::from(self.segmented_read32(bus, segment, offset + 8)?);
            self.x87.fcs = self.segmented_read16(bus, segment, offset + 12)?;
            self.x87.fdp = u64::from(self.segmented_read32(bus, segment, offset + 16)?);
            self.x87.fds = self.segmented_read16(bus, segment, offset + 20)?;
        }
        self.mxcsr = self.segmented_read32(bus, segment, offset + 24)?;
        for i in 0..8 {
            let value = self.segmented_read80fp(bus, segment, offset + 32 + 16 * i as u64)?;
            let slot = self.x87.slot(i);
            self.x87.bank[self.x87.current_bank][slot] = value;
        }
        self.expand_tw(abridged);
        for i in 0..xmm_count {
            let (low, high) = self.segmented_read128(bus, segment, offset + 0xA0 + 16 * i as u64)?;
            self.xmm[i].q[0] = low;
            self.xmm[i].q[1] = high;
        }
        Ok(())
    }

    // ========== Initialization ==========

    pub fn x87_init(&mut self) {
        self.x87.cw = 0x037F;
        self.x87.sw = 0;
        self.x87.tw = 0xFFFF;
        self.x87.fip = 0;
        self.x87.fcs = 0;
        self.x87.fdp = 0;
        self.x87.fds = 0;
        self.x87.fop = 0;
    }

    // ========== Execution ==========

    /// Execute one FPU instruction (opcode D8..DF). `segment`/`offset`
    /// locate the memory operand for mod != 3 forms. Updates the
    /// exception pointers.
    pub fn x87_execute(
        &mut self,
        bus: &mut dyn Bus,
        opcode: u8,
        modrm: u8,
        segment: usize,
        offset: u64,
    ) -> Fallible<()> {
        self.x87_check_pending_fault()?;

        // bookkeeping pointers: previous instruction and operand address
        self.x87.fop = (u16::from(opcode & 7) << 8) | u16::from(modrm);
        self.x87.fip = self.old_xip;
        self.x87.fcs = self.sr[seg::CS].selector;
        if modrm < 0xC0 {
            self.x87.fdp = offset;
            self.x87.fds = self.sr[segment.min(seg::COUNT - 1)].selector;
        }

        let reg = usize::from((modrm >> 3) & 7);
        let rm = usize::from(modrm & 7);
        let is_reg = modrm >= 0xC0;
        let precision = self.x87.precision();
        let rounding = self.x87.rounding();

        match opcode & 7 {
            0 => {
                // D8: single precision or ST(i) operand arithmetic
                let operand = if is_reg {
                    self.x87_get(rm)
                } else {
                    Float80::from_f32(f32::from_bits(self.x87_read32(bus, segment, offset, offset)?))
                };
                let st0 = self.x87_get(0);
                match reg {
                    2 => self.x87_compare(st0, operand),
                    3 => {
                        self.x87_compare(st0, operand);
                        self.x87_pop();
                    }
                    op => {
                        let result = self.x87_arith(op as u8, st0, operand);
                        self.x87_set(0, result);
                    }
                }
            }
            1 => {
                if !is_reg {
                    match reg {
                        0 => {
                            let bits = self.x87_read32(bus, segment, offset, offset)?;
                            self.x87_push(Float80::from_f32(f32::from_bits(bits)));
                        }
                        2 | 3 => {
                            let value = self.x87_get(0);
                            let single = value.to_f32(rounding);
                            self.x87_write32(bus, segment, offset, offset, single.to_bits())?;
                            if reg == 3 {
                                self.x87_pop();
                            }
                        }
                        4 => {
                            let size = self.parser.operation_size;
                            self.x87_env_restore(bus, segment, offset, size)?;
                        }
                        5 => {
                            self.x87.cw = self.x87_read16(bus, segment, offset, offset)?;
                        }
                        6 => {
                            let size = self.parser.operation_size;
                            if self.x87.is_external() {
                                self.x87.queued_operation = QueuedOp::Fstenv;
                                self.x87.queued_segment = self.sr[segment.min(seg::COUNT - 1)];
                                self.x87.queued_offset = offset;
                            } else {
                                self.x87_env_save(bus, segment, offset, size)?;
                            }
                            // the environment store masks everything
                            self.x87.cw |= 0x3F;
                        }
                        7 => {
                            let cw = self.x87.cw;
                            self.x87_write16(bus, segment, offset, offset, cw)?;
                        }
                        _ => return Err(Exception::ud()),
                    }
                } else {
                    match modrm {
                        0xC0..=0xC7 => {
                            let value = self.x87_get(rm);
                            self.x87_push(value);
                        }
                        0xC8..=0xCF => {
                            let a = self.x87_get(0);
                            let b = self.x87_get(rm);
                            self.x87_set(0, b);
                            self.x87_set(rm, a);
                        }
                        0xD0 => {} // FNOP
                        0xE0 => {
                            let value = self.x87_get(0).neg();
                            self.x87_set(0, value);
                        }
                        0xE1 => {
                            let value = self.x87_get(0).abs();
                            self.x87_set(0, value);
                        }
                        0xE4 => {
                            let value = self.x87_get(0);
                            self.x87_compare(value, Float80::zero(false));
                        }
                        0xE5 => self.x87_fxam(),
                        0xE8 => self.x87_push(Float80::one()),
                        0xE9 => self.x87_push(Float80::L2T),
                        0xEA => self.x87_push(Float80::L2E),
                        0xEB => self.x87_push(Float80::PI),
                        0xEC => self.x87_push(Float80::LG2),
                        0xED => self.x87_push(Float80::LN2),
                        0xEE => self.x87_push(Float80::zero(false)),
                        0xF0 => {
                            let value = self.x87_get(0).f2xm1();
                            self.x87_set(0, value);
                        }
                        0xF1 => {
                            let x = self.x87_get(0);
                            let y = self.x87_get(1);
                            let result = x.yl2x(y);
                            self.x87_pop();
                            self.x87_set(0, result);
                        }
                        0xF2 => {
                            let value = self.x87_get(0);
                            self.x87_set(0, value.tan());
                            self.x87_push(Float80::one());
                            self.x87.sw &= !SW_C2;
                        }
                        0xF3 => {
                            let y = self.x87_get(1);
                            let x = self.x87_get(0);
                            let result = y.atan2(x);
                            self.x87_pop();
                            self.x87_set(0, result);
                        }
                        0xF4 => {
                            let (exponent, significand) = self.x87_get(0).extract();
                            self.x87_set(0, exponent);
                            self.x87_push(significand);
                        }
                        0xF5 | 0xF8 => {
                            // FPREM1 / FPREM
                            let a = self.x87_get(0);
                            let b = self.x87_get(1);
                            let (result, q, done) = a.rem(b);
                            self.x87_set(0, result);
                            self.x87.sw &= !(SW_C0 | SW_C1 | SW_C2 | SW_C3);
                            if done {
                                if q & 1 != 0 {
                                    self.x87.sw |= SW_C1;
                                }
                                if q & 2 != 0 {
                                    self.x87.sw |= SW_C3;
                                }
                                if q & 4 != 0 {
                                    self.x87.sw |= SW_C0;
                                }
                            } else {
                                self.x87.sw |= SW_C2;
                            }
                        }
                        0xF6 => {
                            let top = self.x87.top();
                            self.x87.set_top(top.wrapping_sub(1) & 7);
                        }
                        0xF7 => {
                            let top = self.x87.top();
                            self.x87.set_top((top + 1) & 7);
                        }
                        0xF9 => {
                            let x = self.x87_get(0);
                            let y = self.x87_get(1);
                            let result = x.yl2xp1(y);
                            self.x87_pop();
                            self.x87_set(0, result);
                        }
                        0xFA => {
                            let value = self.x87_get(0).sqrt(precision, rounding);
                            self.x87_set(0, value);
                        }
                        0xFB => {
                            let value = self.x87_get(0);
                            self.x87_set(0, value.sin());
                            self.x87_push(value.cos());
                            self.x87.sw &= !SW_C2;
                        }
                        0xFC => {
                            let value = self.x87_get(0).round_to_integer(rounding);
                            self.x87_set(0, value);
                        }
                        0xFD => {
                            let scale = self.x87_get(1);
                            let value = self.x87_get(0).scale(scale);
                            self.x87_set(0, value);
                        }
                        0xFE => {
                            let value = self.x87_get(0).sin();
                            self.x87_set(0, value);
                            self.x87.sw &= !SW_C2;
                        }
                        0xFF => {
                            let value = self.x87_get(0).cos();
                            self.x87_set(0, value);
                            self.x87.sw &= !SW_C2;
                        }
                        _ => return Err(Exception::ud()),
                    }
                }
            }
            2 => {
                if !is_reg {
                    // 32-bit integer operand arithmetic
                    let value = self.x87_read32(bus, segment, offset, offset)? as i32;
                    let operand = Float80::from_i64(i64::from(value));
                    let st0 = self.x87_get(0);
                    match reg {
                        2 => self.x87_compare(st0, operand),
                        3 => {
                            self.x87_compare(st0, operand);
                            self.x87_pop();
                        }
                        op => {
                            let result = self.x87_arith(op as u8, st0, operand);
                            self.x87_set(0, result);
                        }
                    }
                } else if modrm == 0xE9 {
                    // FUCOMPP
                    let a = self.x87_get(0);
                    let b = self.x87_get(1);
                    self.x87_compare(a, b);
                    self.x87_pop();
                    self.x87_pop();
                } else if (0xC0..=0xDF).contains(&modrm) {
                    // FCMOVcc (P6+)
                    let take = match reg {
                        0 => self.cf,
                        1 => self.zf,
                        2 => self.cf || self.zf,
                        _ => self.pf,
                    };
                    if take {
                        let value = self.x87_get(rm);
                        self.x87_set(0, value);
                    }
                } else {
                    return Err(Exception::ud());
                }
            }
            3 => {
                if !is_reg {
                    match reg {
                        0 => {
                            let value = self.x87_read32(bus, segment, offset, offset)? as i32;
                            self.x87_push(Float80::from_i64(i64::from(value)));
                        }
                        1 | 2 | 3 => {
                            let value = self.x87_get(0);
                            let int = value
                                .to_i64(if reg == 1 { Rounding::Zero } else { rounding })
                                .filter(|v| i32::try_from(*v).is_ok())
                                .unwrap_or_else(|| {
                                    self.x87.sw |= SW_IE;
                                    i64::from(i32::MIN)
                                });
                            self.x87_write32(bus, segment, offset, offset, int as i32 as u32)?;
                            // FISTTP and FISTP pop; FIST leaves the stack
                            if reg != 2 {
                                self.x87_pop();
                            }
                        }
                        5 => {
                            let value = self.x87_read80fp(bus, segment, offset, offset)?;
                            self.x87_push(value);
                        }
                        7 => {
                            let value = self.x87_pop();
                            self.x87_write80(bus, segment, offset, offset, value)?;
                        }
                        _ => return Err(Exception::ud()),
                    }
                } else {
                    match modrm {
                        0xE0 | 0xE1 => {} // FNENI/FNDISI (8087), no-ops later
                        0xE2 => self.x87.sw &= !(0x00FF | SW_B),
                        0xE3 => {
                            self.x87_init();
                            self.x87.tw = 0xFFFF;
                        }
                        0xE4 => self.x87.protected_mode = true, // FNSETPM
                        0xE8..=0xEF => {
                            if self.x87.fpu_type == FpuType::Iit && modrm <= 0xEB {
                                // IIT bank select
                                self.x87.current_bank = rm & 3;
                            } else {
                                // FUCOMI
                                let a = self.x87_get(0);
                                let b = self.x87_get(rm);
                                self.x87_compare_eflags(a, b);
                            }
                        }
                        0xF0..=0xF7 => {
                            let a = self.x87_get(0);
                            let b = self.x87_get(rm);
                            self.x87_compare_eflags(a, b);
                        }
                        0xC0..=0xDF => {
                            // FCMOVcc negated forms
                            let take = match reg {
                                0 => !self.cf,
                                1 => !self.zf,
                                2 => !(self.cf || self.zf),
                                _ => !self.pf,
                            };
                            if take {
                                let value = self.x87_get(rm);
                                self.x87_set(0, value);
                            }
                        }
                        _ => return Err(Exception::ud()),
                    }
                }
            }
            4 => {
                // DC: double precision or ST(i) destination arithmetic
                let (st0, operand, destination) = if is_reg {
                    (self.x87_get(rm), self.x87_get(0), rm)
                } else {
                    let bits = self.x87_read64(bus, segment, offset, offset)?;
                    (self.x87_get(0), Float80::from_f64(f64::from_bits(bits)), 0)
                };
                match reg {
                    2 => self.x87_compare(st0, operand),
                    3 => {
                        self.x87_compare(st0, operand);
                        self.x87_pop();
                    }
                    op => {
                        let result = self.x87_arith(op as u8, st0, operand);
                        self.x87_set(destination, result);
                    }
                }
            }
            5 => {
                if !is_reg {
                    match reg {
                        0 => {
                            let bits = self.x87_read64(bus, segment, offset, offset)?;
                            self.x87_push(Float80::from_f64(f64::from_bits(bits)));
                        }
                        2 | 3 => {
                            let value = self.x87_get(0);
                            let double = value.round_precision(Precision::Double, rounding).to_f64();
                            self.x87_write64(bus, segment, offset, offset, double.to_bits())?;
                            if reg == 3 {
                                self.x87_pop();
                            }
                        }
                        4 => {
                            let size = self.parser.operation_size;
                            self.x87_state_restore(bus, segment, offset, size)?;
                        }
                        6 => {
                            let size = self.parser.operation_size;
                            if self.x87.is_external() {
                                self.x87.queued_operation = QueuedOp::Fsave;
                                self.x87.queued_segment = self.sr[segment.min(seg::COUNT - 1)];
                                self.x87.queued_offset = offset;
                            } else {
                                self.x87_state_save(bus, segment, offset, size)?;
                            }
                        }
                        7 => {
                            let sw = self.x87.sw;
                            self.x87_write16(bus, segment, offset, offset, sw)?;
                        }
                        _ => return Err(Exception::ud()),
                    }
                } else {
                    match modrm {
                        0xC0..=0xC7 => self.x87_free(rm),
                        0xD0..=0xD7 => {
                            let value = self.x87_get(0);
                            self.x87_set(rm, value);
                        }
                        0xD8..=0xDF => {
                            let value = self.x87_get(0);
                            self.x87_set(rm, value);
                            self.x87_pop();
                        }
                        0xE0..=0xE7 => {
                            let a = self.x87_get(0);
                            let b = self.x87_get(rm);
                            self.x87_compare(a, b);
                        }
                        0xE8..=0xEF => {
                            let a = self.x87_get(0);
                            let b = self.x87_get(rm);
                            self.x87_compare(a, b);
                            self.x87_pop();
                        }
                        _ => return Err(Exception::ud()),
                    }
                }
            }
            6 => {
                if !is_reg {
                    let value = self.x87_read16(bus, segment, offset, offset)? as i16;
                    let operand = Float80::from_i64(i64::from(value));
                    let st0 = self.x87_get(0);
                    match reg {
                        2 => self.x87_compare(st0, operand),
                        3 => {
                            self.x87_compare(st0, operand);
                            self.x87_pop();
                        }
                        op => {
                            let result = self.x87_arith(op as u8, st0, operand);
                            self.x87_set(0, result);
                        }
                    }
                } else if modrm == 0xD9 {
                    // FCOMPP
                    let a = self.x87_get(0);
                    let b = self.x87_get(1);
                    self.x87_compare(a, b);
                    self.x87_pop();
                    self.x87_pop();
                } else {
                    // FADDP family: ST(i) := ST(i) op ST(0), pop
                    let a = self.x87_get(rm);
                    let b = self.x87_get(0);
                    let result = self.x87_arith(reg as u8, a, b);
                    self.x87_set(rm, result);
                    self.x87_pop();
                }
            }
            _ => {
                if !is_reg {
                    match reg {
                        0 => {
                            let value = self.x87_read16(bus, segment, offset, offset)? as i16;
                            self.x87_push(Float80::from_i64(i64::from(value)));
                        }
                        1 | 2 | 3 => {
                            let value = self.x87_get(0);
                            let int = value
                                .to_i64(if reg == 1 { Rounding::Zero } else { rounding })
                                .filter(|v| i16::try_from(*v).is_ok())
                                .unwrap_or_else(|| {
                                    self.x87.sw |= SW_IE;
                                    i64::from(i16::MIN)
                                });
                            self.x87_write16(bus, segment, offset, offset, int as i16 as u16)?;
                            if reg != 2 {
                                self.x87_pop();
                            }
                        }
                        4 => {
                            let mut bytes = [0u8; 10];
                            self.x87_segmented_read(bus, segment, offset, offset, &mut bytes)?;
                            self.x87_push(Float80::from_packed80(&bytes));
                        }
                        5 => {
                            let value = self.x87_read64(bus, segment, offset, offset)? as i64;
                            self.x87_push(Float80::from_i64(value));
                        }
                        6 => {
                            let value = self.x87_pop();
                            let bytes = value.to_packed80();
                            self.x87_segmented_write(bus, segment, offset, offset, &bytes)?;
                        }
                        _ => {
                            let value = self.x87_pop();
                            let int = value.to_i64(rounding).unwrap_or_else(|| {
                                self.x87.sw |= SW_IE;
                                i64::MIN
                            });
                            self.x87_write64(bus, segment, offset, offset, int as u64)?;
                        }
                    }
                } else {
                    match modrm {
                        0xC0..=0xC7 => {
                            // FFREEP
                            self.x87_free(rm);
                            self.x87_pop();
                        }
                        0xE0 => {
                            // FNSTSW AX
                            let sw = self.x87.sw;
                            self.register_set16(gpr::AX, sw);
                        }
                        0xE8..=0xEF => {
                            let a = self.x87_get(0);
                            let b = self.x87_get(rm);
                            self.x87_compare_eflags(a, b);
                            self.x87_pop();
                        }
                        0xF0..=0xF7 => {
                            let a = self.x87_get(0);
                            let b = self.x87_get(rm);
                            self.x87_compare_eflags(a, b);
                            self.x87_pop();
                        }
                        _ => return Err(Exception::ud()),
                    }
                }
            }
        }
        Ok(())
    }
}
