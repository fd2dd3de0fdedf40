//! Exception and interrupt delivery
//!
//! The single catch point for everything that unwinds out of a step:
//! classification against the double-fault matrix, escalation to #DF and
//! triple fault, and the actual dispatch: real-mode IVT pseudo-call,
//! protected-mode gate traversal, VME redirection into virtual 8086 mode,
//! or the NEC bank-switching entry.

use crate::bus::Bus;
use crate::cpu::{Cpu, OpSize};
use crate::exception::{
    vector, Exception, ExceptionClass, ExceptionKind, ExceptionSource, Fallible, StepResult,
};
use crate::regs::{bank, desc, seg, Cr4, Dr6, Dr7};
use crate::smm::SmiAttributes;
use crate::traits::{
    CpuFamily, SmmFormat, CPUID7_0_ECX_CET_SS, CPUID_EXT31_EAX_SEV_ES,
};

/// Interrupt line kinds a host can assert between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLine {
    /// Maskable interrupt with its vector.
    Intr(u8),
    /// Non-maskable interrupt.
    Nmi,
    /// 8085 restart lines (separate x80 only).
    Rst55,
    Rst65,
    Rst75,
    /// System management interrupt.
    Smi,
    /// In-circuit emulator break.
    Ice,
}

impl Cpu {
    // ========== Classification ==========

    /// Escalation class of an exception on this family.
    fn classify(&self, exception: &Exception) -> ExceptionClass {
        if exception.is_software() {
            return ExceptionClass::Benign;
        }
        match exception.vector {
            vector::DE | vector::TS | vector::NP | vector::SS | vector::GP => {
                ExceptionClass::Contributory
            }
            vector::MP
                if self.traits.family >= CpuFamily::I286
                    && self.traits.family <= CpuFamily::I386 =>
            {
                ExceptionClass::Contributory
            }
            vector::CP if self.traits.cpuid7_0.ecx & CPUID7_0_ECX_CET_SS != 0 => {
                ExceptionClass::Contributory
            }
            vector::PF if self.traits.family >= CpuFamily::I386 => ExceptionClass::PageFault,
            vector::VC if self.traits.cpuid_ext31.eax & CPUID_EXT31_EAX_SEV_ES != 0 => {
                ExceptionClass::PageFault
            }
            vector::DF => ExceptionClass::DoubleFault,
            _ => ExceptionClass::Benign,
        }
    }

    /// Deliver an exception that unwound out of execution, escalating per
    /// the class matrix until delivery succeeds or the machine shuts down.
    pub(crate) fn deliver(&mut self, bus: &mut dyn Bus, first: Exception) -> StepResult {
        let mut exception = first;
        loop {
            let class = self.classify(&exception);
            if class != ExceptionClass::Benign {
                match self.exception_class {
                    ExceptionClass::Benign => self.exception_class = class,
                    ExceptionClass::Contributory | ExceptionClass::PageFault => {
                        if class <= self.exception_class {
                            log::debug!(
                                "escalating vector {} to double fault",
                                exception.vector
                            );
                            exception = Exception::double_fault();
                            self.exception_class = ExceptionClass::DoubleFault;
                        } else {
                            self.exception_class = class;
                        }
                    }
                    ExceptionClass::DoubleFault => {
                        log::warn!("triple fault, shutting down");
                        return StepResult::TripleFault;
                    }
                }
            }

            // A #DB with the DR7 ICE bit armed dumps the machine state to
            // the in-circuit-emulator area instead of vectoring.
            if exception.vector == vector::DB
                && (CpuFamily::I386..=CpuFamily::I486).contains(&self.traits.family)
                && self.dr[7] & Dr7::ICE.bits() != 0
            {
                if self.ice_storeall_386(bus, 0x60000).is_ok() {
                    self.dr[6] |= Dr6::SMM.bits();
                    return StepResult::IceInterrupt;
                }
                return StepResult::TripleFault;
            }

            match self.enter_interrupt(bus, exception) {
                Ok(()) => return StepResult::CpuInterrupt(exception.vector),
                Err(next) => exception = next,
            }
        }
    }

    // ========== Entry ==========

    /// Build the interrupt entry frame and vector to the handler. Faults
    /// during delivery propagate back to the caller (which escalates).
    pub fn enter_interrupt(&mut self, bus: &mut dyn Bus, exception: Exception) -> Fallible<()> {
        self.halted = false;
        self.store_x80_registers();
        if exception.kind == ExceptionKind::Fault {
            let old = self.old_xip;
            self.set_xip(old);
        }

        let result = if self.is_real_mode() {
            self.enter_interrupt_real(bus, exception)
        } else {
            self.enter_interrupt_protected(bus, exception)
        };
        if result.is_ok() {
            self.load_x80_if_emulation();
        }
        result
    }

    fn enter_interrupt_real(&mut self, bus: &mut dyn Bus, exception: Exception) -> Fallible<()> {
        let vec = u64::from(exception.vector);
        // IDTR covers the IVT in real mode
        if crate::protect::overflow(vec * 4, 4, u64::from(self.sr[seg::IDTR].limit)) {
            return Err(Exception::gp(0));
        }
        self.stack_segment_check_limit(6, 0)?;
        let flags16 = self.flags_get16();
        self.push16(bus, flags16)?;
        self.intf = false;
        self.tf = false;
        self.md = self.native_mode_flag();
        self.ac = false;
        let cs = self.sr[seg::CS].selector;
        let xip = self.xip as u16;
        self.push16(bus, cs)?;
        self.push16(bus, xip)?;
        let new_cs = self.segmented_read16(bus, seg::IDTR, vec * 4 + 2)?;
        let new_ip = self.segmented_read16(bus, seg::IDTR, vec * 4)?;
        self.segment_load_real_mode(seg::CS, new_cs);
        self.set_xip(u64::from(new_ip));
        log::trace!("real mode interrupt {} to {:04x}:{:04x}", vec, new_cs, new_ip);
        Ok(())
    }

    fn enter_interrupt_protected(&mut self, bus: &mut dyn Bus, exception: Exception) -> Fallible<()> {
        let ext = u64::from(!exception.is_software());

        if self.is_v86_mode() && exception.source == ExceptionSource::IntN {
            if self.cr[4] & Cr4::VME.bits() == 0 && self.iopl != 3 {
                return Err(Exception::gp(0));
            }
            if self.cr[4] & Cr4::VME.bits() != 0 {
                // consult the interrupt redirection bitmap below the I/O
                // permission map in the current TSS
                let iopb = self.segmented_read16(bus, seg::TR, 0x66)?;
                let intno = exception.vector;
                let bitmap = self.segmented_read8(
                    bus,
                    seg::TR,
                    u64::from(iopb) - 32 + u64::from(intno >> 3),
                )?;
                if bitmap >> (intno & 7) & 1 == 0 {
                    // redirected: simulate a real-mode frame inside V86
                    let image = self.flags_get_image16();
                    self.push16(bus, image)?;
                    let cs = self.sr[seg::CS].selector;
                    let xip = self.xip as u16;
                    self.push16(bus, cs)?;
                    self.push16(bus, xip)?;
                    if self.iopl == 3 {
                        self.intf = false;
                    } else {
                        self.vif = false;
                    }
                    self.tf = false;
                    let vec = u64::from(intno);
                    let new_cs = self.segmented_read16(bus, seg::IDTR, vec * 4 + 2)?;
                    let new_ip = self.segmented_read16(bus, seg::IDTR, vec * 4)?;
                    self.segment_load_real_mode(seg::CS, new_cs);
                    self.set_xip(u64::from(new_ip));
                    return Ok(());
                }
                if self.iopl != 3 {
                    return Err(Exception::gp(0));
                }
            }
        }

        let entry_size: u64 = if self.is_long_mode() { 16 } else { 8 };
        let vec = exception.vector;
        let error_code = (u64::from(vec) << 3) | 2 | ext;
        if crate::protect::overflow(
            u64::from(vec) * entry_size,
            entry_size,
            u64::from(self.sr[seg::IDTR].limit),
        ) {
            return Err(Exception::gp(error_code));
        }
        let mut gate = crate::desc::Descriptor::new(entry_size as usize);
        let mut bytes = [0u8; 16];
        self.segmented_read(
            bus,
            seg::IDTR,
            u64::from(vec) * entry_size,
            &mut bytes[..entry_size as usize],
        )?;
        gate.bytes[..entry_size as usize].copy_from_slice(&bytes[..entry_size as usize]);

        let kind = gate.kind();
        match kind {
            desc::TYPE_TASK_GATE => {
                if self.is_long_mode() {
                    return Err(Exception::gp(error_code));
                }
            }
            desc::TYPE_INT_GATE16 | desc::TYPE_TRAP_GATE16 => {
                if self.is_long_mode() || self.traits.is_32bit_only() {
                    return Err(Exception::gp(error_code));
                }
            }
            desc::TYPE_INT_GATE32 | desc::TYPE_TRAP_GATE32 => {
                if self.traits.family < CpuFamily::I386 {
                    return Err(Exception::gp(error_code));
                }
            }
            _ => return Err(Exception::gp(error_code)),
        }

        if exception.is_software() && gate.dpl() < self.cpl {
            return Err(Exception::gp(error_code));
        }
        if !gate.is_present() {
            return Err(Exception::np(error_code));
        }

        log::trace!(
            "protected interrupt {} via gate type {:#x} at cpl {}",
            vec,
            kind >> 8,
            self.cpl
        );

        match kind {
            desc::TYPE_TASK_GATE => self.interrupt_via_task_gate(bus, exception, &gate),
            desc::TYPE_INT_GATE32 | desc::TYPE_TRAP_GATE32 => {
                let size = if self.is_long_mode() { OpSize::Qword } else { OpSize::Dword };
                self.interrupt_via_gate(bus, size, exception, &gate, kind == desc::TYPE_INT_GATE32)
            }
            desc::TYPE_INT_GATE16 | desc::TYPE_TRAP_GATE16 => self.interrupt_via_gate(
                bus,
                OpSize::Word,
                exception,
                &gate,
                kind == desc::TYPE_INT_GATE16,
            ),
            _ => unreachable!(),
        }
    }

    /// NEC V25/V55 bank-switching interrupt entry: instead of a stack
    /// frame, flip to the vector's register bank and stash PSW/PC in its
    /// save slots.
    pub fn enter_interrupt_bank_switching(
        &mut self,
        exception: Exception,
        register_bank: u8,
    ) -> Fallible<()> {
        self.store_x80_registers();
        if exception.kind == ExceptionKind::Fault {
            let old = self.old_xip;
            self.set_xip(old);
        }

        let psw = self.flags_get16();
        self.set_register_bank(register_bank);
        let rb = usize::from(self.rb);
        self.bank[rb][bank::PSW_SAVE] = psw;
        self.bank[rb][bank::PC_SAVE] = self.xip as u16;
        self.intf = false;
        self.tf = false;
        self.md = self.native_mode_flag();
        self.ac = false;
        let target = self.bank[rb][bank::VECTOR_PC];
        self.set_xip(u64::from(target));
        self.load_x80_if_emulation();
        Ok(())
    }

    // ========== Host Interrupt Lines ==========

    /// Assert an interrupt line between steps. Returns whether the line
    /// was accepted given the current mask/mode state; a rejected line
    /// leaves guest state untouched.
    pub fn hardware_interrupt(&mut self, bus: &mut dyn Bus, line: InterruptLine, data: &[u8]) -> bool {
        if self.full_z80_emulation && self.is_emulation_mode() {
            return self.x80_hardware_interrupt_emulated(bus, line, data);
        }

        match line {
            InterruptLine::Ice => match self.traits.family {
                CpuFamily::I286 => {
                    let _ = self.ice_storeall_286(bus);
                    true
                }
                CpuFamily::I386 | CpuFamily::I486 => {
                    let _ = self.ice_storeall_386(bus, 0x60000);
                    true
                }
                _ => false,
            },
            InterruptLine::Smi => {
                if self.traits.smm_format != SmmFormat::None {
                    let _ = self.smm_enter(bus, SmiAttributes::external());
                    true
                } else {
                    false
                }
            }
            InterruptLine::Intr(vec) => {
                // an SS load inhibits interrupts for one instruction
                if self.intf && !self.pending_ss_load {
                    let exception = Exception {
                        vector: vec,
                        kind: ExceptionKind::Trap,
                        source: ExceptionSource::Hardware,
                        error_code: None,
                    };
                    if let Err(next) = self.enter_interrupt(bus, exception) {
                        self.exception_class = ExceptionClass::Benign;
                        let _ = self.deliver(bus, next);
                    }
                    true
                } else {
                    false
                }
            }
            InterruptLine::Nmi => {
                let exception = Exception {
                    vector: vector::NMI,
                    kind: ExceptionKind::Trap,
                    source: ExceptionSource::Hardware,
                    error_code: None,
                };
                if let Err(next) = self.enter_interrupt(bus, exception) {
                    self.exception_class = ExceptionClass::Benign;
                    let _ = self.deliver(bus, next);
                }
                true
            }
            // The 8085 restart lines only exist on a separate x80
            InterruptLine::Rst55 | InterruptLine::Rst65 | InterruptLine::Rst75 => false,
        }
    }

    /// Hardware interrupt translated into the 8080/Z80 emulation mode.
    fn x80_hardware_interrupt_emulated(
        &mut self,
        bus: &mut dyn Bus,
        line: InterruptLine,
        data: &[u8],
    ) -> bool {
        match line {
            InterruptLine::Nmi => {
                // Z80 NMI: vector 0x0066, IFF1 stashed in IFF2
                self.x80.iff2 = self.x80.iff1;
                self.x80.iff1 = false;
                let pc = self.x80.pc;
                if self.x80_push16_emulated(bus, pc).is_err() {
                    return false;
                }
                self.x80.pc = 0x0066;
                true
            }
            InterruptLine::Intr(_) => {
                if !self.x80.iff1 {
                    return false;
                }
                match self.x80.im {
                    0 => {
                        if !self.x80.peripheral_data.is_empty() {
                            return false;
                        }
                        self.x80.peripheral_data = data.to_vec();
                        self.x80.peripheral_pointer = 0;
                    }
                    1 => {
                        let pc = self.x80.pc;
                        if self.x80_push16_emulated(bus, pc).is_err() {
                            return false;
                        }
                        self.x80.pc = 0x0038;
                    }
                    _ => {
                        if data.is_empty() {
                            return false;
                        }
                        let pc = self.x80.pc;
                        if self.x80_push16_emulated(bus, pc).is_err() {
                            return false;
                        }
                        let table = (u16::from(self.x80.i as u8) << 8) | u16::from(data[0]);
                        match self.segmented_read16(bus, seg::DS, u64::from(table)) {
                            Ok(target) => self.x80.pc = target,
                            Err(_) => return false,
                        }
                    }
                }
                self.x80.iff1 = false;
                self.x80.iff2 = false;
                true
            }
            _ => false,
        }
    }

    fn x80_push16_emulated(&mut self, bus: &mut dyn Bus, value: u16) -> Fallible<()> {
        self.x80.sp = self.x80.sp.wrapping_sub(2);
        let sp = self.x80.sp;
        self.segmented_write16(bus, seg::DS, u64::from(sp), value)
    }

    // ========== Software Interrupt Entry ==========

    /// INT n from the executor: IOPL and VME rules apply inside the
    /// protected-mode entry.
    pub fn software_interrupt(&mut self, vec: u8) -> Exception {
        Exception::int_n(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_matrix_shapes() {
        let cpu = Cpu::new(crate::traits::CpuTraits::new(
            CpuFamily::I386,
            crate::traits::CpuSubtype::Classic,
        ));
        assert_eq!(cpu.classify(&Exception::gp(0)), ExceptionClass::Contributory);
        assert_eq!(cpu.classify(&Exception::pf(0)), ExceptionClass::PageFault);
        assert_eq!(cpu.classify(&Exception::ud()), ExceptionClass::Benign);
        assert_eq!(
            cpu.classify(&Exception::double_fault()),
            ExceptionClass::DoubleFault
        );
        // software INT n never contributes
        assert_eq!(cpu.classify(&Exception::int_n(13)), ExceptionClass::Benign);
    }
}
