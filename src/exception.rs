//! Exception vectors, classification and step results
//!
//! Every fallible operation inside a step (memory access, descriptor load,
//! selector validation, arithmetic faults) returns `Err(Exception)` and the
//! error propagates with `?` to a single catch point at step entry, where
//! delivery and double/triple-fault escalation happen. This replaces the
//! two-level non-local exit of classic emulator cores: the speculative
//! prefetch fill keeps its own nested catch that swallows faults silently.

/// Architectural exception vectors.
pub mod vector {
    /// Divide error
    pub const DE: u8 = 0;
    /// Debug
    pub const DB: u8 = 1;
    /// Non-maskable interrupt
    pub const NMI: u8 = 2;
    /// Breakpoint
    pub const BP: u8 = 3;
    /// Overflow (INTO)
    pub const OF: u8 = 4;
    /// BOUND range exceeded
    pub const BR: u8 = 5;
    /// Undefined opcode
    pub const UD: u8 = 6;
    /// Device not available
    pub const NM: u8 = 7;
    /// Double fault
    pub const DF: u8 = 8;
    /// Coprocessor segment overrun (287/387 era)
    pub const MP: u8 = 9;
    /// Invalid TSS
    pub const TS: u8 = 10;
    /// Segment not present
    pub const NP: u8 = 11;
    /// Stack fault
    pub const SS: u8 = 12;
    /// General protection
    pub const GP: u8 = 13;
    /// Page fault
    pub const PF: u8 = 14;
    /// x87 floating point
    pub const MF: u8 = 16;
    /// Alignment check
    pub const AC: u8 = 17;
    /// Machine check
    pub const MC: u8 = 18;
    /// SIMD floating point
    pub const XM: u8 = 19;
    /// NEC V25/V55 I/O instruction break (shares 19 with XM; the families
    /// never overlap)
    pub const IO: u8 = 19;
    /// Control protection (CET)
    pub const CP: u8 = 21;
    /// VMM communication (SEV-ES)
    pub const VC: u8 = 29;
}

/// Page fault error code bits.
pub mod pf_error {
    pub const P: u64 = 1 << 0;
    pub const WR: u64 = 1 << 1;
    pub const US: u64 = 1 << 2;
    pub const RSVD: u64 = 1 << 3;
    pub const ID: u64 = 1 << 4;
}

/// Fault/trap/abort disposition: faults roll xIP back to the instruction
/// start before the frame is built, traps point past it, aborts leave it
/// unreliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Fault,
    Trap,
    Abort,
}

/// How the event was produced. The IDT privilege check and the EXT bit of
/// pushed error codes depend on this, not on the vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExceptionSource {
    /// CPU-detected exception or external interrupt
    #[error("hardware")]
    Hardware,
    /// INT n
    #[error("INT n")]
    IntN,
    /// INT3 / INTO / ICEBP one-byte forms
    #[error("software")]
    Software,
}

/// A guest architectural exception in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guest exception vector {vector} ({kind:?}, error code {error_code:?})")]
pub struct Exception {
    pub vector: u8,
    pub kind: ExceptionKind,
    pub source: ExceptionSource,
    /// `Some` when the architecture defines an error code push for this
    /// event.
    pub error_code: Option<u64>,
}

impl Exception {
    pub const fn fault(vector: u8) -> Self {
        Self {
            vector,
            kind: ExceptionKind::Fault,
            source: ExceptionSource::Hardware,
            error_code: None,
        }
    }

    pub const fn trap(vector: u8) -> Self {
        Self {
            vector,
            kind: ExceptionKind::Trap,
            source: ExceptionSource::Hardware,
            error_code: None,
        }
    }

    pub const fn with_error(mut self, code: u64) -> Self {
        self.error_code = Some(code);
        self
    }

    /// Software interrupt (INT n), delivered as a trap.
    pub const fn int_n(vector: u8) -> Self {
        Self {
            vector,
            kind: ExceptionKind::Trap,
            source: ExceptionSource::IntN,
            error_code: None,
        }
    }

    /// One-byte software forms: INT3, INTO, ICEBP.
    pub const fn software(vector: u8) -> Self {
        Self {
            vector,
            kind: ExceptionKind::Trap,
            source: ExceptionSource::Software,
            error_code: None,
        }
    }

    // Shorthand constructors for the common protection faults.

    pub const fn ud() -> Self {
        Self::fault(vector::UD)
    }

    pub const fn gp(code: u64) -> Self {
        Self::fault(vector::GP).with_error(code)
    }

    pub const fn ss_fault(code: u64) -> Self {
        Self::fault(vector::SS).with_error(code)
    }

    pub const fn np(code: u64) -> Self {
        Self::fault(vector::NP).with_error(code)
    }

    pub const fn ts(code: u64) -> Self {
        Self::fault(vector::TS).with_error(code)
    }

    pub const fn nm() -> Self {
        Self::fault(vector::NM)
    }

    pub const fn mf() -> Self {
        Self::fault(vector::MF)
    }

    pub const fn pf(code: u64) -> Self {
        Self::fault(vector::PF).with_error(code)
    }

    pub const fn db_fault() -> Self {
        Self::fault(vector::DB)
    }

    pub const fn db_trap() -> Self {
        Self::trap(vector::DB)
    }

    pub const fn double_fault() -> Self {
        Self {
            vector: vector::DF,
            kind: ExceptionKind::Abort,
            source: ExceptionSource::Hardware,
            error_code: Some(0),
        }
    }

    pub fn is_software(&self) -> bool {
        !matches!(self.source, ExceptionSource::Hardware)
    }
}

/// Result type used by every fallible guest operation.
pub type Fallible<T> = core::result::Result<T, Exception>;

/// Escalation class of an exception, per the double-fault matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ExceptionClass {
    #[default]
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

/// What one call to `step` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Instruction retired normally.
    Success,
    /// HLT executed; subsequent steps return `Halt` until an interrupt is
    /// delivered.
    Halt,
    /// An exception or interrupt was delivered; guest state already points
    /// at the handler. Informational for the host.
    CpuInterrupt(u8),
    /// An out-of-band interrupt request line is being asserted (8087 with
    /// IEM=0, or integrated FPU error with CR0.NE=0 routing through IRQ13).
    Irq(u8),
    /// 8086-class parts do not fault on unknown encodings; the opcode is
    /// reported and execution continues on the next step.
    Undefined(u8),
    /// Shutdown; only an external reset recovers.
    TripleFault,
    /// The in-circuit-emulation dump was taken (386/486 ICE breakpoints).
    IceInterrupt,
}

/// Errors surfaced to the host by non-stepping APIs (construction, state
/// snapshots, the C ABI argument checks).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("snapshot buffer too small: need {need} bytes, got {got}")]
    SnapshotTooSmall { need: usize, got: usize },
    #[error("snapshot image malformed")]
    SnapshotMalformed,
    #[error("configuration rejected: {0}")]
    Config(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_constructors() {
        let e = Exception::gp(0x1234);
        assert_eq!(e.vector, vector::GP);
        assert_eq!(e.error_code, Some(0x1234));
        assert_eq!(e.kind, ExceptionKind::Fault);
        assert!(!e.is_software());

        let e = Exception::int_n(0x21);
        assert!(e.is_software());
        assert_eq!(e.error_code, None);
    }

    #[test]
    fn test_class_ordering() {
        assert!(ExceptionClass::Benign < ExceptionClass::Contributory);
        assert!(ExceptionClass::Contributory < ExceptionClass::PageFault);
        assert!(ExceptionClass::PageFault < ExceptionClass::DoubleFault);
    }
}
