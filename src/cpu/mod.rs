//! Main x86 stepper
//!
//! The machine state struct, hard/warm reset, and the per-instruction
//! stepper: prefix defaults, prefetch-queue fill, fetch-decode-execute,
//! and the single catch point where unwinding exceptions are delivered.
//! The co-processor, I/O-processor and 8080/Z80 steppers are driven
//! independently by the host.
//!
//! # Module Organization
//!
//! - `helpers`: fetch, stack, control transfer and ALU flag helpers
//! - `decode`: prefix loop and ModRM/SIB effective address computation
//! - `exec`: per-opcode semantics

mod decode;
mod exec;
mod helpers;

#[cfg(test)]
mod tests;

use crate::bus::{AddressSpace, Bus, X80Bus};
use crate::exception::{Exception, ExceptionClass, Fallible, StepResult};
use crate::regs::{
    gpr, seg, CyrixRegs, Efer, IoRestart, MemRegion, Segment, Zmm,
};
use crate::traits::{CpuFamily, CpuTraits, FpuType, CPUID1_EDX_FPU};
use crate::x80::{self, X80, X80CpuType, X80Method, X80Mem};
use crate::x87::{Fpu, QueuedOp, SW_B};
use crate::x89::Iop;

/// Operand/address width selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpSize {
    Byte,
    #[default]
    Word,
    Dword,
    Qword,
}

impl OpSize {
    pub fn bytes(self) -> usize {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::Dword => 4,
            OpSize::Qword => 8,
        }
    }

    pub fn mask(self) -> u64 {
        match self {
            OpSize::Byte => 0xFF,
            OpSize::Word => 0xFFFF,
            OpSize::Dword => 0xFFFF_FFFF,
            OpSize::Qword => u64::MAX,
        }
    }
}

/// String/REP prefix classes, including the NEC carry-condition variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepPrefix {
    #[default]
    None,
    Repz,
    Repnz,
    /// NEC: repeat while carry
    Repc,
    /// NEC: repeat while not carry
    Repnc,
}

/// Mandatory-prefix state for the 0F maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimdPrefix {
    #[default]
    None,
    Op66,
    OpF2,
    OpF3,
}

/// Decoder state block, reset to its defaults at every instruction
/// boundary and rebuilt by the prefix loop.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    /// Segment override, if any.
    pub segment: Option<usize>,
    /// Default source segment for string reads (DS unless overridden).
    pub source_segment: usize,
    /// Default destination segment for string writes (always ES).
    pub destination_segment: usize,
    pub rep_prefix: RepPrefix,
    pub simd_prefix: SimdPrefix,
    pub lock_prefix: bool,
    /// Forces user-space callbacks for this access (SMM code touching
    /// user memory).
    pub user_mode: bool,
    pub code_size: OpSize,
    pub address_size: OpSize,
    pub operation_size: OpSize,
    pub rex_prefix: bool,
    pub rex_w: bool,
    pub rex_r: usize,
    pub rex_x: usize,
    pub rex_b: usize,
    pub opcode_map: u8,
    pub modrm: u8,
    /// Effective address produced by the ModRM decode.
    pub address_offset: u64,
    pub register_field: usize,
    pub ip_relative: bool,
}

/// One emulated processor instance. All architectural state is public in
/// the spirit of an emulator core: hosts and tests poke at it directly.
pub struct Cpu {
    pub traits: CpuTraits,

    // ========== General architectural state ==========
    pub gpr: [u64; gpr::COUNT],
    pub sr: [Segment; seg::COUNT],
    pub cpl: u8,
    pub xip: u64,
    /// Instruction start, for fault rollback and FPU pointers.
    pub old_xip: u64,

    // FLAGS as discrete fields.
    pub cf: bool,
    pub pf: bool,
    pub af: bool,
    pub zf: bool,
    pub sf: bool,
    pub tf: bool,
    pub intf: bool,
    pub df: bool,
    pub of: bool,
    pub iopl: u8,
    pub nt: bool,
    pub rf: bool,
    pub vm: bool,
    pub ac: bool,
    pub vif: bool,
    pub vip: bool,
    pub idf: bool,
    /// V20/µPD9002 native mode flag (clear = 8080/Z80 emulation).
    pub md: bool,
    pub md_enabled: bool,
    /// NEC V25/V55 I/O privilege bit (inverted IBRK flag image).
    pub ibrk: bool,
    /// V25/V55 register bank select.
    pub rb: u8,
    /// µPD9002 Z80-only flag bits (N/X3/X5).
    pub z80_flags: u8,

    // ========== System registers ==========
    pub cr: [u64; 9],
    pub dr: [u64; 8],
    pub tr386: [u32; 8],
    pub xcr0: u64,
    pub efer: u64,
    pub tsc: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    pub mxcsr: u32,
    pub xmm: [Zmm; 32],
    pub kmask: [u64; 8],
    pub bnd: [[u64; 2]; 4],
    pub bndcfgs: u64,
    pub bndcfgu: u64,
    pub bndstatus: u64,

    // ========== Vendor-specific blocks ==========
    /// V25 internal data area (register banks + SFRs).
    pub iram: [u8; 0x200],
    /// V25/V55 register bank images.
    pub bank: [[u16; 16]; 16],
    /// 186 peripheral control block.
    pub pcb: [u8; 0x100],
    pub v33_pgr: [u16; 64],
    pub v33_xam: u8,
    pub v33_io: [u8; 0x81],
    pub cyrix: CyrixRegs,

    // ========== SMM ==========
    pub smbase: u64,
    pub smm_region: MemRegion,
    pub dmm_region: MemRegion,
    pub cpu_level: AddressSpace,
    pub io_restart: IoRestart,

    // ========== Prefetch queue ==========
    pub prefetch_queue: Vec<u8>,
    pub prefetch_len: usize,
    pub prefetch_offset: usize,
    pub prefetch_pointer: u64,

    // ========== Stepper state ==========
    pub parser: Parser,
    pub halted: bool,
    pub exception_class: ExceptionClass,
    pub(crate) result: StepResult,
    /// Interrupts are inhibited for one instruction after an SS load.
    pub pending_ss_load: bool,

    // ========== Sub-machines ==========
    pub x87: Fpu,
    pub x80: X80,
    pub x89: Iop,
    /// Route hardware interrupts straight to the 8080/Z80 logic while in
    /// emulation mode.
    pub full_z80_emulation: bool,
}

impl Cpu {
    /// Create an instance and hard-reset it. The bus is not touched; the
    /// first `step` performs the reset fetch.
    pub fn new(traits: CpuTraits) -> Self {
        let queue = vec![0u8; traits.prefetch_queue_size];
        let mut cpu = Self {
            traits,
            gpr: [0; gpr::COUNT],
            sr: [Segment::default(); seg::COUNT],
            cpl: 0,
            xip: 0,
            old_xip: 0,
            cf: false,
            pf: false,
            af: false,
            zf: false,
            sf: false,
            tf: false,
            intf: false,
            df: false,
            of: false,
            iopl: 0,
            nt: false,
            rf: false,
            vm: false,
            ac: false,
            vif: false,
            vip: false,
            idf: false,
            md: true,
            md_enabled: false,
            ibrk: true,
            rb: 0,
            z80_flags: 0,
            cr: [0; 9],
            dr: [0; 8],
            tr386: [0; 8],
            xcr0: 1,
            efer: 0,
            tsc: 0,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            fmask: 0,
            kernel_gs_base: 0,
            mxcsr: 0x1F80,
            xmm: [Zmm::default(); 32],
            kmask: [0; 8],
            bnd: [[0; 2]; 4],
            bndcfgs: 0,
            bndcfgu: 0,
            bndstatus: 0,
            iram: [0; 0x200],
            bank: [[0; 16]; 16],
            pcb: [0; 0x100],
            v33_pgr: [0; 64],
            v33_xam: 0,
            v33_io: [0; 0x81],
            cyrix: CyrixRegs::default(),
            smbase: 0x30000,
            smm_region: MemRegion::default(),
            dmm_region: MemRegion::default(),
            cpu_level: AddressSpace::Supervisor,
            io_restart: IoRestart::default(),
            prefetch_queue: queue,
            prefetch_len: 0,
            prefetch_offset: 0,
            prefetch_pointer: 0,
            parser: Parser::default(),
            halted: false,
            exception_class: ExceptionClass::Benign,
            result: StepResult::Success,
            pending_ss_load: false,
            x87: Fpu::default(),
            x80: X80::default(),
            x89: Iop::default(),
            full_z80_emulation: false,
        };
        cpu.x87.fpu_type = cpu.traits.fpu_type;
        cpu.reset(true);
        cpu
    }

    // ========== Mode Predicates ==========

    pub fn is_real_mode(&self) -> bool {
        self.traits.family < CpuFamily::I286 || self.cr[0] & 1 == 0
    }

    pub fn is_protected_mode(&self) -> bool {
        !self.is_real_mode()
    }

    pub fn is_v86_mode(&self) -> bool {
        self.vm
    }

    pub fn is_long_mode(&self) -> bool {
        self.efer & Efer::LMA.bits() != 0
    }

    pub fn is_64bit_mode(&self) -> bool {
        self.is_long_mode() && self.sr[seg::CS].is_long()
    }

    pub fn is_32bit_mode(&self) -> bool {
        !self.is_64bit_mode() && self.sr[seg::CS].is_big()
    }

    /// Default code size from the CS descriptor cache.
    pub fn code_size(&self) -> OpSize {
        if self.is_64bit_mode() {
            OpSize::Qword
        } else if self.sr[seg::CS].is_big() {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }

    pub fn stack_size(&self) -> OpSize {
        if self.is_64bit_mode() {
            OpSize::Qword
        } else if self.sr[seg::SS].is_big() {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }

    /// What the MD flag reads as in native operation.
    pub fn native_mode_flag(&self) -> bool {
        true
    }

    pub fn is_emulation_mode(&self) -> bool {
        self.traits.has_x80_mode() && !self.md
    }

    // ========== Reset ==========

    /// Architectural reset. `hard` also clears the once-per-powerup state
    /// (MSRs, vector registers, SMBASE); a warm reset repeats everything
    /// else.
    pub fn reset(&mut self, hard: bool) {
        if hard {
            if self.x87.fpu_type == FpuType::Integrated {
                self.traits.cpuid1.edx |= CPUID1_EDX_FPU;
            } else if self.x87.fpu_type == FpuType::None
                && self.traits.cpuid1.edx & CPUID1_EDX_FPU != 0
            {
                self.x87.fpu_type = FpuType::Integrated;
            }
            self.x89.initialized = false;
            self.smbase = 0x30000;

            self.xmm = [Zmm::default(); 32];
            self.xcr0 = 1;
            self.mxcsr = 0x1F80;
            self.efer = 0;
            self.tsc = 0;
            self.sysenter_cs = 0;
            self.sysenter_esp = 0;
            self.sysenter_eip = 0;
            self.star = 0;
            self.lstar = 0;
            self.cstar = 0;
            self.fmask = 0;
        }

        self.gpr = [0; gpr::COUNT];

        let default_access = if self.traits.is_32bit_only() {
            0x0040_9300
        } else {
            0x9300
        };
        for segment in self.sr.iter_mut() {
            *segment = Segment {
                selector: 0,
                base: 0,
                limit: 0xFFFF,
                access: default_access,
            };
        }

        let (selector, base, xip) = self.traits.reset_vector();
        self.sr[seg::CS].selector = selector;
        self.sr[seg::CS].base = base;
        self.xip = xip;
        self.old_xip = xip;

        for table in [seg::GDTR, seg::IDTR, seg::LDTR, seg::TR] {
            self.sr[table] = Segment {
                selector: 0,
                base: 0,
                limit: 0xFFFF,
                access: 0x8200,
            };
        }

        self.cpl = 0;
        self.cpu_level = AddressSpace::Supervisor;

        if self.traits.family >= CpuFamily::I386 {
            if self.traits.is_32bit_only() {
                self.cr[0] = 0x0000_001F;
            } else if hard {
                self.cr[0] = 0x6000_0000;
            } else {
                self.cr[0] &= !0x6000_0000;
            }
            if self.x87.fpu_type >= FpuType::I387 {
                self.cr[0] |= 0x0000_0010;
            }
            self.cr[2] = 0;
            self.cr[3] = 0;
            self.cr[4] = 0;
            if self.traits.long_mode_supported() && hard {
                self.cr[8] = 0;
            }
            self.dr = [0; 8];
            self.dr[6] = 0xFFFF_0FF0;
            self.dr[7] = if self.traits.family >= CpuFamily::I586 {
                0x0000_0400
            } else {
                0
            };
        } else if self.traits.family == CpuFamily::I286 {
            self.cr[0] = 0xFFF0;
        }

        self.kernel_gs_base = 0;

        // FLAGS
        self.cf = false;
        self.pf = false;
        self.af = false;
        self.zf = false;
        self.sf = false;
        self.tf = false;
        self.intf = false;
        self.df = false;
        self.of = false;
        self.ibrk = true;
        self.rb = match self.traits.family {
            CpuFamily::V25 => 7,
            CpuFamily::V55 => 15,
            _ => 0,
        };
        self.iopl = 0;
        self.nt = false;
        self.rf = false;
        self.vm = false;
        self.ac = false;
        self.vif = false;
        self.vip = false;
        self.idf = false;
        self.z80_flags = 0;

        self.md = self.native_mode_flag();
        match self.traits.family {
            CpuFamily::V20 => {
                self.md_enabled = false;
                self.full_z80_emulation = false;
                self.x80.cpu_type = X80CpuType::I80;
                self.x80.method = X80Method::Emulated;
            }
            CpuFamily::Upd9002 => {
                self.md_enabled = false;
                self.full_z80_emulation = false;
                self.x80.cpu_type = X80CpuType::Z80;
                self.x80.method = X80Method::Emulated;
            }
            CpuFamily::Extended => {
                self.x80.cpu_type = X80CpuType::Z80;
                self.x80.method = X80Method::Emulated;
            }
            _ => {}
        }
        self.x80.reset(hard);

        self.v33_xam &= !crate::paging::XAM_XA;
        self.kmask = [0; 8];
        self.bnd = [[0; 2]; 4];
        self.bndcfgs = 0;
        self.bndcfgu = 0;
        self.bndstatus = 0;

        if hard {
            self.x87.bank = [[crate::x87::float80::Float80::zero(false); 8]; 4];
            self.x87.current_bank = 0;
            self.x87.queued_operation = QueuedOp::None;
            self.x87.protected_mode = false;
            self.x87.sg = 0x2310;
            self.x87.dw = 0;
        }
        self.x87_reset_registers(hard);

        if self.traits.family == CpuFamily::Cyrix {
            self.cyrix.port22_accessed = false;
            self.cyrix.ccr = [0; 8];
            self.cyrix.arr = [0; 14];
            self.cyrix.arr[1] = 0x000F;
            self.cyrix.smm_hdr = 0;
        }

        if self.traits.family == CpuFamily::I186 {
            // relocation register: internal block at I/O FF00
            self.pcb[crate::mem::PCB_PCR_OFFSET] = 0xFF;
            self.pcb[crate::mem::PCB_PCR_OFFSET + 1] = 0x20;
        } else if self.traits.family == CpuFamily::V25 {
            self.v25_reset_sfrs(hard);
        }

        if matches!(self.traits.family, CpuFamily::V25 | CpuFamily::V55) {
            self.store_register_bank();
        }

        self.halted = false;
        self.pending_ss_load = false;
        self.prefetch_queue_flush();
    }

    fn v25_reset_sfrs(&mut self, hard: bool) {
        // port/timer/serial control defaults per the data sheet
        for (offset, value) in [
            (0x101usize, 0xFFu8), // PM0
            (0x109, 0xFF),        // PM1
            (0x111, 0xFF),        // PM2
            (0x13B, 0x00),        // PMT
            (0x102, 0x00),        // PMC0
            (0x10A, 0x00),        // PMC1
            (0x112, 0x00),        // PMC2
            (0x190, 0x00),        // TMC0
            (0x191, 0x00),        // TMC1
            (0x19C, 0x47),        // TMIC0
            (0x19D, 0x47),        // TMIC1
            (0x19E, 0x47),        // TMIC2
            (0x1A1, 0x00),        // DMAM0
            (0x1A3, 0x00),        // DMAM1
            (0x1AC, 0x47),        // DIC0
            (0x1AD, 0x47),        // DIC1
            (0x168, 0x00),        // SCM0
            (0x178, 0x00),        // SCM1
            (0x16C, 0x47),        // SEIC0
            (0x17C, 0x47),        // SEIC1
            (0x16D, 0x47),        // SRIC0
            (0x17D, 0x47),        // SRIC1
            (0x16E, 0x47),        // STIC0
            (0x17E, 0x47),        // STIC1
            (0x1EC, 0x47),        // TBIC
            (crate::regs::sfr::FLAG, 0x00),
            (crate::regs::sfr::IDB, 0xFF),
            (crate::regs::sfr::PRC, 0x4E),
            (0x1E8, 0xFF),        // WTC low
            (0x1E9, 0xFF),        // WTC high
            (0x1E1, 0xFC),        // RFM
            (0x140, 0x00),        // INTM
            (0x14C, 0x47),        // EXIC0
            (0x14D, 0x47),        // EXIC1
            (0x14E, 0x47),        // EXIC2
            (0x1FC, 0x00),        // ISPR
        ] {
            self.iram[offset] = value;
        }
        if hard {
            self.iram[0x1E0] = 0x00; // STBC
        }
    }

    fn x87_reset_registers(&mut self, hard: bool) {
        if hard {
            self.x87.dw = 0;
        }
        self.x87.cw = if self.traits.family < CpuFamily::I586 {
            0x037F
        } else {
            0x0040
        };
        self.x87.sw = if self.x87.fpu_type == FpuType::I387 && hard {
            // signal an 80387 (ES+IE) rather than an 80287 after reset
            0x0081
        } else {
            0
        };
        self.x87.tw = if self.traits.family < CpuFamily::I586 {
            0xFFFF
        } else {
            0x5555
        };
        self.x87.fip = 0;
        self.x87.fcs = 0;
        self.x87.fdp = 0;
        self.x87.fds = 0;
        self.x87.fop = 0;
    }

    // ========== xIP Maintenance ==========

    /// Writing xIP through here keeps the prefetch queue honest.
    pub fn set_xip(&mut self, value: u64) {
        self.xip = value;
        self.prefetch_queue_flush();
    }

    pub(crate) fn load_x80_if_emulation(&mut self) {
        if self.is_emulation_mode() {
            self.load_x80_registers();
        }
    }

    pub(crate) fn clear_arithmetic_flags(&mut self) {
        self.cf = false;
        self.pf = false;
        self.af = false;
        self.zf = false;
        self.sf = false;
        self.tf = false;
        self.intf = false;
        self.df = false;
        self.of = false;
    }

    // ========== Stepper ==========

    /// Execute exactly one instruction (or one 8080/Z80 instruction in
    /// emulation mode) and report what happened.
    pub fn step(&mut self, bus: &mut dyn Bus) -> StepResult {
        if self.halted {
            return StepResult::Halt;
        }
        self.result = StepResult::Success;
        self.exception_class = ExceptionClass::Benign;
        self.pending_ss_load = false;

        match self.step_inner(bus) {
            Ok(()) => self.result,
            Err(exception) => self.deliver(bus, exception),
        }
    }

    fn step_inner(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        if self.is_emulation_mode() {
            self.x80_emulated_step(bus)?;
        } else {
            self.old_xip = self.xip;
            self.parser_reset();
            self.prefetch_queue_fill(bus);
            self.execute_instruction(bus)?;
        }

        // TSS debug trap bit, checked after every completed instruction
        if self.is_protected_mode()
            && crate::regs::desc::get_type(self.sr[seg::TR].access)
                == crate::regs::desc::TYPE_TSS32_BUSY
            && self.sr[seg::TR].limit >= 0x64
        {
            if self.segmented_read8(bus, seg::TR, 0x64)? & 0x01 != 0 {
                self.dr[6] |= crate::regs::Dr6::BS.bits();
                return Err(Exception::db_trap());
            }
        }
        Ok(())
    }

    fn parser_reset(&mut self) {
        self.parser.segment = None;
        self.parser.source_segment = seg::DS;
        self.parser.destination_segment = seg::ES;
        self.parser.rep_prefix = RepPrefix::None;
        self.parser.simd_prefix = SimdPrefix::None;
        self.parser.lock_prefix = false;
        self.parser.user_mode = false;
        self.parser.code_size = self.code_size();
        self.parser.address_size = self.parser.code_size;
        self.parser.operation_size = if self.parser.code_size == OpSize::Word {
            OpSize::Word
        } else {
            OpSize::Dword
        };
        self.parser.rex_prefix = false;
        self.parser.rex_w = false;
        self.parser.rex_r = 0;
        self.parser.rex_x = 0;
        self.parser.rex_b = 0;
        self.parser.opcode_map = 0;
        self.parser.modrm = 0;
        self.parser.address_offset = 0;
        self.parser.register_field = 0;
        self.parser.ip_relative = false;
    }

    // ========== 8080/Z80 Emulation Step ==========

    fn x80_emulated_step(&mut self, bus: &mut dyn Bus) -> Fallible<()> {
        let mut state = core::mem::take(&mut self.x80);
        let outcome = {
            let mut view = EmulatedX80Bus { cpu: self, bus };
            x80::execute(&mut state, &mut view)
        };
        self.x80 = state;
        match outcome? {
            x80::Outcome::Normal => Ok(()),
            x80::Outcome::Halt => {
                self.halted = true;
                self.result = StepResult::Halt;
                Ok(())
            }
            x80::Outcome::Calln(vector) => {
                // CALLN: x86 interrupt out of emulation mode; IRET restores
                // MD and resumes the 8080/Z80 stream
                self.enter_interrupt(bus, Exception::int_n(vector))?;
                self.result = StepResult::CpuInterrupt(vector);
                Ok(())
            }
            x80::Outcome::Retem => {
                self.store_x80_registers();
                self.return_interrupt(bus, OpSize::Word)?;
                self.md = true;
                Ok(())
            }
        }
    }

    // ========== Co-processor and IOP Steppers ==========

    /// One deferred FPU micro-step (external FPU variants only; the
    /// integrated FPU executes inside `step`).
    pub fn fpu_step(&mut self, bus: &mut dyn Bus) {
        if !self.x87.is_external() {
            return;
        }
        if self.x87.sw & SW_B == 0 {
            return;
        }

        let pending = self.x87.pending;
        self.x87.fop = pending.fop;
        self.x87.fcs = pending.fcs;
        self.x87.fip = pending.fip;
        self.x87.fds = pending.fds;
        self.x87.fdp = pending.fdp;
        let _ = self.x87_execute(bus, pending.opcode, pending.modrm, pending.segment, pending.offset);

        match self.x87.queued_operation {
            QueuedOp::None => {}
            QueuedOp::Fsave => {
                self.sr[seg::FDS] = self.x87.queued_segment;
                let offset = self.x87.queued_offset;
                let _ = self.x87_state_save(bus, seg::FDS, offset, OpSize::Word);
                self.x87.queued_operation = QueuedOp::None;
            }
            QueuedOp::Fstenv => {
                self.sr[seg::FDS] = self.x87.queued_segment;
                let offset = self.x87.queued_offset;
                let _ = self.x87_env_save(bus, seg::FDS, offset, OpSize::Word);
                self.x87.queued_operation = QueuedOp::None;
            }
        }
        self.x87.sw &= !SW_B;
    }

    /// One step of a *separate* (non-emulated) 8080/Z80.
    pub fn x80_step(&mut self, bus: &mut dyn X80Bus) -> StepResult {
        if self.x80.method != X80Method::Separate {
            return StepResult::Success;
        }
        let mut adapter = x80::SeparateBus { bus };
        match x80::execute(&mut self.x80, &mut adapter) {
            Ok(x80::Outcome::Halt) => StepResult::Halt,
            Ok(_) => StepResult::Success,
            Err(_) => StepResult::Success,
        }
    }
}

/// 8080/Z80 memory view in emulation mode: code and data both go through
/// the DS segment of the embedding x86.
struct EmulatedX80Bus<'a> {
    cpu: &'a mut Cpu,
    bus: &'a mut dyn Bus,
}

impl X80Mem for EmulatedX80Bus<'_> {
    fn fetch8(&mut self, address: u16) -> Fallible<u8> {
        self.cpu
            .segmented_read8_exec(self.bus, seg::DS, u64::from(address))
    }

    fn read8(&mut self, address: u16) -> Fallible<u8> {
        self.cpu.segmented_read8(self.bus, seg::DS, u64::from(address))
    }

    fn write8(&mut self, address: u16, value: u8) -> Fallible<()> {
        self.cpu
            .segmented_write8(self.bus, seg::DS, u64::from(address), value)
    }

    fn input8(&mut self, port: u16) -> Fallible<u8> {
        self.cpu.input8(self.bus, port)
    }

    fn output8(&mut self, port: u16, value: u8) -> Fallible<()> {
        self.cpu.output8(self.bus, port, value)
    }
}

