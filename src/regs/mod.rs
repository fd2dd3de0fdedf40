//! Register and flag access
//!
//! Typed accessors over the general register file (with the REX byte
//! aliasing rule and 32-bit zero extension), the segment register cache,
//! the decomposed FLAGS fields and their image forms, the V25/V55 register
//! banks, and the control/debug/test/model-specific register sets.
//!
//! The *raw* flag accessors compose the full register as interrupt entry
//! and task switching see it; the *image* accessors apply the
//! family-specific masking PUSHF/POPF/IRET observe.

pub mod flags;

use crate::cpu::Cpu;
use crate::exception::{vector, Exception, Fallible};
use crate::traits::{CpuFamily, CpuSubtype, FpuType, CPUID1_EDX_PAE, CPUID1_EDX_SEP, CPUID1_EDX_TSC, CPUID7_0_EBX_MPX, CPUID_EXT1_EDX_LM, CPUID_EXT1_EDX_NX, CPUID_EXT1_EDX_SYSCALL};

// ========== Register Numbers ==========

/// General purpose register indices; the 8086-era aliases occupy the first
/// eight slots.
pub mod gpr {
    pub const AX: usize = 0;
    pub const CX: usize = 1;
    pub const DX: usize = 2;
    pub const BX: usize = 3;
    pub const SP: usize = 4;
    pub const BP: usize = 5;
    pub const SI: usize = 6;
    pub const DI: usize = 7;
    pub const COUNT: usize = 32;
}

/// Segment register table indices. The first eight are user segments (the
/// NEC V55 extends the classic four with DS3/DS2); the descriptor table
/// registers and the FPU data pseudo-segment follow.
pub mod seg {
    pub const ES: usize = 0;
    pub const CS: usize = 1;
    pub const SS: usize = 2;
    pub const DS: usize = 3;
    pub const FS: usize = 4;
    pub const GS: usize = 5;
    pub const DS3: usize = 6;
    pub const DS2: usize = 7;
    /// User segments end here; the rest are table registers.
    pub const USER_COUNT: usize = 8;
    pub const GDTR: usize = 8;
    pub const IDTR: usize = 9;
    pub const LDTR: usize = 10;
    pub const TR: usize = 11;
    /// FPU data pseudo-segment used by deferred FSAVE/FSTENV.
    pub const FDS: usize = 12;
    /// V55 on-chip RAM pseudo-segment (not a real register; routes
    /// segmented accesses into the internal RAM).
    pub const IRAM: usize = 13;
    pub const COUNT: usize = 14;
}

/// Selector fields.
pub mod sel {
    pub const RPL_MASK: u16 = 0x0003;
    pub const LDT: u16 = 0x0004;
    pub const INDEX_MASK: u16 = !0x0007;
}

// ========== Descriptor Access Words ==========

/// Bits of the 32-bit cached access word: bits 8..15 mirror the descriptor
/// access byte, bits 20..23 mirror the flags nibble of the high descriptor
/// word.
pub mod desc {
    /// Accessed
    pub const A: u32 = 0x0000_0100;
    /// Writable (data) / readable (code); also the busy bit of TSS types
    pub const WR: u32 = 0x0000_0200;
    pub const BUSY: u32 = 0x0000_0200;
    /// Expand-down (data) / conforming (code)
    pub const CE: u32 = 0x0000_0400;
    /// Executable
    pub const X: u32 = 0x0000_0800;
    /// Non-system segment
    pub const S: u32 = 0x0000_1000;
    pub const DPL_SHIFT: u32 = 13;
    pub const DPL_MASK: u32 = 3 << DPL_SHIFT;
    /// Present
    pub const P: u32 = 0x0000_8000;
    /// Available to software
    pub const AVL: u32 = 0x0010_0000;
    /// 64-bit code segment
    pub const L: u32 = 0x0020_0000;
    /// Default size 32
    pub const D: u32 = 0x0040_0000;
    /// Limit granularity in pages
    pub const G: u32 = 0x0080_0000;

    /// System + type field, as `access & TYPE_MASK`.
    pub const TYPE_MASK: u32 = 0x1F00;
    pub const TYPE_TSS16_AVAILABLE: u32 = 0x0100;
    pub const TYPE_LDT: u32 = 0x0200;
    pub const TYPE_TSS16_BUSY: u32 = 0x0300;
    pub const TYPE_CALL_GATE16: u32 = 0x0400;
    pub const TYPE_TASK_GATE: u32 = 0x0500;
    pub const TYPE_INT_GATE16: u32 = 0x0600;
    pub const TYPE_TRAP_GATE16: u32 = 0x0700;
    pub const TYPE_TSS32_AVAILABLE: u32 = 0x0900;
    pub const TYPE_TSS32_BUSY: u32 = 0x0B00;
    pub const TYPE_CALL_GATE32: u32 = 0x0C00;
    pub const TYPE_INT_GATE32: u32 = 0x0E00;
    pub const TYPE_TRAP_GATE32: u32 = 0x0F00;

    pub fn get_type(access: u32) -> u32 {
        access & TYPE_MASK
    }

    pub fn set_type(access: u32, ty: u32) -> u32 {
        (access & !TYPE_MASK) | (ty & TYPE_MASK)
    }

    pub fn is_executable(access: u32) -> bool {
        access & X != 0
    }

    /// Only meaningful for code descriptors.
    pub fn is_readable(access: u32) -> bool {
        access & WR != 0
    }

    /// Only meaningful for data descriptors.
    pub fn is_writable(access: u32) -> bool {
        access & WR != 0
    }

    /// Only meaningful for code descriptors.
    pub fn is_conforming(access: u32) -> bool {
        access & CE != 0
    }

    /// Only meaningful for data descriptors.
    pub fn is_expand_down(access: u32) -> bool {
        access & CE != 0
    }

    pub fn dpl(access: u32) -> u8 {
        ((access >> DPL_SHIFT) & 3) as u8
    }
}

/// One cached segment register: the last successfully loaded selector and
/// the descriptor fields that came with it. Null selectors keep the RPL
/// bits; base/limit are then stale by design.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: u32,
}

impl Segment {
    pub fn kind(&self) -> u32 {
        desc::get_type(self.access)
    }

    pub fn is_executable(&self) -> bool {
        desc::is_executable(self.access)
    }

    pub fn is_readable(&self) -> bool {
        desc::is_readable(self.access)
    }

    pub fn is_writable(&self) -> bool {
        desc::is_writable(self.access)
    }

    pub fn is_expand_down(&self) -> bool {
        desc::is_expand_down(self.access)
    }

    /// D bit: 32-bit default operand/stack size.
    pub fn is_big(&self) -> bool {
        self.access & desc::D != 0
    }

    /// L bit: 64-bit code segment.
    pub fn is_long(&self) -> bool {
        self.access & desc::L != 0
    }
}

/// Register bank word indices for the V25/V55 on-chip banks. Each bank is
/// sixteen words; the low words double as the interrupt save slots.
pub mod bank {
    /// PC loaded on a bank-switching interrupt (V25)
    pub const VECTOR_PC: usize = 0;
    /// PSW saved by a bank-switching interrupt
    pub const PSW_SAVE: usize = 1;
    /// PC saved by a bank-switching interrupt
    pub const PC_SAVE: usize = 2;
}

/// Special function register offsets inside the V25 internal data area.
pub mod sfr {
    /// F0/F1 user flags
    pub const FLAG: usize = 0x1EA;
    /// Processor control: RAMEN gates the IRAM overlay
    pub const PRC: usize = 0x1EB;
    /// Internal data base (top byte of the IRAM window address)
    pub const IDB: usize = 0x1FF;

    pub const PRC_RAMEN: u8 = 0x40;
}

// ========== System Register Bit Sets ==========

bitflags::bitflags! {
    /// CR0 bits the core interprets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u64 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CR4 bits the core interprets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4: u64 {
        const VME = 1 << 0;
        const PVI = 1 << 1;
        const TSD = 1 << 2;
        const DE = 1 << 3;
        const PSE = 1 << 4;
        const PAE = 1 << 5;
        const PGE = 1 << 7;
        const OSFXSR = 1 << 9;
        const PCIDE = 1 << 17;
        const VA57 = 1 << 12;
    }
}

bitflags::bitflags! {
    /// Extended feature enable register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Efer: u64 {
        const SCE = 1 << 0;
        const LME = 1 << 8;
        const LMA = 1 << 10;
        const NXE = 1 << 11;
        const LMSLE = 1 << 13;
    }
}

bitflags::bitflags! {
    /// DR6 status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dr6: u64 {
        const B0 = 1 << 0;
        const B1 = 1 << 1;
        const B2 = 1 << 2;
        const B3 = 1 << 3;
        const BD = 1 << 13;
        const BS = 1 << 14;
        const BT = 1 << 15;
        const SMM = 1 << 12;
    }
}

bitflags::bitflags! {
    /// DR7 control bits (the per-breakpoint R/W and LEN fields are decoded
    /// positionally).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dr7: u64 {
        const L0 = 1 << 0;
        const G0 = 1 << 1;
        const L1 = 1 << 2;
        const G1 = 1 << 3;
        const L2 = 1 << 4;
        const G2 = 1 << 5;
        const L3 = 1 << 6;
        const G3 = 1 << 7;
        const ICE = 1 << 12;
        const GD = 1 << 13;
    }
}

pub const DR7_RW0_SHIFT: u32 = 16;
pub const DR7_LEN0_SHIFT: u32 = 18;

// ========== Model Specific Register Numbers ==========

pub mod msr {
    pub const TSC: u32 = 0x0000_0010;
    pub const SYSENTER_CS: u32 = 0x0000_0174;
    pub const SYSENTER_ESP: u32 = 0x0000_0175;
    pub const SYSENTER_EIP: u32 = 0x0000_0176;
    pub const BNDCFGS: u32 = 0x0000_0D90;
    pub const EFER: u32 = 0xC000_0080;
    pub const STAR: u32 = 0xC000_0081;
    pub const LSTAR: u32 = 0xC000_0082;
    pub const CSTAR: u32 = 0xC000_0083;
    pub const FMASK: u32 = 0xC000_0084;
    pub const FS_BASE: u32 = 0xC000_0100;
    pub const GS_BASE: u32 = 0xC000_0101;
    pub const KERNEL_GS_BASE: u32 = 0xC000_0102;
    // Geode LX system management MSR block.
    pub const LX_PCR: u32 = 0x0000_1300;
    pub const LX_SMM_CTL: u32 = 0x0000_1301;
    pub const LX_DMI_CTL: u32 = 0x0000_1302;
    pub const LX_SMM_HDR: u32 = 0x0000_1303;
    pub const LX_DMM_HDR: u32 = 0x0000_1304;
    pub const LX_SMM_BASE: u32 = 0x0000_1305;
    pub const LX_DMM_BASE: u32 = 0x0000_1306;
}

// ========== SIMD / Auxiliary State Containers ==========

/// One vector register, allocated at the ZMM width regardless of family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Zmm {
    pub q: [u64; 8],
}

/// A base/limit pair for the Cyrix GX2/LX relocatable SMM region.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemRegion {
    pub base: u64,
    pub limit: u64,
}

/// Registers captured ahead of a port access so RSM with I/O restart can
/// replay the faulted string instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoRestart {
    pub xsi: u64,
    pub xcx: u64,
    pub xdi: u64,
}

/// Cyrix configuration register file, reachable through the indexed
/// 22h/23h port pair (or MSRs on GX2/LX).
#[derive(Debug, Clone)]
pub struct CyrixRegs {
    pub ccr: [u8; 8],
    pub arr: [u32; 14],
    pub rcr: [u8; 16],
    pub pcr: [u8; 2],
    pub dir: [u8; 5],
    pub lcr1: u8,
    pub bcr: [u8; 2],
    pub gcr: u8,
    pub vgactl: u8,
    pub vgam: u32,
    pub smm_hdr: u32,
    pub smm_ctl: u32,
    pub dmi_ctl: u32,
    pub dmm_hdr: u32,
    /// An index was written to port 22h and the allow-list passed; the next
    /// 23h access reaches the register file.
    pub port22_accessed: bool,
    pub port_number: u8,
}

impl Default for CyrixRegs {
    fn default() -> Self {
        Self {
            ccr: [0; 8],
            arr: [0; 14],
            rcr: [0; 16],
            pcr: [0; 2],
            dir: [0; 5],
            lcr1: 0,
            bcr: [0; 2],
            gcr: 0,
            vgactl: 0,
            vgam: 0,
            smm_hdr: 0,
            smm_ctl: 0,
            dmi_ctl: 0,
            dmm_hdr: 0,
            port22_accessed: false,
            port_number: 0,
        }
    }
}

/// CCR3 MAPEN field.
pub const CCR3_MAPEN_MASK: u8 = 0xF0;
pub const CCR3_MAPEN_SHIFT: u32 = 4;

// ========== General Registers ==========

impl Cpu {
    #[inline]
    pub fn register_get8_low(&self, number: usize) -> u8 {
        self.gpr[number] as u8
    }

    #[inline]
    pub fn register_get8_high(&self, number: usize) -> u8 {
        (self.gpr[number] >> 8) as u8
    }

    /// ModRM/opcode-indexed byte read. Without a REX prefix, indices 4..7
    /// select the high byte of AX..BX; with REX they select the low byte of
    /// SP/BP/SI/DI.
    #[inline]
    pub fn register_get8(&self, number: usize) -> u8 {
        if self.parser.rex_prefix || number & 4 == 0 {
            self.register_get8_low(number)
        } else {
            self.register_get8_high(number & 3)
        }
    }

    #[inline]
    pub fn register_set8_low(&mut self, number: usize, value: u8) {
        self.gpr[number] = (self.gpr[number] & !0xFF) | u64::from(value);
    }

    #[inline]
    pub fn register_set8_high(&mut self, number: usize, value: u8) {
        self.gpr[number] = (self.gpr[number] & !0xFF00) | (u64::from(value) << 8);
    }

    /// ModRM/opcode-indexed byte write, REX aliasing as in
    /// [`Cpu::register_get8`].
    #[inline]
    pub fn register_set8(&mut self, number: usize, value: u8) {
        if self.parser.rex_prefix || number & 4 == 0 {
            self.register_set8_low(number, value);
        } else {
            self.register_set8_high(number & 3, value);
        }
    }

    #[inline]
    pub fn register_get16(&self, number: usize) -> u16 {
        self.gpr[number] as u16
    }

    #[inline]
    pub fn register_set16(&mut self, number: usize, value: u16) {
        self.gpr[number] = (self.gpr[number] & !0xFFFF) | u64::from(value);
    }

    #[inline]
    pub fn register_get32(&self, number: usize) -> u32 {
        self.gpr[number] as u32
    }

    /// 32-bit writes zero-extend through the full 64-bit register.
    #[inline]
    pub fn register_set32(&mut self, number: usize, value: u32) {
        self.gpr[number] = u64::from(value);
    }

    #[inline]
    pub fn register_get64(&self, number: usize) -> u64 {
        self.gpr[number]
    }

    #[inline]
    pub fn register_set64(&mut self, number: usize, value: u64) {
        self.gpr[number] = value;
    }

    // ========== Segment Registers ==========

    /// Real mode segment load: base = selector << 4 (<< 8 for the V55
    /// DS2/DS3 windows into the 24-bit space). A CS load additionally
    /// forces the descriptor cache to a readable/writable ring-0 data
    /// shape, preserving only the default-size bit.
    pub fn segment_load_real_mode(&mut self, segment: usize, value: u16) {
        self.sr[segment].selector = value;
        if (self.traits.family == CpuFamily::V55 || self.traits.family == CpuFamily::Extended)
            && (segment == seg::DS3 || segment == seg::DS2)
        {
            self.sr[segment].base = u64::from(value) << 8;
        } else {
            self.sr[segment].base = u64::from(value) << 4;
        }

        if segment == seg::CS {
            self.sr[segment].limit = 0xFFFF;
            self.sr[segment].access &= !desc::D;
            self.sr[segment].access |= desc::P | desc::S | desc::WR | desc::A;
        }
    }

    /// Real mode load that also forces limit and access rights to the real
    /// mode defaults; used when dropping back into virtual 8086 mode.
    pub fn segment_load_real_mode_full(&mut self, segment: usize, value: u16) {
        self.segment_load_real_mode(segment, value);
        self.sr[segment].limit = 0xFFFF;
        self.sr[segment].access = desc::P | desc::S | desc::WR | desc::A | (3 << desc::DPL_SHIFT);
    }

    /// Map an encoded segment number onto the family's register table,
    /// faulting where the family lacks the register.
    pub fn segment_number(&self, number: usize) -> Fallible<usize> {
        if self.traits.family == CpuFamily::I8086
            || (self.traits.family >= CpuFamily::V20 && self.traits.family <= CpuFamily::V25
                && self.traits.family != CpuFamily::V55)
        {
            return Ok(number & 3);
        }
        let number = number & 7;
        match number {
            seg::FS | seg::GS => {
                if self.traits.family == CpuFamily::V55 {
                    // V55 encodes DS2/DS3 where Intel encodes FS/GS
                    Ok(number | 2)
                } else if self.traits.family < CpuFamily::I386 {
                    Err(Exception::ud())
                } else {
                    Ok(number)
                }
            }
            seg::DS2 | seg::DS3 => {
                if self.traits.family == CpuFamily::V55 || self.traits.family == CpuFamily::Extended {
                    Ok(number)
                } else {
                    Err(Exception::ud())
                }
            }
            _ => Ok(number),
        }
    }

    pub fn segment_get(&self, number: usize) -> u16 {
        self.sr[number].selector
    }

    // ========== Privilege Level ==========

    #[inline]
    pub fn cpl(&self) -> u8 {
        self.cpl
    }

    /// The CPL lives in its own field but is mirrored into the DPL bits of
    /// the SS and CS access words and the RPL of the CS selector.
    pub fn set_cpl(&mut self, rpl: u8) {
        let rpl = rpl & 3;
        self.cpl = rpl;
        for s in [seg::SS, seg::CS] {
            self.sr[s].access =
                (self.sr[s].access & !desc::DPL_MASK) | (u32::from(rpl) << desc::DPL_SHIFT);
        }
        if self.is_protected_mode() && !self.is_v86_mode() {
            self.sr[seg::CS].selector =
                (self.sr[seg::CS].selector & !sel::RPL_MASK) | u16::from(rpl);
        }
    }

    // ========== V25/V55 Register Banks ==========

    fn bank_number(&self, value: u8) -> u8 {
        if self.traits.family == CpuFamily::V25 {
            value & 7
        } else {
            value & 0xF
        }
    }

    /// Flush the live registers into the current bank slot.
    pub fn store_register_bank(&mut self) {
        let rb = usize::from(self.rb);
        if self.traits.family == CpuFamily::V55 {
            for word in 0..2 {
                self.bank[rb][word] = self.sr[7 - word].selector;
            }
        }
        for word in 4..8 {
            self.bank[rb][word] = self.sr[7 - word].selector;
        }
        for word in 8..16 {
            self.bank[rb][word] = self.register_get16(15 - word);
        }
    }

    /// Load the live registers back from the current bank slot.
    pub fn load_register_bank(&mut self) {
        let rb = usize::from(self.rb);
        if self.traits.family == CpuFamily::V55 {
            for word in 0..2 {
                let value = self.bank[rb][word];
                self.segment_load_real_mode(7 - word, value);
            }
        }
        for word in 4..8 {
            let value = self.bank[rb][word];
            self.segment_load_real_mode(7 - word, value);
        }
        for word in 8..16 {
            let value = self.bank[rb][word];
            self.register_set16(15 - word, value);
        }
    }

    /// Changing RB is structural: the outgoing bank is flushed before the
    /// field changes and the incoming bank is loaded after.
    pub fn set_register_bank(&mut self, number: u8) {
        self.store_register_bank();
        self.rb = self.bank_number(number);
        self.load_register_bank();
    }

    // ========== FLAGS, Raw Form ==========

    /// Low byte of the full FLAGS register as interrupt entry/exit and task
    /// switching see it.
    pub fn flags_get8(&self) -> u8 {
        let mut f = 0u8;
        if self.cf {
            f |= flags::CF as u8;
        }
        if self.pf {
            f |= flags::PF as u8;
        }
        if self.af {
            f |= flags::AF as u8;
        }
        if self.zf {
            f |= flags::ZF as u8;
        }
        if self.sf {
            f |= flags::SF as u8;
        }
        match self.traits.family {
            CpuFamily::Upd9002 => f | self.z80_flags,
            CpuFamily::V25 | CpuFamily::Extended => {
                let user = self.iram[sfr::FLAG] & flags::V25_FLAG_MASK;
                f | self.ibrk_bit() | user
            }
            CpuFamily::V55 => f | self.ibrk_bit(),
            _ => f | 0x02,
        }
    }

    fn ibrk_bit(&self) -> u8 {
        if self.ibrk {
            flags::IBRK as u8
        } else {
            0
        }
    }

    pub fn flags_set8(&mut self, value: u8) {
        self.cf = value & flags::CF as u8 != 0;
        if matches!(
            self.traits.family,
            CpuFamily::V25 | CpuFamily::V55 | CpuFamily::Extended
        ) {
            self.ibrk = value & flags::IBRK as u8 != 0;
        }
        self.pf = value & flags::PF as u8 != 0;
        if self.traits.family == CpuFamily::V25 {
            self.iram[sfr::FLAG] = value & flags::V25_FLAG_MASK;
        }
        self.af = value & flags::AF as u8 != 0;
        self.zf = value & flags::ZF as u8 != 0;
        self.sf = value & flags::SF as u8 != 0;
        if self.traits.family == CpuFamily::Upd9002 {
            self.z80_flags = value & flags::Z80_SHADOW_MASK;
        }
    }

    pub fn flags_get16(&self) -> u16 {
        let mut f = u16::from(self.flags_get8());
        if self.tf {
            f |= flags::TF as u16;
        }
        if self.intf {
            f |= flags::IF as u16;
        }
        if self.df {
            f |= flags::DF as u16;
        }
        if self.of {
            f |= flags::OF as u16;
        }
        match self.traits.family {
            CpuFamily::I8086 | CpuFamily::I186 | CpuFamily::V33 | CpuFamily::V60 => f | 0xF000,
            CpuFamily::V20 | CpuFamily::Upd9002 => f | self.md_bit() | 0x7000,
            CpuFamily::V25 => f | (u16::from(self.rb) << flags::RB_SHIFT) | self.md_bit(),
            CpuFamily::V55 => f | (u16::from(self.rb) << flags::RB_SHIFT),
            CpuFamily::Extended => {
                f | (u16::from(self.iopl) << flags::IOPL_SHIFT) | self.nt_bit() | self.md_bit()
            }
            _ => f | (u16::from(self.iopl) << flags::IOPL_SHIFT) | self.nt_bit(),
        }
    }

    fn md_bit(&self) -> u16 {
        if self.md {
            flags::MD as u16
        } else {
            0
        }
    }

    fn nt_bit(&self) -> u16 {
        if self.nt {
            flags::NT as u16
        } else {
            0
        }
    }

    pub fn flags_set16(&mut self, value: u16) {
        // An RB change is a bank switch and must flush/reload around the
        // field update.
        let switch_banks = match self.traits.family {
            CpuFamily::V25 => {
                self.rb != ((value & flags::V25_RB_MASK as u16) >> flags::RB_SHIFT) as u8
            }
            CpuFamily::V55 => {
                self.rb != ((value & flags::V55_RB_MASK as u16) >> flags::RB_SHIFT) as u8
            }
            _ => false,
        };
        if switch_banks {
            self.store_register_bank();
        }

        self.flags_set8(value as u8);
        self.tf = value & flags::TF as u16 != 0;
        self.intf = value & flags::IF as u16 != 0;
        self.df = value & flags::DF as u16 != 0;
        self.of = value & flags::OF as u16 != 0;
        if matches!(
            self.traits.family,
            CpuFamily::V20 | CpuFamily::Upd9002 | CpuFamily::Extended
        ) && self.md_enabled
        {
            // The mode flag is only writable while write-enabled
            self.md = value & flags::MD as u16 != 0;
        }
        match self.traits.family {
            CpuFamily::V25 => {
                self.rb = ((value & flags::V25_RB_MASK as u16) >> flags::RB_SHIFT) as u8;
                if self.traits.subtype == CpuSubtype::V25S {
                    self.md = value & flags::MD as u16 != 0;
                }
            }
            CpuFamily::V55 => {
                self.rb = ((value & flags::V55_RB_MASK as u16) >> flags::RB_SHIFT) as u8;
            }
            family if family >= CpuFamily::I286 => {
                self.iopl = ((value >> flags::IOPL_SHIFT) & 3) as u8;
                self.nt = value & flags::NT as u16 != 0;
            }
            _ => {}
        }

        if switch_banks {
            self.load_register_bank();
        }
    }

    pub fn flags_get32(&self) -> u32 {
        let mut f = u32::from(self.flags_get16());
        if self.rf {
            f |= flags::RF as u32;
        }
        if self.vm && !self.traits.is_32bit_only() {
            f |= flags::VM as u32;
        }
        if self.traits.family >= CpuFamily::I486 && self.ac {
            f |= flags::AC as u32;
        }
        if self.traits.family >= CpuFamily::I586 {
            if self.vif {
                f |= flags::VIF as u32;
            }
            if self.vip {
                f |= flags::VIP as u32;
            }
            if self.idf {
                f |= flags::ID as u32;
            }
        }
        f
    }

    pub fn flags_set32(&mut self, value: u32) {
        self.flags_set16(value as u16);
        self.rf = value & flags::RF as u32 != 0;
        if !self.traits.is_32bit_only() {
            self.vm = value & flags::VM as u32 != 0;
        }
        if self.traits.family >= CpuFamily::I486 {
            self.ac = value & flags::AC as u32 != 0;
        }
        if self.traits.family >= CpuFamily::I586 {
            self.vif = value & flags::VIF as u32 != 0;
            self.vip = value & flags::VIP as u32 != 0;
            self.idf = value & flags::ID as u32 != 0;
        }
    }

    pub fn flags_get64(&self) -> u64 {
        u64::from(self.flags_get32())
    }

    pub fn flags_set64(&mut self, value: u64) {
        self.flags_set32(value as u32);
    }

    // ========== FLAGS, Image Form ==========
    //
    // The image form is what PUSHF/POPF/IRET observe. Reading applies
    // reserved-bit and mode-sensitive masking; writing undoes it and
    // re-inserts the fields the guest is not allowed to change.

    fn flags_update_image8(&self, mut f: u8) -> u8 {
        if self.traits.family == CpuFamily::Upd9002 {
            // The Z80-only N/X3/X5 bits stay hidden from the x86 image to
            // remain V20 compatible; only the alternate bank exposes them.
            f = (f & !flags::Z80_SHADOW_MASK) | 0x02;
        }
        f
    }

    pub fn flags_get_image8(&self) -> u8 {
        self.flags_update_image8(self.flags_get8())
    }

    fn flags_fix_image8(&self, mut f: u8) -> u8 {
        if self.traits.family == CpuFamily::Upd9002 {
            f = (f & !(flags::Z80_SHADOW_MASK | 0x02)) | self.z80_flags;
        }
        f
    }

    pub fn flags_set_image8(&mut self, value: u8) {
        let fixed = self.flags_fix_image8(value);
        self.flags_set8(fixed);
    }

    fn flags_update_image16(&self, f: u16) -> u16 {
        let mut f = (f & !0xFF) | u16::from(self.flags_update_image8(f as u8));
        if self.is_v86_mode() && self.iopl < 3 {
            // V86 with IOPL<3: the guest sees VIF where IF lives and an
            // all-ones IOPL
            if self.vif {
                f |= flags::IF as u16;
            } else {
                f &= !(flags::IF as u16);
            }
            f |= flags::IOPL_MASK as u16;
        }
        f
    }

    pub fn flags_get_image16(&self) -> u16 {
        self.flags_update_image16(self.flags_get16())
    }

    fn flags_fix_image16(&self, f: u16) -> u16 {
        let mut f = (f & !0xFF) | u16::from(self.flags_fix_image8(f as u8));

        if ((self.is_v86_mode() && self.cr[4] & Cr4::VME.bits() != 0) || self.is_protected_mode())
            && self.iopl < self.cpl
        {
            // IF is preserved when the writer lacks I/O privilege
            f = (f & !(flags::IF as u16)) | (u16::from(self.intf) << 9);
        }

        if self.cpl != 0 || (self.traits.family == CpuFamily::I286 && self.is_real_mode()) {
            f = (f & !(flags::IOPL_MASK as u16)) | (u16::from(self.iopl) << flags::IOPL_SHIFT);
        }

        if self.traits.family == CpuFamily::I286 && self.is_real_mode() {
            f = (f & !(flags::NT as u16)) | self.nt_bit();
        }

        match self.traits.family {
            CpuFamily::V25 => {
                f = (f & !(flags::V25_RB_MASK as u16))
                    | ((u16::from(self.rb) << flags::RB_SHIFT) & flags::V25_RB_MASK as u16);
            }
            CpuFamily::V55 => {
                f = (f & !(flags::V55_RB_MASK as u16))
                    | ((u16::from(self.rb) << flags::RB_SHIFT) & flags::V55_RB_MASK as u16);
            }
            _ => {}
        }

        if matches!(
            self.traits.family,
            CpuFamily::V20 | CpuFamily::Upd9002 | CpuFamily::Extended
        ) && !self.md_enabled
        {
            f = (f & !(flags::MD as u16)) | self.md_bit();
        }

        f
    }

    /// Writing the 16-bit image in V8086 mode with VME redirection is
    /// handled by the POPF path in the executor; this applies the plain
    /// masking rules.
    pub fn flags_set_image16(&mut self, value: u16) {
        let fixed = self.flags_fix_image16(value);
        self.flags_set16(fixed);
    }

    fn flags_update_image32(&self, f: u32) -> u32 {
        let mut f = (f & !0xFFFF) | u32::from(self.flags_update_image16(f as u16));
        f &= !(flags::VM as u32);
        f &= !(flags::RF as u32);
        f
    }

    pub fn flags_get_image32(&self) -> u32 {
        self.flags_update_image32(self.flags_get32())
    }

    fn flags_fix_image32(&self, f: u32) -> u32 {
        let mut f = (f & !0xFFFF) | u32::from(self.flags_fix_image16(f as u16));
        f = (f & !(flags::VM as u32)) | (u32::from(self.vm) << 17);
        if self.is_v86_mode() && self.cr[4] & Cr4::VME.bits() != 0 && self.iopl < 3 {
            f = (f & !(flags::VIF as u32)) | (u32::from(self.intf) << 19);
        }
        f = (f & !(flags::VIP as u32)) | (u32::from(self.vip) << 20);
        f
    }

    pub fn flags_set_image32(&mut self, value: u32) {
        let fixed = self.flags_fix_image32(value);
        self.flags_set32(fixed);
    }

    pub fn flags_get_image64(&self) -> u64 {
        u64::from(self.flags_get_image32())
    }

    pub fn flags_set_image64(&mut self, value: u64) {
        self.flags_set_image32(value as u32);
    }

    // ========== Control Registers ==========

    pub fn control_register_get(&mut self, number: usize) -> Fallible<u64> {
        match number {
            0 | 2 | 3 => {
                if self.traits.is_32bit_only() {
                    return Err(Exception::ud());
                }
            }
            4 => {
                if self.traits.family <= CpuFamily::I486 {
                    return Err(Exception::ud());
                }
            }
            8 => {
                if !self.traits.long_mode_supported() {
                    return Err(Exception::ud());
                }
            }
            _ => return Err(Exception::ud()),
        }
        Ok(self.cr[number])
    }

    pub fn control_register_set(&mut self, number: usize, mut value: u64) -> Fallible<()> {
        match number {
            0 => {
                if self.traits.family == CpuFamily::I386 {
                    if self.traits.subtype == CpuSubtype::I376 {
                        value = (value & 0x0000_001F) | 0x0000_0011;
                    } else {
                        value &= 0x8000_001F;
                    }
                } else if !self.traits.long_mode_supported() {
                    value &= 0xE005_003F;
                }

                if self.cr[4] & Cr4::PAE.bits() == 0
                    && self.efer & Efer::LME.bits() != 0
                    && value & Cr0::PG.bits() != 0
                {
                    return Err(Exception::gp(0));
                }
                if (self.is_64bit_mode() || self.cr[4] & Cr4::PCIDE.bits() != 0)
                    && value & Cr0::PG.bits() == 0
                {
                    return Err(Exception::gp(0));
                }
            }
            2 => {
                if self.traits.is_32bit_only() {
                    return Err(Exception::ud());
                }
            }
            3 => {
                if self.traits.family == CpuFamily::I386 {
                    if self.traits.subtype == CpuSubtype::I376 {
                        return Err(Exception::ud());
                    }
                    value &= 0xFFFF_F000;
                } else if self.traits.family == CpuFamily::I486 {
                    value &= 0xFFFF_F018;
                }
            }
            4 => {
                if self.traits.family <= CpuFamily::I486 {
                    return Err(Exception::ud());
                }
                if self.traits.cpuid1.edx & CPUID1_EDX_PAE == 0 {
                    value &= !Cr4::PAE.bits();
                }
                if self.cr[0] & Cr0::PG.bits() != 0
                    && self.efer & Efer::LME.bits() != 0
                    && (value ^ self.cr[4]) & (Cr4::PAE.bits() | Cr4::VA57.bits()) != 0
                {
                    return Err(Exception::gp(0));
                }
            }
            8 => {
                if !self.traits.long_mode_supported() {
                    return Err(Exception::ud());
                }
            }
            _ => return Err(Exception::ud()),
        }

        self.cr[number] = value;

        if number == 0 {
            // LMA tracks PG while LME is armed
            if self.efer & Efer::LME.bits() != 0 && self.cr[0] & Cr0::PG.bits() != 0 {
                self.efer |= Efer::LMA.bits();
            } else {
                self.efer &= !Efer::LMA.bits();
            }
        }
        if number == 0 || number == 3 || number == 4 {
            self.prefetch_queue_flush();
        }
        Ok(())
    }

    // ========== Debug Registers ==========

    pub fn debug_register_get(&mut self, number: usize) -> Fallible<u64> {
        let number = self.debug_register_number(number)?;
        self.debug_register_guard()?;
        Ok(self.dr[number])
    }

    pub fn debug_register_set(&mut self, number: usize, mut value: u64) -> Fallible<()> {
        let number = self.debug_register_number(number)?;
        match number {
            6 => {
                if self.traits.family <= CpuFamily::I486 {
                    value &= 0x0000_F00F;
                } else {
                    value &= 0x0000_E00F;
                }
            }
            7 => {
                if self.traits.is_32bit_only() {
                    value &= 0xFFFF_23FF;
                } else if self.traits.family <= CpuFamily::I486 {
                    value &= 0xFFFF_13FF;
                } else {
                    value &= 0xFFFF_03FF;
                }
            }
            _ => {}
        }
        self.debug_register_guard()?;
        self.dr[number] = value;
        Ok(())
    }

    /// DR4/DR5 alias DR6/DR7 unless CR4.DE promotes them to #UD.
    fn debug_register_number(&self, number: usize) -> Fallible<usize> {
        if number == 4 || number == 5 {
            if self.cr[4] & Cr4::DE.bits() != 0 {
                return Err(Exception::ud());
            }
            Ok(number + 2)
        } else {
            Ok(number)
        }
    }

    /// DR7.GD arms a #DB on any debug register access.
    fn debug_register_guard(&mut self) -> Fallible<()> {
        if self.dr[7] & Dr7::GD.bits() != 0 {
            self.dr[6] |= Dr6::BD.bits();
            return Err(Exception::db_fault());
        }
        Ok(())
    }

    // ========== Test Registers (386/486 era) ==========

    pub fn test_register_get(&mut self, number: usize) -> Fallible<u32> {
        if self.traits.is_32bit_only() {
            return Err(Exception::ud());
        }
        match number {
            3..=5 if self.traits.family < CpuFamily::I486 => Err(Exception::ud()),
            3..=7 => Ok(self.tr386[number]),
            _ => Err(Exception::ud()),
        }
    }

    pub fn test_register_set(&mut self, number: usize, mut value: u32) -> Fallible<()> {
        if self.traits.is_32bit_only() {
            return Err(Exception::ud());
        }
        match number {
            3 | 5 if self.traits.family < CpuFamily::I486 => return Err(Exception::ud()),
            4 => {
                if self.traits.family < CpuFamily::I486 {
                    return Err(Exception::ud());
                }
                value &= 0xFFFF_FFF8;
            }
            6 => value &= 0xFFFF_FFE1,
            7 => {
                if self.traits.family == CpuFamily::I386 {
                    value &= 0xFFFF_001C;
                } else {
                    value &= 0xFFFF_FF9C;
                }
            }
            3 | 5 => {}
            _ => return Err(Exception::ud()),
        }
        self.tr386[number] = value;
        Ok(())
    }

    // ========== Model Specific Registers ==========

    fn msr_is_valid(&self, index: u32) -> bool {
        match index {
            msr::TSC => self.traits.cpuid1.edx & CPUID1_EDX_TSC != 0,
            msr::SYSENTER_CS | msr::SYSENTER_ESP | msr::SYSENTER_EIP => {
                self.traits.cpuid1.edx & CPUID1_EDX_SEP != 0
            }
            msr::BNDCFGS => self.traits.cpuid7_0.ebx & CPUID7_0_EBX_MPX != 0,
            msr::LX_PCR | msr::LX_SMM_CTL | msr::LX_DMI_CTL | msr::LX_SMM_HDR | msr::LX_DMM_HDR
            | msr::LX_SMM_BASE | msr::LX_DMM_BASE => {
                self.traits.family == CpuFamily::Cyrix
                    && self.traits.subtype == CpuSubtype::GeodeLx
            }
            msr::EFER | msr::STAR | msr::LSTAR | msr::CSTAR | msr::FMASK => {
                self.traits.cpuid_ext1.edx & (CPUID_EXT1_EDX_SYSCALL | CPUID_EXT1_EDX_NX | CPUID_EXT1_EDX_LM)
                    != 0
            }
            msr::FS_BASE | msr::GS_BASE | msr::KERNEL_GS_BASE => {
                self.traits.cpuid_ext1.edx & CPUID_EXT1_EDX_LM != 0
            }
            _ => false,
        }
    }

    pub fn msr_get(&mut self, index: u32) -> Fallible<u64> {
        if !self.msr_is_valid(index) {
            return Err(Exception::gp(0));
        }
        Ok(match index {
            msr::TSC => self.tsc,
            msr::SYSENTER_CS => self.sysenter_cs,
            msr::SYSENTER_ESP => self.sysenter_esp,
            msr::SYSENTER_EIP => self.sysenter_eip,
            msr::BNDCFGS => self.bndcfgs,
            msr::LX_PCR => u64::from(self.cyrix.pcr[0]),
            msr::LX_SMM_CTL => u64::from(self.cyrix.smm_ctl),
            msr::LX_DMI_CTL => u64::from(self.cyrix.dmi_ctl),
            msr::LX_SMM_HDR => u64::from(self.cyrix.smm_hdr),
            msr::LX_DMM_HDR => u64::from(self.cyrix.dmm_hdr),
            msr::LX_SMM_BASE => self.smm_region.base | (self.smm_region.limit << 32),
            msr::LX_DMM_BASE => self.dmm_region.base | (self.dmm_region.limit << 32),
            msr::EFER => self.efer,
            msr::STAR => self.star,
            msr::LSTAR => self.lstar,
            msr::CSTAR => self.cstar,
            msr::FMASK => self.fmask,
            msr::FS_BASE => self.sr[seg::FS].base,
            msr::GS_BASE => self.sr[seg::GS].base,
            msr::KERNEL_GS_BASE => self.kernel_gs_base,
            _ => unreachable!(),
        })
    }

    pub fn msr_set(&mut self, index: u32, value: u64) -> Fallible<()> {
        if !self.msr_is_valid(index) {
            return Err(Exception::gp(0));
        }
        match index {
            msr::TSC => self.tsc = value,
            msr::SYSENTER_CS => self.sysenter_cs = value,
            msr::SYSENTER_ESP => {
                self.check_canonical(None, value, 0)?;
                self.sysenter_esp = value;
            }
            msr::SYSENTER_EIP => {
                self.check_canonical(None, value, 0)?;
                self.sysenter_eip = value;
            }
            msr::BNDCFGS => {
                self.check_canonical(None, value, 0)?;
                self.bndcfgs = value;
            }
            msr::LX_PCR => self.cyrix.pcr[0] = value as u8,
            msr::LX_SMM_CTL => self.cyrix.smm_ctl = value as u32,
            msr::LX_DMI_CTL => self.cyrix.dmi_ctl = value as u32,
            msr::LX_SMM_HDR => self.cyrix.smm_hdr = value as u32,
            msr::LX_DMM_HDR => self.cyrix.dmm_hdr = value as u32,
            msr::LX_SMM_BASE => {
                self.smm_region.base = value & 0xFFFF_FFFF;
                self.smm_region.limit = value >> 32;
            }
            msr::LX_DMM_BASE => {
                self.dmm_region.base = value & 0xFFFF_FFFF;
                self.dmm_region.limit = value >> 32;
            }
            msr::EFER => {
                let mut value = value;
                if self.cr[0] & Cr0::PG.bits() != 0
                    && (value ^ self.efer) & Efer::LME.bits() != 0
                {
                    return Err(Exception::gp(0));
                }
                if value & Efer::LME.bits() != 0 && self.cr[0] & Cr0::PG.bits() != 0 {
                    value |= Efer::LMA.bits();
                } else {
                    value &= !Efer::LMA.bits();
                }
                self.efer = value;
                self.prefetch_queue_flush();
            }
            msr::STAR => self.star = value,
            msr::LSTAR => {
                self.check_canonical(None, value, 0)?;
                self.lstar = value;
            }
            msr::CSTAR => self.cstar = value,
            msr::FMASK => self.fmask = value,
            msr::FS_BASE => {
                self.check_canonical(None, value, 0)?;
                self.sr[seg::FS].base = value;
            }
            msr::GS_BASE => {
                self.check_canonical(None, value, 0)?;
                self.sr[seg::GS].base = value;
            }
            msr::KERNEL_GS_BASE => {
                self.check_canonical(None, value, 0)?;
                self.kernel_gs_base = value;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ========== Cyrix Configuration Registers ==========

    /// Whether an index written to port 22h names a register this subtype
    /// exposes under the current MAPEN setting.
    pub fn cyrix_is_register(&self, number: u8, write: bool) -> bool {
        let st = self.traits.subtype;
        let ccr3 = self.cyrix.ccr[3];
        let mapen1 = (ccr3 & CCR3_MAPEN_MASK) >> CCR3_MAPEN_SHIFT == 0x01;
        match number {
            0x20 => {
                (CpuSubtype::Cx5x86 <= st && st <= CpuSubtype::Gx1)
                    || (st == CpuSubtype::CyrixIii && ccr3 & 0xF0 == 0x10)
            }
            0x41 | 0x48 | 0x49 => st == CpuSubtype::CyrixIii && ccr3 & 0xF0 == 0x40,
            0xA4..=0xAF => {
                st == CpuSubtype::CyrixIii && ccr3 & 0x60 == 0x20 && (write || ccr3 & 0x10 != 0)
            }
            0xB0..=0xB3 | 0xB8..=0xBD => CpuSubtype::MediaGx <= st && st <= CpuSubtype::Gx1,
            0xC0 | 0xC5 | 0xC6 | 0xC8 | 0xC9 | 0xCB | 0xCC => {
                st <= CpuSubtype::Cx486Slce || CpuSubtype::Cx6x86 <= st
            }
            0xC1 | 0xCE | 0xCF => true,
            0xC2 | 0xC3 | 0xCD => CpuSubtype::Cx5x86 <= st,
            0xE8 => CpuSubtype::Cx5x86 <= st && st != CpuSubtype::CyrixIii && mapen1,
            0xE9 => CpuSubtype::Cx6x86 <= st && st != CpuSubtype::CyrixIii && mapen1,
            0xC4 | 0xC7 | 0xCA => CpuSubtype::Cx6x86 <= st,
            0xD0..=0xDB => {
                CpuSubtype::Cx6x86 <= st
                    && (st != CpuSubtype::CyrixIii || ccr3 & 0xF0 == 0x10 || ccr3 & 0x60 == 0x20)
            }
            0xDC..=0xE3 => {
                CpuSubtype::Cx6x86 <= st
                    && st != CpuSubtype::CyrixIii
                    && (ccr3 & 0xF0 == 0x10 || ccr3 & 0x60 == 0x20)
            }
            0xEA => CpuSubtype::CxM2 <= st && st != CpuSubtype::CyrixIii && mapen1,
            0xEB => (CpuSubtype::Cx5x86 <= st && st <= CpuSubtype::Gx1) || ccr3 & 0xF0 == 0x10,
            0xF0 => st == CpuSubtype::Cx5x86 || st == CpuSubtype::Gx1,
            0xFB..=0xFD => st == CpuSubtype::CyrixIii && ccr3 & 0xF0 == 0x10,
            0xFE | 0xFF => CpuSubtype::Cx5x86 <= st && st != CpuSubtype::CxM2,
            _ => false,
        }
    }

    /// ARR registers are stored as 24-bit values spread over three index
    /// slots (high, mid, low).
    fn cyrix_arr_alias(&self, arr: usize) -> usize {
        if self.traits.subtype == CpuSubtype::CyrixIii && self.cyrix.ccr[3] & 0x20 != 0 {
            // The Cyrix III remaps ARR4/ARR5 onto ARR12/ARR13 and
            // RCR0..5 onto RCR8..13 under MAPEN bit 1
            match arr {
                4 => 12,
                5 => 13,
                other => other,
            }
        } else {
            arr
        }
    }

    fn cyrix_rcr_alias(&self, rcr: usize) -> usize {
        if self.traits.subtype == CpuSubtype::CyrixIii && self.cyrix.ccr[3] & 0x20 != 0 {
            rcr + 8
        } else {
            rcr
        }
    }

    pub fn cyrix_register_get(&self, number: u8) -> u8 {
        if !self.cyrix_is_register(number, false) {
            return 0;
        }
        let arr_byte = |arr: usize, shift: u32| (self.cyrix.arr[arr] >> shift) as u8;
        match number {
            0x20 => self.cyrix.pcr[0],
            0x41 => self.cyrix.lcr1,
            0x48 => self.cyrix.bcr[0],
            0x49 => self.cyrix.bcr[1],
            0xA4..=0xAF => {
                let n = usize::from(number - 0xA4);
                arr_byte(8 + n / 3, 16 - 8 * (n as u32 % 3))
            }
            0xB0..=0xB3 => (self.cyrix.smm_hdr >> (8 * u32::from(number - 0xB0))) as u8,
            0xB8 => self.cyrix.gcr,
            0xB9 => self.cyrix.vgactl,
            0xBA..=0xBD => (self.cyrix.vgam >> (8 * u32::from(number - 0xBA))) as u8,
            0xC0 => self.cyrix.ccr[0],
            0xC1 => self.cyrix.ccr[1],
            0xC2 => self.cyrix.ccr[2],
            0xC3 => self.cyrix.ccr[3],
            0xC4..=0xCF => {
                let n = usize::from(number - 0xC4);
                arr_byte(n / 3, 16 - 8 * (n as u32 % 3))
            }
            0xD0..=0xDB => {
                let n = usize::from(number - 0xD0);
                arr_byte(self.cyrix_arr_alias(4 + n / 3), 16 - 8 * (n as u32 % 3))
            }
            0xDC..=0xE3 => self.cyrix.rcr[self.cyrix_rcr_alias(usize::from(number - 0xDC))],
            0xE8 => self.cyrix.ccr[4],
            0xE9 => self.cyrix.ccr[5],
            0xEA => self.cyrix.ccr[6],
            0xEB => self.cyrix.ccr[7],
            0xF0 => self.cyrix.pcr[1],
            0xFB => self.cyrix.dir[4],
            0xFC => self.cyrix.dir[3],
            0xFD => self.cyrix.dir[2],
            0xFE => self.cyrix.dir[0],
            0xFF => self.cyrix.dir[1],
            _ => 0,
        }
    }

    pub fn cyrix_register_set(&mut self, number: u8, value: u8) {
        if !self.cyrix_is_register(number, true) {
            return;
        }
        fn set_arr_byte(arr: &mut u32, shift: u32, value: u8) {
            *arr = (*arr & !(0xFF << shift)) | (u32::from(value) << shift);
        }
        match number {
            0x20 => self.cyrix.pcr[0] = value,
            0x41 => self.cyrix.lcr1 = value,
            0x48 => self.cyrix.bcr[0] = value,
            0x49 => self.cyrix.bcr[1] = value,
            0xA4..=0xAF => {
                let n = usize::from(number - 0xA4);
                set_arr_byte(&mut self.cyrix.arr[8 + n / 3], 16 - 8 * (n as u32 % 3), value);
            }
            0xB0..=0xB3 => {
                let shift = 8 * u32::from(number - 0xB0);
                self.cyrix.smm_hdr =
                    (self.cyrix.smm_hdr & !(0xFF << shift)) | (u32::from(value) << shift);
            }
            0xB8 => self.cyrix.gcr = value,
            0xB9 => self.cyrix.vgactl = value,
            0xBA..=0xBD => {
                let shift = 8 * u32::from(number - 0xBA);
                self.cyrix.vgam = (self.cyrix.vgam & !(0xFF << shift)) | (u32::from(value) << shift);
            }
            0xC0 => self.cyrix.ccr[0] = value,
            0xC1 => self.cyrix.ccr[1] = value,
            0xC2 => self.cyrix.ccr[2] = value,
            0xC3 => self.cyrix.ccr[3] = value,
            0xC4..=0xCF => {
                let n = usize::from(number - 0xC4);
                set_arr_byte(&mut self.cyrix.arr[n / 3], 16 - 8 * (n as u32 % 3), value);
            }
            0xD0..=0xDB => {
                let n = usize::from(number - 0xD0);
                let arr = self.cyrix_arr_alias(4 + n / 3);
                set_arr_byte(&mut self.cyrix.arr[arr], 16 - 8 * (n as u32 % 3), value);
            }
            0xDC..=0xE3 => {
                let rcr = self.cyrix_rcr_alias(usize::from(number - 0xDC));
                self.cyrix.rcr[rcr] = value;
            }
            0xE8 => self.cyrix.ccr[4] = value,
            0xE9 => self.cyrix.ccr[5] = value,
            0xEA => self.cyrix.ccr[6] = value,
            0xEB => self.cyrix.ccr[7] = value,
            0xF0 => self.cyrix.pcr[1] = value,
            0xFB => self.cyrix.dir[4] = value,
            0xFC => self.cyrix.dir[3] = value,
            0xFD => self.cyrix.dir[2] = value,
            0xFE => self.cyrix.dir[0] = value,
            0xFF => self.cyrix.dir[1] = value,
            _ => {}
        }
    }

    // ========== 8080/Z80 Register Aliasing ==========

    /// Copy the shared x86 registers into the 8080/Z80 view when entering
    /// emulation mode or delivering an interrupt into it.
    pub fn load_x80_registers(&mut self) {
        let af_bank = self.x80.af_bank;
        let main_bank = self.x80.main_bank;
        self.x80.bank[af_bank].af =
            (u16::from(self.register_get8_low(gpr::AX)) << 8) | u16::from(self.flags_get8());
        self.x80.bank[main_bank].bc = self.register_get16(gpr::CX);
        self.x80.bank[main_bank].de = self.register_get16(gpr::DX);
        self.x80.bank[main_bank].hl = self.register_get16(gpr::BX);
        self.x80.pc = self.xip as u16;
        self.x80.sp = self.register_get16(gpr::BP);
        if self.is_z80() {
            self.x80.ix = self.register_get16(gpr::SI);
            self.x80.iy = self.register_get16(gpr::DI);
            self.x80.iff1 = self.intf;
        }
    }

    /// Copy the 8080/Z80 view back into the shared x86 registers.
    pub fn store_x80_registers(&mut self) {
        if !self.is_emulation_mode() {
            return;
        }
        let af = self.x80.bank[self.x80.af_bank].af;
        self.register_set8_low(gpr::AX, (af >> 8) as u8);
        self.flags_set8(af as u8);
        let bc = self.x80.bank[self.x80.main_bank].bc;
        let de = self.x80.bank[self.x80.main_bank].de;
        let hl = self.x80.bank[self.x80.main_bank].hl;
        self.register_set16(gpr::CX, bc);
        self.register_set16(gpr::DX, de);
        self.register_set16(gpr::BX, hl);
        self.set_xip(u64::from(self.x80.pc));
        let sp = self.x80.sp;
        self.register_set16(gpr::BP, sp);
        if self.is_z80() {
            let (ix, iy, iff1) = (self.x80.ix, self.x80.iy, self.x80.iff1);
            self.register_set16(gpr::SI, ix);
            self.register_set16(gpr::DI, iy);
            self.intf = iff1;
        }
    }

    pub fn is_z80(&self) -> bool {
        matches!(
            self.traits.family,
            CpuFamily::Upd9002 | CpuFamily::Extended
        )
    }

    // ========== NEC Special Function Registers ==========

    pub fn sfr_get(&mut self, bus: &mut dyn crate::bus::Bus, index: usize) -> u8 {
        match self.traits.family {
            CpuFamily::V25 => self.iram[index],
            CpuFamily::V55 => {
                let mut byte = [0u8];
                self.memory_read_no_paging(bus, 0xFFE00 + index as u64, &mut byte);
                byte[0]
            }
            _ => 0,
        }
    }

    pub fn sfr_set(&mut self, bus: &mut dyn crate::bus::Bus, index: usize, value: u8) {
        match self.traits.family {
            CpuFamily::V25 => self.iram[index] = value,
            CpuFamily::V55 => {
                self.memory_write_no_paging(bus, 0xFFE00 + index as u64, &[value]);
            }
            _ => {}
        }
    }

    // ========== FPU Presence ==========

    pub fn fpu_present(&self) -> bool {
        self.x87.fpu_type != FpuType::None
    }
}
