//! CPU model configuration
//!
//! Everything that distinguishes one emulated part from another is frozen
//! into a [`CpuTraits`] value when the instance is created: the family and
//! subtype, the attached FPU, the SMM save-area format, the CPUID images and
//! capability bits, the reset vector, the prefetch queue depth and the
//! linear address mask. Execution paths query this structure instead of
//! carrying family-specific constants of their own.

/// Processor family, ordered roughly by architectural generation so that
/// range comparisons (`family >= CpuFamily::I286`) mirror feature
/// introduction. The NEC parts sit between the 8086 and the 286, matching
/// their 8086-compatible programming model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuFamily {
    /// Intel 8086/8088
    I8086,
    /// Intel 80186/80188 (embedded, with the on-chip peripheral block)
    I186,
    /// NEC V20/V30 (8080 emulation mode)
    V20,
    /// NEC V33/V53 (expanded-address paging)
    V33,
    /// NEC V60/V70 in V20 emulation mode
    V60,
    /// NEC µPD9002 (Z80 emulation mode)
    Upd9002,
    /// NEC V25/V35 (register banks in on-chip RAM)
    V25,
    /// NEC V55 (extended segment registers DS2/DS3)
    V55,
    /// Intel 80286
    I286,
    /// Intel 80386 (and 80376 as a subtype)
    I386,
    /// Intel 80486
    I486,
    /// Intel Pentium
    I586,
    /// Intel P6 and later 32-bit Intel cores
    P6,
    /// Cyrix 486SLC through Geode lines
    Cyrix,
    /// AMD K5 through K8
    Amd,
    /// Intel64-class 64-bit core
    Intel64,
    /// Superset pseudo-model used for testing every feature at once
    Extended,
}

/// Family refinement where one die differs from its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CpuSubtype {
    #[default]
    Classic,
    /// Intel 80376: 32-bit only embedded 386, no real mode
    I376,
    /// NEC V25 with the software-guard opcode translation table
    V25S,
    // Cyrix line, ordered by generation: gating of the configuration
    // registers depends on range checks over these.
    Cx486Slc,
    Cx486Slce,
    Cx5x86,
    MediaGx,
    Gxm,
    Gx1,
    Gx2,
    GeodeLx,
    Cx6x86,
    CxM2,
    CyrixIii,
}

/// Attached floating point unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FpuType {
    #[default]
    None,
    /// Intel 8087: out-of-band IRQ signalling, true coprocessor bus
    I8087,
    /// Intel 80287: protected-mode aware, #MP segment overruns
    I287,
    /// Intel 80387
    I387,
    /// IIT 3C87: four register banks and FSBP bank select
    Iit,
    /// On-die FPU, 486DX and later
    Integrated,
}

/// System management mode save-area format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmmFormat {
    #[default]
    None,
    I80386Sl,
    P5,
    P6,
    P4,
    K5,
    K6,
    Amd64,
    Cx486Slce,
    Cx5x86,
    CxM2,
    MediaGx,
    Gx2,
}

/// One CPUID leaf image.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuidLeaf {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidLeaf {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

// CPUID feature bits the core itself consults.
pub const CPUID1_EDX_FPU: u32 = 1 << 0;
pub const CPUID1_EDX_VME: u32 = 1 << 1;
pub const CPUID1_EDX_PSE: u32 = 1 << 3;
pub const CPUID1_EDX_TSC: u32 = 1 << 4;
pub const CPUID1_EDX_MSR: u32 = 1 << 5;
pub const CPUID1_EDX_PAE: u32 = 1 << 6;
pub const CPUID1_EDX_CX8: u32 = 1 << 8;
pub const CPUID1_EDX_SEP: u32 = 1 << 11;
pub const CPUID1_EDX_PGE: u32 = 1 << 13;
pub const CPUID1_EDX_CMOV: u32 = 1 << 15;
pub const CPUID1_EDX_MMX: u32 = 1 << 23;
pub const CPUID1_EDX_FXSR: u32 = 1 << 24;
pub const CPUID1_EDX_SSE: u32 = 1 << 25;
pub const CPUID1_EDX_SSE2: u32 = 1 << 26;

pub const CPUID7_0_EBX_MPX: u32 = 1 << 14;
pub const CPUID7_0_ECX_VA57: u32 = 1 << 16;
pub const CPUID7_0_ECX_CET_SS: u32 = 1 << 7;

pub const CPUID_EXT1_EDX_SYSCALL: u32 = 1 << 11;
pub const CPUID_EXT1_EDX_NX: u32 = 1 << 20;
pub const CPUID_EXT1_EDX_LM: u32 = 1 << 29;

pub const CPUID_EXT31_EAX_SEV_ES: u32 = 1 << 3;

/// Immutable per-instance capability structure.
#[derive(Debug, Clone)]
pub struct CpuTraits {
    pub family: CpuFamily,
    pub subtype: CpuSubtype,
    pub fpu_type: FpuType,
    pub smm_format: SmmFormat,

    /// Instruction prefetch queue depth in bytes (4 on the 8088-class
    /// parts, 6 on the 8086/186, larger on later cores).
    pub prefetch_queue_size: usize,
    /// Whether 0F 1F multi-byte NOPs decode as NOP instead of #UD.
    pub multibyte_nop: bool,
    /// V25S software-guard opcode scrambling table, identity by default.
    pub opcode_translation: Option<Box<[u8; 256]>>,

    pub cpuid0: CpuidLeaf,
    pub cpuid1: CpuidLeaf,
    pub cpuid7_0: CpuidLeaf,
    pub cpuid7_1: CpuidLeaf,
    pub cpuid_ext0: CpuidLeaf,
    pub cpuid_ext1: CpuidLeaf,
    pub cpuid_ext31: CpuidLeaf,
}

impl CpuTraits {
    /// Build the traits for a family/subtype pair with its architecturally
    /// defined defaults. Hosts may edit the CPUID images afterwards.
    pub fn new(family: CpuFamily, subtype: CpuSubtype) -> Self {
        let mut traits = Self {
            family,
            subtype,
            fpu_type: FpuType::None,
            smm_format: SmmFormat::None,
            prefetch_queue_size: match family {
                CpuFamily::I8086 | CpuFamily::V20 | CpuFamily::Upd9002 => 6,
                CpuFamily::I186 | CpuFamily::V33 | CpuFamily::V60 => 6,
                CpuFamily::V25 | CpuFamily::V55 => 8,
                CpuFamily::I286 => 6,
                CpuFamily::I386 => 16,
                _ => 32,
            },
            multibyte_nop: false,
            opcode_translation: None,
            cpuid0: CpuidLeaf::default(),
            cpuid1: CpuidLeaf::default(),
            cpuid7_0: CpuidLeaf::default(),
            cpuid7_1: CpuidLeaf::default(),
            cpuid_ext0: CpuidLeaf::default(),
            cpuid_ext1: CpuidLeaf::default(),
            cpuid_ext31: CpuidLeaf::default(),
        };

        match family {
            CpuFamily::I586 => {
                traits.cpuid0 = CpuidLeaf::new(1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69);
                traits.cpuid1.eax = 0x0521;
                traits.cpuid1.edx = CPUID1_EDX_FPU
                    | CPUID1_EDX_VME
                    | CPUID1_EDX_PSE
                    | CPUID1_EDX_TSC
                    | CPUID1_EDX_MSR
                    | CPUID1_EDX_CX8;
                traits.smm_format = SmmFormat::P5;
                traits.fpu_type = FpuType::Integrated;
            }
            CpuFamily::P6 => {
                traits.cpuid0 = CpuidLeaf::new(2, 0x756E_6547, 0x6C65_746E, 0x4965_6E69);
                traits.cpuid1.eax = 0x0611;
                traits.cpuid1.edx = CPUID1_EDX_FPU
                    | CPUID1_EDX_VME
                    | CPUID1_EDX_PSE
                    | CPUID1_EDX_TSC
                    | CPUID1_EDX_MSR
                    | CPUID1_EDX_PAE
                    | CPUID1_EDX_CX8
                    | CPUID1_EDX_SEP
                    | CPUID1_EDX_PGE
                    | CPUID1_EDX_CMOV;
                traits.smm_format = SmmFormat::P6;
                traits.fpu_type = FpuType::Integrated;
            }
            CpuFamily::Amd => {
                traits.cpuid0 = CpuidLeaf::new(1, 0x6874_7541, 0x444D_4163, 0x6974_6E65);
                traits.cpuid1.eax = 0x0500;
                traits.cpuid1.edx = CPUID1_EDX_FPU
                    | CPUID1_EDX_VME
                    | CPUID1_EDX_PSE
                    | CPUID1_EDX_TSC
                    | CPUID1_EDX_MSR
                    | CPUID1_EDX_CX8;
                traits.cpuid_ext0.eax = 0x8000_0001;
                traits.cpuid_ext1.edx = CPUID_EXT1_EDX_SYSCALL;
                traits.smm_format = SmmFormat::K5;
                traits.fpu_type = FpuType::Integrated;
            }
            CpuFamily::Intel64 | CpuFamily::Extended => {
                traits.cpuid0 = CpuidLeaf::new(7, 0x756E_6547, 0x6C65_746E, 0x4965_6E69);
                traits.cpuid1.eax = 0x0F41;
                traits.cpuid1.edx = CPUID1_EDX_FPU
                    | CPUID1_EDX_VME
                    | CPUID1_EDX_PSE
                    | CPUID1_EDX_TSC
                    | CPUID1_EDX_MSR
                    | CPUID1_EDX_PAE
                    | CPUID1_EDX_CX8
                    | CPUID1_EDX_SEP
                    | CPUID1_EDX_PGE
                    | CPUID1_EDX_CMOV
                    | CPUID1_EDX_MMX
                    | CPUID1_EDX_FXSR
                    | CPUID1_EDX_SSE
                    | CPUID1_EDX_SSE2;
                traits.cpuid_ext0.eax = 0x8000_0008;
                traits.cpuid_ext1.edx = CPUID_EXT1_EDX_SYSCALL | CPUID_EXT1_EDX_NX | CPUID_EXT1_EDX_LM;
                traits.multibyte_nop = true;
                traits.smm_format = SmmFormat::Amd64;
                traits.fpu_type = FpuType::Integrated;
            }
            CpuFamily::Cyrix => {
                traits.smm_format = match subtype {
                    CpuSubtype::Cx486Slce => SmmFormat::Cx486Slce,
                    CpuSubtype::Cx5x86 => SmmFormat::Cx5x86,
                    CpuSubtype::CxM2 | CpuSubtype::Cx6x86 | CpuSubtype::CyrixIii => SmmFormat::CxM2,
                    CpuSubtype::MediaGx | CpuSubtype::Gxm | CpuSubtype::Gx1 => SmmFormat::MediaGx,
                    CpuSubtype::Gx2 | CpuSubtype::GeodeLx => SmmFormat::Gx2,
                    _ => SmmFormat::None,
                };
            }
            CpuFamily::I486 => {
                traits.fpu_type = FpuType::Integrated;
            }
            CpuFamily::V25 if subtype == CpuSubtype::V25S => {
                let mut table = Box::new([0u8; 256]);
                for (i, entry) in table.iter_mut().enumerate() {
                    *entry = i as u8;
                }
                traits.opcode_translation = Some(table);
            }
            _ => {}
        }

        traits
    }

    // ========== Capability Queries ==========

    /// True for the parts that only decode 16-bit operands and reject the
    /// 0x66/0x67 size override prefixes.
    pub fn is_16bit_only(&self) -> bool {
        self.family < CpuFamily::I386
    }

    /// The 80376 has no real mode and powers up in protected mode.
    pub fn is_32bit_only(&self) -> bool {
        self.family == CpuFamily::I386 && self.subtype == CpuSubtype::I376
    }

    pub fn long_mode_supported(&self) -> bool {
        self.cpuid_ext1.edx & CPUID_EXT1_EDX_LM != 0
    }

    pub fn is_intel64(&self) -> bool {
        self.family == CpuFamily::Intel64
    }

    /// Parts whose segmented addresses wrap inside a 64 KiB segment.
    pub fn wraps_segments(&self) -> bool {
        matches!(
            self.family,
            CpuFamily::I8086 | CpuFamily::V20 | CpuFamily::V33 | CpuFamily::V60 | CpuFamily::Upd9002
        )
    }

    /// Parts that carry an 8080/Z80 emulation mode.
    pub fn has_x80_mode(&self) -> bool {
        matches!(
            self.family,
            CpuFamily::V20 | CpuFamily::Upd9002 | CpuFamily::Extended
        )
    }

    /// Linear address mask after segmentation, before paging.
    pub fn memory_mask(&self) -> u64 {
        if self.family < CpuFamily::V55 || self.family == CpuFamily::I186 {
            0x000F_FFFF
        } else if self.family < CpuFamily::I386 {
            0x00FF_FFFF
        } else if !self.long_mode_supported() {
            0xFFFF_FFFF
        } else {
            u64::MAX
        }
    }

    /// Number of architectural general registers (APX-class parts expose
    /// 32, everything else 16 or 8; the register file is always allocated
    /// at the maximum).
    pub fn gpr_count(&self) -> usize {
        if self.family == CpuFamily::Extended {
            32
        } else if self.long_mode_supported() {
            16
        } else {
            8
        }
    }

    /// Reset value of CS:xIP and the CS base, per family.
    pub fn reset_vector(&self) -> (u16, u64, u64) {
        if self.family < CpuFamily::I286 {
            // selector, base, xip
            (0xFFFF, 0x000F_FFF0, 0x0000)
        } else if self.family < CpuFamily::I386 {
            (0xF000, 0x00FF_0000, 0xFFF0)
        } else {
            (0xF000, 0xFFFF_0000, 0xFFF0)
        }
    }

    pub fn has_cpuid(&self) -> bool {
        self.cpuid0.eax != 0 || self.cpuid0.ebx != 0
    }
}
