//! FLAGS bit positions
//!
//! Bit positions in the 16/32/64-bit FLAGS image. The core keeps the flags
//! decomposed into discrete fields; these constants are only used when the
//! image form is composed or decomposed (PUSHF/POPF/IRET, stack frames,
//! TSS and SMM images).
//!
//! Layout per family (Intel mnemonics where they exist):
//!
//! ```text
//!         21  20  19  18  17  16  15  14  13  12  11  10  9   8   7   6   5   4   3   2   1     0
//! 8086    -   -   -   -   -   -   1   1   1   1   OF  DF  IF  TF  SF  ZF  0   AF  0   PF  1     CF
//! V20     -   -   -   -   -   -   MD  1   1   1   OF  DF  IF  TF  SF  ZF  0   AF  0   PF  1     CF
//! µPD9002 -   -   -   -   -   -   MD  1   1   1   OF  DF  IF  TF  SF  ZF  X5  AF  X3  PF  NF    CF
//! V25     -   -   -   -   -   -   MD  [RB       ] OF  DF  IF  TF  SF  ZF  F1  AF  F0  PF  ^IBRK CF
//! V55     -   -   -   -   -   -   [RB           ] OF  DF  IF  TF  SF  ZF  0   AF  0   PF  ^IBRK CF
//! 286     -   -   -   -   -   -   0   NT  [IOPL ] OF  DF  IF  TF  SF  ZF  0   AF  0   PF  1     CF
//! 386     0   0   0   0   VM  RF  0   NT  [IOPL ] OF  DF  IF  TF  SF  ZF  0   AF  0   PF  1     CF
//! 486     0   0   0   AC  VM  RF  0   NT  [IOPL ] OF  DF  IF  TF  SF  ZF  0   AF  0   PF  1     CF
//! 586     ID  VIP VIF AC  VM  RF  0   NT  [IOPL ] OF  DF  IF  TF  SF  ZF  0   AF  0   PF  1     CF
//! ```

/// Carry flag (bit 0)
pub const CF: u64 = 1 << 0;
/// Bit 1: reads as 1 on Intel parts, inverted IBRK on V25/V55, Z80 N in
/// the µPD9002 shadow byte
pub const IBRK: u64 = 1 << 1;
/// Parity flag (bit 2)
pub const PF: u64 = 1 << 2;
/// Bit 3: zero on Intel parts, V25 F0, Z80 X3 shadow
pub const F0: u64 = 1 << 3;
/// Auxiliary carry flag (bit 4)
pub const AF: u64 = 1 << 4;
/// Bit 5: zero on Intel parts, V25 F1, Z80 X5 shadow
pub const F1: u64 = 1 << 5;
/// Zero flag (bit 6)
pub const ZF: u64 = 1 << 6;
/// Sign flag (bit 7)
pub const SF: u64 = 1 << 7;
/// Trap flag (bit 8)
pub const TF: u64 = 1 << 8;
/// Interrupt enable flag (bit 9)
pub const IF: u64 = 1 << 9;
/// Direction flag (bit 10)
pub const DF: u64 = 1 << 10;
/// Overflow flag (bit 11)
pub const OF: u64 = 1 << 11;
/// I/O privilege level (bits 12-13, 286+)
pub const IOPL_SHIFT: u32 = 12;
pub const IOPL_MASK: u64 = 3 << IOPL_SHIFT;
/// Nested task (bit 14, 286+)
pub const NT: u64 = 1 << 14;
/// V20/µPD9002 native mode flag (bit 15); also the top of the V25/V55
/// register bank field
pub const MD: u64 = 1 << 15;
/// Register bank select (V25: bits 12-14, V55: bits 12-15)
pub const RB_SHIFT: u32 = 12;
pub const V25_RB_MASK: u64 = 7 << RB_SHIFT;
pub const V55_RB_MASK: u64 = 0xF << RB_SHIFT;
/// Resume flag (bit 16, 386+)
pub const RF: u64 = 1 << 16;
/// Virtual 8086 mode (bit 17, 386+)
pub const VM: u64 = 1 << 17;
/// Alignment check (bit 18, 486+)
pub const AC: u64 = 1 << 18;
/// Virtual interrupt flag (bit 19, 586+)
pub const VIF: u64 = 1 << 19;
/// Virtual interrupt pending (bit 20, 586+)
pub const VIP: u64 = 1 << 20;
/// CPUID available (bit 21, 586+)
pub const ID: u64 = 1 << 21;

/// V25 F0/F1 bits kept in the FLAG special function register.
pub const V25_FLAG_MASK: u8 = (F0 | F1) as u8;
/// µPD9002 Z80-only shadow bits: N, X3, X5.
pub const Z80_SHADOW_MASK: u8 = 0x2A;
