//! Arithmetic flag invariants.
//!
//! The 8-bit add/sub flag rules are checked exhaustively over all
//! 2^8 x 2^8 input pairs against a straightforward reference model;
//! the wider sizes are covered by property tests.

use proptest::prelude::*;
use x86_core::traits::{CpuFamily, CpuSubtype, CpuTraits};
use x86_core::{Cpu, OpSize};

fn cpu() -> Cpu {
    Cpu::new(CpuTraits::new(CpuFamily::I386, CpuSubtype::Classic))
}

fn reference_parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}

#[test]
fn test_add8_flags_exhaustive() {
    let mut cpu = cpu();
    for x in 0..=255u16 {
        for y in 0..=255u16 {
            let result = cpu.alu_add(OpSize::Byte, u64::from(x), u64::from(y), false);
            let wide = x + y;
            assert_eq!(result, u64::from(wide as u8), "{x}+{y}");
            assert_eq!(cpu.cf, wide > 0xFF, "CF of {x}+{y}");
            assert_eq!(cpu.zf, wide as u8 == 0, "ZF of {x}+{y}");
            assert_eq!(cpu.sf, wide & 0x80 != 0, "SF of {x}+{y}");
            assert_eq!(cpu.pf, reference_parity(wide as u8), "PF of {x}+{y}");
            assert_eq!(
                cpu.af,
                (x & 0x0F) + (y & 0x0F) > 0x0F,
                "AF of {x}+{y}"
            );
            let signed = i16::from(x as u8 as i8) + i16::from(y as u8 as i8);
            assert_eq!(cpu.of, signed < -128 || signed > 127, "OF of {x}+{y}");
        }
    }
}

#[test]
fn test_sub8_flags_exhaustive() {
    let mut cpu = cpu();
    for x in 0..=255i16 {
        for y in 0..=255i16 {
            let result = cpu.alu_sub(OpSize::Byte, x as u64, y as u64, false);
            assert_eq!(result, (x - y) as u8 as u64, "{x}-{y}");
            assert_eq!(cpu.cf, x < y, "CF of {x}-{y}");
            assert_eq!(cpu.zf, x == y, "ZF of {x}-{y}");
            assert_eq!(
                cpu.af,
                (x & 0x0F) < (y & 0x0F),
                "AF of {x}-{y}"
            );
            let signed = i16::from(x as u8 as i8) - i16::from(y as u8 as i8);
            assert_eq!(cpu.of, signed < -128 || signed > 127, "OF of {x}-{y}");
        }
    }
}

#[test]
fn test_add8_with_carry_in_exhaustive() {
    let mut cpu = cpu();
    for x in 0..=255u16 {
        for y in 0..=255u16 {
            let result = cpu.alu_add(OpSize::Byte, u64::from(x), u64::from(y), true);
            let wide = x + y + 1;
            assert_eq!(result, u64::from(wide as u8));
            assert_eq!(cpu.cf, wide > 0xFF);
        }
    }
}

proptest! {
    #[test]
    fn prop_add16_matches_wide_arithmetic(x: u16, y: u16) {
        let mut cpu = cpu();
        let result = cpu.alu_add(OpSize::Word, u64::from(x), u64::from(y), false);
        let wide = u32::from(x) + u32::from(y);
        prop_assert_eq!(result, u64::from(wide as u16));
        prop_assert_eq!(cpu.cf, wide > 0xFFFF);
        prop_assert_eq!(cpu.zf, wide as u16 == 0);
        prop_assert_eq!(cpu.sf, wide & 0x8000 != 0);
        prop_assert_eq!(cpu.pf, reference_parity(wide as u8));
        let signed = i32::from(x as i16) + i32::from(y as i16);
        prop_assert_eq!(cpu.of, signed < -0x8000 || signed > 0x7FFF);
    }

    #[test]
    fn prop_sub32_matches_wide_arithmetic(x: u32, y: u32) {
        let mut cpu = cpu();
        let result = cpu.alu_sub(OpSize::Dword, u64::from(x), u64::from(y), false);
        prop_assert_eq!(result, u64::from(x.wrapping_sub(y)));
        prop_assert_eq!(cpu.cf, x < y);
        prop_assert_eq!(cpu.zf, x == y);
        let signed = i64::from(x as i32) - i64::from(y as i32);
        prop_assert_eq!(cpu.of, signed < -0x8000_0000 || signed > 0x7FFF_FFFF);
    }

    #[test]
    fn prop_add64_carry(x: u64, y: u64) {
        let mut cpu = cpu();
        let result = cpu.alu_add(OpSize::Qword, x, y, false);
        let (wide, carry) = x.overflowing_add(y);
        prop_assert_eq!(result, wide);
        prop_assert_eq!(cpu.cf, carry);
        prop_assert_eq!(cpu.zf, wide == 0);
        prop_assert_eq!(cpu.sf, wide & (1 << 63) != 0);
    }

    #[test]
    fn prop_sbb_symmetry(x: u8, y: u8, borrow: bool) {
        let mut cpu = cpu();
        let result = cpu.alu_sub(OpSize::Byte, u64::from(x), u64::from(y), borrow);
        let wide = i32::from(x) - i32::from(y) - i32::from(borrow);
        prop_assert_eq!(result, u64::from(wide as u8));
        prop_assert_eq!(cpu.cf, wide < 0);
    }

    #[test]
    fn prop_logic_clears_carry_overflow(x: u32, y: u32) {
        let mut cpu = cpu();
        cpu.cf = true;
        cpu.of = true;
        cpu.alu_logic_flags(OpSize::Dword, u64::from(x & y));
        prop_assert!(!cpu.cf);
        prop_assert!(!cpu.of);
        prop_assert_eq!(cpu.zf, x & y == 0);
    }

    #[test]
    fn prop_inc_dec_preserve_carry(x: u32, carry: bool) {
        let mut cpu = cpu();
        cpu.cf = carry;
        cpu.alu_inc(OpSize::Dword, u64::from(x));
        prop_assert_eq!(cpu.cf, carry);
        cpu.alu_dec(OpSize::Dword, u64::from(x));
        prop_assert_eq!(cpu.cf, carry);
    }
}
