//! Soft 80-bit extended precision floats
//!
//! The register format is carried as an explicit (fraction, biased
//! exponent, sign) triple so the 10-byte memory image is bit-exact on any
//! host. Addition, subtraction, multiplication and division are computed
//! over 128-bit intermediates with round-to-nearest-even (or the rounding
//! control the caller passes); the transcendental helpers go through f64,
//! which matches the precision the interpreter promises for them.
//!
//! The fraction keeps the explicit integer bit of the extended format:
//! normal numbers have bit 63 set.

use core::cmp::Ordering;

/// Exponent bias of the extended format.
pub const BIAS: i32 = 16383;
const EXP_MAX: u16 = 0x7FFF;

/// Rounding control (x87 CW bits 10-11, MXCSR bits 13-14).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    #[default]
    Nearest,
    Down,
    Up,
    Zero,
}

impl Rounding {
    pub fn from_cw(cw: u16) -> Self {
        match (cw >> 10) & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Zero,
        }
    }
}

/// Precision control (x87 CW bits 8-9): how many fraction bits survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Single,
    Double,
    #[default]
    Extended,
}

impl Precision {
    pub fn from_cw(cw: u16) -> Self {
        match (cw >> 8) & 3 {
            0 => Precision::Single,
            2 => Precision::Double,
            _ => Precision::Extended,
        }
    }

    fn bits(self) -> u32 {
        match self {
            Precision::Single => 24,
            Precision::Double => 53,
            Precision::Extended => 64,
        }
    }
}

/// Value classification as FXAM sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Zero,
    Denormal,
    Normal,
    Infinity,
    Nan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Float80 {
    pub fraction: u64,
    pub exponent: u16,
    pub sign: bool,
}

impl Float80 {
    pub const fn from_parts(fraction: u64, exponent: u16, sign: bool) -> Self {
        Self { fraction, exponent, sign }
    }

    pub const fn to_parts(self) -> (u64, u16, bool) {
        (self.fraction, self.exponent, self.sign)
    }

    pub const fn zero(sign: bool) -> Self {
        Self { fraction: 0, exponent: 0, sign }
    }

    pub const fn one() -> Self {
        Self { fraction: 0x8000_0000_0000_0000, exponent: BIAS as u16, sign: false }
    }

    pub const fn infinity(sign: bool) -> Self {
        Self { fraction: 0x8000_0000_0000_0000, exponent: EXP_MAX, sign }
    }

    /// The x87 "indefinite" quiet NaN produced by invalid operations.
    pub const fn indefinite() -> Self {
        Self { fraction: 0xC000_0000_0000_0000, exponent: EXP_MAX, sign: true }
    }

    // Architectural constants (FLDPI and friends), at full 64-bit
    // precision.
    pub const PI: Self = Self::from_parts(0xC90F_DAA2_2168_C235, 0x4000, false);
    pub const L2T: Self = Self::from_parts(0xD49A_784B_CD1B_8AFE, 0x4000, false);
    pub const L2E: Self = Self::from_parts(0xB8AA_3B29_5C17_F0BC, 0x3FFF, false);
    pub const LG2: Self = Self::from_parts(0x9A20_9A84_FBCF_F799, 0x3FFD, false);
    pub const LN2: Self = Self::from_parts(0xB172_17F7_D1CF_79AC, 0x3FFE, false);

    pub fn classify(self) -> Class {
        if self.exponent == EXP_MAX {
            if self.fraction << 1 == 0 {
                Class::Infinity
            } else {
                Class::Nan
            }
        } else if self.exponent == 0 {
            if self.fraction == 0 {
                Class::Zero
            } else {
                Class::Denormal
            }
        } else if self.fraction & 0x8000_0000_0000_0000 == 0 {
            // unnormal: integer bit clear with a non-zero exponent; treated
            // as invalid on 387+ but classified as denormal here
            Class::Denormal
        } else {
            Class::Normal
        }
    }

    pub fn is_nan(self) -> bool {
        self.classify() == Class::Nan
    }

    pub fn is_zero(self) -> bool {
        self.classify() == Class::Zero
    }

    pub fn is_infinity(self) -> bool {
        self.classify() == Class::Infinity
    }

    /// Signaling NaNs carry a clear top fraction bit (below the integer
    /// bit).
    pub fn is_signaling_nan(self) -> bool {
        self.is_nan() && self.fraction & 0x4000_0000_0000_0000 == 0
    }

    fn quieted(mut self) -> Self {
        self.fraction |= 0x4000_0000_0000_0000;
        self
    }

    // ========== Conversions ==========

    pub fn from_f64(value: f64) -> Self {
        let bits = value.to_bits();
        let sign = bits >> 63 != 0;
        let exponent = ((bits >> 52) & 0x7FF) as i32;
        let fraction = bits & 0x000F_FFFF_FFFF_FFFF;
        if exponent == 0x7FF {
            if fraction == 0 {
                return Self::infinity(sign);
            }
            return Self { fraction: 0x8000_0000_0000_0000 | (fraction << 11), exponent: EXP_MAX, sign }
                .quieted();
        }
        if exponent == 0 {
            if fraction == 0 {
                return Self::zero(sign);
            }
            // normalize the f64 denormal into the extended format
            let shift = fraction.leading_zeros() - 11;
            return Self {
                fraction: fraction << (shift + 11),
                exponent: (BIAS - 1022 - shift as i32) as u16,
                sign,
            };
        }
        Self {
            fraction: 0x8000_0000_0000_0000 | (fraction << 11),
            exponent: (exponent - 1023 + BIAS) as u16,
            sign,
        }
    }

    pub fn to_f64(self) -> f64 {
        match self.classify() {
            Class::Zero => {
                if self.sign {
                    -0.0
                } else {
                    0.0
                }
            }
            Class::Infinity => {
                if self.sign {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                }
            }
            Class::Nan => f64::NAN,
            _ => {
                let e = i32::from(self.exponent) - BIAS;
                let mantissa = self.fraction as f64 / 2f64.powi(63);
                let value = mantissa * 2f64.powi(e);
                if self.sign {
                    -value
                } else {
                    value
                }
            }
        }
    }

    pub fn from_f32(value: f32) -> Self {
        Self::from_f64(f64::from(value))
    }

    pub fn to_f32(self, rounding: Rounding) -> f32 {
        // round through the precision restriction first so double rounding
        // cannot widen the result
        let restricted = self.round_precision(Precision::Single, rounding);
        restricted.to_f64() as f32
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            return Self::zero(false);
        }
        let sign = value < 0;
        let magnitude = value.unsigned_abs();
        let shift = magnitude.leading_zeros();
        Self {
            fraction: magnitude << shift,
            exponent: (BIAS + 63 - shift as i32) as u16,
            sign,
        }
    }

    pub fn from_u64(value: u64) -> Self {
        if value == 0 {
            return Self::zero(false);
        }
        let shift = value.leading_zeros();
        Self {
            fraction: value << shift,
            exponent: (BIAS + 63 - shift as i32) as u16,
            sign: false,
        }
    }

    /// Convert to a signed integer; `None` on overflow or NaN (the caller
    /// stores the integer indefinite).
    pub fn to_i64(self, rounding: Rounding) -> Option<i64> {
        match self.classify() {
            Class::Zero => return Some(0),
            Class::Infinity | Class::Nan => return None,
            _ => {}
        }
        let rounded = self.round_to_integer(rounding);
        let e = i32::from(rounded.exponent) - BIAS;
        if e < 0 {
            return Some(0);
        }
        if e > 63 {
            return None;
        }
        let magnitude = rounded.fraction >> (63 - e);
        if rounded.sign {
            if magnitude > 0x8000_0000_0000_0000 {
                None
            } else {
                Some(magnitude.wrapping_neg() as i64)
            }
        } else if magnitude > i64::MAX as u64 {
            None
        } else {
            Some(magnitude as i64)
        }
    }

    /// FRNDINT: round to an integral value, keeping the extended format.
    pub fn round_to_integer(self, rounding: Rounding) -> Self {
        match self.classify() {
            Class::Zero | Class::Infinity | Class::Nan => return self,
            _ => {}
        }
        let e = i32::from(self.exponent) - BIAS;
        if e >= 63 {
            return self;
        }
        if e < 0 {
            // magnitude below 1: the result is 0 or ±1; exactly 0.5 rounds
            // to even zero under nearest
            let rounds_away = match rounding {
                Rounding::Nearest => e == -1 && self.fraction > 0x8000_0000_0000_0000,
                Rounding::Down => self.sign,
                Rounding::Up => !self.sign,
                Rounding::Zero => false,
            };
            return if rounds_away {
                Self { fraction: 0x8000_0000_0000_0000, exponent: BIAS as u16, sign: self.sign }
            } else {
                Self::zero(self.sign)
            };
        }
        let keep = 63 - e as u32;
        let magnitude = self.fraction >> keep;
        let remainder = self.fraction & ((1u64 << keep) - 1);
        let half = 1u64 << (keep - 1);
        let mut magnitude = magnitude;
        let round_up = match rounding {
            Rounding::Nearest => {
                remainder > half || (remainder == half && magnitude & 1 != 0)
            }
            Rounding::Down => self.sign && remainder != 0,
            Rounding::Up => !self.sign && remainder != 0,
            Rounding::Zero => false,
        };
        if round_up {
            magnitude += 1;
        }
        if magnitude == 0 {
            return Self::zero(self.sign);
        }
        let shift = magnitude.leading_zeros();
        Self {
            fraction: magnitude << shift,
            exponent: (BIAS + 63 - shift as i32) as u16,
            sign: self.sign,
        }
    }

    // ========== Rounding Infrastructure ==========

    /// Build a value from a sign, unbiased exponent of the top intermediate
    /// bit, and a 128-bit intermediate, rounding to `bits` of precision.
    fn round_from_wide(sign: bool, mut exponent: i32, mut wide: u128, bits: u32, rounding: Rounding) -> Self {
        if wide == 0 {
            return Self::zero(sign);
        }
        // normalize so the top bit sits at position 127
        let lz = wide.leading_zeros();
        wide <<= lz;
        exponent -= lz as i32;

        let keep = 128 - bits;
        let mut magnitude = (wide >> keep) as u64;
        let remainder = wide & ((1u128 << keep) - 1);
        let half = 1u128 << (keep - 1);
        let round_up = match rounding {
            Rounding::Nearest => remainder > half || (remainder == half && magnitude & 1 != 0),
            Rounding::Down => sign && remainder != 0,
            Rounding::Up => !sign && remainder != 0,
            Rounding::Zero => false,
        };
        if round_up {
            magnitude += 1;
            if magnitude >> (bits.min(63)) != 0 && bits < 64 || (bits == 64 && magnitude == 0) {
                // carried out of the precision; renormalize
                if bits == 64 {
                    magnitude = 0x8000_0000_0000_0000;
                } else {
                    magnitude >>= 1;
                }
                exponent += 1;
            }
        }
        // position the fraction with the integer bit at 63
        let fraction = magnitude << (64 - bits);

        let biased = exponent + BIAS;
        if biased >= i32::from(EXP_MAX) {
            return match rounding {
                Rounding::Zero => Self {
                    fraction: u64::MAX << (64 - bits),
                    exponent: EXP_MAX - 1,
                    sign,
                },
                Rounding::Down if !sign => Self {
                    fraction: u64::MAX << (64 - bits),
                    exponent: EXP_MAX - 1,
                    sign,
                },
                Rounding::Up if sign => Self {
                    fraction: u64::MAX << (64 - bits),
                    exponent: EXP_MAX - 1,
                    sign,
                },
                _ => Self::infinity(sign),
            };
        }
        if biased <= 0 {
            // flush into the denormal range
            let shift = 1 - biased;
            if shift >= 64 {
                return Self::zero(sign);
            }
            return Self { fraction: fraction >> shift, exponent: 0, sign };
        }
        Self { fraction, exponent: biased as u16, sign }
    }

    /// Re-round an extended value to the control word's precision.
    pub fn round_precision(self, precision: Precision, rounding: Rounding) -> Self {
        if precision == Precision::Extended {
            return self;
        }
        match self.classify() {
            Class::Zero | Class::Infinity | Class::Nan => return self,
            _ => {}
        }
        let exponent = i32::from(self.exponent) - BIAS;
        Self::round_from_wide(
            self.sign,
            exponent,
            (self.fraction as u128) << 64,
            precision.bits(),
            rounding,
        )
    }

    // ========== Arithmetic ==========

    /// Effective (fraction aligned at bit 127, unbiased exponent) view.
    fn widen(self) -> (i32, u128) {
        let exponent = if self.exponent == 0 {
            1 - BIAS
        } else {
            i32::from(self.exponent) - BIAS
        };
        (exponent, (self.fraction as u128) << 64)
    }

    pub fn add(self, other: Self, precision: Precision, rounding: Rounding) -> Self {
        if self.is_nan() || other.is_nan() {
            return if self.is_nan() { self.quieted() } else { other.quieted() };
        }
        match (self.is_infinity(), other.is_infinity()) {
            (true, true) => {
                if self.sign != other.sign {
                    return Self::indefinite();
                }
                return self;
            }
            (true, false) => return self,
            (false, true) => return other,
            _ => {}
        }
        if self.is_zero() && other.is_zero() {
            let sign = if self.sign == other.sign {
                self.sign
            } else {
                rounding == Rounding::Down
            };
            return Self::zero(sign);
        }
        if self.is_zero() {
            return other.round_precision(precision, rounding);
        }
        if other.is_zero() {
            return self.round_precision(precision, rounding);
        }

        let (ea, wa) = self.widen();
        let (eb, wb) = other.widen();
        // align to the larger magnitude, with 3 guard positions at the
        // bottom for the rounding decision
        let (eh, wh, sh, el, wl, sl) = if (ea, wa) >= (eb, wb) {
            (ea, wa, self.sign, eb, wb, other.sign)
        } else {
            (eb, wb, other.sign, ea, wa, self.sign)
        };
        let shift = (eh - el) as u32;
        let wh = wh >> 3;
        let wl = if shift >= 125 {
            u128::from(wl != 0) // pure sticky remnant
        } else {
            let shifted = (wl >> 3) >> shift;
            let sticky = shift > 0 && (wl >> 3) << (128 - shift) != 0;
            shifted | u128::from(sticky)
        };

        if sh == sl {
            Self::round_from_wide(sh, eh + 3, wh + wl, precision.bits(), rounding)
        } else {
            let diff = wh - wl; // wh holds the larger magnitude
            if diff == 0 {
                Self::zero(rounding == Rounding::Down)
            } else {
                Self::round_from_wide(sh, eh + 3, diff, precision.bits(), rounding)
            }
        }
    }

    pub fn sub(self, other: Self, precision: Precision, rounding: Rounding) -> Self {
        let mut negated = other;
        if !other.is_nan() {
            negated.sign = !other.sign;
        }
        self.add(negated, precision, rounding)
    }

    pub fn mul(self, other: Self, precision: Precision, rounding: Rounding) -> Self {
        if self.is_nan() || other.is_nan() {
            return if self.is_nan() { self.quieted() } else { other.quieted() };
        }
        let sign = self.sign ^ other.sign;
        if self.is_infinity() || other.is_infinity() {
            if self.is_zero() || other.is_zero() {
                return Self::indefinite();
            }
            return Self::infinity(sign);
        }
        if self.is_zero() || other.is_zero() {
            return Self::zero(sign);
        }
        let (ea, _) = self.widen();
        let (eb, _) = other.widen();
        let product = u128::from(self.fraction) * u128::from(other.fraction);
        // fraction product of two 1.63 values is a 2.126 value; the top bit
        // of the 128-bit product corresponds to exponent ea+eb+1
        Self::round_from_wide(sign, ea + eb + 1, product, precision.bits(), rounding)
    }

    pub fn div(self, other: Self, precision: Precision, rounding: Rounding) -> Self {
        if self.is_nan() || other.is_nan() {
            return if self.is_nan() { self.quieted() } else { other.quieted() };
        }
        let sign = self.sign ^ other.sign;
        if self.is_infinity() {
            if other.is_infinity() {
                return Self::indefinite();
            }
            return Self::infinity(sign);
        }
        if other.is_infinity() {
            return Self::zero(sign);
        }
        if other.is_zero() {
            if self.is_zero() {
                return Self::indefinite();
            }
            return Self::infinity(sign);
        }
        if self.is_zero() {
            return Self::zero(sign);
        }

        let (ea, _) = self.widen();
        let (eb, _) = other.widen();
        // long division: numerator shifted to 127 bits, 64 quotient bits
        // plus 2 guard bits
        let mut remainder = u128::from(self.fraction) << 63;
        let divisor = u128::from(other.fraction);
        let mut quotient: u128 = remainder / divisor;
        remainder %= divisor;
        // two extra bits for rounding, one sticky
        for _ in 0..2 {
            remainder <<= 1;
            quotient <<= 1;
            if remainder >= divisor {
                remainder -= divisor;
                quotient |= 1;
            }
        }
        if remainder != 0 {
            quotient |= 1; // sticky
        }
        // the quotient field carries the real value scaled by 2^(65-ea+eb),
        // so bit 127 corresponds to exponent ea-eb+62
        Self::round_from_wide(sign, ea - eb + 62, quotient, precision.bits(), rounding)
    }

    /// Partial remainder with truncating quotient (FPREM semantics). The
    /// low three quotient bits feed C0/C3/C1.
    pub fn rem(self, other: Self) -> (Self, u8, bool) {
        if self.is_nan() || other.is_nan() || self.is_infinity() || other.is_zero() {
            return (Self::indefinite(), 0, true);
        }
        if self.is_zero() || other.is_infinity() {
            return (self, 0, true);
        }
        let a = self.to_f64().abs();
        let b = other.to_f64().abs();
        let q = (a / b).trunc();
        let r = a - q * b;
        let mut result = Self::from_f64(r);
        result.sign = self.sign;
        (result, (q as u64 & 7) as u8, true)
    }

    pub fn sqrt(self, precision: Precision, rounding: Rounding) -> Self {
        if self.is_nan() {
            return self.quieted();
        }
        if self.is_zero() {
            return self;
        }
        if self.sign {
            return Self::indefinite();
        }
        if self.is_infinity() {
            return self;
        }
        Self::from_f64(self.to_f64().sqrt()).round_precision(precision, rounding)
    }

    pub fn abs(mut self) -> Self {
        self.sign = false;
        self
    }

    pub fn neg(mut self) -> Self {
        self.sign = !self.sign;
        self
    }

    /// FSCALE: add the truncated integer part of `scale` to the exponent.
    pub fn scale(self, scale: Self) -> Self {
        match self.classify() {
            Class::Zero | Class::Infinity | Class::Nan => return self,
            _ => {}
        }
        let n = scale.to_i64(Rounding::Zero).unwrap_or(i64::MAX >> 1);
        let exponent = i32::from(self.exponent) - BIAS + n.clamp(-0x10000, 0x10000) as i32;
        let biased = exponent + BIAS;
        if biased >= i32::from(EXP_MAX) {
            return Self::infinity(self.sign);
        }
        if biased <= 0 {
            let shift = 1 - biased;
            if shift >= 64 {
                return Self::zero(self.sign);
            }
            return Self { fraction: self.fraction >> shift, exponent: 0, sign: self.sign };
        }
        Self { fraction: self.fraction, exponent: biased as u16, sign: self.sign }
    }

    /// FXTRACT: split into exponent (as a float) and significand.
    pub fn extract(self) -> (Self, Self) {
        match self.classify() {
            Class::Zero => (Self::infinity(true), self),
            Class::Infinity | Class::Nan => (self, self),
            _ => {
                let e = i32::from(self.exponent) - BIAS;
                let exponent_value = Self::from_i64(i64::from(e));
                let significand = Self {
                    fraction: self.fraction,
                    exponent: BIAS as u16,
                    sign: self.sign,
                };
                (exponent_value, significand)
            }
        }
    }

    pub fn compare(self, other: Self) -> Option<Ordering> {
        if self.is_nan() || other.is_nan() {
            return None;
        }
        if self.is_zero() && other.is_zero() {
            return Some(Ordering::Equal);
        }
        if self.sign != other.sign {
            return Some(if self.sign { Ordering::Less } else { Ordering::Greater });
        }
        let magnitude = (self.exponent, self.fraction).cmp(&(other.exponent, other.fraction));
        Some(if self.sign { magnitude.reverse() } else { magnitude })
    }

    // ========== Packed BCD ==========

    /// 10-byte packed decimal: 18 digits, sign in the top byte.
    pub fn to_packed80(self) -> [u8; 10] {
        let mut bytes = [0u8; 10];
        let value = self.to_i64(Rounding::Nearest).unwrap_or(0);
        let mut magnitude = value.unsigned_abs();
        for slot in bytes.iter_mut().take(9) {
            let low = (magnitude % 10) as u8;
            magnitude /= 10;
            let high = (magnitude % 10) as u8;
            magnitude /= 10;
            *slot = (high << 4) | low;
        }
        if self.sign {
            bytes[9] = 0x80;
        }
        bytes
    }

    pub fn from_packed80(bytes: &[u8; 10]) -> Self {
        let mut value: u64 = 0;
        for &byte in bytes[..9].iter().rev() {
            value = value * 10 + u64::from(byte >> 4);
            value = value * 10 + u64::from(byte & 0x0F);
        }
        let mut result = Self::from_u64(value);
        result.sign = bytes[9] & 0x80 != 0;
        result
    }

    // ========== Transcendental Helpers ==========
    //
    // Computed through f64; the interpreter does not promise more
    // precision for the transcendental group.

    pub fn f2xm1(self) -> Self {
        Self::from_f64(self.to_f64().exp2() - 1.0)
    }

    pub fn yl2x(self, y: Self) -> Self {
        Self::from_f64(y.to_f64() * self.to_f64().log2())
    }

    pub fn yl2xp1(self, y: Self) -> Self {
        Self::from_f64(y.to_f64() * (self.to_f64() + 1.0).ln() / core::f64::consts::LN_2)
    }

    pub fn tan(self) -> Self {
        Self::from_f64(self.to_f64().tan())
    }

    pub fn atan2(self, other: Self) -> Self {
        Self::from_f64(self.to_f64().atan2(other.to_f64()))
    }

    pub fn sin(self) -> Self {
        Self::from_f64(self.to_f64().sin())
    }

    pub fn cos(self) -> Self {
        Self::from_f64(self.to_f64().cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f64_round_trip() {
        for value in [0.0, 1.0, -1.0, 0.5, 3.141592653589793, 1e300, -1e-300, 123456.789] {
            let converted = Float80::from_f64(value);
            assert_eq!(converted.to_f64(), value, "round trip of {value}");
        }
    }

    #[test]
    fn test_one_representation() {
        let one = Float80::from_f64(1.0);
        assert_eq!(one, Float80::one());
    }

    #[test]
    fn test_integer_conversions() {
        for value in [0i64, 1, -1, 42, -123456789, i64::MAX / 2] {
            let converted = Float80::from_i64(value);
            assert_eq!(converted.to_i64(Rounding::Nearest), Some(value));
        }
    }

    #[test]
    fn test_add_exact() {
        let a = Float80::from_i64(3);
        let b = Float80::from_i64(4);
        let sum = a.add(b, Precision::Extended, Rounding::Nearest);
        assert_eq!(sum.to_i64(Rounding::Nearest), Some(7));

        let diff = a.sub(b, Precision::Extended, Rounding::Nearest);
        assert_eq!(diff.to_i64(Rounding::Nearest), Some(-1));
    }

    #[test]
    fn test_mul_div_exact() {
        let a = Float80::from_i64(6);
        let b = Float80::from_i64(7);
        let product = a.mul(b, Precision::Extended, Rounding::Nearest);
        assert_eq!(product.to_i64(Rounding::Nearest), Some(42));

        let quotient = product.div(b, Precision::Extended, Rounding::Nearest);
        assert_eq!(quotient.to_i64(Rounding::Nearest), Some(6));

        let third = Float80::one().div(
            Float80::from_i64(3),
            Precision::Extended,
            Rounding::Nearest,
        );
        let back = third.mul(Float80::from_i64(3), Precision::Extended, Rounding::Nearest);
        // 1/3 * 3 rounds back to 1 at 64-bit precision
        assert_eq!(back.to_f64(), 1.0);
    }

    #[test]
    fn test_division_by_zero() {
        let one = Float80::one();
        let result = one.div(Float80::zero(false), Precision::Extended, Rounding::Nearest);
        assert!(result.is_infinity());
        assert!(!result.sign);
    }

    #[test]
    fn test_compare() {
        let small = Float80::from_i64(-5);
        let big = Float80::from_i64(17);
        assert_eq!(small.compare(big), Some(Ordering::Less));
        assert_eq!(big.compare(big), Some(Ordering::Equal));
        assert_eq!(big.compare(Float80::indefinite()), None);
    }

    #[test]
    fn test_packed_bcd_round_trip() {
        for value in [0i64, 1, -1, 987654321, -123456789012345678] {
            let converted = Float80::from_i64(value);
            let packed = converted.to_packed80();
            let back = Float80::from_packed80(&packed);
            assert_eq!(back.to_i64(Rounding::Nearest), Some(value));
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(Float80::zero(true).classify(), Class::Zero);
        assert_eq!(Float80::one().classify(), Class::Normal);
        assert_eq!(Float80::infinity(false).classify(), Class::Infinity);
        assert_eq!(Float80::indefinite().classify(), Class::Nan);
        assert_eq!(Float80::PI.classify(), Class::Normal);
    }
}
