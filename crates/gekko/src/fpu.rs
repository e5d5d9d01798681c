//! Floating point classification and rounding.

use crate::regs::FloatRounding;

/// Class of a floating point result, as stored in the FPRF field of FPSCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FloatClass {
    QuietNan         = 0x11,
    NegativeInfinity = 0x09,
    NegativeNormal   = 0x08,
    NegativeDenormal = 0x18,
    NegativeZero     = 0x12,
    PositiveZero     = 0x02,
    PositiveDenormal = 0x14,
    PositiveNormal   = 0x04,
    PositiveInfinity = 0x05,
}

impl FloatClass {
    /// The FPRF value of this class.
    #[inline(always)]
    pub const fn fprf(self) -> u32 {
        self as u32
    }

    #[inline(always)]
    const fn pick(negative: bool, if_negative: Self, if_positive: Self) -> Self {
        if negative { if_negative } else { if_positive }
    }

    /// Classifies a double. Signaling NaNs are classified as quiet ones.
    pub const fn of_double(value: f64) -> Self {
        const EXP: u64 = 0x7FF0_0000_0000_0000;
        const FRAC: u64 = 0x000F_FFFF_FFFF_FFFF;

        let bits = value.to_bits();
        let negative = bits >> 63 != 0;
        let exp = bits & EXP;
        let frac = bits & FRAC;

        if exp != 0 && exp != EXP {
            return Self::pick(negative, Self::NegativeNormal, Self::PositiveNormal);
        }

        if frac != 0 {
            if exp != 0 {
                return Self::QuietNan;
            }

            return Self::pick(negative, Self::NegativeDenormal, Self::PositiveDenormal);
        }

        if exp != 0 {
            Self::pick(negative, Self::NegativeInfinity, Self::PositiveInfinity)
        } else {
            Self::pick(negative, Self::NegativeZero, Self::PositiveZero)
        }
    }

    /// Classifies a single. Signaling NaNs are classified as quiet ones.
    pub const fn of_single(value: f32) -> Self {
        const EXP: u32 = 0x7F80_0000;
        const FRAC: u32 = 0x007F_FFFF;

        let bits = value.to_bits();
        let negative = bits >> 31 != 0;
        let exp = bits & EXP;
        let frac = bits & FRAC;

        if exp != 0 && exp != EXP {
            return Self::pick(negative, Self::NegativeNormal, Self::PositiveNormal);
        }

        if frac != 0 {
            if exp != 0 {
                return Self::QuietNan;
            }

            return Self::pick(negative, Self::NegativeDenormal, Self::PositiveDenormal);
        }

        if exp != 0 {
            Self::pick(negative, Self::NegativeInfinity, Self::PositiveInfinity)
        } else {
            Self::pick(negative, Self::NegativeZero, Self::PositiveZero)
        }
    }
}

/// Moves a finite, non-zero single one ULP towards positive infinity (`up`) or negative
/// infinity.
fn step_single(value: f32, up: bool) -> f32 {
    let bits = value.to_bits();
    let away_from_zero = up != value.is_sign_negative();
    if value == 0.0 {
        let tiny = f32::from_bits(1);
        return if up { tiny } else { -tiny };
    }

    f32::from_bits(if away_from_zero { bits + 1 } else { bits - 1 })
}

/// Rounds a double to single precision using the given rounding mode.
pub fn round_to_single(value: f64, rounding: FloatRounding) -> f32 {
    let nearest = value as f32;
    if value.is_nan() || nearest.is_infinite() && value.is_infinite() {
        return nearest;
    }

    let exact = nearest as f64 == value;
    if exact || rounding == FloatRounding::Nearest {
        return nearest;
    }

    let rounded_up = (nearest as f64) > value;
    match rounding {
        FloatRounding::Nearest => nearest,
        FloatRounding::TowardsZero => {
            if (nearest as f64).abs() > value.abs() {
                step_single(nearest, value < 0.0)
            } else {
                nearest
            }
        }
        FloatRounding::TowardsPosInf => {
            if rounded_up {
                nearest
            } else {
                step_single(nearest, true)
            }
        }
        FloatRounding::TowardsNegInf => {
            if rounded_up {
                step_single(nearest, false)
            } else {
                nearest
            }
        }
    }
}

/// Widens the bits of a single into the bits of a double, the way `lfs` does. Unlike an `as`
/// conversion, signaling NaNs stay signaling.
pub const fn single_to_double_bits(value: u32) -> u64 {
    let x = value as u64;
    let exp = (x >> 23) & 0xFF;
    let mut frac = x & 0x007F_FFFF;

    if exp == 0 && frac != 0 {
        // denormal single, normal double
        let mut exp = 1023 - 126;
        while frac & 0x0080_0000 == 0 {
            frac <<= 1;
            exp -= 1;
        }

        return ((x & 0x8000_0000) << 32) | (exp << 52) | ((frac & 0x007F_FFFF) << 29);
    }

    let y = if exp > 0 && exp < 255 {
        (exp >> 7) ^ 1
    } else {
        exp >> 7
    };

    let z = (y << 61) | (y << 60) | (y << 59);
    ((x & 0xC000_0000) << 32) | z | ((x & 0x3FFF_FFFF) << 29)
}

/// Narrows the bits of a double into the bits of a single, the way `stfs` does: by truncation,
/// denormalizing values below the single range.
pub const fn double_to_single_bits(value: u64) -> u32 {
    const SIGN: u64 = 1 << 63;
    const FRAC: u64 = 0x000F_FFFF_FFFF_FFFF;

    let exp = ((value >> 52) & 0x7FF) as u32;
    if exp >= 874 && exp <= 896 && value & !SIGN != 0 {
        let mut t = (0x8000_0000 | ((value & FRAC) >> 21)) as u32;
        t >>= 905 - exp;
        t |= ((value >> 32) & 0x8000_0000) as u32;
        return t;
    }

    (((value >> 32) & 0xC000_0000) | ((value >> 29) & 0x3FFF_FFFF)) as u32
}

/// Flushes a denormal double to a zero of the same sign.
#[inline(always)]
pub fn flush_denormal(value: f64) -> f64 {
    if value.is_subnormal() {
        if value.is_sign_negative() { -0.0 } else { 0.0 }
    } else {
        value
    }
}
