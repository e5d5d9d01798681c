use cpucore::system::System;
use gekko::disasm::Ins;
use gekko::fpu::{flush_denormal, round_to_single};
use gekko::regs::FloatRounding;
use gekko::{FloatControlReg, InsExt};

// FPSCR bits
const FX: u32 = 1 << 31;
const OX_TO_VXVC: u32 = 0x1FF8_0000;
const ZX: u32 = 1 << 26;
const XX: u32 = 1 << 25;
const VXSNAN: u32 = 1 << 24;
const VXISI: u32 = 1 << 23;
const VXIDI: u32 = 1 << 22;
const VXZDZ: u32 = 1 << 21;
const VXIMZ: u32 = 1 << 20;
const VXVC: u32 = 1 << 19;
const FR: u32 = 1 << 18;
const FI: u32 = 1 << 17;
const VXSOFT_TO_VXCVI: u32 = 0x0000_0700;
const VXCVI: u32 = 1 << 8;

const EXCEPTION_BITS: u32 = OX_TO_VXVC | VXSOFT_TO_VXCVI;
const INVALID_BITS: u32 = VXSNAN | VXISI | VXIDI | VXZDZ | VXIMZ | VXVC | VXSOFT_TO_VXCVI;

const DEFAULT_NAN: u64 = 0x7FF8_0000_0000_0000;
const QUIET_BIT: u64 = 1 << 51;
const SIGN_BIT: u64 = 1 << 63;

// floating point condition codes
const FL: u32 = 0b1000;
const FG: u32 = 0b0100;
const FE: u32 = 0b0010;
const FU: u32 = 0b0001;

/// Sets exception bits in FPSCR, setting FX if any of them was previously clear.
fn set_exception(sys: &mut System, mask: u32) {
    let bits = sys.cpu.fpscr.to_bits();
    let mut updated = bits | mask;
    if bits & mask != mask {
        updated |= FX;
    }

    sys.cpu.fpscr = FloatControlReg::from_bits(updated);
    sys.cpu.fpscr.update_summaries();
}

#[inline(always)]
fn is_snan(value: f64) -> bool {
    value.is_nan() && value.to_bits() & QUIET_BIT == 0
}

#[inline(always)]
fn quiet(value: f64) -> f64 {
    f64::from_bits(value.to_bits() | QUIET_BIT)
}

/// Truncates the mantissa of the multiplier of a single precision multiply to 25 bits, rounding
/// to nearest on the way.
#[inline(always)]
fn force_25bit(value: f64) -> f64 {
    let bits = value.to_bits();
    f64::from_bits((bits & 0xFFFF_FFFF_F800_0000).wrapping_add(bits & 0x0800_0000))
}

#[inline(always)]
fn operand(sys: &System, index: usize) -> f64 {
    sys.cpu.ps[index].ps0_as_double()
}

/// The value of an arithmetic operation along with the exceptions it raised.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    value: f64,
    exception: u32,
}

impl Outcome {
    /// Whether the result reaches the target register. Enabled invalid operation and zero
    /// divide exceptions suppress it.
    fn writable(&self, fpscr: FloatControlReg) -> bool {
        let invalid = self.exception & INVALID_BITS != 0 && fpscr.invalid_exception_enabled();
        let zero_divide = self.exception & ZX != 0 && fpscr.zero_divide_exception_enabled();

        !invalid && !zero_divide
    }
}

/// Resolves a NaN result: the first NaN operand propagates quieted, otherwise the operation was
/// invalid and produces the default NaN.
fn resolve(sys: &mut System, value: f64, operands: &[f64], invalid: u32) -> Outcome {
    if !value.is_nan() {
        return Outcome {
            value,
            exception: 0,
        };
    }

    let mut exception = 0;
    if operands.iter().any(|op| is_snan(*op)) {
        exception |= VXSNAN;
    }

    let value = match operands.iter().find(|op| op.is_nan()) {
        Some(nan) => quiet(*nan),
        None => {
            exception |= invalid;
            f64::from_bits(DEFAULT_NAN)
        }
    };

    if exception != 0 {
        set_exception(sys, exception);
    }

    Outcome { value, exception }
}

fn add(sys: &mut System, a: f64, b: f64) -> Outcome {
    resolve(sys, a + b, &[a, b], VXISI)
}

fn sub(sys: &mut System, a: f64, b: f64) -> Outcome {
    resolve(sys, a - b, &[a, b], VXISI)
}

fn mul(sys: &mut System, a: f64, c: f64) -> Outcome {
    resolve(sys, a * c, &[a, c], VXIMZ)
}

fn div(sys: &mut System, a: f64, b: f64) -> Outcome {
    let value = a / b;
    if value.is_infinite() && b == 0.0 {
        set_exception(sys, ZX);
        return Outcome {
            value,
            exception: ZX,
        };
    }

    let invalid = if b == 0.0 { VXZDZ } else { VXIDI };
    resolve(sys, value, &[a, b], invalid)
}

/// `a * c ± b`, fused.
fn madd(sys: &mut System, a: f64, c: f64, b: f64, subtract: bool) -> Outcome {
    let addend = if subtract { -b } else { b };
    let value = a.mul_add(c, addend);
    let invalid = if (a * c).is_nan() { VXIMZ } else { VXISI };

    resolve(sys, value, &[a, b, c], invalid)
}

fn write_double(sys: &mut System, ins: Ins, outcome: Outcome, negate: bool) {
    if outcome.writable(sys.cpu.fpscr) {
        let mut value = outcome.value;
        if sys.cpu.fp_env.flush_denormals {
            value = flush_denormal(value);
        }

        if negate && !value.is_nan() {
            value = -value;
        }

        sys.cpu.ps[ins.fpr_d()].set_ps0(value);
        sys.cpu.update_fprf_double(value);
    }

    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

fn write_single(sys: &mut System, ins: Ins, outcome: Outcome, negate: bool) {
    if outcome.writable(sys.cpu.fpscr) {
        let mut value = round_to_single(outcome.value, sys.cpu.fp_env.rounding);
        if sys.cpu.fp_env.flush_denormals && value.is_subnormal() {
            value = if value.is_sign_negative() { -0.0 } else { 0.0 };
        }

        if negate && !value.is_nan() {
            value = -value;
        }

        sys.cpu.ps[ins.fpr_d()].fill(value as f64);
        sys.cpu.update_fprf_single(value);
    }

    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

pub fn fadd(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());
    let outcome = add(sys, a, b);
    write_double(sys, ins, outcome, false);
}

pub fn fadds(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());
    let outcome = add(sys, a, b);
    write_single(sys, ins, outcome, false);
}

pub fn fsub(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());
    let outcome = sub(sys, a, b);
    write_double(sys, ins, outcome, false);
}

pub fn fsubs(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());
    let outcome = sub(sys, a, b);
    write_single(sys, ins, outcome, false);
}

pub fn fmul(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let c = operand(sys, ins.fpr_c());
    let outcome = mul(sys, a, c);
    write_double(sys, ins, outcome, false);
}

pub fn fmuls(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let c = force_25bit(operand(sys, ins.fpr_c()));
    let outcome = mul(sys, a, c);
    write_single(sys, ins, outcome, false);
}

pub fn fdiv(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());
    let outcome = div(sys, a, b);
    write_double(sys, ins, outcome, false);
}

pub fn fdivs(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());
    let outcome = div(sys, a, b);
    write_single(sys, ins, outcome, false);
}

macro_rules! fused {
    ($($name:ident => $write:ident, single: $single:literal, subtract: $subtract:literal, negate: $negate:literal;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                let a = operand(sys, ins.fpr_a());
                let b = operand(sys, ins.fpr_b());
                let c = operand(sys, ins.fpr_c());
                let c = if $single { force_25bit(c) } else { c };

                let outcome = madd(sys, a, c, b, $subtract);
                $write(sys, ins, outcome, $negate);
            }
        )*
    };
}

fused! {
    fmadd   => write_double, single: false, subtract: false, negate: false;
    fmadds  => write_single, single: true, subtract: false, negate: false;
    fmsub   => write_double, single: false, subtract: true, negate: false;
    fmsubs  => write_single, single: true, subtract: true, negate: false;
    fnmadd  => write_double, single: false, subtract: false, negate: true;
    fnmadds => write_single, single: true, subtract: false, negate: true;
    fnmsub  => write_double, single: false, subtract: true, negate: true;
    fnmsubs => write_single, single: true, subtract: true, negate: true;
}

macro_rules! sign_ops {
    ($($name:ident => |$bits:ident| $expr:expr;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                let $bits = sys.cpu.ps[ins.fpr_b()].ps0;
                sys.cpu.ps[ins.fpr_d()].ps0 = $expr;

                if ins.field_rc() {
                    sys.cpu.update_cr1();
                }
            }
        )*
    };
}

sign_ops! {
    fmr   => |bits| bits;
    fneg  => |bits| bits ^ SIGN_BIT;
    fabs  => |bits| bits & !SIGN_BIT;
    fnabs => |bits| bits | SIGN_BIT;
}

pub fn fsel(sys: &mut System, ins: Ins) {
    let a = operand(sys, ins.fpr_a());
    let selected = if a >= 0.0 {
        sys.cpu.ps[ins.fpr_c()].ps0
    } else {
        sys.cpu.ps[ins.fpr_b()].ps0
    };

    sys.cpu.ps[ins.fpr_d()].ps0 = selected;
    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

pub fn frsp(sys: &mut System, ins: Ins) {
    let b = operand(sys, ins.fpr_b());
    let rounded = round_to_single(b, sys.cpu.fp_env.rounding);

    let snan = is_snan(b);
    if snan {
        set_exception(sys, VXSNAN);
    }

    if !snan || !sys.cpu.fpscr.invalid_exception_enabled() {
        sys.cpu.ps[ins.fpr_d()].fill(rounded as f64);
        sys.cpu.update_fprf_single(rounded);
    }

    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

fn convert_to_integer(sys: &mut System, ins: Ins, rounding: FloatRounding) {
    let b = operand(sys, ins.fpr_b());

    let (value, invalid) = if b.is_nan() {
        let mut exception = VXCVI;
        if is_snan(b) {
            exception |= VXSNAN;
        }

        set_exception(sys, exception);
        (0x8000_0000, true)
    } else if b > i32::MAX as f64 {
        set_exception(sys, VXCVI);
        (0x7FFF_FFFF, true)
    } else if b < i32::MIN as f64 {
        set_exception(sys, VXCVI);
        (0x8000_0000, true)
    } else {
        let rounded = match rounding {
            FloatRounding::Nearest => b.round_ties_even(),
            FloatRounding::TowardsZero => b.trunc(),
            FloatRounding::TowardsPosInf => b.ceil(),
            FloatRounding::TowardsNegInf => b.floor(),
        };

        let value = rounded as i32;

        let mut fpscr = sys.cpu.fpscr.to_bits() & !(FR | FI);
        if rounded != b {
            fpscr |= FI;
            if rounded.abs() > b.abs() {
                fpscr |= FR;
            }
        }

        sys.cpu.fpscr = FloatControlReg::from_bits(fpscr);
        if rounded != b {
            set_exception(sys, XX);
        }

        (value as u32, false)
    };

    if !invalid || !sys.cpu.fpscr.invalid_exception_enabled() {
        let mut result = 0xFFF8_0000_0000_0000 | value as u64;
        if value == 0 && b.is_sign_negative() {
            result |= 1 << 32;
        }

        sys.cpu.ps[ins.fpr_d()].ps0 = result;
    }

    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

pub fn fctiw(sys: &mut System, ins: Ins) {
    let rounding = sys.cpu.fpscr.rounding();
    convert_to_integer(sys, ins, rounding);
}

pub fn fctiwz(sys: &mut System, ins: Ins) {
    convert_to_integer(sys, ins, FloatRounding::TowardsZero);
}

fn compare(sys: &mut System, ins: Ins, ordered: bool) {
    let a = operand(sys, ins.fpr_a());
    let b = operand(sys, ins.fpr_b());

    let code = if a.is_nan() || b.is_nan() {
        let snan = is_snan(a) || is_snan(b);
        if snan {
            set_exception(sys, VXSNAN);
        }

        if ordered && (!snan || !sys.cpu.fpscr.invalid_exception_enabled()) {
            set_exception(sys, VXVC);
        }

        FU
    } else if a < b {
        FL
    } else if a > b {
        FG
    } else {
        FE
    };

    let fprf = (sys.cpu.fpscr.fprf() & !0xF) | code;
    sys.cpu.fpscr.set_fprf(fprf);
    sys.cpu.cr.set_field(ins.field_crfd() as usize, code);
}

pub fn fcmpu(sys: &mut System, ins: Ins) {
    compare(sys, ins, false);
}

pub fn fcmpo(sys: &mut System, ins: Ins) {
    compare(sys, ins, true);
}

pub fn mffs(sys: &mut System, ins: Ins) {
    sys.cpu.ps[ins.fpr_d()].ps0 = 0xFFF8_0000_0000_0000 | sys.cpu.fpscr.to_bits() as u64;
    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

fn fpscr_updated(sys: &mut System, ins: Ins) {
    sys.cpu.fpscr.update_summaries();
    sys.cpu.update_fp_env();

    if ins.field_rc() {
        sys.cpu.update_cr1();
    }
}

pub fn mtfsf(sys: &mut System, ins: Ins) {
    let fields = ins.field_mtfsf_fm() as u32;
    let mask = (0..8)
        .filter(|&i| fields & (1 << i) != 0)
        .fold(0u32, |acc, i| acc | (0xF << (4 * i)));

    let value = sys.cpu.ps[ins.fpr_b()].ps0 as u32;
    let bits = (sys.cpu.fpscr.to_bits() & !mask) | (value & mask);
    sys.cpu.fpscr = FloatControlReg::from_bits(bits);

    fpscr_updated(sys, ins);
}

pub fn mtfsb0(sys: &mut System, ins: Ins) {
    let bit = 0x8000_0000u32 >> ins.field_crbd();
    let bits = sys.cpu.fpscr.to_bits() & !bit;
    sys.cpu.fpscr = FloatControlReg::from_bits(bits);

    fpscr_updated(sys, ins);
}

pub fn mtfsb1(sys: &mut System, ins: Ins) {
    let bit = 0x8000_0000u32 >> ins.field_crbd();
    if bit & EXCEPTION_BITS != 0 {
        set_exception(sys, bit);
    } else {
        let bits = sys.cpu.fpscr.to_bits() | bit;
        sys.cpu.fpscr = FloatControlReg::from_bits(bits);
    }

    fpscr_updated(sys, ins);
}

#[cfg(test)]
mod test {
    use gekko::fpu::FloatClass;
    use gekko::regs::FloatRounding;

    use super::*;
    use crate::ops::test::{run, system};

    fn set(sys: &mut System, index: usize, value: f64) {
        sys.cpu.ps[index].set_ps0(value);
    }

    #[test]
    fn double_add() {
        let mut sys = system();
        set(&mut sys, 2, 1.5);
        set(&mut sys, 3, 2.25);

        // fadd f1, f2, f3
        run(&mut sys, &[0xFC22_182A]);
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), 3.75);
        assert_eq!(sys.cpu.fpscr.fprf(), FloatClass::PositiveNormal.fprf());
    }

    #[test]
    fn single_divide_fills_both_lanes() {
        let mut sys = system();
        set(&mut sys, 2, 1.0);
        set(&mut sys, 3, 3.0);

        // fdivs f1, f2, f3
        run(&mut sys, &[0xEC22_1824]);
        let expected = (1.0f32 / 3.0f32) as f64;
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), expected);
        assert_eq!(sys.cpu.ps[1].ps1_as_double(), expected);
    }

    #[test]
    fn zero_divide() {
        let mut sys = system();
        set(&mut sys, 2, 1.0);
        set(&mut sys, 3, 0.0);

        // fdiv f1, f2, f3
        run(&mut sys, &[0xFC22_1824]);
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), f64::INFINITY);
        assert!(sys.cpu.fpscr.zero_divide_exception());
        assert!(sys.cpu.fpscr.exception_summary());
    }

    #[test]
    fn invalid_add_produces_default_nan() {
        let mut sys = system();
        set(&mut sys, 2, f64::INFINITY);
        set(&mut sys, 3, f64::NEG_INFINITY);

        // fadd f1, f2, f3
        run(&mut sys, &[0xFC22_182A]);
        assert_eq!(sys.cpu.ps[1].ps0, DEFAULT_NAN);
        assert!(sys.cpu.fpscr.invalid_inf_sub_inf_exception());
        assert!(sys.cpu.fpscr.invalid_op_exception_summary());
    }

    #[test]
    fn nan_operand_propagates_quieted() {
        let mut sys = system();
        sys.cpu.ps[2].ps0 = 0x7FF0_0000_0000_0001;
        set(&mut sys, 3, 1.0);

        // fadd f1, f2, f3
        run(&mut sys, &[0xFC22_182A]);
        assert_eq!(sys.cpu.ps[1].ps0, 0x7FF8_0000_0000_0001);
        assert!(sys.cpu.fpscr.invalid_snan_exception());
    }

    #[test]
    fn fused_multiply_add() {
        let mut sys = system();
        set(&mut sys, 2, 2.0);
        set(&mut sys, 3, 3.0);
        set(&mut sys, 4, 1.0);

        // fmadd f1, f2, f3, f4
        run(&mut sys, &[0xFC22_20FA]);
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), 7.0);
    }

    #[test]
    fn select() {
        let mut sys = system();
        set(&mut sys, 2, -1.0);
        set(&mut sys, 3, 10.0);
        set(&mut sys, 4, 20.0);

        // fsel f1, f2, f3, f4
        run(&mut sys, &[0xFC22_20EE]);
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), 20.0);

        set(&mut sys, 2, -0.0);
        run(&mut sys, &[0xFC22_20EE]);
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), 10.0);
    }

    #[test]
    fn negate() {
        let mut sys = system();
        set(&mut sys, 2, 4.0);

        // fneg f1, f2
        run(&mut sys, &[0xFC20_1050]);
        assert_eq!(sys.cpu.ps[1].ps0_as_double(), -4.0);
    }

    #[test]
    fn integer_conversion() {
        let mut sys = system();
        set(&mut sys, 2, -3.7);

        // fctiwz f1, f2
        run(&mut sys, &[0xFC20_101E]);
        assert_eq!(sys.cpu.ps[1].ps0, 0xFFF8_0000_FFFF_FFFD);
        assert!(sys.cpu.fpscr.inexact_exception());

        set(&mut sys, 2, 1e10);
        run(&mut sys, &[0xFC20_101E]);
        assert_eq!(sys.cpu.ps[1].ps0, 0xFFF8_0000_7FFF_FFFF);
        assert!(sys.cpu.fpscr.invalid_conversion_exception());
    }

    #[test]
    fn unordered_compare() {
        let mut sys = system();
        set(&mut sys, 2, 1.0);
        set(&mut sys, 3, 2.0);

        // fcmpu cr1, f2, f3
        run(&mut sys, &[0xFC82_1800]);
        assert_eq!(sys.cpu.cr.field(1), FL);
        assert_eq!(sys.cpu.fpscr.fpcc(), FL);

        set(&mut sys, 3, f64::NAN);
        run(&mut sys, &[0xFC82_1800]);
        assert_eq!(sys.cpu.cr.field(1), FU);
        assert!(!sys.cpu.fpscr.invalid_compare_exception());
    }

    #[test]
    fn status_register_moves() {
        let mut sys = system();
        sys.cpu.ps[1].ps0 = 0b11;

        // mtfsf 0xFF, f1; mffs f5
        run(&mut sys, &[0xFDFE_0D8E, 0xFCA0_048E]);
        assert_eq!(sys.cpu.fpscr.rounding(), FloatRounding::TowardsNegInf);
        assert_eq!(sys.cpu.fp_env.rounding, FloatRounding::TowardsNegInf);
        assert_eq!(sys.cpu.ps[5].ps0, 0xFFF8_0000_0000_0003);
    }
}
