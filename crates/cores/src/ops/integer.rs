use cpucore::system::System;
use gekko::InsExt;
use gekko::disasm::Ins;

use super::{ra_or_zero, record};

#[derive(Clone, Copy)]
enum AddLhs {
    RA,
    NotRA,
}

#[derive(Clone, Copy)]
enum AddRhs {
    RB,
    Zero,
    MinusOne,
}

#[derive(Clone, Copy)]
struct AddOp {
    lhs: AddLhs,
    rhs: AddRhs,
    /// Adds XER\[CA\] to the result.
    extend: bool,
    /// Adds one to the result (subtractions).
    plus_one: bool,
    /// Writes the carry into XER\[CA\].
    carry: bool,
}

/// Adds with carry in, returning the result, the carry out and the signed overflow.
#[inline(always)]
fn add_with_carry(lhs: u32, rhs: u32, carry: bool) -> (u32, bool, bool) {
    let (partial, carry_a) = lhs.overflowing_add(rhs);
    let (result, carry_b) = partial.overflowing_add(carry as u32);
    let overflow = ((lhs ^ result) & (rhs ^ result)) >> 31 != 0;

    (result, carry_a || carry_b, overflow)
}

fn addition(sys: &mut System, ins: Ins, op: AddOp) {
    let ra = sys.cpu.gpr[ins.gpr_a()];
    let lhs = match op.lhs {
        AddLhs::RA => ra,
        AddLhs::NotRA => !ra,
    };

    let rhs = match op.rhs {
        AddRhs::RB => sys.cpu.gpr[ins.gpr_b()],
        AddRhs::Zero => 0,
        AddRhs::MinusOne => u32::MAX,
    };

    let carry_in = if op.extend {
        sys.cpu.xer_ca != 0
    } else {
        op.plus_one
    };

    let (result, carry, overflow) = add_with_carry(lhs, rhs, carry_in);
    sys.cpu.gpr[ins.gpr_d()] = result;

    if op.carry {
        sys.cpu.xer_ca = carry as u8;
    }

    if ins.field_oe() {
        sys.cpu.set_xer_ov(overflow);
    }

    record(sys, ins, result);
}

macro_rules! addition {
    ($($name:ident => $lhs:ident, $rhs:ident, extend: $extend:literal, plus_one: $plus_one:literal, carry: $carry:literal;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                addition(
                    sys,
                    ins,
                    AddOp {
                        lhs: AddLhs::$lhs,
                        rhs: AddRhs::$rhs,
                        extend: $extend,
                        plus_one: $plus_one,
                        carry: $carry,
                    },
                );
            }
        )*
    };
}

addition! {
    add    => RA, RB, extend: false, plus_one: false, carry: false;
    addc   => RA, RB, extend: false, plus_one: false, carry: true;
    adde   => RA, RB, extend: true, plus_one: false, carry: true;
    addme  => RA, MinusOne, extend: true, plus_one: false, carry: true;
    addze  => RA, Zero, extend: true, plus_one: false, carry: true;
    subf   => NotRA, RB, extend: false, plus_one: true, carry: false;
    subfc  => NotRA, RB, extend: false, plus_one: true, carry: true;
    subfe  => NotRA, RB, extend: true, plus_one: false, carry: true;
    subfme => NotRA, MinusOne, extend: true, plus_one: false, carry: true;
    subfze => NotRA, Zero, extend: true, plus_one: false, carry: true;
    neg    => NotRA, Zero, extend: false, plus_one: true, carry: false;
}

pub fn addi(sys: &mut System, ins: Ins) {
    let imm = ins.field_simm() as i32 as u32;
    sys.cpu.gpr[ins.gpr_d()] = ra_or_zero(sys, ins).wrapping_add(imm);
}

pub fn addis(sys: &mut System, ins: Ins) {
    let imm = (ins.field_simm() as i32 as u32) << 16;
    sys.cpu.gpr[ins.gpr_d()] = ra_or_zero(sys, ins).wrapping_add(imm);
}

fn add_immediate_carrying(sys: &mut System, ins: Ins) -> u32 {
    let imm = ins.field_simm() as i32 as u32;
    let (result, carry, _) = add_with_carry(sys.cpu.gpr[ins.gpr_a()], imm, false);

    sys.cpu.gpr[ins.gpr_d()] = result;
    sys.cpu.xer_ca = carry as u8;
    result
}

pub fn addic(sys: &mut System, ins: Ins) {
    add_immediate_carrying(sys, ins);
}

pub fn addic_record(sys: &mut System, ins: Ins) {
    let result = add_immediate_carrying(sys, ins);
    sys.cpu.update_cr0(result);
}

pub fn subfic(sys: &mut System, ins: Ins) {
    let imm = ins.field_simm() as i32 as u32;
    let (result, carry, _) = add_with_carry(!sys.cpu.gpr[ins.gpr_a()], imm, true);

    sys.cpu.gpr[ins.gpr_d()] = result;
    sys.cpu.xer_ca = carry as u8;
}

pub fn mulli(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as i32;
    sys.cpu.gpr[ins.gpr_d()] = ra.wrapping_mul(ins.field_simm() as i32) as u32;
}

pub fn mullw(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as i32 as i64;
    let rb = sys.cpu.gpr[ins.gpr_b()] as i32 as i64;
    let product = ra * rb;
    let result = product as u32;

    sys.cpu.gpr[ins.gpr_d()] = result;
    if ins.field_oe() {
        sys.cpu.set_xer_ov(product != product as i32 as i64);
    }

    record(sys, ins, result);
}

pub fn mulhw(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as i32 as i64;
    let rb = sys.cpu.gpr[ins.gpr_b()] as i32 as i64;
    let result = ((ra * rb) >> 32) as u32;

    sys.cpu.gpr[ins.gpr_d()] = result;
    record(sys, ins, result);
}

pub fn mulhwu(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as u64;
    let rb = sys.cpu.gpr[ins.gpr_b()] as u64;
    let result = ((ra * rb) >> 32) as u32;

    sys.cpu.gpr[ins.gpr_d()] = result;
    record(sys, ins, result);
}

pub fn divw(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as i32;
    let rb = sys.cpu.gpr[ins.gpr_b()] as i32;
    let overflow = rb == 0 || (ra == i32::MIN && rb == -1);

    let result = if overflow {
        if ra < 0 { u32::MAX } else { 0 }
    } else {
        (ra / rb) as u32
    };

    sys.cpu.gpr[ins.gpr_d()] = result;
    if ins.field_oe() {
        sys.cpu.set_xer_ov(overflow);
    }

    record(sys, ins, result);
}

pub fn divwu(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()];
    let rb = sys.cpu.gpr[ins.gpr_b()];
    let overflow = rb == 0;
    let result = ra.checked_div(rb).unwrap_or(0);

    sys.cpu.gpr[ins.gpr_d()] = result;
    if ins.field_oe() {
        sys.cpu.set_xer_ov(overflow);
    }

    record(sys, ins, result);
}

macro_rules! logic {
    ($($name:ident => |$rs:ident, $rb:ident| $expr:expr;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                let $rs = sys.cpu.gpr[ins.gpr_s()];
                let $rb = sys.cpu.gpr[ins.gpr_b()];
                let result = $expr;

                sys.cpu.gpr[ins.gpr_a()] = result;
                record(sys, ins, result);
            }
        )*
    };
}

logic! {
    and  => |rs, rb| rs & rb;
    andc => |rs, rb| rs & !rb;
    or   => |rs, rb| rs | rb;
    orc  => |rs, rb| rs | !rb;
    xor  => |rs, rb| rs ^ rb;
    nand => |rs, rb| !(rs & rb);
    nor  => |rs, rb| !(rs | rb);
    eqv  => |rs, rb| !(rs ^ rb);
    slw  => |rs, rb| if rb & 0x20 != 0 { 0 } else { rs << (rb & 0x1F) };
    srw  => |rs, rb| if rb & 0x20 != 0 { 0 } else { rs >> (rb & 0x1F) };
}

pub fn andi_record(sys: &mut System, ins: Ins) {
    let result = sys.cpu.gpr[ins.gpr_s()] & ins.field_uimm() as u32;
    sys.cpu.gpr[ins.gpr_a()] = result;
    sys.cpu.update_cr0(result);
}

pub fn andis_record(sys: &mut System, ins: Ins) {
    let result = sys.cpu.gpr[ins.gpr_s()] & ((ins.field_uimm() as u32) << 16);
    sys.cpu.gpr[ins.gpr_a()] = result;
    sys.cpu.update_cr0(result);
}

pub fn ori(sys: &mut System, ins: Ins) {
    sys.cpu.gpr[ins.gpr_a()] = sys.cpu.gpr[ins.gpr_s()] | ins.field_uimm() as u32;
}

pub fn oris(sys: &mut System, ins: Ins) {
    sys.cpu.gpr[ins.gpr_a()] = sys.cpu.gpr[ins.gpr_s()] | ((ins.field_uimm() as u32) << 16);
}

pub fn xori(sys: &mut System, ins: Ins) {
    sys.cpu.gpr[ins.gpr_a()] = sys.cpu.gpr[ins.gpr_s()] ^ ins.field_uimm() as u32;
}

pub fn xoris(sys: &mut System, ins: Ins) {
    sys.cpu.gpr[ins.gpr_a()] = sys.cpu.gpr[ins.gpr_s()] ^ ((ins.field_uimm() as u32) << 16);
}

pub fn extsb(sys: &mut System, ins: Ins) {
    let result = sys.cpu.gpr[ins.gpr_s()] as i8 as i32 as u32;
    sys.cpu.gpr[ins.gpr_a()] = result;
    record(sys, ins, result);
}

pub fn extsh(sys: &mut System, ins: Ins) {
    let result = sys.cpu.gpr[ins.gpr_s()] as i16 as i32 as u32;
    sys.cpu.gpr[ins.gpr_a()] = result;
    record(sys, ins, result);
}

pub fn cntlzw(sys: &mut System, ins: Ins) {
    let result = sys.cpu.gpr[ins.gpr_s()].leading_zeros();
    sys.cpu.gpr[ins.gpr_a()] = result;
    record(sys, ins, result);
}

/// The mask of bits `mb` through `me` (PowerPC bit order), wrapping around when `mb > me`.
#[inline(always)]
pub(crate) fn mask(mb: u32, me: u32) -> u32 {
    let begin = u32::MAX >> mb;
    let end = u32::MAX << (31 - me);

    if mb <= me { begin & end } else { begin | end }
}

pub fn rlwinm(sys: &mut System, ins: Ins) {
    let rotated = sys.cpu.gpr[ins.gpr_s()].rotate_left(ins.field_sh() as u32);
    let result = rotated & mask(ins.field_mb() as u32, ins.field_me() as u32);

    sys.cpu.gpr[ins.gpr_a()] = result;
    record(sys, ins, result);
}

pub fn rlwnm(sys: &mut System, ins: Ins) {
    let amount = sys.cpu.gpr[ins.gpr_b()] & 0x1F;
    let rotated = sys.cpu.gpr[ins.gpr_s()].rotate_left(amount);
    let result = rotated & mask(ins.field_mb() as u32, ins.field_me() as u32);

    sys.cpu.gpr[ins.gpr_a()] = result;
    record(sys, ins, result);
}

pub fn rlwimi(sys: &mut System, ins: Ins) {
    let rotated = sys.cpu.gpr[ins.gpr_s()].rotate_left(ins.field_sh() as u32);
    let mask = mask(ins.field_mb() as u32, ins.field_me() as u32);
    let result = (rotated & mask) | (sys.cpu.gpr[ins.gpr_a()] & !mask);

    sys.cpu.gpr[ins.gpr_a()] = result;
    record(sys, ins, result);
}

/// Arithmetic right shift which sets XER\[CA\] when a negative value loses one bits.
fn shift_right_algebraic(sys: &mut System, ins: Ins, amount: u32) {
    let rs = sys.cpu.gpr[ins.gpr_s()];
    let negative = (rs as i32) < 0;

    let (result, lost) = if amount >= 32 {
        (if negative { u32::MAX } else { 0 }, rs != 0)
    } else {
        let lost = rs & ((1u32 << amount) - 1);
        (((rs as i32) >> amount) as u32, lost != 0)
    };

    sys.cpu.gpr[ins.gpr_a()] = result;
    sys.cpu.xer_ca = (negative && lost) as u8;
    record(sys, ins, result);
}

pub fn sraw(sys: &mut System, ins: Ins) {
    let amount = sys.cpu.gpr[ins.gpr_b()] & 0x3F;
    shift_right_algebraic(sys, ins, amount);
}

pub fn srawi(sys: &mut System, ins: Ins) {
    shift_right_algebraic(sys, ins, ins.field_sh() as u32);
}

fn compare_signed(sys: &mut System, ins: Ins, lhs: i32, rhs: i32) {
    let so = sys.cpu.xer_so();
    sys.cpu
        .cr
        .set_compare(ins.field_crfd() as usize, lhs < rhs, lhs > rhs, lhs == rhs, so);
}

fn compare_unsigned(sys: &mut System, ins: Ins, lhs: u32, rhs: u32) {
    let so = sys.cpu.xer_so();
    sys.cpu
        .cr
        .set_compare(ins.field_crfd() as usize, lhs < rhs, lhs > rhs, lhs == rhs, so);
}

pub fn cmp(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as i32;
    let rb = sys.cpu.gpr[ins.gpr_b()] as i32;
    compare_signed(sys, ins, ra, rb);
}

pub fn cmpi(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()] as i32;
    compare_signed(sys, ins, ra, ins.field_simm() as i32);
}

pub fn cmpl(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()];
    let rb = sys.cpu.gpr[ins.gpr_b()];
    compare_unsigned(sys, ins, ra, rb);
}

pub fn cmpli(sys: &mut System, ins: Ins) {
    let ra = sys.cpu.gpr[ins.gpr_a()];
    compare_unsigned(sys, ins, ra, ins.field_uimm() as u32);
}

macro_rules! cr_logic {
    ($($name:ident => |$a:ident, $b:ident| $expr:expr;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                let $a = sys.cpu.cr.bit(ins.field_crba() as u32);
                let $b = sys.cpu.cr.bit(ins.field_crbb() as u32);
                sys.cpu.cr.set_bit(ins.field_crbd() as u32, $expr);
            }
        )*
    };
}

cr_logic! {
    crand  => |a, b| a && b;
    crandc => |a, b| a && !b;
    creqv  => |a, b| a == b;
    crnand => |a, b| !(a && b);
    crnor  => |a, b| !(a || b);
    cror   => |a, b| a || b;
    crorc  => |a, b| a || !b;
    crxor  => |a, b| a != b;
}

pub fn mcrf(sys: &mut System, ins: Ins) {
    let field = sys.cpu.cr.fields[ins.field_crfs() as usize];
    sys.cpu.cr.fields[ins.field_crfd() as usize] = field;
}

pub fn mcrxr(sys: &mut System, ins: Ins) {
    let xer = sys.cpu.xer();
    sys.cpu.cr.set_field(ins.field_crfd() as usize, xer >> 28);
    sys.cpu.set_xer(xer & 0x0FFF_FFFF);
}

pub fn mfcr(sys: &mut System, ins: Ins) {
    sys.cpu.gpr[ins.gpr_d()] = sys.cpu.cr.get();
}

pub fn mtcrf(sys: &mut System, ins: Ins) {
    let crm = ins.field_crm() as u32;
    let rs = sys.cpu.gpr[ins.gpr_s()];

    if crm == 0xFF {
        sys.cpu.cr.set(rs);
        return;
    }

    for field in 0..8 {
        if crm & (0x80 >> field) != 0 {
            sys.cpu
                .cr
                .set_field(field, (rs >> (28 - 4 * field)) & 0xF);
        }
    }
}
