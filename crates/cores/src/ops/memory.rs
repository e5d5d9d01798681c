use cpucore::Primitive;
use cpucore::system::System;
use gekko::disasm::Ins;
use gekko::fpu::{double_to_single_bits, single_to_double_bits};
use gekko::{Address, InsExt};

use super::{ra_or_zero, supervisor};

/// How the effective address of a load or store is formed.
#[derive(Clone, Copy)]
enum Form {
    /// `(rA|0) + d`
    Disp,
    /// `rA + d`, with rA updated
    DispUpdate,
    /// `(rA|0) + rB`
    Indexed,
    /// `rA + rB`, with rA updated
    IndexedUpdate,
}

impl Form {
    #[inline(always)]
    fn updates(self) -> bool {
        matches!(self, Self::DispUpdate | Self::IndexedUpdate)
    }

    #[inline(always)]
    fn ea(self, sys: &System, ins: Ins) -> Address {
        let value = match self {
            Self::Disp => ra_or_zero(sys, ins).wrapping_add(ins.field_offset() as i32 as u32),
            Self::DispUpdate => sys.cpu.gpr[ins.gpr_a()].wrapping_add(ins.field_offset() as i32 as u32),
            Self::Indexed => ra_or_zero(sys, ins).wrapping_add(sys.cpu.gpr[ins.gpr_b()]),
            Self::IndexedUpdate => sys.cpu.gpr[ins.gpr_a()].wrapping_add(sys.cpu.gpr[ins.gpr_b()]),
        };

        Address(value)
    }
}

#[inline(always)]
fn load<P: Primitive>(sys: &mut System, ins: Ins, form: Form, extend: fn(P) -> u32) {
    let ea = form.ea(sys, ins);
    let Some(value) = sys.read::<P>(ea) else {
        return;
    };

    sys.cpu.gpr[ins.gpr_d()] = extend(value);
    if form.updates() {
        sys.cpu.gpr[ins.gpr_a()] = ea.value();
    }
}

#[inline(always)]
fn store<P: Primitive>(sys: &mut System, ins: Ins, form: Form, truncate: fn(u32) -> P) {
    let ea = form.ea(sys, ins);
    let value = truncate(sys.cpu.gpr[ins.gpr_s()]);

    if sys.write::<P>(ea, value) && form.updates() {
        sys.cpu.gpr[ins.gpr_a()] = ea.value();
    }
}

macro_rules! loads {
    ($($name:ident => $ty:ty, $form:ident, $extend:expr;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                load::<$ty>(sys, ins, Form::$form, $extend);
            }
        )*
    };
}

macro_rules! stores {
    ($($name:ident => $ty:ty, $form:ident, $truncate:expr;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                store::<$ty>(sys, ins, Form::$form, $truncate);
            }
        )*
    };
}

loads! {
    lbz   => u8, Disp, |v| v as u32;
    lbzu  => u8, DispUpdate, |v| v as u32;
    lbzx  => u8, Indexed, |v| v as u32;
    lbzux => u8, IndexedUpdate, |v| v as u32;

    lhz   => u16, Disp, |v| v as u32;
    lhzu  => u16, DispUpdate, |v| v as u32;
    lhzx  => u16, Indexed, |v| v as u32;
    lhzux => u16, IndexedUpdate, |v| v as u32;

    lha   => u16, Disp, |v| v as i16 as i32 as u32;
    lhau  => u16, DispUpdate, |v| v as i16 as i32 as u32;
    lhax  => u16, Indexed, |v| v as i16 as i32 as u32;
    lhaux => u16, IndexedUpdate, |v| v as i16 as i32 as u32;

    lwz   => u32, Disp, |v| v;
    lwzu  => u32, DispUpdate, |v| v;
    lwzx  => u32, Indexed, |v| v;
    lwzux => u32, IndexedUpdate, |v| v;

    lhbrx => u16, Indexed, |v| v.swap_bytes() as u32;
    lwbrx => u32, Indexed, |v| v.swap_bytes();
}

stores! {
    stb   => u8, Disp, |v| v as u8;
    stbu  => u8, DispUpdate, |v| v as u8;
    stbx  => u8, Indexed, |v| v as u8;
    stbux => u8, IndexedUpdate, |v| v as u8;

    sth   => u16, Disp, |v| v as u16;
    sthu  => u16, DispUpdate, |v| v as u16;
    sthx  => u16, Indexed, |v| v as u16;
    sthux => u16, IndexedUpdate, |v| v as u16;

    stw   => u32, Disp, |v| v;
    stwu  => u32, DispUpdate, |v| v;
    stwx  => u32, Indexed, |v| v;
    stwux => u32, IndexedUpdate, |v| v;

    sthbrx => u16, Indexed, |v| (v as u16).swap_bytes();
    stwbrx => u32, Indexed, |v| v.swap_bytes();
}

/// Multiple word accesses require word alignment and big endian mode.
fn multiple_word_ea(sys: &mut System, ins: Ins) -> Option<Address> {
    let ea = Form::Disp.ea(sys, ins);
    if !ea.is_aligned(4) || sys.cpu.msr.little_endian() {
        sys.raise_alignment(ea);
        return None;
    }

    Some(ea)
}

pub fn lmw(sys: &mut System, ins: Ins) {
    let Some(mut ea) = multiple_word_ea(sys, ins) else {
        return;
    };

    for reg in ins.gpr_d()..32 {
        let Some(value) = sys.read::<u32>(ea) else {
            tracing::warn!(pc = ?sys.cpu.pc, ea = ?ea, "lmw interrupted by an exception");
            return;
        };

        sys.cpu.gpr[reg] = value;
        ea += 4;
    }
}

pub fn stmw(sys: &mut System, ins: Ins) {
    let Some(mut ea) = multiple_word_ea(sys, ins) else {
        return;
    };

    for reg in ins.gpr_s()..32 {
        if !sys.write::<u32>(ea, sys.cpu.gpr[reg]) {
            tracing::warn!(pc = ?sys.cpu.pc, ea = ?ea, "stmw interrupted by an exception");
            return;
        }

        ea += 4;
    }
}

pub fn lwarx(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    if !ea.is_aligned(4) {
        sys.raise_alignment(ea);
        return;
    }

    let Some(value) = sys.read::<u32>(ea) else {
        return;
    };

    sys.cpu.gpr[ins.gpr_d()] = value;
    sys.cpu.reserve = true;
    sys.cpu.reserve_address = ea;
}

pub fn stwcx(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    if !ea.is_aligned(4) {
        sys.raise_alignment(ea);
        return;
    }

    let so = sys.cpu.xer_so() as u32;
    if sys.cpu.reserve && sys.cpu.reserve_address == ea {
        let value = sys.cpu.gpr[ins.gpr_s()];
        if sys.write::<u32>(ea, value) {
            sys.cpu.reserve = false;
            sys.cpu.cr.set_field(0, gekko::regs::cr::EQ | so);
            return;
        }
    }

    sys.cpu.cr.set_field(0, so);
}

pub fn dcbf(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    sys.dcbf(ea);
}

pub fn dcbi(sys: &mut System, ins: Ins) {
    if !supervisor(sys) {
        return;
    }

    let ea = Form::Indexed.ea(sys, ins);
    sys.dcbi(ea);
}

pub fn dcbst(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    sys.dcbst(ea);
}

pub fn dcbt(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    sys.dcbt(ea);
}

pub fn dcbz(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    sys.dcbz(ea);
}

pub fn icbi(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    sys.icbi(ea);
}

#[inline(always)]
fn load_float(sys: &mut System, ins: Ins, form: Form, single: bool) {
    let ea = form.ea(sys, ins);
    if single {
        let Some(value) = sys.read::<u32>(ea) else {
            return;
        };

        let bits = single_to_double_bits(value);
        let fpr = &mut sys.cpu.ps[ins.fpr_d()];
        fpr.ps0 = bits;
        fpr.ps1 = bits;
    } else {
        let Some(value) = sys.read::<u64>(ea) else {
            return;
        };

        sys.cpu.ps[ins.fpr_d()].ps0 = value;
    }

    if form.updates() {
        sys.cpu.gpr[ins.gpr_a()] = ea.value();
    }
}

#[inline(always)]
fn store_float(sys: &mut System, ins: Ins, form: Form, single: bool) {
    let ea = form.ea(sys, ins);
    let bits = sys.cpu.ps[ins.fpr_s()].ps0;

    let written = if single {
        sys.write::<u32>(ea, double_to_single_bits(bits))
    } else {
        sys.write::<u64>(ea, bits)
    };

    if written && form.updates() {
        sys.cpu.gpr[ins.gpr_a()] = ea.value();
    }
}

macro_rules! float_accesses {
    ($($name:ident => $func:ident, $form:ident, single: $single:literal;)*) => {
        $(
            pub fn $name(sys: &mut System, ins: Ins) {
                $func(sys, ins, Form::$form, $single);
            }
        )*
    };
}

float_accesses! {
    lfs   => load_float, Disp, single: true;
    lfsu  => load_float, DispUpdate, single: true;
    lfsx  => load_float, Indexed, single: true;
    lfsux => load_float, IndexedUpdate, single: true;
    lfd   => load_float, Disp, single: false;
    lfdu  => load_float, DispUpdate, single: false;
    lfdx  => load_float, Indexed, single: false;
    lfdux => load_float, IndexedUpdate, single: false;

    stfs   => store_float, Disp, single: true;
    stfsu  => store_float, DispUpdate, single: true;
    stfsx  => store_float, Indexed, single: true;
    stfsux => store_float, IndexedUpdate, single: true;
    stfd   => store_float, Disp, single: false;
    stfdu  => store_float, DispUpdate, single: false;
    stfdx  => store_float, Indexed, single: false;
    stfdux => store_float, IndexedUpdate, single: false;
}

pub fn stfiwx(sys: &mut System, ins: Ins) {
    let ea = Form::Indexed.ea(sys, ins);
    let low = sys.cpu.ps[ins.fpr_s()].ps0 as u32;
    sys.write::<u32>(ea, low);
}
