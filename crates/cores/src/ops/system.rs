use cpucore::system::{CodeChange, System};
use gekko::disasm::Ins;
use gekko::{Address, Exceptions, InsExt, MachineState, ProgramCause, Spr};

use super::supervisor;

/// MSR bits restored from SRR1 by `rfi`.
const RFI_MASK: u32 = 0x87C0_FFFF;

/// Whether a user mode access to SPR `index` is allowed. Reads can also see the time base.
fn user_accessible(index: u16, read: bool) -> bool {
    let common = [Spr::Xer, Spr::Lr, Spr::Ctr];
    let time_base = [Spr::Tl, Spr::Tu];

    common.iter().any(|spr| *spr as u16 == index)
        || (read && time_base.iter().any(|spr| *spr as u16 == index))
}

pub fn mfmsr(sys: &mut System, ins: Ins) {
    if supervisor(sys) {
        sys.cpu.gpr[ins.gpr_d()] = sys.cpu.msr.to_bits();
    }
}

pub fn mtmsr(sys: &mut System, ins: Ins) {
    if !supervisor(sys) {
        return;
    }

    sys.cpu.msr = MachineState::from_bits(sys.cpu.gpr[ins.gpr_s()]);
    if sys.cpu.msr.reduced_power() {
        tracing::debug!(pc = ?sys.cpu.pc, "reduced power mode requested");
    }
}

pub fn mfsr(sys: &mut System, ins: Ins) {
    if supervisor(sys) {
        sys.cpu.gpr[ins.gpr_d()] = sys.cpu.sr[ins.field_sr() as usize & 0xF];
    }
}

pub fn mfsrin(sys: &mut System, ins: Ins) {
    if supervisor(sys) {
        let index = (sys.cpu.gpr[ins.gpr_b()] >> 28) as usize;
        sys.cpu.gpr[ins.gpr_d()] = sys.cpu.sr[index];
    }
}

fn write_segment(sys: &mut System, index: usize, value: u32) {
    sys.cpu.set_sr(index, value);
    if sys.config.mmu {
        sys.code_changes.push(CodeChange::All);
    }
}

pub fn mtsr(sys: &mut System, ins: Ins) {
    if supervisor(sys) {
        let value = sys.cpu.gpr[ins.gpr_s()];
        write_segment(sys, ins.field_sr() as usize & 0xF, value);
    }
}

pub fn mtsrin(sys: &mut System, ins: Ins) {
    if supervisor(sys) {
        let index = (sys.cpu.gpr[ins.gpr_b()] >> 28) as usize;
        let value = sys.cpu.gpr[ins.gpr_s()];
        write_segment(sys, index, value);
    }
}

pub fn tlbie(sys: &mut System, ins: Ins) {
    if supervisor(sys) {
        let ea = Address(sys.cpu.gpr[ins.gpr_b()]);
        sys.invalidate_tlb_entry(ea);
    }
}

pub fn tlbsync(sys: &mut System, _: Ins) {
    supervisor(sys);
}

pub fn mfspr(sys: &mut System, ins: Ins) {
    let index = ins.field_spr() as u16;
    if sys.cpu.msr.user_mode() && !user_accessible(index, true) {
        sys.raise_program(ProgramCause::Privileged);
        return;
    }

    let value = match Spr::from_repr(index) {
        Some(Spr::Xer) => sys.cpu.xer(),
        Some(Spr::Dec) => {
            let value = sys.decrementer();
            sys.cpu.set_spr(Spr::Dec, value);
            value
        }
        Some(spr @ (Spr::Tl | Spr::Tu)) => {
            sys.sync_time_base();
            sys.cpu.spr(spr)
        }
        _ => sys.cpu.spr[index as usize & 0x3FF],
    };

    sys.cpu.gpr[ins.gpr_d()] = value;
}

pub fn mtspr(sys: &mut System, ins: Ins) {
    let index = ins.field_spr() as u16;
    if sys.cpu.msr.user_mode() && !user_accessible(index, false) {
        sys.raise_program(ProgramCause::Privileged);
        return;
    }

    let slot = index as usize & 0x3FF;
    let old = sys.cpu.spr[slot];
    let value = sys.cpu.gpr[ins.gpr_s()];
    sys.cpu.spr[slot] = value;

    let Some(spr) = Spr::from_repr(index) else {
        return;
    };

    match spr {
        Spr::Xer => sys.cpu.set_xer(value),
        Spr::Dec => {
            if old & (1 << 31) == 0 && value & (1 << 31) != 0 {
                sys.cpu.exceptions |= Exceptions::DECREMENTER;
            }

            sys.decrementer_set();
        }
        Spr::TlW => {
            sys.cpu.set_spr(Spr::Tl, value);
            sys.time_base_set();
        }
        Spr::TuW => {
            sys.cpu.set_spr(Spr::Tu, value);
            sys.time_base_set();
        }
        Spr::Tl | Spr::Tu | Spr::Pvr => {
            tracing::warn!(pc = ?sys.cpu.pc, ?spr, "write to read only SPR ignored");
            sys.cpu.spr[slot] = old;
        }
        Spr::Hid0 => sys.hid0_written(old),
        Spr::Hid4 => {
            if old != value {
                sys.ibat_updated();
                sys.dbat_updated();
            }
        }
        Spr::Sdr1 => sys.cpu.set_sdr1(value),
        spr if spr.is_ibat() => {
            if old != value {
                sys.ibat_updated();
            }
        }
        spr if spr.is_dbat() => {
            if old != value {
                sys.dbat_updated();
            }
        }
        _ => (),
    }
}

pub fn mftb(sys: &mut System, ins: Ins) {
    let spr = match ins.field_tbr() as u16 {
        268 => Spr::Tl,
        269 => Spr::Tu,
        tbr => {
            tracing::error!(pc = ?sys.cpu.pc, tbr, "mftb of an invalid time base register");
            sys.raise_program(ProgramCause::Illegal);
            return;
        }
    };

    sys.sync_time_base();
    sys.cpu.gpr[ins.gpr_d()] = sys.cpu.spr(spr);
}

pub fn sc(sys: &mut System, _: Ins) {
    sys.cpu.exceptions |= Exceptions::SYSCALL;
}

pub fn rfi(sys: &mut System, _: Ins) {
    if !supervisor(sys) {
        return;
    }

    let srr1 = sys.cpu.spr(Spr::Srr1);
    let msr = (sys.cpu.msr.to_bits() & !RFI_MASK) | (srr1 & RFI_MASK);

    // MSR[POW] never survives an rfi
    sys.cpu.msr = MachineState::from_bits(msr & !(1 << 18));
    sys.cpu.npc = Address(sys.cpu.spr(Spr::Srr0));
}

/// Trap options, as encoded in field TO.
mod to {
    pub const LT: u32 = 0x10;
    pub const GT: u32 = 0x08;
    pub const EQ: u32 = 0x04;
    pub const LTU: u32 = 0x02;
    pub const GTU: u32 = 0x01;
}

fn trap(sys: &mut System, ins: Ins, lhs: u32, rhs: u32) {
    let options = ins.trap_conditions();
    let (signed_lhs, signed_rhs) = (lhs as i32, rhs as i32);

    let taken = (options & to::LT != 0 && signed_lhs < signed_rhs)
        || (options & to::GT != 0 && signed_lhs > signed_rhs)
        || (options & to::EQ != 0 && lhs == rhs)
        || (options & to::LTU != 0 && lhs < rhs)
        || (options & to::GTU != 0 && lhs > rhs);

    if taken {
        sys.raise_program(ProgramCause::Trap);
    }
}

pub fn tw(sys: &mut System, ins: Ins) {
    let lhs = sys.cpu.gpr[ins.gpr_a()];
    let rhs = sys.cpu.gpr[ins.gpr_b()];
    trap(sys, ins, lhs, rhs);
}

pub fn twi(sys: &mut System, ins: Ins) {
    let lhs = sys.cpu.gpr[ins.gpr_a()];
    trap(sys, ins, lhs, ins.field_simm() as i32 as u32);
}
