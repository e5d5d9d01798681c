//! Instruction semantics shared by every backend.
//!
//! Each instruction is decoded once into an [`OpInfo`], which holds the handler implementing it
//! along with its timing and a few flags. [`execute`] then runs a decoded instruction the same
//! way for every backend: FPU availability check, handler, synchronous exception drain, PC
//! update and performance monitor.

mod branch;
mod float;
mod integer;
mod memory;
mod system;

use bitflags::bitflags;
use cpucore::system::System;
use gekko::disasm::{Ins, Opcode};
use gekko::{Address, Exceptions, InsExt, ProgramCause};
use static_assertions::const_assert;

/// A function implementing an instruction.
pub type Handler = fn(&mut System, Ins);

bitflags! {
    /// Properties of an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u8 {
        /// Control flow might not continue at the next instruction.
        const END_BLOCK      = 1 << 0;
        /// Counts as a load/store for the performance monitor.
        const LOAD_STORE     = 1 << 1;
        /// Needs MSR\[FP\].
        const FPU            = 1 << 2;
        /// External exceptions might have become deliverable.
        const CHECK_EXTERNAL = 1 << 3;
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub handler: Handler,
    pub cycles: u8,
    pub flags: OpFlags,
}

// decoded blocks keep one of these per instruction
const_assert!(size_of::<OpInfo>() <= 16);

impl OpInfo {
    const fn new(handler: Handler, cycles: u8, flags: OpFlags) -> Self {
        Self {
            handler,
            cycles,
            flags,
        }
    }

    #[inline(always)]
    pub fn ends_block(&self) -> bool {
        self.flags.contains(OpFlags::END_BLOCK)
    }
}

/// Exceptions which are serviced right after the instruction raising them.
const SYNCHRONOUS: Exceptions = Exceptions::ISI
    .union(Exceptions::DSI)
    .union(Exceptions::PROGRAM)
    .union(Exceptions::SYSCALL)
    .union(Exceptions::FPU_UNAVAILABLE)
    .union(Exceptions::ALIGNMENT)
    .union(Exceptions::FAKE_MEMCHECK_HIT);

/// Outcome of executing a single instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Step {
    pub cycles: u32,
    /// Whether execution must leave the current block.
    pub end_block: bool,
}

#[inline(always)]
pub(crate) fn record(sys: &mut System, ins: Ins, value: u32) {
    if ins.field_rc() {
        sys.cpu.update_cr0(value);
    }
}

/// `rA`, or zero if the field selects r0.
#[inline(always)]
pub(crate) fn ra_or_zero(sys: &System, ins: Ins) -> u32 {
    if ins.field_ra() == 0 {
        0
    } else {
        sys.cpu.gpr[ins.gpr_a()]
    }
}

/// Whether the processor is in supervisor mode. Raises a privileged program exception
/// otherwise.
#[inline(always)]
pub(crate) fn supervisor(sys: &mut System) -> bool {
    if sys.cpu.msr.user_mode() {
        sys.raise_program(ProgramCause::Privileged);
        false
    } else {
        true
    }
}

fn illegal(sys: &mut System, ins: Ins) {
    tracing::error!(
        pc = ?sys.cpu.pc,
        code = format_args!("{:08X}", ins.code),
        "illegal instruction"
    );

    sys.raise_program(ProgramCause::Illegal);
}

fn nop(_: &mut System, _: Ins) {}

const ILLEGAL: OpInfo = OpInfo::new(illegal, 1, OpFlags::END_BLOCK);

/// Decodes the instructions the decoder has no dedicated opcode for by their raw primary and
/// extended opcodes.
fn lookup_raw(ins: Ins) -> OpInfo {
    use OpFlags as F;

    let primary = ins.code >> 26;
    let extended = (ins.code >> 1) & 0x3FF;

    match (primary, extended) {
        (3, _) => OpInfo::new(system::twi, 1, F::END_BLOCK),
        (31, 4) => OpInfo::new(system::tw, 1, F::END_BLOCK),
        (31, 242) => OpInfo::new(system::mtsrin, 1, F::END_BLOCK),
        (31, 659) => OpInfo::new(system::mfsrin, 3, F::empty()),
        (31, 854) => OpInfo::new(nop, 1, F::empty()),
        (63, 136) => OpInfo::new(float::fnabs, 1, F::FPU),
        _ => ILLEGAL,
    }
}

/// Decodes an instruction.
pub fn lookup(ins: Ins) -> OpInfo {
    use OpFlags as F;

    let int = |handler: Handler| OpInfo::new(handler, 1, F::empty());
    let load_store = |handler: Handler| OpInfo::new(handler, 1, F::LOAD_STORE);
    let fpu = |handler: Handler| OpInfo::new(handler, 1, F::FPU);
    let float_load_store = |handler: Handler| OpInfo::new(handler, 1, F::FPU | F::LOAD_STORE);
    let flow = |handler: Handler| OpInfo::new(handler, 1, F::END_BLOCK);

    match ins.op {
        // integer arithmetic
        Opcode::Add => int(integer::add),
        Opcode::Addc => int(integer::addc),
        Opcode::Adde => int(integer::adde),
        Opcode::Addi => int(integer::addi),
        Opcode::Addic => int(integer::addic),
        Opcode::Addic_ => int(integer::addic_record),
        Opcode::Addis => int(integer::addis),
        Opcode::Addme => int(integer::addme),
        Opcode::Addze => int(integer::addze),
        Opcode::Subf => int(integer::subf),
        Opcode::Subfc => int(integer::subfc),
        Opcode::Subfe => int(integer::subfe),
        Opcode::Subfic => int(integer::subfic),
        Opcode::Subfme => int(integer::subfme),
        Opcode::Subfze => int(integer::subfze),
        Opcode::Neg => int(integer::neg),
        Opcode::Mulli => OpInfo::new(integer::mulli, 3, F::empty()),
        Opcode::Mullw => OpInfo::new(integer::mullw, 4, F::empty()),
        Opcode::Mulhw => OpInfo::new(integer::mulhw, 5, F::empty()),
        Opcode::Mulhwu => OpInfo::new(integer::mulhwu, 6, F::empty()),
        Opcode::Divw => OpInfo::new(integer::divw, 40, F::empty()),
        Opcode::Divwu => OpInfo::new(integer::divwu, 40, F::empty()),

        // integer logic
        Opcode::And => int(integer::and),
        Opcode::Andc => int(integer::andc),
        Opcode::Andi_ => int(integer::andi_record),
        Opcode::Andis_ => int(integer::andis_record),
        Opcode::Or => int(integer::or),
        Opcode::Orc => int(integer::orc),
        Opcode::Ori => int(integer::ori),
        Opcode::Oris => int(integer::oris),
        Opcode::Xor => int(integer::xor),
        Opcode::Xori => int(integer::xori),
        Opcode::Xoris => int(integer::xoris),
        Opcode::Nand => int(integer::nand),
        Opcode::Nor => int(integer::nor),
        Opcode::Eqv => int(integer::eqv),
        Opcode::Extsb => int(integer::extsb),
        Opcode::Extsh => int(integer::extsh),
        Opcode::Cntlzw => int(integer::cntlzw),

        // rotates and shifts
        Opcode::Rlwimi => int(integer::rlwimi),
        Opcode::Rlwinm => int(integer::rlwinm),
        Opcode::Rlwnm => int(integer::rlwnm),
        Opcode::Slw => int(integer::slw),
        Opcode::Srw => int(integer::srw),
        Opcode::Sraw => int(integer::sraw),
        Opcode::Srawi => int(integer::srawi),

        // compares and condition register
        Opcode::Cmp => int(integer::cmp),
        Opcode::Cmpi => int(integer::cmpi),
        Opcode::Cmpl => int(integer::cmpl),
        Opcode::Cmpli => int(integer::cmpli),
        Opcode::Crand => int(integer::crand),
        Opcode::Crandc => int(integer::crandc),
        Opcode::Creqv => int(integer::creqv),
        Opcode::Crnand => int(integer::crnand),
        Opcode::Crnor => int(integer::crnor),
        Opcode::Cror => int(integer::cror),
        Opcode::Crorc => int(integer::crorc),
        Opcode::Crxor => int(integer::crxor),
        Opcode::Mcrf => int(integer::mcrf),
        Opcode::Mcrxr => int(integer::mcrxr),
        Opcode::Mfcr => int(integer::mfcr),
        Opcode::Mtcrf => int(integer::mtcrf),

        // branches
        Opcode::B => flow(branch::b),
        Opcode::Bc => flow(branch::bc),
        Opcode::Bclr => flow(branch::bclr),
        Opcode::Bcctr => flow(branch::bcctr),

        // integer loads
        Opcode::Lbz => load_store(memory::lbz),
        Opcode::Lbzu => load_store(memory::lbzu),
        Opcode::Lbzux => load_store(memory::lbzux),
        Opcode::Lbzx => load_store(memory::lbzx),
        Opcode::Lha => load_store(memory::lha),
        Opcode::Lhau => load_store(memory::lhau),
        Opcode::Lhaux => load_store(memory::lhaux),
        Opcode::Lhax => load_store(memory::lhax),
        Opcode::Lhz => load_store(memory::lhz),
        Opcode::Lhzu => load_store(memory::lhzu),
        Opcode::Lhzux => load_store(memory::lhzux),
        Opcode::Lhzx => load_store(memory::lhzx),
        Opcode::Lwz => load_store(memory::lwz),
        Opcode::Lwzu => load_store(memory::lwzu),
        Opcode::Lwzux => load_store(memory::lwzux),
        Opcode::Lwzx => load_store(memory::lwzx),
        Opcode::Lhbrx => load_store(memory::lhbrx),
        Opcode::Lwbrx => load_store(memory::lwbrx),
        Opcode::Lmw => OpInfo::new(memory::lmw, 11, F::LOAD_STORE),

        // integer stores
        Opcode::Stb => load_store(memory::stb),
        Opcode::Stbu => load_store(memory::stbu),
        Opcode::Stbux => load_store(memory::stbux),
        Opcode::Stbx => load_store(memory::stbx),
        Opcode::Sth => load_store(memory::sth),
        Opcode::Sthu => load_store(memory::sthu),
        Opcode::Sthux => load_store(memory::sthux),
        Opcode::Sthx => load_store(memory::sthx),
        Opcode::Stw => load_store(memory::stw),
        Opcode::Stwu => load_store(memory::stwu),
        Opcode::Stwux => load_store(memory::stwux),
        Opcode::Stwx => load_store(memory::stwx),
        Opcode::Sthbrx => load_store(memory::sthbrx),
        Opcode::Stwbrx => load_store(memory::stwbrx),
        Opcode::Stmw => OpInfo::new(memory::stmw, 11, F::LOAD_STORE),

        // reservations
        Opcode::Lwarx => OpInfo::new(memory::lwarx, 3, F::LOAD_STORE),
        Opcode::Stwcx_ => OpInfo::new(memory::stwcx, 3, F::LOAD_STORE),

        // cache management and synchronization
        Opcode::Dcbf => OpInfo::new(memory::dcbf, 3, F::END_BLOCK | F::LOAD_STORE),
        Opcode::Dcbi => OpInfo::new(memory::dcbi, 3, F::END_BLOCK | F::LOAD_STORE),
        Opcode::Dcbst => OpInfo::new(memory::dcbst, 3, F::END_BLOCK | F::LOAD_STORE),
        Opcode::Dcbt => load_store(memory::dcbt),
        Opcode::Dcbtst => load_store(memory::dcbt),
        Opcode::Dcbz => OpInfo::new(memory::dcbz, 3, F::LOAD_STORE),
        Opcode::Icbi => OpInfo::new(memory::icbi, 4, F::END_BLOCK),
        Opcode::Sync => OpInfo::new(nop, 3, F::empty()),
        Opcode::Isync => OpInfo::new(nop, 4, F::END_BLOCK),

        // segments and TLB
        Opcode::Mfsr => OpInfo::new(system::mfsr, 3, F::empty()),
        Opcode::Mtsr => OpInfo::new(system::mtsr, 1, F::END_BLOCK),
        Opcode::Tlbie => OpInfo::new(system::tlbie, 1, F::END_BLOCK),
        Opcode::Tlbsync => OpInfo::new(system::tlbsync, 1, F::empty()),

        // system registers
        Opcode::Mfmsr => int(system::mfmsr),
        Opcode::Mtmsr => OpInfo::new(system::mtmsr, 1, F::END_BLOCK | F::CHECK_EXTERNAL),
        Opcode::Mfspr => int(system::mfspr),
        Opcode::Mtspr => OpInfo::new(system::mtspr, 2, F::END_BLOCK | F::CHECK_EXTERNAL),
        Opcode::Mftb => int(system::mftb),

        // exceptions
        Opcode::Sc => OpInfo::new(system::sc, 2, F::END_BLOCK),
        Opcode::Rfi => OpInfo::new(system::rfi, 2, F::END_BLOCK | F::CHECK_EXTERNAL),

        // floating point loads and stores
        Opcode::Lfs => float_load_store(memory::lfs),
        Opcode::Lfsu => float_load_store(memory::lfsu),
        Opcode::Lfsux => float_load_store(memory::lfsux),
        Opcode::Lfsx => float_load_store(memory::lfsx),
        Opcode::Lfd => float_load_store(memory::lfd),
        Opcode::Lfdu => float_load_store(memory::lfdu),
        Opcode::Lfdux => float_load_store(memory::lfdux),
        Opcode::Lfdx => float_load_store(memory::lfdx),
        Opcode::Stfs => float_load_store(memory::stfs),
        Opcode::Stfsu => float_load_store(memory::stfsu),
        Opcode::Stfsux => float_load_store(memory::stfsux),
        Opcode::Stfsx => float_load_store(memory::stfsx),
        Opcode::Stfd => float_load_store(memory::stfd),
        Opcode::Stfdu => float_load_store(memory::stfdu),
        Opcode::Stfdux => float_load_store(memory::stfdux),
        Opcode::Stfdx => float_load_store(memory::stfdx),
        Opcode::Stfiwx => float_load_store(memory::stfiwx),

        // floating point arithmetic
        Opcode::Fadd => fpu(float::fadd),
        Opcode::Fadds => fpu(float::fadds),
        Opcode::Fsub => fpu(float::fsub),
        Opcode::Fsubs => fpu(float::fsubs),
        Opcode::Fmul => OpInfo::new(float::fmul, 2, F::FPU),
        Opcode::Fmuls => fpu(float::fmuls),
        Opcode::Fdiv => OpInfo::new(float::fdiv, 31, F::FPU),
        Opcode::Fdivs => OpInfo::new(float::fdivs, 17, F::FPU),
        Opcode::Fmadd => OpInfo::new(float::fmadd, 2, F::FPU),
        Opcode::Fmadds => fpu(float::fmadds),
        Opcode::Fmsub => OpInfo::new(float::fmsub, 2, F::FPU),
        Opcode::Fmsubs => fpu(float::fmsubs),
        Opcode::Fnmadd => OpInfo::new(float::fnmadd, 2, F::FPU),
        Opcode::Fnmadds => fpu(float::fnmadds),
        Opcode::Fnmsub => OpInfo::new(float::fnmsub, 2, F::FPU),
        Opcode::Fnmsubs => fpu(float::fnmsubs),
        Opcode::Fmr => fpu(float::fmr),
        Opcode::Fneg => fpu(float::fneg),
        Opcode::Fabs => fpu(float::fabs),
        Opcode::Frsp => fpu(float::frsp),
        Opcode::Fsel => fpu(float::fsel),
        Opcode::Fctiw => fpu(float::fctiw),
        Opcode::Fctiwz => fpu(float::fctiwz),
        Opcode::Fcmpo => fpu(float::fcmpo),
        Opcode::Fcmpu => fpu(float::fcmpu),

        // floating point status and control
        Opcode::Mffs => fpu(float::mffs),
        Opcode::Mtfsf => OpInfo::new(float::mtfsf, 3, F::FPU),
        Opcode::Mtfsb0 => OpInfo::new(float::mtfsb0, 3, F::FPU),
        Opcode::Mtfsb1 => OpInfo::new(float::mtfsb1, 3, F::FPU),

        Opcode::Illegal => ILLEGAL,
        _ => lookup_raw(ins),
    }
}

/// Executes a decoded instruction at PC, servicing any synchronous exception it raised.
#[inline(always)]
pub fn execute(sys: &mut System, ins: Ins, info: OpInfo) -> Step {
    sys.cpu.npc = sys.cpu.pc + 4u32;

    let mut end_block = info.ends_block();
    if info.flags.contains(OpFlags::FPU) && !sys.cpu.msr.float_available() {
        sys.cpu.exceptions |= Exceptions::FPU_UNAVAILABLE;
    } else {
        (info.handler)(sys, ins);
    }

    if sys.cpu.exceptions.intersects(SYNCHRONOUS) {
        sys.check_exceptions();
        end_block = true;
    } else if info.flags.contains(OpFlags::CHECK_EXTERNAL) {
        sys.check_external_exceptions();
    }

    sys.cpu.pc = sys.cpu.npc;

    let cycles = info.cycles as u32;
    if sys.perfmon_enabled() {
        sys.update_performance_monitor(
            cycles,
            info.flags.contains(OpFlags::LOAD_STORE) as u32,
            info.flags.contains(OpFlags::FPU) as u32,
        );
    }

    Step { cycles, end_block }
}

/// Services the ISI raised by a failed fetch at PC.
pub fn fetch_failed(sys: &mut System) -> Step {
    // the fetch already pointed NPC at the faulting address
    sys.check_exceptions();
    sys.cpu.pc = sys.cpu.npc;

    Step {
        cycles: 1,
        end_block: true,
    }
}

/// Fetches, decodes and executes the instruction at PC.
pub fn step(sys: &mut System) -> Step {
    let pc = sys.cpu.pc;
    sys.cpu.npc = pc + 4u32;

    let Some(code) = sys.fetch(pc) else {
        return fetch_failed(sys);
    };

    let ins = gekko::decode(code);
    execute(sys, ins, lookup(ins))
}

/// Whether `addr` starts a different page than `start`.
#[inline(always)]
pub(crate) fn crosses_page(start: Address, addr: Address) -> bool {
    start.page() != addr.page()
}
