//! Straight-line runs of decoded instructions, shared by the block based backends.

use cpucore::system::{CodeChange, System};
use gekko::Address;
use gekko::disasm::Ins;

use crate::ops::{self, OpInfo};

/// A decoded block of instructions which execute one after the other.
#[derive(Debug, Clone)]
pub struct Block {
    /// Effective address of the first instruction.
    pub start: Address,
    /// Canonical physical address of the first instruction.
    pub physical: Address,
    /// Whether the block was fetched with instruction address translation on.
    pub translated: bool,
    pub ops: Vec<(Ins, OpInfo)>,
    /// Cycles a complete run of the block takes.
    pub cycles: u32,
}

impl Block {
    /// Length of the block, in bytes.
    #[inline(always)]
    pub fn len_bytes(&self) -> u32 {
        4 * self.ops.len() as u32
    }

    /// Whether a code change touches this block.
    pub fn is_affected_by(&self, change: &CodeChange) -> bool {
        match *change {
            CodeChange::All => true,
            CodeChange::Range { start, len } => {
                let block_start = self.physical.value() as u64;
                let block_end = block_start + self.len_bytes() as u64;
                let change_start = start.value() as u64;
                let change_end = change_start + len as u64;

                block_start < change_end && change_start < block_end
            }
        }
    }
}

/// Outcome of running a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Run {
    pub cycles: u32,
    /// Number of instructions executed.
    pub executed: u32,
}

/// Decodes the block starting at PC, with at most `limit` instructions. Blocks end at the
/// first instruction which might change control flow and never cross a page boundary.
///
/// Returns `None` if PC can't be fetched, in which case an ISI is pending and NPC points at the
/// faulting address: [`ops::fetch_failed`] must be called.
pub fn compile(sys: &mut System, limit: u32) -> Option<Block> {
    let start = sys.cpu.pc;
    sys.cpu.npc = start + 4u32;
    let first = sys.fetch(start)?;
    let physical = sys
        .translate_instr(start)
        .success()
        .map_or(start, |(addr, _)| sys.mem.canonical(addr));

    let mut block = Block {
        start,
        physical,
        translated: sys.cpu.msr.instr_addr_translation(),
        ops: Vec::new(),
        cycles: 0,
    };

    let mut code = first;
    loop {
        let ins = gekko::decode(code);
        let info = ops::lookup(ins);
        block.ops.push((ins, info));
        block.cycles += info.cycles as u32;

        if info.ends_block() || block.ops.len() as u32 >= limit {
            break;
        }

        let next = start + block.len_bytes();
        if ops::crosses_page(start, next) || sys.translate_instr(next).success().is_none() {
            break;
        }

        let Some(next_code) = sys.fetch(next) else {
            break;
        };

        code = next_code;
    }

    tracing::trace!(start = ?start, instructions = block.ops.len(), "block decoded");
    Some(block)
}

/// Runs `block`, which must start at PC. Execution leaves the block early when an instruction
/// ends it (taken branch, exception) or the CPU stops running.
pub fn run(sys: &mut System, block: &Block) -> Run {
    let mut run = Run::default();
    for (i, (ins, info)) in block.ops.iter().enumerate() {
        let step = ops::execute(sys, *ins, *info);
        run.cycles += step.cycles;
        run.executed += 1;

        let expected = block.start + 4 * (i as u32 + 1);
        if step.end_block || sys.cpu.pc != expected || !sys.control.is_running() {
            break;
        }
    }

    run
}

/// Number of instructions which can run from PC before reaching a breakpoint, or `u32::MAX`
/// if breakpoints are off. A breakpoint at PC itself is ignored: it was already checked.
pub fn breakpoint_limit(sys: &System) -> u32 {
    if !sys.config.enable_debugging {
        return u32::MAX;
    }

    let pc = sys.cpu.pc.value();
    sys.debug
        .breakpoints()
        .filter(|bp| bp.enabled)
        .filter_map(|bp| bp.address.value().checked_sub(pc))
        .filter(|distance| *distance != 0)
        .map(|distance| distance.div_ceil(4))
        .min()
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod test {
    use cpucore::system::CodeChange;
    use gekko::Address;

    use super::*;
    use crate::ops::test::{CODE, system};

    fn write(sys: &mut System, addr: u32, code: &[u32]) {
        for (i, word) in code.iter().enumerate() {
            sys.mem
                .write(Address(addr + 4 * i as u32), &word.to_be_bytes());
        }
    }

    #[test]
    fn ends_at_branch() {
        let mut sys = system();
        // li r3, 1; li r4, 2; b 0; li r5, 3
        write(&mut sys, CODE, &[0x3860_0001, 0x3880_0002, 0x4800_0000, 0x38A0_0003]);
        sys.cpu.pc = Address(CODE);

        let block = compile(&mut sys, u32::MAX).expect("block should compile");
        assert_eq!(block.ops.len(), 3);
        assert_eq!(block.cycles, 3);
        assert_eq!(block.physical.value(), CODE);
    }

    #[test]
    fn respects_limit_and_pages() {
        let mut sys = system();
        write(&mut sys, 0x1FF8, &[0x3860_0001, 0x3880_0002, 0x38A0_0003]);
        sys.cpu.pc = Address(0x1FF8);

        let block = compile(&mut sys, u32::MAX).expect("block should compile");
        assert_eq!(block.ops.len(), 2);

        let block = compile(&mut sys, 1).expect("block should compile");
        assert_eq!(block.ops.len(), 1);
    }

    #[test]
    fn code_changes() {
        let mut sys = system();
        write(&mut sys, CODE, &[0x3860_0001, 0x3880_0002]);
        sys.cpu.pc = Address(CODE);

        let block = compile(&mut sys, u32::MAX).expect("block should compile");
        assert!(block.is_affected_by(&CodeChange::All));
        assert!(block.is_affected_by(&CodeChange::Range {
            start: Address(CODE + 4),
            len: 4,
        }));
        assert!(!block.is_affected_by(&CodeChange::Range {
            start: Address(CODE + 8),
            len: 32,
        }));
        assert!(!block.is_affected_by(&CodeChange::Range {
            start: Address(CODE - 32),
            len: 32,
        }));
    }

    #[test]
    fn runs_to_the_end() {
        let mut sys = system();
        sys.control.set_state(cpucore::system::control::CpuState::Running);
        write(&mut sys, CODE, &[0x3860_0001, 0x3880_0002, 0x4800_0000]);
        sys.cpu.pc = Address(CODE);

        let block = compile(&mut sys, u32::MAX).expect("block should compile");
        let ran = run(&mut sys, &block);
        assert_eq!(ran.executed, 3);
        assert_eq!(sys.cpu.gpr[3], 1);
        assert_eq!(sys.cpu.gpr[4], 2);
        assert_eq!(sys.cpu.pc.value(), CODE + 8);
    }
}
