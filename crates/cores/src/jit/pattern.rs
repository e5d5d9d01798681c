use gekko::InsExt;
use gekko::disasm::{Ins, Opcode};

use crate::ops::OpInfo;

/// A known shape of block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// No known pattern.
    #[default]
    None,
    /// Branching to self.
    IdleBasic,
    /// Idling by reading from a fixed memory location on a loop.
    IdleVolatileRead,
}

impl Pattern {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::IdleBasic | Self::IdleVolatileRead)
    }
}

fn is_simple_idle_loop(seq: &[Ins]) -> bool {
    matches!(seq, [ins] if ins.code == 0x4800_0000)
}

fn is_generic_volatile_read(seq: &[Ins]) -> bool {
    let [load, cmp, branch] = seq else {
        return false;
    };

    let is_load = matches!(load.op, Opcode::Lbz | Opcode::Lha | Opcode::Lhz | Opcode::Lwz);
    let is_cmp_imm = matches!(cmp.op, Opcode::Cmpi | Opcode::Cmpli);
    let is_branch_cond = matches!(branch.op, Opcode::Bc);
    let load_dst_is_cmp_src = load.gpr_d() == cmp.gpr_a();
    let is_rel_jmp_to_start =
        !branch.field_aa() && !branch.field_lk() && branch.field_bd() == -8;

    is_load && is_cmp_imm && is_branch_cond && load_dst_is_cmp_src && is_rel_jmp_to_start
}

/// Detects the pattern of a decoded block.
pub fn detect(ops: &[(Ins, OpInfo)]) -> Pattern {
    let seq: Vec<Ins> = ops.iter().map(|(ins, _)| *ins).collect();

    if is_simple_idle_loop(&seq) {
        return Pattern::IdleBasic;
    }

    if is_generic_volatile_read(&seq) {
        return Pattern::IdleVolatileRead;
    }

    Pattern::None
}
