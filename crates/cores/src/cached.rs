//! A backend which decodes each block once and replays the decoded instructions.

use cpucore::cores::CpuCore;
use cpucore::state::Archive;
use cpucore::system::System;
use gekko::Address;
use rustc_hash::FxHashMap;

use crate::block::{self, Block};
use crate::{interpreter, ops};

/// Blocks are keyed by their effective start address along with MSR\[IR\], since the same
/// effective address maps different code depending on translation.
type Key = (bool, Address);

#[derive(Debug, Default)]
pub struct CachedInterpreter {
    blocks: FxHashMap<Key, Block>,
}

impl CachedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drops every block touched by a pending code change.
    fn apply_code_changes(&mut self, sys: &mut System) {
        if sys.code_changes.is_empty() {
            return;
        }

        for change in sys.take_code_changes() {
            let before = self.blocks.len();
            self.blocks.retain(|_, block| !block.is_affected_by(&change));

            let dropped = before - self.blocks.len();
            if dropped > 0 {
                tracing::trace!(?change, dropped, "dropped cached blocks");
            }
        }
    }

    /// Executes the block at PC, decoding it first if needed. Returns the cycles it took.
    fn execute(&mut self, sys: &mut System) -> u32 {
        let limit = block::breakpoint_limit(sys);
        let key = (sys.cpu.msr.instr_addr_translation(), sys.cpu.pc);

        // a breakpoint may have been added inside the block since it was cached
        if let Some(block) = self.blocks.get(&key)
            && block.ops.len() as u32 <= limit
        {
            return block::run(sys, block).cycles;
        }

        let Some(block) = block::compile(sys, limit) else {
            return ops::fetch_failed(sys).cycles;
        };

        let cycles = block::run(sys, &block).cycles;

        // a block cut short by a breakpoint is only good until the breakpoint goes away
        if limit == u32::MAX {
            self.blocks.insert(key, block);
        }

        cycles
    }
}

impl CpuCore for CachedInterpreter {
    fn single_step(&mut self, sys: &mut System) {
        interpreter::single_step(sys);
        self.apply_code_changes(sys);
    }

    fn run(&mut self, sys: &mut System) {
        while sys.control.is_running() {
            sys.advance();
            self.apply_code_changes(sys);

            while sys.cpu.downcount > 0 && sys.control.is_running() {
                if interpreter::stop_at_breakpoint(sys) {
                    return;
                }

                let cycles = self.execute(sys);
                sys.cpu.downcount -= cycles as i32;
                self.apply_code_changes(sys);
            }
        }
    }

    fn name(&self) -> &'static str {
        "Cached Interpreter"
    }

    fn do_state(&mut self, _: &mut System, ar: &mut Archive) {
        if ar.is_reading() {
            self.clear_cache();
        }
    }

    fn clear_cache(&mut self) {
        tracing::debug!(blocks = self.blocks.len(), "clearing block cache");
        self.blocks.clear();
    }
}
