//! The block compiling backend.
//!
//! Blocks are decoded once into threaded code (a sequence of handlers) and kept in a storage
//! indexed by start address. Blocks remember the blocks they exited to, so that hot paths chain
//! from block to block without going through the lookup tables or the dispatcher loop. Idle loops
//! are detected while chaining and skip the rest of the slice.

mod mapping;
mod pattern;
mod table;

use cpucore::cores::{CpuCore, CpuCoreKind};
use cpucore::state::Archive;
use cpucore::system::{CodeChange, System};
use gekko::Address;
use rustc_hash::FxHashSet;

pub use pattern::Pattern;

use crate::block::{self, Block};
use crate::{interpreter, ops};

/// Identifier for a block in a [`Blocks`] storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

/// A chained exit of a block.
#[derive(Debug, Clone, Copy)]
struct Link {
    target: Address,
    block: BlockId,
}

/// Most blocks exit to one of two places: the branch target or the next instruction.
const MAX_LINKS: usize = 2;

pub struct StoredBlock {
    pub inner: Block,
    pub pattern: Pattern,
    links: Vec<Link>,
    /// Blocks which might hold a link to this one.
    linked_from: Vec<BlockId>,
}

impl StoredBlock {
    fn range(&self) -> std::ops::Range<Address> {
        self.inner.physical..self.inner.physical + self.inner.len_bytes()
    }
}

/// A structure which keeps tracks of decoded [`Block`]s.
#[derive(Default)]
pub struct Blocks {
    storage: Vec<Option<StoredBlock>>,
    free: Vec<BlockId>,
    /// Blocks fetched with instruction translation on, by effective address.
    logical_mappings: mapping::Table,
    /// Blocks fetched with instruction translation off, by physical address.
    physical_mappings: mapping::Table,
    deps: mapping::DepsTable,
    temp_deps: FxHashSet<BlockId>,
}

impl Blocks {
    fn mappings(&self, translated: bool) -> &mapping::Table {
        if translated {
            &self.logical_mappings
        } else {
            &self.physical_mappings
        }
    }

    fn mappings_mut(&mut self, translated: bool) -> &mut mapping::Table {
        if translated {
            &mut self.logical_mappings
        } else {
            &mut self.physical_mappings
        }
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.storage.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a block into the storage and maps it to its start address, replacing whatever
    /// block was mapped there.
    pub fn insert(&mut self, block: Block) -> BlockId {
        if let Some(previous) = self.mappings(block.translated).get(block.start) {
            self.remove(previous);
        }

        let stored = StoredBlock {
            pattern: pattern::detect(&block.ops),
            inner: block,
            links: Vec::new(),
            linked_from: Vec::new(),
        };

        let range = stored.range();
        let (translated, start) = (stored.inner.translated, stored.inner.start);

        let id = match self.free.pop() {
            Some(id) => {
                self.storage[id.0] = Some(stored);
                id
            }
            None => {
                self.storage.push(Some(stored));
                BlockId(self.storage.len() - 1)
            }
        };

        self.mappings_mut(translated).insert(start, id);
        self.deps.mark(id, range);

        id
    }

    /// Returns the block mapped to `addr`.
    #[inline(always)]
    pub fn lookup(&self, translated: bool, addr: Address) -> Option<BlockId> {
        self.mappings(translated).get(addr)
    }

    #[inline(always)]
    pub fn get(&self, id: BlockId) -> Option<&StoredBlock> {
        self.storage.get(id.0)?.as_ref()
    }

    /// Chains the exit of `from` at `target` to block `to`.
    fn link(&mut self, from: BlockId, target: Address, to: BlockId) {
        let Some(Some(source)) = self.storage.get_mut(from.0) else {
            return;
        };

        if source.links.len() >= MAX_LINKS {
            return;
        }

        source.links.push(Link { target, block: to });
        if let Some(Some(dest)) = self.storage.get_mut(to.0) {
            dest.linked_from.push(from);
        }
    }

    /// Removes a block, cutting every link into it.
    fn remove(&mut self, id: BlockId) {
        let Some(stored) = self.storage.get_mut(id.0).and_then(Option::take) else {
            return;
        };

        let (translated, start) = (stored.inner.translated, stored.inner.start);
        if self.mappings(translated).get(start) == Some(id) {
            self.mappings_mut(translated).remove(start);
        }

        self.deps.unmark(id, stored.range());

        for from in stored.linked_from {
            if let Some(Some(source)) = self.storage.get_mut(from.0) {
                source.links.retain(|link| link.block != id);
            }
        }

        self.free.push(id);
    }

    /// Removes every block decoded from the physical range `start..start + len`.
    pub fn invalidate(&mut self, start: Address, len: u32) {
        if len == 0 {
            return;
        }

        let change = CodeChange::Range { start, len };
        let last_page = (start.value().saturating_add(len - 1)) >> 12;

        let mut temp_deps = std::mem::take(&mut self.temp_deps);
        for page in start.page()..=last_page {
            let Some(deps) = self.deps.get(page) else {
                continue;
            };

            temp_deps.extend(deps.iter().copied().filter(|id| {
                self.get(*id)
                    .is_some_and(|stored| stored.inner.is_affected_by(&change))
            }));
        }

        if !temp_deps.is_empty() {
            tracing::trace!(?start, len, blocks = temp_deps.len(), "invalidating blocks");
        }

        for id in temp_deps.drain() {
            self.remove(id);
        }

        self.temp_deps = temp_deps;
    }

    /// Removes every block.
    pub fn clear(&mut self) {
        self.storage.clear();
        self.free.clear();
        self.logical_mappings.clear();
        self.physical_mappings.clear();
        self.deps.clear();
    }
}

/// JIT configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of instructions per block.
    pub instr_per_block: u32,
    /// Whether detected idle loops skip the rest of the slice.
    pub idle_skipping: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instr_per_block: 128,
            idle_skipping: true,
        }
    }
}

pub struct Core {
    pub config: Config,
    pub blocks: Blocks,
    kind: CpuCoreKind,
}

impl Core {
    pub fn new(kind: CpuCoreKind, config: Config) -> Self {
        Self {
            config,
            blocks: Blocks::default(),
            kind,
        }
    }

    /// Drops every block touched by a pending code change.
    fn apply_code_changes(&mut self, sys: &mut System) {
        if sys.code_changes.is_empty() {
            return;
        }

        for change in sys.take_code_changes() {
            match change {
                CodeChange::Range { start, len } => self.blocks.invalidate(start, len),
                CodeChange::All => {
                    tracing::debug!(blocks = self.blocks.len(), "clearing every block");
                    self.blocks.clear();
                }
            }
        }
    }

    /// Decodes the block at PC with at most `limit` instructions.
    fn compile(&mut self, sys: &mut System, limit: u32) -> Option<Block> {
        let _span = tracing::trace_span!("compiling new block", addr = ?sys.cpu.pc).entered();
        block::compile(sys, limit.min(self.config.instr_per_block))
    }

    /// Executes a chain of blocks starting at PC. Returns the cycles it took.
    fn execute(&mut self, sys: &mut System) -> u32 {
        let limit = block::breakpoint_limit(sys);
        let translated = sys.cpu.msr.instr_addr_translation();

        let first = self
            .blocks
            .lookup(translated, sys.cpu.pc)
            .filter(|id| {
                self.blocks
                    .get(*id)
                    .is_some_and(|b| b.inner.ops.len() as u32 <= limit)
            });

        let mut id = match first {
            Some(id) => id,
            None => {
                let Some(block) = self.compile(sys, limit) else {
                    return ops::fetch_failed(sys).cycles;
                };

                if limit < self.config.instr_per_block {
                    // cut short by a breakpoint, so not worth keeping
                    return block::run(sys, &block).cycles;
                }

                self.blocks.insert(block)
            }
        };

        let budget = sys.cpu.downcount.max(0) as u32;
        let follow_links = !sys.config.enable_debugging;

        let mut cycles = 0;
        let mut last_followed = None;
        loop {
            let Some(stored) = self.blocks.get(id) else {
                break;
            };

            cycles += block::run(sys, &stored.inner).cycles;

            // if we have reached the cycle limit or something needs attention, don't follow
            // links, just exit
            if !follow_links
                || cycles >= budget
                || !sys.code_changes.is_empty()
                || !sys.control.is_running()
            {
                break;
            }

            let pc = sys.cpu.pc;
            let translated = sys.cpu.msr.instr_addr_translation();
            let same_space = translated == stored.inner.translated;
            let linked = stored
                .links
                .iter()
                .find(|link| same_space && link.target == pc)
                .map(|link| link.block);

            let next = match linked {
                Some(next) => next,
                None => {
                    let Some(next) = self.blocks.lookup(translated, pc) else {
                        break;
                    };

                    if same_space {
                        self.blocks.link(id, pc, next);
                    }

                    next
                }
            };

            // following the same idle loop twice in a row means nothing happens until the
            // next event
            let idle = self
                .blocks
                .get(next)
                .is_some_and(|stored| stored.pattern.is_idle());

            if idle
                && last_followed == Some(next)
                && self.config.idle_skipping
                && !sys.perfmon_enabled()
            {
                tracing::trace!(pc = ?pc, "idle loop detected, skipping slice");
                cycles = cycles.max(budget);
                break;
            }

            last_followed = Some(next);
            id = next;
        }

        cycles
    }
}

impl CpuCore for Core {
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
                sys.cpu.downcount -= cycles.min(i32::MAX as u32) as i32;
                self.apply_code_changes(sys);
            }
        }
    }

    fn name(&self) -> &'static str {
        match self.kind {
            CpuCoreKind::JitArm64 => "JITARM64",
            _ => "JIT64",
        }
    }

    fn do_state(&mut self, _: &mut System, ar: &mut Archive) {
        if ar.is_reading() {
            self.clear_cache();
        }
    }

    fn clear_cache(&mut self) {
        self.blocks.clear();
    }
}
