//! Breakpoints and memory checks.

pub mod condition;

use bitflags::bitflags;
use gekko::{Address, Exceptions, Spr};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

pub use condition::{Condition, ConditionError};

use crate::system::System;

bitflags! {
    /// Kinds of memory accesses a memory check watches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// An instruction breakpoint.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub address: Address,
    pub enabled: bool,
    /// Only hit when this evaluates to a non-zero value.
    pub condition: Option<Condition>,
    /// Whether to stop execution when hit.
    pub break_on_hit: bool,
    /// Whether to log the registers when hit.
    pub log_on_hit: bool,
    /// Whether to remove the breakpoint after its first hit.
    pub temporary: bool,
}

impl Breakpoint {
    /// An enabled, unconditional breakpoint which stops execution.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            enabled: true,
            condition: None,
            break_on_hit: true,
            log_on_hit: false,
            temporary: false,
        }
    }

    /// A breakpoint which is removed after its first hit (e.g. "run to cursor").
    pub fn temporary(address: Address) -> Self {
        Self {
            temporary: true,
            ..Self::new(address)
        }
    }
}

/// A memory check: a watch over a range of addresses.
#[derive(Debug, Clone)]
pub struct MemCheck {
    /// First address of the range, inclusive.
    pub start: Address,
    /// Last address of the range, inclusive.
    pub end: Address,
    pub access: Access,
    /// Only hit when this evaluates to a non-zero value.
    pub condition: Option<Condition>,
    pub break_on_hit: bool,
    pub log_on_hit: bool,
    /// Number of times this memory check was hit.
    pub hits: u64,
}

impl MemCheck {
    /// A memory check which stops execution when hit.
    pub fn new(start: Address, end: Address, access: Access) -> Self {
        Self {
            start,
            end,
            access,
            condition: None,
            break_on_hit: true,
            log_on_hit: false,
            hits: 0,
        }
    }

    /// Whether this memory check watches more than a single address.
    #[inline(always)]
    pub fn is_ranged(&self) -> bool {
        self.start != self.end
    }

    /// Whether an access of `size` bytes at `addr` overlaps the watched range.
    #[inline(always)]
    pub fn overlaps(&self, addr: Address, size: u32) -> bool {
        let last = addr.value().wrapping_add(size.saturating_sub(1));
        self.end.value() >= addr.value() && last >= self.start.value()
    }
}

/// Breakpoints and memory checks.
#[derive(Debug, Default)]
pub struct Debugger {
    breakpoints: IndexMap<Address, Breakpoint, FxBuildHasher>,
    memchecks: Vec<MemCheck>,
}

impl Debugger {
    /// Adds a breakpoint, replacing any other at the same address.
    pub fn add_breakpoint(&mut self, breakpoint: Breakpoint) {
        self.breakpoints.insert(breakpoint.address, breakpoint);
    }

    /// Removes the breakpoint at `address`. Returns whether there was one.
    pub fn remove_breakpoint(&mut self, address: Address) -> bool {
        self.breakpoints.shift_remove(&address).is_some()
    }

    /// Enables or disables the breakpoint at `address`. Returns whether there was one.
    pub fn set_breakpoint_enabled(&mut self, address: Address, enabled: bool) -> bool {
        self.breakpoints
            .get_mut(&address)
            .map(|bp| bp.enabled = enabled)
            .is_some()
    }

    pub fn breakpoint(&self, address: Address) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    /// Whether an enabled breakpoint exists at `address`.
    #[inline(always)]
    pub fn is_breakpoint(&self, address: Address) -> bool {
        self.breakpoints.get(&address).is_some_and(|bp| bp.enabled)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    /// Removes every temporary breakpoint.
    pub fn clear_temporary_breakpoints(&mut self) {
        self.breakpoints.retain(|_, bp| !bp.temporary);
    }

    pub fn add_memcheck(&mut self, memcheck: MemCheck) {
        self.memchecks.retain(|m| m.start != memcheck.start || m.end != memcheck.end);
        self.memchecks.push(memcheck);
    }

    /// Removes every memory check starting at `start`. Returns whether there was any.
    pub fn remove_memcheck(&mut self, start: Address) -> bool {
        let len = self.memchecks.len();
        self.memchecks.retain(|m| m.start != start);
        self.memchecks.len() != len
    }

    pub fn memchecks(&self) -> &[MemCheck] {
        &self.memchecks
    }

    #[inline(always)]
    pub fn has_memchecks(&self) -> bool {
        !self.memchecks.is_empty()
    }

    pub fn clear_memchecks(&mut self) {
        self.memchecks.clear();
    }
}

impl System {
    /// Checks the breakpoint at the current PC. Returns whether execution must stop before the
    /// instruction runs.
    pub fn check_breakpoints(&mut self) -> bool {
        let pc = self.cpu.pc;
        let Some(bp) = self.debug.breakpoints.get(&pc) else {
            return false;
        };

        if !bp.enabled {
            return false;
        }

        let Breakpoint {
            condition,
            break_on_hit,
            log_on_hit,
            temporary,
            ..
        } = bp.clone();

        if let Some(condition) = condition
            && !condition.is_true(self)
        {
            return false;
        }

        self.modules.scripting.on_instruction_hit(pc);

        if break_on_hit {
            self.control.request_break();
            if self.modules.debug_server.is_active() {
                self.modules.debug_server.take_control();
            }
        }

        if log_on_hit {
            let gpr = &self.cpu.gpr;
            tracing::info!(
                "BP {pc} {}({:08X} {:08X} {:08X} {:08X} {:08X} {:08X} {:08X} {:08X} {:08X} {:08X}) \
                 LR={:08X}",
                self.modules.symbols.symbol(pc).unwrap_or_default(),
                gpr[3],
                gpr[4],
                gpr[5],
                gpr[6],
                gpr[7],
                gpr[8],
                gpr[9],
                gpr[10],
                gpr[11],
                gpr[12],
                self.cpu.spr(Spr::Lr),
            );
        }

        if temporary {
            self.debug.remove_breakpoint(pc);
        }

        break_on_hit
    }

    /// Checks the memory checks against an access of `size` bytes at `addr`. Returns whether a
    /// memory check stopped execution, in which case a fake DSI was raised and the access must
    /// not complete.
    pub fn check_memchecks(&mut self, addr: Address, size: u32, write: bool, value: u64) -> bool {
        if !self.debug.has_memchecks() || self.control.is_stepping() {
            return false;
        }

        let access = if write { Access::WRITE } else { Access::READ };
        let mut stop = false;
        for index in 0..self.debug.memchecks.len() {
            let memcheck = &self.debug.memchecks[index];
            if !memcheck.access.contains(access) || !memcheck.overlaps(addr, size) {
                continue;
            }

            if let Some(condition) = memcheck.condition.clone()
                && !condition.is_true(self)
            {
                continue;
            }

            let memcheck = &mut self.debug.memchecks[index];
            memcheck.hits += 1;
            let (log_on_hit, break_on_hit) = (memcheck.log_on_hit, memcheck.break_on_hit);

            self.modules.scripting.on_memory_hit(addr, write, value);

            if log_on_hit {
                tracing::info!(
                    pc = ?self.cpu.pc,
                    symbol = self.modules.symbols.symbol(self.cpu.pc).unwrap_or_default(),
                    "MBP {} ({size} bytes) {value:X} at {addr}",
                    if write { "write" } else { "read" },
                );
            }

            if break_on_hit {
                stop = true;
            }
        }

        if stop {
            self.control.request_break();
            self.cpu.exceptions |= Exceptions::DSI | Exceptions::FAKE_MEMCHECK_HIT;
        }

        stop
    }

    /// A human readable dump of the user level registers.
    pub fn dump_registers(&self) -> String {
        let cpu = &self.cpu;
        let row = |regs: &[(String, u32)]| {
            regs.iter()
                .map(|(name, value)| format!("{name:<5} {value:08X}"))
                .collect::<Vec<_>>()
                .join("  ")
        };

        let mut lines = vec![
            row(&[
                ("pc".into(), cpu.pc.value()),
                ("npc".into(), cpu.npc.value()),
                ("msr".into(), cpu.msr.to_bits()),
                ("cr".into(), cpu.cr.get()),
            ]),
            row(&[
                ("lr".into(), cpu.spr(Spr::Lr)),
                ("ctr".into(), cpu.spr(Spr::Ctr)),
                ("xer".into(), cpu.xer()),
                ("fpscr".into(), cpu.fpscr.to_bits()),
            ]),
        ];

        for chunk in (0..32).collect::<Vec<_>>().chunks(4) {
            let regs = chunk
                .iter()
                .map(|&i| (format!("r{i}"), cpu.gpr[i]))
                .collect::<Vec<_>>();
            lines.push(row(&regs));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::modules::ScriptingModule;
    use crate::system::control::CpuState;
    use crate::system::test::system;

    #[derive(Default)]
    struct CountingScripts(Arc<AtomicU32>);

    impl ScriptingModule for CountingScripts {
        fn on_instruction_hit(&mut self, _: Address) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn on_memory_hit(&mut self, _: Address, _: bool, _: u64) {
            self.0.fetch_add(0x100, Ordering::Relaxed);
        }
    }

    #[test]
    fn breakpoint_crud() {
        let mut debug = Debugger::default();
        debug.add_breakpoint(Breakpoint::new(Address(0x8000_3100)));
        debug.add_breakpoint(Breakpoint::temporary(Address(0x8000_3104)));
        assert!(debug.is_breakpoint(Address(0x8000_3100)));

        assert!(debug.set_breakpoint_enabled(Address(0x8000_3100), false));
        assert!(!debug.is_breakpoint(Address(0x8000_3100)));
        assert!(!debug.set_breakpoint_enabled(Address(0x8000_3108), false));

        debug.clear_temporary_breakpoints();
        assert!(debug.breakpoint(Address(0x8000_3104)).is_none());
        assert!(debug.remove_breakpoint(Address(0x8000_3100)));
        assert_eq!(debug.breakpoints().count(), 0);
    }

    #[test]
    fn temporary_breakpoint_is_removed_after_hit() {
        let mut sys = system();
        let calls = Arc::new(AtomicU32::new(0));
        sys.modules.scripting = Box::new(CountingScripts(calls.clone()));
        sys.control.set_state(CpuState::Running);

        sys.cpu.pc = Address(0x100);
        sys.debug.add_breakpoint(Breakpoint::temporary(Address(0x100)));

        assert!(sys.check_breakpoints());
        assert!(sys.control.is_stepping());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(sys.debug.breakpoint(Address(0x100)).is_none());

        // gone
        sys.control.set_state(CpuState::Running);
        assert!(!sys.check_breakpoints());
        assert!(sys.control.is_running());
    }

    #[test]
    fn conditional_breakpoint() {
        let mut sys = system();
        sys.control.set_state(CpuState::Running);
        sys.cpu.pc = Address(0x100);

        let mut bp = Breakpoint::new(Address(0x100));
        bp.condition = Some(Condition::parse("r3 == 5").unwrap());
        sys.debug.add_breakpoint(bp);

        assert!(!sys.check_breakpoints());
        sys.cpu.gpr[3] = 5;
        assert!(sys.check_breakpoints());

        // conditions don't consume the breakpoint
        assert!(sys.debug.is_breakpoint(Address(0x100)));
    }

    #[test]
    fn log_only_breakpoint_keeps_running() {
        let mut sys = system();
        sys.control.set_state(CpuState::Running);
        sys.cpu.pc = Address(0x200);

        let mut bp = Breakpoint::new(Address(0x200));
        bp.break_on_hit = false;
        bp.log_on_hit = true;
        sys.debug.add_breakpoint(bp);

        assert!(!sys.check_breakpoints());
        assert!(sys.control.is_running());
    }

    #[test]
    fn memcheck_ranges() {
        let memcheck = MemCheck::new(Address(0x100), Address(0x10F), Access::READ | Access::WRITE);
        assert!(memcheck.is_ranged());
        assert!(memcheck.overlaps(Address(0x0FE), 4));
        assert!(memcheck.overlaps(Address(0x10F), 1));
        assert!(!memcheck.overlaps(Address(0x0FC), 4));
        assert!(!memcheck.overlaps(Address(0x110), 8));
    }

    #[test]
    fn memcheck_hits() {
        let mut sys = system();
        let calls = Arc::new(AtomicU32::new(0));
        sys.modules.scripting = Box::new(CountingScripts(calls.clone()));
        sys.control.set_state(CpuState::Running);

        let mut memcheck = MemCheck::new(Address(0x300), Address(0x300), Access::WRITE);
        memcheck.break_on_hit = false;
        memcheck.log_on_hit = true;
        sys.debug.add_memcheck(memcheck);

        assert!(!sys.check_memchecks(Address(0x300), 4, false, 0));
        assert!(!sys.check_memchecks(Address(0x300), 4, true, 0));
        assert_eq!(sys.debug.memchecks()[0].hits, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 0x100);
        assert!(sys.cpu.exceptions.is_empty());
    }

    #[test]
    fn memchecks_are_ignored_while_stepping() {
        let mut sys = system();
        sys.debug
            .add_memcheck(MemCheck::new(Address(0x300), Address(0x303), Access::READ));

        assert!(sys.control.is_stepping());
        assert!(!sys.check_memchecks(Address(0x300), 4, false, 0));
        assert_eq!(sys.debug.memchecks()[0].hits, 0);
    }

    #[test]
    fn register_dump() {
        let mut sys = system();
        sys.cpu.pc = Address(0x8000_3100);
        sys.cpu.npc = Address(0x8000_3104);
        sys.cpu.msr = gekko::MachineState::from_bits(0x2032);
        sys.cpu.gpr[1] = 0x8000_0000;
        sys.cpu.gpr[31] = 0xDEAD_BEEF;
        sys.cpu.set_spr(Spr::Lr, 0x8000_3000);

        insta::assert_snapshot!(sys.dump_registers(), @r"
        pc    80003100  npc   80003104  msr   00002032  cr    00000000
        lr    80003000  ctr   00000000  xer   00000000  fpscr 00000000
        r0    00000000  r1    80000000  r2    00000000  r3    00000000
        r4    00000000  r5    00000000  r6    00000000  r7    00000000
        r8    00000000  r9    00000000  r10   00000000  r11   00000000
        r12   00000000  r13   00000000  r14   00000000  r15   00000000
        r16   00000000  r17   00000000  r18   00000000  r19   00000000
        r20   00000000  r21   00000000  r22   00000000  r23   00000000
        r24   00000000  r25   00000000  r26   00000000  r27   00000000
        r28   00000000  r29   00000000  r30   00000000  r31   DEADBEEF
        ");
    }
}
