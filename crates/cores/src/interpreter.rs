//! The reference backend: fetches, decodes and executes one instruction at a time.

use cpucore::cores::CpuCore;
use cpucore::system::System;

use crate::ops;

/// Executes exactly one instruction and services whatever it left pending. The scheduler is
/// advanced first and the slice is cut so that events are looked at again on the next step.
pub(crate) fn single_step(sys: &mut System) {
    sys.advance();
    ops::step(sys);

    sys.scheduler.set_slice_length(1);
    sys.cpu.downcount = 0;

    if !sys.cpu.exceptions.is_empty() {
        sys.check_exceptions();
        sys.cpu.pc = sys.cpu.npc;
    }
}

/// Whether execution must stop at PC because of a breakpoint.
#[inline(always)]
pub(crate) fn stop_at_breakpoint(sys: &mut System) -> bool {
    sys.config.enable_debugging && sys.debug.is_breakpoint(sys.cpu.pc) && sys.check_breakpoints()
}

#[derive(Debug, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

impl CpuCore for Interpreter {
    fn single_step(&mut self, sys: &mut System) {
        single_step(sys);
    }

    fn run(&mut self, sys: &mut System) {
        while sys.control.is_running() {
            sys.advance();

            // nothing is cached, so code changes are of no interest
            sys.code_changes.clear();

            while sys.cpu.downcount > 0 && sys.control.is_running() {
                if stop_at_breakpoint(sys) {
                    return;
                }

                let step = ops::step(sys);
                sys.cpu.downcount -= step.cycles as i32;
            }
        }
    }

    fn name(&self) -> &'static str {
        "Interpreter"
    }
}

#[cfg(test)]
mod test {
    use cpucore::system::control::CpuState;
    use cpucore::system::debug::Breakpoint;
    use cpucore::system::scheduler::FromThread;
    use gekko::{Address, Exceptions};

    use super::*;
    use crate::ops::test::{CODE, system};

    fn load(sys: &mut System, code: &[u32]) {
        for (i, word) in code.iter().enumerate() {
            sys.mem
                .write(Address(CODE + 4 * i as u32), &word.to_be_bytes());
        }

        sys.cpu.pc = Address(CODE);
    }

    fn run_for(sys: &mut System, cycles: u64) {
        let stop = sys.events.stop;
        sys.schedule_event(cycles, stop, 0, FromThread::Cpu);
        sys.control.set_state(CpuState::Running);
        Interpreter.run(sys);
        sys.remove_event(stop);
    }

    #[test]
    fn steps_one_instruction() {
        let mut sys = system();
        // li r3, 7; li r4, 8
        load(&mut sys, &[0x3860_0007, 0x3880_0008]);

        Interpreter.single_step(&mut sys);
        assert_eq!(sys.cpu.gpr[3], 7);
        assert_eq!(sys.cpu.gpr[4], 0);
        assert_eq!(sys.cpu.pc.value(), CODE + 4);
        assert_eq!(sys.cpu.downcount, 0);
    }

    #[test]
    fn masked_decrementer_stays_pending() {
        let mut sys = system();
        sys.cpu.msr.set_interrupts(false);
        sys.cpu.exceptions |= Exceptions::DECREMENTER;
        // nop
        load(&mut sys, &[0x6000_0000]);

        Interpreter.single_step(&mut sys);
        assert_eq!(sys.cpu.pc.value(), CODE + 4);
        assert!(sys.cpu.exceptions.contains(Exceptions::DECREMENTER));
    }

    #[test]
    fn runs_until_stopped() {
        let mut sys = system();
        // addi r3, r3, 1; b -4
        load(&mut sys, &[0x3863_0001, 0x4BFF_FFFC]);

        run_for(&mut sys, 100);
        assert!(sys.control.is_stepping());
        assert!(sys.cpu.gpr[3] >= 40);
        assert!(sys.cpu.gpr[3] <= 60);
    }

    #[test]
    fn stops_at_breakpoint() {
        let mut sys = system();
        sys.config.enable_debugging = true;
        sys.debug.add_breakpoint(Breakpoint::new(Address(CODE + 8)));
        // li r3, 1; li r4, 2; li r5, 3; b 0
        load(&mut sys, &[0x3860_0001, 0x3880_0002, 0x38A0_0003, 0x4800_0000]);

        run_for(&mut sys, 1000);
        assert_eq!(sys.cpu.pc.value(), CODE + 8);
        assert_eq!(sys.cpu.gpr[4], 2);
        assert_eq!(sys.cpu.gpr[5], 0);
        assert!(sys.control.is_stepping());
    }
}
