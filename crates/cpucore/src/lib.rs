//! The Gekko/Broadway CPU core: the machine state around the processor, the execution backend
//! controller and the top level lifecycle.

pub mod cores;
pub mod modules;
pub mod primitive;
pub mod state;
pub mod system;

pub use gekko::{self, Address, Cycles};
pub use primitive::Primitive;

use gekko::cache::Cache;
use gekko::{Exceptions, FloatControlReg, MachineState, Variant};

use crate::cores::{CoreMode, CoreProvider, Cores, CpuCore, CpuCoreKind};
use crate::modules::Modules;
use crate::state::{Archive, StateError};
use crate::system::control::{CpuState, RunState};
use crate::system::scheduler::{EventType, FromThread, RemoteQueue};
use crate::system::{CodeChange, Config, System};

fn cache_state(ar: &mut Archive, cache: &mut Cache) {
    ar.slice(&mut cache.data);
    ar.slice(&mut cache.plru);
    ar.slice(&mut cache.valid);
    ar.slice(&mut cache.addrs);
    ar.slice(&mut cache.modified);
}

/// A handle which other threads use to talk to a running CPU.
#[derive(Debug, Clone)]
pub struct Remote {
    run_state: RunState,
    queue: RemoteQueue,
    interrupt_line: EventType,
    invalidate_icache: EventType,
}

impl Remote {
    /// Asserts or deasserts the external interrupt line at the start of the next slice.
    pub fn set_interrupt_line(&self, asserted: bool) {
        self.queue.push(0, self.interrupt_line, asserted as u64);
    }

    /// Invalidates the instruction cache line containing `addr` at the start of the next slice.
    pub fn invalidate_icache_line(&self, addr: Address) {
        self.queue.push(0, self.invalidate_icache, addr.value() as u64);
    }

    /// Stops the CPU at the next instruction or block boundary.
    pub fn request_break(&self) {
        self.run_state.request_break();
    }

    pub fn state(&self) -> CpuState {
        self.run_state.get()
    }
}

/// The emulated PowerPC processor.
pub struct PowerPc {
    /// System state.
    pub sys: System,
    cores: Cores,
}

impl PowerPc {
    pub fn new(config: Config, modules: Modules, provider: Box<dyn CoreProvider>) -> Self {
        Self {
            sys: System::new(config, modules),
            cores: Cores::new(provider),
        }
    }

    fn variant(&self) -> Variant {
        if self.sys.config.is_wii {
            Variant::Broadway
        } else {
            Variant::Gekko
        }
    }

    /// Brings the processor up: resets it and initializes the configured backend. Must be called
    /// on the CPU thread.
    pub fn init(&mut self) {
        self.sys.control.bind_cpu_thread();
        self.reset();

        let requested = self.sys.config.cpu_core;
        self.cores.init(&mut self.sys, requested);

        self.sys.cpu.icache.reset();
        self.sys.cpu.dcache.reset();

        if self.sys.config.enable_debugging {
            self.sys.debug.clear_temporary_breakpoints();
        }

        tracing::info!(
            variant = ?self.variant(),
            core = self.cores.active().name(),
            dcache = self.sys.config.enable_dcache,
            "cpu initialized"
        );
    }

    /// Puts the processor in its power-on state. Breakpoints and memory checks are kept.
    pub fn reset(&mut self) {
        let cpu = &mut self.sys.cpu;
        cpu.pagetable_base = 0;
        cpu.pagetable_hashmask = 0;
        cpu.tlb.clear();
        cpu.reset_registers(self.variant());
        cpu.icache.reset();
        cpu.dcache.reset();

        self.sys.ibat_updated();
        self.sys.dbat_updated();
        self.sys.code_changes.push(CodeChange::All);

        // restart the timers from the reset TL/TU and DEC
        self.sys.time_base_set();
        self.sys.decrementer_set();
    }

    /// Shuts every backend down.
    pub fn shutdown(&mut self) {
        self.cores.shutdown(&mut self.sys);
        self.sys.control.set_state(CpuState::PowerDown);
    }

    /// Executes a single instruction on the active backend.
    pub fn single_step(&mut self) {
        self.cores.active_mut().single_step(&mut self.sys);
    }

    /// Runs the active backend until the CPU stops running.
    pub fn run_loop(&mut self) {
        // resuming from a breakpoint must not hit it again
        if self.sys.config.enable_debugging
            && self.sys.control.is_running()
            && self.sys.debug.is_breakpoint(self.sys.cpu.pc)
        {
            self.single_step();
        }

        self.cores.active_mut().run(&mut self.sys);
        self.sys.modules.host.update_disasm_dialog();
    }

    /// Runs for (at least) `cycles` cycles, or until something else stops the CPU.
    pub fn run_for(&mut self, cycles: u64) {
        let stop = self.sys.events.stop;
        self.sys.schedule_event(cycles, stop, 0, FromThread::Cpu);
        self.sys.control.set_state(CpuState::Running);

        self.run_loop();

        self.sys.remove_event(stop);
        self.sys.control.request_break();
    }

    /// The requested execution mode.
    pub fn mode(&self) -> CoreMode {
        self.cores.mode()
    }

    /// Requests an execution mode. Must be called on the CPU thread or while stopped.
    pub fn set_mode(&mut self, mode: CoreMode) {
        self.cores.set_mode(mode);
    }

    /// Injects an external backend, or removes the injected one with `None`.
    pub fn inject_external_core(&mut self, core: Option<Box<dyn CpuCore>>) {
        self.cores.inject(&mut self.sys, core);
    }

    /// Name of the active backend.
    pub fn core_name(&self) -> &'static str {
        self.cores.active().name()
    }

    pub fn available_cores() -> Vec<CpuCoreKind> {
        CpuCoreKind::available_cores()
    }

    pub fn default_core() -> CpuCoreKind {
        CpuCoreKind::default_core()
    }

    /// A handle for other threads.
    pub fn remote(&self) -> Remote {
        Remote {
            run_state: self.sys.control.run_state(),
            queue: self.sys.scheduler.remote(),
            interrupt_line: self.sys.events.interrupt_line,
            invalidate_icache: self.sys.events.invalidate_icache,
        }
    }

    /// Transfers the processor state, followed by the timers, the scheduler, memory and the
    /// active backend's state.
    pub fn do_state(&mut self, ar: &mut Archive) {
        let cpu = &mut self.sys.cpu;
        ar.slice(&mut cpu.gpr);
        ar.value(&mut cpu.pc);
        ar.value(&mut cpu.npc);
        ar.slice(&mut cpu.cr.fields);
        ar.bits32(&mut cpu.msr, |msr| msr.to_bits(), MachineState::from_bits);
        ar.bits32(&mut cpu.fpscr, |fpscr| fpscr.to_bits(), FloatControlReg::from_bits);
        ar.bits32(&mut cpu.exceptions, |e| e.bits(), Exceptions::from_bits_retain);
        ar.value(&mut cpu.downcount);
        ar.value(&mut cpu.xer_ca);
        ar.value(&mut cpu.xer_so_ov);
        ar.value(&mut cpu.xer_stringctrl);
        ar.slice(&mut cpu.ps);
        ar.slice(&mut cpu.sr);
        ar.slice(&mut cpu.spr);
        ar.value(&mut cpu.tlb);
        ar.value(&mut cpu.pagetable_base);
        ar.value(&mut cpu.pagetable_hashmask);
        ar.bool(&mut cpu.reserve);
        ar.value(&mut cpu.reserve_address);
        cache_state(ar, &mut cpu.icache.cache);
        cache_state(ar, &mut cpu.dcache);

        self.sys.timers.do_state(ar);
        self.sys.scheduler.do_state(ar);
        self.sys.mem.do_state(ar);

        if ar.is_reading() {
            if self.sys.config.enable_dcache {
                self.sys.cpu.dcache.reset();
            } else {
                let cpu = &mut self.sys.cpu;
                cpu.dcache.flush_all(&mut self.sys.mem);
            }

            self.sys.cpu.update_fp_env();
            self.sys.ibat_updated();
            self.sys.dbat_updated();
        }

        self.cores.active_mut().do_state(&mut self.sys, ar);
    }

    /// Saves the whole state into a new buffer.
    pub fn save_state(&mut self) -> Result<Vec<u8>, StateError> {
        let mut ar = Archive::writer();
        self.do_state(&mut ar);
        ar.finish()
    }

    /// Loads a state saved with [`PowerPc::save_state`].
    pub fn load_state(&mut self, data: Vec<u8>) -> Result<(), StateError> {
        let mut ar = Archive::reader(data);
        self.do_state(&mut ar);
        ar.finish().map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use gekko::{CondReg, Spr};

    use super::*;
    use crate::system::debug::Breakpoint;
    use crate::system::mem::RAM_SIZE;

    /// A backend which treats every instruction as a 1 cycle no-op.
    struct Nop;

    impl CpuCore for Nop {
        fn single_step(&mut self, sys: &mut System) {
            sys.cpu.pc += 4;
            sys.cpu.npc = sys.cpu.pc;
        }

        fn run(&mut self, sys: &mut System) {
            while sys.control.is_running() {
                sys.advance();
                while sys.cpu.downcount > 0 && sys.control.is_running() {
                    if sys.config.enable_debugging
                        && sys.debug.is_breakpoint(sys.cpu.pc)
                        && sys.check_breakpoints()
                    {
                        return;
                    }

                    self.single_step(sys);
                    sys.cpu.downcount -= 1;
                }
            }
        }

        fn name(&self) -> &'static str {
            "Nop"
        }
    }

    struct NopProvider;

    impl CoreProvider for NopProvider {
        fn interpreter(&mut self) -> Box<dyn CpuCore> {
            Box::new(Nop)
        }

        fn create(&mut self, _: CpuCoreKind) -> Option<Box<dyn CpuCore>> {
            None
        }
    }

    fn powerpc(config: Config) -> PowerPc {
        let mut ppc = PowerPc::new(config, Modules::default(), Box::new(NopProvider));
        ppc.init();
        ppc
    }

    #[test]
    fn gamecube_reset() {
        let ppc = powerpc(Config::default());
        assert_eq!(ppc.sys.cpu.spr(Spr::Pvr), 0x0008_3214);
        assert_eq!(ppc.sys.cpu.spr(Spr::Dec), 0xFFFF_FFFF);
        assert_eq!(ppc.sys.cpu.spr(Spr::Hid1), 0x8000_0000);
        assert!(ppc.sys.cpu.cr.fields.iter().all(|&f| f == CondReg::RESET_FIELD));
        assert_eq!(ppc.mode(), CoreMode::Interpreter);
        assert_eq!(ppc.core_name(), "Nop");
    }

    #[test]
    fn wii_reset() {
        let ppc = powerpc(Config {
            is_wii: true,
            ..Default::default()
        });
        assert_eq!(ppc.sys.cpu.spr(Spr::Pvr), 0x0008_7102);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut ppc = powerpc(Config::default());
        ppc.sys.cpu.gpr[3] = 0x1234;
        ppc.sys.cpu.pc = Address(0x8000_3100);
        ppc.sys.cpu.set_spr(Spr::Dbat0U, 0x8000_1FFF);
        ppc.sys.cpu.reserve = true;

        ppc.reset();
        let first = ppc.save_state().unwrap();
        ppc.reset();
        let second = ppc.save_state().unwrap();

        assert_eq!(first, second);
        assert_eq!(ppc.sys.cpu.gpr[3], 0);
        assert!(!ppc.sys.cpu.reserve);
    }

    #[test]
    fn reset_restarts_timers() {
        let mut ppc = powerpc(Config::default());
        ppc.sys.cpu.set_spr(Spr::Dec, 100);
        ppc.sys.decrementer_set();
        ppc.run_for(600);
        assert!(ppc.sys.time_base() > 0);

        ppc.reset();
        assert!(!ppc.sys.scheduler.is_scheduled(ppc.sys.events.decrementer));
        assert_eq!(ppc.sys.time_base(), 0);

        // past the deadline of the decrementer written before the reset
        let start = ppc.sys.ticks();
        ppc.run_for(2000);
        let elapsed = ppc.sys.ticks() - start;

        assert!(!ppc.sys.cpu.exceptions.contains(Exceptions::DECREMENTER));
        assert_eq!(ppc.sys.decrementer(), 0xFFFF_FFFF);
        assert_eq!(ppc.sys.time_base(), elapsed / gekko::TIMER_RATIO);
    }

    #[test]
    fn breakpoints_survive_reset() {
        let mut ppc = powerpc(Config::default());
        ppc.sys.debug.add_breakpoint(Breakpoint::new(Address(0x100)));
        ppc.reset();
        assert!(ppc.sys.debug.is_breakpoint(Address(0x100)));
    }

    #[test]
    fn temporary_breakpoints_are_cleared_on_debug_init() {
        let mut ppc = PowerPc::new(
            Config {
                enable_debugging: true,
                ..Default::default()
            },
            Modules::default(),
            Box::new(NopProvider),
        );
        ppc.sys.debug.add_breakpoint(Breakpoint::temporary(Address(0x100)));
        ppc.sys.debug.add_breakpoint(Breakpoint::new(Address(0x200)));
        ppc.init();

        assert!(!ppc.sys.debug.is_breakpoint(Address(0x100)));
        assert!(ppc.sys.debug.is_breakpoint(Address(0x200)));
    }

    #[test]
    fn state_round_trip() {
        let mut ppc = powerpc(Config::default());
        ppc.sys.cpu.gpr[5] = 0xCAFE_BABE;
        ppc.sys.cpu.cr.set(0x2400_0080);
        ppc.sys.cpu.set_xer(0xA000_0012);
        ppc.sys.cpu.exceptions = Exceptions::DECREMENTER;
        ppc.sys.cpu.reserve = true;
        ppc.sys.cpu.reserve_address = Address(0x8000_0040);
        ppc.sys.cpu.set_spr(Spr::Dbat0U, 0x8000_1FFF);
        ppc.sys.cpu.set_spr(Spr::Dbat0L, 0x0000_0002);
        ppc.sys.mem.ram_mut()[RAM_SIZE - 1] = 0x5A;

        let saved = ppc.save_state().unwrap();

        let mut other = powerpc(Config::default());
        other.load_state(saved.clone()).unwrap();
        assert_eq!(other.sys.cpu.gpr[5], 0xCAFE_BABE);
        assert_eq!(other.sys.cpu.cr.get(), 0x2400_0080);
        assert_eq!(other.sys.cpu.xer(), 0xA000_0012);
        assert_eq!(other.sys.cpu.exceptions, Exceptions::DECREMENTER);
        assert!(other.sys.cpu.reserve);
        assert_eq!(other.sys.mem.ram()[RAM_SIZE - 1], 0x5A);

        // lookup tables were rebuilt
        assert!(other.sys.mmu.dbat.translate(Address(0x8000_0040)).is_some());

        assert_eq!(other.save_state().unwrap(), saved);
    }

    #[test]
    fn truncated_state_fails() {
        let mut ppc = powerpc(Config::default());
        let mut saved = ppc.save_state().unwrap();
        saved.truncate(saved.len() / 2);

        assert!(ppc.load_state(saved).is_err());
    }

    #[test]
    fn run_for_stops() {
        let mut ppc = powerpc(Config::default());
        ppc.run_for(100);

        assert!(ppc.sys.control.is_stepping());
        assert_eq!(ppc.sys.cpu.pc, 400);
        assert!(!ppc.sys.scheduler.is_scheduled(ppc.sys.events.stop));
    }

    #[test]
    fn run_steps_over_breakpoint_at_pc() {
        let mut ppc = powerpc(Config {
            enable_debugging: true,
            ..Default::default()
        });
        ppc.sys.debug.add_breakpoint(Breakpoint::new(Address(0x10)));

        ppc.run_for(1000);
        assert_eq!(ppc.sys.cpu.pc, 0x10);

        // resuming continues past it
        ppc.run_for(8);
        assert!(ppc.sys.cpu.pc.value() > 0x10);
    }

    #[test]
    fn remote_interrupt_line() {
        let mut ppc = powerpc(Config::default());
        let remote = ppc.remote();
        std::thread::spawn(move || remote.set_interrupt_line(true))
            .join()
            .unwrap();

        assert!(ppc.sys.cpu.exceptions.is_empty());
        ppc.sys.advance();
        assert!(ppc.sys.cpu.exceptions.contains(Exceptions::EXTERNAL_INT));
    }
}
