//! State of the machine the CPU core runs in.

pub mod bus;
pub mod control;
pub mod debug;
pub mod exceptions;
pub mod mem;
pub mod mmu;
pub mod perfmon;
pub mod scheduler;
pub mod timers;

use gekko::{Address, Cpu, Cycles};
use serde::{Deserialize, Serialize};

use crate::cores::CpuCoreKind;
use crate::modules::Modules;
use crate::system::control::Control;
use crate::system::debug::Debugger;
use crate::system::mem::Memory;
use crate::system::mmu::Mmu;
use crate::system::scheduler::{EventType, FromThread, Scheduler};
use crate::system::timers::Timers;

/// Default maximum length of a scheduler slice, in cycles.
pub const DEFAULT_MAX_SLICE: u32 = 20_000;

/// System configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether the system is a Wii (Broadway) rather than a GameCube (Gekko).
    pub is_wii: bool,
    /// The requested execution backend.
    pub cpu_core: CpuCoreKind,
    /// Whether data accesses go through the emulated data cache.
    pub enable_dcache: bool,
    /// Whether breakpoints and memory checks are active.
    pub enable_debugging: bool,
    /// Whether page table translation is emulated.
    pub mmu: bool,
    /// Maximum length of a scheduler slice, in cycles.
    pub max_slice: u32,
    /// Whether instruction fetches go through the emulated instruction cache.
    pub icache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_wii: false,
            cpu_core: CpuCoreKind::default_core(),
            enable_dcache: false,
            enable_debugging: false,
            mmu: false,
            max_slice: DEFAULT_MAX_SLICE,
            icache: true,
        }
    }
}

/// Code which changed and must be dropped from any compiled block caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChange {
    /// The physical range `start..start + len` changed.
    Range { start: Address, len: u32 },
    /// Anything might have changed (e.g. address translation did).
    All,
}

/// Event types the system itself schedules.
#[derive(Debug, Clone, Copy)]
pub struct Events {
    pub decrementer: EventType,
    pub invalidate_icache: EventType,
    pub interrupt_line: EventType,
    pub stop: EventType,
}

fn invalidate_icache_callback(sys: &mut System, userdata: u64, _: Cycles) {
    sys.invalidate_icache_line(Address(userdata as u32));
}

fn interrupt_line_callback(sys: &mut System, userdata: u64, _: Cycles) {
    sys.set_interrupt_line(userdata != 0);
}

fn stop_callback(sys: &mut System, _: u64, _: Cycles) {
    sys.control.request_break();
}

/// System state.
pub struct System {
    /// System configuration.
    pub config: Config,
    /// Collaborator modules.
    pub modules: Modules,
    /// Scheduler for events.
    pub scheduler: Scheduler,
    /// Run state of the CPU.
    pub control: Control,
    /// The CPU state.
    pub cpu: Cpu,
    /// Physical memory.
    pub mem: Memory,
    /// BAT lookup tables.
    pub mmu: Mmu,
    /// Lazily updated time base and decrementer.
    pub timers: Timers,
    /// Breakpoints and memory checks.
    pub debug: Debugger,
    /// Code changes the execution backends have not seen yet.
    pub code_changes: Vec<CodeChange>,
    /// Event types of the system.
    pub events: Events,
}

impl System {
    pub fn new(config: Config, modules: Modules) -> Self {
        let mut scheduler = Scheduler::new(config.max_slice);
        let events = Events {
            decrementer: scheduler.register("DecCallback", timers::decrementer_callback),
            invalidate_icache: scheduler
                .register("invalidateEmulatedCache", invalidate_icache_callback),
            interrupt_line: scheduler.register("SetInterruptLine", interrupt_line_callback),
            stop: scheduler.register("StopCpu", stop_callback),
        };

        Self {
            mem: Memory::new(config.is_wii),
            config,
            modules,
            scheduler,
            control: Control::default(),
            cpu: Cpu::default(),
            mmu: Mmu::default(),
            timers: Timers::default(),
            debug: Debugger::default(),
            code_changes: Vec::new(),
            events,
        }
    }

    /// Invalidates the instruction cache line containing the physical address `addr` and
    /// notifies the execution backends that its code might have changed.
    pub fn invalidate_icache_line(&mut self, addr: Address) {
        let enabled = self.cpu.hid0().icache_enable() && self.config.icache;
        self.cpu.icache.invalidate(addr, enabled);
        self.code_changes.push(CodeChange::Range {
            start: addr.align_down(32),
            len: 32,
        });
    }

    /// Invalidates an instruction cache line from any thread. Off the CPU thread, while it is
    /// running, the invalidation is deferred to a zero cycle event.
    pub fn schedule_invalidate_cache_thread_safe(&mut self, addr: Address) {
        if self.control.is_running() && !self.control.is_cpu_thread() {
            self.schedule_event(
                0,
                self.events.invalidate_icache,
                addr.value() as u64,
                FromThread::NonCpu,
            );
        } else {
            self.invalidate_icache_line(addr);
        }
    }

    /// Handles a write to HID0: flash invalidation of the caches.
    pub fn hid0_written(&mut self, old: u32) {
        let hid0 = self.cpu.hid0();
        if hid0.icache_flash_invalidate() {
            self.cpu.icache.reset();
            self.code_changes.push(CodeChange::All);
        }

        if hid0.dcache_flash_invalidate() {
            self.cpu.dcache.reset();
        }

        // the flash invalidate bits clear themselves
        let value = hid0
            .with_icache_flash_invalidate(false)
            .with_dcache_flash_invalidate(false)
            .to_bits();
        self.cpu.set_spr(gekko::Spr::Hid0, value);

        if (old ^ value) & ((1 << 15) | (1 << 13)) != 0 {
            tracing::debug!(
                old = format_args!("{old:08X}"),
                new = format_args!("{value:08X}"),
                "instruction cache configuration changed"
            );
        }
    }

    /// Takes every pending code change.
    pub fn take_code_changes(&mut self) -> Vec<CodeChange> {
        std::mem::take(&mut self.code_changes)
    }
}

#[cfg(test)]
pub mod test {
    use gekko::{Address, Spr, Variant};

    use super::*;

    /// A GameCube system in its power-on state.
    pub fn system() -> System {
        system_with(|_| ())
    }

    /// A system in its power-on state, with a tweaked default configuration.
    pub fn system_with(f: impl FnOnce(&mut Config)) -> System {
        let mut config = Config::default();
        f(&mut config);

        let variant = if config.is_wii {
            Variant::Broadway
        } else {
            Variant::Gekko
        };

        let mut sys = System::new(config, Modules::default());
        sys.cpu.reset_registers(variant);
        sys
    }

    /// Turns on data and instruction translation with the usual OS BAT setup: cached
    /// `0x8000_0000` and uncached `0xC000_0000` both mapping the first 256 MiB.
    pub fn enable_translation(sys: &mut System) {
        for (upper, lower) in [(Spr::Ibat0U, Spr::Ibat0L), (Spr::Dbat0U, Spr::Dbat0L)] {
            sys.cpu.set_spr(upper, 0x8000_1FFF);
            sys.cpu.set_spr(lower, 0x0000_0002);
        }

        sys.cpu.set_spr(Spr::Dbat1U, 0xC000_1FFF);
        sys.cpu.set_spr(Spr::Dbat1L, 0x0000_002A);

        sys.ibat_updated();
        sys.dbat_updated();
        sys.cpu.msr.set_data_addr_translation(true);
        sys.cpu.msr.set_instr_addr_translation(true);
        sys.code_changes.clear();
    }

    /// Maps the page of `ea` to the page of `phys` in a page table at `0x0010_0000`. Returns the
    /// physical address of the PTE.
    pub fn map_page(sys: &mut System, ea: Address, phys: Address) -> Address {
        sys.cpu.set_sdr1(0x0010_0000);

        let vsid = sys.cpu.sr[(ea.value() >> 28) as usize] & 0x00FF_FFFF;
        let hash = vsid ^ ((ea.value() >> 12) & 0xFFFF);
        let pte = Address(((hash & sys.cpu.pagetable_hashmask) << 6) | sys.cpu.pagetable_base);

        let pte1 = (1 << 31) | (vsid << 7) | ((ea.value() >> 22) & 0x3F);
        let pte2 = phys.value() & !0xFFF;
        sys.mem.write(pte, &pte1.to_be_bytes());
        sys.mem.write(pte + 4, &pte2.to_be_bytes());

        pte
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.is_wii);
        assert!(!config.mmu);
        assert!(config.icache);
        assert_eq!(config.max_slice, DEFAULT_MAX_SLICE);
    }

    #[test]
    fn icache_line_invalidation() {
        let mut sys = system();
        sys.invalidate_icache_line(Address(0x1234));
        assert_eq!(
            sys.take_code_changes(),
            vec![CodeChange::Range {
                start: Address(0x1220),
                len: 32
            }]
        );
        assert!(sys.code_changes.is_empty());
    }

    #[test]
    fn remote_invalidation_is_deferred() {
        let mut sys = system();
        sys.advance();
        sys.control.set_state(control::CpuState::Running);

        // not bound, so this thread is not the CPU thread
        sys.schedule_invalidate_cache_thread_safe(Address(0x40));
        assert!(sys.code_changes.is_empty());

        sys.advance();
        assert_eq!(
            sys.code_changes,
            vec![CodeChange::Range {
                start: Address(0x40),
                len: 32
            }]
        );
    }

    #[test]
    fn flash_invalidate_bits_clear_themselves() {
        let mut sys = system();
        sys.cpu.set_spr(Spr::Hid0, (1 << 11) | (1 << 10) | (1 << 15));
        sys.hid0_written(0);

        let hid0 = sys.cpu.hid0();
        assert!(hid0.icache_enable());
        assert!(!hid0.icache_flash_invalidate());
        assert!(!hid0.dcache_flash_invalidate());
        assert_eq!(sys.code_changes, vec![CodeChange::All]);
    }
}
