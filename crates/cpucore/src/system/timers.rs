//! The time base and the decrementer.
//!
//! Both tick once every [`TIMER_RATIO`] CPU cycles. Their values are not stored as they change:
//! instead, the value at the last write and the time of that write are kept, and reads compute
//! the current value from the scheduler's clock.

use gekko::{Cycles, Exceptions, Spr, TIMER_RATIO};

use crate::state::Archive;
use crate::system::System;
use crate::system::scheduler::FromThread;

/// Lazily updated timer state.
#[derive(Debug, Default, Clone)]
pub struct Timers {
    dec_start_ticks: u64,
    dec_start_value: u32,
    tb_start_ticks: u64,
    tb_start_value: u64,
}

impl Timers {
    pub fn do_state(&mut self, ar: &mut Archive) {
        ar.value(&mut self.dec_start_ticks);
        ar.value(&mut self.dec_start_value);
        ar.value(&mut self.tb_start_ticks);
        ar.value(&mut self.tb_start_value);
    }
}

/// Called when the decrementer passes zero.
pub(crate) fn decrementer_callback(sys: &mut System, _: u64, _: Cycles) {
    sys.cpu.set_spr(Spr::Dec, 0xFFFF_FFFF);
    sys.cpu.exceptions |= Exceptions::DECREMENTER;
}

impl System {
    /// Restarts the decrementer from the value in the DEC register.
    pub fn decrementer_set(&mut self) {
        let value = self.cpu.spr(Spr::Dec);
        self.remove_event(self.events.decrementer);

        if value & (1 << 31) == 0 {
            self.timers.dec_start_ticks = self.ticks();
            self.timers.dec_start_value = value;
            self.schedule_event(
                value as u64 * TIMER_RATIO,
                self.events.decrementer,
                0,
                FromThread::Cpu,
            );
        }
    }

    /// Current value of the decrementer.
    pub fn decrementer(&self) -> u32 {
        let dec = self.cpu.spr(Spr::Dec);
        if dec & (1 << 31) != 0 {
            return dec;
        }

        let elapsed = self.ticks().saturating_sub(self.timers.dec_start_ticks) / TIMER_RATIO;
        self.timers.dec_start_value.wrapping_sub(elapsed as u32)
    }

    /// Current value of the time base.
    pub fn time_base(&self) -> u64 {
        let elapsed = self.ticks().saturating_sub(self.timers.tb_start_ticks) / TIMER_RATIO;
        self.timers.tb_start_value.wrapping_add(elapsed)
    }

    /// Restarts the time base from the value in the TL and TU registers.
    pub fn time_base_set(&mut self) {
        self.timers.tb_start_ticks = self.ticks();
        self.timers.tb_start_value =
            ((self.cpu.spr(Spr::Tu) as u64) << 32) | self.cpu.spr(Spr::Tl) as u64;
    }

    /// Stores the current time base into the TL and TU registers.
    pub fn sync_time_base(&mut self) {
        let tb = self.time_base();
        self.cpu.set_spr(Spr::Tl, tb as u32);
        self.cpu.set_spr(Spr::Tu, (tb >> 32) as u32);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::system::test::system;

    #[test]
    fn decrementer_counts_down() {
        let mut sys = system();
        sys.advance();

        sys.cpu.set_spr(Spr::Dec, 100);
        sys.decrementer_set();
        assert!(sys.scheduler.is_scheduled(sys.events.decrementer));
        assert_eq!(sys.cpu.downcount, 1200);

        sys.cpu.downcount -= 120;
        assert_eq!(sys.decrementer(), 90);

        sys.cpu.downcount = 0;
        sys.advance();
        assert_eq!(sys.cpu.spr(Spr::Dec), 0xFFFF_FFFF);
        assert_eq!(sys.decrementer(), 0xFFFF_FFFF);
        assert!(sys.cpu.exceptions.contains(Exceptions::DECREMENTER));
    }

    #[test]
    fn negative_decrementer_is_not_scheduled() {
        let mut sys = system();
        sys.advance();

        sys.cpu.set_spr(Spr::Dec, 100);
        sys.decrementer_set();
        sys.cpu.set_spr(Spr::Dec, 0x8000_0000);
        sys.decrementer_set();
        assert!(!sys.scheduler.is_scheduled(sys.events.decrementer));
    }

    #[test]
    fn time_base_counts_up() {
        let mut sys = system();
        sys.advance();

        sys.cpu.set_spr(Spr::Tl, 0xFFFF_FFFF);
        sys.cpu.set_spr(Spr::Tu, 1);
        sys.time_base_set();

        sys.cpu.downcount -= 24;
        sys.sync_time_base();
        assert_eq!(sys.cpu.spr(Spr::Tl), 1);
        assert_eq!(sys.cpu.spr(Spr::Tu), 2);
    }
}
