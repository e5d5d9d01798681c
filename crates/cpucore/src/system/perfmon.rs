//! Performance monitor counters.

use gekko::{Exceptions, Spr};

use crate::system::System;

/// PMC event selector: processor cycles.
const SELECT_CYCLES: u32 = 1;
/// PMC2 event selector: completed loads and stores.
const SELECT_LOAD_STORES: u32 = 11;
/// PMC3 event selector: completed floating point instructions.
const SELECT_FP_INSTRUCTIONS: u32 = 11;

const TOP_BIT: u32 = 1 << 31;

impl System {
    /// Whether any performance counter is configured.
    #[inline(always)]
    pub fn perfmon_enabled(&self) -> bool {
        self.cpu.spr(Spr::Mmcr0) != 0 || self.cpu.spr(Spr::Mmcr1) != 0
    }

    fn add_to_pmc(&mut self, pmc: Spr, value: u32) {
        let current = self.cpu.spr(pmc);
        self.cpu.set_spr(pmc, current.wrapping_add(value));
    }

    /// Updates the performance monitor counters and raises the performance monitor exception
    /// when a counter with interrupts enabled has its top bit set.
    pub fn update_performance_monitor(&mut self, cycles: u32, load_stores: u32, fp_instructions: u32) {
        let mmcr0 = self.cpu.mmcr0();
        let mmcr1 = self.cpu.mmcr1();

        if mmcr0.pmc1_select().value() as u32 == SELECT_CYCLES {
            self.add_to_pmc(Spr::Pmc1, cycles);
        }

        match mmcr0.pmc2_select().value() as u32 {
            SELECT_CYCLES => self.add_to_pmc(Spr::Pmc2, cycles),
            SELECT_LOAD_STORES => self.add_to_pmc(Spr::Pmc2, load_stores),
            _ => (),
        }

        match mmcr1.pmc3_select().value() as u32 {
            SELECT_CYCLES => self.add_to_pmc(Spr::Pmc3, cycles),
            SELECT_FP_INSTRUCTIONS => self.add_to_pmc(Spr::Pmc3, fp_instructions),
            _ => (),
        }

        if mmcr1.pmc4_select().value() as u32 == SELECT_CYCLES {
            self.add_to_pmc(Spr::Pmc4, cycles);
        }

        // PMC1 has its own interrupt control, the other counters share one
        let pmc1 = mmcr0.pmc1_int_control() && self.cpu.spr(Spr::Pmc1) & TOP_BIT != 0;
        let others = mmcr0.pmc_int_control()
            && [Spr::Pmc2, Spr::Pmc3, Spr::Pmc4]
                .into_iter()
                .any(|pmc| self.cpu.spr(pmc) & TOP_BIT != 0);

        if pmc1 || others {
            self.cpu.exceptions |= Exceptions::PERFORMANCE_MONITOR;
        }
    }
}
