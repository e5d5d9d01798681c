//! The exception pipeline: drains pending exception causes into vectored control transfers.

use gekko::exception::DSISR_PAGE;
use gekko::{Address, Exception, Exceptions, MachineState, ProgramCause, Spr};

use crate::system::System;

impl System {
    /// Saves the context into SRR0/SRR1 and enters the handler of `exception`.
    fn enter_exception(&mut self, exception: Exception, srr1: u32) {
        let srr0 = if exception.resumes_after() {
            self.cpu.npc
        } else {
            self.cpu.pc
        };

        self.cpu.set_spr(Spr::Srr0, srr0.value());
        self.cpu.set_spr(Spr::Srr1, srr1);

        let mut msr = self.cpu.msr;
        msr.set_little_endian(msr.exception_little_endian());
        self.cpu.msr = MachineState::from_bits(msr.to_bits() & !Exception::MSR_CLEARED_ON_ENTRY);

        self.cpu.pc = Address(exception.vector());
        self.cpu.npc = self.cpu.pc;
        self.cpu.exceptions.remove(exception.cause());
        self.cpu.clear_reservation();

        if exception == Exception::Decrementer {
            tracing::trace!(srr0 = ?srr0, "decrementer exception");
        } else {
            tracing::debug!(?exception, srr0 = ?srr0, srr1 = format_args!("{srr1:08X}"), "exception");
        }
    }

    #[inline(always)]
    fn saved_msr(&self) -> u32 {
        self.cpu.msr.to_bits() & Exception::MSR_TO_SRR1_MASK
    }

    /// Services the pending exception of highest priority, if any.
    pub fn check_exceptions(&mut self) {
        let exceptions = self.cpu.exceptions;
        let msr = self.saved_msr();

        if exceptions.contains(Exceptions::ISI) {
            self.enter_exception(Exception::Isi, msr | Exception::SRR1_ISI_PAGE_FAULT);
        } else if exceptions.contains(Exceptions::PROGRAM) {
            // reason bits were set when the exception was raised
            let srr1 = self.cpu.spr(Spr::Srr1) | msr;
            self.enter_exception(Exception::Program, srr1);
        } else if exceptions.contains(Exceptions::SYSCALL) {
            self.enter_exception(Exception::Syscall, msr);
        } else if exceptions.contains(Exceptions::FPU_UNAVAILABLE) {
            self.enter_exception(Exception::FpuUnavailable, msr);
        } else if exceptions.contains(Exceptions::FAKE_MEMCHECK_HIT) {
            self.cpu
                .exceptions
                .remove(Exceptions::DSI | Exceptions::FAKE_MEMCHECK_HIT);
        } else if exceptions.contains(Exceptions::DSI) {
            self.enter_exception(Exception::Dsi, msr);
        } else if exceptions.contains(Exceptions::ALIGNMENT) {
            self.enter_exception(Exception::Alignment, msr);
        } else {
            self.check_external_exceptions();
        }
    }

    /// Services a pending external exception, if external exceptions are enabled.
    pub fn check_external_exceptions(&mut self) {
        let exceptions = self.cpu.exceptions;
        if exceptions.is_empty() || !self.cpu.msr.interrupts() {
            return;
        }

        let msr = self.saved_msr();

        if exceptions.contains(Exceptions::EXTERNAL_INT) {
            if !self.cpu.msr.recoverable_exception() {
                tracing::warn!(pc = ?self.cpu.pc, "external interrupt taken while unrecoverable");
            }

            self.enter_exception(Exception::External, msr);
        } else if exceptions.contains(Exceptions::PERFORMANCE_MONITOR) {
            self.enter_exception(Exception::PerformanceMonitor, msr);
        } else if exceptions.contains(Exceptions::DECREMENTER) {
            self.enter_exception(Exception::Decrementer, msr);
        } else {
            tracing::error!(?exceptions, pc = ?self.cpu.pc, "unexpected external exception");
            debug_assert!(
                exceptions.intersects(
                    Exceptions::EXTERNAL_INT
                        | Exceptions::PERFORMANCE_MONITOR
                        | Exceptions::DECREMENTER
                ),
                "unexpected external exception: {exceptions:?}"
            );
        }
    }

    /// Raises a program exception with the given reason.
    pub fn raise_program(&mut self, cause: ProgramCause) {
        self.cpu.set_spr(Spr::Srr1, cause as u32);
        self.cpu.exceptions |= Exceptions::PROGRAM;
    }

    /// Raises an alignment exception for an access at `addr`.
    pub fn raise_alignment(&mut self, addr: Address) {
        self.cpu.set_spr(Spr::Dar, addr.value());
        self.cpu.exceptions |= Exceptions::ALIGNMENT;
    }

    /// Raises a DSI for an access at `addr`. Without MMU emulation, the fault is only logged.
    pub fn raise_dsi(&mut self, addr: Address, write: bool) {
        if !self.config.mmu {
            tracing::error!(
                pc = ?self.cpu.pc,
                addr = ?addr,
                "invalid {} without MMU emulation",
                if write { "write" } else { "read" }
            );
            return;
        }

        let dsisr = if write {
            DSISR_PAGE | gekko::exception::DSISR_STORE
        } else {
            DSISR_PAGE
        };

        self.cpu.set_spr(Spr::Dsisr, dsisr);
        self.cpu.set_spr(Spr::Dar, addr.value());
        self.cpu.exceptions |= Exceptions::DSI;
    }

    /// Raises an ISI for an instruction fetch at `addr`.
    pub fn raise_isi(&mut self, addr: Address) {
        tracing::warn!(pc = ?self.cpu.pc, addr = ?addr, "ISI exception");
        self.cpu.npc = addr;
        self.cpu.exceptions |= Exceptions::ISI;
    }

    /// Asserts or deasserts the external interrupt line.
    pub fn set_interrupt_line(&mut self, asserted: bool) {
        self.cpu.exceptions.set(Exceptions::EXTERNAL_INT, asserted);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::system::test::system;

    fn vector_after(raise: Exceptions) -> (u32, u32, u32) {
        let mut sys = system();
        sys.cpu.pc = Address(0x8000_1000);
        sys.cpu.npc = Address(0x8000_1004);
        sys.cpu.msr.set_interrupts(true);
        sys.cpu.msr.set_recoverable_exception(true);
        sys.cpu.exceptions = raise;
        sys.check_exceptions();

        assert!(sys.cpu.exceptions.is_empty());
        assert_eq!(sys.cpu.pc, sys.cpu.npc);
        (
            sys.cpu.pc.value(),
            sys.cpu.spr(Spr::Srr0),
            sys.cpu.spr(Spr::Srr1),
        )
    }

    #[test]
    fn vectors() {
        let cases = [
            (Exceptions::ISI, 0x400, 0x8000_1004),
            (Exceptions::PROGRAM, 0x700, 0x8000_1000),
            (Exceptions::SYSCALL, 0xC00, 0x8000_1004),
            (Exceptions::FPU_UNAVAILABLE, 0x800, 0x8000_1000),
            (Exceptions::DSI, 0x300, 0x8000_1000),
            (Exceptions::ALIGNMENT, 0x600, 0x8000_1000),
            (Exceptions::EXTERNAL_INT, 0x500, 0x8000_1004),
            (Exceptions::PERFORMANCE_MONITOR, 0xF00, 0x8000_1004),
            (Exceptions::DECREMENTER, 0x900, 0x8000_1004),
        ];

        for (raise, vector, srr0) in cases {
            let (pc, saved, _) = vector_after(raise);
            assert_eq!(pc, vector, "{raise:?}");
            assert_eq!(saved, srr0, "{raise:?}");
        }
    }

    #[test]
    fn isi_marks_srr1() {
        let (_, _, srr1) = vector_after(Exceptions::ISI);
        assert_eq!(srr1, (1 << 30) | (1 << 15) | (1 << 1));
    }

    #[test]
    fn program_before_alignment() {
        let mut sys = system();
        sys.cpu.pc = Address(0x100);
        sys.raise_alignment(Address(0x1234));
        sys.raise_program(ProgramCause::Trap);

        sys.check_exceptions();
        assert_eq!(sys.cpu.pc, 0x700);
        assert_eq!(sys.cpu.spr(Spr::Srr1) & ProgramCause::Trap as u32, ProgramCause::Trap as u32);
        assert_eq!(sys.cpu.exceptions, Exceptions::ALIGNMENT);

        sys.check_exceptions();
        assert_eq!(sys.cpu.pc, 0x600);
        assert_eq!(sys.cpu.spr(Spr::Dar), 0x1234);
        assert!(sys.cpu.exceptions.is_empty());
    }

    #[test]
    fn entry_clears_reservation_and_msr_bits() {
        let mut sys = system();
        sys.cpu.reserve = true;
        sys.cpu.reserve_address = Address(0x80);
        sys.cpu.msr = MachineState::from_bits(0x0001_B032);
        sys.cpu.exceptions = Exceptions::SYSCALL;
        sys.check_exceptions();

        assert!(!sys.cpu.reserve);
        // ILE is not saved
        assert_eq!(sys.cpu.spr(Spr::Srr1), 0x0000_B032);
        // ILE copied into LE, translation and EE cleared
        assert_eq!(sys.cpu.msr.to_bits(), 0x0001_1001);
    }

    #[test]
    fn external_exceptions_wait_for_ee() {
        let mut sys = system();
        sys.cpu.pc = Address(0x200);
        sys.cpu.npc = Address(0x204);
        sys.cpu.exceptions = Exceptions::DECREMENTER | Exceptions::EXTERNAL_INT;

        sys.check_exceptions();
        assert_eq!(sys.cpu.pc, 0x200);

        sys.cpu.msr.set_interrupts(true);
        sys.check_exceptions();
        assert_eq!(sys.cpu.pc, 0x500);
        assert_eq!(sys.cpu.exceptions, Exceptions::DECREMENTER);
    }

    #[test]
    fn fake_memcheck_hit_does_not_vector() {
        let mut sys = system();
        sys.cpu.pc = Address(0x200);
        sys.cpu.npc = Address(0x204);
        sys.cpu.exceptions = Exceptions::DSI | Exceptions::FAKE_MEMCHECK_HIT;
        sys.check_exceptions();
        assert!(sys.cpu.exceptions.is_empty());
        assert_eq!(sys.cpu.pc, 0x200);
    }
}
