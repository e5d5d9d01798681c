//! Exception causes, vectors and the save/restore register masks.

use bitflags::bitflags;

bitflags! {
    /// Pending exception causes.
    ///
    /// Causes are sticky: they accumulate until the exception pipeline services them, one per
    /// drain, in a fixed priority order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Exceptions: u32 {
        const DECREMENTER         = 0x0001;
        const SYSCALL             = 0x0002;
        const EXTERNAL_INT        = 0x0004;
        const DSI                 = 0x0008;
        const ISI                 = 0x0010;
        const ALIGNMENT           = 0x0020;
        const FPU_UNAVAILABLE     = 0x0040;
        const PROGRAM             = 0x0080;
        const PERFORMANCE_MONITOR = 0x0100;
        /// Raised by a memcheck hit. Serviced without vectoring.
        const FAKE_MEMCHECK_HIT   = 0x0200;
    }
}

/// An exception which can be vectored to. The variants have the exception vector as their
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Exception {
    Dsi                = 0x0300,
    Isi                = 0x0400,
    External           = 0x0500,
    Alignment          = 0x0600,
    Program            = 0x0700,
    FpuUnavailable     = 0x0800,
    Decrementer        = 0x0900,
    Syscall            = 0x0C00,
    PerformanceMonitor = 0x0F00,
}

impl Exception {
    /// Bits of MSR which are copied into SRR1 when an exception is taken.
    #[rustfmt::skip] pub const MSR_TO_SRR1_MASK: u32 = 0x87C0_FFFF;
    /// Bits of MSR which are cleared when an exception is taken.
    #[rustfmt::skip] pub const MSR_CLEARED_ON_ENTRY: u32 = 0x0004_EF36;
    /// Bit set in SRR1 by an ISI caused by a missing page table entry.
    #[rustfmt::skip] pub const SRR1_ISI_PAGE_FAULT: u32 = 1 << 30;

    /// The address execution is redirected to.
    #[inline(always)]
    pub const fn vector(self) -> u32 {
        self as u32
    }

    /// The cause flag this exception services.
    pub const fn cause(self) -> Exceptions {
        match self {
            Self::Dsi => Exceptions::DSI,
            Self::Isi => Exceptions::ISI,
            Self::External => Exceptions::EXTERNAL_INT,
            Self::Alignment => Exceptions::ALIGNMENT,
            Self::Program => Exceptions::PROGRAM,
            Self::FpuUnavailable => Exceptions::FPU_UNAVAILABLE,
            Self::Decrementer => Exceptions::DECREMENTER,
            Self::Syscall => Exceptions::SYSCALL,
            Self::PerformanceMonitor => Exceptions::PERFORMANCE_MONITOR,
        }
    }

    /// Whether SRR0 receives the address of the next instruction (`npc`) instead of the
    /// faulting one (`pc`).
    pub const fn resumes_after(self) -> bool {
        matches!(
            self,
            Self::Isi
                | Self::Syscall
                | Self::External
                | Self::PerformanceMonitor
                | Self::Decrementer
        )
    }
}

/// Reason of a program exception, stored in SRR1 when it is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProgramCause {
    FloatingPoint = 0x0010_0000,
    Illegal       = 0x0008_0000,
    Privileged    = 0x0004_0000,
    Trap          = 0x0002_0000,
}

/// DSISR bit set when a data access hits no page table entry.
pub const DSISR_PAGE: u32 = 1 << 30;
/// DSISR bit set when the faulting access was a store.
pub const DSISR_STORE: u32 = 1 << 25;
