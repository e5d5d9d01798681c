//! Architectural state of the Gekko (GameCube) and Broadway (Wii) PowerPC processors.
//!
//! The `powerpc` crate, which is a disassembler of PowerPC instructions, is re-exported under
//! [`disasm`].

pub mod cache;
pub mod exception;
pub mod fpu;
pub mod regs;
pub mod spr;
pub mod state;
pub mod tlb;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Disassembling of PowerPC instructions. Re-export of the [`powerpc`] crate.
#[rustfmt::skip]
pub use powerpc as disasm;

pub use exception::{Exception, Exceptions, ProgramCause};
pub use regs::{CondReg, FloatControlReg, MachineState, PairedSingle};
pub use spr::Spr;
pub use state::{Cpu, Variant};

/// An address in the Gekko's memory address space. This is a thin wrapper around an [`u32`].
#[repr(transparent)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Hash,
    IntoBytes,
    FromBytes,
    KnownLayout,
    Immutable,
)]
pub struct Address(pub u32);

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:04X}_{:04X}",
            (self.0 & 0xFFFF_0000) >> 16,
            self.0 & 0xFFFF
        )
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Address {
    /// Returns the value of this address. Equivalent to `self.0`.
    #[inline(always)]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Aligns this address down to the given alignment.
    #[inline(always)]
    pub const fn align_down(self, alignment: u32) -> Self {
        Self(self.0 - self.0 % alignment)
    }

    /// Whether this address is a multiple of `alignment`.
    #[inline(always)]
    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0 % alignment == 0
    }

    /// Index of the 4 KiB page this address belongs to.
    #[inline(always)]
    pub const fn page(self) -> u32 {
        self.0 >> 12
    }

    /// Offset of this address inside its 4 KiB page.
    #[inline(always)]
    pub const fn page_offset(self) -> u32 {
        self.0 & 0xFFF
    }
}

impl std::ops::Add<u32> for Address {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Add<i32> for Address {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0.wrapping_add_signed(rhs))
    }
}

impl std::ops::AddAssign<u32> for Address {
    #[inline(always)]
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<u32> for Address {
    type Output = Self;

    #[inline(always)]
    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl PartialEq<u32> for Address {
    #[inline(always)]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl From<u32> for Address {
    #[inline(always)]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Address> for u32 {
    #[inline(always)]
    fn from(value: Address) -> Self {
        value.0
    }
}

/// The Gekko CPU frequency.
pub const FREQUENCY: u64 = 486_000_000;

/// How many CPU cycles it takes for the time base and the decrementer to tick once.
pub const TIMER_RATIO: u64 = 12;

/// An amount of cycles of the CPU. This is a thin wrapper around an [`u64`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Hash,
    IntoBytes,
    FromBytes,
    KnownLayout,
    Immutable,
)]
#[repr(transparent)]
pub struct Cycles(pub u64);

impl std::fmt::Display for Cycles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Cycles {
    /// Cycles per second of the CPU.
    pub const PER_SECOND: Self = Self(FREQUENCY);

    /// Returns the value of these cycles. Equivalent to `self.0`.
    #[inline(always)]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Converts these cycles into time base (and decrementer) ticks.
    #[inline(always)]
    pub const fn to_timer_ticks(self) -> u64 {
        self.0 / TIMER_RATIO
    }

    /// Converts time base (and decrementer) ticks into cycles.
    #[inline(always)]
    pub const fn from_timer_ticks(ticks: u64) -> Self {
        Self(ticks * TIMER_RATIO)
    }
}

impl std::ops::Add<Cycles> for Cycles {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: Cycles) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign<Cycles> for Cycles {
    #[inline(always)]
    fn add_assign(&mut self, rhs: Cycles) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<Cycles> for Cycles {
    type Output = Cycles;

    #[inline(always)]
    fn sub(self, rhs: Cycles) -> Self::Output {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl PartialEq<u64> for Cycles {
    #[inline(always)]
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u64> for Cycles {
    fn partial_cmp(&self, other: &u64) -> Option<std::cmp::Ordering> {
        Some(self.0.cmp(other))
    }
}

impl From<u64> for Cycles {
    #[inline(always)]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Extension trait for [`Ins`](disasm::Ins).
pub trait InsExt {
    /// Index of the GPR indicated by field rA.
    fn gpr_a(&self) -> usize;
    /// Index of the GPR indicated by field rB.
    fn gpr_b(&self) -> usize;
    /// Index of the GPR indicated by field rS.
    fn gpr_s(&self) -> usize;
    /// Index of the GPR indicated by field rD.
    fn gpr_d(&self) -> usize;
    /// Index of the FPR indicated by field frA.
    fn fpr_a(&self) -> usize;
    /// Index of the FPR indicated by field frB.
    fn fpr_b(&self) -> usize;
    /// Index of the FPR indicated by field frC.
    fn fpr_c(&self) -> usize;
    /// Index of the FPR indicated by field frS.
    fn fpr_s(&self) -> usize;
    /// Index of the FPR indicated by field frD.
    fn fpr_d(&self) -> usize;
    /// The condition register bit tested by a conditional branch (field BI).
    fn cond_bit(&self) -> u32;
    /// The trap conditions of a `tw`/`twi` (field TO).
    fn trap_conditions(&self) -> u32;
    /// The SPR indicated by field SPR, if it is a known one.
    fn spr(&self) -> Option<Spr>;
}

impl InsExt for disasm::Ins {
    #[inline(always)]
    fn gpr_a(&self) -> usize {
        self.field_ra() as usize
    }

    #[inline(always)]
    fn gpr_b(&self) -> usize {
        self.field_rb() as usize
    }

    #[inline(always)]
    fn gpr_s(&self) -> usize {
        self.field_rs() as usize
    }

    #[inline(always)]
    fn gpr_d(&self) -> usize {
        self.field_rd() as usize
    }

    #[inline(always)]
    fn fpr_a(&self) -> usize {
        self.field_fra() as usize
    }

    #[inline(always)]
    fn fpr_b(&self) -> usize {
        self.field_frb() as usize
    }

    #[inline(always)]
    fn fpr_c(&self) -> usize {
        self.field_frc() as usize
    }

    #[inline(always)]
    fn fpr_s(&self) -> usize {
        self.field_frs() as usize
    }

    #[inline(always)]
    fn fpr_d(&self) -> usize {
        self.field_frd() as usize
    }

    #[inline(always)]
    fn cond_bit(&self) -> u32 {
        (self.code >> 16) & 0x1F
    }

    #[inline(always)]
    fn trap_conditions(&self) -> u32 {
        (self.code >> 21) & 0x1F
    }

    #[inline(always)]
    fn spr(&self) -> Option<Spr> {
        Spr::from_repr(self.field_spr() as u16)
    }
}

/// Decodes a raw instruction word as a Gekko/Broadway instruction.
#[inline(always)]
pub fn decode(code: u32) -> disasm::Ins {
    disasm::Ins::new(code, disasm::Extensions::gekko_broadway())
}
