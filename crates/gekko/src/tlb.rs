//! Software translation lookaside buffer for page table translations.

use bitos::bitos;
use bitos::integer::{u2, u4, u6, u20, u24};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::Address;

/// Number of sets in each TLB.
pub const TLB_SETS: usize = 64;
/// Number of ways in each set.
pub const TLB_WAYS: usize = 2;
/// Tag of a way which holds no translation.
pub const INVALID_TAG: u32 = 0xFFFF_FFFF;

/// First word of a page table entry.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte1 {
    /// Abbreviated page index.
    #[bits(0..6)]
    pub api: u6,
    /// Whether this entry belongs to the secondary hash.
    #[bits(6)]
    pub hash: bool,
    /// Virtual segment ID.
    #[bits(7..31)]
    pub vsid: u24,
    #[bits(31)]
    pub valid: bool,
}

/// Second word of a page table entry.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte2 {
    /// Page protection bits.
    #[bits(0..2)]
    pub protection: u2,
    /// Write-through, caching-inhibited, memory coherence and guarded bits.
    #[bits(3..7)]
    pub wimg: u4,
    /// Changed: set by the first store to the page.
    #[bits(7)]
    pub changed: bool,
    /// Referenced: set by the first access to the page.
    #[bits(8)]
    pub referenced: bool,
    /// Physical page number.
    #[bits(12..32)]
    pub rpn: u20,
}

/// Which of the two TLBs a translation goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbKind {
    Data        = 0,
    Instruction = 1,
}

/// How a translation is being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XCheck {
    /// Lookup without any side effects, as done by debuggers.
    NoException,
    Read,
    Write,
    Opcode,
}

impl XCheck {
    /// The TLB this access goes through.
    #[inline(always)]
    pub fn tlb(self) -> TlbKind {
        if self == Self::Opcode {
            TlbKind::Instruction
        } else {
            TlbKind::Data
        }
    }
}

/// A TLB set: two ways and the most recently used one.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct TlbEntry {
    pub tag: [u32; TLB_WAYS],
    pub paddr: [u32; TLB_WAYS],
    pub pte: [u32; TLB_WAYS],
    pub recent: u32,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            tag: [INVALID_TAG; TLB_WAYS],
            paddr: [0; TLB_WAYS],
            pte: [0; TLB_WAYS],
            recent: 0,
        }
    }
}

/// Result of a TLB lookup. `wi` tells whether the page is write-through or cache-inhibited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbLookup {
    /// Translation found.
    Found { addr: Address, wi: bool },
    /// Translation found, but the changed bit of the entry was just set and must be written
    /// back to the page table.
    UpdateC { addr: Address, wi: bool },
    NotFound,
}

impl Pte2 {
    /// Whether the write-through or caching-inhibited bit is set.
    #[inline(always)]
    pub fn wi(&self) -> bool {
        self.wimg().value() & 0b1100 != 0
    }
}

/// The data and instruction TLBs.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Tlb {
    pub entries: [[TlbEntry; TLB_SETS]; 2],
}

impl Default for Tlb {
    fn default() -> Self {
        Self {
            entries: [[TlbEntry::default(); TLB_SETS]; 2],
        }
    }
}

impl Tlb {
    #[inline(always)]
    fn set_of(tag: u32) -> usize {
        (tag as usize) & (TLB_SETS - 1)
    }

    /// Invalidates every entry of both TLBs.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Invalidates the set `ea` maps to in both TLBs, as done by `tlbie`.
    pub fn invalidate(&mut self, ea: Address) {
        let set = Self::set_of(ea.page());
        for tlb in &mut self.entries {
            tlb[set] = TlbEntry::default();
        }
    }

    /// Looks up `ea` in the TLB selected by `flag`.
    pub fn lookup(&mut self, ea: Address, flag: XCheck) -> TlbLookup {
        let tag = ea.page();
        let entry = &mut self.entries[flag.tlb() as usize][Self::set_of(tag)];

        let Some(way) = (0..TLB_WAYS).find(|&way| entry.tag[way] == tag) else {
            return TlbLookup::NotFound;
        };

        let addr = Address(entry.paddr[way] | ea.page_offset());
        let mut pte2 = Pte2::from_bits(entry.pte[way]);
        let wi = pte2.wi();
        if flag == XCheck::NoException {
            return TlbLookup::Found { addr, wi };
        }

        entry.recent = way as u32;

        if flag == XCheck::Write && !pte2.changed() {
            pte2.set_changed(true);
            entry.pte[way] = pte2.to_bits();
            return TlbLookup::UpdateC { addr, wi };
        }

        TlbLookup::Found { addr, wi }
    }

    /// Inserts a translation from the page table. The least recently used way is replaced.
    pub fn update(&mut self, ea: Address, pte2: Pte2, flag: XCheck) {
        if flag == XCheck::NoException {
            return;
        }

        let tag = ea.page();
        let entry = &mut self.entries[flag.tlb() as usize][Self::set_of(tag)];

        let way = (entry.recent == 0 && entry.tag[0] != INVALID_TAG) as usize;
        entry.recent = way as u32;
        entry.paddr[way] = pte2.rpn().value() << 12;
        entry.pte[way] = pte2.to_bits();
        entry.tag[way] = tag;
    }
}
