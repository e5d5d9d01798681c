//! Special purpose registers.

use bitos::integer::{u2, u5, u6, u7, u11, u15};
use bitos::{BitUtils, bitos};
use strum::{EnumString, FromRepr, IntoStaticStr, VariantArray};

use crate::Address;

/// A special purpose register. The variants have the SPR number as their value, which is also
/// their index in the SPR array of the processor state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
#[repr(u16)]
pub enum Spr {
    Xer    = 1,
    Lr     = 8,
    Ctr    = 9,
    Dsisr  = 18,
    Dar    = 19,
    Dec    = 22,
    Sdr1   = 25,
    Srr0   = 26,
    Srr1   = 27,
    Tl     = 268,
    Tu     = 269,
    Sprg0  = 272,
    Sprg1  = 273,
    Sprg2  = 274,
    Sprg3  = 275,
    Ear    = 282,
    TlW    = 284,
    TuW    = 285,
    Pvr    = 287,
    Ibat0U = 528,
    Ibat0L = 529,
    Ibat1U = 530,
    Ibat1L = 531,
    Ibat2U = 532,
    Ibat2L = 533,
    Ibat3U = 534,
    Ibat3L = 535,
    Dbat0U = 536,
    Dbat0L = 537,
    Dbat1U = 538,
    Dbat1L = 539,
    Dbat2U = 540,
    Dbat2L = 541,
    Dbat3U = 542,
    Dbat3L = 543,
    Ibat4U = 560,
    Ibat4L = 561,
    Ibat5U = 562,
    Ibat5L = 563,
    Ibat6U = 564,
    Ibat6L = 565,
    Ibat7U = 566,
    Ibat7L = 567,
    Dbat4U = 568,
    Dbat4L = 569,
    Dbat5U = 570,
    Dbat5L = 571,
    Dbat6U = 572,
    Dbat6L = 573,
    Dbat7U = 574,
    Dbat7L = 575,
    Gqr0   = 912,
    Gqr1   = 913,
    Gqr2   = 914,
    Gqr3   = 915,
    Gqr4   = 916,
    Gqr5   = 917,
    Gqr6   = 918,
    Gqr7   = 919,
    Hid2   = 920,
    Wpar   = 921,
    Dmau   = 922,
    Dmal   = 923,
    EcidU  = 924,
    EcidM  = 925,
    EcidL  = 926,
    Ummcr0 = 936,
    Upmc1  = 937,
    Upmc2  = 938,
    Usia   = 939,
    Ummcr1 = 940,
    Upmc3  = 941,
    Upmc4  = 942,
    Mmcr0  = 952,
    Pmc1   = 953,
    Pmc2   = 954,
    Sia    = 955,
    Mmcr1  = 956,
    Pmc3   = 957,
    Pmc4   = 958,
    Hid0   = 1008,
    Hid1   = 1009,
    Iabr   = 1010,
    Hid4   = 1011,
    Dabr   = 1013,
    L2cr   = 1017,
    Ictc   = 1019,
    Thrm1  = 1020,
    Thrm2  = 1021,
    Thrm3  = 1022,
}

impl Spr {
    /// Index of this SPR in the SPR array.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether this SPR can only be accessed in supervisor mode.
    pub const fn is_supervisor(self) -> bool {
        (self as u16) & 0x10 != 0
    }

    /// Whether this SPR is one half of an instruction BAT pair.
    pub const fn is_ibat(self) -> bool {
        matches!(self as u16, 528..=535 | 560..=567)
    }

    /// Whether this SPR is one half of a data BAT pair.
    pub const fn is_dbat(self) -> bool {
        matches!(self as u16, 536..=543 | 568..=575)
    }
}

/// Monitor mode control register 0.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mmcr0 {
    /// Event selector of PMC2.
    #[bits(0..6)]
    pub pmc2_select: u6,
    /// Event selector of PMC1.
    #[bits(6..13)]
    pub pmc1_select: u7,
    #[bits(13)]
    pub pmc_trigger: bool,
    /// Whether PMC2, PMC3 and PMC4 raise performance monitor exceptions when their top bit is
    /// set.
    #[bits(14)]
    pub pmc_int_control: bool,
    /// Whether PMC1 raises performance monitor exceptions when its top bit is set.
    #[bits(15)]
    pub pmc1_int_control: bool,
    #[bits(16..22)]
    pub threshold: u6,
    #[bits(22)]
    pub int_on_bit_transition: bool,
    #[bits(23..25)]
    pub rtc_select: u2,
    #[bits(25)]
    pub disable_counting: bool,
    #[bits(26)]
    pub enable_int: bool,
    #[bits(27)]
    pub disable_marked_run: bool,
    #[bits(28)]
    pub disable_marked_supervisor: bool,
    #[bits(29)]
    pub disable_user: bool,
    #[bits(30)]
    pub disable_supervisor: bool,
    #[bits(31)]
    pub disable: bool,
}

/// Monitor mode control register 1.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mmcr1 {
    /// Event selector of PMC4.
    #[bits(22..27)]
    pub pmc4_select: u5,
    /// Event selector of PMC3.
    #[bits(27..32)]
    pub pmc3_select: u5,
}

/// A Block Address Translation register pair, upper half in the high 32 bits.
#[bitos(64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bat {
    // lower
    #[bits(0..2)]
    pub protection: u2,
    #[bits(17..32)]
    pub physical_address_region: u15,

    // upper
    #[bits(32)]
    pub user_mode: bool,
    #[bits(33)]
    pub supervisor_mode: bool,
    #[bits(34..45)]
    pub block_length_mask: u11,
    #[bits(49..64)]
    pub effective_address_region: u15,
}

impl Bat {
    /// Builds a BAT from its upper and lower SPR values.
    #[inline(always)]
    pub fn from_pair(upper: u32, lower: u32) -> Self {
        Self::from_bits(((upper as u64) << 32) | lower as u64)
    }

    /// Whether this BAT is valid in the given privilege mode.
    #[inline(always)]
    pub fn valid(&self, user_mode: bool) -> bool {
        if user_mode {
            self.user_mode()
        } else {
            self.supervisor_mode()
        }
    }

    /// The length of the memory region, in bytes.
    #[inline(always)]
    pub fn block_length(&self) -> u32 {
        (bytesize::kib(128u64) as u32) << self.block_length_mask().value().count_ones()
    }

    /// The start address of the memory region, inclusive.
    #[inline(always)]
    pub fn logical_start(&self) -> Address {
        Address(
            ((self.effective_address_region().value() as u32) << 17)
                & !((self.block_length_mask().value() as u32) << 17),
        )
    }

    /// Whether the memory region contains the given logical address.
    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        let start = self.logical_start().value();
        addr.value().wrapping_sub(start) < self.block_length()
    }

    /// Translates a logical address into a physical address.
    #[inline(always)]
    pub fn translate(&self, addr: Address) -> Address {
        let offset = addr.value().bits(0, 17);
        let region = ((addr.value().bits(17, 28) << 17)
            // only allow bits within the block length to be changed
            & ((self.block_length_mask().value() as u32) << 17))
            // insert the real page number
            | ((self.physical_address_region().value() as u32) << 17);

        Address(region | offset)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spr_names() {
        assert_eq!("srr0".parse::<Spr>(), Ok(Spr::Srr0));
        assert_eq!("IBAT0U".parse::<Spr>(), Ok(Spr::Ibat0U));
        assert_eq!(<&'static str>::from(Spr::Mmcr0), "MMCR0");
        assert!("nope".parse::<Spr>().is_err());
    }

    #[test]
    fn supervisor_sprs() {
        assert!(!Spr::Lr.is_supervisor());
        assert!(!Spr::Ctr.is_supervisor());
        assert!(Spr::Srr0.is_supervisor());
        assert!(Spr::Dec.is_supervisor());
        assert!(Spr::Hid0.is_supervisor());
        assert!(!Spr::Upmc1.is_supervisor());
    }

    #[test]
    fn mmcr0_layout() {
        let mmcr0 = Mmcr0::from_bits((1 << 15) | (1 << 14) | (11 << 6) | 1);
        assert_eq!(mmcr0.pmc2_select().value(), 1);
        assert_eq!(mmcr0.pmc1_select().value(), 11);
        assert!(mmcr0.pmc_int_control());
        assert!(mmcr0.pmc1_int_control());

        let mmcr1 = Mmcr1::from_bits((11 << 27) | (1 << 22));
        assert_eq!(mmcr1.pmc3_select().value(), 11);
        assert_eq!(mmcr1.pmc4_select().value(), 1);
    }

    #[test]
    fn default_os_bat() {
        // 256 MiB at 0x8000_0000 -> 0x0000_0000, supervisor only
        let bat = Bat::from_pair(0x8000_1FFE, 0x0000_0002);
        assert!(bat.valid(false));
        assert!(!bat.valid(true));
        assert_eq!(bat.block_length(), 256 * 1024 * 1024);
        assert!(bat.contains(Address(0x8000_0000)));
        assert!(bat.contains(Address(0x8FFF_FFFF)));
        assert!(!bat.contains(Address(0x9000_0000)));
        assert_eq!(bat.translate(Address(0x8012_3456)), Address(0x0012_3456));
    }
}
