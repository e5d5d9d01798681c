//! Composite registers and their bit fields.

use bitos::integer::u9;
use bitos::{BitUtils, bitos};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Bit of the fast CR field format which holds SO.
const CR_SO_BIT: u32 = 59;
/// Bit of the fast CR field format which holds LT.
const CR_LT_BIT: u32 = 62;

/// Flags of a condition register field, in PowerPC order.
pub mod cr {
    pub const SO: u32 = 0b0001;
    pub const EQ: u32 = 0b0010;
    pub const GT: u32 = 0b0100;
    pub const LT: u32 = 0b1000;
}

/// The condition register (CR) contains 8 fields, named CR0-CR7, each containing flags
/// corresponding to some comparison operation.
///
/// Every field is kept in a 64 bit form which allows comparison results to be stored without
/// computing each flag:
/// - SO iff bit 59 is set
/// - EQ iff the lower 32 bits are zero
/// - GT iff the value, as an `i64`, is greater than zero
/// - LT iff bit 62 is set
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct CondReg {
    pub fields: [u64; 8],
}

impl CondReg {
    /// Value every field holds after a reset. Reads back as all flags clear.
    pub const RESET_FIELD: u64 = 0x8000_0000_0000_0001;

    /// Converts a 4 bit PowerPC field into the fast form.
    pub const fn ppc_to_internal(value: u32) -> u64 {
        let mut field = 1 << 32;
        field |= ((value & cr::SO != 0) as u64) << CR_SO_BIT;
        field |= (value & cr::EQ == 0) as u64;
        field |= ((value & cr::GT == 0) as u64) << 63;
        field |= ((value & cr::LT != 0) as u64) << CR_LT_BIT;
        field
    }

    /// Converts a field in the fast form into its 4 bit PowerPC value.
    pub const fn internal_to_ppc(field: u64) -> u32 {
        let mut value = 0;
        value |= (((field >> CR_SO_BIT) & 1) as u32) * cr::SO;
        value |= ((field as u32 == 0) as u32) * cr::EQ;
        value |= ((field as i64 > 0) as u32) * cr::GT;
        value |= (((field >> CR_LT_BIT) & 1) as u32) * cr::LT;
        value
    }

    /// Returns the 4 bit value of field `index`.
    #[inline(always)]
    pub fn field(&self, index: usize) -> u32 {
        Self::internal_to_ppc(self.fields[index])
    }

    /// Sets the 4 bit value of field `index`.
    #[inline(always)]
    pub fn set_field(&mut self, index: usize, value: u32) {
        self.fields[index] = Self::ppc_to_internal(value & 0xF);
    }

    /// Sets field `index` from the result of a comparison.
    pub fn set_compare(&mut self, index: usize, lt: bool, gt: bool, eq: bool, so: bool) {
        let value = (lt as u32) * cr::LT
            | (gt as u32) * cr::GT
            | (eq as u32) * cr::EQ
            | (so as u32) * cr::SO;

        self.set_field(index, value);
    }

    /// Returns bit `bit` of the whole register, in PowerPC (big endian) bit order.
    #[inline(always)]
    pub fn bit(&self, bit: u32) -> bool {
        let field = self.field((bit >> 2) as usize);
        (field >> (3 - (bit & 3))) & 1 != 0
    }

    /// Sets bit `bit` of the whole register, in PowerPC (big endian) bit order.
    pub fn set_bit(&mut self, bit: u32, value: bool) {
        let index = (bit >> 2) as usize;
        let mask = 0x8 >> (bit & 3);
        let field = self.field(index);
        self.set_field(index, if value { field | mask } else { field & !mask });
    }

    /// Returns the whole register in its 32 bit PowerPC form.
    pub fn get(&self) -> u32 {
        (0..8).fold(0, |acc, i| acc | self.field(i) << (28 - 4 * i))
    }

    /// Sets the whole register from its 32 bit PowerPC form.
    pub fn set(&mut self, value: u32) {
        for i in 0..8 {
            self.set_field(i, (value >> (28 - 4 * i)) & 0xF);
        }
    }
}

impl Default for CondReg {
    fn default() -> Self {
        Self {
            fields: [Self::RESET_FIELD; 8],
        }
    }
}

impl std::fmt::Debug for CondReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CondReg({:08X})", self.get())
    }
}

/// The Machine State register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineState {
    /// Whether little endian mode is turned on.
    #[bits(0)]
    pub little_endian: bool,
    /// Whether the last exception is recoverable.
    #[bits(1)]
    pub recoverable_exception: bool,
    /// Marks the process for the performance monitor.
    #[bits(2)]
    pub performance_monitor: bool,
    /// Whether data address translation is enabled.
    #[bits(4)]
    pub data_addr_translation: bool,
    /// Whether instruction address translation is enabled.
    #[bits(5)]
    pub instr_addr_translation: bool,
    /// Whether exception vectors are at 0x0000_nnnn (off) or 0xFFF0_nnnn (on).
    #[bits(6)]
    pub exception_prefix: bool,
    #[bits(8)]
    pub float_exception_mode_1: bool,
    /// Branch trace enable.
    #[bits(9)]
    pub branch_trace: bool,
    /// Single step trace enable.
    #[bits(10)]
    pub step_trace: bool,
    #[bits(11)]
    pub float_exception_mode_0: bool,
    /// Whether machine check exceptions are enabled.
    #[bits(12)]
    pub machine_check: bool,
    /// Whether floating point instructions can be used.
    #[bits(13)]
    pub float_available: bool,
    /// Whether the processor is running in user (problem) mode.
    #[bits(14)]
    pub user_mode: bool,
    /// Whether external exceptions are enabled.
    #[bits(15)]
    pub interrupts: bool,
    /// The value of `little_endian` after an exception is taken.
    #[bits(16)]
    pub exception_little_endian: bool,
    /// Power management.
    #[bits(18)]
    pub reduced_power: bool,
}

/// The XER register, as seen by software.
///
/// The processor state keeps XER split into its carry, summary overflow/overflow and string
/// control parts; this type only exists to build and take apart the architectural value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Xer {
    pub ca: u8,
    pub so_ov: u8,
    pub stringctrl: u16,
}

impl Xer {
    pub const CA_SHIFT: u32 = 29;
    pub const OV_SHIFT: u32 = 30;
    pub const SO_SHIFT: u32 = 31;

    /// Takes apart an architectural XER value.
    pub const fn from_bits(value: u32) -> Self {
        Self {
            ca: ((value >> Self::CA_SHIFT) & 1) as u8,
            so_ov: (value >> Self::OV_SHIFT) as u8,
            stringctrl: (value & 0xFF7F) as u16,
        }
    }

    /// Builds the architectural XER value.
    pub const fn to_bits(self) -> u32 {
        self.stringctrl as u32
            | (self.ca as u32) << Self::CA_SHIFT
            | (self.so_ov as u32) << Self::OV_SHIFT
    }
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRounding {
    Nearest       = 0b00,
    TowardsZero   = 0b01,
    TowardsPosInf = 0b10,
    TowardsNegInf = 0b11,
}

/// The Floating Point Status and Control register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FloatControlReg {
    /// Floating-point rounding mode.
    #[bits(0..2)]
    pub rounding: FloatRounding,
    /// Whether non-IEEE mode is enabled (denormal results are flushed to zero).
    #[bits(2)]
    pub non_ieee: bool,
    #[bits(3)]
    pub inexact_exception_enabled: bool,
    #[bits(4)]
    pub zero_divide_exception_enabled: bool,
    #[bits(5)]
    pub underflow_exception_enabled: bool,
    #[bits(6)]
    pub overflow_exception_enabled: bool,
    #[bits(7)]
    pub invalid_exception_enabled: bool,
    /// Invalid operation exception for invalid integer conversion.
    #[bits(8)]
    pub invalid_conversion_exception: bool,
    /// Invalid operation exception for invalid square root.
    #[bits(9)]
    pub invalid_sqrt_exception: bool,
    /// Invalid operation exception for software request.
    #[bits(10)]
    pub invalid_soft_exception: bool,
    /// Whether the last result was inexact.
    #[bits(17)]
    pub fraction_inexact: bool,
    /// Whether the last rounded result incremented the fraction.
    #[bits(18)]
    pub fraction_rounded: bool,
    #[bits(19)]
    pub invalid_compare_exception: bool,
    #[bits(20)]
    pub invalid_inf_mul_zero_exception: bool,
    #[bits(21)]
    pub invalid_zero_div_zero_exception: bool,
    #[bits(22)]
    pub invalid_inf_div_inf_exception: bool,
    #[bits(23)]
    pub invalid_inf_sub_inf_exception: bool,
    #[bits(24)]
    pub invalid_snan_exception: bool,
    #[bits(25)]
    pub inexact_exception: bool,
    #[bits(26)]
    pub zero_divide_exception: bool,
    #[bits(27)]
    pub underflow_exception: bool,
    #[bits(28)]
    pub overflow_exception: bool,
    /// Summary of the invalid operation exception bits.
    #[bits(29)]
    pub invalid_op_exception_summary: bool,
    /// Summary of the enabled exception bits.
    #[bits(30)]
    pub enabled_exception_summary: bool,
    /// Floating-point exception summary.
    #[bits(31)]
    pub exception_summary: bool,
}

impl FloatControlReg {
    /// The floating point result flags (FPRF): class and condition code of the last result.
    #[inline(always)]
    pub fn fprf(&self) -> u32 {
        self.to_bits().bits(12, 17)
    }

    /// Sets the floating point result flags (FPRF).
    #[inline(always)]
    pub fn set_fprf(&mut self, value: u32) {
        *self = Self::from_bits(self.to_bits().with_bits(12, 17, value & 0x1F));
    }

    /// The floating point condition code (FPCC), the lower 4 bits of FPRF.
    #[inline(always)]
    pub fn fpcc(&self) -> u32 {
        self.fprf() & 0xF
    }

    /// Recomputes the summary bits. Must be called whenever an exception bit changes.
    pub fn update_summaries(&mut self) {
        let bits = self.to_bits();
        let invalid = bits.bits(19, 25) != 0 || bits.bits(8, 11) != 0;
        let enabled = (bits.bits(25, 29) & bits.bits(3, 7)) != 0
            || (invalid && self.invalid_exception_enabled());

        self.set_invalid_op_exception_summary(invalid);
        self.set_enabled_exception_summary(enabled);
    }
}

/// A paired single register. Each lane holds the raw bits of a double; reinterpreting a lane is
/// always a bit cast.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct PairedSingle {
    pub ps0: u64,
    pub ps1: u64,
}

impl PairedSingle {
    /// Lane 0 as a double.
    #[inline(always)]
    pub fn ps0_as_double(&self) -> f64 {
        f64::from_bits(self.ps0)
    }

    /// Lane 1 as a double.
    #[inline(always)]
    pub fn ps1_as_double(&self) -> f64 {
        f64::from_bits(self.ps1)
    }

    /// Lane 0 as the raw bits of a double.
    #[inline(always)]
    pub fn ps0_as_u64(&self) -> u64 {
        self.ps0
    }

    #[inline(always)]
    pub fn set_ps0(&mut self, value: f64) {
        self.ps0 = value.to_bits();
    }

    #[inline(always)]
    pub fn set_ps1(&mut self, value: f64) {
        self.ps1 = value.to_bits();
    }

    /// Sets both lanes at once.
    #[inline(always)]
    pub fn set_both(&mut self, ps0: f64, ps1: f64) {
        self.set_ps0(ps0);
        self.set_ps1(ps1);
    }

    /// Sets both lanes to the same value.
    #[inline(always)]
    pub fn fill(&mut self, value: f64) {
        self.set_both(value, value);
    }
}

/// Hardware implementation register 0.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hid0 {
    #[bits(0)]
    pub noopti: bool,
    #[bits(2)]
    pub branch_history: bool,
    #[bits(5)]
    pub branch_target_cache: bool,
    /// Data cache flush assist.
    #[bits(6)]
    pub dcache_flush_assist: bool,
    /// Store gathering enable.
    #[bits(7)]
    pub store_gathering: bool,
    /// Data cache flash invalidate.
    #[bits(10)]
    pub dcache_flash_invalidate: bool,
    /// Instruction cache flash invalidate.
    #[bits(11)]
    pub icache_flash_invalidate: bool,
    /// Data cache lock.
    #[bits(12)]
    pub dcache_lock: bool,
    /// Instruction cache lock.
    #[bits(13)]
    pub icache_lock: bool,
    /// Data cache enable.
    #[bits(14)]
    pub dcache_enable: bool,
    /// Instruction cache enable.
    #[bits(15)]
    pub icache_enable: bool,
}

/// Storage description register 1, which locates the page table.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sdr1 {
    /// Mask of the upper hash bits used to index the page table.
    #[bits(0..9)]
    pub htabmask: u9,
    /// Physical base address of the page table, in units of 64 KiB.
    #[bits(16..32)]
    pub htaborg: u16,
}

impl Sdr1 {
    /// Physical base address of the page table.
    pub fn pagetable_base(&self) -> u32 {
        (self.htaborg() as u32) << 16
    }

    /// Mask applied to the primary/secondary hash to select a PTEG.
    pub fn pagetable_hashmask(&self) -> u32 {
        ((self.htabmask().value() as u32) << 10) | 0x3FF
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reset_field_reads_as_clear() {
        let cr = CondReg::default();
        assert_eq!(cr.get(), 0);
        for i in 0..8 {
            assert_eq!(cr.field(i), 0);
        }
    }

    #[test]
    fn cr_fields_roundtrip_every_value() {
        let mut cr = CondReg::default();
        for value in 0..16 {
            cr.set_field(3, value);
            assert_eq!(cr.field(3), value, "field value {value:04b}");
        }
    }

    #[test]
    fn cr_whole_register() {
        let mut cr = CondReg::default();
        cr.set(0x1234_5678);
        assert_eq!(cr.get(), 0x1234_5678);
        assert_eq!(cr.field(0), 0x1);
        assert_eq!(cr.field(7), 0x8);

        // bit 0 is the LT bit of CR0
        cr.set_bit(0, true);
        assert_eq!(cr.field(0), 0x9);
        assert!(cr.bit(0));
        assert!(!cr.bit(1));

        cr.set_bit(3, false);
        assert_eq!(cr.field(0), 0x8);
    }

    #[test]
    fn xer_split() {
        let xer = Xer::from_bits(0xE000_FF7F);
        assert_eq!(xer.ca, 1);
        assert_eq!(xer.so_ov, 0b11);
        assert_eq!(xer.stringctrl, 0xFF7F);
        assert_eq!(xer.to_bits(), 0xE000_FF7F);

        // bit 7 of the string control is not kept
        assert_eq!(Xer::from_bits(0x80).stringctrl, 0);
    }

    #[test]
    fn paired_single_is_bit_cast() {
        let mut ps = PairedSingle::default();
        ps.set_ps0(f64::NAN);
        assert_eq!(ps.ps0, f64::NAN.to_bits());

        ps.ps1 = 0x7FF0_0000_0000_0001;
        assert!(ps.ps1_as_double().is_nan());
        assert_eq!(ps.ps1_as_double().to_bits(), 0x7FF0_0000_0000_0001);
    }

    #[test]
    fn fprf_accessors() {
        let mut fpscr = FloatControlReg::from_bits(0xFFFF_FFFF);
        fpscr.set_fprf(0x05);
        assert_eq!(fpscr.fprf(), 0x05);
        assert_eq!(fpscr.to_bits() & !(0x1F << 12), 0xFFFF_FFFF & !(0x1F << 12));
    }

    #[test]
    fn sdr1_fields() {
        let sdr = Sdr1::from_bits(0x0031_0003);
        assert_eq!(sdr.pagetable_base(), 0x0031_0000);
        assert_eq!(sdr.pagetable_hashmask(), 0xFFF);
    }
}
