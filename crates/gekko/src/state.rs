//! The processor state.

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, InstructionCache};
use crate::exception::Exceptions;
use crate::fpu::FloatClass;
use crate::regs::{
    CondReg, FloatControlReg, FloatRounding, Hid0, MachineState, PairedSingle, Sdr1, Xer,
};
use crate::spr::{Mmcr0, Mmcr1, Spr};
use crate::tlb::Tlb;
use crate::Address;

/// Which flavour of the processor is being emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// The GameCube processor.
    #[default]
    Gekko,
    /// The Wii processor.
    Broadway,
}

impl Variant {
    /// Value of the processor version register.
    pub const fn pvr(self) -> u32 {
        match self {
            Self::Gekko => 0x0008_3214,
            Self::Broadway => 0x0008_7102,
        }
    }

    /// Whether BATs 4-7 exist.
    pub const fn has_extra_bats(self) -> bool {
        matches!(self, Self::Broadway)
    }
}

/// Host floating point environment derived from FPSCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpEnv {
    pub rounding: FloatRounding,
    /// Whether denormal results are flushed to zero (non-IEEE mode).
    pub flush_denormals: bool,
}

impl Default for FpEnv {
    fn default() -> Self {
        Self {
            rounding: FloatRounding::Nearest,
            flush_denormals: false,
        }
    }
}

/// A register which can be accessed by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Gpr(usize),
    /// Lane 0 of a floating point register, as raw bits.
    Fpr(usize),
    /// Lane 1 of a paired single register, as raw bits.
    Ps1(usize),
    Sr(usize),
    Pc,
    Npc,
    Cr,
    Msr,
    Xer,
    Fpscr,
    Spr(Spr),
}

impl std::str::FromStr for Register {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let indexed = |prefix: &str, count: usize| {
            lower
                .strip_prefix(prefix)
                .and_then(|i| i.parse::<usize>().ok())
                .filter(|&i| i < count)
        };

        Ok(match lower.as_str() {
            "pc" => Self::Pc,
            "npc" => Self::Npc,
            "cr" => Self::Cr,
            "msr" => Self::Msr,
            "xer" => Self::Xer,
            "fpscr" => Self::Fpscr,
            _ => {
                if let Some(i) = indexed("r", 32) {
                    Self::Gpr(i)
                } else if let Some(i) = indexed("f", 32) {
                    Self::Fpr(i)
                } else if let Some(i) = indexed("ps1_", 32) {
                    Self::Ps1(i)
                } else if let Some(i) = indexed("sr", 16) {
                    Self::Sr(i)
                } else {
                    Self::Spr(lower.parse().map_err(|_| ())?)
                }
            }
        })
    }
}

/// The architectural state of the processor, plus the emulated caches and TLB.
#[derive(Clone)]
pub struct Cpu {
    pub gpr: [u32; 32],
    /// Address of the current instruction.
    pub pc: Address,
    /// Address of the next instruction.
    pub npc: Address,
    pub cr: CondReg,
    pub msr: MachineState,
    pub fpscr: FloatControlReg,
    /// Pending exception causes.
    pub exceptions: Exceptions,
    /// Cycles left until the next scheduled event. Counted down by the executing core.
    pub downcount: i32,
    /// Carry bit of XER.
    pub xer_ca: u8,
    /// Summary overflow (bit 1) and overflow (bit 0) bits of XER.
    pub xer_so_ov: u8,
    /// Byte count and compare byte of XER.
    pub xer_stringctrl: u16,
    pub ps: [PairedSingle; 32],
    pub sr: [u32; 16],
    pub spr: [u32; 1024],
    pub tlb: Tlb,
    pub pagetable_base: u32,
    pub pagetable_hashmask: u32,
    /// Whether a `lwarx` reservation is held.
    pub reserve: bool,
    pub reserve_address: Address,
    pub icache: InstructionCache,
    pub dcache: Cache,
    pub fp_env: FpEnv,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            pc: Address(0),
            npc: Address(0),
            cr: CondReg::default(),
            msr: MachineState::default(),
            fpscr: FloatControlReg::default(),
            exceptions: Exceptions::empty(),
            downcount: 0,
            xer_ca: 0,
            xer_so_ov: 0,
            xer_stringctrl: 0,
            ps: [PairedSingle::default(); 32],
            sr: [0; 16],
            spr: [0; 1024],
            tlb: Tlb::default(),
            pagetable_base: 0,
            pagetable_hashmask: 0,
            reserve: false,
            reserve_address: Address(0),
            icache: InstructionCache::default(),
            dcache: Cache::default(),
            fp_env: FpEnv::default(),
        }
    }
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("pc", &self.pc)
            .field("npc", &self.npc)
            .field("gpr", &self.gpr)
            .field("cr", &self.cr)
            .field("xer", &format_args!("{:08X}", self.xer()))
            .field("msr", &format_args!("{:08X}", self.msr.to_bits()))
            .field("lr", &format_args!("{:08X}", self.spr(Spr::Lr)))
            .field("ctr", &format_args!("{:08X}", self.spr(Spr::Ctr)))
            .field("exceptions", &self.exceptions)
            .finish_non_exhaustive()
    }
}

impl Cpu {
    /// Puts every register in its power-on state.
    pub fn reset_registers(&mut self, variant: Variant) {
        self.gpr = [0; 32];
        self.ps = [PairedSingle::default(); 32];
        self.sr = [0; 16];
        self.spr = [0; 1024];
        self.cr = CondReg::default();

        self.pc = Address(0);
        self.npc = Address(0);
        self.msr = MachineState::default();
        self.fpscr = FloatControlReg::default();
        self.exceptions = Exceptions::empty();
        self.downcount = 0;
        self.set_xer(0);

        self.pagetable_base = 0;
        self.pagetable_hashmask = 0;
        self.clear_reservation();

        self.set_spr(Spr::Pvr, variant.pvr());
        self.set_spr(Spr::Hid1, 0x8000_0000);
        self.set_spr(Spr::EcidU, 0x0D96_E200);
        self.set_spr(Spr::EcidM, 0x1840_C00D);
        self.set_spr(Spr::EcidL, 0x82BB_08E8);
        self.set_spr(Spr::Dec, 0xFFFF_FFFF);

        self.update_fp_env();
    }

    #[inline(always)]
    pub fn spr(&self, spr: Spr) -> u32 {
        self.spr[spr.index()]
    }

    #[inline(always)]
    pub fn set_spr(&mut self, spr: Spr, value: u32) {
        self.spr[spr.index()] = value;
    }

    #[inline(always)]
    pub fn lr(&self) -> u32 {
        self.spr(Spr::Lr)
    }

    #[inline(always)]
    pub fn ctr(&self) -> u32 {
        self.spr(Spr::Ctr)
    }

    #[inline(always)]
    pub fn hid0(&self) -> Hid0 {
        Hid0::from_bits(self.spr(Spr::Hid0))
    }

    #[inline(always)]
    pub fn mmcr0(&self) -> Mmcr0 {
        Mmcr0::from_bits(self.spr(Spr::Mmcr0))
    }

    #[inline(always)]
    pub fn mmcr1(&self) -> Mmcr1 {
        Mmcr1::from_bits(self.spr(Spr::Mmcr1))
    }

    /// Whether the Wii only BATs 4-7 are enabled (HID4\[SBE\]).
    #[inline(always)]
    pub fn extra_bats_enabled(&self) -> bool {
        self.spr(Spr::Hid4) & (1 << 25) != 0
    }

    /// The architectural XER value.
    #[inline(always)]
    pub fn xer(&self) -> u32 {
        Xer {
            ca: self.xer_ca,
            so_ov: self.xer_so_ov,
            stringctrl: self.xer_stringctrl,
        }
        .to_bits()
    }

    /// Sets XER from its architectural value.
    #[inline(always)]
    pub fn set_xer(&mut self, value: u32) {
        let xer = Xer::from_bits(value);
        self.xer_ca = xer.ca;
        self.xer_so_ov = xer.so_ov;
        self.xer_stringctrl = xer.stringctrl;
    }

    /// XER\[SO\].
    #[inline(always)]
    pub fn xer_so(&self) -> bool {
        self.xer_so_ov & 0b10 != 0
    }

    /// Sets XER\[OV\], and also XER\[SO\] if `overflow` is true.
    #[inline(always)]
    pub fn set_xer_ov(&mut self, overflow: bool) {
        if overflow {
            self.xer_so_ov = 0b11;
        } else {
            self.xer_so_ov &= 0b10;
        }
    }

    /// Sets a segment register.
    pub fn set_sr(&mut self, index: usize, value: u32) {
        tracing::debug!(index, value = format_args!("{value:08X}"), "segment register updated");
        self.sr[index] = value;
    }

    /// Sets SDR1 and the page table location derived from it.
    pub fn set_sdr1(&mut self, value: u32) {
        let sdr = Sdr1::from_bits(value);
        self.set_spr(Spr::Sdr1, value);
        self.pagetable_base = sdr.pagetable_base();
        self.pagetable_hashmask = sdr.pagetable_hashmask();
    }

    /// Sets CR0 from a result, as done by the record (`.`) forms.
    #[inline(always)]
    pub fn update_cr0(&mut self, value: u32) {
        let value = value as i32;
        let so = self.xer_so();
        self.cr.set_compare(0, value < 0, value > 0, value == 0, so);
    }

    /// Copies FPSCR\[FX, FEX, VX, OX\] into CR1.
    #[inline(always)]
    pub fn update_cr1(&mut self) {
        self.cr.set_field(1, self.fpscr.to_bits() >> 28);
    }

    /// Sets FPSCR\[FPRF\] from a double result.
    #[inline(always)]
    pub fn update_fprf_double(&mut self, value: f64) {
        self.fpscr.set_fprf(FloatClass::of_double(value).fprf());
    }

    /// Sets FPSCR\[FPRF\] from a single result.
    #[inline(always)]
    pub fn update_fprf_single(&mut self, value: f32) {
        self.fpscr.set_fprf(FloatClass::of_single(value).fprf());
    }

    /// Recomputes the floating point environment after FPSCR changed.
    pub fn update_fp_env(&mut self) {
        self.fp_env = FpEnv {
            rounding: self.fpscr.rounding(),
            flush_denormals: self.fpscr.non_ieee(),
        };
    }

    #[inline(always)]
    pub fn clear_reservation(&mut self) {
        self.reserve = false;
        self.reserve_address = Address(0);
    }

    /// Reads a register.
    pub fn register(&self, register: Register) -> u64 {
        match register {
            Register::Gpr(i) => self.gpr[i] as u64,
            Register::Fpr(i) => self.ps[i].ps0,
            Register::Ps1(i) => self.ps[i].ps1,
            Register::Sr(i) => self.sr[i] as u64,
            Register::Pc => self.pc.value() as u64,
            Register::Npc => self.npc.value() as u64,
            Register::Cr => self.cr.get() as u64,
            Register::Msr => self.msr.to_bits() as u64,
            Register::Xer => self.xer() as u64,
            Register::Fpscr => self.fpscr.to_bits() as u64,
            Register::Spr(spr) => self.spr(spr) as u64,
        }
    }

    /// Writes a register. 32 bit registers take the lower half of `value`.
    pub fn set_register(&mut self, register: Register, value: u64) {
        match register {
            Register::Gpr(i) => self.gpr[i] = value as u32,
            Register::Fpr(i) => self.ps[i].ps0 = value,
            Register::Ps1(i) => self.ps[i].ps1 = value,
            Register::Sr(i) => self.set_sr(i, value as u32),
            Register::Pc => self.pc = Address(value as u32),
            Register::Npc => self.npc = Address(value as u32),
            Register::Cr => self.cr.set(value as u32),
            Register::Msr => self.msr = MachineState::from_bits(value as u32),
            Register::Xer => self.set_xer(value as u32),
            Register::Fpscr => {
                self.fpscr = FloatControlReg::from_bits(value as u32);
                self.update_fp_env();
            }
            Register::Spr(Spr::Xer) => self.set_xer(value as u32),
            Register::Spr(Spr::Sdr1) => self.set_sdr1(value as u32),
            Register::Spr(spr) => self.set_spr(spr, value as u32),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn power_on_state() {
        let mut cpu = Cpu::default();
        cpu.gpr[3] = 5;
        cpu.reserve = true;
        cpu.reset_registers(Variant::Broadway);

        assert_eq!(cpu.gpr[3], 0);
        assert!(!cpu.reserve);
        assert_eq!(cpu.spr(Spr::Pvr), 0x0008_7102);
        assert_eq!(cpu.spr(Spr::Hid1), 0x8000_0000);
        assert_eq!(cpu.spr(Spr::Dec), 0xFFFF_FFFF);
        assert_eq!(cpu.cr.fields, [CondReg::RESET_FIELD; 8]);
        assert_eq!(cpu.cr.get(), 0);
        assert_eq!(cpu.xer(), 0);

        cpu.reset_registers(Variant::Gekko);
        assert_eq!(cpu.spr(Spr::Pvr), 0x0008_3214);
        assert_eq!(cpu.spr(Spr::EcidU), 0x0D96_E200);
    }

    #[test]
    fn xer_roundtrip() {
        let mut cpu = Cpu::default();
        cpu.set_xer(0xA000_0012);
        assert_eq!(cpu.xer_ca, 1);
        assert!(cpu.xer_so());
        assert_eq!(cpu.xer_stringctrl, 0x12);
        assert_eq!(cpu.xer(), 0xA000_0012);

        cpu.set_xer_ov(true);
        assert_eq!(cpu.xer(), 0xE000_0012);
        cpu.set_xer_ov(false);
        assert_eq!(cpu.xer(), 0xA000_0012);
    }

    #[test]
    fn cr0_from_results() {
        let mut cpu = Cpu::default();
        cpu.update_cr0(0);
        assert_eq!(cpu.cr.field(0), 0b0010);
        cpu.update_cr0(0x8000_0000);
        assert_eq!(cpu.cr.field(0), 0b1000);
        cpu.update_cr0(1);
        assert_eq!(cpu.cr.field(0), 0b0100);

        // a zero result with SO set must not read as greater than
        cpu.set_xer(1 << 31);
        cpu.update_cr0(0);
        assert_eq!(cpu.cr.field(0), 0b0011);
    }

    #[test]
    fn fprf_of_results() {
        let mut cpu = Cpu::default();
        cpu.update_fprf_double(-0.0);
        assert_eq!(cpu.fpscr.fprf(), 0x12);
        cpu.update_fprf_single(f32::INFINITY);
        assert_eq!(cpu.fpscr.fprf(), 0x05);
    }

    #[test]
    fn registers_by_name() {
        let mut cpu = Cpu::default();

        let r3 = "r3".parse::<Register>().unwrap();
        cpu.set_register(r3, 0x1_0000_0042);
        assert_eq!(cpu.gpr[3], 0x42);
        assert_eq!(cpu.register(r3), 0x42);

        let f1 = "F1".parse::<Register>().unwrap();
        cpu.set_register(f1, 1.5f64.to_bits());
        assert_eq!(cpu.ps[1].ps0_as_double(), 1.5);

        let lr = "lr".parse::<Register>().unwrap();
        assert_eq!(lr, Register::Spr(Spr::Lr));
        cpu.set_register(lr, 0x8000_0100);
        assert_eq!(cpu.lr(), 0x8000_0100);

        let sdr1 = "sdr1".parse::<Register>().unwrap();
        cpu.set_register(sdr1, 0x0031_0003);
        assert_eq!(cpu.pagetable_base, 0x0031_0000);
        assert_eq!(cpu.pagetable_hashmask, 0xFFF);

        assert_eq!("sr15".parse::<Register>(), Ok(Register::Sr(15)));
        assert!("r32".parse::<Register>().is_err());
        assert!("bogus".parse::<Register>().is_err());
    }
}
