//! Address translation: block address translation (BATs) and the hashed page table.

use bitos::bitos;
use bitos::integer::u15;
use gekko::spr::Bat;
use gekko::tlb::{Pte1, Pte2, TlbLookup, XCheck};
use gekko::{Address, Cpu, Spr};

use crate::system::{CodeChange, System};

/// Number of BAT table entries: one per 128 KiB block of the address space.
const BAT_ENTRIES: usize = 1 << 15;
/// Shift from an effective address to its BAT table index.
const BAT_SHIFT: u32 = 17;

/// An entry of a BAT lookup table.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatEntry {
    /// Whether a BAT maps this block.
    #[bits(0)]
    pub mapped: bool,
    /// Whether the block is write-through or caching-inhibited.
    #[bits(2)]
    pub wi: bool,
    /// Physical block number.
    #[bits(17..32)]
    pub block: u15,
}

/// A BAT lookup table, mapping every 128 KiB block of the effective address space.
#[derive(Clone)]
pub struct BatTable(Vec<BatEntry>);

impl Default for BatTable {
    fn default() -> Self {
        Self(vec![BatEntry::default(); BAT_ENTRIES])
    }
}

impl std::fmt::Debug for BatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapped = self.0.iter().filter(|e| e.mapped()).count();
        f.debug_struct("BatTable").field("mapped", &mapped).finish()
    }
}

impl BatTable {
    #[inline(always)]
    pub fn get(&self, ea: Address) -> BatEntry {
        self.0[(ea.value() >> BAT_SHIFT) as usize]
    }

    /// Translates `ea` if a BAT maps it. Returns the physical address and whether it is
    /// write-through or caching-inhibited.
    #[inline(always)]
    pub fn translate(&self, ea: Address) -> Option<(Address, bool)> {
        let entry = self.get(ea);
        entry.mapped().then(|| {
            let base = (entry.block().value() as u32) << BAT_SHIFT;
            (Address(base | (ea.value() & ((1 << BAT_SHIFT) - 1))), entry.wi())
        })
    }

    /// Fills in the blocks mapped by the four BAT pairs starting at `first`.
    fn add_bats(&mut self, cpu: &Cpu, first: Spr) {
        for i in 0..4 {
            let upper = cpu.spr[first.index() + 2 * i];
            let lower = cpu.spr[first.index() + 2 * i + 1];
            let bat = Bat::from_pair(upper, lower);

            if !bat.user_mode() && !bat.supervisor_mode() {
                continue;
            }

            let bepi = bat.effective_address_region().value() as u32;
            let brpn = bat.physical_address_region().value() as u32;
            let bl = bat.block_length_mask().value() as u32;

            if bepi & bl != 0 {
                tracing::warn!(upper, lower, "bad BAT setup: BEPI overlaps BL");
                continue;
            }

            if brpn & bl != 0 {
                tracing::warn!(upper, lower, "bad BAT setup: BRPN overlaps BL");
            }

            if !(bl + 1).is_power_of_two() {
                tracing::warn!(upper, lower, "bad BAT setup: invalid mask in BL");
            }

            // write-through or caching-inhibited
            let wi = lower & 0x60 != 0;
            for j in (0..=bl).filter(|j| j & bl == *j) {
                self.0[(bepi | j) as usize] = BatEntry::default()
                    .with_mapped(true)
                    .with_wi(wi)
                    .with_block(u15::new((brpn | j) as u16));
            }
        }
    }
}

/// BAT lookup tables.
#[derive(Debug, Default, Clone)]
pub struct Mmu {
    pub ibat: BatTable,
    pub dbat: BatTable,
}

impl Mmu {
    /// Rebuilds the instruction BAT table from the IBAT registers.
    pub fn update_ibat(&mut self, cpu: &Cpu, is_wii: bool) {
        self.ibat = BatTable::default();
        self.ibat.add_bats(cpu, Spr::Ibat0U);
        if is_wii && cpu.extra_bats_enabled() {
            self.ibat.add_bats(cpu, Spr::Ibat4U);
        }
    }

    /// Rebuilds the data BAT table from the DBAT registers.
    pub fn update_dbat(&mut self, cpu: &Cpu, is_wii: bool) {
        self.dbat = BatTable::default();
        self.dbat.add_bats(cpu, Spr::Dbat0U);
        if is_wii && cpu.extra_bats_enabled() {
            self.dbat.add_bats(cpu, Spr::Dbat4U);
        }
    }
}

/// Result of translating an effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Translation is disabled: the address is already physical.
    Real { addr: Address },
    /// Translated through a BAT.
    Bat { addr: Address, wi: bool },
    /// Translated through the page table.
    Page { addr: Address, wi: bool },
    /// The segment is a direct store segment.
    DirectStore,
    /// No translation exists.
    PageFault,
}

impl Translation {
    /// The physical address and whether it is write-through or caching-inhibited, if the
    /// translation succeeded.
    #[inline(always)]
    pub fn success(self) -> Option<(Address, bool)> {
        match self {
            Self::Real { addr } => Some((addr, false)),
            Self::Bat { addr, wi } | Self::Page { addr, wi } => Some((addr, wi)),
            Self::DirectStore | Self::PageFault => None,
        }
    }
}

/// Segment register bit marking a direct store segment.
const SR_DIRECT_STORE: u32 = 1 << 31;
/// Segment register bit forbidding instruction fetches.
const SR_NO_EXECUTE: u32 = 1 << 28;

impl System {
    /// Rebuilds the instruction BAT table.
    pub fn ibat_updated(&mut self) {
        self.mmu.update_ibat(&self.cpu, self.config.is_wii);
        self.code_changes.push(CodeChange::All);
    }

    /// Rebuilds the data BAT table.
    pub fn dbat_updated(&mut self) {
        self.mmu.update_dbat(&self.cpu, self.config.is_wii);
    }

    /// Invalidates the TLB set of `ea` (`tlbie`).
    pub fn invalidate_tlb_entry(&mut self, ea: Address) {
        self.cpu.tlb.invalidate(ea);
        self.code_changes.push(CodeChange::All);
    }

    /// Translates an effective address. Instruction fetches (`XCheck::Opcode`) go through the
    /// instruction BATs, everything else through the data BATs. The page table is only walked
    /// when MMU emulation is enabled. Translation is assumed to be enabled: callers check
    /// MSR\[IR\]/MSR\[DR\].
    pub fn translate(&mut self, ea: Address, flag: XCheck) -> Translation {
        let bats = if flag == XCheck::Opcode {
            &self.mmu.ibat
        } else {
            &self.mmu.dbat
        };

        if let Some((addr, wi)) = bats.translate(ea) {
            return Translation::Bat { addr, wi };
        }

        if !self.config.mmu {
            return Translation::PageFault;
        }

        self.translate_page(ea, flag)
    }

    /// Translates a data address, honoring MSR\[DR\].
    pub fn translate_data(&mut self, ea: Address, flag: XCheck) -> Translation {
        if self.cpu.msr.data_addr_translation() {
            self.translate(ea, flag)
        } else {
            Translation::Real { addr: ea }
        }
    }

    /// Translates an instruction address, honoring MSR\[IR\].
    pub fn translate_instr(&mut self, ea: Address) -> Translation {
        if self.cpu.msr.instr_addr_translation() {
            self.translate(ea, XCheck::Opcode)
        } else {
            Translation::Real { addr: ea }
        }
    }

    /// Translates an effective address through the TLB and the page table.
    fn translate_page(&mut self, ea: Address, flag: XCheck) -> Translation {
        let lookup = self.cpu.tlb.lookup(ea, flag);
        if let TlbLookup::Found { addr, wi } = lookup {
            return Translation::Page { addr, wi };
        }

        let sr = self.cpu.sr[(ea.value() >> 28) as usize];
        if sr & SR_DIRECT_STORE != 0 {
            return Translation::DirectStore;
        }

        if flag == XCheck::Opcode && sr & SR_NO_EXECUTE != 0 {
            return Translation::PageFault;
        }

        let vsid = sr & 0x00FF_FFFF;
        let page_index = (ea.value() >> 12) & 0xFFFF;
        let api = (ea.value() >> 22) & 0x3F;

        let mut hash = vsid ^ page_index;
        let mut pte1 = Pte1::from_bits((vsid << 7) | api | (1 << 31));

        for secondary in [false, true] {
            if secondary {
                hash = !hash;
                pte1.set_hash(true);
            }

            let pteg = ((hash & self.cpu.pagetable_hashmask) << 6) | self.cpu.pagetable_base;
            for i in 0..8 {
                let pte_addr = Address(pteg + i * 8);
                if self.read_pte(pte_addr) != pte1.to_bits() {
                    continue;
                }

                let mut pte2 = Pte2::from_bits(self.read_pte(pte_addr + 4));
                match flag {
                    XCheck::NoException => (),
                    XCheck::Read | XCheck::Opcode => pte2.set_referenced(true),
                    XCheck::Write => {
                        pte2.set_referenced(true);
                        pte2.set_changed(true);
                    }
                }

                if flag != XCheck::NoException {
                    self.write_pte(pte_addr + 4, pte2.to_bits());
                }

                // the TLB entry was already updated when only the C bit was missing
                if !matches!(lookup, TlbLookup::UpdateC { .. }) {
                    self.cpu.tlb.update(ea, pte2, flag);
                }

                let addr = Address((pte2.rpn().value() << 12) | ea.page_offset());
                return Translation::Page {
                    addr,
                    wi: pte2.wi(),
                };
            }
        }

        Translation::PageFault
    }

    fn read_pte(&mut self, addr: Address) -> u32 {
        let mut buf = [0; 4];
        self.mem.read(addr, &mut buf);
        u32::from_be_bytes(buf)
    }

    fn write_pte(&mut self, addr: Address, value: u32) {
        self.mem.write(addr, &value.to_be_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::system::test::{map_page, system, system_with};

    #[test]
    fn default_bats() {
        let mut sys = system();
        sys.cpu.set_spr(Spr::Dbat0U, 0x8000_1FFF);
        sys.cpu.set_spr(Spr::Dbat0L, 0x0000_0002);
        sys.cpu.set_spr(Spr::Dbat1U, 0xC000_1FFF);
        sys.cpu.set_spr(Spr::Dbat1L, 0x0000_002A);
        sys.dbat_updated();

        assert_eq!(
            sys.translate(Address(0x8012_3456), XCheck::Read),
            Translation::Bat {
                addr: Address(0x0012_3456),
                wi: false
            }
        );
        assert_eq!(
            sys.translate(Address(0xC000_0010), XCheck::Write),
            Translation::Bat {
                addr: Address(0x0000_0010),
                wi: true
            }
        );

        // instruction fetches use the IBATs
        assert_eq!(
            sys.translate(Address(0x8000_0000), XCheck::Opcode),
            Translation::PageFault
        );
    }

    #[test]
    fn invalid_bats_are_skipped() {
        let mut sys = system();

        // neither Vs nor Vp
        sys.cpu.set_spr(Spr::Ibat0U, 0x8000_1FFC);
        // BEPI overlapping BL
        sys.cpu.set_spr(Spr::Ibat1U, 0x8002_0007);
        sys.ibat_updated();

        assert!(!sys.mmu.ibat.get(Address(0x8000_0000)).mapped());
        assert!(!sys.mmu.ibat.get(Address(0x8002_0000)).mapped());
        assert_eq!(sys.code_changes, vec![CodeChange::All]);
    }

    #[test]
    fn extra_bats_need_hid4() {
        let mut sys = system_with(|config| config.is_wii = true);
        sys.cpu.set_spr(Spr::Dbat4U, 0x9000_1FFF);
        sys.cpu.set_spr(Spr::Dbat4L, 0x1000_0002);
        sys.dbat_updated();
        assert!(!sys.mmu.dbat.get(Address(0x9000_0000)).mapped());

        sys.cpu.set_spr(Spr::Hid4, 1 << 25);
        sys.dbat_updated();
        assert_eq!(
            sys.mmu.dbat.translate(Address(0x9000_0004)),
            Some((Address(0x1000_0004), false))
        );
    }

    #[test]
    fn page_table_walk() {
        let mut sys = system_with(|config| config.mmu = true);
        let ea = Address(0x0123_4567);
        let pte = map_page(&mut sys, ea, Address(0x0040_0000));

        let translated = sys.translate(ea, XCheck::Read);
        assert_eq!(
            translated,
            Translation::Page {
                addr: Address(0x0040_0567),
                wi: false
            }
        );

        // R set, C not yet
        let pte2 = Pte2::from_bits(sys.read_pte(pte + 4));
        assert!(pte2.referenced());
        assert!(!pte2.changed());
        assert!(matches!(
            sys.cpu.tlb.lookup(ea, XCheck::NoException),
            TlbLookup::Found { .. }
        ));

        // a write sets C through the TLB path
        sys.translate(ea, XCheck::Write);
        let pte2 = Pte2::from_bits(sys.read_pte(pte + 4));
        assert!(pte2.changed());
    }

    #[test]
    fn page_faults() {
        let mut sys = system_with(|config| config.mmu = true);
        assert_eq!(
            sys.translate(Address(0x0123_4567), XCheck::Read),
            Translation::PageFault
        );

        sys.cpu.set_sr(2, SR_DIRECT_STORE);
        assert_eq!(
            sys.translate(Address(0x2000_0000), XCheck::Read),
            Translation::DirectStore
        );

        let ea = Address(0x3000_0000);
        map_page(&mut sys, ea, Address(0x0050_0000));
        sys.cpu.sr[3] |= SR_NO_EXECUTE;
        assert_eq!(sys.translate(ea, XCheck::Opcode), Translation::PageFault);
        assert!(sys.translate(ea, XCheck::Read).success().is_some());
    }

    #[test]
    fn page_table_needs_mmu() {
        let mut sys = system();
        let ea = Address(0x0123_4567);
        map_page(&mut sys, ea, Address(0x0040_0000));
        assert_eq!(sys.translate(ea, XCheck::Read), Translation::PageFault);
    }

    #[test]
    fn no_exception_lookups_have_no_side_effects() {
        let mut sys = system_with(|config| config.mmu = true);
        let ea = Address(0x0123_4567);
        let pte = map_page(&mut sys, ea, Address(0x0040_0000));

        assert!(sys.translate(ea, XCheck::NoException).success().is_some());
        let pte2 = Pte2::from_bits(sys.read_pte(pte + 4));
        assert!(!pte2.referenced());
        assert_eq!(sys.cpu.tlb.lookup(ea, XCheck::Read), TlbLookup::NotFound);
    }
}
