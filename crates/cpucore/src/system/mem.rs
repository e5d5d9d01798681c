//! Physical memory.

use gekko::Address;
use gekko::cache::CacheMemory;

use crate::state::Archive;

/// Usable size of main RAM.
pub const RAM_SIZE: usize = 24 * bytesize::MIB as usize;
/// Size of the main RAM mirror: addresses wrap around at this size.
pub const RAM_MIRROR_SIZE: usize = RAM_SIZE.next_power_of_two();
/// Size of the Wii's extra RAM, mapped at [`EXRAM_BASE`].
pub const EXRAM_SIZE: usize = 64 * bytesize::MIB as usize;
pub const EXRAM_BASE: u32 = 0x1000_0000;
/// Size of the locked L1 cache region, mapped at [`L1_BASE`].
pub const L1_SIZE: usize = 16 * bytesize::KIB as usize;
pub const L1_BASE: u32 = 0xE000_0000;

/// A region of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Ram,
    Exram,
    L1,
}

/// The physical memory of the system.
pub struct Memory {
    ram: Vec<u8>,
    exram: Option<Vec<u8>>,
    l1: Vec<u8>,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("ram", &self.ram.len())
            .field("exram", &self.exram.as_ref().map(Vec::len))
            .field("l1", &self.l1.len())
            .finish()
    }
}

impl Memory {
    pub fn new(is_wii: bool) -> Self {
        Self {
            ram: vec![0; RAM_MIRROR_SIZE],
            exram: is_wii.then(|| vec![0; EXRAM_SIZE]),
            l1: vec![0; L1_SIZE],
        }
    }

    #[inline(always)]
    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    #[inline(always)]
    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// The region `addr` belongs to and its offset inside it.
    pub fn locate(&self, addr: Address) -> Option<(Region, usize)> {
        let addr = addr.value();
        if addr >> 28 == 0xE && addr < L1_BASE + L1_SIZE as u32 {
            return Some((Region::L1, (addr & 0x0FFF_FFFF) as usize));
        }

        if addr & 0xF800_0000 == 0 {
            return Some((Region::Ram, addr as usize & (RAM_MIRROR_SIZE - 1)));
        }

        let offset = (addr & 0x0FFF_FFFF) as usize;
        if self.exram.is_some() && addr >> 28 == EXRAM_BASE >> 28 && offset < EXRAM_SIZE {
            return Some((Region::Exram, offset));
        }

        None
    }

    /// Whether `addr` is in a region which goes through the data cache.
    #[inline(always)]
    pub fn is_cacheable(&self, addr: Address) -> bool {
        matches!(self.locate(addr), Some((Region::Ram | Region::Exram, _)))
    }

    /// Folds mirrored RAM addresses onto the first mirror, so that caches see a single address
    /// for each byte.
    #[inline(always)]
    pub fn canonical(&self, addr: Address) -> Address {
        if addr.value() & 0xF800_0000 == 0 {
            Address(addr.value() & (RAM_MIRROR_SIZE as u32 - 1))
        } else {
            addr
        }
    }

    fn region(&self, region: Region) -> &[u8] {
        match region {
            Region::Ram => &self.ram,
            Region::Exram => self.exram.as_deref().unwrap_or_default(),
            Region::L1 => &self.l1,
        }
    }

    fn region_mut(&mut self, region: Region) -> &mut [u8] {
        match region {
            Region::Ram => &mut self.ram,
            Region::Exram => self.exram.as_deref_mut().unwrap_or_default(),
            Region::L1 => &mut self.l1,
        }
    }

    /// Reads physical memory into `buf`. Returns whether every byte was backed by memory;
    /// unbacked bytes read as zero.
    pub fn read(&self, addr: Address, buf: &mut [u8]) -> bool {
        if let Some((region, offset)) = self.locate(addr)
            && let Some(src) = self.region(region).get(offset..offset + buf.len())
        {
            buf.copy_from_slice(src);
            return true;
        }

        // crosses a region boundary (or isn't backed at all)
        let mut backed = true;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = match self.locate(addr + i as u32) {
                Some((region, offset)) => self.region(region)[offset],
                None => {
                    backed = false;
                    0
                }
            };
        }

        backed
    }

    /// Writes `buf` into physical memory. Returns whether every byte was backed by memory.
    pub fn write(&mut self, addr: Address, buf: &[u8]) -> bool {
        if let Some((region, offset)) = self.locate(addr)
            && let Some(dst) = self.region_mut(region).get_mut(offset..offset + buf.len())
        {
            dst.copy_from_slice(buf);
            return true;
        }

        let mut backed = true;
        for (i, byte) in buf.iter().enumerate() {
            match self.locate(addr + i as u32) {
                Some((region, offset)) => self.region_mut(region)[offset] = *byte,
                None => backed = false,
            }
        }

        backed
    }

    pub fn do_state(&mut self, ar: &mut Archive) {
        ar.bytes(&mut self.ram);
        if let Some(exram) = &mut self.exram {
            ar.bytes(exram);
        }
        ar.bytes(&mut self.l1);
    }
}

impl CacheMemory for Memory {
    fn copy_from(&mut self, addr: Address, buf: &mut [u8]) {
        if !self.read(addr, buf) {
            tracing::error!(addr = ?addr, len = buf.len(), "unable to resolve read address");
        }
    }

    fn copy_to(&mut self, addr: Address, buf: &[u8]) {
        if !self.write(addr, buf) {
            tracing::error!(addr = ?addr, len = buf.len(), "unable to resolve write address");
        }
    }
}
