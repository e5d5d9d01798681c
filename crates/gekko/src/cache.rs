//! Emulated L1 instruction and data caches.
//!
//! Both caches are 32 KiB, 8-way set associative with 32 byte lines and pseudo-LRU
//! replacement. Lines are tagged with their physical page.

use crate::Address;

/// Size of a cache line, in bytes.
pub const LINE_SIZE: usize = 32;
/// Number of sets.
pub const SETS: usize = 128;
/// Number of ways in each set.
pub const WAYS: usize = 8;

const ALL_WAYS: u32 = (1 << WAYS) - 1;

/// Bits of a set's pseudo-LRU state which are updated when a way is accessed.
const PLRU_MASK: [u32; WAYS] = [11, 11, 19, 19, 37, 37, 69, 69];
/// Values the masked bits take when a way is accessed.
const PLRU_VALUE: [u32; WAYS] = [11, 3, 17, 1, 36, 4, 64, 0];

/// The backing memory of a cache, accessed by physical address.
pub trait CacheMemory {
    /// Fills `buf` with the contents of memory at `addr`.
    fn copy_from(&mut self, addr: Address, buf: &mut [u8]);
    /// Writes `buf` into memory at `addr`.
    fn copy_to(&mut self, addr: Address, buf: &[u8]);
}

/// Way to replace when a set still has invalid ways: the first invalid one.
#[inline(always)]
fn way_from_valid(valid: u32) -> usize {
    (!valid & ALL_WAYS).trailing_zeros() as usize
}

/// Way to replace when every way of a set is valid, following the pseudo-LRU tree.
fn way_from_plru(plru: u32) -> usize {
    let b = |i: u32| (plru >> i) & 1 != 0;
    if b(0) {
        if b(2) {
            if b(6) { 7 } else { 6 }
        } else if b(5) {
            5
        } else {
            4
        }
    } else if b(1) {
        if b(4) { 3 } else { 2 }
    } else if b(3) {
        1
    } else {
        0
    }
}

#[inline(always)]
fn set_of(addr: Address) -> usize {
    ((addr.value() >> 5) & (SETS as u32 - 1)) as usize
}

#[inline(always)]
fn tag_of(addr: Address) -> u32 {
    addr.value() >> 12
}

/// An L1 cache.
#[derive(Clone, PartialEq, Eq)]
pub struct Cache {
    /// Line contents, indexed by `set * WAYS + way`.
    pub data: Vec<[u8; LINE_SIZE]>,
    /// Pseudo-LRU state of each set.
    pub plru: [u32; SETS],
    /// Valid bit of each way, per set.
    pub valid: [u32; SETS],
    /// Tag (physical page) of each way.
    pub addrs: [[u32; WAYS]; SETS],
    /// Modified bit of each way, per set.
    pub modified: [u32; SETS],
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            data: vec![[0; LINE_SIZE]; SETS * WAYS],
            plru: [0; SETS],
            valid: [0; SETS],
            addrs: [[0; WAYS]; SETS],
            modified: [0; SETS],
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: u32 = self.valid.iter().map(|v| v.count_ones()).sum();
        let dirty: u32 = self.modified.iter().map(|v| v.count_ones()).sum();
        f.debug_struct("Cache")
            .field("valid_lines", &lines)
            .field("modified_lines", &dirty)
            .finish()
    }
}

impl Cache {
    /// Invalidates every line, without writing anything back.
    pub fn reset(&mut self) {
        self.plru = [0; SETS];
        self.valid = [0; SETS];
        self.addrs = [[0; WAYS]; SETS];
        self.modified = [0; SETS];
    }

    /// Way of `set` which holds page `tag`, if any.
    #[inline(always)]
    fn find(&self, set: usize, tag: u32) -> Option<usize> {
        (0..WAYS).find(|&way| self.valid[set] & (1 << way) != 0 && self.addrs[set][way] == tag)
    }

    #[inline(always)]
    fn line_addr(&self, set: usize, way: usize) -> Address {
        Address((self.addrs[set][way] << 12) | ((set as u32) << 5))
    }

    fn write_back(&mut self, memory: &mut impl CacheMemory, set: usize, way: usize) {
        let addr = self.line_addr(set, way);
        memory.copy_to(addr, &self.data[set * WAYS + way]);
        self.modified[set] &= !(1 << way);
    }

    /// Whether the line containing `addr` is in the cache.
    pub fn contains(&self, addr: Address) -> bool {
        self.find(set_of(addr), tag_of(addr)).is_some()
    }

    /// Writes back every modified line and then invalidates the whole cache.
    pub fn flush_all(&mut self, memory: &mut impl CacheMemory) {
        for set in 0..SETS {
            for way in 0..WAYS {
                let bit = 1 << way;
                if self.valid[set] & self.modified[set] & bit != 0 {
                    self.write_back(memory, set, way);
                }
            }
        }

        self.reset();
    }

    /// Writes the line containing `addr` back to memory if it is modified, keeping it valid
    /// (`dcbst`).
    pub fn store(&mut self, memory: &mut impl CacheMemory, addr: Address) {
        let set = set_of(addr);
        let Some(way) = self.find(set, tag_of(addr)) else {
            return;
        };

        if self.modified[set] & (1 << way) != 0 {
            self.write_back(memory, set, way);
        }
    }

    /// Drops the line containing `addr` without writing it back (`dcbi`).
    pub fn invalidate(&mut self, addr: Address) {
        let set = set_of(addr);
        let Some(way) = self.find(set, tag_of(addr)) else {
            return;
        };

        self.valid[set] &= !(1 << way);
        self.modified[set] &= !(1 << way);
    }

    /// Writes the line containing `addr` back to memory if it is modified and then drops it
    /// (`dcbf`).
    pub fn flush(&mut self, memory: &mut impl CacheMemory, addr: Address) {
        let set = set_of(addr);
        let Some(way) = self.find(set, tag_of(addr)) else {
            return;
        };

        if self.modified[set] & (1 << way) != 0 {
            self.write_back(memory, set, way);
        }

        self.valid[set] &= !(1 << way);
    }

    /// Invalidates every way of the set `addr` maps to.
    pub fn invalidate_set(&mut self, addr: Address) {
        let set = set_of(addr);
        self.valid[set] = 0;
        self.modified[set] = 0;
    }

    /// Returns the way holding the line of `addr`, loading it from memory if it is not cached.
    /// When `locked`, missing lines are not loaded and `None` is returned.
    fn line(&mut self, memory: &mut impl CacheMemory, addr: Address, locked: bool) -> Option<(usize, usize)> {
        let set = set_of(addr);
        let tag = tag_of(addr);

        let way = match self.find(set, tag) {
            Some(way) => way,
            None if locked => return None,
            None => {
                let way = if self.valid[set] != ALL_WAYS {
                    way_from_valid(self.valid[set])
                } else {
                    way_from_plru(self.plru[set])
                };

                if self.valid[set] & self.modified[set] & (1 << way) != 0 {
                    self.write_back(memory, set, way);
                }

                memory.copy_from(addr.align_down(LINE_SIZE as u32), &mut self.data[set * WAYS + way]);
                self.addrs[set][way] = tag;
                self.valid[set] |= 1 << way;
                self.modified[set] &= !(1 << way);

                way
            }
        };

        self.plru[set] = (self.plru[set] & !PLRU_MASK[way]) | PLRU_VALUE[way];
        Some((set, way))
    }

    /// Brings the line containing `addr` into the cache (`dcbt`, `dcbtst`).
    pub fn touch(&mut self, memory: &mut impl CacheMemory, addr: Address) {
        self.line(memory, addr, false);
    }

    /// Reads `buf.len()` bytes at `addr` through the cache. Accesses may cross lines. When
    /// `locked`, missing lines are read straight from memory.
    pub fn read(&mut self, memory: &mut impl CacheMemory, addr: Address, buf: &mut [u8], locked: bool) {
        let mut done = 0;
        while done < buf.len() {
            let current = addr + done as u32;
            let offset = (current.value() as usize) % LINE_SIZE;
            let len = (LINE_SIZE - offset).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];

            match self.line(memory, current, locked) {
                Some((set, way)) => {
                    chunk.copy_from_slice(&self.data[set * WAYS + way][offset..offset + len])
                }
                None => memory.copy_from(current, chunk),
            }

            done += len;
        }
    }

    /// Writes `buf` at `addr` through the cache, marking the touched lines as modified. When
    /// `locked`, missing lines are written straight to memory.
    pub fn write(&mut self, memory: &mut impl CacheMemory, addr: Address, buf: &[u8], locked: bool) {
        let mut done = 0;
        while done < buf.len() {
            let current = addr + done as u32;
            let offset = (current.value() as usize) % LINE_SIZE;
            let len = (LINE_SIZE - offset).min(buf.len() - done);
            let chunk = &buf[done..done + len];

            match self.line(memory, current, locked) {
                Some((set, way)) => {
                    self.data[set * WAYS + way][offset..offset + len].copy_from_slice(chunk);
                    self.modified[set] |= 1 << way;
                }
                None => memory.copy_to(current, chunk),
            }

            done += len;
        }
    }

    /// Allocates the line containing `addr` and fills it with zeros (`dcbz`).
    pub fn zero_line(&mut self, memory: &mut impl CacheMemory, addr: Address) {
        self.write(memory, addr.align_down(LINE_SIZE as u32), &[0; LINE_SIZE], false);
    }
}

/// The instruction cache: a [`Cache`] which is bypassed while HID0\[ICE\] is clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionCache {
    pub cache: Cache,
}

impl InstructionCache {
    /// Fetches the instruction word at physical address `addr`.
    pub fn fetch(&mut self, memory: &mut impl CacheMemory, addr: Address, enabled: bool, locked: bool) -> u32 {
        let mut buf = [0; 4];
        if enabled {
            self.cache.read(memory, addr, &mut buf, locked);
        } else {
            memory.copy_from(addr, &mut buf);
        }

        u32::from_be_bytes(buf)
    }

    /// Invalidates the set `addr` maps to, as done by `icbi`. Returns whether anything
    /// happened, which is only the case while the cache is enabled.
    pub fn invalidate(&mut self, addr: Address, enabled: bool) -> bool {
        if !enabled {
            return false;
        }

        self.cache.invalidate_set(addr);
        true
    }

    pub fn reset(&mut self) {
        self.cache.reset();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Ram(Vec<u8>);

    impl CacheMemory for Ram {
        fn copy_from(&mut self, addr: Address, buf: &mut [u8]) {
            let start = addr.value() as usize;
            buf.copy_from_slice(&self.0[start..start + buf.len()]);
        }

        fn copy_to(&mut self, addr: Address, buf: &[u8]) {
            let start = addr.value() as usize;
            self.0[start..start + buf.len()].copy_from_slice(buf);
        }
    }

    fn ram() -> Ram {
        Ram((0..0x10_0000).map(|i| i as u8).collect())
    }

    #[test]
    fn plru_tree() {
        assert_eq!(way_from_plru(0), 0);
        assert_eq!(way_from_plru(0b1000), 1);
        assert_eq!(way_from_plru(0b10), 2);
        assert_eq!(way_from_plru(0b1_0010), 3);
        assert_eq!(way_from_plru(0b1), 4);
        assert_eq!(way_from_plru(0b10_0001), 5);
        assert_eq!(way_from_plru(0b101), 6);
        assert_eq!(way_from_plru(0b100_0101), 7);
    }

    #[test]
    fn first_invalid_way() {
        assert_eq!(way_from_valid(0), 0);
        assert_eq!(way_from_valid(0b0000_0111), 3);
        assert_eq!(way_from_valid(0b0111_1111), 7);
    }

    #[test]
    fn accessing_a_way_steers_plru_away_from_it() {
        // starting from a clear state, the tree must never pick the way just touched
        for way in 0..WAYS {
            assert_ne!(way_from_plru(PLRU_VALUE[way]), way);
        }
    }

    #[test]
    fn writes_stay_in_cache_until_stored() {
        let mut mem = ram();
        let mut cache = Cache::default();
        let addr = Address(0x1000);

        cache.write(&mut mem, addr, &[0xAA, 0xBB], false);
        assert_eq!(mem.0[0x1000], 0x00);

        let mut buf = [0; 2];
        cache.read(&mut mem, addr, &mut buf, false);
        assert_eq!(buf, [0xAA, 0xBB]);

        cache.store(&mut mem, addr);
        assert_eq!(&mem.0[0x1000..0x1002], &[0xAA, 0xBB]);
        assert!(cache.contains(addr));
    }

    #[test]
    fn invalidate_discards_and_flush_writes_back() {
        let mut mem = ram();
        let mut cache = Cache::default();

        cache.write(&mut mem, Address(0x2000), &[0x11], false);
        cache.invalidate(Address(0x2000));
        assert!(!cache.contains(Address(0x2000)));
        assert_eq!(mem.0[0x2000], 0x00);

        cache.write(&mut mem, Address(0x3000), &[0x22], false);
        cache.flush(&mut mem, Address(0x3000));
        assert!(!cache.contains(Address(0x3000)));
        assert_eq!(mem.0[0x3000], 0x22);
    }

    #[test]
    fn eviction_writes_back_modified_lines() {
        let mut mem = ram();
        let mut cache = Cache::default();

        // nine different pages mapping to set 0
        for page in 0..9u32 {
            cache.write(&mut mem, Address(page << 12), &[0xF0 | page as u8], false);
        }

        let evicted = (0..9u32)
            .filter(|page| !cache.contains(Address(page << 12)))
            .collect::<Vec<_>>();
        assert_eq!(evicted.len(), 1);

        let page = evicted[0] as usize;
        assert_eq!(mem.0[page << 12], 0xF0 | page as u8);
    }

    #[test]
    fn flush_all_writes_everything_back() {
        let mut mem = ram();
        let mut cache = Cache::default();

        cache.write(&mut mem, Address(0x101E), &[1, 2, 3, 4], false);
        cache.flush_all(&mut mem);
        assert_eq!(&mem.0[0x101E..0x1022], &[1, 2, 3, 4]);
        assert_eq!(cache.valid, [0; SETS]);
    }

    #[test]
    fn zero_line() {
        let mut mem = ram();
        let mut cache = Cache::default();

        cache.zero_line(&mut mem, Address(0x4010));
        let mut buf = [0xFF; LINE_SIZE];
        cache.read(&mut mem, Address(0x4000), &mut buf, false);
        assert_eq!(buf, [0; LINE_SIZE]);
        assert_ne!(mem.0[0x4001], 0);
    }

    #[test]
    fn icache_is_bypassed_while_disabled() {
        let mut mem = ram();
        let mut icache = InstructionCache::default();

        assert_eq!(icache.fetch(&mut mem, Address(0x100), false, false), 0x0001_0203);
        assert!(!icache.cache.contains(Address(0x100)));

        icache.fetch(&mut mem, Address(0x100), true, false);
        assert!(icache.cache.contains(Address(0x100)));

        // stale until invalidated
        mem.0[0x100] = 0xFF;
        assert_eq!(icache.fetch(&mut mem, Address(0x100), true, false), 0x0001_0203);
        assert!(!icache.invalidate(Address(0x100), false));
        assert!(icache.invalidate(Address(0x100), true));
        assert_eq!(icache.fetch(&mut mem, Address(0x100), true, false), 0xFF01_0203);
    }
}
