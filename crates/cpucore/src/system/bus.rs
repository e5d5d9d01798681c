//! The memory bus as seen by the CPU: translation, the data cache, memory checks and faults.
//!
//! Guest accesses ([`System::read`], [`System::write`], [`System::fetch`]) raise exceptions when
//! they fail. Host accesses (`host_*`) never do.

use gekko::cache::LINE_SIZE;
use gekko::tlb::XCheck;
use gekko::Address;

use crate::Primitive;
use crate::system::mmu::Translation;
use crate::system::{CodeChange, System};

/// Size of a page, in bytes.
const PAGE_SIZE: u32 = 0x1000;

/// Result of a host read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult<P> {
    /// Whether the address went through MMU translation.
    pub translated: bool,
    pub value: P,
}

/// Result of a host write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Whether the address went through MMU translation.
    pub translated: bool,
}

/// Splits `len` bytes at `ea` at page boundaries, so that each piece is translated once.
fn page_chunks(ea: Address, len: usize) -> impl Iterator<Item = (Address, std::ops::Range<usize>)> {
    let mut done = 0;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }

        let current = ea + done as u32;
        let chunk = ((PAGE_SIZE - current.page_offset()) as usize).min(len - done);
        let range = done..done + chunk;
        done += chunk;

        Some((current, range))
    })
}

impl System {
    #[inline(always)]
    fn dcache_usable(&self, addr: Address, wi: bool) -> bool {
        self.config.enable_dcache && !wi && self.mem.is_cacheable(addr)
    }

    /// Reads physical memory through the data cache, if enabled.
    fn read_data_phys(&mut self, addr: Address, wi: bool, buf: &mut [u8], flag: XCheck) {
        if self.dcache_usable(addr, wi) {
            let locked = self.cpu.hid0().dcache_lock() || flag != XCheck::Read;
            let addr = self.mem.canonical(addr);
            self.cpu.dcache.read(&mut self.mem, addr, buf, locked);
        } else if !self.mem.read(addr, buf) {
            tracing::warn!(pc = ?self.cpu.pc, addr = ?addr, "read from unmapped physical memory");
        }
    }

    /// Writes physical memory through the data cache, if enabled.
    fn write_data_phys(&mut self, addr: Address, wi: bool, buf: &[u8], flag: XCheck) {
        if self.dcache_usable(addr, wi) {
            let locked = self.cpu.hid0().dcache_lock() || flag != XCheck::Write;
            let addr = self.mem.canonical(addr);
            self.cpu.dcache.write(&mut self.mem, addr, buf, locked);
        } else if !self.mem.write(addr, buf) {
            tracing::warn!(pc = ?self.cpu.pc, addr = ?addr, "write to unmapped physical memory");
        }
    }

    /// Translates every page touched by an access of `len` bytes at `ea`. On failure, returns
    /// the address which failed to translate.
    fn translate_access(
        &mut self,
        ea: Address,
        len: usize,
        flag: XCheck,
    ) -> Result<Vec<(Address, bool, std::ops::Range<usize>)>, Address> {
        page_chunks(ea, len)
            .map(|(current, range)| match self.translate_data(current, flag).success() {
                Some((addr, wi)) => Ok((addr, wi, range)),
                None => Err(current),
            })
            .collect()
    }

    /// Reads `buf.len()` bytes at `ea`, raising a DSI if translation fails. Returns whether
    /// the read succeeded.
    fn read_bytes(&mut self, ea: Address, buf: &mut [u8], flag: XCheck) -> bool {
        // fast path: a single page
        if ea.page_offset() as usize + buf.len() <= PAGE_SIZE as usize {
            return match self.translate_data(ea, flag).success() {
                Some((addr, wi)) => {
                    self.read_data_phys(addr, wi, buf, flag);
                    true
                }
                None => {
                    buf.fill(0);
                    !self.data_fault(ea, false, flag)
                }
            };
        }

        match self.translate_access(ea, buf.len(), flag) {
            Ok(chunks) => {
                for (addr, wi, range) in chunks {
                    self.read_data_phys(addr, wi, &mut buf[range], flag);
                }

                true
            }
            Err(failed) => {
                buf.fill(0);
                !self.data_fault(failed, false, flag)
            }
        }
    }

    /// Writes `buf` at `ea`, raising a DSI if translation fails. Returns whether the write
    /// succeeded.
    fn write_bytes(&mut self, ea: Address, buf: &[u8], flag: XCheck) -> bool {
        match self.translate_access(ea, buf.len(), flag) {
            Ok(chunks) => {
                for (addr, wi, range) in chunks {
                    self.write_data_phys(addr, wi, &buf[range], flag);
                }

                true
            }
            Err(failed) => !self.data_fault(failed, true, flag),
        }
    }

    /// Handles a failed data translation. Returns whether an exception was raised.
    fn data_fault(&mut self, ea: Address, write: bool, flag: XCheck) -> bool {
        if flag == XCheck::NoException {
            return false;
        }

        self.raise_dsi(ea, write);
        self.config.mmu
    }

    /// Reads a primitive at the effective address `ea`. Returns `None` if the access raised an
    /// exception (a DSI or a memory check hit), in which case the load must not complete.
    pub fn read<P: Primitive>(&mut self, ea: Address) -> Option<P> {
        let mut buf = [0; 8];
        let bytes = &mut buf[..P::SIZE as usize];
        if !self.read_bytes(ea, bytes, XCheck::Read) {
            return None;
        }

        let value = P::read_be_bytes(bytes);
        if self.check_memchecks(ea, P::SIZE, false, value.to_u64()) {
            return None;
        }

        Some(value)
    }

    /// Writes a primitive at the effective address `ea`. Returns `false` if the access raised
    /// an exception (a DSI or a memory check hit).
    pub fn write<P: Primitive>(&mut self, ea: Address, value: P) -> bool {
        let hit = self.check_memchecks(ea, P::SIZE, true, value.to_u64());

        let mut buf = [0; 8];
        let bytes = &mut buf[..P::SIZE as usize];
        value.write_be_bytes(bytes);

        self.write_bytes(ea, bytes, XCheck::Write) && !hit
    }

    /// Fetches the instruction at the effective address `ea`, raising an ISI if translation
    /// fails.
    pub fn fetch(&mut self, ea: Address) -> Option<u32> {
        let Some((addr, _)) = self.translate_instr(ea).success() else {
            self.raise_isi(ea);
            return None;
        };

        let hid0 = self.cpu.hid0();
        let enabled = hid0.icache_enable() && self.config.icache;
        let addr = self.mem.canonical(addr);

        Some(
            self.cpu
                .icache
                .fetch(&mut self.mem, addr, enabled, hid0.icache_lock()),
        )
    }

    /// Reads a primitive at a physical address, bypassing translation and caches.
    pub fn read_phys<P: Primitive>(&self, addr: Address) -> P {
        let mut buf = [0; 8];
        let bytes = &mut buf[..P::SIZE as usize];
        self.mem.read(addr, bytes);
        P::read_be_bytes(bytes)
    }

    /// Writes a primitive at a physical address, bypassing translation and caches.
    pub fn write_phys<P: Primitive>(&mut self, addr: Address, value: P) {
        let mut buf = [0; 8];
        let bytes = &mut buf[..P::SIZE as usize];
        value.write_be_bytes(bytes);
        self.mem.write(addr, bytes);
    }

    /// Zeroes the data cache line containing `ea` (`dcbz`).
    pub fn dcbz(&mut self, ea: Address) {
        if !self.cpu.hid0().dcache_enable() {
            self.raise_alignment(ea);
            return;
        }

        let ea = ea.align_down(LINE_SIZE as u32);
        let (addr, wi) = match self.translate_data(ea, XCheck::Write) {
            // ignored on direct store segments
            Translation::DirectStore => return,
            Translation::PageFault => {
                self.raise_dsi(ea, true);
                return;
            }
            translation => match translation.success() {
                Some(success) => success,
                None => return,
            },
        };

        if self.check_memchecks(ea, LINE_SIZE as u32, true, 0) {
            return;
        }

        if self.dcache_usable(addr, wi) {
            let addr = self.mem.canonical(addr);
            self.cpu.dcache.zero_line(&mut self.mem, addr);
        } else {
            self.mem.write(addr, &[0; LINE_SIZE]);
        }
    }

    /// Translates the line of a cache management instruction. Direct store segments are
    /// ignored and page faults raise a DSI when `fault` is set.
    fn cache_op_addr(&mut self, ea: Address, flag: XCheck, fault: bool) -> Option<Address> {
        match self.translate_data(ea, flag) {
            Translation::DirectStore => None,
            Translation::PageFault => {
                if fault {
                    self.raise_dsi(ea, flag == XCheck::Write);
                }

                None
            }
            translation => translation
                .success()
                .map(|(addr, _)| self.mem.canonical(addr).align_down(LINE_SIZE as u32)),
        }
    }

    /// Writes back the data cache line containing `ea`, if modified (`dcbst`).
    pub fn dcbst(&mut self, ea: Address) {
        let Some(addr) = self.cache_op_addr(ea, XCheck::Write, true) else {
            return;
        };

        if self.config.enable_dcache {
            self.cpu.dcache.store(&mut self.mem, addr);
        }

        self.code_changes.push(CodeChange::Range {
            start: addr,
            len: LINE_SIZE as u32,
        });
    }

    /// Writes back and invalidates the data cache line containing `ea` (`dcbf`).
    pub fn dcbf(&mut self, ea: Address) {
        let Some(addr) = self.cache_op_addr(ea, XCheck::Write, true) else {
            return;
        };

        if self.config.enable_dcache {
            self.cpu.dcache.flush(&mut self.mem, addr);
        }

        self.code_changes.push(CodeChange::Range {
            start: addr,
            len: LINE_SIZE as u32,
        });
    }

    /// Invalidates the data cache line containing `ea` without writing it back (`dcbi`).
    pub fn dcbi(&mut self, ea: Address) {
        let Some(addr) = self.cache_op_addr(ea, XCheck::Write, true) else {
            return;
        };

        if self.config.enable_dcache {
            self.cpu.dcache.invalidate(addr);
        }

        self.code_changes.push(CodeChange::Range {
            start: addr,
            len: LINE_SIZE as u32,
        });
    }

    /// Brings the data cache line containing `ea` into the cache (`dcbt`, `dcbtst`). Never
    /// faults.
    pub fn dcbt(&mut self, ea: Address) {
        let Some(addr) = self.cache_op_addr(ea, XCheck::NoException, false) else {
            return;
        };

        if self.config.enable_dcache && self.mem.is_cacheable(addr) {
            self.cpu.dcache.touch(&mut self.mem, addr);
        }
    }

    /// Invalidates the instruction cache line containing `ea` (`icbi`).
    pub fn icbi(&mut self, ea: Address) {
        let addr = self.translate_instr(ea).success().map_or(ea, |(addr, _)| addr);
        self.invalidate_icache_line(self.mem.canonical(addr));
    }

    /// Reads a primitive without raising guest exceptions. Returns `None` if the address does
    /// not translate or is not backed by memory.
    pub fn host_try_read<P: Primitive>(&mut self, ea: Address) -> Option<ReadResult<P>> {
        let translated = self.cpu.msr.data_addr_translation();
        let mut buf = [0; 8];
        let bytes = &mut buf[..P::SIZE as usize];

        for (current, range) in page_chunks(ea, bytes.len()) {
            let (addr, wi) = self.translate_data(current, XCheck::NoException).success()?;
            self.mem.locate(addr)?;
            self.read_data_phys(addr, wi, &mut bytes[range], XCheck::NoException);
        }

        Some(ReadResult {
            translated,
            value: P::read_be_bytes(bytes),
        })
    }

    /// Writes a primitive without raising guest exceptions. Returns `None` if the address does
    /// not translate or is not backed by memory.
    pub fn host_try_write<P: Primitive>(&mut self, ea: Address, value: P) -> Option<WriteResult> {
        let translated = self.cpu.msr.data_addr_translation();
        let mut buf = [0; 8];
        let bytes = &mut buf[..P::SIZE as usize];
        value.write_be_bytes(bytes);

        let mut chunks = Vec::with_capacity(2);
        for (current, range) in page_chunks(ea, bytes.len()) {
            let (addr, wi) = self.translate_data(current, XCheck::NoException).success()?;
            self.mem.locate(addr)?;
            chunks.push((addr, wi, range));
        }

        for (addr, wi, range) in chunks {
            self.write_data_phys(addr, wi, &bytes[range], XCheck::NoException);
        }

        // the host may be patching code
        self.code_changes.push(CodeChange::All);
        Some(WriteResult { translated })
    }

    /// Reads a primitive without raising guest exceptions, or the default value on failure.
    pub fn host_read<P: Primitive>(&mut self, ea: Address) -> P {
        self.host_try_read(ea).map(|r| r.value).unwrap_or_default()
    }

    /// Reads `len` bytes. Returns `None` if any of them can't be read.
    pub fn host_read_bytes(&mut self, ea: Address, len: usize) -> Option<Vec<u8>> {
        (0..len)
            .map(|i| self.host_try_read::<u8>(ea + i as u32).map(|r| r.value))
            .collect()
    }

    /// Reads a string of at most `len` bytes, stopping at the first null byte or unreadable
    /// address.
    pub fn host_read_string(&mut self, ea: Address, len: usize) -> String {
        let bytes: Vec<u8> = (0..len)
            .map_while(|i| self.host_try_read::<u8>(ea + i as u32).map(|r| r.value))
            .take_while(|&b| b != 0)
            .collect();

        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Reads a null terminated string. Reading stops at an unreadable address.
    pub fn host_read_cstring(&mut self, ea: Address) -> String {
        self.host_read_string(ea, usize::MAX)
    }

    /// Writes the bytes of `s`, without a terminator. Returns whether every byte was written.
    pub fn host_write_string(&mut self, ea: Address, s: &str) -> bool {
        s.bytes()
            .enumerate()
            .all(|(i, b)| self.host_try_write(ea + i as u32, b).is_some())
    }
}

#[cfg(test)]
mod test {
    use gekko::{Exceptions, Spr};

    use super::*;
    use crate::system::control::CpuState;
    use crate::system::debug::{Access, MemCheck};
    use crate::system::test::{enable_translation, map_page, system, system_with};

    #[test]
    fn real_mode_accesses() {
        let mut sys = system();
        assert!(sys.write(Address(0x100), 0x1234_5678u32));
        assert_eq!(sys.read::<u32>(Address(0x100)), Some(0x1234_5678));
        assert_eq!(sys.read::<u16>(Address(0x102)), Some(0x5678));
        assert_eq!(sys.read::<u8>(Address(0x101)), Some(0x34));
        assert_eq!(sys.read_phys::<u64>(Address(0x100)), 0x1234_5678_0000_0000);
    }

    #[test]
    fn translated_accesses() {
        let mut sys = system();
        enable_translation(&mut sys);

        assert!(sys.write(Address(0x8000_3000), 0xDEAD_BEEFu32));
        assert_eq!(sys.read_phys::<u32>(Address(0x3000)), 0xDEAD_BEEF);
        assert_eq!(sys.read::<u32>(Address(0xC000_3000)), Some(0xDEAD_BEEF));
    }

    #[test]
    fn page_crossing_access() {
        let mut sys = system_with(|config| config.mmu = true);
        enable_translation(&mut sys);
        map_page(&mut sys, Address(0x0000_1000), Address(0x0020_0000));

        // first page is unmapped
        assert_eq!(sys.read::<u32>(Address(0x0000_0FFE)), None);
        assert!(sys.cpu.exceptions.contains(Exceptions::DSI));
        assert_eq!(sys.cpu.spr(Spr::Dar), 0x0000_0FFE);
    }

    #[test]
    fn faults_raise_dsi() {
        let mut sys = system_with(|config| config.mmu = true);
        enable_translation(&mut sys);

        assert_eq!(sys.read::<u32>(Address(0x1234_5678)), None);
        assert!(sys.cpu.exceptions.contains(Exceptions::DSI));
        assert_eq!(sys.cpu.spr(Spr::Dsisr), 0x4000_0000);
        assert_eq!(sys.cpu.spr(Spr::Dar), 0x1234_5678);

        sys.cpu.exceptions = Exceptions::empty();
        assert!(!sys.write(Address(0x1234_5678), 0u32));
        assert_eq!(sys.cpu.spr(Spr::Dsisr), 0x4200_0000);
    }

    #[test]
    fn faults_without_mmu_are_only_logged() {
        let mut sys = system();
        enable_translation(&mut sys);

        assert_eq!(sys.read::<u32>(Address(0x1234_5678)), Some(0));
        assert!(sys.cpu.exceptions.is_empty());
    }

    #[test]
    fn fetch_raises_isi() {
        let mut sys = system();
        enable_translation(&mut sys);

        sys.write_phys(Address(0x3100), 0x6000_0000u32);
        assert_eq!(sys.fetch(Address(0x8000_3100)), Some(0x6000_0000));

        assert_eq!(sys.fetch(Address(0x4000_0000)), None);
        assert!(sys.cpu.exceptions.contains(Exceptions::ISI));
        assert_eq!(sys.cpu.npc, 0x4000_0000);
    }

    #[test]
    fn dcache_write_back() {
        let mut sys = system_with(|config| config.enable_dcache = true);

        assert!(sys.write(Address(0x2000), 0xAABB_CCDDu32));
        assert_eq!(sys.read_phys::<u32>(Address(0x2000)), 0);
        assert_eq!(sys.read::<u32>(Address(0x2000)), Some(0xAABB_CCDD));

        sys.dcbst(Address(0x2010));
        assert_eq!(sys.read_phys::<u32>(Address(0x2000)), 0xAABB_CCDD);
    }

    #[test]
    fn dcbz_needs_dcache() {
        let mut sys = system();
        sys.write_phys(Address(0x2004), 0xFFFF_FFFFu32);

        sys.dcbz(Address(0x2004));
        assert!(sys.cpu.exceptions.contains(Exceptions::ALIGNMENT));
        assert_eq!(sys.cpu.spr(Spr::Dar), 0x2004);

        sys.cpu.exceptions = Exceptions::empty();
        sys.cpu.set_spr(Spr::Hid0, 1 << 14);
        sys.dcbz(Address(0x2004));
        assert!(sys.cpu.exceptions.is_empty());
        assert_eq!(sys.read_phys::<u32>(Address(0x2004)), 0);
    }

    #[test]
    fn host_accesses_never_fault() {
        let mut sys = system_with(|config| config.mmu = true);
        enable_translation(&mut sys);

        assert_eq!(sys.host_try_read::<u32>(Address(0x1234_5678)), None);
        assert!(sys.host_try_write(Address(0x1234_5678), 0u8).is_none());
        assert!(sys.cpu.exceptions.is_empty());

        assert_eq!(
            sys.host_try_write(Address(0x8000_0040), 0x1122u16),
            Some(WriteResult { translated: true })
        );
        assert_eq!(
            sys.host_try_read::<u16>(Address(0x8000_0040)),
            Some(ReadResult {
                translated: true,
                value: 0x1122
            })
        );
    }

    #[test]
    fn host_strings() {
        let mut sys = system();
        assert!(sys.host_write_string(Address(0x500), "gekko"));
        assert_eq!(sys.host_read_cstring(Address(0x500)), "gekko");
        assert_eq!(sys.host_read_string(Address(0x500), 3), "gek");
        assert_eq!(
            sys.host_read_bytes(Address(0x501), 2),
            Some(b"ek".to_vec())
        );
    }

    #[test]
    fn memcheck_break_suppresses_load() {
        let mut sys = system();
        sys.control.set_state(CpuState::Running);
        sys.write_phys(Address(0x600), 0x55u8);
        sys.debug.add_memcheck(MemCheck::new(Address(0x600), Address(0x603), Access::READ));

        assert_eq!(sys.read::<u8>(Address(0x601)), None);
        assert!(
            sys.cpu
                .exceptions
                .contains(Exceptions::DSI | Exceptions::FAKE_MEMCHECK_HIT)
        );
        assert!(sys.control.is_stepping());

        // writes are not watched by this memcheck
        sys.cpu.exceptions = Exceptions::empty();
        sys.control.set_state(CpuState::Running);
        assert!(sys.write(Address(0x600), 1u8));
    }
}
