use std::ops::Range;

use gekko::Address;
use indexmap::IndexSet;
use rustc_hash::FxBuildHasher;

use super::BlockId;
use super::table::Table as BaseTable;

const MAP_TBL_L0_BITS: usize = 12;
const MAP_TBL_L0_COUNT: usize = 1 << MAP_TBL_L0_BITS;
const MAP_TBL_L0_MASK: usize = MAP_TBL_L0_COUNT - 1;
const MAP_TBL_L1_BITS: usize = 8;
const MAP_TBL_L1_COUNT: usize = 1 << MAP_TBL_L1_BITS;
const MAP_TBL_L1_MASK: usize = MAP_TBL_L1_COUNT - 1;
const MAP_TBL_L2_BITS: usize = 10;
const MAP_TBL_L2_COUNT: usize = 1 << MAP_TBL_L2_BITS;
const MAP_TBL_L2_MASK: usize = MAP_TBL_L2_COUNT - 1;

const DEPS_TBL_L0_BITS: usize = 12;
const DEPS_TBL_L0_COUNT: usize = 1 << DEPS_TBL_L0_BITS;
const DEPS_TBL_L0_MASK: usize = DEPS_TBL_L0_COUNT - 1;
const DEPS_TBL_L1_BITS: usize = 8;
const DEPS_TBL_L1_COUNT: usize = 1 << DEPS_TBL_L1_BITS;
const DEPS_TBL_L1_MASK: usize = DEPS_TBL_L1_COUNT - 1;

#[inline(always)]
fn addr_to_mapping_idx(addr: Address) -> (usize, usize, usize) {
    let word = (addr.value() >> 2) as usize;
    (
        (word >> (MAP_TBL_L1_BITS + MAP_TBL_L2_BITS)) & MAP_TBL_L0_MASK,
        (word >> MAP_TBL_L2_BITS) & MAP_TBL_L1_MASK,
        word & MAP_TBL_L2_MASK,
    )
}

#[inline(always)]
fn page_to_deps_idx(page: u32) -> (usize, usize) {
    let page = page as usize;
    (
        (page >> DEPS_TBL_L1_BITS) & DEPS_TBL_L0_MASK,
        page & DEPS_TBL_L1_MASK,
    )
}

/// Maps block start addresses to blocks.
#[derive(Default)]
pub struct Table(
    BaseTable<BaseTable<BaseTable<BlockId, MAP_TBL_L2_COUNT>, MAP_TBL_L1_COUNT>, MAP_TBL_L0_COUNT>,
);

impl Table {
    pub fn insert(&mut self, addr: Address, id: BlockId) {
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let level1 = self.0.get_or_default(idx0);
        let level2 = level1.get_or_default(idx1);
        level2.insert(idx2, id);
    }

    pub fn remove(&mut self, addr: Address) -> Option<BlockId> {
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let level1 = self.0.get_mut(idx0)?;
        let level2 = level1.get_mut(idx1)?;
        level2.remove(idx2)
    }

    pub fn get(&self, addr: Address) -> Option<BlockId> {
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let level1 = self.0.get(idx0)?;
        let level2 = level1.get(idx1)?;
        level2.get(idx2).copied()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

pub type Deps = IndexSet<BlockId, FxBuildHasher>;

/// Tracks which blocks were decoded from each physical page.
#[derive(Default)]
pub struct DepsTable(BaseTable<BaseTable<Deps, DEPS_TBL_L1_COUNT>, DEPS_TBL_L0_COUNT>);

impl DepsTable {
    /// Pages covering `range`, which must not be empty.
    fn pages(range: Range<Address>) -> std::ops::RangeInclusive<u32> {
        range.start.page()..=(range.end.value() - 1) >> 12
    }

    /// Marks block `id` as dependent on the pages that cover the given physical range.
    pub fn mark(&mut self, id: BlockId, range: Range<Address>) {
        for page in Self::pages(range) {
            let (idx0, idx1) = page_to_deps_idx(page);
            let level1 = self.0.get_or_default(idx0);
            level1.get_or_default(idx1).insert(id);
        }
    }

    /// Unmarks block `id` as dependent on the pages that cover the given physical range.
    pub fn unmark(&mut self, id: BlockId, range: Range<Address>) {
        for page in Self::pages(range) {
            let (idx0, idx1) = page_to_deps_idx(page);
            if let Some(deps) = self.0.get_mut(idx0).and_then(|l1| l1.get_mut(idx1)) {
                deps.swap_remove(&id);
            }
        }
    }

    /// The blocks which depend on the page with the given number.
    pub fn get(&self, page: u32) -> Option<&Deps> {
        let (idx0, idx1) = page_to_deps_idx(page);
        self.0.get(idx0)?.get(idx1)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mapping_indices() {
        let addr = Address(0x8000_3100);
        let (idx0, idx1, idx2) = addr_to_mapping_idx(addr);
        let rebuilt = (idx0 << (MAP_TBL_L1_BITS + MAP_TBL_L2_BITS + 2))
            | (idx1 << (MAP_TBL_L2_BITS + 2))
            | (idx2 << 2);
        assert_eq!(rebuilt as u32, addr.value());

        let mut table = Table::default();
        table.insert(addr, BlockId(3));
        assert_eq!(table.get(addr), Some(BlockId(3)));
        assert_eq!(table.get(addr + 4u32), None);
        assert_eq!(table.remove(addr), Some(BlockId(3)));
        assert_eq!(table.get(addr), None);
    }

    #[test]
    fn deps_cover_every_page() {
        let mut deps = DepsTable::default();
        deps.mark(BlockId(1), Address(0x1FF8)..Address(0x2004));
        deps.mark(BlockId(2), Address(0x2000)..Address(0x2000 + 0x1000));

        assert_eq!(deps.get(1).map(|d| d.len()), Some(1));
        assert_eq!(deps.get(2).map(|d| d.len()), Some(2));
        assert!(deps.get(3).is_none_or(|d| d.is_empty()));

        deps.unmark(BlockId(1), Address(0x1FF8)..Address(0x2004));
        assert!(deps.get(1).is_some_and(|d| d.is_empty()));
        assert_eq!(deps.get(2).map(|d| d.len()), Some(1));
    }
}
