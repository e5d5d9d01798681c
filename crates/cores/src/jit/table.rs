/// A fixed size, boxed table of optional entries.
#[derive(Debug, Clone)]
pub struct Table<T, const LEN: usize> {
    entries: Box<[Option<T>]>,
}

impl<T, const LEN: usize> Default for Table<T, LEN> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const LEN: usize> Table<T, LEN> {
    pub fn new() -> Self {
        Self {
            entries: std::iter::repeat_with(|| None).take(LEN).collect(),
        }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)?.as_ref()
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index)?.as_mut()
    }

    /// Inserts `value` at `index`, which must be less than `LEN`.
    #[inline(always)]
    pub fn insert(&mut self, index: usize, value: T) -> &mut T {
        self.entries[index].insert(value)
    }

    #[inline(always)]
    pub fn remove(&mut self, index: usize) -> Option<T> {
        self.entries.get_mut(index)?.take()
    }

    /// The entry at `index`, which must be less than `LEN`, inserting a default one if empty.
    #[inline(always)]
    pub fn get_or_default(&mut self, index: usize) -> &mut T
    where
        T: Default,
    {
        self.entries[index].get_or_insert_with(T::default)
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.entries.fill_with(|| None);
    }
}
