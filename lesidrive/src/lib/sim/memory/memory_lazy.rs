use ahash::AHashMap;

/// 2K words, 4 KiB of bus space.
const PAGE_SHIFT: usize = 11;
const PAGE_WORDS: usize = 1 << PAGE_SHIFT;
const PAGE_MASK: usize = PAGE_WORDS - 1;

/// Pages of words, allocated on the first non-zero write. Untouched words
/// read as zero.
pub struct WordStore {
    len: usize,
    pages: AHashMap<usize, Box<[u16; PAGE_WORDS]>>,
}

impl WordStore {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            pages: AHashMap::new(),
        }
    }

    pub fn get(&self, index: usize) -> u16 {
        assert!(index < self.len, "host memory word {:#X} out of range", index);
        self.pages
            .get(&(index >> PAGE_SHIFT))
            .map_or(0, |page| page[index & PAGE_MASK])
    }

    pub fn set(&mut self, index: usize, value: u16) {
        assert!(index < self.len, "host memory word {:#X} out of range", index);
        let page = index >> PAGE_SHIFT;
        if value == 0 && !self.pages.contains_key(&page) {
            return;
        }
        self.pages
            .entry(page)
            .or_insert_with(|| Box::new([0; PAGE_WORDS]))[index & PAGE_MASK] = value;
    }
}
