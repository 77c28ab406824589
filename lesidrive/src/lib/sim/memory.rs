//! Host memory behind the simulated adapter. Addresses are byte addresses as
//! they appear on the bus; a word cycle ignores bit 0. Ranges can be unmapped
//! so that bus cycles into them end with NXM.
//!
//! `memory_eager` keeps every word in one vector; `memory_lazy` (the
//! `lazy-ram` feature) allocates pages on the first non-zero write, which
//! suits a sparse 22-bit QBUS space. Both provide `WordStore::new(words)`,
//! `get` and `set`.

use std::ops::Range;

#[cfg(not(feature = "lazy-ram"))]
mod memory_eager;
#[cfg(not(feature = "lazy-ram"))]
use memory_eager::WordStore;

#[cfg(feature = "lazy-ram")]
mod memory_lazy;
#[cfg(feature = "lazy-ram")]
use memory_lazy::WordStore;

pub struct HostMemory {
    size: usize,
    holes: Vec<Range<usize>>,
    words: WordStore,
}

impl HostMemory {
    /// `size` bytes of memory from address 0.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            holes: Vec::new(),
            words: WordStore::new((size + 1) / 2),
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    /// Make the bytes in `range` answer like missing memory. Direct access
    /// through `read_word` and friends still reaches them.
    pub fn unmap(&mut self, range: Range<usize>) {
        if !range.is_empty() {
            self.holes.push(range);
        }
    }

    /// Whether a word cycle at byte address `addr` finds memory.
    pub fn contains_word(&self, addr: usize) -> bool {
        let addr = addr & !1;
        addr + 1 < self.size
            && !self
                .holes
                .iter()
                .any(|hole| hole.start <= addr + 1 && addr < hole.end)
    }

    pub fn read_word(&self, addr: usize) -> u16 {
        self.words.get(addr >> 1)
    }

    pub fn write_word(&mut self, addr: usize, value: u16) {
        self.words.set(addr >> 1, value);
    }

    pub fn read_byte(&self, addr: usize) -> u8 {
        let [lo, hi] = self.read_word(addr).to_le_bytes();
        if addr & 1 == 0 {
            lo
        } else {
            hi
        }
    }

    pub fn write_byte(&mut self, addr: usize, value: u8) {
        let mut bytes = self.read_word(addr).to_le_bytes();
        bytes[addr & 1] = value;
        self.write_word(addr, u16::from_le_bytes(bytes));
    }
}
