use std::fmt;

use crate::addr::{CacheGeometry, FetchAddr, LineAddr};

/// One bit per line, packed. The only place validity is kept.
#[derive(Debug, Clone)]
pub struct ValidBitmap {
    bits: Vec<u64>,
    len: usize,
}

impl ValidBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; (len + 63) / 64],
            len,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        (self.bits[index / 64] >> (index % 64)) & 1 != 0
    }
    pub fn set(&mut self, index: usize, valid: bool) {
        debug_assert!(index < self.len);
        let mask = 1 << (index % 64);
        if valid {
            self.bits[index / 64] |= mask;
        } else {
            self.bits[index / 64] &= !mask;
        }
    }
    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A write to the store. The controller collects at most one of these per
/// edge and applies it after every other register has been computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    Reserve { line: LineAddr },
    Fill { line: LineAddr, words: Vec<u32> },
    InvalidateAll,
}

pub struct CacheStore {
    geometry: CacheGeometry,
    data: Vec<u32>,
    tags: Vec<u32>,
    valid: ValidBitmap,
}

/// Borrowed view of a single line, for inspection.
pub struct CacheLine<'a> {
    pub index: usize,
    pub tag: u32,
    pub valid: bool,
    pub words: &'a [u32],
}

impl fmt::Display for CacheLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {:#x}: tag {:#x} ({})",
            self.index,
            self.tag,
            if self.valid { "valid" } else { "invalid" }
        )?;
        for (i, w) in self.words.iter().enumerate() {
            if i % 4 == 0 {
                writeln!(f)?;
                write!(f, " ")?;
            }
            write!(f, " {w:08x}")?;
        }
        Ok(())
    }
}

impl CacheStore {
    pub fn new(geometry: CacheGeometry) -> Self {
        Self {
            geometry,
            data: vec![0; geometry.cache_words()],
            tags: vec![0; geometry.line_count()],
            valid: ValidBitmap::new(geometry.line_count()),
        }
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// The word at `addr` if its line is resident.
    pub fn lookup(&self, addr: &FetchAddr) -> Option<u32> {
        let FetchAddr {
            tag,
            line_index,
            word_offset,
            ..
        } = *addr;
        if self.valid.get(line_index) && self.tags[line_index] == tag {
            Some(self.data[(line_index << self.geometry.lg_line_words()) | word_offset])
        } else {
            None
        }
    }

    /// Raw tag read, returned as the line address it names.
    pub fn tag_lookup(&self, line_index: usize) -> LineAddr {
        self.geometry.compose(self.tags[line_index], line_index)
    }
    /// Raw data read, regardless of validity.
    pub fn read_word(&self, data_index: usize) -> u32 {
        self.data[data_index]
    }
    pub fn is_valid(&self, line_index: usize) -> bool {
        self.valid.get(line_index)
    }
    pub fn valid_lines(&self) -> usize {
        self.valid.count_ones()
    }

    pub fn line(&self, index: usize) -> Option<CacheLine<'_>> {
        if index >= self.geometry.line_count() {
            return None;
        }
        let len = self.geometry.words_per_line();
        Some(CacheLine {
            index,
            tag: self.tags[index],
            valid: self.valid.get(index),
            words: &self.data[index * len..(index + 1) * len],
        })
    }

    /// Claims the slot of `line` for a fill about to start. The slot stays
    /// invalid until [`CacheStore::fill`].
    pub fn reserve(&mut self, line: LineAddr) {
        let index = self.geometry.line_index_of(line);
        self.tags[index] = self.geometry.tag_of(line);
        self.valid.set(index, false);
    }

    pub fn fill(&mut self, line: LineAddr, words: &[u32]) {
        let index = self.geometry.line_index_of(line);
        let len = self.geometry.words_per_line();
        assert_eq!(len, words.len(), "a fill must cover the whole line");
        self.data[index * len..(index + 1) * len].copy_from_slice(words);
        self.tags[index] = self.geometry.tag_of(line);
        self.valid.set(index, true);
    }

    pub fn invalidate_all(&mut self) {
        self.valid.clear_all();
    }

    pub fn apply(&mut self, cmd: CacheCommand) {
        match cmd {
            CacheCommand::Reserve { line } => self.reserve(line),
            CacheCommand::Fill { line, words } => self.fill(line, &words),
            CacheCommand::InvalidateAll => self.invalidate_all(),
        }
    }
}
