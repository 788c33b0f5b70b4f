//! Splitting a fetch address into the fields the cache is indexed by.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::{
    bin::{extract, low_mask, truncate},
    common::Pc,
};

/// width of a word address on the bus
pub const WORD_ADDR_BITS: u32 = 30;
pub const DEFAULT_LG_CACHE_WORDS: u32 = 12;
pub const DEFAULT_LG_LINES: u32 = 9;
/// lines are filled by a single burst, the burst counter is 8 bits wide
pub const MAX_LG_LINE_WORDS: u32 = 8;
pub const MAX_LG_CACHE_WORDS: u32 = 29;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GeometryError {
    #[error("a cache of 2^{0} words leaves no tag bits (at most 2^{} words)", MAX_LG_CACHE_WORDS)]
    TooLarge(u32),
    #[error("2^{lg_lines} lines do not fit in a cache of 2^{lg_cache_words} words")]
    TooManyLines { lg_cache_words: u32, lg_lines: u32 },
    #[error("lines of 2^{0} words exceed the 2^{} word burst limit", MAX_LG_LINE_WORDS)]
    LineTooLong(u32),
}

/// Shape of the direct-mapped cache, both sizes given as powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheGeometry {
    pub lg_cache_words: u32,
    pub lg_lines: u32,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            lg_cache_words: DEFAULT_LG_CACHE_WORDS,
            lg_lines: DEFAULT_LG_LINES,
        }
    }
}

/// Address of a whole line: `pc >> (2 + lg_line_words)`.
///
/// A registered tag lookup is kept in this form, i.e. the stored tag with the
/// line index appended, so that comparing it with the line address of a pc
/// checks tag and index at once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineAddr(u32);

impl LineAddr {
    pub fn into_inner(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LineAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {:#x}", self.0)
    }
}

/// A requested pc decomposed by [`CacheGeometry::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchAddr {
    pub pc: Pc,
    pub tag: u32,
    pub line_index: usize,
    pub word_offset: usize,
}

impl fmt::Display for FetchAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: tag {:#x}, line index {:#x}, word offset {}",
            self.pc, self.tag, self.line_index, self.word_offset
        )
    }
}

impl CacheGeometry {
    pub fn new(lg_cache_words: u32, lg_lines: u32) -> Result<Self, GeometryError> {
        let geometry = Self {
            lg_cache_words,
            lg_lines,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.lg_cache_words > MAX_LG_CACHE_WORDS {
            return Err(GeometryError::TooLarge(self.lg_cache_words));
        }
        if self.lg_lines > self.lg_cache_words {
            return Err(GeometryError::TooManyLines {
                lg_cache_words: self.lg_cache_words,
                lg_lines: self.lg_lines,
            });
        }
        if self.lg_line_words() > MAX_LG_LINE_WORDS {
            return Err(GeometryError::LineTooLong(self.lg_line_words()));
        }
        Ok(())
    }

    pub fn lg_line_words(&self) -> u32 {
        self.lg_cache_words - self.lg_lines
    }
    pub fn words_per_line(&self) -> usize {
        1 << self.lg_line_words()
    }
    pub fn line_count(&self) -> usize {
        1 << self.lg_lines
    }
    pub fn cache_words(&self) -> usize {
        1 << self.lg_cache_words
    }
    pub fn tag_bits(&self) -> u32 {
        WORD_ADDR_BITS - self.lg_cache_words
    }

    pub fn decode(&self, pc: Pc) -> FetchAddr {
        let v = pc.into_inner();
        let pw = self.lg_line_words();
        let cw = self.lg_cache_words;
        FetchAddr {
            pc,
            tag: extract(v, 2 + cw..32),
            line_index: extract(v, 2 + pw..2 + cw) as usize,
            word_offset: extract(v, 2..2 + pw) as usize,
        }
    }

    pub fn line_addr(&self, pc: Pc) -> LineAddr {
        LineAddr(pc.into_inner() >> (2 + self.lg_line_words()))
    }

    /// the line after `line`, wrapping at the top of the address space
    pub fn successor(&self, line: LineAddr) -> LineAddr {
        LineAddr(truncate(
            line.0.wrapping_add(1),
            WORD_ADDR_BITS - self.lg_line_words(),
        ))
    }

    pub fn line_index_of(&self, line: LineAddr) -> usize {
        (line.0 & low_mask(self.lg_lines)) as usize
    }
    pub fn tag_of(&self, line: LineAddr) -> u32 {
        if self.lg_lines >= 32 {
            0
        } else {
            line.0 >> self.lg_lines
        }
    }
    pub fn compose(&self, tag: u32, line_index: usize) -> LineAddr {
        LineAddr((tag << self.lg_lines) | line_index as u32)
    }

    /// word address of the first word of `line`
    pub fn line_base(&self, line: LineAddr) -> u32 {
        line.0 << self.lg_line_words()
    }

    /// position of `pc` in the flat data array
    pub fn data_index(&self, pc: Pc) -> usize {
        extract(pc.into_inner(), 2..2 + self.lg_cache_words) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let g = CacheGeometry::default();
        assert_eq!(8, g.words_per_line());
        assert_eq!(512, g.line_count());
        assert_eq!(4096, g.cache_words());
        assert_eq!(18, g.tag_bits());
        assert!(g.validate().is_ok());
    }
    #[test]
    fn test_reject_geometry() {
        assert_eq!(
            Err(GeometryError::TooManyLines {
                lg_cache_words: 4,
                lg_lines: 5
            }),
            CacheGeometry::new(4, 5)
        );
        assert_eq!(Err(GeometryError::TooLarge(30)), CacheGeometry::new(30, 20));
        assert_eq!(Err(GeometryError::LineTooLong(10)), CacheGeometry::new(12, 2));
        assert!(CacheGeometry::new(4, 4).is_ok());
        assert!(CacheGeometry::new(8, 0).is_ok());
    }
    #[test]
    fn test_decode() {
        let g = CacheGeometry::default();
        let a = g.decode(Pc::new(0x0001_2344));
        assert_eq!(0x4, a.tag);
        assert_eq!(0x11a, a.line_index);
        assert_eq!(1, a.word_offset);
        assert_eq!(0x91a, g.line_addr(Pc::new(0x0001_2344)).into_inner());
        assert_eq!(0x8d1, g.data_index(Pc::new(0x0001_2344)));
        // the low two bits are ignored
        assert_eq!(a.word_offset, g.decode(Pc::new(0x0001_2347)).word_offset);
        let top = g.decode(Pc::new(0xffff_fffc));
        assert_eq!(0x3_ffff, top.tag);
        assert_eq!(0x1ff, top.line_index);
        assert_eq!(7, top.word_offset);
    }
    #[test]
    fn test_line_addr_parts() {
        let g = CacheGeometry::default();
        let line = g.line_addr(Pc::new(0x0001_2344));
        assert_eq!(line, g.compose(g.tag_of(line), g.line_index_of(line)));
        assert_eq!(0x48d0, g.line_base(line));
        assert_eq!(Pc::new(0x0001_2340).word_addr(), g.line_base(line));
    }
    #[test]
    fn test_successor() {
        let g = CacheGeometry::default();
        // crossing the last index moves to the next tag
        let last = g.line_addr(Pc::new(0x3fe0));
        let next = g.successor(last);
        assert_eq!(0, g.line_index_of(next));
        assert_eq!(1, g.tag_of(next));
        assert_eq!(g.line_addr(Pc::new(0x4000)), next);
        // the top of the address space wraps to line 0
        assert_eq!(
            g.line_addr(Pc::new(0)),
            g.successor(g.line_addr(Pc::new(0xffff_ffe0)))
        );
    }
}
