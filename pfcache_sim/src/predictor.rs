//! Pipeline registers that let a result be produced in the cycle after it was
//! requested.
//!
//! Two lookups run side by side every cycle: one for the pc being requested
//! right now, one for the pc requested last time. When the consumer moves on,
//! the first becomes the answer; while it waits, the second keeps being
//! re-evaluated against a line that may have just been filled. A third lookup
//! for the line after the last pc lets a sequential stream walk into the
//! next line without waiting for its tag to be read.

use crate::{
    addr::LineAddr,
    cache_store::CacheStore,
    common::Pc,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    FromPc,
    #[default]
    FromLast,
}

impl Source {
    fn select(advance: bool) -> Self {
        if advance {
            Self::FromPc
        } else {
            Self::FromLast
        }
    }
}

/// Signals of the current cycle the predictor's next state depends on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Steering {
    pub advance: bool,
    pub invalidate: bool,
    /// `last_pc` hits against the selected tag lookup
    pub last_hit: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PredictionState {
    pub last_pc: Pc,
    pub result_pc: Pc,
    pub pc_lookup: LineAddr,
    pub last_lookup: LineAddr,
    pub next_lookup: LineAddr,
    pub pc_word: u32,
    pub last_word: u32,
    pub data_source: Source,
    pub valid_source: Source,
    pub valid_from_pc: bool,
    pub valid_from_last: bool,
}

impl PredictionState {
    /// Tag lookup matching the word currently selected for output.
    pub fn tag_lookup(&self) -> LineAddr {
        match self.data_source {
            Source::FromPc => self.pc_lookup,
            Source::FromLast => self.last_lookup,
        }
    }

    pub fn instruction_word(&self) -> u32 {
        match self.data_source {
            Source::FromPc => self.pc_word,
            Source::FromLast => self.last_word,
        }
    }

    /// Registered validity of the word currently on the output.
    pub fn hit(&self) -> bool {
        match self.valid_source {
            Source::FromPc => self.valid_from_pc,
            Source::FromLast => self.valid_from_last,
        }
    }

    /// Whether `last_pc` is resident according to `tag_lookup`, given the
    /// store as it is this cycle.
    pub fn last_hits(&self, store: &CacheStore, tag_lookup: LineAddr) -> bool {
        let g = store.geometry();
        let line = g.line_addr(self.last_pc);
        tag_lookup == line && store.is_valid(g.line_index_of(line))
    }

    /// Registers latched at the coming edge. `store` must be the store before
    /// this edge's commit.
    pub fn next(&self, store: &CacheStore, requested: Pc, s: &Steering) -> Self {
        let g = store.geometry();
        let (last_pc, result_pc) = if s.advance {
            (requested, requested)
        } else {
            (self.last_pc, self.result_pc)
        };
        let requested_line = g.line_addr(requested);
        let requested_index = g.line_index_of(requested_line);
        let valid_from_pc = !s.invalidate
            && store.is_valid(requested_index)
            && (requested_line == self.tag_lookup() || requested_line == self.next_lookup);
        let source = Source::select(s.advance);
        let next_line = g.successor(g.line_addr(last_pc));
        Self {
            last_pc,
            result_pc,
            pc_lookup: store.tag_lookup(requested_index),
            last_lookup: store.tag_lookup(g.line_index_of(g.line_addr(self.last_pc))),
            next_lookup: store.tag_lookup(g.line_index_of(next_line)),
            pc_word: store.read_word(g.data_index(requested)),
            last_word: store.read_word(g.data_index(self.last_pc)),
            data_source: source,
            valid_source: if s.invalidate {
                Source::FromLast
            } else {
                source
            },
            valid_from_pc,
            valid_from_last: !s.invalidate && s.last_hit,
        }
    }
}
