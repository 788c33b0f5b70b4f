use std::collections::VecDeque;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    addr::WORD_ADDR_BITS,
    bus::{BusRequest, BusResponse},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// 1 MiB
pub const DEFAULT_MEMORY_WORDS: usize = 1 << 18;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryAccessError {
    #[error("word address {addr:#010x} out of range for memory of {len} words")]
    OutOfBounds { addr: u32, len: usize },
    #[error("word address {addr:#010x} lies in a faulting range")]
    Fault { addr: u32 },
}

pub type Result<T> = std::result::Result<T, MemoryAccessError>;

/// Word addressed backing store.
pub struct Memory {
    inner: Vec<u32>,
}

impl Memory {
    pub fn new(words: usize) -> Self {
        Self {
            inner: vec![0; words],
        }
    }
    pub fn from_words(inner: Vec<u32>) -> Self {
        Self { inner }
    }
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, addr: u32) -> Result<u32> {
        self.inner
            .get(addr as usize)
            .copied()
            .ok_or(MemoryAccessError::OutOfBounds {
                addr,
                len: self.len(),
            })
    }

    /// Copies `words` to consecutive addresses from `base`, growing the
    /// memory if the block does not fit. The block must lie within the word
    /// address space of the bus.
    pub fn load(&mut self, base: u32, words: &[u32]) -> Result<()> {
        let end = (base as usize)
            .checked_add(words.len())
            .filter(|&end| end <= 1 << WORD_ADDR_BITS)
            .ok_or(MemoryAccessError::OutOfBounds {
                addr: base,
                len: 1 << WORD_ADDR_BITS,
            })?;
        if end > self.inner.len() {
            self.inner.resize(end, 0);
        }
        self.inner[base as usize..end].copy_from_slice(words);
        Ok(())
    }
}

/// Stall during the first `stalled` cycles of every `period` cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StallPattern {
    pub period: usize,
    pub stalled: usize,
}

impl StallPattern {
    pub fn is_stalled(&self, cycle: usize) -> bool {
        self.period != 0 && cycle % self.period < self.stalled
    }
}

/// Byte address range `start..end` answered with a bus error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultRange {
    pub start: u32,
    pub end: u32,
}

impl FaultRange {
    fn contains_word(&self, addr: u32) -> bool {
        let byte = u64::from(addr) << 2;
        u64::from(self.start) <= byte && byte < u64::from(self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// cycles from a taken request to its ack, at least 1
    pub latency: usize,
    pub stall: Option<StallPattern>,
    pub faults: Vec<FaultRange>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            latency: 1,
            stall: None,
            faults: Vec::new(),
        }
    }
}

/// Read-only bus slave in front of a [`Memory`].
///
/// Requests are taken in order and answered `latency` cycles later, at most
/// one answer per cycle. Dropping `cyc` forgets every request not yet
/// answered.
pub struct WishboneMemory {
    memory: Memory,
    config: BusConfig,
    pending: VecDeque<(usize, Result<u32>)>,
    cycle: usize,
    #[cfg(feature = "stat")]
    stat: stat::BusStat,
}

impl WishboneMemory {
    pub fn new(memory: Memory, config: BusConfig) -> Self {
        Self {
            memory,
            config: BusConfig {
                latency: config.latency.max(1),
                ..config
            },
            pending: VecDeque::new(),
            cycle: 0,
            #[cfg(feature = "stat")]
            stat: Default::default(),
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    fn read(&self, addr: u32) -> Result<u32> {
        if self.config.faults.iter().any(|f| f.contains_word(addr)) {
            return Err(MemoryAccessError::Fault { addr });
        }
        self.memory.get(addr)
    }

    /// Answers the master for the current cycle and advances one cycle.
    pub fn respond(&mut self, req: &BusRequest) -> BusResponse {
        let cycle = self.cycle;
        self.cycle += 1;
        if !req.cyc {
            #[cfg(feature = "stat")]
            {
                self.stat.dropped += self.pending.len();
            }
            self.pending.clear();
            return BusResponse::default();
        }
        let stall = self
            .config
            .stall
            .is_some_and(|p| p.is_stalled(cycle));
        let mut resp = BusResponse {
            stall,
            ..Default::default()
        };
        if self.pending.front().is_some_and(|(due, _)| *due <= cycle) {
            if let Some((_, r)) = self.pending.pop_front() {
                match r {
                    Ok(data) => {
                        resp.ack = true;
                        resp.data = data;
                    }
                    Err(e) => {
                        debug!("bus error: {e}");
                        resp.err = true;
                    }
                }
            }
        }
        if req.stb && !stall {
            let r = self.read(req.addr);
            #[cfg(feature = "stat")]
            self.stat.take(r.is_ok());
            self.pending.push_back((cycle + self.config.latency, r));
        }
        #[cfg(feature = "stat")]
        {
            if req.stb && stall {
                self.stat.stalled += 1;
            }
        }
        resp
    }
}

#[cfg(feature = "stat")]
impl AddStats for WishboneMemory {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::*;

    #[derive(Default, Clone, Copy)]
    pub struct BusStat {
        taken: usize,
        faulted: usize,
        pub stalled: usize,
        pub dropped: usize,
    }

    impl BusStat {
        pub fn take(&mut self, ok: bool) {
            self.taken += 1;
            if !ok {
                self.faulted += 1;
            }
        }
    }

    impl Stat for BusStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ BusStat {
        fn header(&self) -> &'static str {
            "bus slave"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ BusStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let e_pct = percent(self.faulted, self.taken);
            writeln!(f, "  requests taken: {:>10}", self.taken)?;
            writeln!(f, "         faulted: {:>10} ({e_pct:>8}%)", self.faulted)?;
            writeln!(f, "  stalled cycles: {:>10}", self.stalled)?;
            write!(f, "   dropped acks: {:>10}", self.dropped)
        }
    }
}
