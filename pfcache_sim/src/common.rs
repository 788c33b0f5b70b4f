use std::{collections::HashMap, fmt};

use bitmask_enum::bitmask;
use serde::Deserialize;

use crate::breakpoint::BreakPoint;

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
/// byte address of an instruction, displayed the same way everywhere
pub struct Pc(u32);

impl Pc {
    pub const fn new(v: u32) -> Self {
        Self(v)
    }
    /// address of the following instruction, wrapping at the top of the address space
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(4))
    }
    pub fn incr(&mut self) {
        *self = self.next();
    }
    pub const fn into_inner(self) -> u32 {
        self.0
    }
    /// address as seen on the bus
    pub const fn word_addr(self) -> u32 {
        self.0 >> 2
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for Pc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pc({self})")
    }
}

#[derive(Default)]
pub struct RunStep {
    step: Option<usize>,
}

impl RunStep {
    pub fn new(step: Option<usize>) -> Self {
        Self { step }
    }

    pub fn get_step(&self) -> usize {
        self.step.unwrap_or(1)
    }
}

#[derive(Default)]
pub enum ExecuteMode {
    #[default]
    Run,
    /// run until the instruction at `pc` is retired
    SkipUntil {
        pc: Pc,
    },
    /// advance the clock by a number of cycles
    RunStep(RunStep),
}

impl fmt::Display for ExecuteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteMode::Run => write!(f, "running simply"),
            ExecuteMode::SkipUntil { pc } => write!(f, "running until {pc} retires"),
            ExecuteMode::RunStep(r) => {
                write!(f, "stepping the clock by {}", r.get_step())
            }
        }
    }
}

pub struct SimulationOption {
    pub trace: TraceKind,
    pub mode: ExecuteMode,
    pub breakpoints: HashMap<Pc, BreakPoint>,
}

impl Default for SimulationOption {
    fn default() -> Self {
        Self {
            trace: TraceKind::none(),
            mode: ExecuteMode::default(),
            breakpoints: HashMap::new(),
        }
    }
}

#[bitmask(u8)]
pub enum TraceKind {
    // results handed to the consumer
    Fetch,
    // every cycle the bus is active
    Bus,
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Self::Fetch) {
            write!(f, "fetch")?;
            if self.contains(Self::Bus) {
                write!(f, "/bus")?;
            }
        } else if self.contains(Self::Bus) {
            write!(f, "bus")?;
        } else {
            write!(f, "off")?;
        }
        Ok(())
    }
}
