//! Bus master that brings a missing line into the cache.
//!
//! The bus is a pipelined request/acknowledge bus: while `cyc` is held the
//! master may issue one request per cycle by raising `stb`, a request is
//! taken when `stall` is low, and the slave answers every taken request with
//! exactly one `ack` (or `err`), in order.

use std::fmt;

use log::{debug, warn};

use crate::addr::{CacheGeometry, LineAddr};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusRequest {
    pub cyc: bool,
    pub stb: bool,
    pub we: bool,
    /// word address
    pub addr: u32,
    pub data: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusResponse {
    pub stall: bool,
    pub ack: bool,
    pub err: bool,
    pub data: u32,
}

impl fmt::Display for BusRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.cyc, self.stb) {
            (false, _) => write!(f, "idle"),
            (true, false) => write!(f, "cyc"),
            (true, true) => write!(f, "cyc stb {:#010x}", self.addr),
        }
    }
}

impl fmt::Display for BusResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stall {
            write!(f, "stall ")?;
        }
        if self.err {
            write!(f, "err")
        } else if self.ack {
            write!(f, "ack {:08x}", self.data)
        } else {
            write!(f, "-")
        }
    }
}

#[derive(Debug, Default)]
pub enum FillState {
    #[default]
    Idle,
    /// issuing the requests of `line`; `words` holds what has been acked so far
    Requesting {
        line: LineAddr,
        issued: usize,
        words: Vec<u32>,
    },
    AwaitingAck {
        line: LineAddr,
        words: Vec<u32>,
    },
    /// the fill was abandoned, waiting for the acks of requests already taken
    Aborting {
        line: LineAddr,
        outstanding: usize,
    },
}

impl FillState {
    pub fn is_idle(&self) -> bool {
        matches!(self, FillState::Idle)
    }

    pub fn line(&self) -> Option<LineAddr> {
        match self {
            FillState::Idle => None,
            FillState::Requesting { line, .. }
            | FillState::AwaitingAck { line, .. }
            | FillState::Aborting { line, .. } => Some(*line),
        }
    }

    /// Whether data acked this cycle belongs to a fill that will be kept.
    pub fn is_filling(&self) -> bool {
        matches!(
            self,
            FillState::Requesting { .. } | FillState::AwaitingAck { .. }
        )
    }
}

impl fmt::Display for FillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillState::Idle => write!(f, "idle"),
            FillState::Requesting {
                line,
                issued,
                words,
            } => write!(
                f,
                "requesting {line}, {issued} issued, {} acked",
                words.len()
            ),
            FillState::AwaitingAck { line, words } => {
                write!(f, "awaiting acks for {line}, {} acked", words.len())
            }
            FillState::Aborting { line, outstanding } => {
                write!(f, "aborting {line}, {outstanding} acks outstanding")
            }
        }
    }
}

/// What the engine did at an edge, for the controller to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillEvent {
    Started { line: LineAddr },
    Completed { line: LineAddr, words: Vec<u32> },
    Failed { line: LineAddr },
    Aborted { line: LineAddr },
}

/// Inputs of one edge as seen by the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct FillContext {
    pub bus: BusResponse,
    pub reset: bool,
    pub clear: bool,
    pub new_pc: bool,
    pub advance: bool,
    pub requested_line: LineAddr,
    /// line of the pc the consumer is waiting on
    pub last_line: LineAddr,
    /// neither lookup hits and the line is not known to fault
    pub miss: bool,
}

impl FillContext {
    fn invalidate(&self) -> bool {
        self.reset || self.clear
    }
    fn abandons(&self, line: LineAddr) -> bool {
        self.clear || (self.new_pc && self.requested_line != line)
    }
}

pub const SETTLE_CYCLES: u8 = 3;

#[derive(Debug)]
pub struct FillEngine {
    state: FillState,
    /// cycles left before a miss may start a fill
    settle: u8,
    load_needed: bool,
}

impl Default for FillEngine {
    fn default() -> Self {
        Self {
            state: FillState::Idle,
            settle: SETTLE_CYCLES,
            load_needed: false,
        }
    }
}

fn abort(line: LineAddr, outstanding: usize) -> (FillState, Option<FillEvent>) {
    debug!("abandon fill of {line}, {outstanding} acks outstanding");
    let state = if outstanding == 0 {
        FillState::Idle
    } else {
        FillState::Aborting { line, outstanding }
    };
    (state, Some(FillEvent::Aborted { line }))
}

impl FillState {
    fn transition(self, words_per_line: usize, ctx: &FillContext) -> (Self, Option<FillEvent>) {
        let bus = ctx.bus;
        match self {
            FillState::Idle => (FillState::Idle, None),
            FillState::Requesting {
                line,
                issued,
                mut words,
            } => {
                let issued = if bus.stall { issued } else { issued + 1 };
                if ctx.abandons(line) {
                    if bus.err {
                        return (FillState::Idle, Some(FillEvent::Aborted { line }));
                    }
                    let acked = words.len() + bus.ack as usize;
                    return abort(line, issued - acked);
                }
                if bus.err {
                    return (FillState::Idle, Some(FillEvent::Failed { line }));
                }
                if bus.ack {
                    words.push(bus.data);
                }
                if issued == words_per_line {
                    FillState::AwaitingAck { line, words }.complete(words_per_line)
                } else {
                    (
                        FillState::Requesting {
                            line,
                            issued,
                            words,
                        },
                        None,
                    )
                }
            }
            FillState::AwaitingAck { line, mut words } => {
                if ctx.abandons(line) {
                    if bus.err {
                        return (FillState::Idle, Some(FillEvent::Aborted { line }));
                    }
                    let acked = words.len() + bus.ack as usize;
                    return abort(line, words_per_line - acked);
                }
                if bus.err {
                    return (FillState::Idle, Some(FillEvent::Failed { line }));
                }
                if bus.ack {
                    words.push(bus.data);
                }
                FillState::AwaitingAck { line, words }.complete(words_per_line)
            }
            FillState::Aborting { line, outstanding } => {
                let outstanding = outstanding.saturating_sub(bus.ack as usize);
                if bus.err || outstanding == 0 {
                    (FillState::Idle, None)
                } else {
                    (FillState::Aborting { line, outstanding }, None)
                }
            }
        }
    }

    fn complete(self, words_per_line: usize) -> (Self, Option<FillEvent>) {
        match self {
            FillState::AwaitingAck { line, words } if words.len() == words_per_line => {
                (FillState::Idle, Some(FillEvent::Completed { line, words }))
            }
            s => (s, None),
        }
    }
}

impl FillEngine {
    pub fn state(&self) -> &FillState {
        &self.state
    }
    pub fn is_busy(&self) -> bool {
        !self.state.is_idle()
    }
    pub fn load_needed(&self) -> bool {
        self.load_needed
    }
    pub fn settle(&self) -> u8 {
        self.settle
    }

    /// Bus outputs for the current cycle.
    pub fn request(&self, geometry: &CacheGeometry) -> BusRequest {
        match &self.state {
            FillState::Idle => BusRequest::default(),
            FillState::Requesting { line, issued, .. } => BusRequest {
                cyc: true,
                stb: true,
                addr: geometry.line_base(*line) + *issued as u32,
                ..Default::default()
            },
            FillState::AwaitingAck { .. } | FillState::Aborting { .. } => BusRequest {
                cyc: true,
                ..Default::default()
            },
        }
    }

    /// Clocks one edge.
    pub fn step(self, geometry: &CacheGeometry, ctx: &FillContext) -> (Self, Option<FillEvent>) {
        let Self {
            state,
            settle,
            load_needed,
        } = self;
        let was_busy = !state.is_idle();
        let invalidate = ctx.invalidate();

        let (state, event) = if ctx.reset {
            // reset drops the bus cycle on the spot
            (FillState::Idle, state.line().map(|line| FillEvent::Aborted { line }))
        } else if !was_busy && load_needed && !ctx.new_pc && !invalidate {
            debug!("start fill of {}", ctx.last_line);
            (
                FillState::Requesting {
                    line: ctx.last_line,
                    issued: 0,
                    words: Vec::with_capacity(geometry.words_per_line()),
                },
                Some(FillEvent::Started {
                    line: ctx.last_line,
                }),
            )
        } else {
            state.transition(geometry.words_per_line(), ctx)
        };
        match &event {
            Some(FillEvent::Completed { line, .. }) => debug!("filled {line}"),
            Some(FillEvent::Failed { line }) => warn!("bus error while filling {line}"),
            _ => (),
        }

        let started = matches!(event, Some(FillEvent::Started { .. }));
        let load_needed = !invalidate
            && !ctx.advance
            && !was_busy
            && !started
            && settle == 0
            && ctx.miss;
        let settle = if invalidate || ctx.advance || was_busy {
            SETTLE_CYCLES
        } else {
            settle.saturating_sub(1)
        };
        (
            Self {
                state,
                settle,
                load_needed,
            },
            event,
        )
    }
}
