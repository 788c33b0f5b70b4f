//! A fetch stage that walks through memory the way a CPU front end would.
//!
//! While waiting for the result at `P` it requests `P + 4`, so that a
//! sequential stream needs no redirect. Taking a jump costs a redirect one
//! cycle after the jump instruction was accepted.

use std::{collections::HashMap, fmt};

use serde::Deserialize;

use crate::{
    common::Pc,
    controller::{Inputs, Outputs},
    sim::RuntimeError,
};

/// The consumer is busy during the first `busy` cycles of every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadyPattern {
    pub period: usize,
    pub busy: usize,
}

impl ReadyPattern {
    fn is_ready(&self, cycle: usize) -> bool {
        self.period == 0 || cycle % self.period >= self.busy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Jump {
    pub from: Pc,
    pub to: Pc,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllegalPolicy {
    /// stop fetching
    #[default]
    Halt,
    /// redirect to a handler
    Jump(Pc),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    pub start_pc: Pc,
    pub ready: Option<ReadyPattern>,
    pub jumps: Vec<Jump>,
    /// stop after the instruction at this pc is retired
    pub halt_at: Option<Pc>,
    pub on_illegal: IllegalPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            start_pc: Pc::new(0),
            ready: None,
            jumps: Vec::new(),
            halt_at: None,
            on_illegal: IllegalPolicy::Halt,
        }
    }
}

/// A result the consumer accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retired {
    Insn { pc: Pc, word: u32 },
    Illegal { pc: Pc },
}

impl Retired {
    pub fn pc(&self) -> Pc {
        match self {
            Retired::Insn { pc, .. } | Retired::Illegal { pc } => *pc,
        }
    }
}

impl fmt::Display for Retired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retired::Insn { pc, word } => write!(f, "pc: {pc},\tinsn: {word:#010x}"),
            Retired::Illegal { pc } => write!(f, "pc: {pc},\tillegal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Reached(Pc),
    Faulted(Pc),
}

pub struct FetchConsumer {
    jumps: HashMap<Pc, Pc>,
    ready: Option<ReadyPattern>,
    halt_at: Option<Pc>,
    on_illegal: IllegalPolicy,
    /// pc of the next result expected
    waiting: Pc,
    redirect: Option<Pc>,
    halted: Option<Halt>,
    cycle: usize,
}

impl FetchConsumer {
    pub fn new(config: &ConsumerConfig) -> Self {
        Self {
            jumps: config.jumps.iter().map(|j| (j.from, j.to)).collect(),
            ready: config.ready,
            halt_at: config.halt_at,
            on_illegal: config.on_illegal,
            waiting: config.start_pc,
            redirect: Some(config.start_pc),
            halted: None,
            cycle: 0,
        }
    }

    pub fn waiting(&self) -> Pc {
        self.waiting
    }
    pub fn halted(&self) -> Option<Halt> {
        self.halted
    }

    /// Redirects the stream at the next cycle.
    pub fn jump(&mut self, pc: Pc) {
        self.redirect = Some(pc);
        self.halted = None;
    }

    /// Inputs for the current cycle given the controller's outputs, and the
    /// result taken in it if any.
    pub fn drive(&mut self, out: &Outputs) -> Result<(Inputs, Option<Retired>), RuntimeError> {
        let ready = self.ready.map_or(true, |p| p.is_ready(self.cycle));
        self.cycle += 1;
        if self.halted.is_some() {
            return Ok((
                Inputs {
                    pc: self.waiting,
                    ..Default::default()
                },
                None,
            ));
        }
        if let Some(target) = self.redirect.take() {
            self.waiting = target;
            return Ok((
                Inputs {
                    new_pc: true,
                    pc: target,
                    ready,
                    ..Default::default()
                },
                None,
            ));
        }
        let inputs = Inputs {
            pc: self.waiting.next(),
            ready,
            ..Default::default()
        };
        if !(out.result_valid && ready) {
            return Ok((inputs, None));
        }
        if out.result_pc != self.waiting {
            return Err(RuntimeError::UnexpectedPc {
                expected: self.waiting,
                found: out.result_pc,
            });
        }
        let pc = self.waiting;
        self.waiting = pc.next();
        let retired = if out.result_illegal {
            match self.on_illegal {
                IllegalPolicy::Halt => self.halted = Some(Halt::Faulted(pc)),
                IllegalPolicy::Jump(handler) => self.redirect = Some(handler),
            }
            Retired::Illegal { pc }
        } else {
            if let Some(&to) = self.jumps.get(&pc) {
                self.redirect = Some(to);
            }
            Retired::Insn {
                pc,
                word: out.instruction_word,
            }
        };
        if self.halted.is_none() && self.halt_at == Some(pc) {
            self.halted = Some(Halt::Reached(pc));
        }
        Ok((inputs, Some(retired)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(pc: u32, word: u32) -> Outputs {
        Outputs {
            result_valid: true,
            instruction_word: word,
            result_pc: Pc::new(pc),
            ..Default::default()
        }
    }

    fn consumer(config: ConsumerConfig) -> FetchConsumer {
        let mut c = FetchConsumer::new(&config);
        let (inputs, _) = c.drive(&Outputs::default()).unwrap();
        assert!(inputs.new_pc);
        assert_eq!(config.start_pc, inputs.pc);
        c
    }

    #[test]
    fn test_sequential_lookahead() {
        let mut c = consumer(ConsumerConfig {
            start_pc: Pc::new(0x100),
            ..Default::default()
        });
        let (inputs, r) = c.drive(&Outputs::default()).unwrap();
        assert_eq!(Pc::new(0x104), inputs.pc);
        assert!(r.is_none());
        let (inputs, r) = c.drive(&offer(0x100, 7)).unwrap();
        assert_eq!(Pc::new(0x104), inputs.pc);
        assert_eq!(
            Some(Retired::Insn {
                pc: Pc::new(0x100),
                word: 7
            }),
            r
        );
        let (inputs, _) = c.drive(&offer(0x104, 8)).unwrap();
        assert_eq!(Pc::new(0x108), inputs.pc);
        assert!(!inputs.new_pc);
    }
    #[test]
    fn test_jump_redirects_next_cycle() {
        let mut c = consumer(ConsumerConfig {
            jumps: vec![Jump {
                from: Pc::new(0x4),
                to: Pc::new(0x80),
            }],
            ..Default::default()
        });
        c.drive(&offer(0, 1)).unwrap();
        let (inputs, _) = c.drive(&offer(4, 2)).unwrap();
        assert!(!inputs.new_pc);
        // the speculative result at 8 is ignored
        let (inputs, r) = c.drive(&offer(8, 3)).unwrap();
        assert!(inputs.new_pc);
        assert_eq!(Pc::new(0x80), inputs.pc);
        assert!(r.is_none());
        assert_eq!(Pc::new(0x80), c.waiting());
    }
    #[test]
    fn test_unexpected_pc() {
        let mut c = consumer(ConsumerConfig::default());
        assert!(matches!(
            c.drive(&offer(0x40, 0)),
            Err(RuntimeError::UnexpectedPc { .. })
        ));
    }
    #[test]
    fn test_illegal_policy() {
        let fault = Outputs {
            result_illegal: true,
            ..offer(0, 0)
        };
        let mut c = consumer(ConsumerConfig::default());
        let (_, r) = c.drive(&fault).unwrap();
        assert_eq!(Some(Retired::Illegal { pc: Pc::new(0) }), r);
        assert_eq!(Some(Halt::Faulted(Pc::new(0))), c.halted());

        let mut c = consumer(ConsumerConfig {
            on_illegal: IllegalPolicy::Jump(Pc::new(0x200)),
            ..Default::default()
        });
        c.drive(&fault).unwrap();
        assert!(c.halted().is_none());
        let (inputs, _) = c.drive(&Outputs::default()).unwrap();
        assert!(inputs.new_pc);
        assert_eq!(Pc::new(0x200), inputs.pc);
    }
    #[test]
    fn test_not_ready_takes_nothing() {
        let mut c = consumer(ConsumerConfig {
            ready: Some(ReadyPattern { period: 2, busy: 1 }),
            ..Default::default()
        });
        // cycle 1 is the second cycle of a period: ready
        let (inputs, r) = c.drive(&offer(0, 1)).unwrap();
        assert!(inputs.ready && r.is_some());
        let (inputs, r) = c.drive(&offer(4, 2)).unwrap();
        assert!(!inputs.ready && r.is_none());
        assert_eq!(Pc::new(4), c.waiting());
    }
    #[test]
    fn test_halt_at() {
        let mut c = consumer(ConsumerConfig {
            halt_at: Some(Pc::new(4)),
            ..Default::default()
        });
        c.drive(&offer(0, 1)).unwrap();
        c.drive(&offer(4, 2)).unwrap();
        assert_eq!(Some(Halt::Reached(Pc::new(4))), c.halted());
        let (inputs, r) = c.drive(&offer(8, 3)).unwrap();
        assert!(!inputs.ready && r.is_none());
    }
}
