//! The prefetch cache controller.
//!
//! Every call to [`Controller::eval`] is one rising clock edge. Outputs of a
//! cycle depend on registers only; the few signals that also depend on the
//! cycle's inputs are relaxed to a fixed point first, then every register
//! computes its next value from the current ones, and the cache store is
//! written last.

use std::mem;

use log::debug;
use thiserror::Error;

use crate::{
    addr::{CacheGeometry, GeometryError, LineAddr},
    bus::{BusRequest, BusResponse, FillContext, FillEngine, FillEvent, FillState},
    cache_store::{CacheCommand, CacheStore},
    common::Pc,
    predictor::{PredictionState, Steering},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// passes allowed for the combinational signals to settle
pub const SETTLE_LIMIT: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControllerError {
    #[error("combinational signals did not converge within {0} passes")]
    NotConverged(usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Inputs {
    pub reset: bool,
    pub new_pc: bool,
    pub clear_cache: bool,
    /// pc requested this cycle
    pub pc: Pc,
    /// the consumer takes the result offered this cycle
    pub ready: bool,
    pub bus: BusResponse,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outputs {
    pub result_valid: bool,
    pub result_illegal: bool,
    pub instruction_word: u32,
    pub result_pc: Pc,
    pub bus: BusRequest,
}

/// A line whose fill ended in a bus error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalRecord {
    pub line: LineAddr,
    /// the fault has been handed to the consumer once
    pub reported: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Comb {
    tag_lookup: LineAddr,
    hit: bool,
    last_hit: bool,
    advance: bool,
    invalidate: bool,
}

pub struct Controller {
    store: CacheStore,
    pred: PredictionState,
    fill: FillEngine,
    illegal: Option<IllegalRecord>,
    illegal_out: bool,
    #[cfg(feature = "stat")]
    stat: stat::ControllerStat,
}

impl Controller {
    pub fn new(geometry: CacheGeometry) -> Result<Self, GeometryError> {
        geometry.validate()?;
        Ok(Self {
            store: CacheStore::new(geometry),
            pred: PredictionState::default(),
            fill: FillEngine::default(),
            illegal: None,
            illegal_out: false,
            #[cfg(feature = "stat")]
            stat: Default::default(),
        })
    }

    pub fn geometry(&self) -> &CacheGeometry {
        self.store.geometry()
    }
    pub fn store(&self) -> &CacheStore {
        &self.store
    }
    pub fn prediction(&self) -> &PredictionState {
        &self.pred
    }
    pub fn fill_state(&self) -> &FillState {
        self.fill.state()
    }
    pub fn illegal_record(&self) -> Option<IllegalRecord> {
        self.illegal
    }

    /// Registered outputs of the current cycle.
    pub fn outputs(&self) -> Outputs {
        Outputs {
            result_valid: self.pred.hit() || self.illegal_out,
            result_illegal: self.illegal_out,
            instruction_word: self.pred.instruction_word(),
            result_pc: self.pred.result_pc,
            bus: self.fill.request(self.store.geometry()),
        }
    }

    fn relax(&self, prev: &Comb, inputs: &Inputs) -> Comb {
        Comb {
            tag_lookup: self.pred.tag_lookup(),
            hit: self.pred.hit(),
            last_hit: self.pred.last_hits(&self.store, prev.tag_lookup),
            advance: inputs.new_pc || (prev.hit && inputs.ready),
            invalidate: inputs.reset || inputs.clear_cache,
        }
    }

    fn settle(&self, inputs: &Inputs) -> Result<Comb, ControllerError> {
        let mut comb = Comb::default();
        for _ in 0..SETTLE_LIMIT {
            let next = self.relax(&comb, inputs);
            if next == comb {
                return Ok(comb);
            }
            comb = next;
        }
        Err(ControllerError::NotConverged(SETTLE_LIMIT))
    }

    fn next_illegal(
        &self,
        inputs: &Inputs,
        comb: &Comb,
        last_line: LineAddr,
        event: Option<&FillEvent>,
    ) -> (Option<IllegalRecord>, bool) {
        let taken = self.illegal_out && inputs.ready;
        let drop_record = comb.invalidate || inputs.new_pc;
        let out = !drop_record
            && !taken
            && self
                .illegal
                .is_some_and(|r| !r.reported && r.line == last_line);
        let mut record = if drop_record { None } else { self.illegal };
        if taken {
            if let Some(r) = record.as_mut() {
                r.reported = true;
            }
        }
        // an error at this very edge outlives the new_pc that came with it
        if let Some(&FillEvent::Failed { line }) = event {
            record = Some(IllegalRecord {
                line,
                reported: false,
            });
        }
        (record, out)
    }

    /// Clocks one edge and returns the outputs of the following cycle.
    pub fn eval(&mut self, inputs: &Inputs) -> Result<Outputs, ControllerError> {
        let geometry = *self.store.geometry();
        let comb = self.settle(inputs)?;
        let requested_line = geometry.line_addr(inputs.pc);
        let last_line = geometry.line_addr(self.pred.last_pc);
        let faulting = self.illegal.is_some_and(|r| r.line == last_line);

        #[cfg(feature = "stat")]
        {
            let out = self.outputs();
            self.stat.observe(&out, inputs, &self.pred, self.fill.state());
        }

        let engine = mem::take(&mut self.fill);
        let (engine, event) = engine.step(
            &geometry,
            &FillContext {
                bus: inputs.bus,
                reset: inputs.reset,
                clear: inputs.clear_cache,
                new_pc: inputs.new_pc,
                advance: comb.advance,
                requested_line,
                last_line,
                miss: !comb.hit && !comb.last_hit && !faulting,
            },
        );
        let pred = self.pred.next(
            &self.store,
            inputs.pc,
            &Steering {
                advance: comb.advance,
                invalidate: comb.invalidate,
                last_hit: comb.last_hit,
            },
        );
        let (illegal, illegal_out) = self.next_illegal(inputs, &comb, last_line, event.as_ref());

        #[cfg(feature = "stat")]
        {
            if let Some(e) = &event {
                self.stat.fill_event(e);
            }
        }

        self.pred = pred;
        self.fill = engine;
        self.illegal = illegal;
        self.illegal_out = illegal_out;
        if comb.invalidate {
            debug!(
                "invalidate {} lines on {}",
                self.store.valid_lines(),
                if inputs.reset { "reset" } else { "clear" }
            );
            self.store.apply(CacheCommand::InvalidateAll);
        }
        let cmd = match event {
            Some(FillEvent::Started { line }) => Some(CacheCommand::Reserve { line }),
            Some(FillEvent::Completed { line, words }) => Some(CacheCommand::Fill { line, words }),
            Some(FillEvent::Failed { .. } | FillEvent::Aborted { .. }) | None => None,
        };
        if let Some(cmd) = cmd {
            self.store.apply(cmd);
        }
        Ok(self.outputs())
    }
}

#[cfg(feature = "stat")]
impl AddStats for Controller {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat.fetch));
        buf.push(Box::new(self.stat.fill.clone()));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use super::*;
    use crate::{predictor::Source, stat::*};

    const FILL_LATENCY_BOUNDS: &[usize] = &[8, 12, 16, 24, 32, 64];

    #[derive(Default)]
    pub struct ControllerStat {
        pub fetch: FetchStat,
        pub fill: FillStat,
        clock: usize,
        fill_started_at: Option<usize>,
    }

    impl ControllerStat {
        pub fn observe(
            &mut self,
            out: &Outputs,
            inputs: &Inputs,
            pred: &PredictionState,
            fill: &FillState,
        ) {
            self.clock += 1;
            let f = &mut self.fetch;
            if inputs.reset || inputs.clear_cache {
                f.invalidations += 1;
            }
            if inputs.new_pc {
                f.redirects += 1;
            } else if out.result_valid && inputs.ready {
                if out.result_illegal {
                    f.illegal += 1;
                } else {
                    match pred.valid_source {
                        Source::FromPc => f.from_pc += 1,
                        Source::FromLast => f.from_last += 1,
                    }
                }
            } else if inputs.ready {
                f.bubbles += 1;
            } else if out.result_valid {
                f.held += 1;
            }
            if out.bus.stb && inputs.bus.stall {
                self.fill.stalled_requests += 1;
            }
            if inputs.bus.ack && fill.is_filling() {
                self.fill.words_received += 1;
            }
        }

        pub fn fill_event(&mut self, event: &FillEvent) {
            let s = &mut self.fill;
            match event {
                FillEvent::Started { .. } => {
                    s.started += 1;
                    self.fill_started_at = Some(self.clock);
                }
                FillEvent::Completed { .. } => {
                    s.completed += 1;
                    if let Some(begin) = self.fill_started_at.take() {
                        s.latency.record(self.clock - begin);
                    }
                }
                FillEvent::Failed { .. } => s.failed += 1,
                FillEvent::Aborted { .. } => s.aborted += 1,
            }
        }
    }

    #[derive(Default, Clone, Copy)]
    pub struct FetchStat {
        from_pc: usize,
        from_last: usize,
        illegal: usize,
        bubbles: usize,
        held: usize,
        redirects: usize,
        invalidations: usize,
    }

    impl Stat for FetchStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ FetchStat {
        fn header(&self) -> &'static str {
            "fetch results"
        }
        fn width(&self) -> usize {
            38
        }
    }

    impl fmt::Display for &'_ FetchStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let delivered = self.from_pc + self.from_last;
            let offered = delivered + self.bubbles;
            let p_pct = percent(self.from_pc, delivered);
            let l_pct = percent(self.from_last, delivered);
            let b_pct = percent(self.bubbles, offered);
            writeln!(f, "      delivered: {delivered:>10}")?;
            writeln!(f, "   from request: {:>10} ({p_pct:>8}%)", self.from_pc)?;
            writeln!(f, "  from last req: {:>10} ({l_pct:>8}%)", self.from_last)?;
            writeln!(f, "        bubbles: {:>10} ({b_pct:>8}%)", self.bubbles)?;
            writeln!(f, "  consumer busy: {:>10}", self.held)?;
            writeln!(f, "        illegal: {:>10}", self.illegal)?;
            writeln!(f, "      redirects: {:>10}", self.redirects)?;
            write!(f, "  invalidations: {:>10}", self.invalidations)
        }
    }

    #[derive(Clone)]
    pub struct FillStat {
        started: usize,
        completed: usize,
        aborted: usize,
        failed: usize,
        words_received: usize,
        stalled_requests: usize,
        latency: Histogram,
    }

    impl Default for FillStat {
        fn default() -> Self {
            Self {
                started: 0,
                completed: 0,
                aborted: 0,
                failed: 0,
                words_received: 0,
                stalled_requests: 0,
                latency: Histogram::new(FILL_LATENCY_BOUNDS),
            }
        }
    }

    impl FillStat {
        pub fn started(&self) -> usize {
            self.started
        }
        pub fn completed(&self) -> usize {
            self.completed
        }
        pub fn aborted(&self) -> usize {
            self.aborted
        }
        pub fn failed(&self) -> usize {
            self.failed
        }
    }

    impl Stat for FillStat {
        fn view(&self, max_width: usize) -> Box<dyn StatView + '_> {
            Box::new(FillStatView {
                stat: self,
                max_width,
            })
        }
    }

    pub struct FillStatView<'a> {
        stat: &'a FillStat,
        max_width: usize,
    }

    impl StatView for FillStatView<'_> {
        fn header(&self) -> &'static str {
            "line fills"
        }
        fn width(&self) -> usize {
            self.max_width.max(33)
        }
    }

    impl fmt::Display for FillStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = self.stat;
            writeln!(f, "         started: {:>10}", s.started)?;
            writeln!(f, "       completed: {:>10}", s.completed)?;
            writeln!(f, "         aborted: {:>10}", s.aborted)?;
            writeln!(f, "      bus errors: {:>10}", s.failed)?;
            writeln!(f, "  words received: {:>10}", s.words_received)?;
            write!(f, "  stalled cycles: {:>10}", s.stalled_requests)?;
            if s.latency.total() != 0 {
                writeln!(f)?;
                write!(f, "  cycles from start to commit:")?;
                for row in s.latency.rows(self.max_width) {
                    writeln!(f)?;
                    write!(f, "{row}")?;
                }
            }
            Ok(())
        }
    }
}

#[cfg(feature = "stat")]
impl Controller {
    pub fn fill_stat(&self) -> &stat::FillStat {
        &self.stat.fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BusConfig, FaultRange, Memory, StallPattern, WishboneMemory};

    /// memory content at word address `a`
    fn word_at(a: u32) -> u32 {
        0xa000_0000 | a
    }

    struct Bench {
        ctrl: Controller,
        mem: WishboneMemory,
        out: Outputs,
        cycle: usize,
        /// word addresses taken by the slave, in order
        taken: Vec<u32>,
        /// cycle of the last ack seen
        last_ack: Option<usize>,
    }

    impl Bench {
        fn new(bus: BusConfig) -> Self {
            let words = (0..0x2000).map(word_at).collect();
            let ctrl = Controller::new(CacheGeometry::default()).unwrap();
            Self {
                out: ctrl.outputs(),
                ctrl,
                mem: WishboneMemory::new(Memory::from_words(words), bus),
                cycle: 0,
                taken: Vec::new(),
                last_ack: None,
            }
        }

        fn clock(&mut self, inputs: Inputs) -> Outputs {
            let bus = self.mem.respond(&self.out.bus);
            if self.out.bus.stb && !bus.stall {
                self.taken.push(self.out.bus.addr);
            }
            if bus.ack {
                self.last_ack = Some(self.cycle);
            }
            self.out = self.ctrl.eval(&Inputs { bus, ..inputs }).unwrap();
            self.cycle += 1;
            self.out
        }

        fn jump(&mut self, pc: Pc) {
            self.clock(Inputs {
                new_pc: true,
                pc,
                ready: true,
                ..Default::default()
            });
        }

        /// Consumes `count` sequential results starting at `start`, returning
        /// the cycle each one was taken in. Bails out after `limit` cycles.
        fn stream(&mut self, start: Pc, count: usize, limit: usize) -> Vec<usize> {
            self.jump(start);
            self.follow(start, count, limit)
        }

        fn follow(&mut self, start: Pc, count: usize, limit: usize) -> Vec<usize> {
            let mut waiting = start;
            let mut taken = Vec::new();
            for _ in 0..limit {
                if taken.len() == count {
                    break;
                }
                let out = self.out;
                let accepted = out.result_valid;
                if accepted {
                    assert!(!out.result_illegal, "unexpected fault at {}", out.result_pc);
                    assert_eq!(waiting, out.result_pc);
                    assert_eq!(word_at(waiting.word_addr()), out.instruction_word);
                    taken.push(self.cycle);
                }
                self.clock(Inputs {
                    pc: waiting.next(),
                    ready: true,
                    ..Default::default()
                });
                if accepted {
                    waiting.incr();
                }
            }
            assert_eq!(count, taken.len(), "stream did not finish");
            taken
        }

        fn idle(&mut self, cycles: usize, pc: Pc) {
            for _ in 0..cycles {
                self.clock(Inputs {
                    pc,
                    ready: true,
                    ..Default::default()
                });
            }
        }
    }

    fn consecutive(cycles: &[usize]) -> bool {
        cycles.windows(2).all(|w| w[1] == w[0] + 1)
    }

    #[test]
    fn test_cold_line_single_fill() {
        let mut b = Bench::new(BusConfig::default());
        let taken = b.stream(Pc::new(0), 8, 100);
        // one burst covering exactly line 0
        assert_eq!((0..8u32).collect::<Vec<_>>(), b.taken);
        assert!(taken[0] > b.last_ack.unwrap());
        assert!(consecutive(&taken));
    }
    #[test]
    fn test_warm_stream_crosses_lines() {
        let mut b = Bench::new(BusConfig::default());
        b.stream(Pc::new(0), 32, 400);
        let fills = b.taken.len();
        assert_eq!(32, fills);
        let taken = b.stream(Pc::new(0), 32, 100);
        assert!(consecutive(&taken));
        assert_eq!(fills, b.taken.len());
    }
    #[test]
    fn test_hold_keeps_result() {
        let mut b = Bench::new(BusConfig::default());
        b.stream(Pc::new(0x40), 1, 100);
        // the result for 0x44 is offered while the consumer is busy
        let mut seen = 0;
        for _ in 0..5 {
            let out = b.clock(Inputs {
                pc: Pc::new(0x48),
                ready: false,
                ..Default::default()
            });
            if out.result_valid {
                seen += 1;
                assert_eq!(Pc::new(0x44), out.result_pc);
                assert_eq!(word_at(0x11), out.instruction_word);
            }
        }
        assert!(seen >= 3);
    }
    #[test]
    fn test_clear_forces_refill() {
        let mut b = Bench::new(BusConfig::default());
        b.stream(Pc::new(0), 8, 100);
        b.clock(Inputs {
            clear_cache: true,
            pc: Pc::new(0x24),
            ..Default::default()
        });
        assert_eq!(0, b.ctrl.store().valid_lines());
        assert!(!b.out.result_valid);
        b.stream(Pc::new(0), 1, 100);
        assert_eq!(16, b.taken.len());
    }
    #[test]
    fn test_reset_forces_refill() {
        let mut b = Bench::new(BusConfig::default());
        b.stream(Pc::new(0x100), 8, 100);
        b.clock(Inputs {
            reset: true,
            ..Default::default()
        });
        assert_eq!(0, b.ctrl.store().valid_lines());
        assert!(!b.out.result_valid);
        assert!(!b.out.bus.cyc);
        b.stream(Pc::new(0x100), 1, 100);
        assert_eq!(16, b.taken.len());
    }
    #[test]
    fn test_new_pc_discards_fill() {
        let mut b = Bench::new(BusConfig {
            latency: 4,
            ..Default::default()
        });
        b.stream(Pc::new(0x200), 1, 100);
        // the next line is being filled when the consumer jumps away
        b.follow(Pc::new(0x204), 7, 100);
        b.idle(8, Pc::new(0x224));
        assert!(b.ctrl.fill_state().is_filling());
        b.stream(Pc::new(0x1000), 8, 100);
        let g = *b.ctrl.geometry();
        assert!(!b.ctrl.store().is_valid(g.decode(Pc::new(0x220)).line_index));
        assert_eq!(2, b.ctrl.store().valid_lines());
        // line 0x220 is fetched from scratch and comes back intact
        b.stream(Pc::new(0x220), 8, 100);
        let line = b.ctrl.store().line(g.decode(Pc::new(0x220)).line_index).unwrap();
        assert_eq!(
            (0x88..0x90).map(word_at).collect::<Vec<_>>(),
            line.words.to_vec()
        );
    }
    #[test]
    fn test_bus_error_reported_once() {
        let mut b = Bench::new(BusConfig {
            faults: vec![FaultRange {
                start: 0x300,
                end: 0x320,
            }],
            ..Default::default()
        });
        b.jump(Pc::new(0x300));
        let mut faults = 0;
        for _ in 0..60 {
            let out = b.out;
            if out.result_valid {
                assert!(out.result_illegal);
                assert_eq!(Pc::new(0x300), out.result_pc);
                faults += 1;
            }
            b.clock(Inputs {
                pc: Pc::new(0x304),
                ready: true,
                ..Default::default()
            });
        }
        assert_eq!(1, faults);
        let g = *b.ctrl.geometry();
        assert!(!b.ctrl.store().is_valid(g.decode(Pc::new(0x300)).line_index));
        let requests = b.taken.len();
        // the bus error is not retried until the consumer asks again
        b.jump(Pc::new(0x300));
        b.idle(20, Pc::new(0x304));
        assert!(b.taken.len() > requests);
        assert_eq!(Some(g.line_addr(Pc::new(0x300))), b.ctrl.illegal_record().map(|r| r.line));
    }
    #[test]
    fn test_fault_held_until_ready() {
        let mut b = Bench::new(BusConfig {
            faults: vec![FaultRange {
                start: 0x300,
                end: 0x320,
            }],
            ..Default::default()
        });
        b.jump(Pc::new(0x300));
        let mut faults = 0;
        for i in 0..80 {
            let ready = i % 4 == 3;
            let out = b.out;
            if out.result_valid {
                assert!(out.result_illegal);
                assert_eq!(Pc::new(0x300), out.result_pc);
                if ready {
                    faults += 1;
                }
            }
            b.clock(Inputs {
                pc: Pc::new(0x304),
                ready,
                ..Default::default()
            });
        }
        assert_eq!(1, faults);
        assert!(b.ctrl.illegal_record().unwrap().reported);
    }
    #[test]
    fn test_err_with_new_pc_leaves_no_record() {
        let mut b = Bench::new(BusConfig {
            faults: vec![FaultRange {
                start: 0x300,
                end: 0x320,
            }],
            ..Default::default()
        });
        b.jump(Pc::new(0x300));
        for _ in 0..40 {
            if !b.taken.is_empty() {
                break;
            }
            b.idle(1, Pc::new(0x304));
        }
        assert_eq!(vec![0xc0], b.taken);
        // the error for 0xc0 arrives on the same edge as the jump
        b.jump(Pc::new(0x1000));
        assert!(b.ctrl.illegal_record().is_none());
        assert!(!b.ctrl.fill_state().is_filling());
        b.follow(Pc::new(0x1000), 8, 100);
        assert!(b.ctrl.illegal_record().is_none());
    }
    #[test]
    fn test_clear_on_last_ack_does_not_commit() {
        let mut b = Bench::new(BusConfig::default());
        b.jump(Pc::new(0x40));
        for _ in 0..40 {
            let out = b.out;
            b.idle(1, Pc::new(0x44));
            if out.bus.stb && out.bus.addr == 0x17 {
                break;
            }
        }
        assert_eq!(Some(&0x17), b.taken.last());
        b.clock(Inputs {
            clear_cache: true,
            pc: Pc::new(0x44),
            ..Default::default()
        });
        assert_eq!(Some(b.cycle - 1), b.last_ack);
        assert_eq!(0, b.ctrl.store().valid_lines());
        assert!(!b.out.result_valid);
        b.stream(Pc::new(0x40), 1, 100);
        assert_eq!(16, b.taken.len());
    }
    #[test]
    fn test_warm_stream_with_busy_consumer() {
        let mut b = Bench::new(BusConfig::default());
        b.stream(Pc::new(0), 32, 400);
        let fills = b.taken.len();
        b.jump(Pc::new(0));
        let mut waiting = Pc::new(0);
        let mut taken = 0;
        let mut bubbles = 0;
        for _ in 0..200 {
            if taken == 32 {
                break;
            }
            let ready = b.cycle % 3 != 2;
            let out = b.out;
            if out.result_valid {
                assert_eq!(waiting, out.result_pc);
                assert_eq!(word_at(waiting.word_addr()), out.instruction_word);
            } else if ready && taken > 0 {
                bubbles += 1;
            }
            let accepted = ready && out.result_valid;
            if accepted {
                taken += 1;
            }
            b.clock(Inputs {
                pc: waiting.next(),
                ready,
                ..Default::default()
            });
            if accepted {
                waiting.incr();
            }
        }
        assert_eq!(32, taken);
        assert_eq!(0, bubbles);
        assert_eq!(fills, b.taken.len());
    }
    #[test]
    fn test_stalled_bus() {
        let mut b = Bench::new(BusConfig {
            latency: 2,
            stall: Some(StallPattern {
                period: 3,
                stalled: 2,
            }),
            ..Default::default()
        });
        b.stream(Pc::new(0x80), 16, 400);
        assert_eq!((0x20..0x30u32).collect::<Vec<_>>(), b.taken);
    }
    #[test]
    fn test_reject_bad_geometry() {
        assert!(Controller::new(CacheGeometry {
            lg_cache_words: 6,
            lg_lines: 7
        })
        .is_err());
    }
}
