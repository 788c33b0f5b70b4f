use std::{fmt, mem};

use anyhow::Result;
use thiserror::Error;

use crate::{
    common::{ExecuteMode, Pc, SimulationOption, TraceKind},
    config::SimConfig,
    consumer::{FetchConsumer, Halt, Retired},
    controller::{Controller, ControllerError, Inputs, Outputs},
    image::Image,
    memory::{Memory, WishboneMemory},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("consumer expected the result for {expected}, but {found} was offered")]
    UnexpectedPc { expected: Pc, found: Pc },
    #[error("cycle limit of {0} reached")]
    CycleLimit(usize),
}

/// Control inputs injected from outside for one cycle.
#[derive(Default)]
struct Injected {
    reset: bool,
    clear: bool,
}

/// What happened during one clock cycle.
pub struct CycleResult {
    pub cycle: usize,
    /// controller outputs during the cycle
    pub outputs: Outputs,
    /// controller inputs during the cycle
    pub inputs: Inputs,
    pub retired: Option<Retired>,
}

pub struct Simulator {
    controller: Controller,
    bus: WishboneMemory,
    consumer: FetchConsumer,
    start_pc: Pc,
    outputs: Outputs,
    injected: Injected,
    cycle: usize,
    max_cycles: Option<usize>,
    fatal_error: Option<RuntimeError>,
    #[cfg(feature = "stat")]
    stat_builder: stat::SimStatBuilder,
}

impl Simulator {
    pub fn new(config: &SimConfig, image: &Image) -> Result<Self> {
        let controller = Controller::new(config.geometry)?;
        let g = controller.geometry();
        log::info!(
            "cache: {} lines of {} words, {} tag bits",
            g.line_count(),
            g.words_per_line(),
            g.tag_bits()
        );
        let mut memory = Memory::new(config.memory_words);
        image.load_into(&mut memory)?;
        log::info!(
            "image: {} words in {} blocks up to word {:#x}, memory of {} words",
            image.word_count(),
            image.blocks().len(),
            image.end(),
            memory.len()
        );
        Ok(Self {
            outputs: controller.outputs(),
            controller,
            bus: WishboneMemory::new(memory, config.bus.clone()),
            consumer: FetchConsumer::new(&config.consumer),
            start_pc: config.consumer.start_pc,
            injected: Default::default(),
            cycle: 0,
            max_cycles: config.max_cycles,
            fatal_error: None,
            #[cfg(feature = "stat")]
            stat_builder: stat::SimStatBuilder::new(),
        })
    }

    fn clock(&mut self, trace: TraceKind) -> Result<CycleResult, RuntimeError> {
        if let Some(limit) = self.max_cycles {
            if self.cycle >= limit {
                return Err(RuntimeError::CycleLimit(limit));
            }
        }
        let outputs = self.outputs;
        let (mut inputs, retired) = self.consumer.drive(&outputs)?;
        let Injected { reset, clear } = mem::take(&mut self.injected);
        inputs.reset = reset;
        inputs.clear_cache = clear;
        inputs.bus = self.bus.respond(&outputs.bus);
        self.outputs = self.controller.eval(&inputs)?;
        let r = CycleResult {
            cycle: self.cycle,
            outputs,
            inputs,
            retired,
        };
        self.cycle += 1;
        print_trace(trace, &r);
        Ok(r)
    }

    #[cfg(feature = "stat")]
    pub fn exit_sim(&mut self) {
        self.stat_builder.stop_timer();
    }

    pub fn single_cycle(&mut self, opt: &SimulationOption) -> Result<ControlFlow> {
        macro_rules! break_sim {
            ($reason:expr) => {
                return Ok(ControlFlow::Break($reason))
            };
        }
        if self.fatal_error.is_some() {
            break_sim!(BreakReason::CannotRestart)
        }
        macro_rules! execute {
            () => {{
                let r = match self.clock(opt.trace) {
                    Ok(r) => r,
                    Err(e) => {
                        // all runtime errors are fatal
                        self.fatal_error = Some(e);
                        break_sim!(BreakReason::Failed);
                    }
                };
                if let Some(halt) = self.consumer.halted() {
                    #[cfg(feature = "stat")]
                    self.exit_sim();
                    return Ok(ControlFlow::Exit(halt));
                }
                if let Some(retired) = &r.retired {
                    if let Some(bp) = opt.breakpoints.get(&retired.pc()) {
                        if bp.matches(retired) {
                            break_sim!(BreakReason::BreakPoint(retired.pc()));
                        }
                    }
                }
                r.retired.map(|r| r.pc())
            }};
        }

        match &opt.mode {
            ExecuteMode::SkipUntil { pc } => loop {
                if execute!() == Some(*pc) {
                    break_sim!(BreakReason::Reached(*pc));
                }
            },
            ExecuteMode::Run => loop {
                execute!();
            },
            ExecuteMode::RunStep(r) => {
                for _ in 0..r.get_step() {
                    execute!();
                }
                break_sim!(BreakReason::StepEnded)
            }
        }
    }

    /// Asserts `clear_cache` during the next cycle.
    pub fn request_clear(&mut self) {
        self.injected.clear = true;
    }

    /// Resets the controller during the next cycle and restarts the consumer
    /// from its start address.
    pub fn request_reset(&mut self) {
        self.injected.reset = true;
        self.consumer.jump(self.start_pc);
    }

    /// Redirects the consumer to `pc` from the next cycle on.
    pub fn jump(&mut self, pc: Pc) {
        self.consumer.jump(pc);
    }

    /// pc of the result the consumer is waiting for
    pub fn get_pc(&self) -> Pc {
        self.consumer.waiting()
    }

    pub fn halted(&self) -> Option<Halt> {
        self.consumer.halted()
    }

    pub fn cycle(&self) -> usize {
        self.cycle
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn memory(&self) -> &Memory {
        self.bus.memory()
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    pub fn get_error_msg(&self) -> Option<String> {
        self.fatal_error.as_ref().map(|e| format!("{e}"))
    }
}

#[inline]
fn print_trace(trace: TraceKind, r: &CycleResult) {
    let cycle = r.cycle;
    if trace.contains(TraceKind::Bus) && (r.outputs.bus.cyc || r.inputs.bus.ack || r.inputs.bus.err) {
        println!("#{cycle:010}, bus: {}\t{}", r.outputs.bus, r.inputs.bus);
    }
    if trace.contains(TraceKind::Fetch) {
        if r.inputs.new_pc {
            println!("#{cycle:010}, jump to {}", r.inputs.pc);
        }
        if let Some(retired) = &r.retired {
            println!("#{cycle:010}, {retired}");
        }
    }
}

impl Simulator {
    #[cfg(feature = "stat")]
    pub fn collect_stat(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
impl AddStats for Simulator {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat_builder.finish(self.cycle)));
        self.controller.add_stats(buf);
        self.bus.add_stats(buf);
    }
}

#[cfg(feature = "stat")]
mod stat {
    use crate::stat::*;

    use super::*;
    use std::time;

    pub struct SimStatBuilder {
        begin: time::Instant,
        elapsed: Option<time::Duration>,
    }

    impl SimStatBuilder {
        pub fn new() -> Self {
            Self {
                begin: time::Instant::now(),
                elapsed: None,
            }
        }
        pub fn stop_timer(&mut self) {
            self.elapsed = Some(time::Instant::now() - self.begin)
        }
        pub fn finish(&self, cycle: usize) -> SimStat {
            SimStat {
                cycle,
                elapsed: self.elapsed.unwrap_or_else(|| self.begin.elapsed()),
            }
        }
    }

    impl Default for SimStatBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct SimStat {
        cycle: usize,
        elapsed: time::Duration,
    }

    impl Stat for SimStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ SimStat {
        fn header(&self) -> &'static str {
            "simulator stat"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ SimStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let ms = format!("{} ms", self.elapsed.as_millis());
            writeln!(f, "  elapsed total: {ms:>9}")?;
            let cycle = format!("#{}", self.cycle);
            write!(f, "  cycles total: {cycle:>10}")
        }
    }
}

pub enum ControlFlow {
    Break(BreakReason),
    Exit(Halt),
}

pub enum ExitCode {
    Success,
    Failure,
}

impl ExitCode {
    /// Returns `true` if the exit code is [`Success`].
    ///
    /// [`Success`]: ExitCode::Success
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl ControlFlow {
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            Self::Exit(Halt::Reached(_)) => Some(ExitCode::Success),
            Self::Exit(Halt::Faulted(_))
            | Self::Break(BreakReason::CannotRestart | BreakReason::Failed) => {
                Some(ExitCode::Failure)
            }
            Self::Break(_) => None,
        }
    }
}

pub enum BreakReason {
    CannotRestart,
    Failed,
    Reached(Pc),
    StepEnded,
    BreakPoint(Pc),
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakReason::CannotRestart => write!(f, "cannot restart after a fatal error"),
            BreakReason::Failed => write!(f, "simulation failed"),
            BreakReason::Reached(pc) => write!(f, "reached {pc}"),
            BreakReason::StepEnded => write!(f, "step ended"),
            BreakReason::BreakPoint(pc) => write!(f, "breakpoint at {pc}"),
        }
    }
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Reached(pc) => write!(f, "halted after {pc}"),
            Halt::Faulted(pc) => write!(f, "instruction fetch faulted at {pc}"),
        }
    }
}
