use std::io::{stdin, stdout, Write};

use anyhow::Result;
use bitmask_enum::bitmask;
use pfcache_sim::{
    breakpoint::{BreakPoint, BreakPointCond},
    common::{ExecuteMode, Pc, RunStep, SimulationOption, TraceKind},
    sim::{BreakReason, ControlFlow, Simulator},
};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

peg::parser!(grammar command() for str {
    rule usize() -> usize
        = n:$(quiet!{['0'..='9']+}) {? n.parse().or(Err("usize")) }
        / expected!("usize")
    rule number() -> u32
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9'|'a'..='f'|'A'..='F']+})
        {? u32::from_str_radix(n, 16).or(Err("32-bit hex number")) }
        / n:$(quiet!{['0'..='9']+}) {? n.parse().or(Err("32-bit number")) }
        / expected!("number")
    rule pc() -> Pc
        = n:number() { Pc::new(n) }

    rule bp() = "bp" / "breakpoint"
    rule rm() = "rm" / "remove" / "-="
    rule bp_cond() -> BreakPointCond
        = "illegal" { BreakPointCond::Illegal }
        / "word" _ "==" _ w:number() { BreakPointCond::Word(w) }
    rule trace_kind() -> TraceKind
        = "off" { TraceKind::none() }
        / "fetch" { TraceKind::Fetch }
        / "bus" { TraceKind::Bus }
        / ("on" / "all") { TraceKind::Fetch | TraceKind::Bus }
    rule watch_kind() -> Watch
        = ("outputs" / "out") { Watch::Outputs }
        / "fill" { Watch::Fill }
        / "illegal" { Watch::Illegal }
    rule dyn_command() -> ExecuteMode
        = "skip" __ "until" __ pc:pc() { ExecuteMode::SkipUntil { pc } }
        / "run" { ExecuteMode::Run }
        / "step" step:(__ n:usize() { n })? { ExecuteMode::RunStep(RunStep::new(step)) }
    rule control() -> Control
        = "jump" __ pc:pc() { Control::Jump(pc) }
        / "clear" { Control::Clear }
        / "reset" { Control::Reset }
    rule static_command() -> StaticCommand
        = "trace" k:(__ k:trace_kind() { k })? { StaticCommand::UpdateTrace(k.unwrap_or(TraceKind::Fetch | TraceKind::Bus)) }
        / bp() __ rm() __ pc:pc() { StaticCommand::RemoveBp(pc) }
        / bp() __ pc:pc() cond:(__ "if" __ c:bp_cond() { c })? {
            StaticCommand::AddBp(match cond {
                Some(cond) => BreakPoint::with_cond(pc, cond),
                None => BreakPoint::new(pc),
            })
        }
        / "watch" __ w:watch_kind() { StaticCommand::Watch(Operation::Add, w) }
        / "unwatch" __ w:watch_kind() { StaticCommand::Watch(Operation::Remove, w) }
        / "show" __ sk:show_kind() { StaticCommand::Show(sk) }
        / c:control() { StaticCommand::Control(c) }
    rule show_kind() -> ShowKind
        = "pc" { ShowKind::Pc }
        / "stat" { ShowKind::Stat }
        / bp() { ShowKind::AllBp }
        / "line" __ n:usize() { ShowKind::Line(n) }
        / "fill" { ShowKind::Fill }
        / ("outputs" / "out") { ShowKind::Outputs }
        / "trace" { ShowKind::Trace }
        / "watch" { ShowKind::Watchings }
    pub(crate) rule parse_command() -> Command
        = _ s:static_command() _ { Command::Static(s) }
        / _ "exit" _ { Command::Exit }
        / _ d:dyn_command()? _ { Command::Dynamic(d) }
        / expected!("command")

    rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']}
        / expected!("whitespace")
    rule _() = ws()*
    rule __() = ws()+
});

pub(crate) enum Command {
    Dynamic(Option<ExecuteMode>),
    Static(StaticCommand),
    Exit,
}

pub(crate) enum StaticCommand {
    UpdateTrace(TraceKind),
    Show(ShowKind),
    AddBp(BreakPoint),
    RemoveBp(Pc),
    Watch(Operation, Watch),
    Control(Control),
}

pub(crate) enum Operation {
    Add,
    Remove,
}

/// One-shot requests to the simulated system.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Jump(Pc),
    Clear,
    Reset,
}

pub(crate) enum ShowKind {
    Pc,
    Stat,
    AllBp,
    Line(usize),
    Fill,
    Outputs,
    Trace,
    Watchings,
}

// shown every time the simulation breaks
#[bitmask(u8)]
pub(crate) enum Watch {
    Outputs,
    Fill,
    Illegal,
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn show(sim: &Simulator, opt: &SimulationOption, watching: Watch, kind: ShowKind) {
    match kind {
        ShowKind::Pc => {
            println!("waiting for {}, cycle #{}", sim.get_pc(), sim.cycle());
        }
        #[cfg(feature = "stat")]
        ShowKind::Stat => {
            let width = get_terminal_width().unwrap_or(60) as usize;
            println!("{}", sim.collect_stat().view(width));
        }
        #[cfg(not(feature = "stat"))]
        ShowKind::Stat => {
            println!("statistics are not collected; try compile with `--features stat`");
        }
        ShowKind::AllBp => {
            let mut v: Vec<_> = opt.breakpoints.values().collect();
            if v.is_empty() {
                println!("no breakpoints set.");
            } else {
                v.sort_by_key(|b| b.pc);
                println!(
                    "breakpoints: [{}]",
                    v.into_iter()
                        .map(|b| format!("{b}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
        ShowKind::Line(n) => match sim.controller().store().line(n) {
            Some(line) => println!("{line}"),
            None => println!(
                "no line {n}; the cache has {} lines",
                sim.controller().geometry().line_count()
            ),
        },
        ShowKind::Fill => {
            let c = sim.controller();
            println!("fill engine: {}", c.fill_state());
            match c.illegal_record() {
                Some(r) => println!(
                    "illegal: {}{}",
                    r.line,
                    if r.reported { " (reported)" } else { "" }
                ),
                None => println!("illegal: none"),
            }
        }
        ShowKind::Outputs => {
            let out = sim.outputs();
            print!("result: ");
            if out.result_valid {
                print!("{}", out.result_pc);
                if out.result_illegal {
                    println!(" illegal");
                } else {
                    println!(" {:#010x}", out.instruction_word);
                }
            } else {
                println!("none");
            }
            println!("bus: {}", out.bus);
        }
        ShowKind::Trace => {
            println!("trace: {}", opt.trace);
        }
        ShowKind::Watchings => {
            if watching.is_none() {
                println!("nothing to watch.");
                return;
            }
            let mut names = Vec::new();
            if watching.contains(Watch::Outputs) {
                names.push("outputs");
            }
            if watching.contains(Watch::Fill) {
                names.push("fill");
            }
            if watching.contains(Watch::Illegal) {
                names.push("illegal");
            }
            println!("watching: {}", names.join(", "));
        }
    }
}

pub fn execute_interactive(sim: &mut Simulator, trace: TraceKind) -> Result<()> {
    let mut opt = SimulationOption {
        trace,
        ..Default::default()
    };
    let mut watching = Watch::none();
    println!("entering interactive.");
    'interactive: loop {
        let update_mode = 'input: loop {
            // prompt string
            match &opt.mode {
                ExecuteMode::Run => print!("run "),
                ExecuteMode::SkipUntil { pc } => print!("until {pc} "),
                ExecuteMode::RunStep(n) => print!("step {} ", n.get_step()),
            }
            if !opt.trace.is_none() {
                print!("[trace {}] ", opt.trace);
            }
            print!("> ");
            stdout().flush()?;
            let mut str = String::new();
            if stdin().read_line(&mut str)? == 0 {
                break 'interactive;
            }
            let parsed = match command::parse_command(&str) {
                Ok(p) => p,
                Err(e) => {
                    println!("parse error: expected {}", e.expected);
                    continue;
                }
            };
            match parsed {
                Command::Dynamic(d) => {
                    break 'input d;
                }
                Command::Static(s) => {
                    let kind = match s {
                        StaticCommand::Show(s) => s,
                        StaticCommand::UpdateTrace(t) => {
                            opt.trace = t;
                            ShowKind::Trace
                        }
                        StaticCommand::AddBp(bp) => {
                            opt.breakpoints.insert(bp.pc, bp);
                            ShowKind::AllBp
                        }
                        StaticCommand::RemoveBp(pc) => {
                            opt.breakpoints.remove(&pc);
                            ShowKind::AllBp
                        }
                        StaticCommand::Watch(Operation::Add, w) => {
                            watching |= w;
                            ShowKind::Watchings
                        }
                        StaticCommand::Watch(Operation::Remove, w) => {
                            watching &= !w;
                            ShowKind::Watchings
                        }
                        StaticCommand::Control(c) => {
                            match c {
                                Control::Jump(pc) => sim.jump(pc),
                                Control::Clear => sim.request_clear(),
                                Control::Reset => sim.request_reset(),
                            }
                            println!("{c:?} takes effect at the next cycle.");
                            continue 'input;
                        }
                    };
                    show(sim, &opt, watching, kind);
                    continue 'input;
                }
                Command::Exit => {
                    break 'interactive;
                }
            }
        };
        if let Some(mode) = update_mode {
            println!("mode: {mode}");
            opt.mode = mode;
        }
        match sim.single_cycle(&opt)? {
            ControlFlow::Break(reason) => {
                use BreakReason::*;
                match reason {
                    Reached(..) | StepEnded => (),
                    BreakPoint(_) => println!("{reason}"),
                    CannotRestart => {
                        let e = sim.get_error_msg().unwrap_or_default();
                        println!("cannot restart simulator due to previous error: {e}")
                    }
                    Failed => {
                        let e = sim.get_error_msg().unwrap_or_default();
                        let cy = sim.cycle();
                        println!("failed at #{cy}: {e}")
                    }
                }
                if watching.contains(Watch::Outputs) {
                    show(sim, &opt, watching, ShowKind::Outputs);
                }
                if watching.contains(Watch::Fill) {
                    println!("fill engine: {}", sim.controller().fill_state());
                }
                if watching.contains(Watch::Illegal) {
                    if let Some(r) = sim.controller().illegal_record() {
                        println!("illegal: {}", r.line);
                    }
                }
            }
            ControlFlow::Exit(halt) => {
                println!("{halt}");
                break 'interactive;
            }
        }
    }
    #[cfg(feature = "stat")]
    sim.exit_sim();
    println!("exiting interactive.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Command {
        command::parse_command(s).unwrap()
    }

    #[test]
    fn test_dynamic_commands() {
        assert!(matches!(
            parse("run\n"),
            Command::Dynamic(Some(ExecuteMode::Run))
        ));
        assert!(matches!(
            parse("step 16\n"),
            Command::Dynamic(Some(ExecuteMode::RunStep(r))) if r.get_step() == 16
        ));
        assert!(matches!(
            parse("step\n"),
            Command::Dynamic(Some(ExecuteMode::RunStep(r))) if r.get_step() == 1
        ));
        assert!(matches!(
            parse("skip until 0x1c\n"),
            Command::Dynamic(Some(ExecuteMode::SkipUntil { pc })) if pc == Pc::new(0x1c)
        ));
        assert!(matches!(parse("\n"), Command::Dynamic(None)));
        assert!(matches!(parse("exit\n"), Command::Exit));
    }
    #[test]
    fn test_breakpoints() {
        let Command::Static(StaticCommand::AddBp(bp)) = parse("bp 0x40 if word == 0x13\n") else {
            panic!()
        };
        assert_eq!("0x00000040 if word == 0x00000013", bp.to_string());
        let Command::Static(StaticCommand::AddBp(bp)) = parse("breakpoint 64 if illegal") else {
            panic!()
        };
        assert_eq!("0x00000040 if illegal", bp.to_string());
        assert!(matches!(
            parse("bp rm 0x40"),
            Command::Static(StaticCommand::RemoveBp(pc)) if pc == Pc::new(0x40)
        ));
    }
    #[test]
    fn test_static_commands() {
        assert!(matches!(
            parse("trace\n"),
            Command::Static(StaticCommand::UpdateTrace(t)) if t == TraceKind::Fetch | TraceKind::Bus
        ));
        assert!(matches!(
            parse("trace bus\n"),
            Command::Static(StaticCommand::UpdateTrace(t)) if t == TraceKind::Bus
        ));
        assert!(matches!(
            parse("show line 17"),
            Command::Static(StaticCommand::Show(ShowKind::Line(17)))
        ));
        assert!(matches!(
            parse("jump 0x100"),
            Command::Static(StaticCommand::Control(Control::Jump(pc))) if pc == Pc::new(0x100)
        ));
        assert!(matches!(
            parse("clear"),
            Command::Static(StaticCommand::Control(Control::Clear))
        ));
        assert!(matches!(
            parse("watch fill"),
            Command::Static(StaticCommand::Watch(Operation::Add, w)) if w == Watch::Fill
        ));
    }
    #[test]
    fn test_parse_errors() {
        assert!(command::parse_command("show everything").is_err());
        assert!(command::parse_command("bp 0xzz").is_err());
        assert!(command::parse_command("step many").is_err());
    }
}
