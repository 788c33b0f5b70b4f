mod interactive;

use std::{fs::File, io::Read, path::PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pfcache_sim::{
    addr::CacheGeometry,
    common::{Pc, SimulationOption, TraceKind},
    config::SimConfig,
    image::Image,
    sim::Simulator,
};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// simulate fetching a memory image through the cache
    Run(RunArgs),
    /// show how the cache splits an address
    Decode(DecodeArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ImageFormat {
    /// whitespace separated hex words with `@addr` origins
    Hex,
    /// raw little-endian words loaded from address 0
    Bin,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Trace {
    Fetch,
    Bus,
    All,
}

impl From<Trace> for TraceKind {
    fn from(t: Trace) -> Self {
        match t {
            Trace::Fetch => TraceKind::Fetch,
            Trace::Bus => TraceKind::Bus,
            Trace::All => TraceKind::Fetch | TraceKind::Bus,
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// File path to memory image
    #[arg(short, long)]
    input: PathBuf,
    #[arg(long, value_enum, default_value_t = ImageFormat::Hex)]
    format: ImageFormat,
    /// File path to simulator configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address fetching starts from
    #[arg(long, value_parser = parse_pc)]
    start: Option<Pc>,
    /// Stop once the instruction at this address is taken
    #[arg(long, value_parser = parse_pc)]
    halt_at: Option<Pc>,
    #[arg(long)]
    max_cycles: Option<usize>,
    /// Enable interactive mode
    #[arg(long)]
    interactive: bool,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    #[arg(long, value_enum)]
    trace: Option<Trace>,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    #[arg(value_parser = parse_pc)]
    pc: Pc,
    /// log2 of the cache size in words
    #[arg(long, default_value_t = CacheGeometry::default().lg_cache_words)]
    lg_cache_words: u32,
    /// log2 of the number of lines
    #[arg(long, default_value_t = CacheGeometry::default().lg_lines)]
    lg_lines: u32,
}

fn parse_pc(s: &str) -> Result<Pc, String> {
    let v = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    v.map(Pc::new).map_err(|e| format!("`{s}` is not an address: {e}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(RunArgs {
            input,
            format,
            config,
            start,
            halt_at,
            max_cycles,
            interactive,
            verbose,
            trace,
        }) => {
            if verbose {
                env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                    .init();
            } else {
                env_logger::init();
            }
            let mut config = read_config(config)?;
            if let Some(pc) = start {
                config.consumer.start_pc = pc;
            }
            if halt_at.is_some() {
                config.consumer.halt_at = halt_at;
            }
            if max_cycles.is_some() {
                config.max_cycles = max_cycles;
            }
            let image = read_image(input, format)?;
            let mut sim = Simulator::new(&config, &image)?;
            let trace = trace.map_or(TraceKind::none(), TraceKind::from);
            let r = execute(&mut sim, interactive, trace);
            log::info!("finished execution at cycle #{}.", sim.cycle());
            output_stat(&sim);
            r
        }
        Command::Decode(DecodeArgs {
            pc,
            lg_cache_words,
            lg_lines,
        }) => {
            let g = CacheGeometry::new(lg_cache_words, lg_lines)?;
            let line = g.line_addr(pc);
            println!("{}", g.decode(pc));
            println!(
                "{line}, successor {}, data index {:#x}",
                g.successor(line),
                g.data_index(pc)
            );
            Ok(())
        }
    }
}

#[cfg(not(feature = "stat"))]
fn output_stat(_: &Simulator) {}

#[cfg(feature = "stat")]
fn output_stat(sim: &Simulator) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", sim.collect_stat().view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn read_config(config: Option<PathBuf>) -> Result<SimConfig> {
    match config {
        Some(p) => {
            let file = File::open(p)?;
            SimConfig::deser(file)
        }
        None => Ok(Default::default()),
    }
}

fn read_image(input: PathBuf, format: ImageFormat) -> Result<Image> {
    let mut file = File::open(input)?;
    match format {
        ImageFormat::Hex => {
            let mut buf = String::new();
            file.read_to_string(&mut buf)?;
            Image::parse_hex(&buf)
        }
        ImageFormat::Bin => {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(Image::from_le_bytes(&buf))
        }
    }
}

fn execute(sim: &mut Simulator, interactive: bool, trace: TraceKind) -> Result<()> {
    if interactive {
        interactive::execute_interactive(sim, trace)
    } else {
        let opt = SimulationOption {
            trace,
            ..Default::default()
        };
        loop {
            let r = sim.single_cycle(&opt)?;
            if let Some(c) = r.exit_code() {
                if c.is_success() {
                    break Ok(());
                }
                let how = sim
                    .get_error_msg()
                    .or_else(|| sim.halted().map(|h| h.to_string()))
                    .unwrap_or_default();
                break Err(anyhow::anyhow!("simulator returns an error: {how}. try executing process with --interactive to debug."));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pc() {
        assert_eq!(Ok(Pc::new(0x40)), parse_pc("0x40"));
        assert_eq!(Ok(Pc::new(64)), parse_pc("64"));
        assert!(parse_pc("0xg").is_err());
    }
    #[test]
    fn test_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
