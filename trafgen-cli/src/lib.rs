use std::{collections::BTreeMap, path::Path};

use clap::Parser;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use trafgen_scheduler::{
    DpCore, Mbuf, PortEvent, SchedulerError, Time, compile_streams, node::StreamNode,
};
use trafgen_vm::{
    Config,
    compiler::Context,
    log,
    stream::Stream,
    utils::error::{ReportableError, report},
};

#[derive(clap::Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub mode: Mode,

    /// Stream profile (JSON)
    #[clap(value_parser)]
    pub file: String,

    /// Seconds of virtual time to simulate.
    #[arg(long, default_value_t = 1.0)]
    pub time: f64,

    /// Number of cores sharing the profile. Each core sends its own share of
    /// every flow variable range at its share of the stream rate.
    #[arg(long, short, default_value_t = 1)]
    pub cores: u8,

    /// Hex dump the first N packets of every core.
    #[arg(long, default_value_t = 0)]
    pub dump: usize,

    /// Report the expected size of random packet sizes with the exact mean
    /// instead of the sampled estimate.
    #[arg(long, default_value_t = false)]
    pub exact_random_avg: bool,

    /// Log more, repeat for trace output.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn to_config(&self) -> Config {
        let mut config = Config::default();
        config.compiler.exact_random_avg = self.exact_random_avg;
        config
    }
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(clap::Args, Debug, Clone, Copy)]
#[group(required = false, multiple = false)]
pub struct Mode {
    /// Print the instruction listing of every stream and exit
    #[arg(long, default_value_t = false)]
    pub emit_instructions: bool,

    /// Print the bytecode of every stream and exit
    #[arg(long, default_value_t = false)]
    pub emit_bytecode: bool,
}

pub enum RunMode {
    EmitInstructions,
    EmitByteCode,
    Simulate { end: Time, cores: u8, dump: usize },
}

/// Execution options derived from CLI arguments.
pub struct RunOptions {
    mode: RunMode,
    config: Config,
}

impl RunOptions {
    pub fn from_args(args: &Args) -> Self {
        let mode = if args.mode.emit_instructions {
            RunMode::EmitInstructions
        } else if args.mode.emit_bytecode {
            RunMode::EmitByteCode
        } else {
            RunMode::Simulate {
                end: Time::from_secs_f64(args.time),
                cores: args.cores.max(1),
                dump: args.dump,
            }
        };
        Self {
            mode,
            config: args.to_config(),
        }
    }
}

/// The streams of one port, as loaded from a profile file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stop the port after this many seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    pub streams: Vec<Stream>,
}

impl Profile {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Instruction listing of the stream `id`, used to annotate error reports.
    pub fn listing(&self, id: u32) -> String {
        self.streams
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.vm.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamCounters {
    pub packets: u64,
    pub bytes: u64,
    pub first: Option<Time>,
    pub last: Option<Time>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketDump {
    pub core: u8,
    pub stream_id: u32,
    pub time: Time,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Simulation {
    pub counters: BTreeMap<u32, StreamCounters>,
    pub dumps: Vec<PacketDump>,
    pub port_events: Vec<(u8, PortEvent)>,
}

/// Play `profile` on port 0 of `cores` cores until `end`.
pub fn simulate(
    profile: &Profile,
    config: Config,
    end: Time,
    cores: u8,
    dump: usize,
) -> Result<Simulation, SchedulerError> {
    let mut ctx = Context::new(config.compiler);
    let mut sim = Simulation::default();
    for core_id in 0..cores {
        let mut streams = compile_streams(&mut ctx, &profile.streams, core_id as u32, cores as u32)?;
        for s in &mut streams {
            s.pps /= cores as f64;
        }
        let mut core = DpCore::new(core_id, 1);
        core.start_traffic(0, &streams, profile.duration, 1)?;
        let mut dumped = 0;
        core.run_until(end, &mut |node: &StreamNode, mbuf: Mbuf| {
            let counters = sim.counters.entry(node.stream_id()).or_default();
            counters.packets += 1;
            counters.bytes += mbuf.len() as u64;
            let time = node.time();
            counters.first = Some(counters.first.map_or(time, |t| t.min(time)));
            counters.last = counters.last.max(Some(time));
            if dumped < dump {
                dumped += 1;
                sim.dumps.push(PacketDump {
                    core: core_id,
                    stream_id: node.stream_id(),
                    time: node.time(),
                    bytes: mbuf.to_vec(),
                });
            }
        });
        sim.port_events
            .extend(core.take_port_events().into_iter().map(|e| (core_id, e)));
    }
    Ok(sim)
}

pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, row)| {
            format!(
                "{:04x}  {}",
                i * 16,
                row.iter().map(|b| format!("{b:02x}")).join(" ")
            )
        })
        .join("\n")
}

/// Compile or simulate a loaded profile according to the provided options.
pub fn run_profile(options: RunOptions, profile: &Profile) -> Result<(), SchedulerError> {
    match options.mode {
        RunMode::EmitInstructions => {
            for s in &profile.streams {
                println!("stream {}:\n{}", s.id, s.vm);
            }
        }
        RunMode::EmitByteCode => {
            let mut ctx = Context::new(options.config.compiler);
            for (s, compiled) in profile
                .streams
                .iter()
                .zip(compile_streams(&mut ctx, &profile.streams, 0, 1)?)
            {
                match &compiled.program {
                    Some(program) => println!("stream {}:\n{program}", s.id),
                    None => println!("stream {}: constant packet", s.id),
                }
            }
        }
        RunMode::Simulate { end, cores, dump } => {
            let sim = simulate(profile, options.config, end, cores, dump)?;
            for d in &sim.dumps {
                println!(
                    "core {} stream {} at {}\n{}",
                    d.core,
                    d.stream_id,
                    d.time,
                    hex_dump(&d.bytes)
                );
            }
            for (id, c) in &sim.counters {
                println!(
                    "stream {id}: {} packets, {} bytes, first {}, last {}",
                    c.packets,
                    c.bytes,
                    c.first.unwrap_or_default(),
                    c.last.unwrap_or_default()
                );
            }
            for (core, e) in &sim.port_events {
                log::debug!("core {core}: {e:?}");
            }
        }
    }
    Ok(())
}

pub fn lib_main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    colog::default_builder()
        .filter_level(args.log_level())
        .init();

    let path = Path::new(&args.file);
    let content = std::fs::read_to_string(path)?;
    let profile = Profile::from_json(&content)?;
    let options = RunOptions::from_args(&args);
    if let Err(e) = run_profile(options, &profile) {
        let listing = match &e {
            SchedulerError::Compile { stream_id, .. } => profile.listing(*stream_id),
            _ => String::new(),
        };
        let errs: Vec<Box<dyn ReportableError>> = vec![Box::new(e)];
        report(&listing, &errs);
        return Err(format!("Failed to process {}", path.display()).into());
    }
    Ok(())
}
