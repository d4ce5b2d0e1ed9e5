//! CLI entrypoint for the pagewright workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pagewright_core::EngineConfig;
use pagewright_harness::workload::sweep;
use pagewright_harness::{LogEmitter, Tier, WorkloadRunner, WorkloadSpec};

/// Workload tooling for pagewright.
#[derive(Debug, Parser)]
#[command(name = "pagewright-harness")]
#[command(about = "Seeded workload harness for the pagewright extent allocator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct WorkloadArgs {
    /// Allocator tier to exercise.
    #[arg(long, value_enum, default_value = "engine")]
    tier: Tier,
    /// Root seed (decimal or 0x...).
    #[arg(long, default_value = "0xDEAD_BEEF")]
    seed: String,
    /// Steps per worker.
    #[arg(long, default_value_t = 2_000)]
    steps: u64,
    /// Worker threads.
    #[arg(long, default_value_t = 1)]
    threads: usize,
    /// Largest small request, in pages.
    #[arg(long, default_value_t = 64)]
    max_pages: usize,
    /// Accounting check interval in steps (0 = teardown only).
    #[arg(long, default_value_t = 1)]
    check_every: u64,
    /// Allocator configuration as `key:value,...`; falls back to `PAGEWRIGHT_CONF`.
    #[arg(long)]
    conf: Option<String>,
    /// JSONL log path (if omitted, logs are discarded).
    #[arg(long)]
    log: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one seeded workload and print its JSON summary.
    Run {
        #[command(flatten)]
        workload: WorkloadArgs,
        /// Summary output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run consecutive seeds and print every summary.
    Sweep {
        #[command(flatten)]
        workload: WorkloadArgs,
        /// Number of seeds.
        #[arg(long, default_value_t = 16)]
        count: u64,
        /// Summary output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective allocator configuration.
    Config {
        /// Configuration as `key:value,...`; falls back to `PAGEWRIGHT_CONF`.
        #[arg(long)]
        conf: Option<String>,
    },
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid seed `{raw}`: {err}"))
}

fn load_config(conf: Option<&str>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config = match conf {
        Some(conf) => EngineConfig::from_conf_str(conf)?,
        None => EngineConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn prepare(
    args: &WorkloadArgs,
) -> Result<(WorkloadSpec, EngineConfig, LogEmitter), Box<dyn std::error::Error>> {
    let spec = WorkloadSpec {
        tier: args.tier,
        seed: parse_seed(&args.seed)?,
        steps: args.steps,
        threads: args.threads,
        max_pages: args.max_pages,
        check_every: args.check_every,
        ..WorkloadSpec::default()
    };
    let config = load_config(args.conf.as_deref())?;
    let run_id = format!("{:?}-{:#x}", spec.tier, spec.seed).to_lowercase();
    let emitter = match &args.log {
        Some(path) => LogEmitter::to_file(path, &run_id)?,
        None => LogEmitter::to_sink(&run_id),
    };
    Ok((spec, config, emitter))
}

fn write_output(output: Option<PathBuf>, body: &str) -> std::io::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(&path, body)?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        }
        None => {
            println!("{body}");
            Ok(())
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { workload, output } => {
            let (spec, config, mut emitter) = prepare(&workload)?;
            eprintln!(
                "Running {:?} workload seed={:#x} steps={} threads={}",
                spec.tier, spec.seed, spec.steps, spec.threads
            );
            let summary = WorkloadRunner::new(spec, config)?.run(&mut emitter)?;
            write_output(output, &serde_json::to_string_pretty(&summary)?)?;
        }
        Command::Sweep {
            workload,
            count,
            output,
        } => {
            let (spec, config, mut emitter) = prepare(&workload)?;
            eprintln!(
                "Sweeping {count} seeds from {:#x} on the {:?} tier",
                spec.seed, spec.tier
            );
            let summaries = sweep(&spec, &config, count, &mut emitter)?;
            write_output(output, &serde_json::to_string_pretty(&summaries)?)?;
        }
        Command::Config { conf } => {
            let config = load_config(conf.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
