use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use chuckpy::diagnostics::{self, LogLevel};
use chuckpy::driver::DriverKind;
use chuckpy::processor::{Passthrough, SineTone};
use chuckpy::utils::{ensure_pow2, next_pow2};
use chuckpy::{AudioStream, FrameProcessor, StreamConfig};

fn main() -> Result<()> {
    diagnostics::init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => execute_run(args),
        Commands::Config(args) => execute_config(args),
        Commands::Devices { driver } => {
            let kind = DriverKind::parse(&driver)
                .with_context(|| format!("unknown audio driver `{driver}`"))?;
            for (index, name) in kind.create().devices().iter().enumerate() {
                println!("{index}: {name}");
            }
            Ok(())
        }
        Commands::Pow2 { n } => {
            println!("nextpow2({n}) = {}", next_pow2(n));
            println!("ensurepow2({n}) = {}", ensure_pow2(n));
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "Drive chuckpy audio streams without Python")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stream with a built-in processor and report bridge statistics.
    Run(RunArgs),
    /// Print the stream configuration as JSON.
    Config(ConfigArgs),
    /// List the output devices a driver can open, by index.
    Devices {
        #[arg(long, default_value = "simulated")]
        driver: String,
    },
    /// Show how a buffer size is rounded.
    Pow2 { n: u64 },
}

#[derive(Copy, Clone, ValueEnum)]
enum ProcessorKind {
    Tone,
    Passthrough,
}

#[derive(Args)]
struct RunArgs {
    /// Stream configuration (JSON). Defaults are used for missing fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// How long to run, in seconds.
    #[arg(long, default_value_t = 1.0)]
    seconds: f64,
    #[arg(long, value_enum, default_value_t = ProcessorKind::Tone)]
    processor: ProcessorKind,
    /// Tone frequency in Hz.
    #[arg(long, default_value_t = 440.0)]
    frequency: f64,
    /// `simulated`, or `cpal` when built with the `cpal` feature.
    #[arg(long, default_value = "simulated")]
    driver: String,
    /// Diagnostic level, 0 (none) to 10 (everything).
    #[arg(long, default_value_t = 3)]
    log_level: u64,
}

#[derive(Args)]
struct ConfigArgs {
    /// Start from this file instead of the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the configuration after validation and rounding.
    #[arg(long)]
    normalized: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<StreamConfig> {
    match path {
        Some(path) => StreamConfig::from_json_file(path)
            .with_context(|| format!("failed to load stream config {}", path.display())),
        None => Ok(StreamConfig::default()),
    }
}

fn execute_run(args: RunArgs) -> Result<()> {
    diagnostics::set_log_level(LogLevel::from_number(args.log_level));
    let config = load_config(args.config.as_ref())?;
    let kind = DriverKind::parse(&args.driver)
        .with_context(|| format!("unknown audio driver `{}`", args.driver))?;

    let processor: Box<dyn FrameProcessor> = match args.processor {
        ProcessorKind::Tone => Box::new(SineTone::new(args.frequency, config.sample_rate)),
        ProcessorKind::Passthrough => Box::new(Passthrough),
    };
    let mut stream = AudioStream::initialize_with(
        &config,
        processor,
        kind.create(),
        std::sync::Arc::new(diagnostics::TracingDiagnostics),
    )
    .context("failed to open audio stream")?;

    stream.start().context("failed to start audio stream")?;
    std::thread::sleep(Duration::from_secs_f64(args.seconds.max(0.0)));
    stream.stop().context("failed to stop audio stream")?;

    let state = stream.state();
    let stats = stream.stats();
    stream.shutdown();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if state == chuckpy::StreamState::Halted {
        anyhow::bail!("stream was halted by the bridge");
    }
    Ok(())
}

fn execute_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let config = if args.normalized {
        config.normalized().context("invalid stream config")?
    } else {
        config
    };
    println!("{}", config.to_json());
    Ok(())
}
