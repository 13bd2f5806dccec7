//! fxrack command line
//!
//! Renders a test signal through a configured effect chain and prints the
//! lifecycle timeline of every effect.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use fxrack_core::domain::audio::SampleRate;
use fxrack_core::domain::config::{ConfigManager, EngineConfig, ResamplerQuality};
use fxrack_infra::{sine_burst, BlockRenderer, RenderReport, TimelineKind};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fxrack")]
#[command(about = "Effect runtime lifecycle and crossfade engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a sine burst through the effect chain and print the timeline
    Render {
        /// Configuration file; the user config is used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Total length of the rendered signal in seconds
        #[arg(long, default_value_t = 3.0)]
        seconds: f32,

        /// Length of the sine burst at the start of the signal
        #[arg(long, default_value_t = 1.0)]
        burst: f32,

        /// Sine frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,

        /// Peak level of the burst
        #[arg(long, default_value_t = 0.5)]
        level: f32,

        /// Override the configured rate converter
        #[arg(long, value_enum)]
        resampler: Option<Quality>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the factory default configuration
    InitConfig {
        /// Destination file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Quality {
    Linear,
    Sinc,
}

impl From<Quality> for ResamplerQuality {
    fn from(quality: Quality) -> Self {
        match quality {
            Quality::Linear => ResamplerQuality::Linear,
            Quality::Sinc => ResamplerQuality::Sinc,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Render {
            config,
            seconds,
            burst,
            frequency,
            level,
            resampler,
            json,
        } => {
            let mut config = load_config(config).await?;
            if let Some(quality) = resampler {
                config.engine.resampler_quality = quality.into();
            }
            render(&config, seconds, burst, frequency, level, json)
        }
        Command::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists, pass --force to overwrite", path.display());
            }
            EngineConfig::factory_default()
                .save_to_file(&path)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "default configuration written");
            Ok(())
        }
    }
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(&path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        None => {
            let dir = ConfigManager::default_config_dir()?;
            let manager = ConfigManager::new(dir);
            debug!(path = %manager.config_path().display(), "using user configuration");
            Ok(manager.load().await)
        }
    }
}

fn render(
    config: &EngineConfig,
    seconds: f32,
    burst: f32,
    frequency: f32,
    level: f32,
    json: bool,
) -> anyhow::Result<()> {
    if seconds <= 0.0 {
        bail!("--seconds must be positive");
    }

    let mut renderer = BlockRenderer::from_config(config)?;
    let rate = SampleRate::from_hz(config.engine.sample_rate);
    let input = sine_burst(rate, frequency, level, burst, seconds);
    info!(
        frames = input.len(),
        effects = renderer.chain().len(),
        "rendering"
    );

    let (_, report) = renderer.render(&input)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RenderReport) {
    println!(
        "{} blocks of {} frames at {} Hz, {} active",
        report.blocks, report.frames_per_period, report.sample_rate, report.active_blocks
    );
    println!(
        "peak in {:.3}, peak out {:.3}",
        report.input_peak, report.output_peak
    );

    println!();
    for entry in &report.timeline {
        match entry.kind {
            TimelineKind::StateChanged { from, to } => println!(
                "{:>9.1} ms  {:<5} {} -> {}",
                entry.time_ms,
                entry.effect.to_string(),
                from.label(),
                to.label()
            ),
            TimelineKind::Faulted => {
                println!("{:>9.1} ms  {:<5} FAULT", entry.time_ms, entry.effect.to_string())
            }
        }
    }

    println!();
    for effect in &report.effects {
        println!(
            "{:<5} {:<10} {:<11} processed {:>6}  skipped {:>6}  faults {}  dropped events {}",
            effect.effect.to_string(),
            effect.name,
            effect.state.label(),
            effect.processed_blocks,
            effect.skipped_blocks,
            effect.fault_count,
            effect.dropped_events
        );
    }
}
