//! CLI entry point for lightsheet_daq
//!
//! Runs acquisitions against the configured (synthetic by default) devices and
//! inspects the waveforms they would be driven with.
//!
//! # Usage
//!
//! Z-stack with the experiment from the config file:
//! ```bash
//! lightsheet_daq acquire --config config/microscope.toml --output frames.jsonl
//! ```
//!
//! Custom feature list:
//! ```bash
//! lightsheet_daq acquire --config config/microscope.toml --features features.json
//! ```
//!
//! Waveform summary:
//! ```bash
//! lightsheet_daq waveforms --config config/microscope.toml
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lightsheet_daq::config::Settings;
use lightsheet_daq::features::{FeatureRegistry, FeatureSpec};
use lightsheet_daq::logging;
use lightsheet_daq::microscope::Microscope;
use lightsheet_daq::sink::{DataSink, JsonLinesSink, MemorySink};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "lightsheet_daq")]
#[command(about = "Light-sheet acquisition engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition
    Acquire {
        /// Configuration file
        #[arg(long, default_value = "config/microscope.toml")]
        config: PathBuf,

        /// Built-in acquisition mode (ignored when --features is given)
        #[arg(long, value_enum, default_value_t = Mode::ZStack)]
        mode: Mode,

        /// Repetitions for the snap mode
        #[arg(long, default_value_t = 1)]
        steps: u64,

        /// JSON feature list
        #[arg(long)]
        features: Option<PathBuf>,

        /// Write frame metadata as JSON lines
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the waveforms computed for the selected channels
    Waveforms {
        /// Configuration file
        #[arg(long, default_value = "config/microscope.toml")]
        config: PathBuf,
    },

    /// Load and validate a configuration file
    ValidateConfig {
        /// Configuration file
        #[arg(long, default_value = "config/microscope.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Z-stack over every position
    ZStack,
    /// One frame per selected channel, repeated `--steps` times
    Snap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Acquire {
            config,
            mode,
            steps,
            features,
            output,
        } => acquire(&config, mode, steps, features.as_deref(), output.as_deref()).await,
        Commands::Waveforms { config } => print_waveforms(&config).await,
        Commands::ValidateConfig { config } => validate(&config),
    }
}

fn load(path: &Path) -> Result<Arc<Settings>> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
    Ok(Arc::new(settings))
}

fn feature_list(mode: Mode, steps: u64, path: Option<&Path>) -> Result<Vec<FeatureSpec>> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature list {}", path.display()))?;
        return serde_json::from_str(&content).context("Invalid feature list");
    }
    Ok(match mode {
        Mode::ZStack => vec![FeatureSpec::node("ZStackAcquisition")],
        Mode::Snap => vec![FeatureSpec::looped(vec![
            FeatureSpec::node("PrepareNextChannel"),
            FeatureSpec::node("Snap"),
            FeatureSpec::node_with("LoopByCount", json!({ "steps": steps })),
        ])],
    })
}

async fn acquire(
    config: &Path,
    mode: Mode,
    steps: u64,
    features: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let settings = load(config)?;
    let features = feature_list(mode, steps, features)?;
    let mut scope = Microscope::connect(settings).await?;

    let abort = scope.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current frame");
            abort.abort();
        }
    });

    let sink: Box<dyn DataSink> = match output {
        Some(path) => Box::new(JsonLinesSink::create(path)?),
        None => Box::new(MemorySink::new()),
    };
    let report = scope
        .run_acquisition(&features, &FeatureRegistry::with_builtins(), sink)
        .await?;

    println!("Acquisition {} finished", report.id);
    println!("  frames triggered: {}", report.frames_triggered);
    println!("  frames written:   {}", report.frames_written);
    println!("  channel changes:  {:?}", report.channel_changes());
    println!("  elapsed:          {} ms", report.elapsed().num_milliseconds());
    Ok(())
}

async fn print_waveforms(config: &Path) -> Result<()> {
    let settings = load(config)?;
    let mut scope = Microscope::connect(settings).await?;
    let (exposures, sweeps) = scope.calculate_exposure_sweep_times();
    let waveforms = scope.calculate_all_waveforms()?;

    for channel in waveforms.channels().collect::<Vec<_>>() {
        println!(
            "Channel {channel}: exposure {:.4} s, sweep {:.4} s",
            exposures.get(&channel).copied().unwrap_or_default(),
            sweeps.get(&channel).copied().unwrap_or_default()
        );
        for waveform in waveforms.for_channel(channel) {
            println!(
                "  {:<14} {:>7} samples  peak {:>7.3} V  in range: {}",
                waveform.signal.to_string(),
                waveform.len(),
                waveform.peak().unwrap_or_default(),
                waveform.is_within_bounds()
            );
        }
    }
    Ok(())
}

fn validate(config: &Path) -> Result<()> {
    let settings = Settings::load_from(config)
        .with_context(|| format!("Failed to load configuration from {}", config.display()))?;
    settings.validate_all()?;
    let selected: Vec<usize> = settings
        .experiment
        .channels
        .iter()
        .filter(|c| c.is_selected)
        .map(|c| c.id)
        .collect();
    println!("{} is valid", config.display());
    println!("  selected channels: {selected:?}");
    println!("  z-steps: {}", settings.experiment.z_stack.number_z_steps);
    Ok(())
}
