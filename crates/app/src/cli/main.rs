//! Auscult CLI Application
//!
//! Drives the processing engine the way a listening session would: starts it,
//! feeds published envelope values into a waveform history, and accepts live
//! commands on stdin until told to quit.

mod commands;
mod meter;

use anyhow::Context;
use auscult_core::domain::audio::{AudioBackend, DeviceId};
use auscult_core::domain::config::{AuscultConfig, ConfigManager};
use auscult_core::domain::settings::MainsFrequency;
use auscult_core::domain::waveform::WaveformHistory;
use auscult_infra::audio::{AuscultEngine, CpalBackend};
use clap::{Args, Parser, Subcommand};
use commands::{Command, HELP};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "auscult")]
#[command(about = "Real-time auscultation filter and envelope monitor", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio input devices
    Devices {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Capture, filter and play back until quit
    Run(RunArgs),
    /// Print the effective configuration as TOML
    Config {
        /// Config file (defaults to the user config)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Write the printed configuration back to the file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Config file (defaults to the user config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extend the pass band to 400 Hz
    #[arg(long)]
    murmurs: bool,

    /// Mains frequency to notch out
    #[arg(long, value_parser = parse_mains)]
    mains: Option<MainsFrequency>,

    /// Gain slider position in [0, 1]
    #[arg(long)]
    gain: Option<f32>,

    /// Preferred sample rate in Hz
    #[arg(long)]
    rate: Option<u32>,

    /// Input device name
    #[arg(long)]
    device: Option<String>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
}

impl RunArgs {
    fn apply(&self, config: &mut AuscultConfig) {
        if self.murmurs {
            config.filter.include_murmurs = true;
        }
        if let Some(mains) = self.mains {
            config.filter.mains_frequency_hz = mains.hz();
        }
        if let Some(position) = self.gain {
            config.gain.position = position;
        }
        if let Some(rate) = self.rate {
            config.audio.preferred_sample_rate_hz = rate;
        }
        if let Some(device) = &self.device {
            config.audio.input_device = Some(device.clone());
        }
    }
}

fn parse_mains(value: &str) -> Result<MainsFrequency, String> {
    let hz: u32 = value
        .parse()
        .map_err(|_| format!("'{}' is not a frequency", value))?;
    MainsFrequency::try_from(hz).map_err(|hz| format!("mains must be 50 or 60, got {}", hz))
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_manager(path: Option<PathBuf>) -> anyhow::Result<ConfigManager> {
    Ok(match path {
        Some(path) => ConfigManager::for_file(path),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Devices { json } => list_devices(json),
        Commands::Run(args) => run(args).await,
        Commands::Config { path, save } => show_config(path, save).await,
    }
}

fn list_devices(json: bool) -> anyhow::Result<()> {
    let devices = CpalBackend::new()
        .input_devices()
        .context("Failed to enumerate input devices")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No input devices found");
    }
    for device in &devices {
        let marker = if device.is_default { "*" } else { " " };
        match (device.min_sample_rate, device.max_sample_rate) {
            (Some(min), Some(max)) => println!("{} {} ({}-{} Hz)", marker, device.name, min, max),
            _ => println!("{} {}", marker, device.name),
        }
    }
    Ok(())
}

async fn show_config(path: Option<PathBuf>, save: bool) -> anyhow::Result<()> {
    let manager = config_manager(path)?;
    let config = manager.load().await;

    println!("# {}", manager.config_path().display());
    print!("{}", config.to_toml_string()?);

    if save {
        manager.save(&config).await?;
        info!("Wrote {}", manager.config_path().display());
    }
    Ok(())
}

/// Pin the capture stream to the named device, if it exists
fn install_device_provider(engine: &AuscultEngine, backend: &dyn AudioBackend, name: &str) {
    let known = match backend.input_devices() {
        Ok(devices) => devices.into_iter().any(|d| d.name == name),
        Err(e) => {
            warn!("Could not list input devices: {}", e);
            false
        }
    };

    if !known {
        warn!("Input device '{}' not found, using the default", name);
        return;
    }

    let id = DeviceId::new(name);
    engine.set_preferred_input_device_provider(move || Some(id.clone()));
    info!("Preferred input device: {}", name);
}

async fn start_engine(engine: &Arc<AuscultEngine>) -> anyhow::Result<bool> {
    let engine = Arc::clone(engine);
    let started = tokio::task::spawn_blocking(move || engine.start()).await?;
    if !started {
        warn!("No audio pipeline could be opened; use 'start' to retry");
    }
    Ok(started)
}

async fn stop_engine(engine: &Arc<AuscultEngine>) -> anyhow::Result<()> {
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || engine.stop()).await?;
    Ok(())
}

fn print_status(engine: &AuscultEngine) {
    let settings = engine.current_settings();
    let pipeline = engine
        .pipeline_info()
        .map(|p| format!("{} Hz / {} frames", p.sample_rate_hz, p.buffer_frames))
        .unwrap_or_else(|| "none".to_string());

    println!(
        "state: {} | pipeline: {} | muted: {}",
        engine.state(),
        pipeline,
        engine.is_muted()
    );
    println!(
        "gain: x{:.2} (position {:.2}) | mains: {} Hz | murmurs: {} | preferred rate: {} Hz",
        settings.gain_multiplier(),
        settings.gain_position(),
        settings.mains_frequency_hz,
        if settings.include_murmurs { "on" } else { "off" },
        settings.preferred_sample_rate_hz
    );
    println!(
        "envelope: {} published, {} dropped",
        engine.published_envelopes(),
        engine.dropped_envelopes()
    );
}

fn print_meter(engine: &AuscultEngine, history: &WaveformHistory, per_second: usize) {
    if !engine.is_running() {
        return;
    }
    let peak = meter::recent_peak(history, per_second);
    println!(
        "{} {:.3}{}",
        meter::render_bar(peak, meter::METER_WIDTH),
        peak,
        if engine.is_muted() { " (muted)" } else { "" }
    );
}

/// Apply one stdin command. Returns false when the session should end.
async fn handle_command(engine: &Arc<AuscultEngine>, command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Mute => engine.set_muted(true),
        Command::Unmute => engine.set_muted(false),
        Command::Gain(position) => {
            let settings = engine.update_settings(|s| s.with_gain_position(position));
            println!("gain x{:.2}", settings.gain_multiplier());
        }
        Command::Mains(mains) => {
            engine.update_settings(|s| s.with_mains(mains));
        }
        Command::Murmurs(enabled) => {
            engine.update_settings(|s| s.with_murmurs(enabled));
        }
        Command::Status => print_status(engine),
        Command::Stop => stop_engine(engine).await?,
        Command::Start => {
            start_engine(engine).await?;
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let manager = config_manager(args.config.clone())?;
    let mut config = manager.load().await;
    args.apply(&mut config);
    config.validate().context("Invalid run options")?;

    let backend: Arc<dyn AudioBackend> = Arc::new(CpalBackend::new());
    let engine = Arc::new(AuscultEngine::with_envelope_capacity(
        Arc::clone(&backend),
        config.settings(),
        config.audio.envelope_queue_capacity,
    ));

    if let Some(name) = &config.audio.input_device {
        install_device_provider(&engine, backend.as_ref(), name);
    }

    let envelopes = engine.envelope_receiver();
    let mut history = config.waveform_history();
    let per_second = config.display.samples_per_second;

    info!("🩺 Auscult starting (type 'help' for commands)");
    start_engine(&engine).await?;

    let mut drain = tokio::time::interval(Duration::from_millis(40));
    let mut meter_tick = tokio::time::interval(Duration::from_secs(1));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let deadline = async {
        match args.duration {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = drain.tick() => history.extend(envelopes.try_iter()),
            _ = meter_tick.tick() => print_meter(&engine, &history, per_second),
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<Command>() {
                    Ok(command) => {
                        if !handle_command(&engine, command).await? {
                            break;
                        }
                    }
                    Err(e) => println!("{}", e),
                },
                None => stdin_open = false,
            },
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("Session duration reached");
                break;
            }
        }
    }

    stop_engine(&engine).await?;
    info!(
        "Session ended: {} envelope values ({} dropped)",
        engine.published_envelopes(),
        engine.dropped_envelopes()
    );
    Ok(())
}
