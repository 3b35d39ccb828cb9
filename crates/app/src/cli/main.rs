//! Minstrel CLI Application

mod ipc;

use anyhow::{bail, Context};
use clap::Parser;
use minstrel_core::domain::config::{ConfigManager, EqualizerConfig};
use minstrel_core::domain::dsp::BAND_COUNT;
use minstrel_core::domain::gains::parse_gain_update;
use minstrel_core::BAND_FREQUENCIES;
use minstrel_infra::audio::{
    CaptureSettings, CpalEnumerator, EqualizerProcessor, ProcessorEvent, SystemBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minstrel")]
#[command(about = "A real-time ten-band system equalizer", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ~/.config/minstrel/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Initial gains in dB, ten values separated by commas or spaces, or a JSON array
    #[arg(short, long, allow_hyphen_values = true)]
    gains: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Do not start the gain-update listener
    #[arg(long)]
    no_ipc: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if cli.list_devices {
        return list_devices();
    }

    info!("Minstrel starting...");

    let manager = match &cli.config {
        Some(path) => ConfigManager::for_file(path.clone()),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };
    let mut config = manager.load().await;

    if let Some(gains) = &cli.gains {
        config.equalizer.gains = parse_gains_arg(gains)?.to_vec();
    }
    log_config(&config);

    let backend = Arc::new(SystemBackend::new(
        CaptureSettings::from(&config.capture),
        config.output.buffer_frames as usize,
    ));
    let processor = Arc::new(EqualizerProcessor::from_config(&config, backend));
    let events = processor.subscribe();

    let start = Arc::clone(&processor);
    let started = tokio::task::spawn_blocking(move || start.start()).await?;
    if !started {
        bail!(
            "failed to start audio: {}",
            processor.last_error().unwrap_or_default()
        );
    }

    let ipc_task = if config.ipc.enabled && !cli.no_ipc {
        match ipc::bind(&config.ipc.host, config.ipc.port).await {
            Ok(listener) => Some(tokio::spawn(ipc::serve(listener, processor.gain_control()))),
            Err(e) => {
                warn!(
                    host = %config.ipc.host,
                    port = config.ipc.port,
                    error = %e,
                    "Gain-update listener unavailable"
                );
                None
            }
        }
    } else {
        None
    };

    // Wait for Ctrl-C or for the processor to stop on its own.
    let mut watcher = tokio::task::spawn_blocking(move || {
        for event in events.iter() {
            match event {
                ProcessorEvent::Started => info!("Audio started"),
                ProcessorEvent::Error(message) => error!(%message, "Audio error"),
                ProcessorEvent::Stopped => {
                    info!("Audio stopped");
                    return;
                }
            }
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Shutting down...");
        }
        _ = &mut watcher => {}
    }

    if let Some(task) = ipc_task {
        task.abort();
    }

    let stop = Arc::clone(&processor);
    tokio::task::spawn_blocking(move || stop.stop()).await?;

    let failure = processor.last_error();
    if let Some(message) = failure {
        bail!("audio stopped: {}", message);
    }

    info!("Minstrel stopped");
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalEnumerator::new().output_devices()?;
    if devices.is_empty() {
        println!("No output devices found");
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("{}{}", device.name, marker);
    }
    Ok(())
}

/// Accept `[0, 3, ...]`, `0,3,...` or `0 3 ...`
fn parse_gains_arg(arg: &str) -> anyhow::Result<[f64; BAND_COUNT]> {
    if arg.trim_start().starts_with('[') {
        return parse_gain_update(arg).context("invalid --gains");
    }

    let values = arg
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().with_context(|| format!("invalid gain {:?}", s)))
        .collect::<anyhow::Result<Vec<f64>>>()?;

    values
        .try_into()
        .map_err(|v: Vec<f64>| anyhow::anyhow!("--gains needs {} values, got {}", BAND_COUNT, v.len()))
}

fn log_config(config: &EqualizerConfig) {
    info!(
        sample_rate = config.audio.sample_rate,
        channels = config.audio.channels,
        monitor = %config.capture.monitor_source,
        output = %config.output.device_keyword,
        prebuffer_ms = config.pipeline.prebuffer_ms,
        overflow = ?config.pipeline.overflow,
        "Configuration"
    );
    for (freq, gain) in BAND_FREQUENCIES.iter().zip(&config.equalizer.gains) {
        debug!(freq_hz = freq, gain_db = gain, "Band");
    }
}
