//! Configuration management for Minstrel
//!
//! This module provides:
//! - Configuration structs for the audio format, capture, output and pipeline
//! - TOML load/save
//! - A manager for the main config file with factory-default recovery

use crate::domain::audio::AudioFormat;
use crate::domain::dsp::{BAND_COUNT, BAND_FREQUENCIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// External capture process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Program streaming raw PCM to stdout
    pub program: String,

    /// Monitor source to record from
    pub monitor_source: String,

    /// Max wait for the process to come up
    pub startup_timeout_ms: u64,

    /// Max wait for graceful termination before killing
    pub shutdown_timeout_ms: u64,

    /// Frames per read from the process pipe
    pub read_block_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: "parec".to_string(),
            monitor_source: "Equalizer_Input.monitor".to_string(),
            startup_timeout_ms: 2000,
            shutdown_timeout_ms: 1000,
            read_block_frames: 1024,
        }
    }
}

impl CaptureConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Output device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Preferred device, matched as a case-insensitive substring of its name
    pub device_keyword: String,

    /// Frames buffered between blocking writes and the device callback
    pub buffer_frames: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device_keyword: "Equalizer_Output".to_string(),
            buffer_frames: 8192,
        }
    }
}

/// When the writer holds audio back until the prebuffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrebufferMode {
    /// Every write waits for a full prebuffer
    #[default]
    EveryWrite,
    /// Only the first write of a session waits
    Startup,
}

/// What the reader does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued chunks to make room
    #[default]
    DropOldest,
    /// Discard the incoming chunk
    DropNewest,
    /// Wait for the writer to make room
    Block,
}

/// Reader/writer buffering settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Audio accumulated before a write is issued
    pub prebuffer_ms: u64,
    pub prebuffer_mode: PrebufferMode,

    /// Queue capacity between reader and writer
    pub queue_capacity_ms: u64,
    pub overflow: OverflowPolicy,

    /// Upper bound on how long either loop waits before rechecking state
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prebuffer_ms: 1000,
            prebuffer_mode: PrebufferMode::EveryWrite,
            queue_capacity_ms: 5000,
            overflow: OverflowPolicy::DropOldest,
            poll_interval_ms: 5,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Initial equalizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerSettings {
    pub gains: Vec<f64>,
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self {
            gains: vec![0.0; BAND_COUNT],
        }
    }
}

/// Gain-update listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 5560,
        }
    }
}

/// Complete Minstrel configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerConfig {
    pub audio: AudioFormat,
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
    pub equalizer: EqualizerSettings,
    pub ipc: IpcConfig,
}

impl EqualizerConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.audio
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.capture.program.trim().is_empty() {
            return Err(ConfigError::Invalid("capture.program is empty".to_string()));
        }
        if self.capture.startup_timeout_ms == 0 || self.capture.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture timeouts must be greater than zero".to_string(),
            ));
        }
        if self.capture.read_block_frames == 0 || self.output.buffer_frames == 0 {
            return Err(ConfigError::Invalid(
                "block and buffer sizes must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.queue_capacity_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity_ms must be greater than zero".to_string(),
            ));
        }
        if self.equalizer.gains.len() != BAND_COUNT {
            return Err(ConfigError::Invalid(format!(
                "equalizer.gains needs {} values ({:?} Hz), got {}",
                BAND_COUNT,
                BAND_FREQUENCIES,
                self.equalizer.gains.len()
            )));
        }

        Ok(())
    }

    /// Initial gain vector; zero-filled if the stored one is malformed
    pub fn initial_gains(&self) -> [f64; BAND_COUNT] {
        let mut gains = [0.0; BAND_COUNT];
        if self.equalizer.gains.len() == BAND_COUNT {
            gains.copy_from_slice(&self.equalizer.gains);
        }
        gains
    }
}

/// Configuration manager for the main Minstrel config
///
/// Manages the main configuration file at `~/.config/minstrel/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a manager for `config_dir/config.toml`
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// Create a manager for an explicit config file path
    pub fn for_file(config_path: PathBuf) -> Self {
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/minstrel` on Linux, the platform equivalent elsewhere.
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("minstrel"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    /// Get the config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, writes and returns the factory default.
    /// If the config file is corrupt, backs it up and returns the factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> EqualizerConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = EqualizerConfig::default();

            if let Err(e) = self.save(&config).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match EqualizerConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                EqualizerConfig::default()
            }
        }
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &EqualizerConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;

        config.save_to_file(&self.config_path).await
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
