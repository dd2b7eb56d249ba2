//! Configuration management for Auscult
//!
//! This module provides:
//! - The TOML configuration layout and its factory defaults
//! - Validation and conversion to the engine's initial [`Settings`]
//! - A manager that locates, loads and saves the user config file

use crate::domain::settings::{MainsFrequency, Settings};
use crate::domain::waveform::WaveformHistory;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Longest display history accepted from a config file
pub const MAX_HISTORY_SECONDS: usize = 3600;

/// Highest display refresh rate accepted from a config file
pub const MAX_SAMPLES_PER_SECOND: usize = 1000;

/// Largest envelope queue accepted from a config file
pub const MAX_ENVELOPE_QUEUE_CAPACITY: usize = 65_536;

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

/// Filter band configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Keep the 150-400 Hz murmur band
    pub include_murmurs: bool,
    /// Mains frequency to notch out (50 or 60)
    pub mains_frequency_hz: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_murmurs: false,
            mains_frequency_hz: MainsFrequency::Hz50.hz(),
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// First sample rate tried during negotiation
    pub preferred_sample_rate_hz: u32,
    /// Input device name (None = platform default)
    pub input_device: Option<String>,
    /// Envelope values buffered for the display before dropping
    pub envelope_queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            preferred_sample_rate_hz: Settings::default().preferred_sample_rate_hz,
            input_device: None,
            envelope_queue_capacity: 64,
        }
    }
}

/// Gain slider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GainConfig {
    /// Slider position in `[0, 1]`, mapped exponentially to 1x..50x
    pub position: f32,
}

/// Waveform display configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub history_seconds: usize,
    pub samples_per_second: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            history_seconds: WaveformHistory::DEFAULT_SECONDS,
            samples_per_second: WaveformHistory::DEFAULT_SAMPLES_PER_SECOND,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuscultConfig {
    pub filter: FilterConfig,
    pub audio: AudioConfig,
    pub gain: GainConfig,
    pub display: DisplayConfig,
}

impl AuscultConfig {
    /// Load configuration from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).await?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path.as_ref(), content).await?;
        info!(path = %path.as_ref().display(), "Saved configuration");
        Ok(())
    }

    /// Validated, pretty-printed TOML
    pub fn to_toml_string(&self) -> Result<String> {
        self.validate()?;
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if MainsFrequency::try_from(self.filter.mains_frequency_hz).is_err() {
            return Err(ConfigError::Invalid(format!(
                "mains_frequency_hz must be 50 or 60, got {}",
                self.filter.mains_frequency_hz
            )));
        }

        if self.audio.preferred_sample_rate_hz == 0 {
            return Err(ConfigError::Invalid(
                "preferred_sample_rate_hz must be positive".to_string(),
            ));
        }

        if !(1..=MAX_ENVELOPE_QUEUE_CAPACITY).contains(&self.audio.envelope_queue_capacity) {
            return Err(ConfigError::Invalid(format!(
                "envelope_queue_capacity must be within [1, {}], got {}",
                MAX_ENVELOPE_QUEUE_CAPACITY, self.audio.envelope_queue_capacity
            )));
        }

        if !(0.0..=1.0).contains(&self.gain.position) {
            return Err(ConfigError::Invalid(format!(
                "gain position must be within [0, 1], got {}",
                self.gain.position
            )));
        }

        if !(1..=MAX_HISTORY_SECONDS).contains(&self.display.history_seconds) {
            return Err(ConfigError::Invalid(format!(
                "history_seconds must be within [1, {}], got {}",
                MAX_HISTORY_SECONDS, self.display.history_seconds
            )));
        }

        if !(1..=MAX_SAMPLES_PER_SECOND).contains(&self.display.samples_per_second) {
            return Err(ConfigError::Invalid(format!(
                "samples_per_second must be within [1, {}], got {}",
                MAX_SAMPLES_PER_SECOND, self.display.samples_per_second
            )));
        }

        Ok(())
    }

    /// Initial engine settings described by this configuration
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default()
            .with_murmurs(self.filter.include_murmurs)
            .with_gain_position(self.gain.position)
            .with_preferred_sample_rate(self.audio.preferred_sample_rate_hz);
        settings.mains_frequency_hz = self.filter.mains_frequency_hz;
        settings
    }

    /// Empty waveform history sized for the display section
    pub fn waveform_history(&self) -> WaveformHistory {
        WaveformHistory::with_window(
            self.display.history_seconds,
            self.display.samples_per_second,
        )
    }
}

/// Locates and persists the user configuration file
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    const FILE_NAME: &'static str = "config.toml";

    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join(Self::FILE_NAME);
        Self {
            config_dir,
            config_path,
        }
    }

    /// Manager for an explicit file path
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

    /// Platform config directory, e.g. `~/.config/auscult`
    pub fn default_config_dir() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            ConfigError::Invalid("Could not determine config directory".to_string())
        })?;
        Ok(base.join("auscult"))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, returns factory default.
    /// If the config file is corrupt, backs it up and returns factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> AuscultConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, using factory default"
            );
            return AuscultConfig::default();
        }

        match AuscultConfig::load_from_file(&self.config_path).await {
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

                AuscultConfig::default()
            }
        }
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &AuscultConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
