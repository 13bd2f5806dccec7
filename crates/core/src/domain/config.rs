//! Configuration management for fxrack
//!
//! This module provides:
//! - Engine settings (rate, period, auto-quit policy, resampler backend)
//! - The persisted description of an effect chain
//! - TOML load/save and a manager for the default config location

use crate::domain::audio::{MixerContext, SampleRate};
use crate::domain::dsp::{AmplifierParams, AnalyzerParams, EffectKind, FilterParams, FilterShape};
use crate::domain::gate::GateConfig;
use crate::domain::run_state::RunStateMachine;
use crate::domain::runtime::DEFAULT_AUTO_QUIT_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
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

/// Rate converter used for effects that run at their own rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplerQuality {
    /// Linear interpolation, no latency
    #[default]
    Linear,
    /// Windowed sinc, better stopband at the cost of latency
    Sinc,
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Processing sample rate in Hz
    pub sample_rate: u32,

    /// Frames per audio block
    pub frames_per_period: usize,

    /// Never stop effects after sustained silence
    pub disable_auto_quit: bool,

    /// Silence level for auto-quit and wake-up
    ///
    /// A block whose output RMS is at or below it counts towards auto-quit;
    /// an idle effect wakes when its input peak rises above it.
    pub silence_threshold: f32,

    /// Capacity of the state-change event channel
    pub event_capacity: usize,

    pub resampler_quality: ResamplerQuality,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            frames_per_period: 256,
            disable_auto_quit: false,
            silence_threshold: RunStateMachine::DEFAULT_SILENCE_THRESHOLD,
            event_capacity: 256,
            resampler_quality: ResamplerQuality::Linear,
        }
    }
}

impl EngineSettings {
    pub fn mixer_context(&self) -> MixerContext {
        MixerContext::new(SampleRate::from_hz(self.sample_rate), self.frames_per_period)
    }
}

/// Persisted per-effect attributes
///
/// Run state and gate state are runtime-only and never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EffectSettings {
    pub enabled: bool,

    /// Wet level in `[0, 1]`
    pub wet: f32,

    /// Gate open threshold (RMS); 0 disables the gate
    pub gate_open: f32,

    /// Gate close threshold (RMS)
    pub gate_close: f32,

    /// Blocks below the close threshold before the gate closes
    pub gate_hold_blocks: u32,

    /// Silence before the effect idles out
    pub auto_quit_ms: u32,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            wet: 1.0,
            gate_open: 0.0,
            gate_close: 0.0,
            gate_hold_blocks: 8,
            auto_quit_ms: DEFAULT_AUTO_QUIT_MS,
        }
    }
}

impl EffectSettings {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig::with_thresholds(self.gate_open, self.gate_close, self.gate_hold_blocks)
    }
}

/// One slot of the chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectConfig {
    pub kind: EffectKind,
    #[serde(default)]
    pub settings: EffectSettings,
}

/// Ordered list of effects
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChainConfig {
    #[serde(default)]
    pub effects: Vec<EffectConfig>,
}

/// Complete fxrack configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub chain: ChainConfig,
}

impl EngineConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!(effects = config.chain.effects.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rate must be non-zero".to_string()));
        }
        if engine.frames_per_period == 0 {
            return Err(ConfigError::Invalid("frames per period must be non-zero".to_string()));
        }
        if !(engine.silence_threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "silence threshold {} must be non-negative",
                engine.silence_threshold
            )));
        }

        for (index, effect) in self.chain.effects.iter().enumerate() {
            let settings = &effect.settings;
            if !(0.0..=1.0).contains(&settings.wet) {
                return Err(ConfigError::Invalid(format!(
                    "effect {index} ({}): wet {} must be in [0, 1]",
                    effect.kind.name(),
                    settings.wet
                )));
            }
            settings.gate_config().validate().map_err(|e| {
                ConfigError::Invalid(format!("effect {index} ({}): {e}", effect.kind.name()))
            })?;
            effect.kind.validate().map_err(|e| {
                ConfigError::Invalid(format!("effect {index} ({}): {e}", effect.kind.name()))
            })?;
        }
        Ok(())
    }

    /// Default chain: a gated low shelf at half rate, an amplifier and a meter
    pub fn factory_default() -> Self {
        let mut config = Self::default();

        config.chain.effects.push(EffectConfig {
            kind: EffectKind::Filter(FilterParams {
                shape: FilterShape::LowShelf,
                frequency: 200.0,
                gain_db: 6.0,
                q: 0.707,
                internal_rate: Some(24000),
            }),
            settings: EffectSettings {
                gate_open: 0.01,
                gate_close: 0.005,
                ..EffectSettings::default()
            },
        });

        config.chain.effects.push(EffectConfig {
            kind: EffectKind::Amplifier(AmplifierParams {
                gain: 0.8,
                ..AmplifierParams::default()
            }),
            settings: EffectSettings {
                wet: 0.75,
                auto_quit_ms: 500,
                ..EffectSettings::default()
            },
        });

        config.chain.effects.push(EffectConfig {
            kind: EffectKind::Analyzer(AnalyzerParams::default()),
            settings: EffectSettings::default(),
        });

        config
    }
}

/// Configuration manager for the main fxrack config
///
/// Manages the configuration file at `~/.config/fxrack/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/fxrack` on Linux, the platform config dir elsewhere.
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("fxrack"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, writes and returns the factory default.
    /// If the config file is corrupt, backs it up and returns the factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> EngineConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = EngineConfig::factory_default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }
            return config;
        }

        match EngineConfig::load_from_file(&self.config_path).await {
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

                EngineConfig::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &EngineConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
