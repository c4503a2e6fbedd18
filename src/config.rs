use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TokiError};

fn default_server_url() -> String {
    "ws://127.0.0.1:8000/voice/ws/live-lecture".to_string()
}

const fn default_grade_level() -> u32 {
    5
}

fn default_education_level() -> String {
    "primary".to_string()
}

const fn default_frame_samples() -> usize {
    4096
}

const fn default_vad_threshold() -> f32 {
    0.01
}

const fn default_silence_ms() -> u64 {
    1500
}

const fn default_true() -> bool {
    true
}

const fn default_fallback_delay_ms() -> u64 {
    2000
}

fn default_fallback_command() -> String {
    "espeak-ng".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub learner: LearnerConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// WebSocket endpoint of the live tutoring service.
    #[serde(default = "default_server_url")]
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
        }
    }
}

/// Learner profile sent as connection metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LearnerConfig {
    #[serde(default = "default_grade_level")]
    pub grade_level: u32,

    #[serde(default = "default_education_level")]
    pub education_level: String,

    pub field_of_study: Option<String>,

    #[serde(default)]
    pub subjects: Vec<String>,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            grade_level: default_grade_level(),
            education_level: default_education_level(),
            field_of_study: None,
            subjects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_device: Option<String>,

    pub output_device: Option<String>,

    #[serde(default = "default_frame_samples")]
    pub frame_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            frame_samples: default_frame_samples(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadConfig {
    /// Peak amplitude above which a frame counts as speech.
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            silence_ms: default_silence_ms(),
        }
    }
}

impl VadConfig {
    #[must_use]
    pub const fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long tutor text may wait for its audio before it is spoken locally.
    #[serde(default = "default_fallback_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_fallback_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_fallback_delay_ms(),
            command: default_fallback_command(),
            args: Vec::new(),
        }
    }
}

impl FallbackConfig {
    /// Fallback delay, or `None` when local fallback speech is disabled.
    #[must_use]
    pub const fn delay(&self) -> Option<Duration> {
        if self.enabled {
            Some(Duration::from_millis(self.delay_ms))
        } else {
            None
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TokiError::Config(format!(
                "config file not found: {}; create it or use --config to specify a path",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            TokiError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            TokiError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.audio.frame_samples == 0 {
            return Err(TokiError::Config(
                "audio.frame_samples must be greater than zero".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.vad.threshold) {
            return Err(TokiError::Config(format!(
                "vad.threshold must be in [0, 1), got {}",
                self.vad.threshold
            )));
        }

        if self.fallback.enabled && self.fallback.command.trim().is_empty() {
            return Err(TokiError::Config(
                "fallback.command must be set when fallback is enabled".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("toki/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }
}
