//! Configuration management for scene-partner-rs.
//!
//! Loads config from YAML files in standard locations. Every section
//! falls back to defaults field by field, so a partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_size: 1024,
        }
    }
}

/// Turn-taking pacing and bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RehearsalConfig {
    pub countdown_step_ms: u64,
    pub go_pause_ms: u64,
    pub cue_timeout_secs: f64,
    pub lookahead: usize,
}

impl Default for RehearsalConfig {
    fn default() -> Self {
        Self {
            countdown_step_ms: 800,
            go_pause_ms: 600,
            cue_timeout_secs: DEFAULT_CUE_TIMEOUT_SECS,
            lookahead: 5,
        }
    }
}

const DEFAULT_CUE_TIMEOUT_SECS: f64 = 15.0;

impl RehearsalConfig {
    pub fn countdown_step(&self) -> Duration {
        Duration::from_millis(self.countdown_step_ms)
    }

    pub fn go_pause(&self) -> Duration {
        Duration::from_millis(self.go_pause_ms)
    }

    pub fn cue_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.cue_timeout_secs).unwrap_or_else(|_| {
            tracing::warn!(
                "cue_timeout_secs {} is not a usable duration, using {}s",
                self.cue_timeout_secs,
                DEFAULT_CUE_TIMEOUT_SECS
            );
            Duration::from_secs_f64(DEFAULT_CUE_TIMEOUT_SECS)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub endpoint: String,
    /// Environment variable holding an optional API key for the endpoint.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000/api/generate-audio".into(),
            api_key_env: "SCENE_PARTNER_TTS_KEY".into(),
            timeout_secs: 30,
        }
    }
}

/// Which speech-capture mechanism feeds the cue listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackendKind {
    /// On-device continuous recognition (whisper.cpp).
    Local,
    /// Microphone PCM streamed to a remote realtime transcription service.
    #[default]
    Streaming,
    /// No capture; every user line auto-advances.
    None,
}

impl std::fmt::Display for CaptureBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Streaming => write!(f, "streaming"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub model: String,
    pub language: String,
    /// Seconds of trailing audio fed to each recognition pass.
    pub window_secs: f64,
    /// Pause between recognition passes.
    pub interval_ms: u64,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "base.en".into(),
            language: "en".into(),
            window_secs: 4.0,
            interval_ms: 700,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub token_url: String,
    pub ws_url: String,
    pub api_key_env: String,
    pub token_expires_in: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            token_url: "https://api.assemblyai.com/v2/realtime/token".into(),
            ws_url: "wss://api.assemblyai.com/v2/realtime/ws".into(),
            api_key_env: "ASSEMBLYAI_API_KEY".into(),
            token_expires_in: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub rehearsal: RehearsalConfig,
    pub synthesis: SynthesisConfig,
    pub capture: CaptureConfig,
    pub whisper: WhisperConfig,
    pub streaming: StreamingConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/scene-partner/config.yaml
    /// 3. /etc/scene-partner/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/scene-partner/config.yaml")),
                Some(PathBuf::from("/etc/scene-partner/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
