use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{AnalyserConfig, MonitorConfig};
use crate::conversation::{find_persona, Persona};

pub const APP_DIR_NAME: &str = "voice-turn-agent";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Headroom in the reply budget for saving a completed conversation.
const RECORD_WRITE_ALLOWANCE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to create config directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Endpointing and turn timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Samples per analysis window. Must be a power of two.
    pub fft_window_size: usize,

    /// Mean byte-spectrum level (0-255) above which a tick counts as speech.
    pub energy_threshold: f32,

    /// Silence longer than this ends the turn.
    pub silence_hold_ms: u64,

    /// How often the silence monitor samples the analyser.
    pub poll_interval_ms: u64,

    /// Hard cap on a single listening turn.
    pub max_listen_secs: u64,

    /// Pause between the end of playback and reopening the microphone, so the
    /// reply's tail is not captured as the next utterance.
    pub settle_delay_ms: u64,

    pub min_decibels: f32,
    pub max_decibels: f32,

    /// Temporal smoothing of the spectrum (0 = none).
    pub smoothing: f32,

    pub transcription_timeout_secs: u64,
    /// Bound on the model call alone.
    pub generation_timeout_secs: u64,
    /// Bound on speech synthesis of one reply.
    pub synthesis_timeout_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        let analyser = AnalyserConfig::default();
        Self {
            fft_window_size: analyser.fft_size,
            energy_threshold: 15.0,
            silence_hold_ms: 1200,
            poll_interval_ms: 16,
            max_listen_secs: 120,
            settle_delay_ms: 500,
            min_decibels: analyser.min_decibels,
            max_decibels: analyser.max_decibels,
            smoothing: analyser.smoothing,
            transcription_timeout_secs: 60,
            generation_timeout_secs: 30,
            synthesis_timeout_secs: 30,
        }
    }
}

impl TurnConfig {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            analyser: AnalyserConfig {
                fft_size: self.fft_window_size,
                min_decibels: self.min_decibels,
                max_decibels: self.max_decibels,
                smoothing: self.smoothing,
            },
            energy_threshold: self.energy_threshold,
            silence_hold: Duration::from_millis(self.silence_hold_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            max_listen: Duration::from_secs(self.max_listen_secs),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    /// Budget for a whole reply as seen by the turn controller: the model
    /// call, the record write and synthesis, each with its own bound.
    pub fn reply_timeout(&self) -> Duration {
        self.generation_timeout() + self.synthesis_timeout() + RECORD_WRITE_ALLOWANCE
    }
}

/// Provider endpoints and models. API keys never live here; they come from
/// the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub assemblyai_upload_url: String,
    pub assemblyai_transcript_url: String,
    pub transcript_poll_ms: u64,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub murf_tts_url: String,
    pub murf_model: String,
    pub murf_locale: String,
    pub murf_format: String,
    pub murf_sample_rate: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            assemblyai_upload_url: "https://api.assemblyai.com/v2/upload".to_string(),
            assemblyai_transcript_url: "https://api.assemblyai.com/v2/transcript".to_string(),
            transcript_poll_ms: 1000,
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            gemini_model: "gemini-2.5-flash".to_string(),
            murf_tts_url: "https://api.murf.ai/v1/speech/stream".to_string(),
            murf_model: "FALCON".to_string(),
            murf_locale: "en-US".to_string(),
            murf_format: "MP3".to_string(),
            murf_sample_rate: 24000,
        }
    }
}

impl ProviderSettings {
    /// Override endpoints from `ASSEMBLYAI_UPLOAD_URL`, `ASSEMBLYAI_TRANSCRIPT_URL`,
    /// `GEMINI_BASE_URL`, `GEMINI_MODEL` and `MURF_TTS_URL` when set.
    pub fn apply_env(&mut self) {
        let overrides: [(&str, &mut String); 5] = [
            ("ASSEMBLYAI_UPLOAD_URL", &mut self.assemblyai_upload_url),
            ("ASSEMBLYAI_TRANSCRIPT_URL", &mut self.assemblyai_transcript_url),
            ("GEMINI_BASE_URL", &mut self.gemini_base_url),
            ("GEMINI_MODEL", &mut self.gemini_model),
            ("MURF_TTS_URL", &mut self.murf_tts_url),
        ];
        for (var, slot) in overrides {
            if let Some(value) = env_non_empty(var) {
                log::debug!("Settings: {} overridden from environment", var);
                *slot = value;
            }
        }
    }
}

pub fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub turn: TurnConfig,

    pub providers: ProviderSettings,

    /// Persona used by `serve` and `talk` when none is given on the command line.
    pub persona: String,

    /// Address the backend listens on.
    pub bind_address: String,

    /// When set, `talk` sends turns to this backend instead of calling the
    /// providers in process.
    pub backend_url: Option<String>,

    /// Where record files and knowledge files live. Defaults to the user's
    /// local data directory.
    pub data_dir: Option<PathBuf>,

    /// Extra persona definitions. Same-named entries shadow the built-ins.
    pub personas: Vec<Persona>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            turn: TurnConfig::default(),
            providers: ProviderSettings::default(),
            persona: "companion".to_string(),
            bind_address: "127.0.0.1:3000".to_string(),
            backend_url: None,
            data_dir: None,
            personas: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Resolved data directory: ~/.local/share/voice-turn-agent/ unless configured.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
        })
    }

    pub fn resolve_persona(&self, name: &str) -> Option<Persona> {
        find_persona(name, &self.personas)
    }
}

/// ~/.config/voice-turn-agent/settings.json
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Missing or unreadable settings fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // Windows refuses to rename over an existing file.
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Write {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })
}
