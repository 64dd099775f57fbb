//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voicedesk_core::chat::DEFAULT_CHAT_MODEL;
use voicedesk_core::transport::{
    OverflowPolicy, DEFAULT_LIVE_ENDPOINT, DEFAULT_LIVE_MODEL, DEFAULT_VOICE,
};
use voicedesk_core::SessionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Key stored in the settings file.
    pub api_key: Option<String>,
    /// Key from the environment. Wins over `api_key` and is never saved.
    #[serde(skip)]
    pub env_api_key: Option<String>,
    pub live_endpoint: String,
    pub live_model: String,
    pub voice_name: String,
    pub chat_model: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub block_size: usize,
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            env_api_key: None,
            live_endpoint: DEFAULT_LIVE_ENDPOINT.into(),
            live_model: DEFAULT_LIVE_MODEL.into(),
            voice_name: DEFAULT_VOICE.into(),
            chat_model: DEFAULT_CHAT_MODEL.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            block_size: 2048,
            outbound_capacity: 64,
            overflow_policy: OverflowPolicy::DropOldest,
            input_transcription: true,
            output_transcription: true,
        }
    }
}

/// Settings as shown to the user; the key itself never leaves the process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub has_api_key: bool,
    pub live_model: String,
    pub voice_name: String,
    pub chat_model: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub block_size: usize,
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        self.api_key = trimmed_or_none(self.api_key.as_deref());
        self.live_endpoint = trimmed_or(&self.live_endpoint, &defaults.live_endpoint);
        self.live_model = normalize_live_model(&self.live_model);
        self.voice_name = trimmed_or(&self.voice_name, DEFAULT_VOICE);
        self.chat_model = trimmed_or(&self.chat_model, DEFAULT_CHAT_MODEL);
        self.preferred_input_device = trimmed_or_none(self.preferred_input_device.as_deref());
        self.preferred_output_device = trimmed_or_none(self.preferred_output_device.as_deref());
        self.block_size = self.block_size.clamp(256, 16_384);
        self.outbound_capacity = self.outbound_capacity.clamp(4, 1024);
    }

    /// `VOICEDESK_API_KEY` wins over `GEMINI_API_KEY`, which wins over the
    /// stored key.
    pub fn apply_env_overrides(&mut self) {
        self.apply_key_overrides(|var| std::env::var(var).ok());
    }

    fn apply_key_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.env_api_key = ["VOICEDESK_API_KEY", "GEMINI_API_KEY"]
            .iter()
            .find_map(|var| trimmed_or_none(lookup(var).as_deref()));
    }

    /// The key sessions and chat should use.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.env_api_key.as_deref().or(self.api_key.as_deref())
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            has_api_key: self.effective_api_key().is_some(),
            live_model: self.live_model.clone(),
            voice_name: self.voice_name.clone(),
            chat_model: self.chat_model.clone(),
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            block_size: self.block_size,
            outbound_capacity: self.outbound_capacity,
            overflow_policy: self.overflow_policy,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig {
            block_size: self.block_size,
            outbound_capacity: self.outbound_capacity,
            overflow_policy: self.overflow_policy,
            input_device: self.preferred_input_device.clone(),
            output_device: self.preferred_output_device.clone(),
            ..SessionConfig::default()
        };
        config.live.endpoint = self.live_endpoint.clone();
        config.live.api_key = self.effective_api_key().map(str::to_string);
        config.live.model = self.live_model.clone();
        config.live.voice_name = self.voice_name.clone();
        config.live.input_transcription = self.input_transcription;
        config.live.output_transcription = self.output_transcription;
        config
    }
}

fn trimmed_or_none(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn trimmed_or(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.into()
    } else {
        trimmed.into()
    }
}

/// The live API expects the `models/` prefix.
pub fn normalize_live_model(raw: &str) -> String {
    let model = raw.trim();
    if model.is_empty() {
        DEFAULT_LIVE_MODEL.into()
    } else if model.starts_with("models/") {
        model.into()
    } else {
        format!("models/{model}")
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Voicedesk")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voicedesk")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.apply_env_overrides();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
