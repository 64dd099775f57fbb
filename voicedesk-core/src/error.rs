use thiserror::Error;

/// All errors produced by voicedesk-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed audio chunk: {0}")]
    Decode(String),

    #[error("voice session is already running")]
    AlreadyRunning,

    #[error("voice session is not running")]
    NotRunning,

    #[error("invalid tool call `{tool}`: {reason}")]
    InvalidToolCall { tool: String, reason: String },

    #[error("chat backend error: {0}")]
    Chat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
