//! Console command handlers.
//!
//! Each line typed on stdin is parsed into a [`Command`] and dispatched to
//! one of the handlers below. Handlers return `Err(String)` for anything
//! the user should see as a failure.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use voicedesk_core::audio::device::{list_devices, DeviceInfo};
use voicedesk_core::audio::StreamDirection;
use voicedesk_core::session::SessionOutcome;
use voicedesk_core::tools::ToolDeclaration;
use voicedesk_core::{CaptureSource, ChatTurn, OutputTarget, SessionState};
use tracing::info;

use crate::settings::{save_settings, RuntimeSettings};
use crate::state::{AppDiagnostics, AppState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { device: Option<String> },
    /// Stream a WAV file instead of the microphone.
    StartWav(PathBuf),
    Stop,
    Status,
    Devices,
    Chat(String),
    Tools,
    Settings,
    SetInputDevice(Option<String>),
    Help,
    Quit,
}

pub const HELP: &str = "commands: start [input device] | start --wav <file> | stop | status | devices | chat <text> | tools | settings | input [device] | help | quit";

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then(|| rest.to_string());
        match word.to_ascii_lowercase().as_str() {
            "start" => {
                let (flag, path) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                match (flag, path.trim()) {
                    ("--wav", "") => Err("usage: start --wav <file>".to_string()),
                    ("--wav", path) => Ok(Self::StartWav(PathBuf::from(path))),
                    _ => Ok(Self::Start { device: arg }),
                }
            }
            "stop" => Ok(Self::Stop),
            "status" => Ok(Self::Status),
            "devices" => Ok(Self::Devices),
            "chat" => arg
                .map(Self::Chat)
                .ok_or_else(|| "usage: chat <text>".to_string()),
            "tools" => Ok(Self::Tools),
            "settings" => Ok(Self::Settings),
            "input" => Ok(Self::SetInputDevice(arg)),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "" => Err(String::new()),
            other => Err(format!("unknown command `{other}`; {HELP}")),
        }
    }
}

/// Start a voice session on `device`, or on the preferred devices.
pub async fn start_session(state: &AppState, device: Option<String>) -> Result<(), String> {
    let (preferred_input, output) = {
        let settings = state.settings.lock();
        (
            settings.preferred_input_device.clone(),
            settings.preferred_output_device.clone(),
        )
    };
    state
        .agent
        .start_with(
            CaptureSource::Microphone {
                device: device.or(preferred_input),
            },
            OutputTarget::Device { device: output },
        )
        .await
        .map_err(|e| e.to_string())
}

/// Start a voice session that streams `path` in place of the microphone.
pub async fn start_wav_session(state: &AppState, path: PathBuf) -> Result<(), String> {
    let output = state.settings.lock().preferred_output_device.clone();
    state
        .agent
        .start_with(CaptureSource::WavFile(path), OutputTarget::Device { device: output })
        .await
        .map_err(|e| e.to_string())
}

/// Stop the voice session and log the counters.
pub async fn stop_session(state: &AppState) -> Result<SessionOutcome, String> {
    let outcome = state.agent.stop().await.map_err(|e| e.to_string())?;
    let diag = state.diagnostics_snapshot();
    info!(
        frames_sent = diag.session.capture.frames_sent,
        frames_dropped = diag.session.capture.frames_dropped,
        units_scheduled = diag.session.playback.units_scheduled,
        interruptions = diag.session.playback.interruptions,
        "app diagnostics snapshot on stop"
    );
    Ok(outcome)
}

pub fn get_status(state: &AppState) -> (SessionState, AppDiagnostics) {
    (state.agent.state(), state.diagnostics_snapshot())
}

pub fn list_audio_devices() -> (Vec<DeviceInfo>, Vec<DeviceInfo>) {
    (
        list_devices(StreamDirection::Input),
        list_devices(StreamDirection::Output),
    )
}

/// Send one chat message. Blocks a worker thread for the HTTP call.
pub async fn send_chat(state: &AppState, text: String) -> Result<Option<ChatTurn>, String> {
    let chat = state
        .chat
        .clone()
        .ok_or_else(|| "chat unavailable: set VOICEDESK_API_KEY or GEMINI_API_KEY".to_string())?;
    let turn = tokio::task::spawn_blocking(move || chat.lock().send(&text))
        .await
        .map_err(|e| format!("chat task failed: {e}"))?;
    if let Some(turn) = &turn {
        state
            .tool_requests_seen
            .fetch_add(turn.requests.len(), Ordering::Relaxed);
    }
    Ok(turn)
}

pub fn list_tools() -> Vec<ToolDeclaration> {
    voicedesk_core::ToolSet::helpdesk().declarations().to_vec()
}

pub fn get_runtime_settings(state: &AppState) -> RuntimeSettings {
    state.settings.lock().runtime_settings()
}

/// Persist the preferred input device used by future `start` calls.
pub fn set_preferred_input_device(
    state: &AppState,
    device_name: Option<String>,
) -> Result<(), String> {
    let normalized = device_name
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let mut settings = state.settings.lock();
    settings.preferred_input_device = normalized;
    save_settings(&state.settings_path, &settings).map_err(|e| e.to_string())
}
