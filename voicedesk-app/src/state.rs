//! Console application state.
//!
//! `AppState` is shared between the command handlers and the event
//! printing tasks started in `main`.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use voicedesk_core::session::SessionSnapshot;
use voicedesk_core::{ChatBackend, ChatSession, VoiceAgent};

use crate::settings::AppSettings;

pub type SharedChat = Arc<Mutex<ChatSession<Box<dyn ChatBackend>>>>;

pub struct AppState {
    /// The voice agent. Wrapped in `Arc` so event tasks can hold it.
    pub agent: Arc<VoiceAgent>,
    /// Text chat; `None` when no API key is configured.
    pub chat: Option<SharedChat>,
    /// Persisted app settings cache.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Count of status events printed.
    pub status_events_seen: Arc<AtomicUsize>,
    /// Count of final transcript segments printed.
    pub final_segments_seen: Arc<AtomicUsize>,
    /// Count of validated tool calls surfaced from chat replies.
    pub tool_requests_seen: Arc<AtomicUsize>,
}

impl AppState {
    pub fn diagnostics_snapshot(&self) -> AppDiagnostics {
        AppDiagnostics {
            status_events_seen: self.status_events_seen.load(Ordering::Relaxed),
            final_segments_seen: self.final_segments_seen.load(Ordering::Relaxed),
            tool_requests_seen: self.tool_requests_seen.load(Ordering::Relaxed),
            session: self.agent.diagnostics_snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDiagnostics {
    pub status_events_seen: usize,
    pub final_segments_seen: usize,
    pub tool_requests_seen: usize,
    pub session: SessionSnapshot,
}
