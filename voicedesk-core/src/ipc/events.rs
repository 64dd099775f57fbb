//! Event types broadcast to the host.
//!
//! ## Channels
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStatusEvent` | `VoiceAgent::subscribe_status` |
//! | `TranscriptEvent` | `VoiceAgent::subscribe_transcripts` |
//!
//! Everything serialises as camelCase JSON so a UI shell can forward it
//! unchanged.

use serde::{Deserialize, Serialize};

use crate::session::state::{Feedback, SessionState};

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted on every state transition (and on failures that end a session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub seq: u64,
    pub status: SessionState,
    /// Haptic + visual feedback for the transition that produced this event.
    pub feedback: Option<Feedback>,
    /// Optional human-readable detail (e.g. close reason, error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// Transcription of the microphone input.
    User,
    /// Transcription of the synthesized reply.
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// Text so far in this turn; grows with every delta.
    Partial,
    /// The turn completed and this text is committed.
    Final,
}

/// Accumulated transcript for one side of the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub seq: u64,
    /// Turn counter within the session, starting at 0.
    pub turn: u64,
    pub speaker: Speaker,
    pub text: String,
    pub kind: SegmentKind,
}
