//! # voicedesk-core
//!
//! Real-time voice agent engine for an IT help desk.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → CapturePipeline (spawn_blocking)
//!                                                    │ resample → frame → PCM16/base64
//!                                                    ▼
//!                                              OutboundQueue ──► Connector (WebSocket)
//!                                                                     │
//!                       TransportEvent (audio, interrupted, transcripts, close)
//!                                                                     ▼
//!   broadcast::Sender<SessionStatusEvent> ◄── SessionCore ──► PlaybackScheduler ──► OutputHandle
//!   broadcast::Sender<TranscriptEvent>    ◄──┘
//! ```
//!
//! The audio callbacks are zero-alloc. Heap work happens on the capture
//! thread and the session task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod chat;
pub mod codec;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;
pub mod tools;
pub mod transport;

// Convenience re-exports for downstream crates
pub use chat::{ChatBackend, ChatMessage, ChatRole, ChatSession, ChatTurn, GeminiChat};
pub use error::{Result, VoiceError};
pub use ipc::events::{SegmentKind, SessionStatusEvent, Speaker, TranscriptEvent};
pub use playback::{PlaybackScheduler, PlaybackSink};
pub use session::state::{Feedback, HapticPattern, SessionState, VisualCue};
pub use session::{CaptureSource, OutputTarget, SessionConfig, SessionOutcome, VoiceAgent};
pub use tools::{HelpdeskRequest, ToolCall, ToolSet};
pub use transport::live::LiveConnector;
pub use transport::memory::{MemoryConnector, MemoryPeer};
pub use transport::{Connector, LiveSetup, TransportEvent};
