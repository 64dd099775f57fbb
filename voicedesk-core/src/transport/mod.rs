//! Transport session: the bidirectional channel to the remote agent.
//!
//! A [`Connector`] turns a [`LiveSetup`] into a [`TransportHandle`]. A
//! session has three parts:
//!
//! - a [`TransportSender`] over the shared [`OutboundQueue`]; the capture
//!   thread sends encoded frames through it and they reach the wire in
//!   send order;
//! - an ordered stream of [`TransportEvent`]s, one channel for every
//!   message type, so delivery order is preserved across types;
//! - `close()`, which stops the connection task and refuses further sends.

pub mod live;
pub mod memory;
pub mod outbound;
pub mod protocol;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::EncodedChunk;
use crate::tools::HELPDESK_PERSONA;

pub use live::LiveConnector;
pub use memory::{MemoryConnector, MemoryPeer};
pub use outbound::{OutboundQueue, OverflowPolicy, PushOutcome};

/// Inbound events buffered between the connection task and the session loop.
pub const EVENT_CHANNEL_CAP: usize = 256;

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// One inbound signal from the remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server accepted the session setup.
    Opened,
    Audio(EncodedChunk),
    InputTranscript(String),
    OutputTranscript(String),
    /// Server-side barge-in: the user spoke over the agent.
    Interrupted,
    TurnComplete,
    Closed(Option<String>),
    Error(String),
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Audio(_) => "audio",
            Self::InputTranscript(_) => "input_transcript",
            Self::OutputTranscript(_) => "output_transcript",
            Self::Interrupted => "interrupted",
            Self::TurnComplete => "turn_complete",
            Self::Closed(_) => "closed",
            Self::Error(_) => "error",
        }
    }
}

/// Everything the remote session is configured with at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveSetup {
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub voice_name: String,
    /// Declared rate of the outbound PCM.
    pub input_sample_rate: u32,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for LiveSetup {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.into(),
            api_key: None,
            model: DEFAULT_LIVE_MODEL.into(),
            system_prompt: HELPDESK_PERSONA.into(),
            voice_name: DEFAULT_VOICE.into(),
            input_sample_rate: 16_000,
            input_transcription: true,
            output_transcription: true,
        }
    }
}

impl LiveSetup {
    /// Endpoint with the API key attached as a query parameter.
    pub fn url(&self) -> String {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{sep}key={key}", self.endpoint)
            }
            _ => self.endpoint.clone(),
        }
    }
}

/// Opens transport sessions.
pub trait Connector: Send + Sync {
    /// Start connecting and return immediately.
    ///
    /// Success is reported later as `TransportEvent::Opened`; failure as
    /// `Error` or `Closed` on the same event stream.
    fn connect(&self, setup: &LiveSetup, outbound: Arc<OutboundQueue>) -> TransportHandle;
}

/// Sending half of a transport session, held by the capture thread.
#[derive(Debug, Clone)]
pub struct TransportSender {
    outbound: Arc<OutboundQueue>,
}

impl TransportSender {
    pub fn new(outbound: Arc<OutboundQueue>) -> Self {
        Self { outbound }
    }

    /// Fire-and-forget enqueue of one outbound frame. Frames reach the
    /// wire in call order; the queue's overflow policy decides what is
    /// shed when the link falls behind.
    pub fn send(&self, chunk: EncodedChunk) -> PushOutcome {
        self.outbound.push(chunk)
    }

    /// Whether the session has closed and refuses further sends.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Caller's end of an open (or opening) transport session.
pub struct TransportHandle {
    outbound: Arc<OutboundQueue>,
    events: mpsc::Receiver<TransportEvent>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(
        outbound: Arc<OutboundQueue>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: watch::Sender<bool>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            events,
            shutdown,
            task,
        }
    }

    /// Next inbound event in delivery order. `None` once the connection
    /// task is gone and every buffered event has been read.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Stop the connection and refuse further sends. Idempotent.
    pub fn close(&mut self) {
        self.outbound.close();
        let _ = self.shutdown.send(true);
        self.events.close();
        debug!("transport close requested");
    }

    /// Wait for the connection task to finish after `close()`.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.outbound.close();
        let _ = self.shutdown.send(true);
    }
}
