//! JSON wire protocol of the live agent session.
//!
//! ## Client → server
//!
//! | Message | When |
//! |---------|------|
//! | `{"setup": {...}}` | once, first frame after the socket opens |
//! | `{"realtimeInput": {"audio": {"mimeType", "data"}}}` | per capture frame |
//!
//! ## Server → client
//!
//! | Message | Event(s) |
//! |---------|----------|
//! | `{"setupComplete": {}}` | `Opened` |
//! | `{"serverContent": {...}}` | `Audio`, `Interrupted`, `OutputTranscript`, `InputTranscript`, `TurnComplete` (this order) |
//! | `{"goAway": {...}}` | none; the server closes shortly after |

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{LiveSetup, TransportEvent};
use crate::codec::{pcm_mime_type, EncodedChunk};
use crate::error::Result;

/// Build the session setup frame.
pub fn setup_message(setup: &LiveSetup) -> Result<String> {
    let mut body = json!({
        "model": setup.model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": setup.voice_name }
                }
            },
            "thinkingConfig": { "thinkingBudget": 0 }
        },
        "systemInstruction": {
            "parts": [{ "text": setup.system_prompt }]
        }
    });
    if setup.input_transcription {
        body["inputAudioTranscription"] = json!({});
    }
    if setup.output_transcription {
        body["outputAudioTranscription"] = json!({});
    }
    Ok(serde_json::to_string(&json!({ "setup": body }))?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: String,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    audio: Blob<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputEnvelope<'a> {
    realtime_input: RealtimeInput<'a>,
}

/// Wrap one encoded capture frame for the wire.
pub fn realtime_input_message(chunk: &EncodedChunk, input_sample_rate: u32) -> Result<String> {
    Ok(serde_json::to_string(&RealtimeInputEnvelope {
        realtime_input: RealtimeInput {
            audio: Blob {
                mime_type: pcm_mime_type(input_sample_rate),
                data: chunk.as_str(),
            },
        },
    })?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

/// Translate one server frame into transport events, in delivery order.
///
/// At most one audio chunk is taken per message. Frames with no
/// recognised content produce an empty list.
pub fn parse_server_message(text: &str) -> Result<Vec<TransportEvent>> {
    let msg: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if msg.setup_complete.is_some() {
        events.push(TransportEvent::Opened);
    }

    if let Some(content) = msg.server_content {
        let audio = content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.inline_data)
            .find(|data| {
                data.mime_type
                    .as_deref()
                    .map_or(true, |m| m.starts_with("audio/"))
            });
        if let Some(data) = audio {
            events.push(TransportEvent::Audio(EncodedChunk::from_wire(data.data)));
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(TransportEvent::OutputTranscript(text));
            }
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(TransportEvent::InputTranscript(text));
            }
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    if let Some(go_away) = msg.go_away {
        debug!(%go_away, "server announced disconnect");
    }

    Ok(events)
}
