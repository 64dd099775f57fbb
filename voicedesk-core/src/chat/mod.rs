//! Text chat with the help-desk agent.
//!
//! A request/response companion to the voice session: the user types, the
//! backend returns one complete reply. Function calls in a reply are
//! validated against the help-desk [`ToolSet`] and handed back to the host;
//! nothing is executed here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, VoiceError};
use crate::tools::{HelpdeskRequest, ToolCall, ToolSet, HELPDESK_PERSONA};

pub const DEFAULT_CHAT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_CHAT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const GREETING: &str = "Hello! I'm TMC IT SUPPORT. I'm ready to handle your password resets, ticket creations, or technical questions. What's on your mind?";
/// Shown when the model answered with function calls only.
pub const EMPTY_REPLY_FALLBACK: &str = "I've updated the systems based on your request.";
pub const ERROR_REPLY: &str = "System connection interrupted. Please re-type your request.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Raw reply from a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub text: Option<String>,
    pub function_calls: Vec<ToolCall>,
}

pub trait ChatBackend: Send {
    /// Produce the reply to `message`. `context` holds earlier completed
    /// exchanges, oldest first.
    fn generate(&self, context: &[ChatMessage], message: &str) -> Result<ChatReply>;
}

impl<B: ChatBackend + ?Sized> ChatBackend for Box<B> {
    fn generate(&self, context: &[ChatMessage], message: &str) -> Result<ChatReply> {
        (**self).generate(context, message)
    }
}

/// Result of one `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub reply: ChatMessage,
    /// Valid calls, ready for the host to act on.
    pub requests: Vec<HelpdeskRequest>,
    /// Calls that failed validation, as `(tool, reason)`.
    pub rejected: Vec<(String, String)>,
    /// The backend failed and `reply` carries the error message.
    pub failed: bool,
}

pub struct ChatSession<B: ChatBackend> {
    backend: B,
    tools: ToolSet,
    history: Vec<ChatMessage>,
    /// Exchanges the backend has seen; excludes the greeting and failed sends.
    context: Vec<ChatMessage>,
}

impl<B: ChatBackend> ChatSession<B> {
    pub fn new(backend: B) -> Self {
        Self::with_tools(backend, ToolSet::helpdesk())
    }

    pub fn with_tools(backend: B, tools: ToolSet) -> Self {
        Self {
            backend,
            tools,
            history: vec![ChatMessage::new(ChatRole::Model, GREETING)],
            context: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Send one user message. Blank input is ignored and returns `None`.
    ///
    /// Blocks for the duration of the backend call.
    pub fn send(&mut self, input: &str) -> Option<ChatTurn> {
        if input.trim().is_empty() {
            return None;
        }
        let user = ChatMessage::new(ChatRole::User, input);
        self.history.push(user.clone());

        let turn = match self.backend.generate(&self.context, input) {
            Ok(reply) => {
                let (requests, rejected) = self.sort_calls(&reply.function_calls);
                let text = reply
                    .text
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| EMPTY_REPLY_FALLBACK.to_string());
                let model = ChatMessage::new(ChatRole::Model, text);
                self.context.push(user);
                self.context.push(model.clone());
                ChatTurn {
                    reply: model,
                    requests,
                    rejected,
                    failed: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "chat request failed");
                ChatTurn {
                    reply: ChatMessage::new(ChatRole::Model, ERROR_REPLY),
                    requests: Vec::new(),
                    rejected: Vec::new(),
                    failed: true,
                }
            }
        };
        self.history.push(turn.reply.clone());
        Some(turn)
    }

    fn sort_calls(&self, calls: &[ToolCall]) -> (Vec<HelpdeskRequest>, Vec<(String, String)>) {
        let mut requests = Vec::new();
        let mut rejected = Vec::new();
        for call in calls {
            match HelpdeskRequest::from_call(&self.tools, call) {
                Ok(req) => requests.push(req),
                Err(VoiceError::InvalidToolCall { tool, reason }) => {
                    warn!(%tool, %reason, "rejected tool call");
                    rejected.push((tool, reason));
                }
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "rejected tool call");
                    rejected.push((call.name.clone(), e.to_string()));
                }
            }
        }
        (requests, rejected)
    }
}

/// `generateContent` client.
pub struct GeminiChat {
    client: reqwest::blocking::Client,
    api_key: String,
    model: String,
    base_url: String,
    system_prompt: String,
    tools: ToolSet,
}

impl GeminiChat {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VoiceError::Chat(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            base_url: DEFAULT_CHAT_BASE_URL.to_string(),
            system_prompt: HELPDESK_PERSONA.to_string(),
            tools: ToolSet::helpdesk(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, context: &[ChatMessage], message: &str) -> Value {
        build_request_body(&self.system_prompt, &self.tools, context, message)
    }
}

impl ChatBackend for GeminiChat {
    fn generate(&self, context: &[ChatMessage], message: &str) -> Result<ChatReply> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!(model = %self.model, turns = context.len(), "chat request");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(context, message))
            .send()
            .map_err(|e| VoiceError::Chat(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(VoiceError::Chat(format!(
                "request returned {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .map_err(|e| VoiceError::Chat(format!("response parse failed: {e}")))?;
        parse_generate_response(&payload)
    }
}

pub(crate) fn build_request_body(
    system_prompt: &str,
    tools: &ToolSet,
    context: &[ChatMessage],
    message: &str,
) -> Value {
    let mut contents: Vec<Value> = context
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "parts": [{ "text": m.content }],
            })
        })
        .collect();
    contents.push(json!({ "role": ChatRole::User, "parts": [{ "text": message }] }));

    json!({
        "systemInstruction": { "parts": [{ "text": system_prompt }] },
        "contents": contents,
        "tools": [tools.function_declarations()],
    })
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<ToolCall>,
}

/// Text parts are concatenated; function calls are collected in order.
pub(crate) fn parse_generate_response(payload: &Value) -> Result<ChatReply> {
    let response = GenerateResponse::deserialize(payload)?;
    let Some(content) = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
    else {
        return Ok(ChatReply::default());
    };

    let mut text = String::new();
    let mut function_calls = Vec::new();
    for part in content.parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            function_calls.push(call);
        }
    }
    Ok(ChatReply {
        text: (!text.is_empty()).then_some(text),
        function_calls,
    })
}
