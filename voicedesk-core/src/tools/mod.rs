//! Help-desk tool declarations.
//!
//! The remote agent can call three procedures. This module declares them
//! with a JSON-schema-like parameter description, validates incoming calls
//! against that schema, and converts valid calls into typed requests.
//! Executing them is left to the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, VoiceError};

/// System instruction shared by the voice and text agents.
pub const HELPDESK_PERSONA: &str = "You are TMC IT SUPPORT, a high-level IT Support AI Agent.
CRITICAL FOR VOICE: Be extremely punchy. Keep responses under 15 words if possible.
Don't use filler words like \"Sure,\" or \"I can help with that.\" Just give the answer or ask the next question.
Your goal is to assist employees with technical issues, troubleshoot problems, and manage support tickets.
When users report issues, ask ONE clarifying question.
Provide instructions in tiny, atomic steps.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    Object,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl PropertySchema {
    pub fn string(description: &str) -> Self {
        Self {
            kind: SchemaType::String,
            description: Some(description.to_string()),
            allowed: None,
        }
    }

    pub fn one_of(values: &[&str]) -> Self {
        Self {
            kind: SchemaType::String,
            description: None,
            allowed: Some(values.iter().map(|v| v.to_string()).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

impl ToolDeclaration {
    fn new(
        name: &str,
        description: &str,
        properties: Vec<(&str, PropertySchema)>,
        required: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: ParameterSchema {
                kind: SchemaType::Object,
                properties: properties
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                required: required.iter().map(|r| r.to_string()).collect(),
            },
        }
    }
}

/// A function call as the agent emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSet {
    tools: Vec<ToolDeclaration>,
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::helpdesk()
    }
}

impl ToolSet {
    pub fn new(tools: Vec<ToolDeclaration>) -> Self {
        Self { tools }
    }

    /// `resetPassword`, `createTicket` and `checkServerStatus`.
    pub fn helpdesk() -> Self {
        Self::new(vec![
            ToolDeclaration::new(
                "resetPassword",
                "Resets a user password for their enterprise account.",
                vec![(
                    "username",
                    PropertySchema::string("The employee username or email"),
                )],
                &["username"],
            ),
            ToolDeclaration::new(
                "createTicket",
                "Creates a new IT support ticket in the system.",
                vec![
                    ("title", PropertySchema::string("Brief summary of the issue")),
                    ("description", PropertySchema::string("Detailed explanation")),
                    (
                        "priority",
                        PropertySchema::one_of(&["LOW", "MEDIUM", "HIGH", "CRITICAL"]),
                    ),
                    (
                        "category",
                        PropertySchema::string("E.g., Hardware, Software, Network, Access"),
                    ),
                ],
                &["title", "description", "priority"],
            ),
            ToolDeclaration::new(
                "checkServerStatus",
                "Checks the health of a specific internal server.",
                vec![(
                    "serverId",
                    PropertySchema::string("The ID of the server (e.g. SRV-01, DB-PRD)"),
                )],
                &["serverId"],
            ),
        ])
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDeclaration> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Check a call against its declaration.
    ///
    /// # Errors
    /// `VoiceError::InvalidToolCall` for an unknown tool, a missing required
    /// argument, an unknown argument, a non-string value, or a value
    /// outside an enum.
    pub fn validate(&self, call: &ToolCall) -> Result<()> {
        let invalid = |reason: String| VoiceError::InvalidToolCall {
            tool: call.name.clone(),
            reason,
        };
        let decl = self
            .get(&call.name)
            .ok_or_else(|| invalid("unknown tool".into()))?;
        let schema = &decl.parameters;

        for field in &schema.required {
            if !call.args.contains_key(field) {
                return Err(invalid(format!("missing required argument `{field}`")));
            }
        }

        for (key, value) in &call.args {
            let prop = schema
                .properties
                .get(key)
                .ok_or_else(|| invalid(format!("unknown argument `{key}`")))?;
            match prop.kind {
                SchemaType::String => {
                    let Some(text) = value.as_str() else {
                        return Err(invalid(format!("argument `{key}` must be a string")));
                    };
                    if let Some(allowed) = &prop.allowed {
                        if !allowed.iter().any(|a| a == text) {
                            return Err(invalid(format!(
                                "argument `{key}` must be one of {}",
                                allowed.join(", ")
                            )));
                        }
                    }
                }
                SchemaType::Object => {
                    if !value.is_object() {
                        return Err(invalid(format!("argument `{key}` must be an object")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Wire shape for a model request's `tools` entry.
    pub fn function_declarations(&self) -> Value {
        serde_json::json!({ "functionDeclarations": self.tools })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// A validated help-desk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelpdeskRequest {
    ResetPassword {
        username: String,
    },
    CreateTicket {
        title: String,
        description: String,
        priority: TicketPriority,
        category: Option<String>,
    },
    CheckServerStatus {
        server_id: String,
    },
}

impl HelpdeskRequest {
    /// Validate `call` against `tools` and convert it.
    pub fn from_call(tools: &ToolSet, call: &ToolCall) -> Result<Self> {
        tools.validate(call)?;
        let arg = |key: &str| -> String {
            call.args
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match call.name.as_str() {
            "resetPassword" => Ok(Self::ResetPassword {
                username: arg("username"),
            }),
            "createTicket" => {
                let priority = serde_json::from_value(
                    call.args.get("priority").cloned().unwrap_or(Value::Null),
                )?;
                Ok(Self::CreateTicket {
                    title: arg("title"),
                    description: arg("description"),
                    priority,
                    category: call
                        .args
                        .get("category")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            }
            "checkServerStatus" => Ok(Self::CheckServerStatus {
                server_id: arg("serverId"),
            }),
            other => Err(VoiceError::InvalidToolCall {
                tool: other.to_string(),
                reason: "not a help-desk tool".into(),
            }),
        }
    }
}
