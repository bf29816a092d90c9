//! JSON message shapes exchanged with the remote endpoint.

use crate::extract::{extract_command_id, extract_error_message, extract_verdict};
use crate::types::{Command, CommandKind, Parameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Messages sent to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Command {
        id: String,
        action: String,
        parameters: Parameters,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        timestamp: String,
    },
    Ping {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

impl OutboundMessage {
    pub fn command(command: &Command) -> Self {
        OutboundMessage::Command {
            id: command.id.to_string(),
            action: command.kind.to_string(),
            parameters: command.parameters.clone(),
            target: command.target.clone(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn ping() -> Self {
        OutboundMessage::Ping {
            timestamp: now_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        OutboundMessage::Pong {
            timestamp: now_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome a response claims for its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
    /// The response matched a command but carried no success indicator.
    Unspecified,
}

impl Verdict {
    pub fn from_bool(success: bool) -> Self {
        if success {
            Verdict::Success
        } else {
            Verdict::Failure
        }
    }
}

/// A response correlated to an earlier command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub id: String,
    pub verdict: Verdict,
    pub error: Option<String>,
    pub body: Value,
}

impl CommandResponse {
    /// Build from a raw frame; `None` when no id can be found.
    pub fn from_value(body: Value) -> Option<Self> {
        let id = extract_command_id(&body)?;
        Some(Self {
            id,
            verdict: extract_verdict(&body),
            error: extract_error_message(&body),
            body,
        })
    }
}

/// A command pushed by the server for local execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedCommand {
    pub id: Option<String>,
    pub kind: CommandKind,
    pub parameters: Parameters,
    pub target: Option<String>,
    /// The raw frame.
    pub body: Value,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Pong { timestamp: Option<String> },
    Ping,
    Welcome { client_id: Option<String> },
    Command(PushedCommand),
    Response(CommandResponse),
    Other(Value),
}

impl InboundMessage {
    /// Parse and classify a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        Ok(Self::classify(value))
    }

    /// Classify an already-decoded frame.
    ///
    /// Lifecycle frames are recognized by `type` first; a `command` frame
    /// carrying an `action` and no verdict is a server push; anything else
    /// with an extractable id is a response.
    pub fn classify(value: Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "pong" => {
                return InboundMessage::Pong {
                    timestamp: value
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            }
            "ping" => return InboundMessage::Ping,
            "welcome" | "connection_established" => {
                return InboundMessage::Welcome {
                    client_id: value
                        .get("clientId")
                        .or_else(|| value.get("client_id"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            }
            // A command frame that carries a verdict is a reply echoing our command.
            "command" if extract_verdict(&value) == Verdict::Unspecified => {
                let action = value.get("action").and_then(Value::as_str).map(str::to_string);
                if let Some(action) = action {
                    return InboundMessage::Command(PushedCommand {
                        id: value.get("id").and_then(Value::as_str).map(str::to_string),
                        kind: CommandKind::parse(&action),
                        parameters: value
                            .get("parameters")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default(),
                        target: value.get("target").and_then(Value::as_str).map(str::to_string),
                        body: value,
                    });
                }
            }
            _ => {}
        }

        if extract_command_id(&value).is_none() {
            return InboundMessage::Other(value);
        }
        match CommandResponse::from_value(value) {
            Some(response) => InboundMessage::Response(response),
            None => InboundMessage::Other(Value::Null),
        }
    }
}
