//! Core command types.

use crate::id::CommandId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command parameters as sent on the wire.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Kind of a view command.
///
/// The four built-in kinds get dedicated similarity rules; anything else is
/// carried through as `Other` and compared generically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    Rotate,
    Zoom,
    Focus,
    Reset,
    Other(String),
}

impl CommandKind {
    /// Parse a kind name, case-insensitively.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rotate" => CommandKind::Rotate,
            "zoom" => CommandKind::Zoom,
            "focus" => CommandKind::Focus,
            "reset" => CommandKind::Reset,
            other => CommandKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Rotate => "rotate",
            CommandKind::Zoom => "zoom",
            CommandKind::Focus => "focus",
            CommandKind::Reset => "reset",
            CommandKind::Other(name) => name,
        }
    }
}

impl From<String> for CommandKind {
    fn from(value: String) -> Self {
        CommandKind::parse(&value)
    }
}

impl From<&str> for CommandKind {
    fn from(value: &str) -> Self {
        CommandKind::parse(value)
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command came from. The engine treats all origins alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    Ui,
    Chat,
    Server,
    Api,
}

/// A single view command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub origin: CommandOrigin,
}

impl Command {
    /// Create a command with a freshly generated id.
    pub fn new(kind: CommandKind, parameters: Parameters, origin: CommandOrigin) -> Self {
        Self {
            id: CommandId::generate(),
            kind,
            parameters,
            target: None,
            origin,
        }
    }

    /// Attach a routing target (e.g. a viewer instance name).
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Replace the id, used when a registration collided.
    pub fn regenerate_id(&mut self) {
        self.id = CommandId::generate();
    }
}
