//! Viewlink wire protocol
//!
//! Command types shared by the engine and its collaborators, plus the JSON
//! message shapes exchanged with the remote viewer endpoint.

pub mod types;
pub mod id;
pub mod wire;
pub mod extract;

pub use types::{Command, CommandKind, CommandOrigin, Parameters};
pub use id::CommandId;
pub use wire::{CommandResponse, InboundMessage, OutboundMessage, ProtocolError, PushedCommand, Verdict};
pub use extract::{extract_command_id, extract_error_message, extract_verdict};
