//! Engine errors.

use std::time::Duration;
use thiserror::Error;

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not connected")]
    NotConnected,

    #[error("Duplicate command id: {0}")]
    DuplicateId(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution lock abandoned after {held_for:?}, force-released")]
    LockAbandoned { held_for: Duration },

    #[error("Execution lock busy after {attempts} attempts")]
    LockBusy { attempts: u32 },

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Local execution failed: {0}")]
    LocalExecution(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] viewlink_protocol::ProtocolError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(EngineError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            EngineError::DuplicateId("cmd_1".into()).to_string(),
            "Duplicate command id: cmd_1"
        );
        assert_eq!(
            EngineError::ReconnectExhausted(5).to_string(),
            "Reconnect attempts exhausted after 5 tries"
        );
        assert_eq!(
            EngineError::ConfigError("bad".into()).to_string(),
            "Config error: bad"
        );
    }
}
