//! Control messages carried inside frames.
//!
//! Each frame payload is UTF-8 JSON encoding a two-element array:
//! `["command", { ...args }]`.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::protocol::frame::FramingError;

/// Well-known command names.
pub mod commands {
    /// Supervisor asks the worker to bind and start accepting.
    pub const START_ACCEPTING: &str = "start_accepting";
    /// Supervisor asks the worker to stop accepting without draining.
    pub const STOP_ACCEPTING: &str = "stop_accepting";
    /// Supervisor asks the worker to shut down (same as a termination signal).
    pub const SHUTDOWN: &str = "shutdown";

    /// Worker is initialised and waiting for instructions.
    pub const READY: &str = "ready";
    /// Worker is bound and accepting connections.
    pub const ACCEPTING: &str = "accepting";
    /// Worker stopped accepting and its last connection closed.
    pub const DRAINED: &str = "drained";
    /// Worker started draining towards exit.
    pub const STOPPING: &str = "stopping";
}

/// A named command with its argument mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub command: String,
    pub args: Map<String, Value>,
}

impl ControlMessage {
    /// Create a message without arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_args(command, Map::new())
    }

    pub fn with_args(command: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Look up a single argument.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    /// Encode as a frame payload.
    pub fn to_payload(&self) -> Result<Bytes, FramingError> {
        serde_json::to_vec(&(&self.command, &self.args))
            .map(Bytes::from)
            .map_err(|e| FramingError::Malformed(e.to_string()))
    }

    /// Decode a frame payload.
    ///
    /// Anything other than `[non-empty string, object]` is rejected.
    pub fn from_payload(payload: &[u8]) -> Result<Self, FramingError> {
        let (command, args): (String, Map<String, Value>) =
            serde_json::from_slice(payload).map_err(|e| FramingError::Malformed(e.to_string()))?;

        if command.is_empty() {
            return Err(FramingError::Malformed("empty command".to_string()));
        }

        Ok(Self { command, args })
    }
}
