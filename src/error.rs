//! Error types
//!
//! One enum per area: the channel transport, the bus, and the process bridge.
//! Higher layers wrap lower ones with `#[from]` so `?` composes across them.

use std::process::ExitStatus;
use thiserror::Error;

/// Transport and channel errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Tokio runtime available to drive the connection")]
    NoRuntime,

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("failed to decode message: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}

/// Bus and net client errors
#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no receiver registered for address {0:?}")]
    NoRoute(String),

    #[error("address {0:?} is already registered")]
    AddressInUse(String),

    #[error("bus is closed")]
    Closed,

    #[error("unexpected bus reply: {0}")]
    Protocol(String),
}

/// Process handler and bridge errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("process error: {status}")]
    Exited { status: ExitStatus },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no inherited bridge socket: {0}")]
    NoInheritedSocket(String),

    #[error("process result already consumed")]
    AlreadyWaited,

    #[error("plugin task ended without reporting a result")]
    PluginAborted,
}

impl ProcessError {
    /// Exit status carried by a non-clean exit, if this is one
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            ProcessError::Exited { status } => Some(*status),
            _ => None,
        }
    }
}
