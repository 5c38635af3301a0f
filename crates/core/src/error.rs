use crate::session::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a bridge or reject a state change.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to connect to the model: {0}")]
    ModelConnect(#[source] anyhow::Error),

    #[error("Model did not become ready within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("{channel} channel closed: {reason}")]
    ChannelClosed {
        channel: &'static str,
        reason: String,
    },

    #[error("No pending call matches call id {0}")]
    UnknownCall(String),

    #[error("Call {0} is already bridged")]
    CallAlreadyBridged(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Violations of the per-call session invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Illegal phase transition from {from} to {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("Model session id is already bound to {0}")]
    ModelSessionAlreadyBound(String),

    #[error("Model session id can only be bound once the model is ready (phase is {0})")]
    ModelNotReady(Phase),
}

/// Transcript artifacts could not be written.
#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("Failed to write transcript {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
