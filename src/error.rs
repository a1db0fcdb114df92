//! Error taxonomy shared by the dispatcher, the worker and the transports.

use std::collections::BTreeSet;

/// Errors surfaced by the dispatch protocol.
///
/// Conversion failures are deliberately absent from the worker path: a
/// failed conversion is encoded into the response `result` and delivered
/// like any other answer. [`DispatchError::Conversion`] only appears when a
/// caller asks a response for its artifact.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Unparseable or structurally invalid message. Never retried.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A queue operation failed (network, throttling, permissions).
    #[error("queue transport error during {operation}: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The addressed queue does not exist (or was already torn down).
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("invalid queue name: {0}")]
    InvalidQueueName(String),

    /// The worker reported a failed conversion for this object.
    #[error("conversion failed for {object_ref}: {reason}")]
    Conversion { object_ref: String, reason: String },

    /// The batch did not complete before its deadline.
    #[error("batch {batch_token} timed out; missing sequences {missing:?}")]
    Timeout {
        batch_token: String,
        missing: BTreeSet<u32>,
    },

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DispatchError {
    pub(crate) fn transport(operation: &'static str, err: impl std::fmt::Display) -> Self {
        DispatchError::Transport {
            operation,
            message: err.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DispatchError::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
