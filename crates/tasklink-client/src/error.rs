//! Error types for the client.

use thiserror::Error;

use tasklink_core::{CoreError, TaskHandle};

/// Errors surfaced to callers of the client.
///
/// Protocol anomalies on the status channel are never surfaced here; they are
/// logged and dropped by the store.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Start metadata was rejected locally or by the Registry.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The Registry could not be reached, timed out, or failed internally.
    #[error("transport error: {0}")]
    Transport(String),

    /// The command does not fit the task's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The store holds no task with this handle.
    #[error("unknown task: {0}")]
    UnknownHandle(TaskHandle),

    /// The store's owner task has stopped.
    #[error("task store is closed")]
    StoreClosed,

    /// Status channel failure.
    #[error("status channel error: {0}")]
    Channel(String),
}

impl ClientError {
    /// The message without the category prefix, as shown to an operator.
    pub fn message(&self) -> String {
        match self {
            Self::Validation(m) | Self::Transport(m) | Self::InvalidState(m) | Self::Channel(m) => {
                m.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<CoreError> for ClientError {
    fn from(e: CoreError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Channel(e.to_string())
    }
}
