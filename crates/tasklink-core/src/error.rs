//! Core domain errors.

use thiserror::Error;

use crate::{TaskHandle, TaskKind, TaskStatus};

/// Core domain errors for tasklink.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Kind-specific metadata is missing a field or has an empty one.
    #[error("Invalid {kind} metadata: {reason}")]
    InvalidMetadata { kind: TaskKind, reason: String },

    /// Progress outside `[0, 100]` or not a number.
    #[error("Invalid progress: {0}")]
    InvalidProgress(f64),

    /// A task kind the protocol does not know.
    #[error("Unknown task kind: {0}")]
    UnknownKind(String),

    /// A handle that is empty.
    #[error("Task handle must not be empty")]
    EmptyHandle,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A well-formed channel event or record that violates the lifecycle rules.
///
/// Anomalies are logged and dropped; they never reach the operator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolAnomaly {
    /// Event for a handle the table does not hold.
    #[error("event for unknown handle {0}")]
    UnknownHandle(TaskHandle),

    /// Event kind differs from the kind the task was created with.
    #[error("kind mismatch for {handle}: expected {expected}, got {actual}")]
    KindMismatch {
        handle: TaskHandle,
        expected: TaskKind,
        actual: TaskKind,
    },

    /// Status would move backwards in the lifecycle.
    #[error("status regression for {handle}: {from} -> {to}")]
    StatusRegression {
        handle: TaskHandle,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Progress would decrease while active.
    #[error("progress regression for {handle}: {from} -> {to}")]
    ProgressRegression {
        handle: TaskHandle,
        from: f64,
        to: f64,
    },

    /// Task already reached a terminal status.
    #[error("task {handle} is already {status}")]
    AlreadyTerminal {
        handle: TaskHandle,
        status: TaskStatus,
    },

    /// Too many events parked while a resync is in flight.
    #[error("resync buffer full, dropped event for {0}")]
    ParkingOverflow(TaskHandle),
}
