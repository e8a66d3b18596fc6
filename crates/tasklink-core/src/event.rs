//! Status channel event envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::check_progress;
use crate::{CoreError, Counters, TaskHandle, TaskKind, TaskStatus};

/// One status update pushed by the Registry over the status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Task the event refers to.
    pub handle: TaskHandle,

    /// Task kind, when the Registry includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,

    /// New status.
    pub status: TaskStatus,

    /// New progress; absent means unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    /// New byte counters; absent means unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,

    /// Error message for `error` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    /// Extra details merged into the record's annotations.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata_deltas: Map<String, Value>,
}

impl TaskEvent {
    /// Create an event carrying only a status.
    pub fn new(handle: impl Into<TaskHandle>, status: TaskStatus) -> Self {
        Self {
            handle: handle.into(),
            kind: None,
            status,
            progress: None,
            counters: None,
            error_detail: None,
            metadata_deltas: Map::new(),
        }
    }

    /// Parse and validate one channel frame.
    ///
    /// Fails on invalid JSON, a missing or empty handle, unknown status or
    /// kind labels, and progress outside `[0, 100]`.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let event: Self = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.handle.is_blank() {
            return Err(CoreError::EmptyHandle);
        }
        if let Some(progress) = self.progress {
            check_progress(progress)?;
        }
        Ok(())
    }

    /// Builder method to set the kind.
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Builder method to set the progress.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builder method to set the counters.
    pub fn with_counters(mut self, done: u64, total: u64) -> Self {
        self.counters = Some(Counters { done, total });
        self
    }

    /// Builder method to set the error detail.
    pub fn with_error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// Builder method to add a metadata delta.
    pub fn with_delta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata_deltas.insert(key.into(), value.into());
        self
    }
}
