//! Task records and kind-specific metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, TaskHandle, TaskStatus};

/// Error detail used when the Registry reports `error` without a message.
pub const UNKNOWN_ERROR_DETAIL: &str = "task failed without an error detail";

/// Category of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// File download from a model repository.
    Download,
    /// UI environment install.
    Install,
    /// UI environment run.
    Run,
    /// Repair of an adopted installation.
    AdoptRepair,
}

impl TaskKind {
    /// Wire label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Install => "install",
            Self::Run => "run",
            Self::AdoptRepair => "adopt-repair",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "install" => Ok(Self::Install),
            "run" => Ok(Self::Run),
            "adopt-repair" => Ok(Self::AdoptRepair),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

/// Byte-level progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Units done so far.
    pub done: u64,
    /// Total units expected.
    pub total: u64,
}

/// Metadata for a download task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMetadata {
    /// Source repository identifier.
    pub repo: String,
    /// File within the repository.
    pub file: String,
    /// Where the file should land, if not the Registry default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// Whether the downloaded file becomes the active one on completion.
    #[serde(default)]
    pub set_as_active_on_completion: bool,
}

/// Metadata for an environment install task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallMetadata {
    /// Environment being installed.
    pub environment: String,
    /// Install location.
    pub target_path: String,
    /// Whether the install becomes the active environment on completion.
    #[serde(default)]
    pub set_as_active_on_completion: bool,
}

/// Metadata for an environment run task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Environment being launched.
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// Extra launch arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Metadata for an adoption repair task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptRepairMetadata {
    /// Path of the adopted installation.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Kind-specific metadata, fixed when the task is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMetadata {
    Download(DownloadMetadata),
    Install(InstallMetadata),
    Run(RunMetadata),
    AdoptRepair(AdoptRepairMetadata),
}

impl TaskMetadata {
    /// The task kind this metadata belongs to.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Download(_) => TaskKind::Download,
            Self::Install(_) => TaskKind::Install,
            Self::Run(_) => TaskKind::Run,
            Self::AdoptRepair(_) => TaskKind::AdoptRepair,
        }
    }

    /// Parse metadata for `kind` from its JSON object form.
    ///
    /// A missing (`null`) metadata value is read as an empty object, so kinds
    /// with required fields still fail validation.
    pub fn from_value(kind: TaskKind, value: Value) -> Result<Self, CoreError> {
        let value = match value {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let invalid = |e: serde_json::Error| CoreError::InvalidMetadata {
            kind,
            reason: e.to_string(),
        };
        let metadata = match kind {
            TaskKind::Download => Self::Download(serde_json::from_value(value).map_err(invalid)?),
            TaskKind::Install => Self::Install(serde_json::from_value(value).map_err(invalid)?),
            TaskKind::Run => Self::Run(serde_json::from_value(value).map_err(invalid)?),
            TaskKind::AdoptRepair => {
                Self::AdoptRepair(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// JSON object form, as sent in a start request.
    pub fn to_value(&self) -> Value {
        let value = match self {
            Self::Download(m) => serde_json::to_value(m),
            Self::Install(m) => serde_json::to_value(m),
            Self::Run(m) => serde_json::to_value(m),
            Self::AdoptRepair(m) => serde_json::to_value(m),
        };
        // Plain structs of strings and bools always serialize.
        value.unwrap_or(Value::Null)
    }

    /// Check required fields are present and non-empty.
    pub fn validate(&self) -> Result<(), CoreError> {
        let kind = self.kind();
        let require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(CoreError::InvalidMetadata {
                    kind,
                    reason: format!("`{field}` must not be empty"),
                })
            } else {
                Ok(())
            }
        };
        match self {
            Self::Download(m) => {
                require("repo", &m.repo)?;
                require("file", &m.file)
            }
            Self::Install(m) => {
                require("environment", &m.environment)?;
                require("targetPath", &m.target_path)
            }
            Self::Run(m) => require("environment", &m.environment),
            Self::AdoptRepair(m) => require("path", &m.path),
        }
    }

    /// Whether a collaborator should activate the result once the task completes.
    pub fn set_as_active_on_completion(&self) -> bool {
        match self {
            Self::Download(m) => m.set_as_active_on_completion,
            Self::Install(m) => m.set_as_active_on_completion,
            Self::Run(_) | Self::AdoptRepair(_) => false,
        }
    }
}

/// The client's view of one tracked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskRecordWire", into = "TaskRecordWire")]
pub struct TaskRecord {
    /// Registry-issued handle.
    pub handle: TaskHandle,

    /// Current status.
    pub status: TaskStatus,

    /// Progress percentage in `[0, 100]`.
    pub progress: f64,

    /// Byte counters for kinds that report them.
    pub counters: Option<Counters>,

    /// Registry error message; set only when `status` is `Error`.
    pub error_detail: Option<String>,

    /// Immutable creation metadata.
    pub metadata: TaskMetadata,

    /// Mutable details folded in from channel `metadataDeltas`.
    pub annotations: BTreeMap<String, Value>,
}

impl TaskRecord {
    /// Create a pending record, as returned by a successful start call.
    pub fn pending(handle: TaskHandle, metadata: TaskMetadata) -> Self {
        Self {
            handle,
            status: TaskStatus::Pending,
            progress: 0.0,
            counters: None,
            error_detail: None,
            metadata,
            annotations: BTreeMap::new(),
        }
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder method to set the progress.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = progress;
        self
    }

    /// Builder method to set the error detail.
    pub fn with_error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    /// The task kind.
    pub fn kind(&self) -> TaskKind {
        self.metadata.kind()
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enforce the record-level invariants: progress in range and
    /// error detail present exactly when the status is `Error`.
    pub fn normalize(mut self) -> Result<Self, CoreError> {
        check_progress(self.progress)?;
        if self.handle.is_blank() {
            return Err(CoreError::EmptyHandle);
        }
        match self.status {
            TaskStatus::Error => {
                if self.error_detail.is_none() {
                    self.error_detail = Some(UNKNOWN_ERROR_DETAIL.to_string());
                }
            }
            _ => self.error_detail = None,
        }
        Ok(self)
    }
}

/// Reject NaN and anything outside `[0, 100]`.
pub(crate) fn check_progress(progress: f64) -> Result<(), CoreError> {
    if (0.0..=100.0).contains(&progress) {
        Ok(())
    } else {
        Err(CoreError::InvalidProgress(progress))
    }
}

/// Wire form of a [`TaskRecord`]: kind and metadata travel separately.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRecordWire {
    handle: TaskHandle,
    kind: TaskKind,
    status: TaskStatus,
    #[serde(default)]
    progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    counters: Option<Counters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
    #[serde(default)]
    metadata: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, Value>,
}

impl TryFrom<TaskRecordWire> for TaskRecord {
    type Error = CoreError;

    fn try_from(wire: TaskRecordWire) -> Result<Self, Self::Error> {
        let metadata = TaskMetadata::from_value(wire.kind, wire.metadata)?;
        TaskRecord {
            handle: wire.handle,
            status: wire.status,
            progress: wire.progress,
            counters: wire.counters,
            error_detail: wire.error_detail,
            metadata,
            annotations: wire.annotations,
        }
        .normalize()
    }
}

impl From<TaskRecord> for TaskRecordWire {
    fn from(record: TaskRecord) -> Self {
        Self {
            handle: record.handle,
            kind: record.metadata.kind(),
            status: record.status,
            progress: record.progress,
            counters: record.counters,
            error_detail: record.error_detail,
            metadata: record.metadata.to_value(),
            annotations: record.annotations,
        }
    }
}
