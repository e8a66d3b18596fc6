//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a task as tracked by the client.
///
/// Statuses are ordered `Pending < Active < {Completed, Error, Cancelled}`.
/// The Registry's richer display labels (`downloading`, `running`,
/// `installing`) all collapse into [`TaskStatus::Active`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task accepted by the Registry but not yet started.
    #[default]
    Pending,
    /// Task is executing.
    #[serde(alias = "downloading", alias = "running", alias = "installing")]
    Active,
    /// Task finished successfully.
    Completed,
    /// Task failed; the record carries an error detail.
    #[serde(alias = "failed")]
    Error,
    /// Task was cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Position of the status in the lifecycle order.
    ///
    /// All terminal statuses share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Completed | Self::Error | Self::Cancelled => 2,
        }
    }

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Returns true if moving from `self` to `next` respects the lifecycle.
    ///
    /// Staying in the same non-terminal status is allowed (progress updates).
    /// Nothing may leave a terminal status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    /// Wire label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::Completed,
        TaskStatus::Error,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Active));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Active));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Error));
    }

    #[test]
    fn test_backward_transition_rejected() {
        assert!(!TaskStatus::Active.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_nothing_leaves_terminal() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_display_labels_parse_as_active() {
        for label in ["\"downloading\"", "\"running\"", "\"installing\"", "\"active\""] {
            let status: TaskStatus = serde_json::from_str(label).unwrap();
            assert_eq!(status, TaskStatus::Active);
        }
        let status: TaskStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, TaskStatus::Error);
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn test_unknown_label_rejected() {
        assert!(serde_json::from_str::<TaskStatus>("\"paused\"").is_err());
    }
}
