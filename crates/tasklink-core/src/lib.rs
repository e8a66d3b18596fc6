//! tasklink core domain types
//!
//! This crate contains the task lifecycle model with no dependencies on:
//! - HTTP or WebSocket transports
//! - The async runtime
//!
//! Everything here is pure and synchronous: the task record and its status
//! state machine, the channel event envelope, and the [`TaskTable`] that
//! reconciles events and snapshots against the local view.

pub mod error;
pub mod event;
pub mod ids;
pub mod status;
pub mod table;
pub mod task;

// Re-export commonly used types
pub use error::{CoreError, ProtocolAnomaly};
pub use event::TaskEvent;
pub use ids::TaskHandle;
pub use status::TaskStatus;
pub use table::{EventOutcome, RemoveOutcome, ResyncReport, TaskTable, UpsertOutcome};
pub use task::{
    AdoptRepairMetadata, Counters, DownloadMetadata, InstallMetadata, RunMetadata, TaskKind,
    TaskMetadata, TaskRecord,
};
