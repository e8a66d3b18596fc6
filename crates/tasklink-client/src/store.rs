//! The client-side task store.
//!
//! A single owner task holds the [`TaskTable`] and applies every mutation
//! from one ordered queue, so events for the same handle are merged in
//! arrival order and never race each other. After each change the owner
//! publishes an immutable [`StoreSnapshot`] through a `watch` channel;
//! readers clone the `Arc` and never block the owner.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tasklink_core::{
    EventOutcome, RemoveOutcome, ResyncReport, TaskEvent, TaskHandle, TaskRecord, TaskStatus,
    TaskTable, UpsertOutcome,
};

use crate::error::ClientError;
use crate::supervisor::ConnectionState;

/// Immutable view of the store at one point in its mutation sequence.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Every tracked task, ordered by handle.
    pub tasks: BTreeMap<TaskHandle, TaskRecord>,

    /// Status channel health.
    pub connection: ConnectionState,

    /// When the last full resync was applied.
    pub last_resync_at: Option<DateTime<Utc>>,

    /// Increments with every published change.
    pub version: u64,
}

impl StoreSnapshot {
    /// Look up a task.
    pub fn get(&self, handle: &TaskHandle) -> Option<&TaskRecord> {
        self.tasks.get(handle)
    }

    /// All tasks, ordered by handle.
    pub fn list(&self) -> Vec<TaskRecord> {
        self.tasks.values().cloned().collect()
    }

    /// True when live updates may be stale.
    pub fn is_degraded(&self) -> bool {
        self.connection.is_degraded()
    }
}

/// Sent once when a task the store already tracked reaches a terminal status.
#[derive(Debug, Clone)]
pub struct TerminalNotice {
    /// The record as of the transition.
    pub record: TaskRecord,
}

impl TerminalNotice {
    /// Whether a collaborator should activate the task's result.
    pub fn set_as_active_on_completion(&self) -> bool {
        self.record.status == TaskStatus::Completed
            && self.record.metadata.set_as_active_on_completion()
    }
}

enum StoreCommand {
    Upsert {
        record: TaskRecord,
        reply: oneshot::Sender<UpsertOutcome>,
    },
    ApplyEvent {
        event: TaskEvent,
        reply: oneshot::Sender<EventOutcome>,
    },
    BeginStart,
    EndStart,
    BeginResync,
    AbortResync,
    Resync {
        snapshot: Vec<TaskRecord>,
        reply: oneshot::Sender<ResyncReport>,
    },
    Remove {
        handle: TaskHandle,
        reply: oneshot::Sender<RemoveOutcome>,
    },
    Connection(ConnectionState),
    Shutdown,
}

/// Handle to the task store. Cheap to clone; all clones share one owner.
#[derive(Clone)]
pub struct TaskStore {
    tx: mpsc::Sender<StoreCommand>,
    snapshot_rx: watch::Receiver<Arc<StoreSnapshot>>,
    notices: broadcast::Sender<TerminalNotice>,
}

impl TaskStore {
    /// Start the owner task and return a handle to it.
    pub fn spawn(queue_capacity: usize, notice_capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StoreSnapshot::default()));
        let (notices, _) = broadcast::channel(notice_capacity.max(1));

        let owner = StoreOwner {
            table: TaskTable::new(),
            connection: ConnectionState::default(),
            last_resync_at: None,
            version: 0,
            snapshot_tx,
            notices: notices.clone(),
        };
        let join = tokio::spawn(owner.run(rx));

        (
            Self {
                tx,
                snapshot_rx,
                notices,
            },
            join,
        )
    }

    /// Insert or merge forward a record confirmed by the Registry.
    pub async fn upsert(&self, record: TaskRecord) -> Result<UpsertOutcome, ClientError> {
        self.request(|reply| StoreCommand::Upsert { record, reply })
            .await
    }

    /// Merge one channel event.
    pub async fn apply_event(&self, event: TaskEvent) -> Result<EventOutcome, ClientError> {
        self.request(|reply| StoreCommand::ApplyEvent { event, reply })
            .await
    }

    /// Note a start call in flight; events for unknown handles are held until
    /// its record is upserted.
    pub async fn begin_start(&self) -> Result<(), ClientError> {
        self.send(StoreCommand::BeginStart).await
    }

    /// Note a start call finished, successfully or not.
    pub async fn end_start(&self) -> Result<(), ClientError> {
        self.send(StoreCommand::EndStart).await
    }

    /// Open a resync window; events for unknown handles are parked.
    pub async fn begin_resync(&self) -> Result<(), ClientError> {
        self.send(StoreCommand::BeginResync).await
    }

    /// Close the resync window without a snapshot.
    pub async fn abort_resync(&self) -> Result<(), ClientError> {
        self.send(StoreCommand::AbortResync).await
    }

    /// Reconcile against a full Registry snapshot as one atomic mutation.
    pub async fn resync(&self, snapshot: Vec<TaskRecord>) -> Result<ResyncReport, ClientError> {
        self.request(|reply| StoreCommand::Resync { snapshot, reply })
            .await
    }

    /// Remove a terminal task.
    pub async fn remove(&self, handle: TaskHandle) -> Result<RemoveOutcome, ClientError> {
        self.request(|reply| StoreCommand::Remove { handle, reply })
            .await
    }

    /// Record the status channel's health.
    pub async fn set_connection(&self, state: ConnectionState) -> Result<(), ClientError> {
        self.send(StoreCommand::Connection(state)).await
    }

    /// Current view of one task.
    pub fn get(&self, handle: &TaskHandle) -> Option<TaskRecord> {
        self.snapshot_rx.borrow().get(handle).cloned()
    }

    /// Current view of all tasks.
    pub fn list(&self) -> Vec<TaskRecord> {
        self.snapshot_rx.borrow().list()
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// True when live updates may be stale.
    pub fn is_degraded(&self) -> bool {
        self.snapshot_rx.borrow().is_degraded()
    }

    /// Receiver that changes whenever the store publishes a new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Receiver of terminal-transition notices.
    pub fn terminal_notices(&self) -> broadcast::Receiver<TerminalNotice> {
        self.notices.subscribe()
    }

    /// Stop the owner task. Later mutations fail with [`ClientError::StoreClosed`].
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StoreCommand::Shutdown).await;
    }

    async fn send(&self, command: StoreCommand) -> Result<(), ClientError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ClientError::StoreClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| ClientError::StoreClosed)
    }
}

/// Exclusive owner of the task table.
struct StoreOwner {
    table: TaskTable,
    connection: ConnectionState,
    last_resync_at: Option<DateTime<Utc>>,
    version: u64,
    snapshot_tx: watch::Sender<Arc<StoreSnapshot>>,
    notices: broadcast::Sender<TerminalNotice>,
}

impl StoreOwner {
    async fn run(mut self, mut rx: mpsc::Receiver<StoreCommand>) {
        while let Some(command) = rx.recv().await {
            if matches!(command, StoreCommand::Shutdown) {
                break;
            }
            self.handle(command);
        }
        debug!("Task store stopped");
    }

    /// Apply one command. A visible change is published before the caller
    /// is answered, so a caller always reads its own write.
    fn handle(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::Upsert { record, reply } => {
                let handle = record.handle.clone();
                let outcome = self.table.upsert(record);
                match &outcome {
                    UpsertOutcome::Inserted { replayed } => {
                        debug!(handle = %handle, replayed, "Task inserted");
                        if *replayed > 0 && self.table.get(&handle).is_some_and(|r| r.is_terminal()) {
                            self.notify_terminal(&handle);
                        }
                        self.publish();
                    }
                    UpsertOutcome::Updated { from, to } => {
                        if !from.is_terminal() && to.is_terminal() {
                            self.notify_terminal(&handle);
                        }
                        self.publish();
                    }
                    UpsertOutcome::Rejected(anomaly) => {
                        warn!(handle = %handle, anomaly = %anomaly, "Record rejected");
                    }
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::ApplyEvent { event, reply } => {
                let handle = event.handle.clone();
                let outcome = self.table.apply_event(event);
                match &outcome {
                    EventOutcome::Applied { from, to } => {
                        debug!(handle = %handle, from = %from, to = %to, "Event applied");
                        if outcome.reached_terminal() {
                            self.notify_terminal(&handle);
                        }
                        self.publish();
                    }
                    EventOutcome::Parked => {
                        debug!(handle = %handle, "Event parked until its task is known");
                    }
                    EventOutcome::Rejected(anomaly) => {
                        warn!(handle = %handle, anomaly = %anomaly, "Protocol anomaly, event dropped");
                    }
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::BeginStart => self.table.begin_start(),
            StoreCommand::EndStart => {
                let dropped = self.table.end_start();
                if dropped > 0 {
                    warn!(dropped, "Events for unknown tasks dropped after start completed");
                }
            }
            StoreCommand::BeginResync => self.table.begin_resync(),
            StoreCommand::AbortResync => {
                let dropped = self.table.abort_resync();
                if dropped > 0 {
                    warn!(dropped, "Resync aborted, parked events dropped");
                }
            }
            StoreCommand::Resync { snapshot, reply } => {
                let report = self.table.resync(snapshot);
                for anomaly in &report.anomalies {
                    warn!(anomaly = %anomaly, "Protocol anomaly in parked event, dropped");
                }
                for handle in &report.dropped {
                    info!(handle = %handle, "Dropping stale task absent from Registry snapshot");
                }
                for handle in &report.terminal {
                    self.notify_terminal(handle);
                }
                self.last_resync_at = Some(Utc::now());
                self.publish();
                let _ = reply.send(report);
            }
            StoreCommand::Remove { handle, reply } => {
                let outcome = self.table.remove(&handle);
                if matches!(outcome, RemoveOutcome::Removed(_)) {
                    debug!(handle = %handle, "Task removed");
                    self.publish();
                }
                let _ = reply.send(outcome);
            }
            StoreCommand::Connection(state) => {
                if self.connection != state {
                    self.connection = state;
                    self.publish();
                }
            }
            StoreCommand::Shutdown => {}
        }
    }

    fn notify_terminal(&self, handle: &TaskHandle) {
        if let Some(record) = self.table.get(handle) {
            info!(handle = %handle, status = %record.status, "Task reached terminal status");
            // No subscribers is fine.
            let _ = self.notices.send(TerminalNotice {
                record: record.clone(),
            });
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = StoreSnapshot {
            tasks: self.table.tasks().clone(),
            connection: self.connection.clone(),
            last_resync_at: self.last_resync_at,
            version: self.version,
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
