//! Reconciliation of Gateway responses, channel events and resync snapshots.
//!
//! [`TaskTable`] is the synchronous heart of the task store. It holds exactly
//! one record per handle and enforces the lifecycle rules:
//!
//! - status only moves forward along `pending → active → terminal`
//! - progress never decreases while a task is active
//! - nothing leaves a terminal status; only an explicit remove drops it
//!
//! Inputs that would break these rules are returned as
//! [`ProtocolAnomaly`] values and leave the table untouched.

use std::collections::{BTreeMap, BTreeSet};

use crate::task::UNKNOWN_ERROR_DETAIL;
use crate::{ProtocolAnomaly, TaskEvent, TaskHandle, TaskRecord, TaskStatus};

/// Upper bound on events parked in one resync window, and separately on
/// events parked while starts are in flight.
pub const MAX_PARKED_EVENTS: usize = 1024;

/// Result of [`TaskTable::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// The handle was new. `replayed` counts early events applied on top.
    Inserted { replayed: usize },
    /// An existing record was merged forward.
    Updated { from: TaskStatus, to: TaskStatus },
    /// The record would have broken the lifecycle; nothing changed.
    Rejected(ProtocolAnomaly),
}

/// Result of [`TaskTable::apply_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// The event was merged into its record.
    Applied { from: TaskStatus, to: TaskStatus },
    /// The handle is unknown but a resync or a start is in flight; the event
    /// is held until the record lands.
    Parked,
    /// The event was dropped.
    Rejected(ProtocolAnomaly),
}

impl EventOutcome {
    /// Returns true if this event moved its task into a terminal status.
    pub fn reached_terminal(&self) -> bool {
        matches!(self, Self::Applied { from, to } if !from.is_terminal() && to.is_terminal())
    }
}

/// Result of [`TaskTable::remove`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoveOutcome {
    /// The record was terminal and has been removed.
    Removed(TaskRecord),
    /// The record exists but is still in flight.
    NotTerminal(TaskStatus),
    /// No record for the handle.
    Unknown,
}

/// Summary of one snapshot reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResyncReport {
    /// Handles that appeared for the first time.
    pub inserted: Vec<TaskHandle>,
    /// Handles whose record moved forward from the snapshot.
    pub updated: Vec<TaskHandle>,
    /// Non-terminal handles the Registry no longer knows.
    pub dropped: Vec<TaskHandle>,
    /// Handles where the local record was already ahead of the snapshot.
    pub kept_local: Vec<TaskHandle>,
    /// Known handles that became terminal during this resync.
    pub terminal: Vec<TaskHandle>,
    /// Parked events applied after the snapshot.
    pub replayed: usize,
    /// Parked events that still could not be applied.
    pub anomalies: Vec<ProtocolAnomaly>,
}

/// One record per handle, merged under the lifecycle rules.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: BTreeMap<TaskHandle, TaskRecord>,
    /// `Some` while a resync is in flight.
    window: Option<ResyncWindow>,
    /// Start calls awaiting their Registry reply.
    starts_in_flight: usize,
    /// Events for unknown handles received while a start is in flight; the
    /// channel may report a new task before its start reply arrives.
    early: Vec<TaskEvent>,
}

/// State held between the start of a resync and its snapshot landing.
#[derive(Debug, Clone, Default)]
struct ResyncWindow {
    /// Events for handles not yet known.
    parked: Vec<TaskEvent>,
    /// Handles inserted after the window opened; the snapshot may predate them.
    fresh: BTreeSet<TaskHandle>,
}

impl TaskTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record.
    pub fn get(&self, handle: &TaskHandle) -> Option<&TaskRecord> {
        self.tasks.get(handle)
    }

    /// All records, ordered by handle.
    pub fn tasks(&self) -> &BTreeMap<TaskHandle, TaskRecord> {
        &self.tasks
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns true between [`begin_resync`](Self::begin_resync) and the
    /// matching [`resync`](Self::resync) or [`abort_resync`](Self::abort_resync).
    pub fn in_resync(&self) -> bool {
        self.window.is_some()
    }

    /// Insert a record, or merge it forward into the existing one.
    pub fn upsert(&mut self, record: TaskRecord) -> UpsertOutcome {
        match self.tasks.get_mut(&record.handle) {
            Some(current) => match merge_record(current, record) {
                Ok((from, to)) => UpsertOutcome::Updated { from, to },
                Err(anomaly) => UpsertOutcome::Rejected(anomaly),
            },
            None => {
                let handle = record.handle.clone();
                if let Some(window) = self.window.as_mut() {
                    window.fresh.insert(handle.clone());
                }
                self.tasks.insert(handle.clone(), record);
                let replayed = self.replay_early(&handle);
                UpsertOutcome::Inserted { replayed }
            }
        }
    }

    /// Note that a start call is in flight. Until the matching
    /// [`end_start`](Self::end_start), events for unknown handles are held
    /// and replayed when [`upsert`](Self::upsert) inserts their record.
    pub fn begin_start(&mut self) {
        self.starts_in_flight += 1;
    }

    /// Note that a start call finished. Once no start is in flight, held
    /// events that never found their record are dropped.
    ///
    /// Returns the number of events dropped.
    pub fn end_start(&mut self) -> usize {
        self.starts_in_flight = self.starts_in_flight.saturating_sub(1);
        if self.starts_in_flight == 0 {
            std::mem::take(&mut self.early).len()
        } else {
            0
        }
    }

    /// Apply held early events for `handle` in arrival order.
    fn replay_early(&mut self, handle: &TaskHandle) -> usize {
        if self.early.is_empty() {
            return 0;
        }
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.early)
            .into_iter()
            .partition(|event| &event.handle == handle);
        self.early = rest;

        let mut replayed = 0;
        if let Some(record) = self.tasks.get_mut(handle) {
            for event in matching {
                if let EventOutcome::Applied { .. } = merge_event(record, event) {
                    replayed += 1;
                }
            }
        }
        replayed
    }

    /// Merge one channel event into its record.
    pub fn apply_event(&mut self, event: TaskEvent) -> EventOutcome {
        match self.tasks.get_mut(&event.handle) {
            Some(record) => merge_event(record, event),
            None => self.park_or_reject(event),
        }
    }

    /// Open a resync window: events for unknown handles are parked instead of
    /// rejected until the snapshot is applied.
    pub fn begin_resync(&mut self) {
        if self.window.is_none() {
            self.window = Some(ResyncWindow::default());
        }
    }

    /// Close the resync window without a snapshot, dropping parked events.
    ///
    /// Returns the number of events dropped.
    pub fn abort_resync(&mut self) -> usize {
        self.window.take().map(|window| window.parked.len()).unwrap_or(0)
    }

    /// Reconcile the table against a full Registry snapshot.
    ///
    /// - handles in both are merged forward (a snapshot behind the local
    ///   record leaves the local record alone; one in the same terminal
    ///   status refreshes progress, counters and annotations)
    /// - handles only in the snapshot are inserted
    /// - non-terminal handles missing from the snapshot are dropped, unless
    ///   they were inserted after the resync window opened
    /// - terminal handles missing from the snapshot stay until dismissed
    ///
    /// Any events parked since [`begin_resync`](Self::begin_resync) are
    /// replayed afterwards. Those still without a record stay held while a
    /// start is in flight.
    pub fn resync(&mut self, snapshot: Vec<TaskRecord>) -> ResyncReport {
        let window = self.window.take().unwrap_or_default();
        let mut report = ResyncReport::default();
        let mut present = BTreeSet::new();

        for record in snapshot {
            let handle = record.handle.clone();
            present.insert(handle.clone());

            match self.tasks.get_mut(&handle) {
                Some(current) => match merge_record(current, record) {
                    Ok((from, to)) => {
                        if !from.is_terminal() && to.is_terminal() {
                            report.terminal.push(handle.clone());
                        }
                        report.updated.push(handle);
                    }
                    Err(_) => report.kept_local.push(handle),
                },
                None => {
                    self.tasks.insert(handle.clone(), record);
                    report.replayed += self.replay_early(&handle);
                    report.inserted.push(handle);
                }
            }
        }

        let stale: Vec<TaskHandle> = self
            .tasks
            .values()
            .filter(|record| {
                !record.is_terminal()
                    && !present.contains(&record.handle)
                    && !window.fresh.contains(&record.handle)
            })
            .map(|record| record.handle.clone())
            .collect();
        for handle in stale {
            self.tasks.remove(&handle);
            report.dropped.push(handle);
        }

        for event in window.parked {
            let handle = event.handle.clone();
            match self.apply_event(event) {
                outcome @ EventOutcome::Applied { .. } => {
                    if outcome.reached_terminal() {
                        report.terminal.push(handle);
                    }
                    report.replayed += 1;
                }
                EventOutcome::Rejected(anomaly) => report.anomalies.push(anomaly),
                EventOutcome::Parked => {}
            }
        }

        report
    }

    /// Remove a terminal record.
    pub fn remove(&mut self, handle: &TaskHandle) -> RemoveOutcome {
        match self.tasks.get(handle).map(|record| record.status) {
            None => RemoveOutcome::Unknown,
            Some(status) if !status.is_terminal() => RemoveOutcome::NotTerminal(status),
            Some(_) => self
                .tasks
                .remove(handle)
                .map(RemoveOutcome::Removed)
                .unwrap_or(RemoveOutcome::Unknown),
        }
    }

    fn park_or_reject(&mut self, event: TaskEvent) -> EventOutcome {
        if let Some(window) = self.window.as_mut() {
            if window.parked.len() < MAX_PARKED_EVENTS {
                window.parked.push(event);
                return EventOutcome::Parked;
            }
            return EventOutcome::Rejected(ProtocolAnomaly::ParkingOverflow(event.handle));
        }
        if self.starts_in_flight > 0 {
            if self.early.len() < MAX_PARKED_EVENTS {
                self.early.push(event);
                return EventOutcome::Parked;
            }
            return EventOutcome::Rejected(ProtocolAnomaly::ParkingOverflow(event.handle));
        }
        EventOutcome::Rejected(ProtocolAnomaly::UnknownHandle(event.handle))
    }
}

/// Check that moving `current` to `status` (and `progress`) is a legal step.
fn check_transition(
    current: &TaskRecord,
    status: TaskStatus,
    progress: Option<f64>,
) -> Result<(), ProtocolAnomaly> {
    if current.status.is_terminal() {
        return Err(ProtocolAnomaly::AlreadyTerminal {
            handle: current.handle.clone(),
            status: current.status,
        });
    }
    if !current.status.can_transition_to(status) {
        return Err(ProtocolAnomaly::StatusRegression {
            handle: current.handle.clone(),
            from: current.status,
            to: status,
        });
    }
    if current.status == TaskStatus::Active && status == TaskStatus::Active {
        if let Some(progress) = progress {
            if progress < current.progress {
                return Err(ProtocolAnomaly::ProgressRegression {
                    handle: current.handle.clone(),
                    from: current.progress,
                    to: progress,
                });
            }
        }
    }
    Ok(())
}

fn error_detail_for(status: TaskStatus, incoming: Option<String>, current: Option<String>) -> Option<String> {
    match status {
        TaskStatus::Error => Some(
            incoming
                .or(current)
                .unwrap_or_else(|| UNKNOWN_ERROR_DETAIL.to_string()),
        ),
        _ => None,
    }
}

fn merge_event(record: &mut TaskRecord, event: TaskEvent) -> EventOutcome {
    if let Some(kind) = event.kind {
        if kind != record.kind() {
            return EventOutcome::Rejected(ProtocolAnomaly::KindMismatch {
                handle: record.handle.clone(),
                expected: record.kind(),
                actual: kind,
            });
        }
    }
    if let Err(anomaly) = check_transition(record, event.status, event.progress) {
        return EventOutcome::Rejected(anomaly);
    }

    let from = record.status;
    record.status = event.status;
    if let Some(progress) = event.progress {
        record.progress = record.progress.max(progress);
    }
    if event.counters.is_some() {
        record.counters = event.counters;
    }
    record.error_detail = error_detail_for(
        event.status,
        event.error_detail,
        record.error_detail.take(),
    );
    record.annotations.extend(event.metadata_deltas);

    EventOutcome::Applied {
        from,
        to: record.status,
    }
}

fn merge_record(
    current: &mut TaskRecord,
    incoming: TaskRecord,
) -> Result<(TaskStatus, TaskStatus), ProtocolAnomaly> {
    if incoming.kind() != current.kind() {
        return Err(ProtocolAnomaly::KindMismatch {
            handle: current.handle.clone(),
            expected: current.kind(),
            actual: incoming.kind(),
        });
    }
    // A record in the same terminal status is a refresh, not a transition.
    let refresh = current.status.is_terminal() && current.status == incoming.status;
    if !refresh {
        check_transition(current, incoming.status, Some(incoming.progress))?;
    }

    let from = current.status;
    current.status = incoming.status;
    current.progress = current.progress.max(incoming.progress);
    current.counters = incoming.counters.or(current.counters);
    current.error_detail = error_detail_for(
        incoming.status,
        incoming.error_detail,
        current.error_detail.take(),
    );
    current.annotations.extend(incoming.annotations);

    Ok((from, current.status))
}
