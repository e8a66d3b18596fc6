//! Status channel supervisor.
//!
//! Keeps one status channel connection alive for the lifetime of the
//! process:
//!
//! ```text
//! disconnected -> connecting -> connected -> (degraded | disconnected)
//!       ^                                            |
//!       +-------------- backoff delay ---------------+
//! ```
//!
//! Every successful connect starts a full resync, because the channel does
//! not replay events missed while it was down. The channel only reports
//! `connected` once that first resync has landed, and the backoff only starts
//! over after such a session. The reconnect loop never gives up; operators
//! see the degraded flag instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tasklink_core::{EventOutcome, ResyncReport, TaskEvent};

use crate::channel::{FrameStream, SnapshotSource, StatusSource};
use crate::config::ReconnectPolicy;
use crate::error::ClientError;
use crate::store::TaskStore;

/// Health of the status channel as shown to operators.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected; retrying after `retry_in` when set.
    Disconnected { retry_in: Option<Duration> },

    /// Connection attempt in progress.
    Connecting { attempt: u32 },

    /// Connected and in sync with the Registry.
    Connected,

    /// Connected, but the last resync failed so the store may be stale.
    Degraded { reason: String },
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected { retry_in: None }
    }
}

impl ConnectionState {
    /// True whenever live updates may be missing from the store.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Connected)
    }

    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected { .. } => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected => "connected",
            Self::Degraded { .. } => "degraded",
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    /// `healthy` is set when a resync completed during the session.
    Closed { reason: String, healthy: bool },
}

/// Owns the status channel lifecycle and feeds the task store.
pub struct ChannelSupervisor {
    source: Arc<dyn StatusSource>,
    snapshots: Arc<dyn SnapshotSource>,
    store: TaskStore,
    policy: ReconnectPolicy,
}

/// Running supervisor.
pub struct SupervisorHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Close the channel and wait for the supervisor to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

impl ChannelSupervisor {
    /// Create a new ChannelSupervisor.
    pub fn new(
        source: Arc<dyn StatusSource>,
        snapshots: Arc<dyn SnapshotSource>,
        store: TaskStore,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            source,
            snapshots,
            store,
            policy,
        }
    }

    /// Run the supervisor on its own task.
    pub fn spawn(self) -> SupervisorHandle {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));
        SupervisorHandle { shutdown, task }
    }

    /// Connect, pump events, reconnect with backoff; returns only once
    /// `shutdown` is cancelled or the store is gone.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if self
                .set_state(ConnectionState::Connecting {
                    attempt: attempt + 1,
                })
                .await
                .is_err()
            {
                break;
            }

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.source.connect() => result,
            };

            match connected {
                Ok(frames) => {
                    info!("Status channel connected, resyncing");
                    match self.run_session(frames, &shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed { reason, healthy } => {
                            warn!(reason = %reason, healthy, "Status channel lost");
                            if healthy {
                                attempt = 0;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempt + 1, "Failed to connect status channel");
                }
            }

            let delay = self.policy.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            if self
                .set_state(ConnectionState::Disconnected {
                    retry_in: Some(delay),
                })
                .await
                .is_err()
            {
                break;
            }
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting status channel");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let _ = self
            .set_state(ConnectionState::Disconnected { retry_in: None })
            .await;
        info!("Channel supervisor stopped");
    }

    /// Pump frames until the channel closes. The connection state stays as
    /// the caller left it until the first resync reports back.
    async fn run_session(&self, mut frames: FrameStream, shutdown: &CancellationToken) -> SessionEnd {
        let mut healthy = false;
        let session = shutdown.child_token();
        let (resync_tx, mut resync_rx) = mpsc::channel(4);
        tokio::spawn(resync_until_done(
            self.snapshots.clone(),
            self.store.clone(),
            self.policy.clone(),
            session.clone(),
            resync_tx,
        ));

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,

                Some(result) = resync_rx.recv() => {
                    let state = match result {
                        Ok(report) => {
                            log_resync(&report);
                            healthy = true;
                            ConnectionState::Connected
                        }
                        Err(e) => {
                            warn!(error = %e, "Resync failed, live updates may be stale");
                            ConnectionState::Degraded { reason: e.message() }
                        }
                    };
                    if self.set_state(state).await.is_err() {
                        break SessionEnd::Shutdown;
                    }
                }

                frame = frames.next() => match frame {
                    Some(Ok(text)) => {
                        if self.handle_frame(&text).await.is_err() {
                            break SessionEnd::Shutdown;
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Closed {
                        reason: e.to_string(),
                        healthy,
                    },
                    None => break SessionEnd::Closed {
                        reason: "closed by peer".to_string(),
                        healthy,
                    },
                },
            }
        };

        session.cancel();
        end
    }

    /// Parse and apply one frame. Only a closed store is an error; bad frames
    /// are logged and dropped.
    async fn handle_frame(&self, text: &str) -> Result<(), ClientError> {
        let event = match TaskEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Discarding malformed status frame");
                return Ok(());
            }
        };

        let handle = event.handle.clone();
        match self.store.apply_event(event).await? {
            EventOutcome::Applied { from, to } => {
                debug!(handle = %handle, from = %from, to = %to, "Status event applied");
            }
            EventOutcome::Parked => {}
            // Already logged by the store.
            EventOutcome::Rejected(_) => {}
        }
        Ok(())
    }

    async fn set_state(&self, state: ConnectionState) -> Result<(), ClientError> {
        self.store.set_connection(state).await
    }
}

/// Fetch a snapshot and reconcile it, retrying with backoff until it lands or
/// the session ends. Each attempt reports back on `results`.
async fn resync_until_done(
    snapshots: Arc<dyn SnapshotSource>,
    store: TaskStore,
    policy: ReconnectPolicy,
    session: CancellationToken,
    results: mpsc::Sender<Result<ResyncReport, ClientError>>,
) {
    let mut attempt: u32 = 0;

    loop {
        if store.begin_resync().await.is_err() {
            return;
        }

        let fetched = tokio::select! {
            _ = session.cancelled() => {
                let _ = store.abort_resync().await;
                return;
            }
            fetched = snapshots.snapshot() => fetched,
        };

        match fetched {
            Ok(items) => {
                if let Ok(report) = store.resync(items).await {
                    let _ = results.send(Ok(report)).await;
                }
                return;
            }
            Err(e) => {
                let _ = store.abort_resync().await;
                let _ = results.send(Err(e)).await;
            }
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = session.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn log_resync(report: &ResyncReport) {
    info!(
        inserted = report.inserted.len(),
        updated = report.updated.len(),
        dropped = report.dropped.len(),
        kept_local = report.kept_local.len(),
        replayed = report.replayed,
        "Resync complete"
    );
}
