//! Command gateway: start, cancel and dismiss calls against the Registry.
//!
//! Every call is an independent request bounded by the configured timeout.
//! Only a successful start or dismiss touches the store; a failed or timed out
//! call leaves it exactly as it was.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use tasklink_core::{
    AdoptRepairMetadata, DownloadMetadata, InstallMetadata, RemoveOutcome, ResyncReport,
    RunMetadata, TaskHandle, TaskKind, TaskMetadata, TaskRecord, TaskStatus,
};

use crate::channel::SnapshotSource;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::{HttpClient, RequestFailure};
use crate::store::TaskStore;

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    kind: TaskKind,
    metadata: &'a Value,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    handle: TaskHandle,
    #[serde(default)]
    status: TaskStatus,
}

#[derive(Debug, Serialize)]
struct HandleRequest<'a> {
    handle: &'a TaskHandle,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    items: Vec<Value>,
}

/// Result of a cancel request. Advisory only; the status channel reports the
/// actual transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: String,
    /// The store's status for the task when the call returned, if it holds it.
    pub status: Option<TaskStatus>,
}

/// Issues lifecycle commands to the Registry and records their results in the
/// task store.
pub struct CommandGateway {
    http: HttpClient,
    store: TaskStore,
}

impl CommandGateway {
    /// Create a new CommandGateway.
    pub fn new(config: &ClientConfig, store: TaskStore) -> Result<Self, ClientError> {
        let http = HttpClient::new(&config.base_url, config.request_timeout)?;
        Ok(Self { http, store })
    }

    /// The store this gateway records into.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Start a task. Metadata is validated before any request is sent, and the
    /// new record is in the store by the time this returns.
    ///
    /// Channel events that reach the store before the Registry's reply are
    /// held and applied once the record is inserted.
    pub async fn start(&self, metadata: TaskMetadata) -> Result<TaskRecord, ClientError> {
        metadata.validate()?;

        self.store.begin_start().await?;
        let started = self.request_start(metadata).await;
        let ended = self.store.end_start().await;
        let record = started?;
        ended?;
        Ok(record)
    }

    async fn request_start(&self, metadata: TaskMetadata) -> Result<TaskRecord, ClientError> {
        let kind = metadata.kind();
        let fallback = format!("failed to start {kind} task");

        let body = metadata.to_value();
        let response: StartResponse = self
            .http
            .post_json(
                "/start",
                &StartRequest {
                    kind,
                    metadata: &body,
                },
            )
            .await
            .map_err(|f| translate(f, &fallback, ClientError::Validation))?;

        if response.handle.is_blank() {
            return Err(ClientError::Transport(format!(
                "{fallback}: registry returned an empty handle"
            )));
        }

        let record = TaskRecord::pending(response.handle, metadata)
            .with_status(response.status)
            .normalize()?;
        info!(handle = %record.handle, kind = %kind, "Task started");
        self.store.upsert(record.clone()).await?;

        // Events may already have moved the record forward.
        Ok(self.store.get(&record.handle).unwrap_or(record))
    }

    /// Start a download task.
    pub async fn start_download(
        &self,
        metadata: DownloadMetadata,
    ) -> Result<TaskRecord, ClientError> {
        self.start(TaskMetadata::Download(metadata)).await
    }

    /// Start an environment install task.
    pub async fn start_install(&self, metadata: InstallMetadata) -> Result<TaskRecord, ClientError> {
        self.start(TaskMetadata::Install(metadata)).await
    }

    /// Start an environment run task.
    pub async fn start_run(&self, metadata: RunMetadata) -> Result<TaskRecord, ClientError> {
        self.start(TaskMetadata::Run(metadata)).await
    }

    /// Start an adoption repair task.
    pub async fn start_adopt_repair(
        &self,
        metadata: AdoptRepairMetadata,
    ) -> Result<TaskRecord, ClientError> {
        self.start(TaskMetadata::AdoptRepair(metadata)).await
    }

    /// Ask the Registry to cancel a task.
    ///
    /// Idempotent: a task the store already holds as terminal succeeds with
    /// its unchanged status and no request is sent. The store is never
    /// mutated here.
    pub async fn cancel(&self, handle: &TaskHandle) -> Result<CancelOutcome, ClientError> {
        if let Some(record) = self.store.get(handle) {
            if record.is_terminal() {
                debug!(handle = %handle, status = %record.status, "Cancel on terminal task, nothing to do");
                return Ok(CancelOutcome {
                    success: true,
                    message: format!("task already {}", record.status),
                    status: Some(record.status),
                });
            }
        }

        let fallback = format!("failed to cancel task {handle}");
        let reply: CommandReply = self
            .http
            .post_json("/cancel", &HandleRequest { handle })
            .await
            .map_err(|f| translate(f, &fallback, ClientError::InvalidState))?;

        if !reply.success {
            return Err(ClientError::InvalidState(reply_message(reply, &fallback)));
        }

        info!(handle = %handle, "Cancel requested");
        Ok(CancelOutcome {
            success: true,
            message: reply.message,
            status: self.store.get(handle).map(|r| r.status),
        })
    }

    /// Dismiss a terminal task and remove it from the store.
    ///
    /// A Registry that no longer knows the task (404) has nothing left to
    /// dismiss, so the local record is removed as well.
    pub async fn dismiss(&self, handle: &TaskHandle) -> Result<(), ClientError> {
        let record = self
            .store
            .get(handle)
            .ok_or_else(|| ClientError::UnknownHandle(handle.clone()))?;
        if !record.is_terminal() {
            return Err(ClientError::InvalidState("not terminal".to_string()));
        }

        let fallback = format!("failed to dismiss task {handle}");
        let sent = self
            .http
            .post_json::<_, CommandReply>("/dismiss", &HandleRequest { handle })
            .await;
        match sent {
            Ok(reply) if !reply.success => {
                return Err(ClientError::InvalidState(reply_message(reply, &fallback)));
            }
            Ok(_) => {}
            Err(RequestFailure::Status { code: 404, detail }) => {
                info!(
                    handle = %handle,
                    detail = detail.as_deref().unwrap_or_default(),
                    "Registry no longer knows task, removing local record"
                );
            }
            Err(failure) => return Err(translate(failure, &fallback, ClientError::InvalidState)),
        }

        match self.store.remove(handle.clone()).await? {
            RemoveOutcome::Removed(_) => {
                info!(handle = %handle, "Task dismissed");
                Ok(())
            }
            // Removed concurrently; the outcome is the same.
            RemoveOutcome::Unknown => Ok(()),
            RemoveOutcome::NotTerminal(status) => Err(ClientError::InvalidState(format!(
                "not terminal (status {status})"
            ))),
        }
    }

    /// Fetch every task the Registry knows. Items that fail to parse are
    /// logged and skipped.
    pub async fn snapshot(&self) -> Result<Vec<TaskRecord>, ClientError> {
        let fallback = "failed to fetch task snapshot";
        let response: SnapshotResponse = self
            .http
            .get_json("/snapshot")
            .await
            .map_err(|f| translate(f, fallback, ClientError::Transport))?;

        let mut records = Vec::with_capacity(response.items.len());
        for item in response.items {
            match serde_json::from_value::<TaskRecord>(item) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping malformed snapshot item"),
            }
        }
        debug!(count = records.len(), "Snapshot fetched");
        Ok(records)
    }

    /// Fetch a snapshot and reconcile the store against it.
    pub async fn load_snapshot(&self) -> Result<ResyncReport, ClientError> {
        self.store.begin_resync().await?;
        match self.snapshot().await {
            Ok(records) => self.store.resync(records).await,
            Err(e) => {
                self.store.abort_resync().await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SnapshotSource for CommandGateway {
    async fn snapshot(&self) -> Result<Vec<TaskRecord>, ClientError> {
        CommandGateway::snapshot(self).await
    }
}

/// Map a failed request to a client error. A Registry `detail` is surfaced
/// verbatim; 4xx answers use `rejected`, everything else is a transport error.
fn translate(
    failure: RequestFailure,
    fallback: &str,
    rejected: fn(String) -> ClientError,
) -> ClientError {
    match failure {
        RequestFailure::Status { code, detail } => {
            let message = detail.unwrap_or_else(|| fallback.to_string());
            if (400..500).contains(&code) {
                rejected(message)
            } else {
                ClientError::Transport(message)
            }
        }
        RequestFailure::Transport(reason) => ClientError::Transport(format!("{fallback}: {reason}")),
    }
}

fn reply_message(reply: CommandReply, fallback: &str) -> String {
    match reply.detail {
        Some(detail) if !detail.is_empty() => detail,
        _ if !reply.message.is_empty() => reply.message,
        _ => fallback.to_string(),
    }
}
