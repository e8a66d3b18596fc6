//! In-process fake Registry for integration tests.
//!
//! Serves the command endpoints and the status channel under `/api/tasks` on
//! an ephemeral port. Behaviour is steered by the start metadata:
//! - repo `forbidden`: 422 with a `detail`
//! - repo `boom`: 500 with no body
//! - repo `slow`: answers after one second
//! - repo `fast`: the task finishes on the channel before the reply is sent
//! - repo `broken`: replies with the task already in `error`

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tasklink_client::{ClientConfig, ReconnectPolicy, StoreSnapshot, TaskStore};

/// Frame that makes the fake Registry close every open channel.
pub const CLOSE_FRAME: &str = "__close__";

#[derive(Default)]
struct Tasks {
    records: BTreeMap<String, Value>,
    /// Raw items appended to every snapshot, for malformed-input tests.
    extra_items: Vec<Value>,
}

struct RegistryState {
    tasks: Mutex<Tasks>,
    next_id: AtomicU64,
    requests: Mutex<Vec<String>>,
    frames: broadcast::Sender<String>,
    connections: AtomicUsize,
}

impl RegistryState {
    fn log(&self, request: impl Into<String>) {
        self.requests.lock().unwrap().push(request.into());
    }
}

pub struct FakeRegistry {
    state: Arc<RegistryState>,
    addr: SocketAddr,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        let (frames, _) = broadcast::channel(64);
        let state = Arc::new(RegistryState {
            tasks: Mutex::new(Tasks::default()),
            next_id: AtomicU64::new(1),
            requests: Mutex::new(Vec::new()),
            frames,
            connections: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route("/api/tasks/start", post(start))
            .route("/api/tasks/cancel", post(cancel))
            .route("/api/tasks/dismiss", post(dismiss))
            .route("/api/tasks/snapshot", get(snapshot))
            .route("/api/tasks/events", get(events))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { state, addr }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api/tasks", self.addr)
    }

    /// Client config pointed at this registry with short timeouts.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::for_base_url(&self.base_url())
            .with_request_timeout(Duration::from_millis(300))
            .with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(50)))
    }

    /// Paths of every command request received, in order.
    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Add or replace a task record.
    pub fn insert(&self, record: Value) {
        let handle = record["handle"].as_str().unwrap().to_string();
        self.state.tasks.lock().unwrap().records.insert(handle, record);
    }

    /// Change a task's status and progress on the Registry side only.
    pub fn set_status(&self, handle: &str, status: &str, progress: f64) {
        let mut tasks = self.state.tasks.lock().unwrap();
        let record = tasks.records.get_mut(handle).unwrap();
        record["status"] = json!(status);
        record["progress"] = json!(progress);
    }

    /// Forget a task, as if the Registry restarted without it.
    pub fn remove(&self, handle: &str) {
        self.state.tasks.lock().unwrap().records.remove(handle);
    }

    pub fn add_raw_snapshot_item(&self, item: Value) {
        self.state.tasks.lock().unwrap().extra_items.push(item);
    }

    /// Push one frame to every open channel.
    pub fn push(&self, frame: &str) {
        let _ = self.state.frames.send(frame.to_string());
    }

    /// Channels accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` channels have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.connections() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {count} connections");
    }
}

/// Wait until the store publishes a snapshot matching `predicate`.
pub async fn wait_for_store(
    store: &TaskStore,
    what: &str,
    predicate: impl Fn(&StoreSnapshot) -> bool,
) {
    let mut rx = store.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn detail(code: StatusCode, detail: &str) -> Response {
    (code, Json(json!({ "detail": detail }))).into_response()
}

async fn start(State(state): State<Arc<RegistryState>>, Json(body): Json<Value>) -> Response {
    state.log("/start");

    match body["metadata"]["repo"].as_str() {
        Some("forbidden") => {
            return detail(StatusCode::UNPROCESSABLE_ENTITY, "repo forbidden is gated")
        }
        Some("boom") => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Some("slow") => tokio::time::sleep(Duration::from_secs(1)).await,
        _ => {}
    }

    let repo = body["metadata"]["repo"].as_str().unwrap_or_default().to_string();
    let handle = format!("T{}", state.next_id.fetch_add(1, Ordering::SeqCst));
    let status = if repo == "broken" { "error" } else { "pending" };
    let record = json!({
        "handle": handle,
        "kind": body["kind"],
        "status": status,
        "progress": 0,
        "metadata": body["metadata"],
    });
    state
        .tasks
        .lock()
        .unwrap()
        .records
        .insert(handle.clone(), record);

    if repo == "fast" {
        if let Some(record) = state.tasks.lock().unwrap().records.get_mut(&handle) {
            record["status"] = json!("completed");
            record["progress"] = json!(100);
        }
        let _ = state.frames.send(
            json!({ "handle": handle, "status": "active", "progress": 40 }).to_string(),
        );
        let _ = state.frames.send(
            json!({ "handle": handle, "status": "completed", "progress": 100 }).to_string(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Json(json!({ "handle": handle, "status": status })).into_response()
}

async fn cancel(State(state): State<Arc<RegistryState>>, Json(body): Json<Value>) -> Response {
    state.log("/cancel");
    let handle = body["handle"].as_str().unwrap_or_default();

    let mut tasks = state.tasks.lock().unwrap();
    match tasks.records.get_mut(handle) {
        Some(record) => {
            if !is_terminal(record) {
                record["status"] = json!("cancelled");
            }
            Json(json!({ "success": true, "message": "cancel requested" })).into_response()
        }
        None => detail(StatusCode::NOT_FOUND, "unknown task"),
    }
}

async fn dismiss(State(state): State<Arc<RegistryState>>, Json(body): Json<Value>) -> Response {
    state.log("/dismiss");
    let handle = body["handle"].as_str().unwrap_or_default();

    let mut tasks = state.tasks.lock().unwrap();
    match tasks.records.get(handle) {
        Some(record) if is_terminal(record) => {
            tasks.records.remove(handle);
            Json(json!({ "success": true, "message": "dismissed" })).into_response()
        }
        Some(_) => Json(json!({ "success": false, "detail": "not terminal" })).into_response(),
        None => detail(StatusCode::NOT_FOUND, "unknown task"),
    }
}

async fn snapshot(State(state): State<Arc<RegistryState>>) -> Json<Value> {
    state.log("/snapshot");
    let tasks = state.tasks.lock().unwrap();
    let mut items: Vec<Value> = tasks.records.values().cloned().collect();
    items.extend(tasks.extra_items.iter().cloned());
    Json(json!({ "items": items }))
}

async fn events(State(state): State<Arc<RegistryState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| channel(socket, state))
}

async fn channel(mut socket: WebSocket, state: Arc<RegistryState>) {
    let mut frames = state.frames.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) if frame == CLOSE_FRAME => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

fn is_terminal(record: &Value) -> bool {
    matches!(
        record["status"].as_str(),
        Some("completed" | "error" | "cancelled")
    )
}
