//! Status channel and supervisor against the fake Registry.

mod support;

use std::time::Duration;

use tokio_stream::StreamExt;

use support::{wait_for_store, FakeRegistry, CLOSE_FRAME};
use tasklink_client::{ConnectionState, StatusSource, TaskLink, WebSocketSource};
use tasklink_core::{DownloadMetadata, TaskStatus};

fn download(activate: bool) -> DownloadMetadata {
    DownloadMetadata {
        repo: "X".to_string(),
        file: "Y".to_string(),
        target_path: None,
        set_as_active_on_completion: activate,
    }
}

#[tokio::test]
async fn test_websocket_source_yields_text_frames() {
    let registry = FakeRegistry::start().await;
    let source = WebSocketSource::new(registry.config().channel_url);

    let mut frames = source.connect().await.unwrap();
    registry.wait_for_connections(1).await;
    registry.push(r#"{"handle":"T1","status":"active"}"#);
    registry.push(CLOSE_FRAME);

    let first = tokio::time::timeout(Duration::from_secs(5), frames.next())
        .await
        .unwrap();
    assert_eq!(
        first.unwrap().unwrap(),
        r#"{"handle":"T1","status":"active"}"#
    );

    // The close frame ends the stream.
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        let mut leftover = Vec::new();
        while let Some(frame) = frames.next().await {
            leftover.push(frame);
        }
        leftover
    })
    .await
    .unwrap();
    assert!(rest.iter().all(|frame| frame.is_err()));
}

#[tokio::test]
async fn test_connect_to_missing_channel_fails() {
    let source = WebSocketSource::new("ws://127.0.0.1:9/api/tasks/events");
    assert!(source.connect().await.is_err());
}

#[tokio::test]
async fn test_events_drive_task_to_completion() {
    let registry = FakeRegistry::start().await;
    let link = TaskLink::start(registry.config()).unwrap();
    let mut notices = link.store().terminal_notices();

    registry.wait_for_connections(1).await;
    wait_for_store(link.store(), "connected", |s| s.connection == ConnectionState::Connected).await;

    let record = link.gateway().start_download(download(true)).await.unwrap();
    let handle = record.handle.clone();

    registry.push(&format!(
        r#"{{"handle":"{handle}","status":"downloading","progress":40,"counters":{{"done":40,"total":100}}}}"#
    ));
    registry.push("{garbage");
    registry.push(&format!(r#"{{"handle":"{handle}","status":"active","progress":10}}"#));
    registry.push(&format!(
        r#"{{"handle":"{handle}","status":"completed","progress":100,"metadataDeltas":{{"sha":"abc"}}}}"#
    ));

    wait_for_store(link.store(), "completed", |s| {
        s.get(&handle).map(|r| r.status) == Some(TaskStatus::Completed)
    })
    .await;

    let stored = link.store().get(&handle).unwrap();
    assert_eq!(stored.progress, 100.0);
    assert_eq!(stored.metadata, record.metadata);
    assert_eq!(stored.annotations.get("sha"), Some(&serde_json::json!("abc")));

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.record.handle, handle);
    assert!(notice.set_as_active_on_completion());

    // A repeated terminal event is an anomaly and changes nothing.
    registry.push(&format!(r#"{{"handle":"{handle}","status":"cancelled"}}"#));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(link.store().get(&handle).unwrap().status, TaskStatus::Completed);
    assert_eq!(registry.connections(), 1);

    link.shutdown().await;
}

#[tokio::test]
async fn test_task_finishing_before_start_reply_is_kept() {
    let registry = FakeRegistry::start().await;
    let link = TaskLink::start(registry.config()).unwrap();
    let mut notices = link.store().terminal_notices();

    registry.wait_for_connections(1).await;
    wait_for_store(link.store(), "connected", |s| s.connection == ConnectionState::Connected).await;

    let mut metadata = download(true);
    metadata.repo = "fast".to_string();
    let record = link.gateway().start_download(metadata).await.unwrap();
    let handle = record.handle.clone();

    wait_for_store(link.store(), "completed", |s| {
        s.get(&handle).map(|r| r.status) == Some(TaskStatus::Completed)
    })
    .await;
    assert_eq!(link.store().get(&handle).unwrap().progress, 100.0);

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.record.handle, handle);
    assert!(notice.set_as_active_on_completion());

    link.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_resyncs_missed_transitions() {
    let registry = FakeRegistry::start().await;
    let link = TaskLink::start(registry.config()).unwrap();
    registry.wait_for_connections(1).await;

    let kept = link.gateway().start_download(download(false)).await.unwrap();
    let finished = link.gateway().start_download(download(false)).await.unwrap();
    let vanished = link.gateway().start_download(download(false)).await.unwrap();

    registry.push(&format!(r#"{{"handle":"{}","status":"active","progress":60}}"#, finished.handle));
    wait_for_store(link.store(), "progress 60", |s| {
        s.get(&finished.handle).map(|r| r.progress) == Some(60.0)
    })
    .await;

    // Drop the channel; while it is down the Registry finishes one task and
    // forgets another.
    registry.set_status(finished.handle.as_str(), "completed", 100.0);
    registry.remove(vanished.handle.as_str());
    registry.push(CLOSE_FRAME);
    registry.wait_for_connections(2).await;

    wait_for_store(link.store(), "resync after reconnect", |s| {
        s.get(&finished.handle).map(|r| r.status) == Some(TaskStatus::Completed)
            && s.get(&vanished.handle).is_none()
    })
    .await;
    assert_eq!(link.store().get(&finished.handle).unwrap().progress, 100.0);
    assert_eq!(link.store().get(&kept.handle).unwrap().status, TaskStatus::Pending);

    link.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_publishes_disconnected() {
    let registry = FakeRegistry::start().await;
    let link = TaskLink::start(registry.config()).unwrap();
    registry.wait_for_connections(1).await;
    let store = link.store().clone();

    link.shutdown().await;

    assert_eq!(
        store.snapshot().connection,
        ConnectionState::Disconnected { retry_in: None }
    );
    assert!(store.is_degraded());
}
