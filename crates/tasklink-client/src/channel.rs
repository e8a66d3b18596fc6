//! Status channel transport.
//!
//! The supervisor only sees two capabilities: a [`StatusSource`] that opens a
//! stream of text frames, and a [`SnapshotSource`] that fetches the
//! Registry's full task list for resync.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use tasklink_core::TaskRecord;

use crate::error::ClientError;

/// Text frames from one status channel connection. The stream ends when the
/// connection closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// Opens status channel connections.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<FrameStream, ClientError>;
}

/// Fetches the Registry's current view of every task.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch all task records the Registry knows.
    async fn snapshot(&self) -> Result<Vec<TaskRecord>, ClientError>;
}

/// Status channel over a WebSocket.
pub struct WebSocketSource {
    url: String,
}

impl WebSocketSource {
    /// Create a source for the given `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The channel URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StatusSource for WebSocketSource {
    async fn connect(&self) -> Result<FrameStream, ClientError> {
        debug!(url = %self.url, "Opening status channel");
        let (stream, _response) = connect_async(self.url.as_str()).await?;

        let frames = stream.filter_map(|message| match message {
            Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Some(Ok(text)),
                Err(_) => {
                    warn!("Discarding non UTF-8 binary frame");
                    None
                }
            },
            Ok(WsMessage::Close(frame)) => {
                debug!(frame = ?frame, "Status channel closed by peer");
                None
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => None,
            Err(e) => Some(Err(ClientError::from(e))),
        });

        Ok(Box::pin(frames))
    }
}
