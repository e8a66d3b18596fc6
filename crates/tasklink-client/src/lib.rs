//! Client library for tracking long-running Registry tasks.
//!
//! The pieces, leaves first:
//! - [`CommandGateway`]: start, cancel and dismiss calls over HTTP
//! - [`TaskStore`]: the client's single ordered view of every task
//! - [`WebSocketSource`]: the push channel carrying status events
//! - [`ChannelSupervisor`]: keeps the channel alive and resyncs the store
//!
//! [`TaskLink`] wires all of them together for a process.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod store;
pub mod supervisor;

pub use channel::{FrameStream, SnapshotSource, StatusSource, WebSocketSource};
pub use client::TaskLink;
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::ClientError;
pub use gateway::{CancelOutcome, CommandGateway};
pub use http::HttpClient;
pub use store::{StoreSnapshot, TaskStore, TerminalNotice};
pub use supervisor::{ChannelSupervisor, ConnectionState, SupervisorHandle};
