//! Process-wide wiring of store, gateway and channel supervisor.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::WebSocketSource;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::gateway::CommandGateway;
use crate::store::TaskStore;
use crate::supervisor::{ChannelSupervisor, SupervisorHandle};

/// A running client: one store, one gateway, one supervised status channel.
pub struct TaskLink {
    store: TaskStore,
    gateway: Arc<CommandGateway>,
    supervisor: SupervisorHandle,
    store_task: JoinHandle<()>,
}

impl TaskLink {
    /// Spawn the store and start supervising the status channel.
    pub fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let (store, store_task) =
            TaskStore::spawn(config.store_queue_capacity, config.notice_capacity);
        let gateway = Arc::new(CommandGateway::new(&config, store.clone())?);

        let supervisor = ChannelSupervisor::new(
            Arc::new(WebSocketSource::new(config.channel_url.clone())),
            gateway.clone(),
            store.clone(),
            config.reconnect.clone(),
        )
        .spawn();

        info!(base_url = %config.base_url, channel_url = %config.channel_url, "Task link started");

        Ok(Self {
            store,
            gateway,
            supervisor,
            store_task,
        })
    }

    /// The task store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// The command gateway.
    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    /// Stop the supervisor, then the store.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
        self.store.shutdown().await;
        let _ = self.store_task.await;
        info!("Task link stopped");
    }
}
