use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::queue::QueueRegistry;

pub struct AppState {
    pub queues: Arc<QueueRegistry>,
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
}

impl AppState {
    pub fn new(queues: Arc<QueueRegistry>, shutdown_token: CancellationToken) -> Self {
        Self {
            queues,
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
        }
    }
}
