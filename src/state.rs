use crate::api::LLMApiProvider;
use crate::broadcast::ChannelBroadcaster;
use crate::config::Settings;
use crate::models::ModelConfig;
use crate::publisher::UpdatePublisher;
use crate::storage::StorageManager;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

// Core application state shared by the commands and the background publishers
#[derive(Clone)]
pub struct AppState {
    // No outer lock: the store serializes writes per message itself, so
    // streams for different messages never wait on each other.
    pub storage: Arc<StorageManager>,
    pub api_provider: Arc<dyn LLMApiProvider>,
    pub broadcaster: Arc<ChannelBroadcaster>,
    // One entry per reply still being generated; `true` once a stop is requested
    pub cancelled_streams: Arc<DashMap<Uuid, bool>>,
    pub model_config: ModelConfig,
    pub history_limit: usize,
}

impl AppState {
    pub fn new(
        storage: StorageManager,
        api_provider: Arc<dyn LLMApiProvider>,
        settings: &Settings,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            api_provider,
            broadcaster: Arc::new(ChannelBroadcaster::new(settings.broadcast_capacity)),
            cancelled_streams: Arc::new(DashMap::new()),
            model_config: settings.model.clone(),
            history_limit: settings.history_limit,
        }
    }

    pub fn publisher(&self) -> UpdatePublisher {
        UpdatePublisher::new(
            self.storage.clone(),
            self.broadcaster.clone(),
            self.cancelled_streams.clone(),
        )
    }
}
