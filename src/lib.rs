// Declare the modules
pub mod api;
pub mod broadcast;
pub mod cli;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod history;
pub mod models;
pub mod publisher;
pub mod reconciler;
pub mod state;
pub mod storage;

use crate::api::{EchoProvider, LLMApiProvider, OpenAICompatibleProvider};
use crate::client::ChatSession;
use crate::clock::SystemClock;
use crate::config::{Settings, PROVIDER_OPENAI_COMPATIBLE};
use anyhow::Context;
use state::AppState;
use std::sync::Arc;
use storage::StorageManager;

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let settings = Settings::from_env().context("Failed to load settings")?;
    log::info!(
        "Starting streamchat for {} with provider {}",
        settings.owner,
        settings.model.provider
    );

    let storage_manager = StorageManager::new(&settings.database_path).await?;
    // No stream survives a restart, so anything still incomplete was interrupted
    let recovered = storage_manager.recover_interrupted_messages().await?;
    if recovered > 0 {
        log::warn!("Closed {} replies interrupted by the last shutdown", recovered);
    }

    let api_provider: Arc<dyn LLMApiProvider> =
        if settings.model.provider == PROVIDER_OPENAI_COMPATIBLE {
            Arc::new(OpenAICompatibleProvider::new())
        } else {
            Arc::new(EchoProvider::new(settings.echo_delay))
        };

    let app_state = AppState::new(storage_manager, api_provider, &settings);
    let session = ChatSession::new(
        app_state,
        settings.owner.clone(),
        settings.reconciler_settings(),
        Arc::new(SystemClock),
    );
    cli::Cli::new(session).run().await
}
