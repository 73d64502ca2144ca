use async_trait::async_trait;
use futures::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamchat_lib::api::{DeltaStream, LLMApiProvider};
use streamchat_lib::client::ChatSession;
use streamchat_lib::clock::SystemClock;
use streamchat_lib::config::Settings;
use streamchat_lib::history::ChatTurn;
use streamchat_lib::models::ModelConfig;
use streamchat_lib::reconciler::ReconcilerSettings;
use streamchat_lib::state::AppState;
use streamchat_lib::storage::StorageManager;
use tokio::sync::mpsc;

pub const OWNER: &str = "alice";
pub const WAIT: Duration = Duration::from_secs(2);

pub type FragmentSender = mpsc::UnboundedSender<anyhow::Result<String>>;

/// A provider whose replies are fed by the test, one fragment at a time.
/// Each request takes the next queued script; dropping its sender ends the reply.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<anyhow::Result<String>>>>,
    requests: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedProvider {
    pub fn script(&self) -> FragmentSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().push_back(rx);
        tx
    }

    pub fn requests(&self) -> Vec<Vec<ChatTurn>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LLMApiProvider for ScriptedProvider {
    async fn send_chat_stream_request(
        &self,
        _config: &ModelConfig,
        _api_key: &str,
        turns: &[ChatTurn],
    ) -> anyhow::Result<DeltaStream> {
        self.requests.lock().unwrap().push(turns.to_vec());
        let rx = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted reply queued"))?;
        let fragments = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(fragments))
    }
}

pub struct TestApp {
    pub state: AppState,
    pub provider: Arc<ScriptedProvider>,
}

impl TestApp {
    pub async fn new() -> Self {
        let storage = StorageManager::in_memory()
            .await
            .expect("Failed to open in-memory store");
        let provider = Arc::new(ScriptedProvider::default());
        let state = AppState::new(storage, provider.clone(), &Settings::default());
        Self { state, provider }
    }

    pub fn session(&self) -> ChatSession {
        ChatSession::new(
            self.state.clone(),
            OWNER,
            ReconcilerSettings::default(),
            Arc::new(SystemClock),
        )
    }
}
