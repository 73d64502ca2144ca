//! A chat session as a client sees it: one open conversation, its
//! reconciled view, and the pushed updates that keep it current.

use crate::clock::Clock;
use crate::commands::{self, SendHandle};
use crate::error::{ChatError, ReconcileError};
use crate::models::{MessageUpdate, Role};
use crate::reconciler::{Reconciler, ReconcilerSettings, ViewEntry};
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

struct ActiveView {
    reconciler: Reconciler,
    events: broadcast::Receiver<MessageUpdate>,
}

pub struct ChatSession {
    state: AppState,
    owner: String,
    settings: ReconcilerSettings,
    clock: Arc<dyn Clock>,
    active: Option<ActiveView>,
}

impl ChatSession {
    pub fn new(
        state: AppState,
        owner: impl Into<String>,
        settings: ReconcilerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state,
            owner: owner.into(),
            settings,
            clock,
            active: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn active_conversation(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.reconciler.conversation_id())
    }

    /// Makes `conversation_id` the open conversation. The previous view is
    /// dropped whole, pending entries included, so nothing of it can leak
    /// into the new one.
    pub async fn switch_conversation(&mut self, conversation_id: Uuid) -> Result<(), ChatError> {
        // Ownership check before anything is torn down
        self.state
            .storage
            .get_conversation(&self.owner, conversation_id)
            .await?;

        let events = self.state.broadcaster.subscribe(conversation_id);
        let reconciler = Reconciler::new(conversation_id, self.settings, self.clock.clone());
        let previous = self.active.replace(ActiveView { reconciler, events });
        if let Some(previous) = previous {
            let old_id = previous.reconciler.conversation_id();
            drop(previous);
            if old_id != conversation_id {
                self.state.broadcaster.prune(old_id);
            }
            log::info!("Switched view from {} to {}", old_id, conversation_id);
        }
        self.refresh().await
    }

    /// Closes the open conversation, if any.
    pub fn close(&mut self) {
        if let Some(previous) = self.active.take() {
            let id = previous.reconciler.conversation_id();
            drop(previous);
            self.state.broadcaster.prune(id);
        }
    }

    pub fn view(&self) -> &[ViewEntry] {
        self.active
            .as_ref()
            .map(|a| a.reconciler.entries())
            .unwrap_or(&[])
    }

    pub fn revision(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.reconciler.revision())
    }

    /// Id of the newest assistant reply that is still being written.
    pub fn streaming_message_id(&self) -> Option<Uuid> {
        self.view()
            .iter()
            .rev()
            .find(|e| e.role == Role::Assistant && !e.is_complete)
            .and_then(|e| e.id.server_id())
    }

    /// Re-reads the open conversation and merges it into the view.
    pub async fn refresh(&mut self) -> Result<(), ChatError> {
        let active = self.active_mut()?;
        let conversation_id = active.reconciler.conversation_id();
        let messages = self
            .state
            .storage
            .get_messages(&self.owner, conversation_id)
            .await?;
        let active = self.active_mut()?;
        active.reconciler.merge_snapshot(&messages)?;
        Ok(())
    }

    /// Shows `content` immediately, then sends it. When the send is accepted
    /// the view learns both stored ids; when it fails the optimistic entry
    /// is withdrawn.
    pub async fn submit(&mut self, content: &str) -> Result<SendHandle, ChatError> {
        let active = self.active_mut()?;
        let conversation_id = active.reconciler.conversation_id();
        let pending = active.reconciler.submit(content)?;

        let sent = commands::send_message(
            &self.state,
            &self.owner,
            &conversation_id.to_string(),
            content,
        )
        .await;

        let active = self.active_mut()?;
        match sent {
            Ok(handle) => {
                if let Err(e) = active.reconciler.acknowledge_receipt(pending, &handle.receipt) {
                    log::warn!("Receipt for {} did not fit the view: {}", pending, e);
                    self.refresh().await?;
                }
                Ok(handle)
            }
            Err(e) => {
                if let Err(discard) = active.reconciler.discard_local(pending) {
                    log::debug!("Pending entry already gone: {}", discard);
                }
                Err(e)
            }
        }
    }

    pub async fn stop(&self, message_id: Uuid) -> Result<(), ChatError> {
        commands::stop_generation(&self.state, &message_id.to_string()).await
    }

    /// Applies one pushed update. Updates for other conversations are
    /// dropped; anything the view cannot place triggers a full refresh.
    pub async fn handle_update(&mut self, update: &MessageUpdate) -> Result<(), ChatError> {
        let active = self.active_mut()?;
        match active.reconciler.apply(update) {
            Ok(outcome) => {
                log::debug!("Update for {}: {:?}", update.message_id, outcome);
                Ok(())
            }
            Err(ReconcileError::ForeignConversation { expected, got }) => {
                log::debug!("Dropped update for {} while viewing {}", got, expected);
                Ok(())
            }
            Err(e) => {
                log::warn!("Resyncing view: {}", e);
                self.refresh().await
            }
        }
    }

    /// Drains every update already queued. Returns how many were handled.
    pub async fn pump_events(&mut self) -> Result<usize, ChatError> {
        let mut handled = 0;
        let mut lagged = false;
        loop {
            let next = self.active_mut()?.events.try_recv();
            match next {
                Ok(update) => {
                    self.handle_update(&update).await?;
                    handled += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("View fell behind by {} updates", missed);
                    lagged = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if lagged || self.active_mut()?.reconciler.needs_resync() {
            self.refresh().await?;
        }
        Ok(handled)
    }

    /// Waits up to `timeout` for the next update and applies it.
    /// Returns false when nothing arrived.
    pub async fn wait_for_update(&mut self, timeout: Duration) -> Result<bool, ChatError> {
        let received = {
            let active = self.active_mut()?;
            tokio::time::timeout(timeout, active.events.recv()).await
        };
        match received {
            Ok(Ok(update)) => {
                self.handle_update(&update).await?;
                Ok(true)
            }
            Ok(Err(RecvError::Lagged(missed))) => {
                log::warn!("View fell behind by {} updates", missed);
                self.refresh().await?;
                Ok(true)
            }
            Ok(Err(RecvError::Closed)) | Err(_) => Ok(false),
        }
    }

    fn active_mut(&mut self) -> Result<&mut ActiveView, ChatError> {
        self.active
            .as_mut()
            .ok_or_else(|| ChatError::Validation("no conversation is open".to_string()))
    }
}
