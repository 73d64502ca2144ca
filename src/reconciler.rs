//! Client-side view of one conversation.
//!
//! A [`Reconciler`] merges three feeds that arrive in no particular order:
//! the user's own optimistic submissions, pushed [`MessageUpdate`]s, and
//! polled store snapshots. Whatever the interleaving, the view it exposes
//! holds at most one entry per id, sorted by timestamp, and never shows a
//! completed message going back to incomplete.

use crate::clock::Clock;
use crate::error::ReconcileError;
use crate::models::{Message, MessageUpdate, Role, SendReceipt, ASSISTANT_STUB};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_MATCH_WINDOW_SECS: i64 = 10;
pub const DEFAULT_PLACEHOLDER_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    /// How far a server user message's timestamp may sit from a pending
    /// submission's creation instant and still be taken as its echo (W).
    pub match_window: Duration,
    /// How long a local placeholder stays eligible to receive the first
    /// update of a reply (W2).
    pub placeholder_window: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            match_window: Duration::seconds(DEFAULT_MATCH_WINDOW_SECS),
            placeholder_window: Duration::seconds(DEFAULT_PLACEHOLDER_WINDOW_SECS),
        }
    }
}

/// Identity of a view entry. Local ids are minted by the reconciler and can
/// never equal a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryId {
    Server(Uuid),
    Local(u64),
}

impl EntryId {
    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            EntryId::Server(id) => Some(*id),
            EntryId::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EntryId::Local(_))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Server(id) => write!(f, "{}", id),
            EntryId::Local(n) => write!(f, "local-{}", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Optimistic user submission not yet echoed by the store.
    PendingLocal,
    /// Assistant reply with no content yet.
    Placeholder,
    Streaming,
    Settled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub id: EntryId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_complete: bool,
    pub state: EntryState,
    /// When this entry first appeared in the view.
    pub created_at: DateTime<Utc>,
    /// Value of the view's revision counter at the entry's last change.
    pub revision: u64,
}

impl ViewEntry {
    fn from_server(message: &Message, created_at: DateTime<Utc>, revision: u64) -> Self {
        Self {
            id: EntryId::Server(message.id),
            role: message.role,
            content: message.content.clone(),
            timestamp: message.timestamp,
            is_complete: message.is_complete,
            state: server_state(message.role, &message.content, message.is_complete),
            created_at,
            revision,
        }
    }

    fn is_unresolved_placeholder(&self) -> bool {
        self.state == EntryState::Placeholder && self.id.is_local()
    }
}

fn server_state(role: Role, content: &str, is_complete: bool) -> EntryState {
    if role == Role::User || is_complete {
        EntryState::Settled
    } else if has_content(content) {
        EntryState::Streaming
    } else {
        EntryState::Placeholder
    }
}

fn has_content(content: &str) -> bool {
    let trimmed = content.trim();
    !trimmed.is_empty() && trimmed != ASSISTANT_STUB
}

/// True when a streaming snapshot is older than what the view already shows.
/// Streamed content only ever grows, so an older snapshot is a strict prefix
/// of the shown text, or has no text at all.
fn lags_behind(shown: &str, snapshot: &str) -> bool {
    if !has_content(snapshot) {
        return has_content(shown);
    }
    shown.len() > snapshot.len() && shown.starts_with(snapshot)
}

/// Which rule picked the entry an update was applied to, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ExactId,
    Placeholder,
    NewEntry,
    LatestAssistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Resolution),
    /// The update would have reopened a completed entry; dropped.
    Ignored,
}

pub struct Reconciler {
    conversation_id: Uuid,
    settings: ReconcilerSettings,
    clock: Arc<dyn Clock>,
    entries: Vec<ViewEntry>,
    next_local: u64,
    revision: u64,
    resync_required: bool,
}

impl Reconciler {
    pub fn new(conversation_id: Uuid, settings: ReconcilerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            conversation_id,
            settings,
            clock,
            entries: Vec::new(),
            next_local: 0,
            revision: 0,
            resync_required: false,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Increases on every mutation, even when no content changed.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Set when an update could not be placed; cleared by the next snapshot merge.
    pub fn needs_resync(&self) -> bool {
        self.resync_required
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<ViewEntry> {
        self.entries.clone()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.resync_required = false;
        self.bump();
    }

    /// Inserts an optimistic user message and returns its local id.
    pub fn submit(&mut self, content: &str) -> Result<EntryId, ReconcileError> {
        if content.trim().is_empty() {
            return Err(ReconcileError::EmptySubmission);
        }
        let now = self.clock.now();
        let id = self.mint_local();
        let revision = self.bump();
        self.entries.push(ViewEntry {
            id,
            role: Role::User,
            content: content.to_string(),
            timestamp: now,
            is_complete: false,
            state: EntryState::PendingLocal,
            created_at: now,
            revision,
        });
        self.normalize();
        log::debug!("View {}: pending submission {}", self.conversation_id, id);
        Ok(id)
    }

    /// The send was accepted but its message ids are unknown: show a local
    /// placeholder. Any older unresolved placeholder is replaced. When the
    /// reply to the latest user message is already shown, no placeholder is
    /// added and that reply's id is returned.
    pub fn acknowledge_send(&mut self) -> EntryId {
        if let Some(i) = self.current_reply() {
            return self.entries[i].id;
        }
        let now = self.clock.now();
        self.entries.retain(|e| !e.is_unresolved_placeholder());
        let id = self.mint_local();
        let revision = self.bump();
        self.entries.push(ViewEntry {
            id,
            role: Role::Assistant,
            content: String::new(),
            timestamp: now,
            is_complete: false,
            state: EntryState::Placeholder,
            created_at: now,
            revision,
        });
        self.normalize();
        id
    }

    /// The send returned the stored ids: swap the pending submission for the
    /// stored user message and key the placeholder by the real assistant id,
    /// so every later update resolves exactly.
    pub fn acknowledge_receipt(
        &mut self,
        pending: EntryId,
        receipt: &SendReceipt,
    ) -> Result<(), ReconcileError> {
        for message in [&receipt.user_message, &receipt.assistant_message] {
            self.check_conversation(message.conversation_id)?;
        }
        let now = self.clock.now();

        self.entries.retain(|e| e.id != pending);
        self.upsert_server(&receipt.user_message, now);

        let assistant_id = EntryId::Server(receipt.assistant_message.id);
        if !self.entries.iter().any(|e| e.id == assistant_id) {
            self.entries.retain(|e| !e.is_unresolved_placeholder());
            self.upsert_server(&receipt.assistant_message, now);
        }
        self.bump();
        self.normalize();
        Ok(())
    }

    /// Removes a local entry, e.g. a submission whose send failed.
    pub fn discard_local(&mut self, id: EntryId) -> Result<(), ReconcileError> {
        let before = self.entries.len();
        if id.is_local() {
            self.entries.retain(|e| e.id != id);
        }
        if self.entries.len() == before {
            return Err(ReconcileError::UnknownLocalEntry(id.to_string()));
        }
        self.bump();
        Ok(())
    }

    /// Merges a full `getMessages` result. Either the whole snapshot is
    /// merged or, when any message belongs elsewhere, nothing is.
    pub fn merge_snapshot(&mut self, messages: &[Message]) -> Result<(), ReconcileError> {
        for message in messages {
            self.check_conversation(message.conversation_id)?;
        }
        let now = self.clock.now();
        let known: HashSet<Uuid> = self
            .entries
            .iter()
            .filter_map(|e| e.id.server_id())
            .collect();

        for message in messages {
            if !known.contains(&message.id) {
                match message.role {
                    Role::User => self.take_pending_echo(message),
                    Role::Assistant => self.take_placeholder_counterpart(message),
                }
            }
            self.upsert_server(message, now);
        }

        self.resync_required = false;
        self.bump();
        self.normalize();
        log::debug!(
            "View {}: merged snapshot of {} messages, {} entries shown",
            self.conversation_id,
            messages.len(),
            self.entries.len()
        );
        Ok(())
    }

    /// Applies one pushed update. The target entry is chosen by, in order:
    /// exact id, the freshest unresolved placeholder younger than W2, a new
    /// entry when the update carries real content, and the latest assistant
    /// entry. When none applies the view drops everything but pending
    /// submissions and asks for a resync.
    pub fn apply(&mut self, update: &MessageUpdate) -> Result<ApplyOutcome, ReconcileError> {
        self.check_conversation(update.conversation_id)?;
        let now = self.clock.now();
        let target = EntryId::Server(update.message_id);

        let (index, resolution) = if let Some(i) = self.position(target) {
            (i, Resolution::ExactId)
        } else if let Some(i) = self.fresh_placeholder(now) {
            (i, Resolution::Placeholder)
        } else if has_content(&update.content) {
            self.entries.push(ViewEntry {
                id: target,
                role: Role::Assistant,
                content: String::new(),
                timestamp: update.timestamp,
                is_complete: false,
                state: EntryState::Placeholder,
                created_at: now,
                revision: self.revision,
            });
            (self.entries.len() - 1, Resolution::NewEntry)
        } else if let Some(i) = self.entries.iter().rposition(|e| e.role == Role::Assistant) {
            (i, Resolution::LatestAssistant)
        } else {
            log::warn!(
                "View {}: no entry for update of {}, resyncing",
                self.conversation_id,
                update.message_id
            );
            self.discard_derived();
            return Err(ReconcileError::Unresolvable(update.message_id));
        };

        if self.entries[index].is_complete && !update.is_complete {
            log::debug!(
                "View {}: stale update for completed {} ignored",
                self.conversation_id,
                update.message_id
            );
            return Ok(ApplyOutcome::Ignored);
        }

        let was_placeholder = self.entries[index].state == EntryState::Placeholder;
        let revision = self.bump();
        let entry = &mut self.entries[index];
        entry.id = target;
        entry.role = Role::Assistant;
        entry.content = update.content.clone();
        entry.is_complete = update.is_complete;
        entry.timestamp = update.timestamp;
        entry.state = if update.is_complete {
            EntryState::Settled
        } else {
            EntryState::Streaming
        };
        entry.revision = revision;

        // A reply that just started streaming supersedes any local placeholder
        if was_placeholder || resolution != Resolution::ExactId {
            self.entries
                .retain(|e| e.id == target || !e.is_unresolved_placeholder());
        }
        self.normalize();
        Ok(ApplyOutcome::Applied(resolution))
    }

    fn check_conversation(&self, got: Uuid) -> Result<(), ReconcileError> {
        if got != self.conversation_id {
            return Err(ReconcileError::ForeignConversation {
                expected: self.conversation_id,
                got,
            });
        }
        Ok(())
    }

    fn position(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn fresh_placeholder(&self, now: DateTime<Utc>) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.is_unresolved_placeholder() && now - e.created_at <= self.settings.placeholder_window
            })
            .max_by_key(|(_, e)| e.created_at)
            .map(|(i, _)| i)
    }

    /// Drops the oldest pending submission this server user message echoes.
    fn take_pending_echo(&mut self, message: &Message) {
        let content = message.content.trim();
        let window = self.settings.match_window;
        let echo = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.state == EntryState::PendingLocal
                    && e.content.trim() == content
                    && (message.timestamp - e.created_at).abs() <= window
            })
            .min_by_key(|(_, e)| e.created_at)
            .map(|(i, _)| i);
        if let Some(i) = echo {
            log::debug!(
                "View {}: {} echoed by {}",
                self.conversation_id,
                self.entries[i].id,
                message.id
            );
            self.entries.remove(i);
        }
    }

    /// Drops a local placeholder that this newly seen assistant message stands for.
    fn take_placeholder_counterpart(&mut self, message: &Message) {
        let window = self.settings.placeholder_window;
        let counterpart = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.is_unresolved_placeholder() && message.timestamp >= e.created_at - window
            })
            .min_by_key(|(_, e)| e.created_at)
            .map(|(i, _)| i);
        if let Some(i) = counterpart {
            self.entries.remove(i);
        }
    }

    fn upsert_server(&mut self, message: &Message, now: DateTime<Utc>) {
        let id = EntryId::Server(message.id);
        match self.position(id) {
            Some(i) => {
                let existing = &self.entries[i];
                let regresses = (existing.is_complete && !message.is_complete)
                    || (!message.is_complete && lags_behind(&existing.content, &message.content));
                let unchanged = existing.content == message.content
                    && existing.is_complete == message.is_complete
                    && existing.timestamp == message.timestamp;
                if regresses || unchanged {
                    return;
                }
                let created_at = existing.created_at;
                let revision = self.bump();
                self.entries[i] = ViewEntry::from_server(message, created_at, revision);
            }
            None => {
                let revision = self.bump();
                self.entries.push(ViewEntry::from_server(message, now, revision));
            }
        }
    }

    /// Index just past the latest user entry.
    fn reply_start(&self) -> usize {
        self.entries
            .iter()
            .rposition(|e| e.role == Role::User)
            .map_or(0, |i| i + 1)
    }

    /// The stored reply to the latest user entry, if the view has one yet.
    fn current_reply(&self) -> Option<usize> {
        let start = self.reply_start();
        self.entries[start..]
            .iter()
            .position(|e| e.role == Role::Assistant && !e.id.is_local())
            .map(|i| start + i)
    }

    fn discard_derived(&mut self) {
        self.entries.retain(|e| e.state == EntryState::PendingLocal);
        self.resync_required = true;
        self.bump();
    }

    /// Dedups by id, the later occurrence winning, then sorts by timestamp
    /// keeping insertion order among equal timestamps. A local placeholder
    /// only ever stands for the reply to the latest user entry, so it goes
    /// once a stored reply follows that entry.
    fn normalize(&mut self) {
        let mut seen = HashSet::with_capacity(self.entries.len());
        let mut deduped: Vec<ViewEntry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..).rev() {
            if seen.insert(entry.id) {
                deduped.push(entry);
            }
        }
        deduped.reverse();
        deduped.sort_by_key(|e| e.timestamp);
        self.entries = deduped;

        if self.current_reply().is_some() {
            self.entries.retain(|e| !e.is_unresolved_placeholder());
        }
    }

    fn mint_local(&mut self) -> EntryId {
        self.next_local += 1;
        EntryId::Local(self.next_local)
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}
