use crate::api::DeltaStream;
use crate::broadcast::MessageBroadcaster;
use crate::error::ChatError;
use crate::models::{Message, MessageUpdate};
use crate::storage::{StorageManager, MAX_CONTENT_CHARS};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Stored when a stream ends without producing any text.
pub const FALLBACK_REPLY: &str = "I'm sorry, I wasn't able to generate a response.";
/// Appended to whatever was accumulated when the stream fails.
pub const ERROR_ANNOTATION: &str = "\n\n[Error: the response was interrupted]";
/// Appended to the broadcast final state when it could not be persisted.
pub const UNSAVED_ANNOTATION: &str = "\n\n[Error: the response could not be saved]";

const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(200);

/// The assistant message a stream is written into.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub owner: String,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl StreamTarget {
    pub fn for_message(owner: &str, message: &Message) -> Self {
        Self {
            owner: owner.to_string(),
            conversation_id: message.conversation_id,
            message_id: message.id,
            timestamp: message.timestamp,
        }
    }
}

/// How the fragment stream terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub message_id: Uuid,
    /// Final content as persisted.
    pub content: String,
    pub fragments: usize,
    pub end: StreamEnd,
}

/// Drives one generation stream into the store and out to subscribers.
#[derive(Clone)]
pub struct UpdatePublisher {
    storage: Arc<StorageManager>,
    broadcaster: Arc<dyn MessageBroadcaster>,
    // Running streams by message id; the flag is set when a stop was requested
    cancelled_streams: Arc<DashMap<Uuid, bool>>,
}

impl UpdatePublisher {
    pub fn new(
        storage: Arc<StorageManager>,
        broadcaster: Arc<dyn MessageBroadcaster>,
        cancelled_streams: Arc<DashMap<Uuid, bool>>,
    ) -> Self {
        Self {
            storage,
            broadcaster,
            cancelled_streams,
        }
    }

    /// Consumes `stream` fragment by fragment, then finalizes the message
    /// exactly once. `stream` is an `Err` when the adapter could not even
    /// start; that is finalized like a failure before the first fragment.
    pub async fn publish(
        &self,
        target: StreamTarget,
        stream: anyhow::Result<DeltaStream>,
    ) -> Result<PublishOutcome, ChatError> {
        let mut accumulated = String::new();
        let mut fragments = 0;
        self.cancelled_streams
            .entry(target.message_id)
            .or_insert(false);

        let end = match stream {
            Ok(mut delta_stream) => {
                self.consume(&target, &mut delta_stream, &mut accumulated, &mut fragments)
                    .await
            }
            Err(e) => {
                log::error!(
                    "Publisher [{}]: Failed to start generation stream: {:#}",
                    target.message_id,
                    e
                );
                StreamEnd::Failed(format!("{:#}", e))
            }
        };
        let outcome = self.finalize(&target, accumulated, fragments, end).await;
        self.cancelled_streams.remove(&target.message_id);
        outcome
    }

    async fn consume(
        &self,
        target: &StreamTarget,
        delta_stream: &mut DeltaStream,
        accumulated: &mut String,
        fragments: &mut usize,
    ) -> StreamEnd {
        log::info!("Publisher [{}]: Starting stream processing loop.", target.message_id);
        // Leave room for the error annotation so the final write stays within limits
        let budget = MAX_CONTENT_CHARS - ERROR_ANNOTATION.chars().count();
        let mut used = 0;

        while let Some(delta_result) = delta_stream.next().await {
            let stop_requested = self
                .cancelled_streams
                .get(&target.message_id)
                .map_or(false, |flag| *flag);
            if stop_requested {
                log::warn!(
                    "Publisher [{}]: Cancellation requested. Stopping stream.",
                    target.message_id
                );
                return StreamEnd::Cancelled;
            }

            let delta = match delta_result {
                Ok(delta) => delta,
                Err(e) => {
                    log::error!(
                        "Publisher [{}]: Error receiving stream delta: {:#}. Finalizing.",
                        target.message_id,
                        e
                    );
                    return StreamEnd::Failed(format!("{:#}", e));
                }
            };
            if delta.is_empty() {
                continue;
            }

            let delta_chars = delta.chars().count();
            if used + delta_chars > budget {
                accumulated.extend(delta.chars().take(budget - used));
                log::warn!(
                    "Publisher [{}]: Reply exceeded {} characters, truncating.",
                    target.message_id,
                    budget
                );
                return StreamEnd::Failed("reply too long".to_string());
            }
            used += delta_chars;
            accumulated.push_str(&delta);
            *fragments += 1;
            log::debug!(
                "Publisher [{}]: Fragment {} ({} chars total).",
                target.message_id,
                *fragments,
                used
            );

            if let Err(e) = self
                .storage
                .update_message_content(
                    &target.owner,
                    target.message_id,
                    target.conversation_id,
                    accumulated.as_str(),
                    false,
                )
                .await
            {
                log::warn!(
                    "Publisher [{}]: Failed to persist fragment {}: {}",
                    target.message_id,
                    *fragments,
                    e
                );
            }
            self.emit(target, accumulated.as_str(), false);
        }

        log::info!("Publisher [{}]: Stream ended normally.", target.message_id);
        StreamEnd::Completed
    }

    async fn finalize(
        &self,
        target: &StreamTarget,
        accumulated: String,
        fragments: usize,
        end: StreamEnd,
    ) -> Result<PublishOutcome, ChatError> {
        let mut content = if accumulated.trim().is_empty() {
            FALLBACK_REPLY.to_string()
        } else {
            accumulated
        };
        if matches!(end, StreamEnd::Failed(_)) {
            content.push_str(ERROR_ANNOTATION);
        }

        let mut failure = None;
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self
                .storage
                .update_message_content(
                    &target.owner,
                    target.message_id,
                    target.conversation_id,
                    &content,
                    true,
                )
                .await
            {
                Ok(_) => {
                    failure = None;
                    break;
                }
                Err(e @ (ChatError::Database(_) | ChatError::Transport(_))) => {
                    log::warn!(
                        "Publisher [{}]: Finalize attempt {}/{} failed: {}",
                        target.message_id,
                        attempt,
                        FINALIZE_ATTEMPTS,
                        e
                    );
                    failure = Some(e);
                    if attempt < FINALIZE_ATTEMPTS {
                        tokio::time::sleep(FINALIZE_BACKOFF * attempt).await;
                    }
                }
                Err(e) => {
                    // Missing, foreign or already-final message: retrying cannot help
                    log::error!(
                        "Publisher [{}]: Finalize rejected: {}",
                        target.message_id,
                        e
                    );
                    return Err(e);
                }
            }
        }

        if let Some(e) = failure {
            log::error!(
                "Publisher [{}]: Could not persist final content, broadcasting terminal error.",
                target.message_id
            );
            let unsaved = format!("{}{}", content, UNSAVED_ANNOTATION);
            self.emit(target, &unsaved, true);
            return Err(e);
        }

        self.emit(target, &content, true);
        log::info!(
            "Publisher [{}]: Finalized after {} fragments ({:?}).",
            target.message_id,
            fragments,
            end
        );
        Ok(PublishOutcome {
            message_id: target.message_id,
            content,
            fragments,
            end,
        })
    }

    fn emit(&self, target: &StreamTarget, content: &str, is_complete: bool) {
        let update = MessageUpdate {
            message_id: target.message_id,
            conversation_id: target.conversation_id,
            content: content.to_string(),
            is_complete,
            timestamp: target.timestamp,
        };
        match self.broadcaster.broadcast(&update) {
            Ok(receivers) => log::debug!(
                "Publisher [{}]: Update reached {} subscribers.",
                target.message_id,
                receivers
            ),
            Err(e) => log::debug!(
                "Publisher [{}]: Broadcast skipped: {}",
                target.message_id,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelBroadcaster;
    use crate::models::Role;
    use futures::stream;

    const OWNER: &str = "alice";

    struct Fixture {
        storage: Arc<StorageManager>,
        broadcaster: Arc<ChannelBroadcaster>,
        cancelled: Arc<DashMap<Uuid, bool>>,
        publisher: UpdatePublisher,
        placeholder: Message,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(StorageManager::in_memory().await.unwrap());
        let broadcaster = Arc::new(ChannelBroadcaster::new(64));
        let cancelled = Arc::new(DashMap::new());
        let publisher = UpdatePublisher::new(storage.clone(), broadcaster.clone(), cancelled.clone());
        let conv = storage.create_conversation(OWNER, None).await.unwrap();
        storage
            .append_message(OWNER, conv.id, Role::User, "Hello")
            .await
            .unwrap();
        let placeholder = storage
            .append_message(OWNER, conv.id, Role::Assistant, "")
            .await
            .unwrap();
        Fixture {
            storage,
            broadcaster,
            cancelled,
            publisher,
            placeholder,
        }
    }

    fn scripted(items: Vec<anyhow::Result<String>>) -> anyhow::Result<DeltaStream> {
        Ok(Box::pin(stream::iter(items)))
    }

    async fn stored(f: &Fixture) -> Message {
        f.storage
            .get_messages(OWNER, f.placeholder.conversation_id)
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.id == f.placeholder.id)
            .unwrap()
    }

    #[tokio::test]
    async fn fragments_accumulate_persist_and_broadcast() {
        let f = fixture().await;
        let mut rx = f.broadcaster.subscribe(f.placeholder.conversation_id);
        let target = StreamTarget::for_message(OWNER, &f.placeholder);

        let outcome = f
            .publisher
            .publish(
                target,
                scripted(vec![Ok("H".into()), Ok("e".into()), Ok("llo".into())]),
            )
            .await
            .unwrap();

        assert_eq!(outcome.end, StreamEnd::Completed);
        assert_eq!(outcome.fragments, 3);
        let message = stored(&f).await;
        assert_eq!(message.content, "Hello");
        assert!(message.is_complete);

        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            assert_eq!(update.message_id, f.placeholder.id);
            assert_eq!(update.timestamp, f.placeholder.timestamp);
            seen.push((update.content, update.is_complete));
        }
        assert_eq!(
            seen,
            vec![
                ("H".to_string(), false),
                ("He".to_string(), false),
                ("Hello".to_string(), false),
                ("Hello".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn empty_stream_gets_fallback() {
        let f = fixture().await;
        let outcome = f
            .publisher
            .publish(StreamTarget::for_message(OWNER, &f.placeholder), scripted(vec![]))
            .await
            .unwrap();
        assert_eq!(outcome.content, FALLBACK_REPLY);
        let message = stored(&f).await;
        assert_eq!(message.content, FALLBACK_REPLY);
        assert!(message.is_complete);
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_partial_text_and_annotates() {
        let f = fixture().await;
        let outcome = f
            .publisher
            .publish(
                StreamTarget::for_message(OWNER, &f.placeholder),
                scripted(vec![
                    Ok("He".into()),
                    Err(anyhow::anyhow!("connection reset")),
                    Ok("never".into()),
                ]),
            )
            .await
            .unwrap();
        assert!(matches!(outcome.end, StreamEnd::Failed(_)));
        let message = stored(&f).await;
        assert_eq!(message.content, format!("He{}", ERROR_ANNOTATION));
        assert!(message.is_complete);
    }

    #[tokio::test]
    async fn failing_to_start_still_finalizes() {
        let f = fixture().await;
        f.publisher
            .publish(
                StreamTarget::for_message(OWNER, &f.placeholder),
                Err(anyhow::anyhow!("401 unauthorized")),
            )
            .await
            .unwrap();
        let message = stored(&f).await;
        assert_eq!(message.content, format!("{}{}", FALLBACK_REPLY, ERROR_ANNOTATION));
        assert!(message.is_complete);
    }

    #[tokio::test]
    async fn missing_subscribers_do_not_abort_the_stream() {
        let f = fixture().await;
        // Nobody subscribed: every broadcast fails
        let outcome = f
            .publisher
            .publish(
                StreamTarget::for_message(OWNER, &f.placeholder),
                scripted(vec![Ok("a".into()), Ok("b".into())]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.content, "ab");
        assert!(stored(&f).await.is_complete);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream_and_finalizes() {
        let f = fixture().await;
        f.cancelled.insert(f.placeholder.id, true);
        let outcome = f
            .publisher
            .publish(
                StreamTarget::for_message(OWNER, &f.placeholder),
                scripted(vec![Ok("a".into()), Ok("b".into())]),
            )
            .await
            .unwrap();
        assert_eq!(outcome.end, StreamEnd::Cancelled);
        assert_eq!(outcome.fragments, 0);
        assert!(stored(&f).await.is_complete);
        assert!(f.cancelled.is_empty());
    }

    #[tokio::test]
    async fn lost_store_retries_then_broadcasts_unsaved_final_state() {
        let f = fixture().await;
        let mut rx = f.broadcaster.subscribe(f.placeholder.conversation_id);
        f.storage.pool().close().await;

        let started = std::time::Instant::now();
        let err = f
            .publisher
            .publish(
                StreamTarget::for_message(OWNER, &f.placeholder),
                scripted(vec![Ok("partial".into())]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Database(_)));
        // Three attempts sleep 200 ms then 400 ms between them
        assert!(started.elapsed() >= FINALIZE_BACKOFF * 3);
        assert!(f.cancelled.is_empty());

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].content, "partial");
        assert!(!updates[0].is_complete);
        let last = &updates[1];
        assert!(last.is_complete);
        assert!(last.content.starts_with("partial"));
        assert!(last.content.ends_with(UNSAVED_ANNOTATION));
    }

    #[tokio::test]
    async fn finalizing_a_deleted_message_is_an_error() {
        let f = fixture().await;
        f.storage
            .delete_conversation(OWNER, f.placeholder.conversation_id)
            .await
            .unwrap();
        let err = f
            .publisher
            .publish(
                StreamTarget::for_message(OWNER, &f.placeholder),
                scripted(vec![Ok("late".into())]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
