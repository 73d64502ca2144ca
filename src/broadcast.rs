use crate::error::ChatError;
use crate::models::MessageUpdate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Best-effort fan-out of message updates to the subscribers of a conversation.
pub trait MessageBroadcaster: Send + Sync {
    /// Returns how many subscribers the update reached.
    fn broadcast(&self, update: &MessageUpdate) -> Result<usize, ChatError>;
}

/// One `tokio::sync::broadcast` channel per conversation, created on first subscribe.
pub struct ChannelBroadcaster {
    channels: DashMap<Uuid, broadcast::Sender<MessageUpdate>>,
    capacity: usize,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, conversation_id: Uuid) -> broadcast::Receiver<MessageUpdate> {
        self.channels
            .entry(conversation_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops the channel of a conversation nobody listens to anymore.
    pub fn prune(&self, conversation_id: Uuid) {
        self.channels
            .remove_if(&conversation_id, |_, tx| tx.receiver_count() == 0);
    }
}

impl MessageBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, update: &MessageUpdate) -> Result<usize, ChatError> {
        let Some(tx) = self.channels.get(&update.conversation_id) else {
            return Err(ChatError::Transport(format!(
                "no subscribers for conversation {}",
                update.conversation_id
            )));
        };
        tx.send(update.clone()).map_err(|_| {
            ChatError::Transport(format!(
                "all subscribers of conversation {} are gone",
                update.conversation_id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn update(conversation_id: Uuid, content: &str) -> MessageUpdate {
        MessageUpdate {
            message_id: Uuid::new_v4(),
            conversation_id,
            content: content.to_string(),
            is_complete: false,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn updates_reach_only_their_conversation() {
        let broadcaster = ChannelBroadcaster::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = broadcaster.subscribe(a);
        let mut rx_b = broadcaster.subscribe(b);

        assert_eq!(broadcaster.broadcast(&update(a, "for a")).unwrap(), 1);
        assert_eq!(rx_a.recv().await.unwrap().content, "for a");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcasting_without_subscribers_is_a_transport_error() {
        let broadcaster = ChannelBroadcaster::new(16);
        let conv = Uuid::new_v4();
        assert!(matches!(
            broadcaster.broadcast(&update(conv, "x")),
            Err(ChatError::Transport(_))
        ));

        let rx = broadcaster.subscribe(conv);
        drop(rx);
        assert!(matches!(
            broadcaster.broadcast(&update(conv, "x")),
            Err(ChatError::Transport(_))
        ));
        broadcaster.prune(conv);
        assert!(broadcaster.channels.is_empty());
    }
}
