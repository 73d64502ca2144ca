// Command surface shared by the terminal front end and the client session

use crate::config;
use crate::error::ChatError;
use crate::history::build_history;
use crate::models::{Conversation, Message, Role, SendReceipt};
use crate::publisher::{PublishOutcome, StreamTarget};
use crate::state::AppState;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Result of an accepted send: the stored ids right away, and the
/// background publisher that is filling in the reply.
pub struct SendHandle {
    pub receipt: SendReceipt,
    pub completion: JoinHandle<Result<PublishOutcome, ChatError>>,
}

fn parse_id(kind: &str, raw: &str) -> Result<Uuid, ChatError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        let err_msg = format!("Invalid {} ID format: {}", kind, raw);
        log::error!("{}", err_msg);
        ChatError::Validation(err_msg)
    })
}

pub async fn list_conversations(state: &AppState, owner: &str) -> Result<Vec<Conversation>, ChatError> {
    log::info!("Listing conversations for {}", owner);
    state.storage.list_conversations(owner).await.map_err(|e| {
        log::error!("Failed to list conversations: {:?}", e);
        e
    })
}

pub async fn create_conversation(
    state: &AppState,
    owner: &str,
    title: Option<&str>,
) -> Result<Conversation, ChatError> {
    let conversation = state.storage.create_conversation(owner, title).await?;
    log::info!("[CMD] Created conversation {}", conversation.id);
    Ok(conversation)
}

pub async fn get_conversation(
    state: &AppState,
    owner: &str,
    conversation_id: &str,
) -> Result<Conversation, ChatError> {
    let conv_uuid = parse_id("conversation", conversation_id)?;
    state.storage.get_conversation(owner, conv_uuid).await
}

pub async fn get_conversation_messages(
    state: &AppState,
    owner: &str,
    conversation_id: &str,
) -> Result<Vec<Message>, ChatError> {
    log::debug!("Messages requested for conversation ID: {}", conversation_id);
    let conv_uuid = parse_id("conversation", conversation_id)?;
    state.storage.get_messages(owner, conv_uuid).await
}

pub async fn rename_conversation(
    state: &AppState,
    owner: &str,
    conversation_id: &str,
    new_title: &str,
) -> Result<(), ChatError> {
    log::info!("Renaming conversation {} to: {}", conversation_id, new_title);
    if new_title.trim().is_empty() {
        return Err(ChatError::Validation("New title cannot be empty.".to_string()));
    }
    let conv_uuid = parse_id("conversation", conversation_id)?;
    state
        .storage
        .rename_conversation(owner, conv_uuid, new_title)
        .await
}

pub async fn delete_conversation(
    state: &AppState,
    owner: &str,
    conversation_id: &str,
) -> Result<(), ChatError> {
    log::warn!("[CMD] Deleting conversation ID: {}", conversation_id);
    let conv_uuid = parse_id("conversation", conversation_id)?;
    state.storage.delete_conversation(owner, conv_uuid).await?;
    state.broadcaster.prune(conv_uuid);
    Ok(())
}

/// Stores the user message and an assistant placeholder, then streams the
/// reply into the placeholder on a background task.
///
/// The history sent to the model is built from what was stored before this
/// call, so the new message appears in it exactly once.
pub async fn send_message(
    state: &AppState,
    owner: &str,
    conversation_id: &str,
    content: &str,
) -> Result<SendHandle, ChatError> {
    log::info!("Send requested for conversation ID: {}", conversation_id);
    let conv_uuid = parse_id("conversation", conversation_id)?;
    if content.trim().is_empty() {
        return Err(ChatError::Validation("Message cannot be empty.".to_string()));
    }

    let stored = state.storage.get_messages(owner, conv_uuid).await?;
    let turns = build_history(&stored, content, state.history_limit);

    let user_message = state
        .storage
        .append_message(owner, conv_uuid, Role::User, content)
        .await?;
    let assistant_message = state
        .storage
        .append_message(owner, conv_uuid, Role::Assistant, "")
        .await?;
    log::info!(
        "User message {} saved, reply will stream into {}",
        user_message.id,
        assistant_message.id
    );

    let target = StreamTarget::for_message(owner, &assistant_message);
    // Registered before the task starts so an early stop is not lost
    state.cancelled_streams.insert(target.message_id, false);
    let publisher = state.publisher();
    let api_provider = state.api_provider.clone();
    let model_config = state.model_config.clone();

    let completion = tokio::spawn(async move {
        log::info!("BG Task [{}]: started with {} turns", target.message_id, turns.len());
        let stream = match config::get_api_key(&model_config) {
            Ok(api_key) => {
                api_provider
                    .send_chat_stream_request(&model_config, &api_key, &turns)
                    .await
            }
            Err(e) => Err(e),
        };
        publisher.publish(target, stream).await
    });

    Ok(SendHandle {
        receipt: SendReceipt {
            user_message,
            assistant_message,
        },
        completion,
    })
}

/// Asks the publisher of `message_id` to stop after the fragment in flight.
/// Fails with `NotFound` when no reply is being generated into that message.
pub async fn stop_generation(state: &AppState, message_id: &str) -> Result<(), ChatError> {
    log::warn!("Stop requested for message ID: {}", message_id);
    let msg_uuid = parse_id("message", message_id)?;
    match state.cancelled_streams.get_mut(&msg_uuid) {
        Some(mut flag) => *flag = true,
        None => {
            log::warn!("No running stream for message ID: {}", msg_uuid);
            return Err(ChatError::NotFound(format!(
                "no running stream for message {}",
                msg_uuid
            )));
        }
    }
    log::info!("Cancellation signal set for message ID: {}", msg_uuid);
    Ok(())
}
