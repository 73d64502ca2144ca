//! Turns stored messages into the alternating prompt context the generation
//! adapter expects.

use crate::models::{Message, Role};
use serde::{Deserialize, Serialize};

/// One turn of generation context.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Builds the context for a new `submission` from the last `limit` settled
/// messages. The result starts with a user turn, strictly alternates roles
/// and ends with the submission.
///
/// Assistant messages that are still streaming are not turns yet. They are
/// dropped before the window is taken, so they never use up any of the
/// `limit`. Runs of the same role collapse to their most recent member.
pub fn build_history(stored: &[Message], submission: &str, limit: usize) -> Vec<ChatTurn> {
    let settled: Vec<&Message> = stored
        .iter()
        .filter(|m| m.role == Role::User || m.is_complete)
        .collect();
    let window = &settled[settled.len().saturating_sub(limit)..];

    let mut turns: Vec<ChatTurn> = Vec::with_capacity(window.len() + 1);
    for message in window {
        match turns.last_mut() {
            Some(last) if last.role == message.role => last.content = message.content.clone(),
            _ => turns.push(ChatTurn {
                role: message.role,
                content: message.content.clone(),
            }),
        }
    }

    let first_user = turns.iter().position(|t| t.role == Role::User);
    match first_user {
        Some(start) => {
            turns.drain(..start);
        }
        None => return vec![ChatTurn::user(submission)],
    }

    match turns.last_mut() {
        Some(last) if last.role == Role::User => last.content = submission.to_string(),
        _ => turns.push(ChatTurn::user(submission)),
    }
    turns
}
