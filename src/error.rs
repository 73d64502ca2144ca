use uuid::Uuid;

/// Failures surfaced by the store, the command layer and the publisher.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Conversation or message is missing, or not owned by the caller.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
    /// The generation stream or a broadcast failed.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A client view rejected the operation.
    #[error("view error: {0}")]
    View(#[from] ReconcileError),
}

impl ChatError {
    pub fn conversation_not_found(id: Uuid) -> Self {
        ChatError::NotFound(format!("conversation {}", id))
    }
}

/// Failures inside a client-side reconciler. Any of them means the view
/// should be rebuilt from a fresh snapshot.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("event for conversation {got} rejected by view of {expected}")]
    ForeignConversation { expected: Uuid, got: Uuid },
    #[error("cannot submit an empty message")]
    EmptySubmission,
    #[error("no local entry {0}")]
    UnknownLocalEntry(String),
    #[error("no entry can take the update for message {0}")]
    Unresolvable(Uuid),
}
