/// Error types for community-service
use thiserror::Error;
use uuid::Uuid;

/// Failures of the backing store, the change channel and remote APIs.
///
/// Every variant is a remote failure from the caller's point of view.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Change feed error: {0}")]
    ChangeFeed(#[from] change_feed::ChangeFeedError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidPayload(err.to_string())
    }
}

impl From<crate::domain::LedgerError> for StoreError {
    fn from(err: crate::domain::LedgerError) -> Self {
        StoreError::InvalidPayload(err.to_string())
    }
}

/// Why a user-triggered action did not complete
#[derive(Error, Debug)]
pub enum InteractionError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Remote failure: {0}")]
    Remote(#[from] StoreError),

    #[error("An identical action is already in flight")]
    AlreadyPending,

    #[error("Post not found: {0}")]
    PostNotFound(Uuid),
}

impl InteractionError {
    /// Rejected locally, before any optimistic change or remote call
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            InteractionError::AuthenticationRequired
                | InteractionError::Validation(_)
                | InteractionError::AlreadyPending
                | InteractionError::PostNotFound(_)
        )
    }
}

/// Failures of a change-notification subscription
#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Change stream closed")]
    Closed,

    #[error("Subscriber lagged behind by {0} events")]
    Lagged(u64),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<change_feed::ChangeFeedError> for SubscriptionError {
    fn from(err: change_feed::ChangeFeedError) -> Self {
        SubscriptionError::Transport(err.to_string())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
