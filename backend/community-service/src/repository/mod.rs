//! Backing-store and change-channel interfaces plus their implementations.

pub mod conversations;
pub mod memory;
pub mod posts;
pub mod redis_feed;

use async_trait::async_trait;
use change_feed::ChangeEvent;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::domain::{
    Comment, Conversation, ConversationThread, Message, NewComment, NewPost, Post, VoteDirection,
};
use crate::error::{StoreResult, SubscriptionError};

pub use conversations::PgMessageStore;
pub use memory::InMemoryStore;
pub use posts::PgPostStore;
pub use redis_feed::RedisChangeFeed;

/// Authoritative post collection.
///
/// `cast_vote` is the store-side toggle: the store applies the same
/// toggle/switch rules as [`crate::domain::VoteLedger::cast`] atomically per
/// post and user.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// All posts newest first, each with its comments newest first
    async fn fetch_all_posts(&self) -> StoreResult<Vec<Post>>;

    async fn create_post(&self, post: NewPost) -> StoreResult<Post>;

    async fn cast_vote(
        &self,
        post_id: Uuid,
        user_id: &str,
        direction: VoteDirection,
    ) -> StoreResult<()>;

    async fn add_comment(&self, post_id: Uuid, comment: NewComment) -> StoreResult<Comment>;
}

/// Stream of row changes. Dropping it unsubscribes.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, SubscriptionError>>;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<ChangeStream, SubscriptionError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Conversations `user_id` takes part in, most recently updated first
    async fn conversations_for(&self, user_id: &str) -> StoreResult<Vec<Conversation>>;

    /// The conversation with its messages oldest first
    async fn conversation_with_messages(&self, conversation_id: Uuid)
        -> StoreResult<ConversationThread>;

    /// A conversation both users take part in, if any
    async fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> StoreResult<Option<Conversation>>;

    async fn create_conversation(&self, user_a: &str, user_b: &str) -> StoreResult<Conversation>;

    /// Store a message and bump the conversation's `updated_at` and `last_message_text`
    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        content: &str,
    ) -> StoreResult<Message>;

    /// Mark messages from other senders as read. Returns how many changed.
    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<u64>;

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>>;
}

/// Operations the in-memory store can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    FetchPosts,
    CreatePost,
    CastVote,
    AddComment,
    Subscribe,
    FetchConversations,
    CreateConversation,
    SendMessage,
    MarkRead,
}
