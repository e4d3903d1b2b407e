//! In-process store implementing every store and change-channel trait.
//!
//! Mutations run under one lock and broadcast a [`ChangeEvent`] afterwards,
//! the way the hosted backend notifies subscribers of row changes. Failure
//! injection and a mutation gate let tests drive remote-failure and
//! in-flight paths deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

use change_feed::{ChangeAction, ChangeEvent, ChangeTable};

use super::{ChangeFeed, ChangeStream, MessageStore, PostStore, StoreOperation};
use crate::domain::{
    Comment, Conversation, ConversationParticipant, ConversationThread, Message, NewComment,
    NewPost, Post, VoteDirection, VoteTransition,
};
use crate::error::{StoreError, StoreResult, SubscriptionError};

const EVENT_SOURCE: &str = "in-memory-store";
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
enum FeedSignal {
    Change(ChangeEvent),
    /// Ends every open subscription, as a dropped connection would
    Disconnect,
}

#[derive(Default)]
struct MemoryState {
    /// Newest first
    posts: Vec<Post>,
    conversations: Vec<Conversation>,
    /// Insertion (chronological) order
    messages: Vec<Message>,
    clock: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Strictly increasing timestamps so "most recent" orderings are total
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.clock {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(ts);
        ts
    }

    fn post_mut(&mut self, post_id: Uuid) -> StoreResult<&mut Post> {
        self.posts
            .iter_mut()
            .find(|p| p.id == post_id)
            .ok_or_else(|| StoreError::NotFound(format!("post {}", post_id)))
    }

    fn conversation_mut(&mut self, conversation_id: Uuid) -> StoreResult<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))
    }
}

pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<FeedSignal>,
    failures: Mutex<HashMap<StoreOperation, u32>>,
    gate: watch::Sender<bool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            failures: Mutex::new(HashMap::new()),
            gate,
        }
    }

    /// Seed the store with posts, given newest first
    pub fn with_posts(posts: Vec<Post>) -> Self {
        let store = Self::new();
        store.state.lock().posts = posts;
        store
    }

    /// Make the next call of `operation` fail with [`StoreError::Unavailable`]
    pub fn fail_next(&self, operation: StoreOperation) {
        self.fail_times(operation, 1);
    }

    pub fn fail_times(&self, operation: StoreOperation, times: u32) {
        *self.failures.lock().entry(operation).or_insert(0) += times;
    }

    /// Hold every mutation until [`InMemoryStore::resume_mutations`]
    pub fn pause_mutations(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume_mutations(&self) {
        self.gate.send_replace(true);
    }

    /// Open change subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// End every open change subscription
    pub fn drop_subscribers(&self) {
        let _ = self.events.send(FeedSignal::Disconnect);
    }

    fn take_failure(&self, operation: StoreOperation) -> Option<String> {
        let mut failures = self.failures.lock();
        match failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Some(format!("injected failure in {:?}", operation))
            }
            _ => None,
        }
    }

    async fn enter(&self, operation: StoreOperation, mutation: bool) -> StoreResult<()> {
        if mutation {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        match self.take_failure(operation) {
            Some(reason) => Err(StoreError::Unavailable(reason)),
            None => Ok(()),
        }
    }

    fn publish(&self, event: ChangeEvent) {
        debug!(table = %event.table, action = ?event.action, "Broadcasting change");
        let _ = self.events.send(FeedSignal::Change(event));
    }
}

#[async_trait]
impl PostStore for InMemoryStore {
    async fn fetch_all_posts(&self) -> StoreResult<Vec<Post>> {
        self.enter(StoreOperation::FetchPosts, false).await?;
        Ok(self.state.lock().posts.clone())
    }

    async fn create_post(&self, post: NewPost) -> StoreResult<Post> {
        self.enter(StoreOperation::CreatePost, true).await?;
        let created = {
            let mut state = self.state.lock();
            let created_at = state.tick();
            let created = Post::from_draft(post, Uuid::new_v4(), created_at);
            state.posts.insert(0, created.clone());
            created
        };
        self.publish(ChangeEvent::insert(ChangeTable::Posts, created.id, EVENT_SOURCE));
        Ok(created)
    }

    async fn cast_vote(
        &self,
        post_id: Uuid,
        user_id: &str,
        direction: VoteDirection,
    ) -> StoreResult<()> {
        self.enter(StoreOperation::CastVote, true).await?;
        let transition = self.state.lock().post_mut(post_id)?.cast_vote(user_id, direction);
        let action = match transition {
            VoteTransition::Added(_) => ChangeAction::Insert,
            VoteTransition::Removed(_) => ChangeAction::Delete,
            VoteTransition::Switched { .. } => ChangeAction::Update,
        };
        self.publish(ChangeEvent::new(
            ChangeTable::PostVotes,
            action,
            Some(post_id),
            EVENT_SOURCE,
        ));
        Ok(())
    }

    async fn add_comment(&self, post_id: Uuid, comment: NewComment) -> StoreResult<Comment> {
        self.enter(StoreOperation::AddComment, true).await?;
        let stored = {
            let mut state = self.state.lock();
            let created_at = state.tick();
            let stored = Comment {
                id: Uuid::new_v4(),
                content: comment.content,
                author: comment.author,
                author_id: comment.author_id,
                created_at,
            };
            state.post_mut(post_id)?.comments.prepend(stored.clone());
            stored
        };
        self.publish(
            ChangeEvent::insert(ChangeTable::Comments, stored.id, EVENT_SOURCE)
                .with_scope(post_id.to_string()),
        );
        Ok(stored)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryStore {
    async fn subscribe(&self) -> Result<ChangeStream, SubscriptionError> {
        if let Some(reason) = self.take_failure(StoreOperation::Subscribe) {
            return Err(SubscriptionError::Transport(reason));
        }

        let receiver = self.events.subscribe();
        let stream = futures_util::stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Ok(FeedSignal::Change(event)) => Some((Ok(event), Some(receiver))),
                Ok(FeedSignal::Disconnect) => Some((Err(SubscriptionError::Closed), None)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    Some((Err(SubscriptionError::Lagged(missed)), Some(receiver)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn conversations_for(&self, user_id: &str) -> StoreResult<Vec<Conversation>> {
        self.enter(StoreOperation::FetchConversations, false).await?;
        let mut conversations: Vec<Conversation> = self
            .state
            .lock()
            .conversations
            .iter()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn conversation_with_messages(
        &self,
        conversation_id: Uuid,
    ) -> StoreResult<ConversationThread> {
        self.enter(StoreOperation::FetchConversations, false).await?;
        let mut state = self.state.lock();
        let conversation = state.conversation_mut(conversation_id)?.clone();
        let messages = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        Ok(ConversationThread {
            conversation,
            messages,
        })
    }

    async fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> StoreResult<Option<Conversation>> {
        self.enter(StoreOperation::FetchConversations, false).await?;
        Ok(self
            .state
            .lock()
            .conversations
            .iter()
            .find(|c| c.has_participant(user_a) && c.has_participant(user_b))
            .cloned())
    }

    async fn create_conversation(&self, user_a: &str, user_b: &str) -> StoreResult<Conversation> {
        self.enter(StoreOperation::CreateConversation, true).await?;
        let conversation = {
            let mut state = self.state.lock();
            let now = state.tick();
            let id = Uuid::new_v4();
            let participant = |user_id: &str| ConversationParticipant {
                id: Uuid::new_v4(),
                conversation_id: id,
                user_id: user_id.to_string(),
                created_at: now,
            };
            let conversation = Conversation {
                id,
                created_at: now,
                updated_at: now,
                last_message_text: None,
                participants: vec![participant(user_a), participant(user_b)],
            };
            state.conversations.push(conversation.clone());
            conversation
        };
        self.publish(
            ChangeEvent::insert(ChangeTable::Conversations, conversation.id, EVENT_SOURCE)
                .with_scope(conversation.id.to_string()),
        );
        Ok(conversation)
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: &str,
        content: &str,
    ) -> StoreResult<Message> {
        self.enter(StoreOperation::SendMessage, true).await?;
        let message = {
            let mut state = self.state.lock();
            let now = state.tick();
            let conversation = state.conversation_mut(conversation_id)?;
            conversation.updated_at = now;
            conversation.last_message_text = Some(content.to_string());

            let message = Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: sender_id.to_string(),
                content: content.to_string(),
                created_at: now,
                read: false,
            };
            state.messages.push(message.clone());
            message
        };
        let scope = conversation_id.to_string();
        self.publish(
            ChangeEvent::insert(ChangeTable::Messages, message.id, EVENT_SOURCE)
                .with_scope(scope.clone()),
        );
        self.publish(
            ChangeEvent::update(ChangeTable::Conversations, conversation_id, EVENT_SOURCE)
                .with_scope(scope),
        );
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> StoreResult<u64> {
        self.enter(StoreOperation::MarkRead, true).await?;
        let updated = {
            let mut state = self.state.lock();
            let mut updated = 0;
            for message in state.messages.iter_mut().filter(|m| {
                m.conversation_id == conversation_id && m.sender_id != reader_id && !m.read
            }) {
                message.read = true;
                updated += 1;
            }
            updated
        };
        if updated > 0 {
            self.publish(
                ChangeEvent::new(
                    ChangeTable::Messages,
                    ChangeAction::Update,
                    None,
                    EVENT_SOURCE,
                )
                .with_scope(conversation_id.to_string()),
            );
        }
        Ok(updated)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        Ok(self
            .state
            .lock()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::create_post;

    fn draft(content: &str) -> NewPost {
        create_post("author", "Ada", None, content).unwrap()
    }

    #[tokio::test]
    async fn test_posts_newest_first() {
        let store = InMemoryStore::new();
        let first = store.create_post(draft("first")).await.unwrap();
        let second = store.create_post(draft("second")).await.unwrap();

        let posts = store.fetch_all_posts().await.unwrap();
        assert_eq!(posts[0].id, second.id);
        assert_eq!(posts[1].id, first.id);
        assert!(second.created_at > first.created_at);
    }

    #[tokio::test]
    async fn test_store_vote_toggles() {
        let store = InMemoryStore::new();
        let post = store.create_post(draft("body")).await.unwrap();

        store.cast_vote(post.id, "u", VoteDirection::Upvote).await.unwrap();
        store.cast_vote(post.id, "u", VoteDirection::Downvote).await.unwrap();
        let posts = store.fetch_all_posts().await.unwrap();
        assert_eq!(posts[0].upvotes(), 0);
        assert_eq!(posts[0].downvotes(), 1);

        store.cast_vote(post.id, "u", VoteDirection::Downvote).await.unwrap();
        let posts = store.fetch_all_posts().await.unwrap();
        assert_eq!(posts[0].downvotes(), 0);
    }

    #[tokio::test]
    async fn test_vote_on_missing_post() {
        let store = InMemoryStore::new();
        let err = store
            .cast_vote(Uuid::new_v4(), "u", VoteDirection::Upvote)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let store = InMemoryStore::new();
        store.fail_next(StoreOperation::FetchPosts);

        assert!(matches!(
            store.fetch_all_posts().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.fetch_all_posts().await.is_ok());
    }

    #[tokio::test]
    async fn test_mutations_are_broadcast() {
        let store = InMemoryStore::new();
        let mut changes = store.subscribe().await.unwrap();
        assert_eq!(store.subscriber_count(), 1);

        let post = store.create_post(draft("body")).await.unwrap();
        let event = changes.next().await.unwrap().unwrap();
        assert_eq!(event.table, ChangeTable::Posts);
        assert_eq!(event.record_id, Some(post.id));

        store
            .add_comment(
                post.id,
                NewComment {
                    content: "hi".into(),
                    author: "Cy".into(),
                    author_id: "c".into(),
                },
            )
            .await
            .unwrap();
        let event = changes.next().await.unwrap().unwrap();
        assert_eq!(event.table, ChangeTable::Comments);
        assert_eq!(event.scope.as_deref(), Some(post.id.to_string().as_str()));

        drop(changes);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_subscribers_ends_stream() {
        let store = InMemoryStore::new();
        let mut changes = store.subscribe().await.unwrap();

        store.drop_subscribers();
        assert!(matches!(
            changes.next().await,
            Some(Err(SubscriptionError::Closed))
        ));
        assert!(changes.next().await.is_none());
    }

    #[tokio::test]
    async fn test_conversation_lifecycle() {
        let store = InMemoryStore::new();
        let older = store.create_conversation("a", "c").await.unwrap();
        let conversation = store.create_conversation("a", "b").await.unwrap();

        let found = store.find_direct_conversation("b", "a").await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(conversation.id));

        store.send_message(older.id, "c", "ping").await.unwrap();
        let listed = store.conversations_for("a").await.unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[0].last_message_text.as_deref(), Some("ping"));

        store.send_message(conversation.id, "b", "one").await.unwrap();
        store.send_message(conversation.id, "a", "two").await.unwrap();
        let thread = store.conversation_with_messages(conversation.id).await.unwrap();
        let texts: Vec<&str> = thread.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);

        assert_eq!(store.mark_read(conversation.id, "a").await.unwrap(), 1);
        assert_eq!(store.mark_read(conversation.id, "a").await.unwrap(), 0);
    }
}
