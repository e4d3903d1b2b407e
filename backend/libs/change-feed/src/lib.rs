//! Row change notifications over Redis Pub/Sub
//!
//! Every write to the community tables is followed by a small JSON message
//! describing which table/row changed. Clients subscribe to the channel and
//! refetch whatever they display.
//!
//! # Architecture
//!
//! ```text
//! Writer (community-service store):
//!   1. INSERT INTO post_votes ... (commit)
//!   2. PUBLISH community:changes {"table": "post_votes", "action": "insert", ...}
//!      ↓
//! Redis Pub/Sub (broadcast to all subscribers)
//!      ↓
//! Every open feed view:
//!   3. Receive change event
//!   4. Refetch the post collection and replace local state
//! ```
//!
//! # Example: Publisher
//!
//! ```no_run
//! use change_feed::{ChangeEvent, ChangePublisher, ChangeTable};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let publisher = ChangePublisher::new(
//!         "redis://localhost:6379",
//!         "community-service".to_string()
//!     ).await?;
//!
//!     let event = ChangeEvent::insert(ChangeTable::Posts, Uuid::new_v4(), publisher.source());
//!     publisher.publish(event).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Subscriber
//!
//! ```no_run
//! use change_feed::ChangeSubscriber;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let subscriber = ChangeSubscriber::new("redis://localhost:6379").await?;
//!
//!     let handle = subscriber.subscribe(|event| async move {
//!         println!("{} changed", event.table);
//!         Ok(())
//!     }).await?;
//!
//!     handle.await?;
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
mod stats;

pub use error::ChangeFeedError;
pub use stats::{ChangeFeedStats, StatsCollector};

type Result<T> = std::result::Result<T, ChangeFeedError>;

/// Tables whose rows produce change events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Posts,
    Comments,
    PostVotes,
    Conversations,
    ConversationParticipants,
    Messages,
}

impl ChangeTable {
    /// Tables that make up a post aggregate (post row, its comments, its votes)
    pub fn affects_posts(&self) -> bool {
        matches!(
            self,
            ChangeTable::Posts | ChangeTable::Comments | ChangeTable::PostVotes
        )
    }

    /// Tables backing direct messaging
    pub fn affects_conversations(&self) -> bool {
        matches!(
            self,
            ChangeTable::Conversations
                | ChangeTable::ConversationParticipants
                | ChangeTable::Messages
        )
    }
}

impl std::fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeTable::Posts => write!(f, "posts"),
            ChangeTable::Comments => write!(f, "comments"),
            ChangeTable::PostVotes => write!(f, "post_votes"),
            ChangeTable::Conversations => write!(f, "conversations"),
            ChangeTable::ConversationParticipants => write!(f, "conversation_participants"),
            ChangeTable::Messages => write!(f, "messages"),
        }
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// A single row change notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub table: ChangeTable,
    pub action: ChangeAction,
    pub record_id: Option<Uuid>,
    /// Narrowing key for subscribers, e.g. the conversation a message belongs to
    pub scope: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl ChangeEvent {
    pub fn new(
        table: ChangeTable,
        action: ChangeAction,
        record_id: Option<Uuid>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            table,
            action,
            record_id,
            scope: None,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    pub fn insert(table: ChangeTable, record_id: Uuid, source: impl Into<String>) -> Self {
        Self::new(table, ChangeAction::Insert, Some(record_id), source)
    }

    pub fn update(table: ChangeTable, record_id: Uuid, source: impl Into<String>) -> Self {
        Self::new(table, ChangeAction::Update, Some(record_id), source)
    }

    pub fn delete(table: ChangeTable, record_id: Uuid, source: impl Into<String>) -> Self {
        Self::new(table, ChangeAction::Delete, Some(record_id), source)
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// True when the event carries no scope or the given one
    pub fn in_scope(&self, scope: &str) -> bool {
        self.scope.as_deref().map_or(true, |s| s == scope)
    }

    /// Parse a raw Pub/Sub payload
    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Publisher for row change events
#[derive(Clone)]
pub struct ChangePublisher {
    client: ConnectionManager,
    channel: String,
    source: String,
    stats: StatsCollector,
}

impl ChangePublisher {
    /// Default Redis channel for community row changes
    pub const DEFAULT_CHANNEL: &'static str = "community:changes";

    /// Create new publisher
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `source` - Name of the publishing process, copied into every event
    pub async fn new(redis_url: &str, source: String) -> Result<Self> {
        Self::with_channel(redis_url, source, Self::DEFAULT_CHANNEL.to_string()).await
    }

    /// Create publisher with custom channel
    pub async fn with_channel(redis_url: &str, source: String, channel: String) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            client: connection,
            channel,
            source,
            stats: StatsCollector::new(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stats(&self) -> ChangeFeedStats {
        self.stats.snapshot()
    }

    /// Publish change event
    ///
    /// Returns number of subscribers that received the message
    pub async fn publish(&self, event: ChangeEvent) -> Result<usize> {
        let payload = serde_json::to_string(&event)?;

        debug!(
            event_id = %event.event_id,
            table = %event.table,
            action = ?event.action,
            channel = %self.channel,
            "Publishing change event"
        );

        let mut conn = self.client.clone();
        let subscriber_count: usize = match conn.publish(&self.channel, payload).await {
            Ok(count) => count,
            Err(e) => {
                self.stats.record_error();
                return Err(e.into());
            }
        };
        self.stats.record_publish();

        info!(
            event_id = %event.event_id,
            subscribers = subscriber_count,
            "Change event published"
        );

        Ok(subscriber_count)
    }
}

/// Subscriber for row change events
pub struct ChangeSubscriber {
    client: Client,
    channel: String,
    stats: StatsCollector,
}

impl ChangeSubscriber {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_channel(redis_url, ChangePublisher::DEFAULT_CHANNEL.to_string()).await
    }

    /// Create subscriber with custom channel
    pub async fn with_channel(redis_url: &str, channel: String) -> Result<Self> {
        let client = Client::open(redis_url)?;

        Ok(Self {
            client,
            channel,
            stats: StatsCollector::new(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stats(&self) -> ChangeFeedStats {
        self.stats.snapshot()
    }

    /// Open a Pub/Sub connection and return its events as a stream.
    ///
    /// Payloads that fail to parse are yielded as errors rather than skipped,
    /// so callers can decide whether a malformed message is fatal. The stream
    /// ends when the connection drops; dropping it unsubscribes.
    pub async fn stream(&self) -> Result<BoxStream<'static, Result<ChangeEvent>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        info!(channel = %self.channel, "Subscribed to change events");

        let stats = self.stats.clone();
        let stream = pubsub.into_on_message().map(move |msg| {
            let parsed = msg
                .get_payload::<String>()
                .map_err(ChangeFeedError::from)
                .and_then(|payload| ChangeEvent::from_payload(&payload));
            match &parsed {
                Ok(_) => stats.record_receive(),
                Err(_) => stats.record_error(),
            }
            parsed
        });

        Ok(stream.boxed())
    }

    /// Subscribe to change events with callback
    ///
    /// Returns JoinHandle for background task
    pub async fn subscribe<F, Fut>(&self, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut stream = self.stream().await?;
        let callback = Arc::new(callback);

        let handle = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                let event = match next {
                    Ok(event) => event,
                    Err(e) => {
                        error!(error = ?e, "Failed to decode change event");
                        continue;
                    }
                };

                debug!(
                    event_id = %event.event_id,
                    table = %event.table,
                    action = ?event.action,
                    "Received change event"
                );

                let event_id = event.event_id;
                if let Err(e) = callback(event).await {
                    error!(error = ?e, event_id = %event_id, "Callback execution failed");
                }
            }

            warn!("Change subscription ended");
        });

        Ok(handle)
    }

    /// Stop subscription
    pub fn unsubscribe(&self, handle: JoinHandle<()>) {
        handle.abort();
    }
}
