use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::warn;

use change_feed::{ChangeEvent, ChangeSubscriber};

use super::{ChangeFeed, ChangeStream};
use crate::error::{StoreResult, SubscriptionError};

/// Change channel backed by Redis Pub/Sub.
///
/// Each `subscribe` opens its own Pub/Sub connection; the stream ends when
/// that connection drops.
pub struct RedisChangeFeed {
    subscriber: ChangeSubscriber,
}

impl RedisChangeFeed {
    pub fn new(subscriber: ChangeSubscriber) -> Self {
        Self { subscriber }
    }

    pub async fn connect(redis_url: &str, channel: &str) -> StoreResult<Self> {
        let subscriber = ChangeSubscriber::with_channel(redis_url, channel.to_string()).await?;
        Ok(Self::new(subscriber))
    }

    pub fn channel(&self) -> &str {
        self.subscriber.channel()
    }
}

#[async_trait]
impl ChangeFeed for RedisChangeFeed {
    async fn subscribe(&self) -> Result<ChangeStream, SubscriptionError> {
        let channel = self.subscriber.channel().to_string();
        let stream = self.subscriber.stream().await?;

        // Undecodable payloads are skipped; only a dropped connection ends the stream.
        let events = stream.filter_map(move |item| {
            let item: Option<Result<ChangeEvent, SubscriptionError>> = match item {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Skipping undecodable change event");
                    None
                }
            };
            futures_util::future::ready(item)
        });

        Ok(events.boxed())
    }
}
