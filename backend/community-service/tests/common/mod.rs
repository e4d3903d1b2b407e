#![allow(dead_code)]

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use community_service::domain::{create_post, Identity, Post};
use community_service::repository::InMemoryStore;
use community_service::retry::RetryConfig;
use community_service::services::{
    FeedHandle, FeedSynchronizer, InteractionActions, RecordingNotifier, StaticIdentity,
    SyncConfig, SyncStatus,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn uma() -> Identity {
    Identity::new("user_uma", "Uma")
}

pub fn victor() -> Identity {
    Identity::new("user_victor", "Victor")
}

pub fn seed_post(author: &Identity, title: Option<&str>, content: &str) -> Post {
    let draft = create_post(&author.user_id, &author.display_name, title, content)
        .expect("valid draft");
    Post::from_draft(draft, Uuid::new_v4(), Utc::now())
}

/// Retry policy that gives up within a few milliseconds
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Wait for `condition` to hold on the feed, re-checking on every update
pub async fn wait_until(feed: &FeedHandle, condition: impl Fn(&FeedHandle) -> bool) -> bool {
    let mut updates = feed.subscribe_updates();
    let waited = timeout(WAIT, async {
        while !condition(feed) {
            if updates.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    waited.is_ok() && condition(feed)
}

/// Poll an async condition until it holds or the wait runs out
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

pub fn start_feed(store: &Arc<InMemoryStore>, notifier: &Arc<RecordingNotifier>) -> FeedHandle {
    start_feed_with(store, notifier, SyncConfig::default())
}

pub fn start_feed_with(
    store: &Arc<InMemoryStore>,
    notifier: &Arc<RecordingNotifier>,
    config: SyncConfig,
) -> FeedHandle {
    FeedSynchronizer::start(store.clone(), store.clone(), notifier.clone(), config)
}

/// A running feed with actions for one caller
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub identity: Arc<StaticIdentity>,
    pub notifier: Arc<RecordingNotifier>,
    pub actions: Arc<InteractionActions>,
}

impl Harness {
    pub async fn start(posts: Vec<Post>, caller: Option<Identity>) -> Self {
        let store = Arc::new(InMemoryStore::with_posts(posts));
        let identity = Arc::new(match caller {
            Some(identity) => StaticIdentity::signed_in(identity),
            None => StaticIdentity::signed_out(),
        });
        let notifier = Arc::new(RecordingNotifier::new());
        let feed = start_feed(&store, &notifier);
        assert!(
            wait_until(&feed, |f| !f.is_loading() && f.status() == SyncStatus::Live).await,
            "feed never went live"
        );

        let actions = Arc::new(InteractionActions::new(
            store.clone(),
            identity.clone(),
            notifier.clone(),
            feed,
        ));
        Self {
            store,
            identity,
            notifier,
            actions,
        }
    }

    pub fn feed(&self) -> &FeedHandle {
        self.actions.feed()
    }
}
