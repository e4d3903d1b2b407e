use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use change_feed::ChangePublisher;
use community_service::config::Config;
use community_service::db::{init_pool, MIGRATOR};
use community_service::domain::Tab;
use community_service::logging::init_tracing;
use community_service::repository::{PgPostStore, RedisChangeFeed};
use community_service::services::{FeedSynchronizer, SyncConfig, SyncStatus, TracingNotifier};

const EVENT_SOURCE: &str = "community-service";

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(env = %config.app.env, "Starting community-service");

    let pool = init_pool(&config.database)
        .await
        .context("Failed to create database pool")?;
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Database health check failed")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database ready");

    let publisher = ChangePublisher::with_channel(
        &config.redis.url,
        EVENT_SOURCE.to_string(),
        config.redis.change_channel.clone(),
    )
    .await
    .context("Failed to connect change publisher")?;
    let store = Arc::new(PgPostStore::with_publisher(pool.clone(), publisher));

    let changes = RedisChangeFeed::connect(&config.redis.url, &config.redis.change_channel)
        .await
        .context("Failed to connect change feed")?;
    info!(channel = %changes.channel(), "Following change channel");

    let feed = FeedSynchronizer::start(
        store,
        Arc::new(changes),
        Arc::new(TracingNotifier),
        SyncConfig {
            resubscribe: config.sync.retry_config(),
        },
    );

    let mut updates = feed.subscribe_updates();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                if feed.is_loading() {
                    continue;
                }
                let trending = feed.view(Tab::TrendingPost);
                info!(
                    status = ?feed.status(),
                    posts = trending.len(),
                    top = ?trending.first().map(|p| p.id),
                    "Feed updated"
                );
                if feed.status() == SyncStatus::Disconnected {
                    warn!("Change feed disconnected, feed is no longer live");
                }
            }
        }
    }

    feed.shutdown();
    pool.close().await;
    info!("community-service stopped");
    Ok(())
}
