//! Background loop: periodic ingestion, fan-out of new articles, cache housekeeping.

use anyhow::Result;
use common::{Config, PersonaScope};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::dispatcher::Dispatcher;
use crate::news_api::{self, NewsApiClient};
use crate::storage::articles::{self, IngestReport};

pub const DEFAULT_CATEGORIES: &[&str] = &["general", "technology", "business"];

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub categories: Vec<String>,
    pub limit_per_category: u32,
    pub poll_interval: Duration,
    /// Personas that get a quick take for every new article
    pub scope: PersonaScope,
}

impl IngestionSettings {
    pub fn from_config(config: &Config) -> Self {
        let news = config.news.clone().unwrap_or_default();
        let categories = if news.categories.is_empty() {
            DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect()
        } else {
            news.categories
        };
        Self {
            categories,
            limit_per_category: news.limit_per_category.unwrap_or(20),
            poll_interval: Duration::from_secs(news.poll_interval_minutes.unwrap_or(60) * 60),
            scope: config.auto_generate_scope(),
        }
    }
}

pub struct Worker {
    pub pool: SqlitePool,
    pub news: NewsApiClient,
    pub dispatcher: Dispatcher,
    pub cache: Arc<dyn CacheStore>,
    pub settings: IngestionSettings,
}

impl Worker {
    /// Fetch and ingest when the store is stale (or `force`), then queue quick takes for
    /// every new article. Returns None when the store was fresh enough to skip.
    pub async fn run_ingestion_cycle(&self, force: bool) -> Result<Option<IngestReport>> {
        if !force && !articles::needs_sync(&self.pool).await? {
            info!("worker: articles are fresh, skipping fetch");
            return Ok(None);
        }

        let report = news_api::fetch_latest(
            &self.pool,
            &self.news,
            &self.settings.categories,
            self.settings.limit_per_category,
        )
        .await?;

        // updated and skipped articles keep whatever interpretations they already have
        for article in &report.new {
            if let Err(e) = self.dispatcher.fan_out(article.id, self.settings.scope).await {
                error!(article_id = article.id, error = %format!("{:#}", e), "worker: fan-out failed");
            }
        }

        Ok(Some(report))
    }

    /// Runs until `shutdown` is notified
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        info!(
            categories = ?self.settings.categories,
            interval = ?self.settings.poll_interval,
            scope = ?self.settings.scope,
            "worker: starting"
        );

        loop {
            if let Err(e) = self.run_ingestion_cycle(false).await {
                error!(error = %format!("{:#}", e), "worker: ingestion cycle failed");
            }

            match self.cache.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "worker: purged expired cache entries"),
                Err(e) => warn!(error = %format!("{:#}", e), "worker: cache purge failed"),
            }

            select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.notified() => {
                    info!("worker: shutdown requested, exiting loop");
                    break;
                }
            }
        }

        info!("worker: cleanup complete");
        Ok(())
    }
}
