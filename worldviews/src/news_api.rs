//! Client for a NewsAPI-compatible `/top-headlines` endpoint plus the watermark-driven
//! "fetch only what is newer than what we have" entry point.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::ingestion::{self, RawArticle, RawSource};
use crate::storage::articles::{self, IngestReport};

pub const DEFAULT_API_URL: &str = "https://newsapi.org/v2";
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopHeadlinesResponse {
    status: String,
    #[serde(default)]
    articles: Vec<RawArticle>,
}

pub struct NewsApiClient {
    client: Client,
    base_url: String,
    /// None serves the built-in sample feed
    api_key: Option<String>,
    backoff_unit: Duration,
}

impl NewsApiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Worldviews/0.1.0")
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            backoff_unit: Duration::from_secs(1),
        })
    }

    /// Shorten retry sleeps (tests)
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Top headlines for one category. Retries 5xx, 429 and network errors with
    /// exponential backoff; other 4xx fail immediately. Records come back tagged with
    /// the feed category they were fetched under (`fetched_category`).
    pub async fn top_headlines(&self, category: &str, limit: u32) -> Result<Vec<RawArticle>> {
        let api_key = match &self.api_key {
            Some(key) => key,
            None => {
                info!(category, "no news API key configured, using sample headlines");
                return Ok(sample_headlines(category, limit));
            }
        };

        let url = format!("{}/top-headlines", self.base_url);
        let page_size = limit.to_string();
        let query = [
            ("apiKey", api_key.as_str()),
            ("country", "us"),
            ("category", category),
            ("pageSize", page_size.as_str()),
        ];

        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                let backoff = self.backoff_unit * 2u32.pow(attempt - 2); // 1s, 2s
                info!(category, attempt, max = MAX_RETRIES, ?backoff, "retrying headline fetch");
                tokio::time::sleep(backoff).await;
            }

            match self.client.get(&url).query(&query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: TopHeadlinesResponse = response
                            .json()
                            .await
                            .context("failed to parse headlines response")?;
                        if body.status != "ok" {
                            warn!(category, status = %body.status, "news API reported a non-ok status");
                            return Ok(Vec::new());
                        }
                        return Ok(body
                            .articles
                            .into_iter()
                            .map(|mut a| {
                                a.fetched_category.get_or_insert_with(|| category.to_string());
                                a
                            })
                            .collect());
                    } else if status.is_server_error() {
                        last_error = Some(anyhow::anyhow!("server error: {}", status));
                    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        last_error = Some(anyhow::anyhow!("rate limited: {}", status));
                    } else {
                        return Err(anyhow::anyhow!("headline fetch failed with status: {}", status));
                    }
                }
                Err(e) => {
                    last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
    }
}

/// Fetch every category, keep records published after the stored watermark, drop
/// cross-category duplicates and ingest the remainder as one batch. A failing
/// category is logged and skipped.
pub async fn fetch_latest(
    pool: &SqlitePool,
    client: &NewsApiClient,
    categories: &[String],
    limit_per_category: u32,
) -> Result<IngestReport> {
    let watermark = articles::last_fetch_time(pool).await?;
    info!(%watermark, categories = categories.len(), "fetching latest headlines");

    let mut seen = HashSet::new();
    let mut batch = Vec::new();

    for category in categories {
        let records = match client.top_headlines(category, limit_per_category).await {
            Ok(records) => records,
            Err(e) => {
                warn!(category = %category, error = %format!("{:#}", e), "category fetch failed, skipping it");
                continue;
            }
        };

        let fetched = records.len();
        let fresh: Vec<RawArticle> = records
            .into_iter()
            .filter(|r| match ingestion::normalize(r) {
                Ok(draft) => draft.published_at > watermark,
                // invalid records still go through ingestion so they are counted
                Err(_) => true,
            })
            .filter(|r| seen.insert(ingestion::external_id(r)))
            .collect();

        info!(category = %category, fetched, fresh = fresh.len(), "category fetched");
        batch.extend(fresh);
    }

    ingestion::ingest(pool, &batch).await
}

fn sample(source: (&str, &str), title: &str, description: &str, url: &str, hours_ago: i64) -> RawArticle {
    RawArticle {
        source: RawSource {
            id: Some(source.0.to_string()),
            name: Some(source.1.to_string()),
        },
        author: None,
        title: Some(title.to_string()),
        description: Some(description.to_string()),
        url: Some(url.to_string()),
        url_to_image: None,
        published_at: Some((Utc::now() - ChronoDuration::hours(hours_ago)).to_rfc3339()),
        content: Some(format!("{} [+1800 chars]", description)),
        fetched_category: None,
    }
}

/// Small deterministic feed so the pipeline runs without credentials
fn sample_headlines(category: &str, limit: u32) -> Vec<RawArticle> {
    let all = vec![
        sample(
            ("techcrunch", "TechCrunch"),
            "AI Startup Raises $500M to Build 'ChatGPT Killer'",
            "A new AI startup backed by Silicon Valley heavyweights has raised $500 million.",
            "https://techcrunch.com/2024/ai-startup-funding",
            2,
        ),
        sample(
            ("cnn", "CNN"),
            "Congress Passes Controversial Tech Regulation Bill",
            "In a rare bipartisan vote, Congress has passed sweeping legislation to regulate big tech.",
            "https://cnn.com/2024/tech-regulation-bill",
            4,
        ),
        sample(
            ("bloomberg", "Bloomberg"),
            "Tesla Stock Surges 15% on New Battery Technology Announcement",
            "Tesla shares jumped after the company unveiled a breakthrough in battery technology.",
            "https://bloomberg.com/2024/tesla-battery-breakthrough",
            6,
        ),
        sample(
            ("wsj", "Wall Street Journal"),
            "Federal Reserve Signals Interest Rate Cuts Coming",
            "Fed Chair Jerome Powell indicated the central bank is prepared to lower interest rates.",
            "https://wsj.com/2024/fed-rate-cuts-signal",
            14,
        ),
    ];

    all.into_iter()
        .take(limit as usize)
        .map(|mut a| {
            a.fetched_category = Some(category.to_string());
            a
        })
        .collect()
}
