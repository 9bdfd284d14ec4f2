#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::Config;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use worldviews::cache::{CacheStore, MemoryCache};
use worldviews::events::EventBus;
use worldviews::generator::{GenerationSettings, InterpretationGenerator};
use worldviews::ingestion::{RawArticle, RawSource};
use worldviews::llm::{LlmProvider, LlmRequest, LlmResponse, ProviderClient, UsageMetadata};
use worldviews::models::{Article, Persona};
use worldviews::scraping::ContentFetcher;
use worldviews::storage::{articles, personas};

const TEST_CONFIG: &str = r#"
    [database]
    path = ":memory:"

    [[personas]]
    slug = "moderate"
    name = "The Moderate"
    system_prompt = "You are a hyper-rational centrist."
    display_order = 1

    [[personas]]
    slug = "skeptic"
    name = "The Skeptic"
    system_prompt = "You assume every story hides an agenda."
    display_order = 2
"#;

/// Migrated in-memory database with two official personas
pub async fn setup_db() -> SqlitePool {
    let pool = common::init_memory_pool().await.expect("memory pool");
    let config: Config = toml::from_str(TEST_CONFIG).expect("test config");
    common::sync_personas(&config, &pool).await.expect("sync personas");
    pool
}

pub fn raw(url: &str, title: &str, summary: &str, published_at: DateTime<Utc>) -> RawArticle {
    RawArticle {
        source: RawSource {
            id: Some("wsj".to_string()),
            name: Some("Wall Street Journal".to_string()),
        },
        author: Some("Greg Ip".to_string()),
        title: Some(title.to_string()),
        description: Some(summary.to_string()),
        url: Some(url.to_string()),
        url_to_image: None,
        published_at: Some(published_at.to_rfc3339()),
        content: Some(format!("{} [+1200 chars]", summary)),
        fetched_category: None,
    }
}

/// Ingest one article and return it
pub async fn seed_article(pool: &SqlitePool) -> Article {
    let report = worldviews::ingestion::ingest(
        pool,
        &[raw("https://x/a", "Fed signals rate cuts", "Powell says inflation is cooling", Utc::now())],
    )
    .await
    .expect("ingest");
    report.new.into_iter().next().expect("one new article")
}

pub async fn persona(pool: &SqlitePool, slug: &str) -> Persona {
    personas::get_persona_by_slug(pool, slug)
        .await
        .expect("query persona")
        .expect("persona exists")
}

pub async fn featured_ids(pool: &SqlitePool) -> Vec<i64> {
    let mut ids: Vec<i64> = articles::featured_articles(pool)
        .await
        .expect("featured")
        .into_iter()
        .map(|a| a.id)
        .collect();
    ids.sort();
    ids
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("count")
}

/// Scripted provider: counts calls, can sleep, can fail the first N calls (or all of them)
pub struct CountingProvider {
    id: &'static str,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
    last_request: Mutex<Option<LlmRequest>>,
}

impl CountingProvider {
    pub fn new(id: &'static str) -> Arc<Self> {
        Self::build(id, 0, Duration::ZERO)
    }

    pub fn slow(id: &'static str, delay: Duration) -> Arc<Self> {
        Self::build(id, 0, delay)
    }

    pub fn failing_first(id: &'static str, failures: usize) -> Arc<Self> {
        Self::build(id, failures, Duration::ZERO)
    }

    pub fn always_failing(id: &'static str) -> Arc<Self> {
        Self::build(id, usize::MAX, Duration::ZERO)
    }

    fn build(id: &'static str, failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
            delay,
            last_request: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for CountingProvider {
    fn id(&self) -> &str {
        self.id
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_request.lock().unwrap() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok();
        if failing {
            anyhow::bail!("{} unavailable (call {})", self.id, n);
        }

        Ok(LlmResponse {
            content: format!("{} take #{} on: {}", self.id, n, request.prompt),
            usage: UsageMetadata::new(40, 20),
            model: format!("{}-model", self.id),
        })
    }
}

/// Fetcher returning a fixed body and counting calls
pub struct StaticFetcher {
    pub body: Option<String>,
    pub calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(body: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            body: body.map(str::to_string),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl ContentFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.body.clone()
    }
}

pub fn client_with(primary: Arc<CountingProvider>) -> Arc<ProviderClient> {
    Arc::new(ProviderClient::new(Some(primary), None))
}

pub fn test_settings() -> GenerationSettings {
    GenerationSettings {
        quick_timeout: Duration::from_secs(5),
        detailed_timeout: Duration::from_secs(5),
        min_full_text_chars: 40,
        ..Default::default()
    }
}

pub fn generator_with(
    pool: &SqlitePool,
    client: Arc<ProviderClient>,
    cache: Arc<dyn CacheStore>,
    settings: GenerationSettings,
) -> Arc<InterpretationGenerator> {
    Arc::new(InterpretationGenerator::new(
        pool.clone(),
        client,
        cache,
        EventBus::default(),
        settings,
    ))
}

/// Generator over a single scripted provider and a fresh memory cache
pub fn generator(pool: &SqlitePool, provider: Arc<CountingProvider>) -> Arc<InterpretationGenerator> {
    generator_with(
        pool,
        client_with(provider),
        Arc::new(MemoryCache::default()),
        test_settings(),
    )
}
