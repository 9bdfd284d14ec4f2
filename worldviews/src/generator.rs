//! Generation of the two interpretation tiers for one (article, persona) pair.
//!
//! Order of checks for every call: persisted row, then cache, then provider. Each pair
//! ends up with at most one row; the UNIQUE constraint is the cross-process guard and
//! an in-process single-flight lock keeps concurrent callers from all paying for a
//! provider call.

use anyhow::{Context, Result};
use common::Config;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheKey, CacheStore};
use crate::content;
use crate::events::{ChangedField, EventBus, InterpretationEvent};
use crate::llm::{Generation, ProviderClient};
use crate::models::{Article, Interpretation, Persona, Tier};
use crate::prompts;
use crate::scraping::ContentFetcher;
use crate::storage::interpretations::{self, InsertOutcome};
use crate::storage::{articles, personas};

pub const DEFAULT_CACHE_VERSION: &str = "v3";
pub const DEFAULT_CACHE_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub cache_version: String,
    pub cache_ttl: Duration,
    pub quick_max_tokens: usize,
    pub detailed_max_tokens: usize,
    pub quick_timeout: Duration,
    pub detailed_timeout: Duration,
    /// Fetched bodies shorter than this fall back to headline + summary
    pub min_full_text_chars: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_DAYS as u64 * 24 * 3600),
            quick_max_tokens: 500,
            detailed_max_tokens: 1500,
            quick_timeout: Duration::from_secs(20),
            detailed_timeout: Duration::from_secs(60),
            min_full_text_chars: 200,
        }
    }
}

impl GenerationSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut settings = Self::default();
        if let Some(g) = &config.generation {
            if let Some(version) = &g.cache_version {
                settings.cache_version = version.clone();
            }
            if let Some(days) = g.cache_ttl_days.filter(|d| *d > 0) {
                settings.cache_ttl = Duration::from_secs(days as u64 * 24 * 3600);
            }
            if let Some(n) = g.quick_max_tokens {
                settings.quick_max_tokens = n as usize;
            }
            if let Some(n) = g.detailed_max_tokens {
                settings.detailed_max_tokens = n as usize;
            }
            if let Some(n) = g.min_full_text_chars {
                settings.min_full_text_chars = n;
            }
        }
        if let Some(llm) = &config.llm {
            if let Some(secs) = llm.quick_timeout_seconds {
                settings.quick_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = llm.detailed_timeout_seconds {
                settings.detailed_timeout = Duration::from_secs(secs);
            }
        }
        settings
    }
}

type FlightKey = (i64, i64, Tier);

/// Per-key async locks, dropped from the map once nobody holds or waits on them
#[derive(Default)]
struct InFlight {
    locks: Mutex<HashMap<FlightKey, Arc<tokio::sync::Mutex<()>>>>,
}

struct FlightGuard<'a> {
    owner: &'a InFlight,
    key: FlightKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InFlight {
    async fn acquire(&self, key: FlightKey) -> FlightGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(key).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        FlightGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|p| p.into_inner());
        self.guard.take();
        // only the map's own handle left: nobody is waiting
        if locks.get(&self.key).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(&self.key);
        }
    }
}

pub struct InterpretationGenerator {
    pool: SqlitePool,
    client: Arc<ProviderClient>,
    cache: Arc<dyn CacheStore>,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    events: EventBus,
    settings: GenerationSettings,
    in_flight: InFlight,
}

impl InterpretationGenerator {
    pub fn new(
        pool: SqlitePool,
        client: Arc<ProviderClient>,
        cache: Arc<dyn CacheStore>,
        events: EventBus,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            pool,
            client,
            cache,
            fetcher: None,
            events,
            settings,
            in_flight: InFlight::default(),
        }
    }

    /// Enable full-text fetching for the detailed tier
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Load both sides of the pair and run the requested tier
    pub async fn generate(&self, article_id: i64, persona_id: i64, tier: Tier) -> Result<Interpretation> {
        let article = articles::get_article(&self.pool, article_id)
            .await?
            .with_context(|| format!("article {} not found", article_id))?;
        let persona = personas::get_persona(&self.pool, persona_id)
            .await?
            .with_context(|| format!("persona {} not found", persona_id))?;

        match tier {
            Tier::Quick => self.generate_quick_take(&article, &persona).await,
            Tier::Detailed => self.generate_detailed_analysis(&article, &persona).await,
        }
    }

    /// Existing row unchanged, else a row built from the cached payload (cached=true),
    /// else a fresh provider call (cached=false).
    pub async fn generate_quick_take(&self, article: &Article, persona: &Persona) -> Result<Interpretation> {
        if let Some(existing) = self.existing(article.id, persona.id).await? {
            return Ok(existing);
        }

        let _flight = self.in_flight.acquire((article.id, persona.id, Tier::Quick)).await;
        if let Some(existing) = self.existing(article.id, persona.id).await? {
            return Ok(existing);
        }

        info!(article_id = article.id, persona = %persona.slug, "generating quick take");

        let key = self.cache_key(article, persona, Tier::Quick);
        let (generation, cached) = match self.cached_generation(&key).await {
            Some(generation) => (generation, true),
            None => {
                let user = content::user_message(&content::for_quick_take(article));
                let generation = self
                    .client
                    .chat(
                        &prompts::quick_take(persona),
                        &user,
                        self.settings.quick_max_tokens,
                        self.settings.quick_timeout,
                    )
                    .await?;
                self.remember(&key, &generation).await;
                (generation, false)
            }
        };

        match interpretations::insert_interpretation(&self.pool, article.id, persona.id, &generation, cached)
            .await?
        {
            InsertOutcome::Created(row) => {
                info!(
                    article_id = article.id,
                    persona = %persona.slug,
                    provider = %generation.provider_id,
                    tokens = generation.tokens_used,
                    elapsed_ms = generation.elapsed_ms,
                    cached,
                    "quick take stored"
                );
                self.events.emit(InterpretationEvent {
                    article_id: article.id,
                    persona_id: persona.id,
                    changed_field: ChangedField::Created,
                });
                Ok(row)
            }
            InsertOutcome::AlreadyExists(row) => Ok(row),
        }
    }

    /// Adds the detailed tier, creating the quick take first when the pair has no row.
    /// A row that already has detailed content is returned without a provider call.
    pub async fn generate_detailed_analysis(&self, article: &Article, persona: &Persona) -> Result<Interpretation> {
        let existing = match self.existing(article.id, persona.id).await? {
            Some(row) => row,
            None => self.generate_quick_take(article, persona).await?,
        };
        if existing.has_detailed() {
            return Ok(existing);
        }

        let _flight = self.in_flight.acquire((article.id, persona.id, Tier::Detailed)).await;
        let current = interpretations::get_interpretation(&self.pool, existing.id)
            .await?
            .with_context(|| format!("interpretation {} disappeared", existing.id))?;
        if current.has_detailed() {
            return Ok(current);
        }

        info!(article_id = article.id, persona = %persona.slug, "generating detailed analysis");

        let key = self.cache_key(article, persona, Tier::Detailed);
        let generation = match self.cached_generation(&key).await {
            Some(generation) => generation,
            None => {
                let full_text = self.full_text(article).await;
                let user = content::user_message(&content::for_detailed_analysis(article, &full_text));
                let generation = self
                    .client
                    .chat(
                        &prompts::detailed_analysis(persona),
                        &user,
                        self.settings.detailed_max_tokens,
                        self.settings.detailed_timeout,
                    )
                    .await?;
                self.remember(&key, &generation).await;
                generation
            }
        };

        if interpretations::set_detailed_content(&self.pool, current.id, &generation.text).await? {
            info!(
                article_id = article.id,
                persona = %persona.slug,
                provider = %generation.provider_id,
                tokens = generation.tokens_used,
                "detailed analysis stored"
            );
            self.events.emit(InterpretationEvent {
                article_id: article.id,
                persona_id: persona.id,
                changed_field: ChangedField::DetailedContent,
            });
        }

        interpretations::get_interpretation(&self.pool, current.id)
            .await?
            .with_context(|| format!("interpretation {} disappeared", current.id))
    }

    async fn existing(&self, article_id: i64, persona_id: i64) -> Result<Option<Interpretation>> {
        interpretations::find_interpretation(&self.pool, article_id, persona_id).await
    }

    fn cache_key(&self, article: &Article, persona: &Persona, tier: Tier) -> String {
        CacheKey::new(article.id, persona.id, tier, self.settings.cache_version.as_str()).to_string()
    }

    /// Cache trouble degrades to a miss
    async fn cached_generation(&self, key: &str) -> Option<Generation> {
        match cache::get_json::<Generation>(self.cache.as_ref(), key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key, error = %format!("{:#}", e), "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn remember(&self, key: &str, generation: &Generation) {
        if let Err(e) = cache::set_json(self.cache.as_ref(), key, generation, self.settings.cache_ttl).await {
            warn!(key, error = %format!("{:#}", e), "cache write failed");
        }
    }

    /// Stored body, else a fetched one (persisted for next time), else headline + summary
    async fn full_text(&self, article: &Article) -> String {
        if let Some(body) = content::usable_full_content(article) {
            if body.chars().count() >= self.settings.min_full_text_chars {
                return body.to_string();
            }
        }

        if let (Some(fetcher), Some(url)) = (&self.fetcher, article.source_url.as_deref()) {
            match fetcher.fetch(url).await {
                Some(text)
                    if text.trim().chars().count() >= self.settings.min_full_text_chars
                        && !content::looks_truncated(&text) =>
                {
                    if let Err(e) = articles::store_full_content(&self.pool, article.id, text.trim()).await {
                        warn!(article_id = article.id, error = %format!("{:#}", e), "failed to persist fetched body");
                    }
                    return text.trim().to_string();
                }
                _ => debug!(article_id = article.id, url, "no usable full text, using summary"),
            }
        }

        content::headline_with_summary(article)
    }
}
