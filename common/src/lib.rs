/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Worldviews.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader merging a default config file with an optional override
- Helpers to initialize and migrate an SQLite database
- Synchronisation of the curated persona roster into the `personas` table
*/

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/worldviews.db")
    pub path: String,
}

/// News aggregation API (NewsAPI-compatible) settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsConfig {
    /// Base URL, e.g. "https://newsapi.org/v2"
    pub api_url: Option<String>,
    /// Name of the env var holding the API key
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    pub limit_per_category: Option<u32>,
    pub fetch_timeout_seconds: Option<u64>,
    pub poll_interval_minutes: Option<u64>,
}

/// Which wire protocol a generation provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
}

/// One text-generation backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

/// LLM top-level config: ordered primary -> fallback chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub primary: Option<ProviderConfig>,
    pub fallback: Option<ProviderConfig>,
    pub quick_timeout_seconds: Option<u64>,
    pub detailed_timeout_seconds: Option<u64>,
}

/// Which personas receive automatic generation after ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaScope {
    /// Curated personas only (bounds cost on bulk ingestion)
    #[default]
    Official,
    /// Every active persona, user-owned included
    Active,
}

/// Interpretation generation tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Version token embedded in cache keys; bump to invalidate all cached payloads
    pub cache_version: Option<String>,
    pub cache_ttl_days: Option<i64>,
    pub quick_max_tokens: Option<u32>,
    pub detailed_max_tokens: Option<u32>,
    pub auto_generate: Option<PersonaScope>,
    /// Scraped bodies shorter than this are treated as missing
    pub min_full_text_chars: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: Option<CacheBackend>,
}

/// Background queue settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub quick_retries: Option<u32>,
    pub detailed_retries: Option<u32>,
    pub backoff_seconds: Option<u64>,
}

/// Curated (official) persona definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub display_order: Option<i64>,
    pub active: Option<bool>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub auto_migrate: Option<bool>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub news: Option<NewsConfig>,
    pub llm: Option<LlmConfig>,
    pub generation: Option<GenerationConfig>,
    pub cache: Option<CacheConfig>,
    pub dispatcher: Option<DispatcherConfig>,
    #[serde(default)]
    pub personas: Vec<PersonaConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn auto_generate_scope(&self) -> PersonaScope {
        self.generation
            .as_ref()
            .and_then(|g| g.auto_generate)
            .unwrap_or_default()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run the SQL migrations embedded from the workspace `migrations` directory.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and returns a WAL-mode pool with
/// foreign keys enforced (interpretations cascade with their article/persona).
///
/// Example:
///   let pool = init_db_pool("data/worldviews.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Single-connection in-memory pool, migrated. Every connection to `sqlite::memory:`
/// opens a fresh database, so the pool must never recycle its only connection.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Ensure that personas defined in the configuration exist in the `personas` table as
/// official personas. Safe to call repeatedly:
///  - inserts missing slugs
///  - refreshes name/description/prompt/order/active for existing official rows
///  - never rewrites a slug and never touches a user-owned persona sharing the slug
pub async fn sync_personas(config: &Config, pool: &SqlitePool) -> Result<usize> {
    let now = Utc::now();
    let mut synced = 0;

    for p in &config.personas {
        let result = sqlx::query(
            r#"
            INSERT INTO personas
                (slug, name, description, system_prompt, official, owner_id, active, display_order, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, NULL, ?, ?, ?, ?)
            ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                system_prompt = excluded.system_prompt,
                active = excluded.active,
                display_order = excluded.display_order,
                updated_at = excluded.updated_at
            WHERE personas.official = 1
            "#,
        )
        .bind(&p.slug)
        .bind(&p.name)
        .bind(p.description.clone())
        .bind(&p.system_prompt)
        .bind(p.active.unwrap_or(true))
        .bind(p.display_order.unwrap_or(0))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("failed to sync persona {}", p.slug))?;

        synced += result.rows_affected() as usize;
    }

    Ok(synced)
}
