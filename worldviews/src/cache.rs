//! Key/value store with expiry used to memoize provider output before it becomes a
//! persisted interpretation.

use anyhow::{Context, Result};
use chrono::Utc;
use common::CacheBackend;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::Tier;

#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

/// Namespaced cache key. Bumping `version` orphans every previously written payload:
/// lookups against the new key simply miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub article_id: i64,
    pub persona_id: i64,
    pub tier: Tier,
    pub version: String,
}

impl CacheKey {
    pub fn new(article_id: i64, persona_id: i64, tier: Tier, version: impl Into<String>) -> Self {
        Self {
            article_id,
            persona_id,
            tier,
            version: version.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interpretation/{}/{}/{}/{}",
            self.article_id, self.persona_id, self.tier, self.version
        )
    }
}

pub async fn get_json<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Result<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse cached value for {}", key))?;
            debug!(key, "cache hit");
            Ok(Some(value))
        }
        None => {
            debug!(key, "cache miss");
            Ok(None)
        }
    }
}

pub async fn set_json<T: Serialize>(
    cache: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let raw = serde_json::to_string(value).context("Failed to serialize cache value")?;
    cache.set(key, &raw, ttl).await
}

pub fn from_backend(backend: CacheBackend, pool: &SqlitePool) -> Arc<dyn CacheStore> {
    match backend {
        CacheBackend::Sqlite => Arc::new(SqliteCache::new(pool.clone())),
        CacheBackend::Memory => Arc::new(MemoryCache::default()),
    }
}

struct MemoryEntry {
    value: String,
    /// None when the ttl overflows `Instant`
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Process-local cache
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

#[async_trait::async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: Instant::now().checked_add(ttl),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}

/// Cache persisted in the `cache_entries` table; survives restarts and is shared by
/// every process pointing at the same database.
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read cache key {}", key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).context("cache ttl out of range")?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now() + ttl)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write cache key {}", key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete cache key {}", key))?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to purge expired cache entries")?;
        Ok(result.rows_affected() as usize)
    }
}
