use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Acquire, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::content;
use crate::models::Article;

/// Size of the rolling featured set
pub const FEATURED_COUNT: i64 = 3;
/// Watermark used when nothing has been ingested yet
pub const DEFAULT_LOOKBACK_DAYS: i64 = 7;
/// Watermarks older than this mean the store is stale
pub const STALE_AFTER_HOURS: i64 = 6;

/// A validated record ready to be stored
#[derive(Debug, Clone)]
pub struct ArticleDraft {
    pub external_id: String,
    pub headline: String,
    pub summary: Option<String>,
    pub full_content: Option<String>,
    pub source: String,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub category: String,
    pub metadata: serde_json::Value,
}

/// How one draft was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Updated,
    Skipped,
}

/// Partitioned result of one ingestion batch
#[derive(Debug, Default)]
pub struct IngestReport {
    pub new: Vec<Article>,
    pub updated: Vec<Article>,
    pub skipped: Vec<Article>,
    /// Records rejected before reaching the store (missing required field)
    pub invalid: usize,
    /// Records whose write failed; the rest of the batch still committed
    pub failed: usize,
}

impl IngestReport {
    /// Articles accounted for in the new/updated/skipped partitions
    pub fn total(&self) -> usize {
        self.new.len() + self.updated.len() + self.skipped.len()
    }
}

const SELECT_ARTICLE: &str = r#"
    SELECT id, external_id, headline, summary, full_content, source, source_url, image_url,
           published_at, category, active, featured, metadata, created_at, updated_at
    FROM articles
"#;

/// Insert new drafts, overwrite changed ones and leave identical ones untouched, then
/// recompute the featured set. Runs in one transaction; every record gets its own
/// savepoint so a failing record is rolled back alone.
pub async fn upsert_articles(pool: &SqlitePool, drafts: Vec<ArticleDraft>) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    if drafts.is_empty() {
        return Ok(report);
    }

    let mut tx = pool.begin().await.context("failed to begin ingestion transaction")?;

    for draft in drafts {
        let mut savepoint = tx.begin().await.context("failed to open savepoint")?;
        match upsert_one(&mut savepoint, &draft).await {
            Ok((outcome, article)) => {
                savepoint.commit().await.context("failed to release savepoint")?;
                match outcome {
                    UpsertOutcome::New => {
                        info!(id = article.id, headline = %article.headline, "stored new article");
                        report.new.push(article);
                    }
                    UpsertOutcome::Updated => {
                        info!(id = article.id, headline = %article.headline, "updated article");
                        report.updated.push(article);
                    }
                    UpsertOutcome::Skipped => {
                        debug!(id = article.id, "skipped unchanged article");
                        report.skipped.push(article);
                    }
                }
            }
            Err(e) => {
                warn!(external_id = %draft.external_id, error = %format!("{:#}", e), "failed to store article, skipping it");
                savepoint.rollback().await.context("failed to roll back savepoint")?;
                report.failed += 1;
            }
        }
    }

    if !report.new.is_empty() || !report.updated.is_empty() {
        refresh_featured(&mut tx).await?;
        // featured flags may have moved under the rows we are about to return
        for article in report.new.iter_mut().chain(report.updated.iter_mut()) {
            if let Some(fresh) = fetch_by_id(&mut tx, article.id).await? {
                *article = fresh;
            }
        }
    }

    tx.commit().await.context("failed to commit ingestion transaction")?;

    info!(
        new = report.new.len(),
        updated = report.updated.len(),
        skipped = report.skipped.len(),
        failed = report.failed,
        "ingestion batch stored"
    );
    Ok(report)
}

async fn upsert_one(
    conn: &mut SqliteConnection,
    draft: &ArticleDraft,
) -> Result<(UpsertOutcome, Article)> {
    let now = Utc::now();
    let metadata = serde_json::to_string(&draft.metadata).context("failed to serialize metadata")?;

    let existing = sqlx::query_as::<_, Article>(&format!("{} WHERE external_id = ?", SELECT_ARTICLE))
        .bind(&draft.external_id)
        .fetch_optional(&mut *conn)
        .await
        .context("failed to look up article by external id")?;

    let (outcome, id) = match existing {
        None => {
            let result = sqlx::query(
                r#"
                INSERT INTO articles
                    (external_id, headline, summary, full_content, source, source_url, image_url,
                     published_at, category, active, featured, metadata, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?, ?)
                "#,
            )
            .bind(&draft.external_id)
            .bind(&draft.headline)
            .bind(&draft.summary)
            .bind(&draft.full_content)
            .bind(&draft.source)
            .bind(&draft.source_url)
            .bind(&draft.image_url)
            .bind(draft.published_at)
            .bind(&draft.category)
            .bind(&metadata)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("failed to insert article")?;
            (UpsertOutcome::New, result.last_insert_rowid())
        }
        Some(current) if current.headline != draft.headline || current.summary != draft.summary => {
            // A feed teaser never replaces a full body scraped earlier
            let incoming_body = draft.full_content.as_deref().filter(|body| {
                !(content::looks_truncated(body) && content::usable_full_content(&current).is_some())
            });
            sqlx::query(
                r#"
                UPDATE articles SET
                    headline = ?, summary = ?, full_content = COALESCE(?, full_content),
                    source = ?, source_url = ?, image_url = ?, published_at = ?,
                    category = ?, metadata = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&draft.headline)
            .bind(&draft.summary)
            .bind(incoming_body)
            .bind(&draft.source)
            .bind(&draft.source_url)
            .bind(&draft.image_url)
            .bind(draft.published_at)
            .bind(&draft.category)
            .bind(&metadata)
            .bind(now)
            .bind(current.id)
            .execute(&mut *conn)
            .await
            .context("failed to update article")?;
            (UpsertOutcome::Updated, current.id)
        }
        Some(current) => return Ok((UpsertOutcome::Skipped, current)),
    };

    let article = fetch_by_id(conn, id)
        .await?
        .context("article vanished right after write")?;
    Ok((outcome, article))
}

/// Feature exactly the `FEATURED_COUNT` most recently published active articles
/// (all of them when fewer exist). Inactive rows are never candidates.
pub async fn refresh_featured(conn: &mut SqliteConnection) -> Result<()> {
    let top = r#"
        SELECT id FROM articles
        WHERE active = 1
        ORDER BY published_at DESC, id DESC
        LIMIT ?
    "#;

    sqlx::query(&format!(
        "UPDATE articles SET featured = 0 WHERE featured = 1 AND id NOT IN ({})",
        top
    ))
    .bind(FEATURED_COUNT)
    .execute(&mut *conn)
    .await
    .context("failed to clear stale featured flags")?;

    sqlx::query(&format!(
        "UPDATE articles SET featured = 1 WHERE featured = 0 AND id IN ({})",
        top
    ))
    .bind(FEATURED_COUNT)
    .execute(&mut *conn)
    .await
    .context("failed to set featured flags")?;

    Ok(())
}

async fn fetch_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<Article>> {
    sqlx::query_as::<_, Article>(&format!("{} WHERE id = ?", SELECT_ARTICLE))
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch article")
}

pub async fn get_article(pool: &SqlitePool, id: i64) -> Result<Option<Article>> {
    let mut conn = pool.acquire().await.context("failed to acquire connection")?;
    fetch_by_id(&mut conn, id).await
}

pub async fn featured_articles(pool: &SqlitePool) -> Result<Vec<Article>> {
    sqlx::query_as::<_, Article>(&format!(
        "{} WHERE featured = 1 AND active = 1 ORDER BY published_at DESC",
        SELECT_ARTICLE
    ))
    .fetch_all(pool)
    .await
    .context("failed to fetch featured articles")
}

pub async fn latest_articles(pool: &SqlitePool, limit: i64) -> Result<Vec<Article>> {
    sqlx::query_as::<_, Article>(&format!(
        "{} WHERE active = 1 ORDER BY published_at DESC LIMIT ?",
        SELECT_ARTICLE
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch latest articles")
}

/// Soft-delete: the row stays, it just leaves the active (and featured) set
pub async fn deactivate_article(pool: &SqlitePool, id: i64) -> Result<bool> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query("UPDATE articles SET active = 0, featured = 0, updated_at = ? WHERE id = ? AND active = 1")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to deactivate article")?;

    let changed = result.rows_affected() > 0;
    if changed {
        refresh_featured(&mut tx).await?;
    }
    tx.commit().await.context("failed to commit deactivation")?;

    Ok(changed)
}

/// Persist a scraped body so later tiers do not fetch it again
pub async fn store_full_content(pool: &SqlitePool, id: i64, text: &str) -> Result<()> {
    sqlx::query("UPDATE articles SET full_content = ?, updated_at = ? WHERE id = ?")
        .bind(text)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to store full content")?;
    Ok(())
}

/// Latest `published_at` stored, or `now - 7 days` for an empty store
pub async fn last_fetch_time(pool: &SqlitePool) -> Result<DateTime<Utc>> {
    let latest = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT published_at FROM articles ORDER BY published_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to read last fetch time")?;

    Ok(latest.unwrap_or_else(|| Utc::now() - Duration::days(DEFAULT_LOOKBACK_DAYS)))
}

pub fn is_stale(watermark: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    watermark < now - Duration::hours(STALE_AFTER_HOURS)
}

/// True whenever the watermark is older than six hours
pub async fn needs_sync(pool: &SqlitePool) -> Result<bool> {
    Ok(is_stale(last_fetch_time(pool).await?, Utc::now()))
}
