use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::debug;

use super::is_unique_violation;
use crate::llm::Generation;
use crate::models::Interpretation;

const SELECT_INTERPRETATION: &str = r#"
    SELECT id, article_id, persona_id, content, detailed_content, llm_model, llm_tokens_used,
           generation_time_ms, cached, metadata, created_at, updated_at
    FROM interpretations
"#;

/// Result of trying to create the row for a pair
#[derive(Debug)]
pub enum InsertOutcome {
    Created(Interpretation),
    /// Another writer got there first; this is the row it stored
    AlreadyExists(Interpretation),
}

pub async fn find_interpretation(
    pool: &SqlitePool,
    article_id: i64,
    persona_id: i64,
) -> Result<Option<Interpretation>> {
    sqlx::query_as::<_, Interpretation>(&format!(
        "{} WHERE article_id = ? AND persona_id = ?",
        SELECT_INTERPRETATION
    ))
    .bind(article_id)
    .bind(persona_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch interpretation")
}

pub async fn get_interpretation(pool: &SqlitePool, id: i64) -> Result<Option<Interpretation>> {
    sqlx::query_as::<_, Interpretation>(&format!("{} WHERE id = ?", SELECT_INTERPRETATION))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch interpretation")
}

/// Every persona's take on one article, in persona order
pub async fn interpretations_for_article(
    pool: &SqlitePool,
    article_id: i64,
) -> Result<Vec<Interpretation>> {
    sqlx::query_as::<_, Interpretation>(&format!(
        "{} WHERE article_id = ? ORDER BY persona_id",
        SELECT_INTERPRETATION
    ))
    .bind(article_id)
    .fetch_all(pool)
    .await
    .context("failed to list interpretations")
}

/// Insert the quick take for a pair. A UNIQUE(article_id, persona_id) violation is
/// not an error: the row that won is re-read and returned as `AlreadyExists`.
pub async fn insert_interpretation(
    pool: &SqlitePool,
    article_id: i64,
    persona_id: i64,
    generation: &Generation,
    cached: bool,
) -> Result<InsertOutcome> {
    let now = Utc::now();
    let metadata = if cached {
        json!({ "provider": generation.provider_id, "cached_at": now.to_rfc3339() })
    } else {
        json!({ "provider": generation.provider_id, "generated_at": now.to_rfc3339() })
    };

    let result = sqlx::query(
        r#"
        INSERT INTO interpretations
            (article_id, persona_id, content, llm_model, llm_tokens_used, generation_time_ms,
             cached, metadata, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(article_id)
    .bind(persona_id)
    .bind(&generation.text)
    .bind(&generation.model_name)
    .bind(generation.tokens_used as i64)
    .bind(generation.elapsed_ms as i64)
    .bind(cached)
    .bind(metadata.to_string())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    match result {
        Ok(done) => {
            let row = get_interpretation(pool, done.last_insert_rowid())
                .await?
                .context("interpretation vanished right after insert")?;
            Ok(InsertOutcome::Created(row))
        }
        Err(e) if is_unique_violation(&e) => {
            debug!(article_id, persona_id, "lost insert race, re-reading interpretation");
            let row = find_interpretation(pool, article_id, persona_id)
                .await?
                .context("conflicting interpretation not found on re-read")?;
            Ok(InsertOutcome::AlreadyExists(row))
        }
        Err(e) => Err(e).context("failed to insert interpretation"),
    }
}

/// Fill the detailed tier. Only an empty field is written, so the first writer wins;
/// returns whether this call made the transition.
pub async fn set_detailed_content(pool: &SqlitePool, id: i64, text: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE interpretations SET detailed_content = ?, updated_at = ?
        WHERE id = ? AND (detailed_content IS NULL OR TRIM(detailed_content) = '')
        "#,
    )
    .bind(text)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to store detailed analysis")?;

    Ok(result.rows_affected() > 0)
}
