//! Raw feed records -> validated article drafts -> article store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::storage::articles::{self, ArticleDraft, IngestReport};

/// `source` block of a raw record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSource {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// One record as it arrives from a news aggregation API (NewsAPI article shape)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawArticle {
    #[serde(default)]
    pub source: RawSource,
    pub author: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub url_to_image: Option<String>,
    /// ISO-8601
    pub published_at: Option<String>,
    pub content: Option<String>,
    /// Feed category the record was fetched under. Kept in metadata only; the stored
    /// category always comes from the source name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_category: Option<String>,
}

/// Why a record never reached the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingTitle,
    MissingPublishedAt,
    BadPublishedAt(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingTitle => write!(f, "missing title"),
            Rejection::MissingPublishedAt => write!(f, "missing publishedAt"),
            Rejection::BadPublishedAt(raw) => write!(f, "unparseable publishedAt {:?}", raw),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable identifier: hash of the URL, or of "title-publishedAt" when there is no URL
pub fn external_id(raw: &RawArticle) -> String {
    match non_blank(&raw.url) {
        Some(url) => sha256_hex(url),
        None => sha256_hex(&format!(
            "{}-{}",
            raw.title.as_deref().unwrap_or_default(),
            raw.published_at.as_deref().unwrap_or_default()
        )),
    }
}

const CATEGORY_PATTERNS: &[(&str, &[&str])] = &[
    ("technology", &["tech", "wired", "verge", "ars"]),
    ("business", &["business", "financial", "bloomberg", "wsj"]),
    ("politics", &["cnn", "fox", "msnbc", "politico"]),
    ("science", &["science", "nature", "scientific"]),
];

/// Category from the source name; first matching row of the table wins
pub fn infer_category(source_name: &str) -> &'static str {
    let name = source_name.to_lowercase();
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| name.contains(n)))
        .map(|(category, _)| *category)
        .unwrap_or("general")
}

/// Validate one raw record and shape it for the store
pub fn normalize(raw: &RawArticle) -> Result<ArticleDraft, Rejection> {
    let headline = non_blank(&raw.title).ok_or(Rejection::MissingTitle)?;
    let published_raw = non_blank(&raw.published_at).ok_or(Rejection::MissingPublishedAt)?;
    let published_at = DateTime::parse_from_rfc3339(published_raw)
        .map_err(|_| Rejection::BadPublishedAt(published_raw.to_string()))?
        .with_timezone(&Utc);

    let source = non_blank(&raw.source.name).unwrap_or("Unknown").to_string();
    let category = infer_category(&source).to_string();

    Ok(ArticleDraft {
        external_id: external_id(raw),
        headline: headline.to_string(),
        summary: non_blank(&raw.description).map(str::to_string),
        full_content: non_blank(&raw.content).map(str::to_string),
        source,
        source_url: non_blank(&raw.url).map(str::to_string),
        image_url: non_blank(&raw.url_to_image).map(str::to_string),
        published_at,
        category,
        metadata: json!({
            "author": raw.author,
            "source_id": raw.source.id,
            "fetched_category": raw.fetched_category,
        }),
    })
}

/// Ingest a batch: invalid records are skipped and counted, the rest are upserted and
/// the featured set recomputed in one transaction.
pub async fn ingest(pool: &SqlitePool, batch: &[RawArticle]) -> Result<IngestReport> {
    let mut drafts = Vec::with_capacity(batch.len());
    let mut invalid = 0;

    for raw in batch {
        match normalize(raw) {
            Ok(draft) => drafts.push(draft),
            Err(reason) => {
                warn!(title = ?raw.title, url = ?raw.url, %reason, "skipping invalid record");
                invalid += 1;
            }
        }
    }

    let mut report = articles::upsert_articles(pool, drafts).await?;
    report.invalid = invalid;

    info!(
        new = report.new.len(),
        updated = report.updated.len(),
        skipped = report.skipped.len(),
        invalid = report.invalid,
        total = report.total(),
        "ingestion complete"
    );
    Ok(report)
}
