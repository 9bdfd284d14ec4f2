use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ingested news item (row of `articles`)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    /// Hash of the source URL, or of title + published timestamp when no URL exists
    pub external_id: String,
    pub headline: String,
    pub summary: Option<String>,
    pub full_content: Option<String>,
    pub source: String,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub category: String,
    pub active: bool,
    pub featured: bool,
    pub metadata: String, // JSON
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    /// Parse metadata from JSON string
    pub fn metadata_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

/// A named viewpoint used to condition generated commentary
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Persona {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    /// Curated personas have no owner and are always visible
    pub official: bool,
    pub owner_id: Option<i64>,
    pub active: bool,
    pub display_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Generated commentary for one (article, persona) pair
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interpretation {
    pub id: i64,
    pub article_id: i64,
    pub persona_id: i64,
    /// Quick take
    pub content: String,
    pub detailed_content: Option<String>,
    pub llm_model: Option<String>,
    pub llm_tokens_used: Option<i64>,
    pub generation_time_ms: Option<i64>,
    /// True when this row was built from a cached payload instead of a provider call
    pub cached: bool,
    pub metadata: String, // JSON
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Interpretation {
    pub fn has_detailed(&self) -> bool {
        self.detailed_content
            .as_deref()
            .map(|d| !d.trim().is_empty())
            .unwrap_or(false)
    }

    /// Parse metadata from JSON string
    pub fn metadata_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    /// Provider that produced the quick take, as recorded in metadata
    pub fn provider(&self) -> Option<String> {
        self.metadata_json()
            .get("provider")
            .and_then(|p| p.as_str())
            .map(str::to_string)
    }
}

/// The two escalating content tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Quick,
    Detailed,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Quick => "quick",
            Tier::Detailed => "detailed",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
