use anyhow::{bail, Context, Result};
use chrono::Utc;
use common::PersonaScope;
use sqlx::SqlitePool;

use super::is_unique_violation;
use crate::models::Persona;

const SELECT_PERSONA: &str = r#"
    SELECT id, slug, name, description, system_prompt, official, owner_id, active,
           display_order, created_at, updated_at
    FROM personas
"#;

/// A user-owned persona about to be created
#[derive(Debug, Clone)]
pub struct NewPersona {
    pub owner_id: i64,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
}

/// Active personas in display order, restricted to curated ones for `PersonaScope::Official`
pub async fn list_personas(pool: &SqlitePool, scope: PersonaScope) -> Result<Vec<Persona>> {
    let filter = match scope {
        PersonaScope::Official => "WHERE active = 1 AND official = 1",
        PersonaScope::Active => "WHERE active = 1",
    };
    sqlx::query_as::<_, Persona>(&format!(
        "{} {} ORDER BY display_order, id",
        SELECT_PERSONA, filter
    ))
    .fetch_all(pool)
    .await
    .context("failed to list personas")
}

pub async fn get_persona(pool: &SqlitePool, id: i64) -> Result<Option<Persona>> {
    sqlx::query_as::<_, Persona>(&format!("{} WHERE id = ?", SELECT_PERSONA))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch persona")
}

pub async fn get_persona_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Persona>> {
    sqlx::query_as::<_, Persona>(&format!("{} WHERE slug = ?", SELECT_PERSONA))
        .bind(slug)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch persona {}", slug))
}

/// Create a persona owned by a user. Never official; slug must be unused.
pub async fn create_user_persona(pool: &SqlitePool, persona: NewPersona) -> Result<Persona> {
    let slug = persona.slug.trim().to_lowercase();
    if slug.is_empty() {
        bail!("persona slug must not be empty");
    }
    if persona.system_prompt.trim().is_empty() {
        bail!("persona {} needs a system prompt", slug);
    }

    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO personas
            (slug, name, description, system_prompt, official, owner_id, active, display_order, created_at, updated_at)
        VALUES (?, ?, ?, ?, 0, ?, 1, 100, ?, ?)
        "#,
    )
    .bind(&slug)
    .bind(&persona.name)
    .bind(&persona.description)
    .bind(&persona.system_prompt)
    .bind(persona.owner_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    let id = match result {
        Ok(done) => done.last_insert_rowid(),
        Err(e) if is_unique_violation(&e) => bail!("persona slug {} is already taken", slug),
        Err(e) => return Err(e).context("failed to create persona"),
    };

    get_persona(pool, id)
        .await?
        .context("persona vanished right after insert")
}
