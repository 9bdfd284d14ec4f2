//! SQLite persistence for articles, personas and interpretations.

pub mod articles;
pub mod interpretations;
pub mod personas;

/// SQLite reports UNIQUE failures as extended code 2067 (1555 for a primary key)
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("2067") | Some("1555"))
                || db_err.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}
