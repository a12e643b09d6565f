//! `SQLite` pool construction and schema bootstrap.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::{AppError, Result};

/// Schema DDL, applied idempotently at startup.
///
/// Timestamps are RFC 3339 TEXT. `conversation_id` is unique: a
/// conversation holds exactly one session binding, and recording a new
/// session for a bound conversation replaces the old row.
const SCHEMA_DDL: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    session_id       TEXT PRIMARY KEY,
    conversation_id  TEXT NOT NULL UNIQUE,
    directory        TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);
";

/// Open (creating if missing) the database file and apply the schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the file cannot be opened or the DDL fails.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("cannot create database directory: {err}")))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    bootstrap_schema(&pool).await?;
    info!(path = %path.display(), "database ready");
    Ok(pool)
}

/// Open an in-memory database with the schema applied. Test support.
///
/// # Errors
///
/// Returns `AppError::Db` if the pool cannot be created.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Apply the schema DDL. Idempotent.
///
/// # Errors
///
/// Returns `AppError::Db` if the DDL fails to execute.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_DDL).execute(pool).await?;
    Ok(())
}
