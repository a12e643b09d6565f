//! `SQLite`-backed implementation of the session index.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::session::{NewSession, SessionRecord};
use crate::runner::SessionIndex;
use crate::{AppError, Result};

/// Durable conversation ↔ session mapping in `SQLite`.
#[derive(Clone)]
pub struct SqliteSessionIndex {
    pool: SqlitePool,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    conversation_id: String,
    directory: String,
    started_at: String,
    last_activity_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_record(self) -> Result<SessionRecord> {
        let started_at = parse_timestamp(&self.started_at, "started_at")?;
        let last_activity_at = parse_timestamp(&self.last_activity_at, "last_activity_at")?;
        Ok(SessionRecord {
            session_id: self.session_id,
            conversation_id: self.conversation_id,
            directory: self.directory,
            started_at,
            last_activity_at,
        })
    }
}

fn parse_timestamp(raw: &str, column: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

impl SqliteSessionIndex {
    /// Create an index over an already-bootstrapped pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl SessionIndex for SqliteSessionIndex {
    fn lookup_by_session_id(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionRecord>>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            let row: Option<SessionRow> =
                sqlx::query_as("SELECT * FROM sessions WHERE session_id = ?1")
                    .bind(&session_id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(SessionRow::into_record).transpose()
        })
    }

    fn lookup_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionRecord>>> + Send + '_>> {
        let conversation_id = conversation_id.to_owned();
        Box::pin(async move {
            let row: Option<SessionRow> =
                sqlx::query_as("SELECT * FROM sessions WHERE conversation_id = ?1")
                    .bind(&conversation_id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(SessionRow::into_record).transpose()
        })
    }

    fn record_new_session(
        &self,
        session: NewSession,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let record = session.into_record();
            // OR REPLACE rebinds a conversation whose thread starts a
            // deliberately fresh session.
            sqlx::query(
                "INSERT OR REPLACE INTO sessions
                 (session_id, conversation_id, directory, started_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&record.session_id)
            .bind(&record.conversation_id)
            .bind(&record.directory)
            .bind(record.started_at.to_rfc3339())
            .bind(record.last_activity_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn touch_activity(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            sqlx::query("UPDATE sessions SET last_activity_at = ?1 WHERE session_id = ?2")
                .bind(Utc::now().to_rfc3339())
                .bind(&session_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }
}
