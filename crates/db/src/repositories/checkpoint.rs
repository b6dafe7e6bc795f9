use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::domain::conversation::{ConversationState, ThreadId};
use leadflow_core::ports::{CheckpointStore, PortError};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use super::RepositoryError;
use crate::DbPool;

/// Conversation state stored as one JSON document per thread.
pub struct SqlCheckpointStore {
    pool: DbPool,
}

impl SqlCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT thread_id, state_json, updated_at
             FROM conversation_checkpoint
             WHERE thread_id = ?",
        )
        .bind(&thread_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(state_from_row).transpose()
    }

    pub async fn save(&self, state: &ConversationState) -> Result<(), RepositoryError> {
        let state_json = serde_json::to_string(state).map_err(|error| {
            RepositoryError::Decode(format!("cannot serialize state for `{}`: {error}", state.thread_id))
        })?;
        let message_count = i64::try_from(state.messages.len()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO conversation_checkpoint (
                thread_id,
                contact_id,
                state_json,
                termination,
                message_count,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                contact_id = excluded.contact_id,
                state_json = excluded.state_json,
                termination = excluded.termination,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at",
        )
        .bind(&state.thread_id.0)
        .bind(&state.contact_id.0)
        .bind(state_json)
        .bind(state.termination.map(|reason| reason.as_str()))
        .bind(message_count)
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            event_name = "db.checkpoint.saved",
            correlation_id = "checkpoint",
            thread_id = %state.thread_id,
            message_count,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Thread ids touched since `since`, newest first.
    pub async fn recent_threads(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ThreadId>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT thread_id
             FROM conversation_checkpoint
             WHERE updated_at >= ?
             ORDER BY updated_at DESC
             LIMIT ?",
        )
        .bind(since.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(ThreadId(row.try_get::<String, _>("thread_id")?)))
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn get(&self, thread_id: &ThreadId) -> Result<Option<ConversationState>, PortError> {
        self.load(thread_id).await.map_err(PortError::from)
    }

    async fn put(&self, state: &ConversationState) -> Result<(), PortError> {
        self.save(state).await.map_err(PortError::from)
    }
}

fn state_from_row(row: SqliteRow) -> Result<ConversationState, RepositoryError> {
    let thread_id = row.try_get::<String, _>("thread_id")?;
    let state_json = row.try_get::<String, _>("state_json")?;
    let state: ConversationState = serde_json::from_str(&state_json).map_err(|error| {
        RepositoryError::Decode(format!("invalid state_json for `{thread_id}`: {error}"))
    })?;
    if state.thread_id.0 != thread_id {
        return Err(RepositoryError::Decode(format!(
            "state_json for `{thread_id}` belongs to `{}`",
            state.thread_id
        )));
    }
    Ok(state)
}
