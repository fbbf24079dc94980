//! Query functions for the append-only `events` table.
//!
//! This is a durable audit trail, independent of the in-process Event Bus's
//! ring buffer (`edgemesh_core::events::EventBus`): the Bus serves live
//! subscribers and counters within one process, while this table lets an
//! operator query history after a restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::EventRow;

#[allow(clippy::too_many_arguments)]
pub async fn insert_event(
    pool: &sqlx::PgPool,
    event_type: &str,
    at: DateTime<Utc>,
    node_id: Option<&str>,
    task_id: Option<Uuid>,
    detail: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (event_type, at, node_id, task_id, detail) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(event_type)
    .bind(at)
    .bind(node_id)
    .bind(task_id)
    .bind(detail)
    .execute(pool)
    .await
    .context("failed to insert event")?;

    Ok(())
}

/// Most recent events, newest first, capped at `limit`.
pub async fn list_recent(pool: &sqlx::PgPool, limit: i64) -> Result<Vec<EventRow>> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT event_type, at, node_id, task_id, detail \
         FROM events ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list recent events")?;

    Ok(rows)
}
