//! Query functions for the `dlq_entries` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{DbDlqReason, DlqRow};

pub async fn insert_entry(
    pool: &sqlx::PgPool,
    task_id: Uuid,
    task_snapshot: &serde_json::Value,
    last_result: Option<&serde_json::Value>,
    reason: DbDlqReason,
    enqueued_at: DateTime<Utc>,
) -> Result<DlqRow> {
    let row = sqlx::query_as::<_, DlqRow>(
        "INSERT INTO dlq_entries (task_id, task_snapshot, last_result, reason, enqueued_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (task_id) DO UPDATE \
         SET task_snapshot = EXCLUDED.task_snapshot, last_result = EXCLUDED.last_result, \
             reason = EXCLUDED.reason, enqueued_at = EXCLUDED.enqueued_at \
         RETURNING *",
    )
    .bind(task_id)
    .bind(task_snapshot)
    .bind(last_result)
    .bind(reason)
    .bind(enqueued_at)
    .fetch_one(pool)
    .await
    .context("failed to insert dlq entry")?;

    Ok(row)
}

pub async fn list_entries(pool: &sqlx::PgPool) -> Result<Vec<DlqRow>> {
    let rows = sqlx::query_as::<_, DlqRow>("SELECT * FROM dlq_entries ORDER BY enqueued_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list dlq entries")?;

    Ok(rows)
}

pub async fn get_entry(pool: &sqlx::PgPool, task_id: Uuid) -> Result<Option<DlqRow>> {
    let row = sqlx::query_as::<_, DlqRow>("SELECT * FROM dlq_entries WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dlq entry")?;

    Ok(row)
}

/// Remove and return a dlq entry, used by `requeue_from_dlq` inside a
/// transaction shared with the task reinsertion.
pub async fn take_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task_id: Uuid,
) -> Result<Option<DlqRow>> {
    let row = sqlx::query_as::<_, DlqRow>("DELETE FROM dlq_entries WHERE task_id = $1 RETURNING *")
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to take dlq entry")?;

    Ok(row)
}
