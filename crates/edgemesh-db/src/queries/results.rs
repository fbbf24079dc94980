//! Query functions for the `task_results` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::TaskResultRow;

/// Upsert the single terminal result recorded for a task. A task can only
/// finish once, but a replayed result submission (e.g. retried network call
/// from a worker that never saw the ack) should overwrite rather than
/// duplicate.
pub async fn upsert_result(
    pool: &sqlx::PgPool,
    task_id: Uuid,
    node_id: &str,
    ok: bool,
    output: Option<&serde_json::Value>,
    error: Option<&str>,
    finished_at: DateTime<Utc>,
) -> Result<TaskResultRow> {
    let row = sqlx::query_as::<_, TaskResultRow>(
        "INSERT INTO task_results (task_id, node_id, ok, output, error, finished_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (task_id) DO UPDATE \
         SET node_id = EXCLUDED.node_id, ok = EXCLUDED.ok, output = EXCLUDED.output, \
             error = EXCLUDED.error, finished_at = EXCLUDED.finished_at \
         RETURNING *",
    )
    .bind(task_id)
    .bind(node_id)
    .bind(ok)
    .bind(output)
    .bind(error)
    .bind(finished_at)
    .fetch_one(pool)
    .await
    .context("failed to upsert task result")?;

    Ok(row)
}

pub async fn get_result(pool: &sqlx::PgPool, task_id: Uuid) -> Result<Option<TaskResultRow>> {
    let row = sqlx::query_as::<_, TaskResultRow>("SELECT * FROM task_results WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task result")?;

    Ok(row)
}
