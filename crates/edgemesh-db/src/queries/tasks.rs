//! Query functions for the `tasks` table, including the atomic multi-consumer
//! claim.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::DbTaskStatus;

/// Insert a newly enqueued task row.
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &sqlx::PgPool,
    task_id: Uuid,
    kind: &str,
    payload: &serde_json::Value,
    target_node_id: Option<&str>,
    required_tags: &[String],
    priority: i32,
    created_at: DateTime<Utc>,
    max_attempts: i32,
    timeout_ms: Option<i64>,
) -> Result<crate::models::TaskRow> {
    let row = sqlx::query_as::<_, crate::models::TaskRow>(
        "INSERT INTO tasks \
            (task_id, kind, payload, target_node_id, required_tags, priority, \
             created_at, max_attempts, timeout_ms, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued') \
         RETURNING *",
    )
    .bind(task_id)
    .bind(kind)
    .bind(payload)
    .bind(target_node_id)
    .bind(required_tags)
    .bind(priority)
    .bind(created_at)
    .bind(max_attempts)
    .bind(timeout_ms)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(row)
}

pub async fn get_task(pool: &sqlx::PgPool, task_id: Uuid) -> Result<Option<crate::models::TaskRow>> {
    let row = sqlx::query_as::<_, crate::models::TaskRow>("SELECT * FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(row)
}

pub async fn list_tasks(pool: &sqlx::PgPool) -> Result<Vec<crate::models::TaskRow>> {
    let rows = sqlx::query_as::<_, crate::models::TaskRow>("SELECT * FROM tasks ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(rows)
}

pub async fn list_queued(pool: &sqlx::PgPool) -> Result<Vec<crate::models::TaskRow>> {
    let rows = sqlx::query_as::<_, crate::models::TaskRow>(
        "SELECT * FROM tasks WHERE status = 'queued' ORDER BY priority DESC, created_at ASC, task_id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list queued tasks")?;

    Ok(rows)
}

pub async fn list_running(pool: &sqlx::PgPool) -> Result<Vec<crate::models::TaskRow>> {
    let rows = sqlx::query_as::<_, crate::models::TaskRow>(
        "SELECT * FROM tasks WHERE status IN ('claimed', 'running') ORDER BY claimed_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running tasks")?;

    Ok(rows)
}

/// Set a task's status, guarded against overwriting a task that has already
/// reached a terminal status (mirrors `cancel_task`'s own guard, and
/// `LocalStore::set_task_status`). Returns `None` both when the task does
/// not exist and when the guard rejected the write; callers distinguish the
/// two by re-fetching. Terminal statuses clear the lease fields.
pub async fn set_task_status(
    pool: &sqlx::PgPool,
    task_id: Uuid,
    status: DbTaskStatus,
) -> Result<Option<crate::models::TaskRow>> {
    let clear_lease = matches!(
        status,
        DbTaskStatus::Done | DbTaskStatus::Failed | DbTaskStatus::Cancelled
    );
    let row = sqlx::query_as::<_, crate::models::TaskRow>(
        "UPDATE tasks \
         SET status = $1, \
             claimed_at = CASE WHEN $2 THEN NULL ELSE claimed_at END, \
             assigned_node_id = CASE WHEN $2 THEN NULL ELSE assigned_node_id END \
         WHERE task_id = $3 \
           AND status NOT IN ('done', 'failed', 'cancelled') \
         RETURNING *",
    )
    .bind(status)
    .bind(clear_lease)
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to set task status")?;

    Ok(row)
}

/// Cancel a task unless it is already in a terminal status. Returns `true`
/// if the cancellation applied.
pub async fn cancel_task(pool: &sqlx::PgPool, task_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', claimed_at = NULL, assigned_node_id = NULL \
         WHERE task_id = $1 \
           AND status NOT IN ('done', 'failed', 'cancelled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected() > 0)
}

/// Requeue a task for retry: back to `queued`, lease cleared, `retry_after`
/// set. Guarded the same way as `set_task_status`: a task already in a
/// terminal status (cancelled out from under a retrying worker, say) is
/// left alone rather than resurrected into `queued`.
pub async fn requeue_for_retry(
    pool: &sqlx::PgPool,
    task_id: Uuid,
    retry_after: Option<DateTime<Utc>>,
) -> Result<Option<crate::models::TaskRow>> {
    let row = sqlx::query_as::<_, crate::models::TaskRow>(
        "UPDATE tasks \
         SET status = 'queued', assigned_node_id = NULL, claimed_at = NULL, retry_after = $1 \
         WHERE task_id = $2 \
           AND status NOT IN ('done', 'failed', 'cancelled') \
         RETURNING *",
    )
    .bind(retry_after)
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to requeue task for retry")?;

    Ok(row)
}

/// Reclaim tasks whose lease has expired: `claimed` past `claim_ttl_ms`
/// since `claimed_at` goes back to `queued`. Mirrors
/// `local::reclaim_expired_leases`. Committed in its own transaction by the
/// caller before the claim attempt proper, so a freed lease is durable even
/// if this poll's claim is then rejected or finds nothing to claim.
pub async fn reclaim_expired_leases(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    now: DateTime<Utc>,
    claim_ttl_ms: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', assigned_node_id = NULL, claimed_at = NULL \
         WHERE status = 'claimed' \
           AND claimed_at IS NOT NULL \
           AND $1 - claimed_at >= ($2 * INTERVAL '1 millisecond')",
    )
    .bind(now)
    .bind(claim_ttl_ms as f64)
    .execute(&mut **tx)
    .await
    .context("failed to reclaim expired leases")?;

    Ok(result.rows_affected())
}

/// Count tasks currently claimed or running and assigned to `node_id`.
pub async fn count_in_flight_for_node(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: &str,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE assigned_node_id = $1 AND status IN ('claimed', 'running')",
    )
    .bind(node_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to count in-flight tasks for node")?;

    Ok(row.0)
}

/// Select and claim the single best-eligible queued task for `node_id`,
/// locking the candidate row with `FOR UPDATE SKIP LOCKED` so concurrent
/// claimers never double-assign the same task.
pub async fn select_and_claim(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    node_id: &str,
    node_tags: &[String],
    now: DateTime<Utc>,
) -> Result<Option<crate::models::TaskRow>> {
    let candidate: Option<(Uuid,)> = sqlx::query_as(
        "SELECT task_id FROM tasks \
         WHERE status = 'queued' \
           AND (retry_after IS NULL OR retry_after <= $1) \
           AND (target_node_id IS NULL OR target_node_id = $2) \
           AND required_tags <@ $3 \
         ORDER BY priority DESC, created_at ASC, task_id ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .bind(node_id)
    .bind(node_tags)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to select claimable task")?;

    let Some((task_id,)) = candidate else {
        return Ok(None);
    };

    let row = sqlx::query_as::<_, crate::models::TaskRow>(
        "UPDATE tasks \
         SET status = 'claimed', claimed_at = $1, assigned_node_id = $2, attempt = attempt + 1 \
         WHERE task_id = $3 \
         RETURNING *",
    )
    .bind(now)
    .bind(node_id)
    .bind(task_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to claim task")?;

    Ok(Some(row))
}

/// Re-insert a DLQ task snapshot back into `tasks` as freshly queued, attempt
/// reset to zero. Used by `requeue_from_dlq`.
pub async fn reinsert_from_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task: &edgemesh_core::store::Task,
    now: DateTime<Utc>,
) -> Result<crate::models::TaskRow> {
    let required_tags: Vec<String> = task.required_tags.iter().cloned().collect();
    let row = sqlx::query_as::<_, crate::models::TaskRow>(
        "INSERT INTO tasks \
            (task_id, kind, payload, target_node_id, required_tags, priority, \
             created_at, max_attempts, attempt, retry_after, timeout_ms, \
             claimed_at, assigned_node_id, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, NULL, $9, NULL, NULL, 'queued') \
         ON CONFLICT (task_id) DO UPDATE \
         SET status = 'queued', attempt = 0, retry_after = NULL, \
             claimed_at = NULL, assigned_node_id = NULL, created_at = EXCLUDED.created_at \
         RETURNING *",
    )
    .bind(task.task_id.0)
    .bind(&task.kind)
    .bind(&task.payload)
    .bind(task.target_node_id.as_ref().map(|n| n.as_str()))
    .bind(required_tags)
    .bind(task.priority)
    .bind(now)
    .bind(task.max_attempts as i32)
    .bind(task.timeout_ms.map(|v| v as i64))
    .fetch_one(&mut **tx)
    .await
    .context("failed to reinsert task from dlq snapshot")?;

    Ok(row)
}
