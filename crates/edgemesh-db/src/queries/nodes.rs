//! Query functions for the `nodes` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{DbHeartbeatStatus, NodeRow, TrustUpdateParams};

/// Register a node, or re-register an existing one. Capability columns are
/// refreshed on conflict; trust/revocation/drain/heartbeat state is left
/// untouched so re-registration never silently clears an admin decision.
pub async fn upsert_node(
    pool: &PgPool,
    node_id: &str,
    tags: &[String],
    max_concurrent_tasks: i32,
) -> Result<NodeRow> {
    let row = sqlx::query_as::<_, NodeRow>(
        "INSERT INTO nodes (node_id, tags, max_concurrent_tasks) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (node_id) DO UPDATE \
         SET tags = EXCLUDED.tags, max_concurrent_tasks = EXCLUDED.max_concurrent_tasks \
         RETURNING *",
    )
    .bind(node_id)
    .bind(tags)
    .bind(max_concurrent_tasks)
    .fetch_one(pool)
    .await
    .context("failed to upsert node")?;

    Ok(row)
}

/// Record a heartbeat for a node. No-op (silently) on unknown node id; the
/// caller is expected to have checked existence via `get_node` already.
pub async fn set_heartbeat(
    pool: &PgPool,
    node_id: &str,
    ts: DateTime<Utc>,
    status: DbHeartbeatStatus,
    load: f64,
    running_tasks: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes \
         SET hb_ts = $1, hb_status = $2, hb_load = $3, hb_running_tasks = $4 \
         WHERE node_id = $5",
    )
    .bind(ts)
    .bind(status)
    .bind(load)
    .bind(running_tasks)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Apply a partial trust/revocation update, leaving unset fields alone.
pub async fn set_node_trust(
    pool: &PgPool,
    node_id: &str,
    update: TrustUpdateParams,
) -> Result<Option<NodeRow>> {
    let row = sqlx::query_as::<_, NodeRow>(
        "UPDATE nodes \
         SET trusted = COALESCE($1, trusted), revoked = COALESCE($2, revoked) \
         WHERE node_id = $3 \
         RETURNING *",
    )
    .bind(update.trusted)
    .bind(update.revoked)
    .bind(node_id)
    .fetch_optional(pool)
    .await
    .context("failed to set node trust")?;

    Ok(row)
}

pub async fn set_node_drain(pool: &PgPool, node_id: &str, draining: bool) -> Result<Option<NodeRow>> {
    let row = sqlx::query_as::<_, NodeRow>(
        "UPDATE nodes SET draining = $1 WHERE node_id = $2 RETURNING *",
    )
    .bind(draining)
    .bind(node_id)
    .fetch_optional(pool)
    .await
    .context("failed to set node drain state")?;

    Ok(row)
}

pub async fn list_nodes(pool: &PgPool) -> Result<Vec<NodeRow>> {
    let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY node_id")
        .fetch_all(pool)
        .await
        .context("failed to list nodes")?;

    Ok(rows)
}

pub async fn get_node(pool: &PgPool, node_id: &str) -> Result<Option<NodeRow>> {
    let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_id = $1")
        .bind(node_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch node")?;

    Ok(row)
}
