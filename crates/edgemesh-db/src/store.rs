//! [`PgStore`]: the durable, multi-replica-safe implementation of
//! `edgemesh_core::store::Store`.
//!
//! Single-row transitions guard against overwriting a task already in a
//! terminal status with `UPDATE ... WHERE status NOT IN (...)` statements
//! (see `queries::tasks::set_task_status` and friends); `claim_task` wraps
//! lease reclaim, the capacity gate, and the
//! `FOR UPDATE SKIP LOCKED` candidate selection in one transaction so two
//! replicas claiming concurrently never hand out the same task. Every
//! mutation also appends a row to the durable `events` table, independent of
//! whichever process's in-process Event Bus picks up the corresponding
//! `Store`-level event — that keeps the audit trail intact if a replica
//! restarts mid-flight or only the database survives.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use edgemesh_core::error::{CoreError, CoreResult};
use edgemesh_core::ids::{NodeId, TaskId};
use edgemesh_core::store::{
    DlqEntry, FreshnessThresholds, Heartbeat, Node, NodeCapabilities, Store, Task, TaskResult,
    TaskStatus, TrustUpdate,
};
use sqlx::PgPool;

use crate::models::{DbDlqReason, DbHeartbeatStatus, DlqRow, NodeRow, TaskResultRow, TaskRow, TrustUpdateParams};
use crate::queries;

/// A `Store` backed by a Postgres connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn core_err(err: anyhow::Error) -> CoreError {
        CoreError::StoreUnavailable(err.to_string())
    }

    async fn log_event(
        &self,
        event_type: &str,
        at: DateTime<Utc>,
        node_id: Option<&str>,
        task_id: Option<uuid::Uuid>,
        detail: serde_json::Value,
    ) {
        if let Err(err) =
            queries::events::insert_event(&self.pool, event_type, at, node_id, task_id, &detail).await
        {
            tracing::warn!(error = %err, event_type, "failed to append durable event row");
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_node(&self, node: Node) -> CoreResult<Node> {
        let tags: Vec<String> = node.capabilities.tags.iter().cloned().collect();
        let row = queries::nodes::upsert_node(
            &self.pool,
            node.node_id.as_str(),
            &tags,
            node.capabilities.max_concurrent_tasks as i32,
        )
        .await
        .map_err(Self::core_err)?;
        self.log_event(
            "node.registered",
            Utc::now(),
            Some(node.node_id.as_str()),
            None,
            serde_json::Value::Null,
        )
        .await;
        Ok(row.into())
    }

    async fn set_heartbeat(&self, node_id: &NodeId, hb: Heartbeat) -> CoreResult<()> {
        let affected = queries::nodes::set_heartbeat(
            &self.pool,
            node_id.as_str(),
            hb.ts,
            DbHeartbeatStatus::from(hb.status),
            hb.load,
            hb.running_tasks as i32,
        )
        .await
        .map_err(Self::core_err)?;
        if affected == 0 {
            return Err(CoreError::UnknownNode(node_id.to_string()));
        }
        self.log_event("node.heartbeat", hb.ts, Some(node_id.as_str()), None, serde_json::Value::Null)
            .await;
        Ok(())
    }

    async fn set_node_trust(&self, node_id: &NodeId, update: TrustUpdate) -> CoreResult<Node> {
        let revoked = update.revoked;
        let row = queries::nodes::set_node_trust(&self.pool, node_id.as_str(), TrustUpdateParams::from(update))
            .await
            .map_err(Self::core_err)?
            .ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
        if revoked == Some(true) {
            self.log_event("node.revoked", Utc::now(), Some(node_id.as_str()), None, serde_json::Value::Null)
                .await;
        }
        Ok(row.into())
    }

    async fn set_node_drain(&self, node_id: &NodeId, draining: bool) -> CoreResult<Node> {
        let row = queries::nodes::set_node_drain(&self.pool, node_id.as_str(), draining)
            .await
            .map_err(Self::core_err)?
            .ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
        let event_type = if draining { "node.drain" } else { "node.undrain" };
        self.log_event(event_type, Utc::now(), Some(node_id.as_str()), None, serde_json::Value::Null)
            .await;
        Ok(row.into())
    }

    async fn list_nodes(&self) -> CoreResult<Vec<Node>> {
        let rows = queries::nodes::list_nodes(&self.pool).await.map_err(Self::core_err)?;
        Ok(rows.into_iter().map(Node::from).collect())
    }

    async fn get_node(&self, node_id: &NodeId) -> CoreResult<Option<Node>> {
        let row = queries::nodes::get_node(&self.pool, node_id.as_str())
            .await
            .map_err(Self::core_err)?;
        Ok(row.map(Node::from))
    }

    async fn enqueue_task(&self, task: Task) -> CoreResult<Task> {
        let required_tags: Vec<String> = task.required_tags.iter().cloned().collect();
        let row = queries::tasks::insert_task(
            &self.pool,
            task.task_id.0,
            &task.kind,
            &task.payload,
            task.target_node_id.as_ref().map(|n| n.as_str()),
            &required_tags,
            task.priority,
            task.created_at,
            task.max_attempts as i32,
            task.timeout_ms.map(|v| v as i64),
        )
        .await
        .map_err(Self::core_err)?;
        self.log_event(
            "task.enqueued",
            task.created_at,
            None,
            Some(task.task_id.0),
            serde_json::Value::Null,
        )
        .await;
        Ok(row.into())
    }

    async fn claim_task(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        claim_ttl_ms: i64,
        thresholds: FreshnessThresholds,
    ) -> CoreResult<Option<Task>> {
        // Reclaim expired leases in its own transaction, committed unconditionally
        // before the gating checks below. A lease freed here must be durable
        // regardless of whether this particular poll goes on to claim anything,
        // so a subsequent caller in this process always observes it (spec
        // ordering guarantee #3).
        let mut reclaim_tx = self.pool.begin().await.map_err(|e| Self::core_err(e.into()))?;
        queries::tasks::reclaim_expired_leases(&mut reclaim_tx, now, claim_ttl_ms)
            .await
            .map_err(Self::core_err)?;
        reclaim_tx.commit().await.map_err(|e| Self::core_err(e.into()))?;

        let mut tx = self.pool.begin().await.map_err(|e| Self::core_err(e.into()))?;

        let node_row: Option<NodeRow> = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE node_id = $1")
            .bind(node_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::core_err(e.into()))?;
        let Some(node_row) = node_row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let node: Node = node_row.into();
        if !node.trusted || node.revoked || node.draining {
            tx.rollback().await.ok();
            return Ok(None);
        }
        if node.freshness_state(now, thresholds) != edgemesh_core::store::FreshnessState::Healthy {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let in_flight = queries::tasks::count_in_flight_for_node(&mut tx, node_id.as_str())
            .await
            .map_err(Self::core_err)?;
        if in_flight as u32 >= node.capabilities.max_concurrent_tasks {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let node_tags: Vec<String> = node.capabilities.tags.iter().cloned().collect();
        let claimed = queries::tasks::select_and_claim(&mut tx, node_id.as_str(), &node_tags, now)
            .await
            .map_err(Self::core_err)?;

        let Some(row) = claimed else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        tx.commit().await.map_err(|e| Self::core_err(e.into()))?;

        let task: Task = row.into();
        self.log_event(
            "task.claimed",
            now,
            Some(node_id.as_str()),
            Some(task.task_id.0),
            serde_json::json!({ "attempt": task.attempt }),
        )
        .await;
        Ok(Some(task))
    }

    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> CoreResult<Task> {
        let row: TaskRow = match queries::tasks::set_task_status(&self.pool, task_id.0, status.into())
            .await
            .map_err(Self::core_err)?
        {
            Some(row) => row,
            None => {
                // Either the task doesn't exist, or it does but the guard
                // rejected the write because it's already terminal — in the
                // latter case this is a no-op, matching cancel_task's own
                // terminal guard.
                let existing = queries::tasks::get_task(&self.pool, task_id.0)
                    .await
                    .map_err(Self::core_err)?
                    .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
                return Ok(existing.into());
            }
        };
        let event_type = match status {
            TaskStatus::Running => Some("task.running"),
            TaskStatus::Done => Some("task.done"),
            TaskStatus::Failed => Some("task.failed"),
            _ => None,
        };
        if let Some(event_type) = event_type {
            self.log_event(event_type, Utc::now(), None, Some(task_id.0), serde_json::Value::Null)
                .await;
        }
        Ok(row.into())
    }

    async fn cancel_task(&self, task_id: &TaskId) -> CoreResult<bool> {
        let existing = queries::tasks::get_task(&self.pool, task_id.0)
            .await
            .map_err(Self::core_err)?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if TaskStatus::from(existing.status).is_terminal() {
            return Ok(false);
        }
        let cancelled = queries::tasks::cancel_task(&self.pool, task_id.0).await.map_err(Self::core_err)?;
        if cancelled {
            self.log_event("task.cancelled", Utc::now(), None, Some(task_id.0), serde_json::Value::Null)
                .await;
        }
        Ok(cancelled)
    }

    async fn requeue_for_retry(&self, task_id: &TaskId, retry_after: Option<DateTime<Utc>>) -> CoreResult<Task> {
        match queries::tasks::requeue_for_retry(&self.pool, task_id.0, retry_after)
            .await
            .map_err(Self::core_err)?
        {
            Some(row) => Ok(row.into()),
            None => {
                let existing = queries::tasks::get_task(&self.pool, task_id.0)
                    .await
                    .map_err(Self::core_err)?
                    .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
                Ok(existing.into())
            }
        }
    }

    async fn get_task(&self, task_id: &TaskId) -> CoreResult<Option<Task>> {
        let row = queries::tasks::get_task(&self.pool, task_id.0).await.map_err(Self::core_err)?;
        Ok(row.map(Task::from))
    }

    async fn list_tasks(&self) -> CoreResult<Vec<Task>> {
        let rows = queries::tasks::list_tasks(&self.pool).await.map_err(Self::core_err)?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn list_queued(&self) -> CoreResult<Vec<Task>> {
        let rows = queries::tasks::list_queued(&self.pool).await.map_err(Self::core_err)?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn list_running(&self) -> CoreResult<Vec<Task>> {
        let rows = queries::tasks::list_running(&self.pool).await.map_err(Self::core_err)?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn set_task_result(&self, result: TaskResult) -> CoreResult<()> {
        let _row: TaskResultRow = queries::results::upsert_result(
            &self.pool,
            result.task_id.0,
            result.node_id.as_str(),
            result.ok,
            result.output.as_ref(),
            result.error.as_deref(),
            result.finished_at,
        )
        .await
        .map_err(Self::core_err)?;
        Ok(())
    }

    async fn get_task_result(&self, task_id: &TaskId) -> CoreResult<Option<TaskResult>> {
        let row = queries::results::get_result(&self.pool, task_id.0).await.map_err(Self::core_err)?;
        Ok(row.map(TaskResult::from))
    }

    async fn enqueue_dlq(&self, entry: DlqEntry) -> CoreResult<()> {
        let task_snapshot = serde_json::to_value(&entry.task)
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        let last_result = entry
            .last_result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        let _row: DlqRow = queries::dlq::insert_entry(
            &self.pool,
            entry.task_id.0,
            &task_snapshot,
            last_result.as_ref(),
            DbDlqReason::from(entry.reason),
            entry.enqueued_at,
        )
        .await
        .map_err(Self::core_err)?;
        Ok(())
    }

    async fn list_dlq(&self) -> CoreResult<Vec<DlqEntry>> {
        let rows = queries::dlq::list_entries(&self.pool).await.map_err(Self::core_err)?;
        rows.into_iter()
            .map(|r| DlqEntry::try_from(r).map_err(|e| CoreError::StoreUnavailable(e.to_string())))
            .collect()
    }

    async fn get_dlq_entry(&self, task_id: &TaskId) -> CoreResult<Option<DlqEntry>> {
        let row = queries::dlq::get_entry(&self.pool, task_id.0).await.map_err(Self::core_err)?;
        row.map(|r| DlqEntry::try_from(r).map_err(|e| CoreError::StoreUnavailable(e.to_string())))
            .transpose()
    }

    async fn requeue_from_dlq(&self, task_id: &TaskId, now: DateTime<Utc>) -> CoreResult<Task> {
        let mut tx = self.pool.begin().await.map_err(|e| Self::core_err(e.into()))?;

        let entry_row = queries::dlq::take_entry(&mut tx, task_id.0)
            .await
            .map_err(Self::core_err)?
            .ok_or_else(|| CoreError::DlqEntryNotFound(task_id.to_string()))?;
        let entry = DlqEntry::try_from(entry_row).map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;

        let row = queries::tasks::reinsert_from_snapshot(&mut tx, &entry.task, now)
            .await
            .map_err(Self::core_err)?;

        tx.commit().await.map_err(|e| Self::core_err(e.into()))?;

        self.log_event("task.enqueued", now, None, Some(task_id.0), serde_json::Value::Null)
            .await;
        Ok(row.into())
    }
}

/// Builds capability data for a freshly-registered node without going
/// through `NewTask`-style plumbing; used by the CLI's `node register`
/// handler.
pub fn capabilities_from_tags(tags: impl IntoIterator<Item = String>, max_concurrent_tasks: u32) -> NodeCapabilities {
    NodeCapabilities::new(tags.into_iter().collect::<HashSet<_>>(), max_concurrent_tasks)
}
