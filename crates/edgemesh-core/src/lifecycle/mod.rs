//! Lifecycle Coordinator (spec section 4.4): ack, result, cancel, and DLQ
//! replay, composing `Store` transitions with the Retry Policy and the
//! Event Bus.
//!
//! Mirrors the teacher's sequential-awaited-steps style: each operation is
//! a handful of `await`ed Store calls with a `tracing::info!` at the
//! decision point, narrowing every Store failure to a typed [`CoreError`]
//! rather than propagating an opaque one.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::ids::{NodeId, TaskId};
use crate::retry::{self, RetryConfig};
use crate::store::{DlqEntry, DlqReason, Event, EventType, Store, Task, TaskResult, TaskStatus};

/// Coordinates the ack/result/cancel/replay transitions. Holds no state of
/// its own beyond its collaborators; every call goes straight through to
/// the `Store`.
pub struct LifecycleCoordinator {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    retry_config: RetryConfig,
}

impl LifecycleCoordinator {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, retry_config: RetryConfig) -> Self {
        Self { store, events, retry_config }
    }

    /// `task.ack`: claimed → running. Only legal from the assigned node.
    pub async fn ack(&self, task_id: &TaskId, caller_node_id: &NodeId, clock: &dyn Clock) -> CoreResult<Task> {
        let task = self.get_existing(task_id).await?;
        if task.status != TaskStatus::Claimed {
            return Err(CoreError::TaskAlreadyTerminal(task_id.to_string()));
        }
        if task.assigned_node_id.as_ref() != Some(caller_node_id) {
            return Err(CoreError::TokenNodeMismatch);
        }

        let updated = self.store.set_task_status(task_id, TaskStatus::Running).await?;
        tracing::info!(task_id = %task_id, node_id = %caller_node_id, "task acked, now running");
        self.events.emit_with_caller(
            Event::new(EventType::TaskRunning, clock.now())
                .with_task(*task_id)
                .with_node(caller_node_id.clone()),
            caller_node_id.as_str(),
        );
        Ok(updated)
    }

    /// `task.result`: terminal outcome reported by the assigned node.
    pub async fn result(
        &self,
        task_id: &TaskId,
        caller_node_id: &NodeId,
        ok: bool,
        output: Option<serde_json::Value>,
        error: Option<String>,
        clock: &dyn Clock,
    ) -> CoreResult<Task> {
        let task = self.get_existing(task_id).await?;
        if !matches!(task.status, TaskStatus::Claimed | TaskStatus::Running) {
            return Err(CoreError::TaskAlreadyTerminal(task_id.to_string()));
        }
        if task.assigned_node_id.as_ref() != Some(caller_node_id) {
            return Err(CoreError::TokenNodeMismatch);
        }

        let now = clock.now();
        let result = TaskResult {
            task_id: *task_id,
            node_id: caller_node_id.clone(),
            ok,
            output,
            error,
            finished_at: now,
        };

        if ok {
            self.store.set_task_result(result).await?;
            let updated = self.store.set_task_status(task_id, TaskStatus::Done).await?;
            tracing::info!(task_id = %task_id, "task completed successfully");
            self.events.emit_with_caller(
                Event::new(EventType::TaskDone, now).with_task(*task_id).with_node(caller_node_id.clone()),
                caller_node_id.as_str(),
            );
            return Ok(updated);
        }

        self.store.set_task_result(result.clone()).await?;
        let decision = retry::decide(task.attempt, task.max_attempts, self.retry_config);

        if decision.retry {
            let retry_after = now + chrono::Duration::milliseconds(decision.delay_ms as i64);
            let updated = self.store.requeue_for_retry(task_id, Some(retry_after)).await?;
            tracing::info!(task_id = %task_id, attempt = task.attempt, delay_ms = decision.delay_ms, "task failed, retrying");
            self.events.emit_with_caller(
                Event::new(EventType::TaskFailed, now)
                    .with_task(*task_id)
                    .with_node(caller_node_id.clone())
                    .with_detail("retrying", true)
                    .with_detail("to_dlq", false),
                caller_node_id.as_str(),
            );
            Ok(updated)
        } else {
            let updated = self.store.set_task_status(task_id, TaskStatus::Failed).await?;
            self.store
                .enqueue_dlq(DlqEntry {
                    task_id: *task_id,
                    task: updated.clone(),
                    last_result: Some(result),
                    reason: DlqReason::MaxAttemptsExhausted,
                    enqueued_at: now,
                })
                .await?;
            tracing::info!(task_id = %task_id, "task failed, moved to dead-letter queue");
            self.events.emit_with_caller(
                Event::new(EventType::TaskFailed, now)
                    .with_task(*task_id)
                    .with_node(caller_node_id.clone())
                    .with_detail("retrying", false)
                    .with_detail("to_dlq", true),
                caller_node_id.as_str(),
            );
            Ok(updated)
        }
    }

    /// `task.cancel`: fire-and-forget cancellation. Returns
    /// `task_already_terminal` rather than mutating state if the task is
    /// already done/failed/cancelled.
    pub async fn cancel(&self, task_id: &TaskId, clock: &dyn Clock) -> CoreResult<()> {
        let cancelled = self.store.cancel_task(task_id).await?;
        if !cancelled {
            return Err(CoreError::TaskAlreadyTerminal(task_id.to_string()));
        }
        tracing::info!(task_id = %task_id, "task cancelled");
        self.events.emit(Event::new(EventType::TaskCancelled, clock.now()).with_task(*task_id));
        Ok(())
    }

    /// `dlq.replay`: restore a dead-lettered task to `queued` with
    /// `attempt` reset to 0.
    pub async fn replay_from_dlq(&self, task_id: &TaskId, clock: &dyn Clock) -> CoreResult<Task> {
        let now = clock.now();
        let restored = self.store.requeue_from_dlq(task_id, now).await?;
        tracing::info!(task_id = %task_id, "task replayed from dead-letter queue");
        self.events.emit(Event::new(EventType::TaskEnqueued, now).with_task(*task_id));
        Ok(restored)
    }

    /// Record a reaper-discovered timeout. Identical handling to
    /// `result(ok=false)` with a synthesized result (spec.md section 4.6/7),
    /// but driven by the reaper rather than a caller-supplied outcome.
    pub(crate) async fn handle_timeout(&self, task: &Task, now: DateTime<Utc>) -> CoreResult<()> {
        let decision = retry::decide(task.attempt, task.max_attempts, self.retry_config);

        if decision.retry {
            let retry_after = now + chrono::Duration::milliseconds(decision.delay_ms as i64);
            self.store.requeue_for_retry(&task.task_id, Some(retry_after)).await?;
            tracing::warn!(task_id = %task.task_id, "claim lease exceeded declared timeout, retrying");
            self.events.emit(
                Event::new(EventType::TaskFailed, now)
                    .with_task(task.task_id)
                    .with_detail("reason", "timeout")
                    .with_detail("retrying", true)
                    .with_detail("to_dlq", false),
            );
        } else {
            let synthetic = TaskResult {
                task_id: task.task_id,
                node_id: task
                    .assigned_node_id
                    .clone()
                    .unwrap_or_else(|| NodeId::new("unknown")),
                ok: false,
                output: None,
                error: Some("task_timeout".to_string()),
                finished_at: now,
            };
            self.store.set_task_result(synthetic.clone()).await?;
            let updated = self.store.set_task_status(&task.task_id, TaskStatus::Failed).await?;
            self.store
                .enqueue_dlq(DlqEntry {
                    task_id: task.task_id,
                    task: updated,
                    last_result: Some(synthetic),
                    reason: DlqReason::Timeout,
                    enqueued_at: now,
                })
                .await?;
            tracing::warn!(task_id = %task.task_id, "claim lease exceeded declared timeout, exhausted retries, moved to dead-letter queue");
            self.events.emit(
                Event::new(EventType::TaskFailed, now)
                    .with_task(task.task_id)
                    .with_detail("reason", "timeout")
                    .with_detail("retrying", false)
                    .with_detail("to_dlq", true),
            );
        }
        Ok(())
    }

    async fn get_existing(&self, task_id: &TaskId) -> CoreResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }
}
