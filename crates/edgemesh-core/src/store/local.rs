//! Process-local `Store` backend: the default, single-process state holder.
//!
//! All mutation passes through one `tokio::sync::Mutex`-guarded inner
//! struct, which is exactly the "single critical section" the atomicity
//! contract in spec.md section 4.1 calls for.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::ids::{NodeId, TaskId};

use super::{
    DlqEntry, FreshnessState, FreshnessThresholds, Heartbeat, Node, Store, Task, TaskResult,
    TaskStatus, TrustUpdate,
};

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, Node>,
    tasks: HashMap<TaskId, Task>,
    results: HashMap<TaskId, TaskResult>,
    dlq: HashMap<TaskId, DlqEntry>,
}

/// The process-local `Store` backend.
#[derive(Default)]
pub struct LocalStore {
    inner: Mutex<Inner>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn reclaim_expired_leases(inner: &mut Inner, now: DateTime<Utc>, claim_ttl_ms: i64) {
    for task in inner.tasks.values_mut() {
        if task.status == TaskStatus::Claimed {
            if let Some(claimed_at) = task.claimed_at {
                if (now - claimed_at).num_milliseconds() >= claim_ttl_ms {
                    task.status = TaskStatus::Queued;
                    task.assigned_node_id = None;
                    task.claimed_at = None;
                    tracing::warn!(task_id = %task.task_id, "lease expired, task reclaimed to queued");
                }
            }
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn upsert_node(&self, node: Node) -> CoreResult<Node> {
        let mut inner = self.inner.lock().await;
        let merged = match inner.nodes.get(&node.node_id) {
            Some(existing) => Node {
                node_id: node.node_id.clone(),
                capabilities: node.capabilities,
                // Re-registration preserves heartbeat and trust flags.
                trusted: existing.trusted,
                revoked: existing.revoked,
                draining: existing.draining,
                last_heartbeat: existing.last_heartbeat.clone(),
            },
            None => node,
        };
        inner.nodes.insert(merged.node_id.clone(), merged.clone());
        Ok(merged)
    }

    async fn set_heartbeat(&self, node_id: &NodeId, hb: Heartbeat) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
        node.last_heartbeat = Some(hb);
        Ok(())
    }

    async fn set_node_trust(&self, node_id: &NodeId, update: TrustUpdate) -> CoreResult<Node> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
        if let Some(trusted) = update.trusted {
            node.trusted = trusted;
        }
        if let Some(revoked) = update.revoked {
            node.revoked = revoked;
        }
        Ok(node.clone())
    }

    async fn set_node_drain(&self, node_id: &NodeId, draining: bool) -> CoreResult<Node> {
        let mut inner = self.inner.lock().await;
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
        node.draining = draining;
        Ok(node.clone())
    }

    async fn list_nodes(&self) -> CoreResult<Vec<Node>> {
        let inner = self.inner.lock().await;
        Ok(inner.nodes.values().cloned().collect())
    }

    async fn get_node(&self, node_id: &NodeId) -> CoreResult<Option<Node>> {
        let inner = self.inner.lock().await;
        Ok(inner.nodes.get(node_id).cloned())
    }

    async fn enqueue_task(&self, task: Task) -> CoreResult<Task> {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.task_id, task.clone());
        Ok(task)
    }

    async fn claim_task(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        claim_ttl_ms: i64,
        thresholds: FreshnessThresholds,
    ) -> CoreResult<Option<Task>> {
        let mut inner = self.inner.lock().await;

        // Step 1: lease recovery, unconditionally, before the node gate.
        reclaim_expired_leases(&mut inner, now, claim_ttl_ms);

        // Step 2: node gate.
        let Some(node) = inner.nodes.get(node_id).cloned() else {
            return Ok(None);
        };
        if !node.trusted || node.revoked || node.draining {
            return Ok(None);
        }
        if node.freshness_state(now, thresholds) != FreshnessState::Healthy {
            return Ok(None);
        }

        // Step 3: capacity gate.
        let in_flight = inner
            .tasks
            .values()
            .filter(|t| t.assigned_node_id.as_ref() == Some(node_id) && t.status.is_claimed_or_running())
            .count() as u32;
        if in_flight >= node.capabilities.max_concurrent_tasks {
            return Ok(None);
        }

        // Step 4: eligibility filter.
        let mut eligible: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .filter(|t| t.retry_after.map(|ra| ra <= now).unwrap_or(true))
            .filter(|t| t.target_node_id.as_ref().map(|tn| tn == node_id).unwrap_or(true))
            .filter(|t| t.required_tags.is_subset(&node.capabilities.tags))
            .map(|t| t.task_id)
            .collect();

        // Step 5: selection order (priority desc, created_at asc, taskId asc
        // tiebreak).
        eligible.sort_by(|a, b| {
            let ta = &inner.tasks[a];
            let tb = &inner.tasks[b];
            tb.priority
                .cmp(&ta.priority)
                .then(ta.created_at.cmp(&tb.created_at))
                .then(ta.task_id.cmp(&tb.task_id))
        });

        let Some(chosen_id) = eligible.into_iter().next() else {
            return Ok(None);
        };

        // Step 6: transition.
        let task = inner.tasks.get_mut(&chosen_id).expect("chosen id exists");
        task.status = TaskStatus::Claimed;
        task.claimed_at = Some(now);
        task.assigned_node_id = Some(node_id.clone());
        task.attempt += 1;
        Ok(Some(task.clone()))
    }

    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> CoreResult<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            // A task already terminal (e.g. cancelled) stays that way; a
            // late ack/result/timeout transition is a no-op, not a clobber.
            return Ok(task.clone());
        }
        task.status = status;
        if status.is_terminal() {
            task.claimed_at = None;
            task.assigned_node_id = None;
        }
        Ok(task.clone())
    }

    async fn cancel_task(&self, task_id: &TaskId) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.claimed_at = None;
        task.assigned_node_id = None;
        Ok(true)
    }

    async fn requeue_for_retry(
        &self,
        task_id: &TaskId,
        retry_after: Option<DateTime<Utc>>,
    ) -> CoreResult<Task> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Ok(task.clone());
        }
        task.status = TaskStatus::Queued;
        task.assigned_node_id = None;
        task.claimed_at = None;
        task.retry_after = retry_after;
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: &TaskId) -> CoreResult<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> CoreResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.values().cloned().collect())
    }

    async fn list_queued(&self) -> CoreResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect())
    }

    async fn list_running(&self) -> CoreResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.status.is_claimed_or_running())
            .cloned()
            .collect())
    }

    async fn set_task_result(&self, result: TaskResult) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.results.insert(result.task_id, result);
        Ok(())
    }

    async fn get_task_result(&self, task_id: &TaskId) -> CoreResult<Option<TaskResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.results.get(task_id).cloned())
    }

    async fn enqueue_dlq(&self, entry: DlqEntry) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.dlq.insert(entry.task_id, entry);
        Ok(())
    }

    async fn list_dlq(&self) -> CoreResult<Vec<DlqEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.dlq.values().cloned().collect())
    }

    async fn get_dlq_entry(&self, task_id: &TaskId) -> CoreResult<Option<DlqEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.dlq.get(task_id).cloned())
    }

    async fn requeue_from_dlq(&self, task_id: &TaskId, now: DateTime<Utc>) -> CoreResult<Task> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .dlq
            .remove(task_id)
            .ok_or_else(|| CoreError::DlqEntryNotFound(task_id.to_string()))?;
        let mut task = entry.task;
        task.attempt = 0;
        task.retry_after = None;
        task.status = TaskStatus::Queued;
        task.claimed_at = None;
        task.assigned_node_id = None;
        task.created_at = now;
        inner.tasks.insert(*task_id, task.clone());
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTask, NodeCapabilities};
    use std::collections::HashSet;

    fn node(id: &str, tags: &[&str], max_concurrent: u32) -> Node {
        Node::new(
            NodeId::new(id),
            NodeCapabilities::new(tags.iter().map(|s| s.to_string()), max_concurrent),
        )
    }

    fn healthy_heartbeat(now: DateTime<Utc>) -> Heartbeat {
        Heartbeat {
            ts: now,
            status: super::super::HeartbeatStatus::Healthy,
            load: 0.0,
            running_tasks: 0,
        }
    }

    fn new_task(kind: &str, priority: i32, required_tags: &[&str]) -> NewTask {
        NewTask {
            task_id: TaskId::new(uuid::Uuid::new_v4()),
            kind: kind.to_string(),
            payload: serde_json::json!({}),
            target_node_id: None,
            required_tags: required_tags.iter().map(|s| s.to_string()).collect(),
            priority,
            max_attempts: 3,
            timeout_ms: None,
        }
    }

    async fn register_and_heartbeat(store: &LocalStore, n: Node, now: DateTime<Utc>) {
        store.upsert_node(n.clone()).await.unwrap();
        store.set_heartbeat(&n.node_id, healthy_heartbeat(now)).await.unwrap();
    }

    #[tokio::test]
    async fn s1_priority_then_fifo() {
        let store = LocalStore::new();
        let now = Utc::now();
        register_and_heartbeat(&store, node("n", &["linux"], 10), now).await;

        let low = new_task("low", 1, &[]).into_task(now);
        let high = new_task("high", 10, &[]).into_task(now + chrono::Duration::milliseconds(1));
        store.enqueue_task(low.clone()).await.unwrap();
        store.enqueue_task(high.clone()).await.unwrap();

        let node_id = NodeId::new("n");
        let claimed = store
            .claim_task(&node_id, now, 30_000, FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task_id, high.task_id);

        let claimed2 = store
            .claim_task(&node_id, now, 30_000, FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed2.task_id, low.task_id);
    }

    #[tokio::test]
    async fn s2_tag_filter_beats_priority() {
        let store = LocalStore::new();
        let now = Utc::now();
        register_and_heartbeat(&store, node("n", &["linux"], 10), now).await;

        let gpu_high = new_task("gpu-high", 99, &["gpu"]).into_task(now);
        let linux_low = new_task("linux-low", 1, &["linux"]).into_task(now);
        store.enqueue_task(gpu_high).await.unwrap();
        store.enqueue_task(linux_low.clone()).await.unwrap();

        let claimed = store
            .claim_task(&NodeId::new("n"), now, 30_000, FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task_id, linux_low.task_id);
    }

    #[tokio::test]
    async fn s3_lease_expiry_reclaims_and_increments_attempt() {
        let store = LocalStore::new();
        let now = Utc::now();
        register_and_heartbeat(&store, node("n", &[], 10), now).await;

        let t = new_task("t", 0, &[]).into_task(now);
        let task_id = t.task_id;
        store.enqueue_task(t).await.unwrap();

        let node_id = NodeId::new("n");
        let claimed = store.claim_task(&node_id, now, 5, FreshnessThresholds::default()).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);

        let later = now + chrono::Duration::milliseconds(10);
        store.set_heartbeat(&node_id, healthy_heartbeat(later)).await.unwrap();
        let reclaimed = store
            .claim_task(&node_id, later, 5, FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.task_id, task_id);
        assert_eq!(reclaimed.attempt, 2);
    }

    #[tokio::test]
    async fn claim_returns_none_when_no_eligible_task() {
        let store = LocalStore::new();
        let now = Utc::now();
        register_and_heartbeat(&store, node("n", &[], 10), now).await;
        let result = store
            .claim_task(&NodeId::new("n"), now, 30_000, FreshnessThresholds::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn claim_rejects_revoked_node() {
        let store = LocalStore::new();
        let now = Utc::now();
        register_and_heartbeat(&store, node("n", &[], 10), now).await;
        store
            .set_node_trust(&NodeId::new("n"), TrustUpdate { trusted: None, revoked: Some(true) })
            .await
            .unwrap();
        store.enqueue_task(new_task("t", 0, &[]).into_task(now)).await.unwrap();
        let result = store
            .claim_task(&NodeId::new("n"), now, 30_000, FreshnessThresholds::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn capacity_gate_rejects_when_full() {
        let store = LocalStore::new();
        let now = Utc::now();
        register_and_heartbeat(&store, node("n", &[], 1), now).await;
        store.enqueue_task(new_task("a", 0, &[]).into_task(now)).await.unwrap();
        store.enqueue_task(new_task("b", 0, &[]).into_task(now)).await.unwrap();
        let node_id = NodeId::new("n");
        assert!(store.claim_task(&node_id, now, 30_000, FreshnessThresholds::default()).await.unwrap().is_some());
        assert!(store.claim_task(&node_id, now, 30_000, FreshnessThresholds::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_node_preserves_trust_and_heartbeat_on_reregister() {
        let store = LocalStore::new();
        let now = Utc::now();
        let n = node("n", &["linux"], 4);
        store.upsert_node(n.clone()).await.unwrap();
        store.set_node_trust(&n.node_id, TrustUpdate { trusted: None, revoked: Some(true) }).await.unwrap();
        store.set_heartbeat(&n.node_id, healthy_heartbeat(now)).await.unwrap();

        let reregistered = node("n", &["linux", "gpu"], 8);
        let result = store.upsert_node(reregistered).await.unwrap();
        assert!(result.revoked, "revoke flag must survive re-registration");
        assert!(result.last_heartbeat.is_some(), "heartbeat must survive re-registration");
        assert_eq!(
            result.capabilities.tags,
            HashSet::from(["linux".to_string(), "gpu".to_string()])
        );
    }

    #[tokio::test]
    async fn cancel_then_requeue_from_dlq_resets_attempt() {
        let store = LocalStore::new();
        let now = Utc::now();
        let t = new_task("t", 0, &[]).into_task(now);
        let task_id = t.task_id;
        store.enqueue_task(t.clone()).await.unwrap();
        let entry = DlqEntry {
            task_id,
            task: Task { attempt: 3, ..t },
            last_result: None,
            reason: super::super::DlqReason::MaxAttemptsExhausted,
            enqueued_at: now,
        };
        store.enqueue_dlq(entry).await.unwrap();
        let restored = store.requeue_from_dlq(&task_id, now).await.unwrap();
        assert_eq!(restored.attempt, 0);
        assert_eq!(restored.status, TaskStatus::Queued);
        assert!(store.get_dlq_entry(&task_id).await.unwrap().is_none());
    }
}
