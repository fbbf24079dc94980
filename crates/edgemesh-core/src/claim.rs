//! Claim Engine (spec section 4.3): `claimTask(nodeId)` atop the `Store`.
//!
//! The selection, eligibility filtering, and atomic transition live inside
//! `Store::claim_task` itself (the atomicity contract requires the whole
//! thing run in the backend's single critical section). This module is
//! the thin orchestration layer the rest of the system calls: it supplies
//! the clock and config, and emits the `task.claimed` event on success.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::ids::NodeId;
use crate::store::{Event, EventType, FreshnessThresholds, Store, Task};

/// Tunables for claim attempts (spec.md section 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimConfig {
    pub claim_ttl_ms: i64,
    pub freshness_thresholds: FreshnessThresholds,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            claim_ttl_ms: 30_000,
            freshness_thresholds: FreshnessThresholds::default(),
        }
    }
}

/// Attempts to claim the next eligible task for `node_id`.
///
/// Returns `Ok(None)` when there is nothing to claim — this is not an
/// error case (spec.md section 4.3 edge case (a)).
pub async fn claim_task(
    store: &Arc<dyn Store>,
    events: &EventBus,
    clock: &dyn Clock,
    node_id: &NodeId,
    config: ClaimConfig,
) -> CoreResult<Option<Task>> {
    let now = clock.now();
    let claimed = store
        .claim_task(node_id, now, config.claim_ttl_ms, config.freshness_thresholds)
        .await?;

    if let Some(task) = &claimed {
        tracing::info!(task_id = %task.task_id, node_id = %node_id, attempt = task.attempt, "task claimed");
        events.emit_with_caller(
            Event::new(EventType::TaskClaimed, now)
                .with_node(node_id.clone())
                .with_task(task.task_id)
                .with_detail("attempt", task.attempt),
            node_id.as_str(),
        );
    } else {
        // Every poll is a request from this node, even the ones that find
        // nothing to claim.
        events.record_request(node_id.as_str());
    }

    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::local::LocalStore;
    use crate::store::{Heartbeat, HeartbeatStatus, Node, NodeCapabilities, NewTask};

    #[tokio::test]
    async fn claim_emits_task_claimed_event() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let events = EventBus::default();
        let now = chrono::Utc::now();
        let clock = FixedClock::new(now);

        let node_id = NodeId::new("n1");
        store
            .upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(vec![], 4)))
            .await
            .unwrap();
        store
            .set_heartbeat(&node_id, Heartbeat { ts: now, status: HeartbeatStatus::Healthy, load: 0.0, running_tasks: 0 })
            .await
            .unwrap();
        store
            .enqueue_task(
                NewTask {
                    task_id: crate::ids::TaskId::new(uuid::Uuid::new_v4()),
                    kind: "echo".into(),
                    payload: serde_json::json!({}),
                    target_node_id: None,
                    required_tags: Default::default(),
                    priority: 0,
                    max_attempts: 3,
                    timeout_ms: None,
                }
                .into_task(now),
            )
            .await
            .unwrap();

        let mut rx = events.subscribe();
        let claimed = claim_task(&store, &events, &clock, &node_id, ClaimConfig::default())
            .await
            .unwrap();
        assert!(claimed.is_some());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::TaskClaimed);
    }

    #[tokio::test]
    async fn claim_returns_none_without_error_when_queue_empty() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let events = EventBus::default();
        let now = chrono::Utc::now();
        let clock = FixedClock::new(now);
        let node_id = NodeId::new("n1");
        store
            .upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(vec![], 4)))
            .await
            .unwrap();
        store
            .set_heartbeat(&node_id, Heartbeat { ts: now, status: HeartbeatStatus::Healthy, load: 0.0, running_tasks: 0 })
            .await
            .unwrap();

        let claimed = claim_task(&store, &events, &clock, &node_id, ClaimConfig::default())
            .await
            .unwrap();
        assert!(claimed.is_none());
    }
}
