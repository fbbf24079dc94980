//! Timeout Reaper (spec section 4.6): a periodic sweeper that finds
//! claims whose age exceeds the task's declared timeout and hands the
//! decision to the Lifecycle Coordinator.
//!
//! Grounded in the teacher pack's `kalla-worker` reaper spawn-as-a-
//! background-task shape, generalized to consult the Retry Policy and
//! emit through the Event Bus instead of a single metrics counter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use crate::clock::Clock;
use crate::lifecycle::LifecycleCoordinator;
use crate::store::{Store, TaskStatus};

/// Tunables for the reaper loop (spec.md section 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReaperConfig {
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5) }
    }
}

/// One sweep: scan every claimed/running task with a declared `timeoutMs`
/// and reap the ones whose lease has outlived it. Returns the number of
/// tasks reaped, for callers that want to log or test against it.
pub async fn sweep_once(
    store: &Arc<dyn Store>,
    coordinator: &LifecycleCoordinator,
    clock: &dyn Clock,
) -> crate::error::CoreResult<usize> {
    let now = clock.now();
    let running = store.list_running().await?;
    let mut reaped = 0;

    for task in running {
        if task.status.is_terminal() {
            continue; // defensive: list_running should never include terminal tasks
        }
        let Some(timeout_ms) = task.timeout_ms else { continue };
        let Some(claimed_at) = task.claimed_at else { continue };
        let age_ms = (now - claimed_at).num_milliseconds();
        if age_ms > timeout_ms as i64 {
            coordinator.handle_timeout(&task, now).await?;
            reaped += 1;
        }
    }

    Ok(reaped)
}

/// Spawn the reaper as a background task on the current Tokio runtime.
/// Ticks forever until `shutdown` is signalled. Logs and continues past a
/// single sweep's error rather than exiting the loop (spec.md section 7:
/// "the Reaper continues on next tick").
pub fn spawn(
    store: Arc<dyn Store>,
    coordinator: Arc<LifecycleCoordinator>,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep_once(&store, &coordinator, clock.as_ref()).await {
                        Ok(reaped) if reaped > 0 => {
                            tracing::info!(reaped, "reaper swept stale claims");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "reaper sweep failed, continuing on next tick");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("reaper shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::events::EventBus;
    use crate::ids::{NodeId, TaskId};
    use crate::retry::RetryConfig;
    use crate::store::local::LocalStore;
    use crate::store::{Heartbeat, HeartbeatStatus, Node, NodeCapabilities, NewTask};

    async fn setup(max_attempts: u32, timeout_ms: u64) -> (Arc<dyn Store>, LifecycleCoordinator, NodeId, chrono::DateTime<chrono::Utc>, TaskId) {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let events = Arc::new(EventBus::default());
        let coordinator = LifecycleCoordinator::new(store.clone(), events, RetryConfig::default());
        let now = chrono::Utc::now();
        let node_id = NodeId::new("n1");
        store.upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(vec![], 4))).await.unwrap();
        store
            .set_heartbeat(&node_id, Heartbeat { ts: now, status: HeartbeatStatus::Healthy, load: 0.0, running_tasks: 0 })
            .await
            .unwrap();
        let task = NewTask {
            task_id: TaskId::new(uuid::Uuid::new_v4()),
            kind: "echo".into(),
            payload: serde_json::json!({}),
            target_node_id: None,
            required_tags: Default::default(),
            priority: 0,
            max_attempts,
            timeout_ms: Some(timeout_ms),
        }
        .into_task(now);
        let task_id = task.task_id;
        store.enqueue_task(task).await.unwrap();
        store
            .claim_task(&node_id, now, 30_000, crate::store::FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();
        (store, coordinator, node_id, now, task_id)
    }

    #[tokio::test]
    async fn s5_timeout_retries_then_dlqs() {
        let (store, coordinator, _node_id, now, task_id) = setup(2, 100).await;

        let after_timeout = now + chrono::Duration::milliseconds(150);
        let clock = FixedClock::new(after_timeout);
        let reaped = sweep_once(&store, &coordinator, &clock).await.unwrap();
        assert_eq!(reaped, 1);

        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 1);

        // Re-claim and time it out a second time: attempts are now exhausted.
        store
            .claim_task(&_node_id, after_timeout, 30_000, crate::store::FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();
        let later = after_timeout + chrono::Duration::milliseconds(150);
        let clock2 = FixedClock::new(later);
        let reaped2 = sweep_once(&store, &coordinator, &clock2).await.unwrap();
        assert_eq!(reaped2, 1);

        let task2 = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task2.status, TaskStatus::Failed);
        let dlq = store.get_dlq_entry(&task_id).await.unwrap().unwrap();
        assert_eq!(dlq.reason, crate::store::DlqReason::Timeout);
    }

    #[tokio::test]
    async fn tasks_without_timeout_are_untouched() {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let events = Arc::new(EventBus::default());
        let coordinator = LifecycleCoordinator::new(store.clone(), events, RetryConfig::default());
        let now = chrono::Utc::now();
        let node_id = NodeId::new("n1");
        store.upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(vec![], 4))).await.unwrap();
        store
            .set_heartbeat(&node_id, Heartbeat { ts: now, status: HeartbeatStatus::Healthy, load: 0.0, running_tasks: 0 })
            .await
            .unwrap();
        let task = NewTask {
            task_id: TaskId::new(uuid::Uuid::new_v4()),
            kind: "echo".into(),
            payload: serde_json::json!({}),
            target_node_id: None,
            required_tags: Default::default(),
            priority: 0,
            max_attempts: 3,
            timeout_ms: None,
        }
        .into_task(now);
        let task_id = task.task_id;
        store.enqueue_task(task).await.unwrap();
        store
            .claim_task(&node_id, now, 30_000, crate::store::FreshnessThresholds::default())
            .await
            .unwrap()
            .unwrap();

        let later = now + chrono::Duration::hours(1);
        let clock = FixedClock::new(later);
        let reaped = sweep_once(&store, &coordinator, &clock).await.unwrap();
        assert_eq!(reaped, 0);
        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
    }
}
