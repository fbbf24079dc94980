//! Integration tests for `PgStore` against a real PostgreSQL instance.

use std::collections::HashSet;

use chrono::Utc;
use edgemesh_core::ids::{NodeId, TaskId};
use edgemesh_core::store::{
    DlqEntry, DlqReason, Heartbeat, HeartbeatStatus, Node, NodeCapabilities, NewTask, Store,
    TaskResult, TaskStatus,
};
use edgemesh_db::store::PgStore;
use edgemesh_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

fn new_task(kind: &str, priority: i32, tags: &[&str]) -> NewTask {
    NewTask {
        task_id: TaskId::new(Uuid::new_v4()),
        kind: kind.to_string(),
        payload: serde_json::json!({}),
        target_node_id: None,
        required_tags: tags.iter().map(|s| s.to_string()).collect(),
        priority,
        max_attempts: 3,
        timeout_ms: None,
    }
}

async fn register_healthy_node(store: &PgStore, node_id: &str, tags: &[&str], max_concurrent: u32) -> NodeId {
    let id = NodeId::new(node_id);
    let caps = NodeCapabilities::new(tags.iter().map(|s| s.to_string()), max_concurrent);
    store.upsert_node(Node::new(id.clone(), caps)).await.unwrap();
    store
        .set_heartbeat(
            &id,
            Heartbeat { ts: Utc::now(), status: HeartbeatStatus::Healthy, load: 0.1, running_tasks: 0 },
        )
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn claim_picks_highest_priority_then_fifo() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = register_healthy_node(&store, "n1", &[], 4).await;

    let now = Utc::now();
    let low = new_task("low", 0, &[]).into_task(now);
    let high = new_task("high", 10, &[]).into_task(now + chrono::Duration::milliseconds(5));
    store.enqueue_task(low.clone()).await.unwrap();
    store.enqueue_task(high.clone()).await.unwrap();

    let claimed = store
        .claim_task(&node_id, Utc::now(), 30_000, Default::default())
        .await
        .unwrap()
        .expect("a task should be claimable");
    assert_eq!(claimed.task_id, high.task_id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_respects_required_tags() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = register_healthy_node(&store, "n1", &["gpu"], 4).await;

    let now = Utc::now();
    let needs_gpu = new_task("gpu-job", 0, &["gpu"]).into_task(now);
    let needs_tpu = new_task("tpu-job", 100, &["tpu"]).into_task(now);
    store.enqueue_task(needs_gpu.clone()).await.unwrap();
    store.enqueue_task(needs_tpu).await.unwrap();

    let claimed = store
        .claim_task(&node_id, Utc::now(), 30_000, Default::default())
        .await
        .unwrap()
        .expect("gpu task should be claimable despite lower priority");
    assert_eq!(claimed.task_id, needs_gpu.task_id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn expired_lease_is_reclaimed_and_attempt_increments() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = register_healthy_node(&store, "n1", &[], 4).await;

    let now = Utc::now();
    let task = new_task("retry-me", 0, &[]).into_task(now);
    store.enqueue_task(task.clone()).await.unwrap();

    let first = store
        .claim_task(&node_id, now, 1_000, Default::default())
        .await
        .unwrap()
        .expect("first claim should succeed");
    assert_eq!(first.attempt, 1);

    let later = now + chrono::Duration::milliseconds(2_000);
    let second = store
        .claim_task(&node_id, later, 1_000, Default::default())
        .await
        .unwrap()
        .expect("lease should have expired and be reclaimable");
    assert_eq!(second.task_id, task.task_id);
    assert_eq!(second.attempt, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn capacity_gate_rejects_claim_when_node_is_full() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = register_healthy_node(&store, "n1", &[], 1).await;

    let now = Utc::now();
    let a = new_task("a", 0, &[]).into_task(now);
    let b = new_task("b", 0, &[]).into_task(now);
    store.enqueue_task(a).await.unwrap();
    store.enqueue_task(b).await.unwrap();

    let first = store.claim_task(&node_id, now, 30_000, Default::default()).await.unwrap();
    assert!(first.is_some());
    let second = store.claim_task(&node_id, now, 30_000, Default::default()).await.unwrap();
    assert!(second.is_none(), "node at capacity should not be handed another task");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn revoked_node_cannot_claim() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = register_healthy_node(&store, "n1", &[], 4).await;
    store
        .set_node_trust(&node_id, edgemesh_core::store::TrustUpdate { trusted: None, revoked: Some(true) })
        .await
        .unwrap();

    let task = new_task("t", 0, &[]).into_task(Utc::now());
    store.enqueue_task(task).await.unwrap();

    let claimed = store.claim_task(&node_id, Utc::now(), 30_000, Default::default()).await.unwrap();
    assert!(claimed.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn result_then_dlq_then_replay_round_trips() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = register_healthy_node(&store, "n1", &[], 4).await;

    let now = Utc::now();
    let task = new_task("flaky", 0, &[]).into_task(now);
    store.enqueue_task(task.clone()).await.unwrap();
    let claimed = store
        .claim_task(&node_id, now, 30_000, Default::default())
        .await
        .unwrap()
        .unwrap();

    store
        .set_task_result(TaskResult {
            task_id: claimed.task_id,
            node_id: node_id.clone(),
            ok: false,
            output: None,
            error: Some("boom".into()),
            finished_at: Utc::now(),
        })
        .await
        .unwrap();
    store.set_task_status(&claimed.task_id, TaskStatus::Failed).await.unwrap();

    let entry = DlqEntry {
        task_id: claimed.task_id,
        task: claimed.clone(),
        last_result: store.get_task_result(&claimed.task_id).await.unwrap(),
        reason: DlqReason::MaxAttemptsExhausted,
        enqueued_at: Utc::now(),
    };
    store.enqueue_dlq(entry).await.unwrap();

    assert!(store.get_dlq_entry(&claimed.task_id).await.unwrap().is_some());

    let replayed = store.requeue_from_dlq(&claimed.task_id, Utc::now()).await.unwrap();
    assert_eq!(replayed.status, TaskStatus::Queued);
    assert_eq!(replayed.attempt, 0);
    assert!(store.get_dlq_entry(&claimed.task_id).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn upsert_node_preserves_trust_across_reregistration() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());
    let node_id = NodeId::new("n1");

    store
        .upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(Vec::<String>::new(), 2)))
        .await
        .unwrap();
    store
        .set_node_trust(&node_id, edgemesh_core::store::TrustUpdate { trusted: None, revoked: Some(true) })
        .await
        .unwrap();

    let tags: HashSet<String> = ["gpu".to_string()].into_iter().collect();
    store
        .upsert_node(Node::new(node_id.clone(), NodeCapabilities { tags, max_concurrent_tasks: 4 }))
        .await
        .unwrap();

    let node = store.get_node(&node_id).await.unwrap().unwrap();
    assert!(node.revoked, "re-registration must not clear a prior revocation");
    assert_eq!(node.capabilities.max_concurrent_tasks, 4);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_is_rejected_once_task_is_done() {
    let (pool, db_name) = create_test_db().await;
    let store = PgStore::new(pool.clone());

    let task = new_task("t", 0, &[]).into_task(Utc::now());
    store.enqueue_task(task.clone()).await.unwrap();
    store.set_task_status(&task.task_id, TaskStatus::Done).await.unwrap();

    let cancelled = store.cancel_task(&task.task_id).await.unwrap();
    assert!(!cancelled);

    pool.close().await;
    drop_test_db(&db_name).await;
}
