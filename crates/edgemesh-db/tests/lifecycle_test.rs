//! Integration tests for the claim/lifecycle/admin glue in `edgemesh-core`
//! driven against a real PostgreSQL-backed `PgStore`, the same combination
//! the HTTP control plane wires together at request time.

use std::sync::Arc;

use chrono::Utc;
use edgemesh_core::admin::AdminSurface;
use edgemesh_core::claim::{self, ClaimConfig};
use edgemesh_core::clock::SystemClock;
use edgemesh_core::events::EventBus;
use edgemesh_core::ids::NodeId;
use edgemesh_core::lifecycle::LifecycleCoordinator;
use edgemesh_core::retry::RetryConfig;
use edgemesh_core::store::{Event, EventType, Heartbeat, HeartbeatStatus, Node, NodeCapabilities, NewTask, Store, TaskStatus};
use edgemesh_db::store::PgStore;
use edgemesh_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

fn new_task(kind: &str) -> NewTask {
    NewTask {
        task_id: edgemesh_core::ids::TaskId::new(Uuid::new_v4()),
        kind: kind.to_string(),
        payload: serde_json::json!({}),
        target_node_id: None,
        required_tags: Default::default(),
        priority: 0,
        max_attempts: 3,
        timeout_ms: None,
    }
}

#[tokio::test]
async fn claim_ack_result_round_trips_through_lifecycle_coordinator() {
    let (pool, db_name) = create_test_db().await;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let events = Arc::new(EventBus::default());
    let clock = SystemClock;
    let node_id = NodeId::new("n1");

    store.upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(Vec::<String>::new(), 4))).await.unwrap();
    store
        .set_heartbeat(&node_id, Heartbeat { ts: Utc::now(), status: HeartbeatStatus::Healthy, load: 0.0, running_tasks: 0 })
        .await
        .unwrap();

    let task = store.enqueue_task(new_task("echo").into_task(Utc::now())).await.unwrap();
    events.emit(Event::new(EventType::TaskEnqueued, Utc::now()).with_task(task.task_id));

    let claimed = claim::claim_task(&store, &events, &clock, &node_id, ClaimConfig::default())
        .await
        .unwrap()
        .expect("the freshly enqueued task should be claimable");
    assert_eq!(claimed.task_id, task.task_id);
    assert_eq!(claimed.status, TaskStatus::Claimed);

    let lifecycle = LifecycleCoordinator::new(store.clone(), events.clone(), RetryConfig::default());
    let acked = lifecycle.ack(&claimed.task_id, &node_id, &clock).await.unwrap();
    assert_eq!(acked.status, TaskStatus::Running);

    let finished = lifecycle
        .result(&claimed.task_id, &node_id, true, Some(serde_json::json!({"ok": true})), None, &clock)
        .await
        .unwrap();
    assert_eq!(finished.status, TaskStatus::Done);

    let persisted_result = store.get_task_result(&claimed.task_id).await.unwrap().expect("a result should have been recorded");
    assert!(persisted_result.ok);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn admin_surface_drain_revoke_and_cancel_against_postgres() {
    let (pool, db_name) = create_test_db().await;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let events = Arc::new(EventBus::default());
    let clock = SystemClock;
    let node_id = NodeId::new("n2");

    store.upsert_node(Node::new(node_id.clone(), NodeCapabilities::new(Vec::<String>::new(), 2))).await.unwrap();

    let lifecycle = Arc::new(LifecycleCoordinator::new(store.clone(), events.clone(), RetryConfig::default()));
    let admin = AdminSurface::new(store.clone(), events.clone(), lifecycle);

    let drained = admin.drain_node(&node_id, "op", &clock).await.unwrap();
    assert!(drained.draining);
    let undrained = admin.undrain_node(&node_id, "op", &clock).await.unwrap();
    assert!(!undrained.draining);

    let task = store.enqueue_task(new_task("long-job").into_task(Utc::now())).await.unwrap();
    admin.cancel_task(&task.task_id, "op", &clock).await.unwrap();
    let cancelled = store.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    let revoked = admin.revoke_node(&node_id, "op", &clock).await.unwrap();
    assert!(revoked.revoked);

    let claim_after_revoke = store.claim_task(&node_id, Utc::now(), 30_000, Default::default()).await.unwrap();
    assert!(claim_after_revoke.is_none(), "a revoked node must not be able to claim further tasks");

    pool.close().await;
    drop_test_db(&db_name).await;
}
