//! Admin Surface (spec section 4.8): node drain/undrain/revoke, task
//! cancel, DLQ replay — thin compositions over `Store` + the Lifecycle
//! Coordinator + the Event Bus, gated upstream by an admin identity.
//!
//! Every operation here additionally emits a `tracing::info!` audit line
//! naming the admin subject, per SPEC_FULL's supplemented audit-logging
//! requirement, mirroring how the teacher's `dispatch` module logs every
//! transition it makes.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::ids::{NodeId, TaskId};
use crate::lifecycle::LifecycleCoordinator;
use crate::store::{Event, EventType, Node, Store, Task, TrustUpdate};

/// Gated administrative operations. Callers are expected to have already
/// verified the admin token before reaching this surface; this module does
/// not itself check authorization (that is a transport-boundary concern,
/// per spec.md section 1's "deliberately out of scope").
pub struct AdminSurface {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    lifecycle: Arc<LifecycleCoordinator>,
}

impl AdminSurface {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, lifecycle: Arc<LifecycleCoordinator>) -> Self {
        Self { store, events, lifecycle }
    }

    pub async fn drain_node(&self, node_id: &NodeId, admin_subject: &str, clock: &dyn Clock) -> CoreResult<Node> {
        let node = self.store.set_node_drain(node_id, true).await?;
        tracing::info!(node_id = %node_id, admin = admin_subject, "node drain requested");
        self.events.emit_with_caller(Event::new(EventType::NodeDrain, clock.now()).with_node(node_id.clone()), admin_subject);
        Ok(node)
    }

    pub async fn undrain_node(&self, node_id: &NodeId, admin_subject: &str, clock: &dyn Clock) -> CoreResult<Node> {
        let node = self.store.set_node_drain(node_id, false).await?;
        tracing::info!(node_id = %node_id, admin = admin_subject, "node undrain requested");
        self.events.emit_with_caller(Event::new(EventType::NodeUndrain, clock.now()).with_node(node_id.clone()), admin_subject);
        Ok(node)
    }

    pub async fn revoke_node(&self, node_id: &NodeId, admin_subject: &str, clock: &dyn Clock) -> CoreResult<Node> {
        let node = self
            .store
            .set_node_trust(node_id, TrustUpdate { trusted: None, revoked: Some(true) })
            .await?;
        tracing::info!(node_id = %node_id, admin = admin_subject, "node revoked");
        self.events.emit_with_caller(Event::new(EventType::NodeRevoked, clock.now()).with_node(node_id.clone()), admin_subject);
        Ok(node)
    }

    pub async fn cancel_task(&self, task_id: &TaskId, admin_subject: &str, clock: &dyn Clock) -> CoreResult<()> {
        self.lifecycle.cancel(task_id, clock).await?;
        tracing::info!(task_id = %task_id, admin = admin_subject, "task cancel requested");
        // `lifecycle.cancel` emits `TaskCancelled` without caller attribution
        // (it has no admin identity of its own); record the request here.
        self.events.record_request(admin_subject);
        Ok(())
    }

    pub async fn replay_dlq(&self, task_id: &TaskId, admin_subject: &str, clock: &dyn Clock) -> CoreResult<Task> {
        let restored = self.lifecycle.replay_from_dlq(task_id, clock).await?;
        tracing::info!(task_id = %task_id, admin = admin_subject, "dlq entry replayed");
        self.events.record_request(admin_subject);
        Ok(restored)
    }
}
