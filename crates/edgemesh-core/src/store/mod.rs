//! The state abstraction (spec section 4.1): the sole authoritative holder
//! of node, task, result, and DLQ state. All scheduler logic in this crate
//! is written against the [`Store`] trait and is backend-agnostic; see
//! [`local::LocalStore`] for the process-local default, and the
//! `edgemesh-db` crate for a durable Postgres-backed implementation.

pub mod local;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::ids::{NodeId, TaskId};

/// Status of a node's most recently reported health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Healthy,
    Degraded,
}

/// A node's liveness classification, derived from heartbeat age (4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessState {
    Healthy,
    Degraded,
    Offline,
}

/// The most recently reported heartbeat for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub load: f64,
    pub running_tasks: u32,
}

/// Capabilities advertised at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub tags: HashSet<String>,
    pub max_concurrent_tasks: u32,
}

impl NodeCapabilities {
    pub fn new(tags: impl IntoIterator<Item = String>, max_concurrent_tasks: u32) -> Self {
        Self {
            tags: tags.into_iter().collect(),
            max_concurrent_tasks: max_concurrent_tasks.max(1),
        }
    }
}

/// A worker node, as tracked by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub capabilities: NodeCapabilities,
    pub trusted: bool,
    pub revoked: bool,
    pub draining: bool,
    pub last_heartbeat: Option<Heartbeat>,
}

impl Node {
    pub fn new(node_id: NodeId, capabilities: NodeCapabilities) -> Self {
        Self {
            node_id,
            capabilities,
            trusted: true,
            revoked: false,
            draining: false,
            last_heartbeat: None,
        }
    }

    /// Computed freshness given the current time and the supplied
    /// thresholds. See [`crate::freshness::evaluate`].
    pub fn freshness_state(&self, now: DateTime<Utc>, thresholds: FreshnessThresholds) -> FreshnessState {
        crate::freshness::evaluate(self.last_heartbeat.as_ref(), now, thresholds)
    }
}

/// Thresholds used by the Freshness Evaluator (4.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreshnessThresholds {
    pub healthy_ms: i64,
    pub degraded_ms: i64,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            healthy_ms: 10_000,
            degraded_ms: 30_000,
        }
    }
}

/// Partial update applied by `setNodeTrust`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustUpdate {
    pub trusted: Option<bool>,
    pub revoked: Option<bool>,
}

/// Status of a task in the lifecycle state machine (4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn is_claimed_or_running(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task status: {0}")]
pub struct TaskStatusParseError(String);

impl std::str::FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => TaskStatus::Queued,
            "claimed" => TaskStatus::Claimed,
            "running" => TaskStatus::Running,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            other => return Err(TaskStatusParseError(other.to_string())),
        })
    }
}

/// A unit of dispatchable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub target_node_id: Option<NodeId>,
    pub required_tags: HashSet<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub max_attempts: u32,
    pub attempt: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub assigned_node_id: Option<NodeId>,
    pub status: TaskStatus,
}

/// Fields a producer supplies when enqueuing a task; scheduling fields are
/// filled in by the Store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: TaskId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub target_node_id: Option<NodeId>,
    pub required_tags: HashSet<String>,
    pub priority: i32,
    pub max_attempts: u32,
    pub timeout_ms: Option<u64>,
}

impl NewTask {
    pub fn into_task(self, created_at: DateTime<Utc>) -> Task {
        Task {
            task_id: self.task_id,
            kind: self.kind,
            payload: self.payload,
            target_node_id: self.target_node_id,
            required_tags: self.required_tags,
            priority: self.priority,
            created_at,
            max_attempts: self.max_attempts.max(1),
            attempt: 0,
            retry_after: None,
            timeout_ms: self.timeout_ms,
            claimed_at: None,
            assigned_node_id: None,
            status: TaskStatus::Queued,
        }
    }
}

/// The single terminal outcome recorded for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub ok: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Why a task landed in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxAttemptsExhausted,
    Timeout,
}

impl std::fmt::Display for DlqReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DlqReason::MaxAttemptsExhausted => "max_attempts_exhausted",
            DlqReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A dead-lettered task, retained for operator inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub task_id: TaskId,
    pub task: Task,
    pub last_result: Option<TaskResult>,
    pub reason: DlqReason,
    pub enqueued_at: DateTime<Utc>,
}

/// The event taxonomy (4.7/3 Event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeRegistered,
    NodeHeartbeat,
    NodeRevoked,
    NodeDrain,
    NodeUndrain,
    TaskEnqueued,
    TaskClaimed,
    TaskRunning,
    TaskDone,
    TaskFailed,
    TaskCancelled,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::NodeRegistered => "node.registered",
            EventType::NodeHeartbeat => "node.heartbeat",
            EventType::NodeRevoked => "node.revoked",
            EventType::NodeDrain => "node.drain",
            EventType::NodeUndrain => "node.undrain",
            EventType::TaskEnqueued => "task.enqueued",
            EventType::TaskClaimed => "task.claimed",
            EventType::TaskRunning => "task.running",
            EventType::TaskDone => "task.done",
            EventType::TaskFailed => "task.failed",
            EventType::TaskCancelled => "task.cancelled",
        };
        f.write_str(s)
    }
}

/// A single audit-style event, as fanned out by the Event Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub at: DateTime<Utc>,
    pub node_id: Option<NodeId>,
    pub task_id: Option<TaskId>,
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, at: DateTime<Utc>) -> Self {
        Self {
            event_type,
            at,
            node_id: None,
            task_id: None,
            detail: serde_json::Map::new(),
        }
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

/// The sole authoritative state holder (spec section 4.1).
///
/// Implementations must satisfy the atomicity contract: `claim_task`,
/// `requeue_for_retry`, `cancel_task`, and `requeue_from_dlq` are atomic
/// with respect to concurrent callers — no intermediate state is
/// observable to another `claim_task` or `set_task_status` call.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_node(&self, node: Node) -> CoreResult<Node>;
    async fn set_heartbeat(&self, node_id: &NodeId, hb: Heartbeat) -> CoreResult<()>;
    async fn set_node_trust(&self, node_id: &NodeId, update: TrustUpdate) -> CoreResult<Node>;
    async fn set_node_drain(&self, node_id: &NodeId, draining: bool) -> CoreResult<Node>;
    async fn list_nodes(&self) -> CoreResult<Vec<Node>>;
    async fn get_node(&self, node_id: &NodeId) -> CoreResult<Option<Node>>;

    async fn enqueue_task(&self, task: Task) -> CoreResult<Task>;
    async fn claim_task(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        claim_ttl_ms: i64,
        thresholds: FreshnessThresholds,
    ) -> CoreResult<Option<Task>>;
    async fn set_task_status(&self, task_id: &TaskId, status: TaskStatus) -> CoreResult<Task>;
    async fn cancel_task(&self, task_id: &TaskId) -> CoreResult<bool>;
    async fn requeue_for_retry(&self, task_id: &TaskId, retry_after: Option<DateTime<Utc>>) -> CoreResult<Task>;

    async fn get_task(&self, task_id: &TaskId) -> CoreResult<Option<Task>>;
    async fn list_tasks(&self) -> CoreResult<Vec<Task>>;
    async fn list_queued(&self) -> CoreResult<Vec<Task>>;
    async fn list_running(&self) -> CoreResult<Vec<Task>>;

    async fn set_task_result(&self, result: TaskResult) -> CoreResult<()>;
    async fn get_task_result(&self, task_id: &TaskId) -> CoreResult<Option<TaskResult>>;

    async fn enqueue_dlq(&self, entry: DlqEntry) -> CoreResult<()>;
    async fn list_dlq(&self) -> CoreResult<Vec<DlqEntry>>;
    async fn get_dlq_entry(&self, task_id: &TaskId) -> CoreResult<Option<DlqEntry>>;
    async fn requeue_from_dlq(&self, task_id: &TaskId, now: DateTime<Utc>) -> CoreResult<Task>;
}
