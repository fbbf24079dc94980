//! Row types for the durable backend, and the conversions between them and
//! `edgemesh_core`'s domain types.
//!
//! `edgemesh_core`'s enums (`TaskStatus`, `DlqReason`, ...) cannot derive
//! `sqlx::Type` here directly — they live in another crate, and Rust's
//! orphan rule forbids implementing a foreign trait (`sqlx::Type`) for a
//! foreign type from this crate. So each enum gets a small row-local twin
//! that does derive `sqlx::Type`, with a `From`/`TryFrom` pair at the
//! boundary, the same enum-plus-manual-`Display`/`FromStr` shape the
//! teacher uses throughout `gator-db::models`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use edgemesh_core::ids::{NodeId, TaskId};
use edgemesh_core::store::{
    DlqEntry, DlqReason, Event, EventType, FreshnessThresholds, Heartbeat, HeartbeatStatus, Node,
    NodeCapabilities, Task, TaskResult, TaskStatus, TrustUpdate,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DbTaskStatus {
    Queued,
    Claimed,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for DbTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&TaskStatus::from(*self), f)
    }
}

impl FromStr for DbTaskStatus {
    type Err = DbParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::from_str(s)
            .map(DbTaskStatus::from)
            .map_err(|e| DbParseError(e.to_string()))
    }
}

impl From<TaskStatus> for DbTaskStatus {
    fn from(s: TaskStatus) -> Self {
        match s {
            TaskStatus::Queued => DbTaskStatus::Queued,
            TaskStatus::Claimed => DbTaskStatus::Claimed,
            TaskStatus::Running => DbTaskStatus::Running,
            TaskStatus::Done => DbTaskStatus::Done,
            TaskStatus::Failed => DbTaskStatus::Failed,
            TaskStatus::Cancelled => DbTaskStatus::Cancelled,
        }
    }
}

impl From<DbTaskStatus> for TaskStatus {
    fn from(s: DbTaskStatus) -> Self {
        match s {
            DbTaskStatus::Queued => TaskStatus::Queued,
            DbTaskStatus::Claimed => TaskStatus::Claimed,
            DbTaskStatus::Running => TaskStatus::Running,
            DbTaskStatus::Done => TaskStatus::Done,
            DbTaskStatus::Failed => TaskStatus::Failed,
            DbTaskStatus::Cancelled => TaskStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DbDlqReason {
    MaxAttemptsExhausted,
    Timeout,
}

impl From<DlqReason> for DbDlqReason {
    fn from(r: DlqReason) -> Self {
        match r {
            DlqReason::MaxAttemptsExhausted => DbDlqReason::MaxAttemptsExhausted,
            DlqReason::Timeout => DbDlqReason::Timeout,
        }
    }
}

impl From<DbDlqReason> for DlqReason {
    fn from(r: DbDlqReason) -> Self {
        match r {
            DbDlqReason::MaxAttemptsExhausted => DlqReason::MaxAttemptsExhausted,
            DbDlqReason::Timeout => DlqReason::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DbHeartbeatStatus {
    Healthy,
    Degraded,
}

impl From<HeartbeatStatus> for DbHeartbeatStatus {
    fn from(s: HeartbeatStatus) -> Self {
        match s {
            HeartbeatStatus::Healthy => DbHeartbeatStatus::Healthy,
            HeartbeatStatus::Degraded => DbHeartbeatStatus::Degraded,
        }
    }
}

impl From<DbHeartbeatStatus> for HeartbeatStatus {
    fn from(s: DbHeartbeatStatus) -> Self {
        match s {
            DbHeartbeatStatus::Healthy => HeartbeatStatus::Healthy,
            DbHeartbeatStatus::Degraded => HeartbeatStatus::Degraded,
        }
    }
}

/// Error returned when a `text` column holds a value outside its enum's
/// known variants (a migration drift, or manual data edit).
#[derive(Debug, Clone)]
pub struct DbParseError(pub String);

impl fmt::Display for DbParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized enum value in database row: {:?}", self.0)
    }
}

impl std::error::Error for DbParseError {}

/// Row shape of the `nodes` table.
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub node_id: String,
    pub tags: Vec<String>,
    pub max_concurrent_tasks: i32,
    pub trusted: bool,
    pub revoked: bool,
    pub draining: bool,
    pub hb_ts: Option<DateTime<Utc>>,
    pub hb_status: Option<DbHeartbeatStatus>,
    pub hb_load: Option<f64>,
    pub hb_running_tasks: Option<i32>,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        let last_heartbeat = match (row.hb_ts, row.hb_status) {
            (Some(ts), Some(status)) => Some(Heartbeat {
                ts,
                status: status.into(),
                load: row.hb_load.unwrap_or(0.0),
                running_tasks: row.hb_running_tasks.unwrap_or(0).max(0) as u32,
            }),
            _ => None,
        };
        Node {
            node_id: NodeId::new(row.node_id),
            capabilities: NodeCapabilities::new(row.tags, row.max_concurrent_tasks.max(1) as u32),
            trusted: row.trusted,
            revoked: row.revoked,
            draining: row.draining,
            last_heartbeat,
        }
    }
}

/// Row shape of the `tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub target_node_id: Option<String>,
    pub required_tags: Vec<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub attempt: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub timeout_ms: Option<i64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub assigned_node_id: Option<String>,
    pub status: DbTaskStatus,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            task_id: TaskId::new(row.task_id),
            kind: row.kind,
            payload: row.payload,
            target_node_id: row.target_node_id.map(NodeId::new),
            required_tags: row.required_tags.into_iter().collect(),
            priority: row.priority,
            created_at: row.created_at,
            max_attempts: row.max_attempts.max(1) as u32,
            attempt: row.attempt.max(0) as u32,
            retry_after: row.retry_after,
            timeout_ms: row.timeout_ms.map(|v| v.max(0) as u64),
            claimed_at: row.claimed_at,
            assigned_node_id: row.assigned_node_id.map(NodeId::new),
            status: row.status.into(),
        }
    }
}

/// Row shape of the `task_results` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskResultRow {
    pub task_id: Uuid,
    pub node_id: String,
    pub ok: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl From<TaskResultRow> for TaskResult {
    fn from(row: TaskResultRow) -> Self {
        TaskResult {
            task_id: TaskId::new(row.task_id),
            node_id: NodeId::new(row.node_id),
            ok: row.ok,
            output: row.output,
            error: row.error,
            finished_at: row.finished_at,
        }
    }
}

/// Row shape of the `dlq_entries` table. The full task is kept as a JSONB
/// snapshot, matching spec.md's `DlqEntry.task: snapshot` field.
#[derive(Debug, Clone, FromRow)]
pub struct DlqRow {
    pub task_id: Uuid,
    pub task_snapshot: serde_json::Value,
    pub last_result: Option<serde_json::Value>,
    pub reason: DbDlqReason,
    pub enqueued_at: DateTime<Utc>,
}

impl TryFrom<DlqRow> for DlqEntry {
    type Error = serde_json::Error;

    fn try_from(row: DlqRow) -> Result<Self, Self::Error> {
        Ok(DlqEntry {
            task_id: TaskId::new(row.task_id),
            task: serde_json::from_value(row.task_snapshot)?,
            last_result: row.last_result.map(serde_json::from_value).transpose()?,
            reason: row.reason.into(),
            enqueued_at: row.enqueued_at,
        })
    }
}

/// Row shape of the `events` table.
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub event_type: String,
    pub at: DateTime<Utc>,
    pub node_id: Option<String>,
    pub task_id: Option<Uuid>,
    pub detail: serde_json::Value,
}

impl TryFrom<EventRow> for Event {
    type Error = DbParseError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = parse_event_type(&row.event_type)?;
        let detail = row
            .detail
            .as_object()
            .cloned()
            .unwrap_or_default();
        Ok(Event {
            event_type,
            at: row.at,
            node_id: row.node_id.map(NodeId::new),
            task_id: row.task_id.map(TaskId::new),
            detail,
        })
    }
}

fn parse_event_type(s: &str) -> Result<EventType, DbParseError> {
    Ok(match s {
        "node.registered" => EventType::NodeRegistered,
        "node.heartbeat" => EventType::NodeHeartbeat,
        "node.revoked" => EventType::NodeRevoked,
        "node.drain" => EventType::NodeDrain,
        "node.undrain" => EventType::NodeUndrain,
        "task.enqueued" => EventType::TaskEnqueued,
        "task.claimed" => EventType::TaskClaimed,
        "task.running" => EventType::TaskRunning,
        "task.done" => EventType::TaskDone,
        "task.failed" => EventType::TaskFailed,
        "task.cancelled" => EventType::TaskCancelled,
        other => return Err(DbParseError(other.to_string())),
    })
}

/// Not a row type: carries a partial node-trust update down to SQL bind
/// parameters without exposing `edgemesh_core::store::TrustUpdate`'s
/// private layout to the query layer.
pub struct TrustUpdateParams {
    pub trusted: Option<bool>,
    pub revoked: Option<bool>,
}

impl From<TrustUpdate> for TrustUpdateParams {
    fn from(u: TrustUpdate) -> Self {
        Self { trusted: u.trusted, revoked: u.revoked }
    }
}

/// Re-exported so query modules can construct thresholds without a direct
/// `edgemesh_core` import in every file.
pub type DbFreshnessThresholds = FreshnessThresholds;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrips_through_db_twin() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Claimed,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let db: DbTaskStatus = status.into();
            let back: TaskStatus = db.into();
            assert_eq!(status, back);
        }
    }

    #[test]
    fn dlq_row_converts_through_json_snapshot() {
        let task = Task {
            task_id: TaskId::new(Uuid::new_v4()),
            kind: "echo".into(),
            payload: serde_json::json!({}),
            target_node_id: None,
            required_tags: Default::default(),
            priority: 0,
            created_at: Utc::now(),
            max_attempts: 3,
            attempt: 1,
            retry_after: None,
            timeout_ms: None,
            claimed_at: None,
            assigned_node_id: None,
            status: TaskStatus::Failed,
        };
        let row = DlqRow {
            task_id: task.task_id.0,
            task_snapshot: serde_json::to_value(&task).unwrap(),
            last_result: None,
            reason: DbDlqReason::Timeout,
            enqueued_at: Utc::now(),
        };
        let entry = DlqEntry::try_from(row).unwrap();
        assert_eq!(entry.task.task_id, task.task_id);
        assert_eq!(entry.reason, DlqReason::Timeout);
    }
}
