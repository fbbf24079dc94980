//! Metrics & Summary (spec section 4.9/6): gauges derived from `Store`
//! state, counters from the `EventBus`, and claim-latency percentiles
//! from its ring buffer.
//!
//! Shaped after the teacher's `ProgressResponse` pattern: a plain struct
//! computed once per request, then serialized — no persistent aggregation
//! state of its own.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::CoreResult;
use crate::events::EventBus;
use crate::store::{FreshnessState, FreshnessThresholds, Store, TaskStatus};

/// Snapshot returned by `runs.summary` (spec.md section 6).
#[derive(Debug, Clone, Serialize)]
pub struct RunsSummary {
    pub schema_version: &'static str,
    pub nodes_total: usize,
    pub nodes_healthy: usize,
    pub nodes_degraded: usize,
    pub nodes_offline: usize,
    pub tasks_queued: usize,
    pub tasks_claimed: usize,
    pub tasks_running: usize,
    pub tasks_done: usize,
    pub tasks_failed: usize,
    pub tasks_cancelled: usize,
    pub dlq_size: usize,
    pub claim_latency_ms_p50: Option<i64>,
    pub claim_latency_ms_p99: Option<i64>,
    pub event_counts: HashMap<&'static str, u64>,
    /// Request rate by caller-identity surface (spec.md section 4.7).
    pub request_counts: HashMap<String, u64>,
}

/// Computes a [`RunsSummary`] from the current state of a `Store` and an
/// `EventBus`.
pub async fn summarize(
    store: &Arc<dyn Store>,
    events: &EventBus,
    clock: &dyn Clock,
    thresholds: FreshnessThresholds,
) -> CoreResult<RunsSummary> {
    let now = clock.now();
    let nodes = store.list_nodes().await?;
    let tasks = store.list_tasks().await?;
    let dlq = store.list_dlq().await?;

    let mut nodes_healthy = 0;
    let mut nodes_degraded = 0;
    let mut nodes_offline = 0;
    for node in &nodes {
        match node.freshness_state(now, thresholds) {
            FreshnessState::Healthy => nodes_healthy += 1,
            FreshnessState::Degraded => nodes_degraded += 1,
            FreshnessState::Offline => nodes_offline += 1,
        }
    }

    let mut by_status: HashMap<TaskStatus, usize> = HashMap::new();
    for task in &tasks {
        *by_status.entry(task.status).or_insert(0) += 1;
    }

    let mut latencies = events.claim_latencies_ms();
    latencies.sort_unstable();
    let p50 = percentile(&latencies, 0.50);
    let p99 = percentile(&latencies, 0.99);

    Ok(RunsSummary {
        schema_version: "1.0",
        nodes_total: nodes.len(),
        nodes_healthy,
        nodes_degraded,
        nodes_offline,
        tasks_queued: *by_status.get(&TaskStatus::Queued).unwrap_or(&0),
        tasks_claimed: *by_status.get(&TaskStatus::Claimed).unwrap_or(&0),
        tasks_running: *by_status.get(&TaskStatus::Running).unwrap_or(&0),
        tasks_done: *by_status.get(&TaskStatus::Done).unwrap_or(&0),
        tasks_failed: *by_status.get(&TaskStatus::Failed).unwrap_or(&0),
        tasks_cancelled: *by_status.get(&TaskStatus::Cancelled).unwrap_or(&0),
        dlq_size: dlq.len(),
        claim_latency_ms_p50: p50,
        claim_latency_ms_p99: p99,
        event_counts: events.counters_snapshot(),
        request_counts: events.caller_counters_snapshot(),
    })
}

fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted.get(rank).copied()
}

/// Render the current counters as Prometheus text exposition format, for
/// the `metrics` surface (spec.md section 6).
pub fn render_prometheus_text(summary: &RunsSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# HELP edgemesh_nodes_total Nodes known to the control plane.");
    let _ = writeln!(out, "# TYPE edgemesh_nodes_total gauge");
    let _ = writeln!(out, "edgemesh_nodes_total {}", summary.nodes_total);

    let _ = writeln!(out, "# HELP edgemesh_nodes_by_freshness Nodes by freshness state.");
    let _ = writeln!(out, "# TYPE edgemesh_nodes_by_freshness gauge");
    let _ = writeln!(out, "edgemesh_nodes_by_freshness{{state=\"healthy\"}} {}", summary.nodes_healthy);
    let _ = writeln!(out, "edgemesh_nodes_by_freshness{{state=\"degraded\"}} {}", summary.nodes_degraded);
    let _ = writeln!(out, "edgemesh_nodes_by_freshness{{state=\"offline\"}} {}", summary.nodes_offline);

    let _ = writeln!(out, "# HELP edgemesh_tasks_by_status Tasks by lifecycle status.");
    let _ = writeln!(out, "# TYPE edgemesh_tasks_by_status gauge");
    let _ = writeln!(out, "edgemesh_tasks_by_status{{status=\"queued\"}} {}", summary.tasks_queued);
    let _ = writeln!(out, "edgemesh_tasks_by_status{{status=\"claimed\"}} {}", summary.tasks_claimed);
    let _ = writeln!(out, "edgemesh_tasks_by_status{{status=\"running\"}} {}", summary.tasks_running);
    let _ = writeln!(out, "edgemesh_tasks_by_status{{status=\"done\"}} {}", summary.tasks_done);
    let _ = writeln!(out, "edgemesh_tasks_by_status{{status=\"failed\"}} {}", summary.tasks_failed);
    let _ = writeln!(out, "edgemesh_tasks_by_status{{status=\"cancelled\"}} {}", summary.tasks_cancelled);

    let _ = writeln!(out, "# HELP edgemesh_dlq_size Entries currently in the dead-letter queue.");
    let _ = writeln!(out, "# TYPE edgemesh_dlq_size gauge");
    let _ = writeln!(out, "edgemesh_dlq_size {}", summary.dlq_size);

    if let Some(p50) = summary.claim_latency_ms_p50 {
        let _ = writeln!(out, "# HELP edgemesh_claim_latency_ms Claim latency percentiles.");
        let _ = writeln!(out, "# TYPE edgemesh_claim_latency_ms gauge");
        let _ = writeln!(out, "edgemesh_claim_latency_ms{{quantile=\"0.5\"}} {p50}");
    }
    if let Some(p99) = summary.claim_latency_ms_p99 {
        let _ = writeln!(out, "edgemesh_claim_latency_ms{{quantile=\"0.99\"}} {p99}");
    }

    for (event_type, count) in &summary.event_counts {
        let _ = writeln!(out, "edgemesh_events_total{{type=\"{event_type}\"}} {count}");
    }

    if !summary.request_counts.is_empty() {
        let _ = writeln!(out, "# HELP edgemesh_requests_total Requests observed per caller-identity surface.");
        let _ = writeln!(out, "# TYPE edgemesh_requests_total counter");
        for (caller, count) in &summary.request_counts {
            let caller = escape_label_value(caller);
            let _ = writeln!(out, "edgemesh_requests_total{{caller=\"{caller}\"}} {count}");
        }
    }

    out
}

/// Escape a Prometheus label value: backslash and double-quote must be
/// escaped, newline likewise, per the text exposition format. Caller
/// identities flow in from node IDs and admin subjects, neither of which
/// are otherwise restricted to label-safe characters.
fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}
