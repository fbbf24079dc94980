//! Freshness Evaluator (spec section 4.2): a pure function mapping
//! `(lastHeartbeat, now, thresholds)` to a `FreshnessState`.

use chrono::{DateTime, Utc};

use crate::store::{FreshnessState, FreshnessThresholds, Heartbeat, HeartbeatStatus};

/// Evaluate a node's freshness given its last heartbeat (if any).
///
/// - No heartbeat → `offline`.
/// - `now - hb.ts > degraded_ms` → `offline`.
/// - `now - hb.ts > healthy_ms` → `degraded`.
/// - Else, degraded if the reported status itself is degraded, else healthy.
pub fn evaluate(
    last_heartbeat: Option<&Heartbeat>,
    now: DateTime<Utc>,
    thresholds: FreshnessThresholds,
) -> FreshnessState {
    let Some(hb) = last_heartbeat else {
        return FreshnessState::Offline;
    };

    let age_ms = (now - hb.ts).num_milliseconds();

    if age_ms > thresholds.degraded_ms {
        return FreshnessState::Offline;
    }
    if age_ms > thresholds.healthy_ms {
        return FreshnessState::Degraded;
    }
    match hb.status {
        HeartbeatStatus::Degraded => FreshnessState::Degraded,
        HeartbeatStatus::Healthy => FreshnessState::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(ts: DateTime<Utc>, status: HeartbeatStatus) -> Heartbeat {
        Heartbeat {
            ts,
            status,
            load: 0.1,
            running_tasks: 0,
        }
    }

    fn thresholds() -> FreshnessThresholds {
        FreshnessThresholds {
            healthy_ms: 60,
            degraded_ms: 180,
        }
    }

    #[test]
    fn no_heartbeat_is_offline() {
        let now = Utc::now();
        assert_eq!(evaluate(None, now, thresholds()), FreshnessState::Offline);
    }

    #[test]
    fn recent_healthy_heartbeat_is_healthy() {
        let now = Utc::now();
        let hb = hb(now - chrono::Duration::milliseconds(10), HeartbeatStatus::Healthy);
        assert_eq!(evaluate(Some(&hb), now, thresholds()), FreshnessState::Healthy);
    }

    #[test]
    fn recent_degraded_status_reports_degraded() {
        let now = Utc::now();
        let hb = hb(now - chrono::Duration::milliseconds(10), HeartbeatStatus::Degraded);
        assert_eq!(evaluate(Some(&hb), now, thresholds()), FreshnessState::Degraded);
    }

    #[test]
    fn s6_stale_node_transitions_through_degraded_to_offline() {
        let start = Utc::now();
        let hb = hb(start, HeartbeatStatus::Healthy);
        let after_80ms = start + chrono::Duration::milliseconds(80);
        assert_eq!(evaluate(Some(&hb), after_80ms, thresholds()), FreshnessState::Degraded);

        let after_200ms = start + chrono::Duration::milliseconds(200);
        assert_eq!(evaluate(Some(&hb), after_200ms, thresholds()), FreshnessState::Offline);
    }

    #[test]
    fn boundary_ages_are_exclusive() {
        let now = Utc::now();
        let t = thresholds();
        let hb_at_boundary = hb(now - chrono::Duration::milliseconds(t.healthy_ms), HeartbeatStatus::Healthy);
        assert_eq!(evaluate(Some(&hb_at_boundary), now, t), FreshnessState::Healthy);
    }
}
