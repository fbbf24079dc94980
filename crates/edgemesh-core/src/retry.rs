//! Retry Policy (spec section 4.5): pure exponential backoff with jitter.

/// Tunables for [`decide`]. Defaults match spec.md section 4.5/6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// Normalizes inputs per spec.md ("floor 1", "floor = base", "clamped to
    /// [0, 0.5]") so callers can pass raw config without double-checking it.
    fn normalized(&self) -> RetryConfig {
        let base = self.base_delay_ms.max(1);
        RetryConfig {
            base_delay_ms: base,
            max_delay_ms: self.max_delay_ms.max(base),
            jitter_ratio: self.jitter_ratio.clamp(0.0, 0.5),
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_ms: u64,
    pub to_dlq: bool,
}

/// Decide whether a failed attempt should be retried, and if so, after how
/// long. Pure and deterministic given the same inputs.
///
/// `attempt` is 1-based (the attempt number that just failed).
pub fn decide(attempt: u32, max_attempts: u32, config: RetryConfig) -> RetryDecision {
    let config = config.normalized();

    if attempt >= max_attempts {
        return RetryDecision {
            retry: false,
            delay_ms: 0,
            to_dlq: true,
        };
    }

    let exponent = attempt.saturating_sub(1);
    let scaled = config.base_delay_ms.saturating_mul(1u64 << exponent.min(63));
    let exp = scaled.min(config.max_delay_ms);
    let jitter = (exp as f64 * config.jitter_ratio).round() as u64;

    RetryDecision {
        retry: true,
        delay_ms: exp + jitter,
        to_dlq: false,
    }
}
