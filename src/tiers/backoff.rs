//! Exponential backoff with jitter for in-tier retries.

use std::time::Duration;

use rand::Rng;

/// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped at
/// `max`, plus up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let exponential = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(exponential).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::rng().random_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

/// Delay before retrying a rate-limited call: the upstream hint when present
/// (capped), otherwise normal backoff.
pub fn rate_limit_delay(
    retry_after: Option<Duration>,
    attempt: u32,
    base: Duration,
    cap: Duration,
) -> Duration {
    match retry_after {
        Some(hint) => hint.min(cap),
        None => calculate_backoff(attempt, base, cap),
    }
}
