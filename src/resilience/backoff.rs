//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::proxy::error::ProxyError;

/// Default first retry delay.
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retry delays never exceed this.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Calculate exponential backoff delay with jitter.
///
/// `base_ms * 2^(attempt - 1)` plus 0–10% jitter, never more than `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..=jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay.saturating_add(jitter).min(max_ms))
}

/// Delay before retry number `attempt` (1-based) of a failed call.
/// Non-retryable errors get no delay.
pub fn retry_delay(error: &ProxyError, attempt: u32) -> Duration {
    retry_delay_from(BASE_RETRY_DELAY, error, attempt)
}

/// Like [`retry_delay`] with a caller-chosen base delay.
pub fn retry_delay_from(base: Duration, error: &ProxyError, attempt: u32) -> Duration {
    if !error.retryable {
        return Duration::ZERO;
    }
    calculate_backoff(
        attempt,
        base.as_millis() as u64,
        MAX_RETRY_DELAY.as_millis() as u64,
    )
}
