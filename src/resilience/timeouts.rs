//! Timeout enforcement.
//!
//! # Responsibilities
//! - Size proxied call deadlines from the request body length
//! - Thread one deadline and one cancellation token through every
//!   suspension point of a call (upstream send, backoff sleep)
//!
//! # Design Decisions
//! - Uses Tokio's timer and `tokio_util`'s `CancellationToken`
//! - A call has a single deadline; retries spend from the same budget
//! - Cancellation and deadline both unblock the same wait

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TimeoutConfig;

/// Call budget scaled by payload size.
///
/// Without a length the base timeout applies. With one, each started
/// `min_throughput_bytes_per_ms` chunk adds a millisecond, up to `max_ms`.
pub fn dynamic_timeout(config: &TimeoutConfig, content_length: Option<u64>) -> Duration {
    let base = config.base_ms;
    let ms = match content_length {
        None | Some(0) => base,
        Some(len) => {
            let per_ms = config.min_throughput_bytes_per_ms.max(1);
            base.saturating_add(len.div_ceil(per_ms))
        }
    };
    Duration::from_millis(ms.min(config.max_ms.max(base)))
}

/// Why a wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The call budget ran out.
    DeadlineElapsed(Duration),
    /// The caller abandoned the call.
    Cancelled,
}

/// Deadline and cancellation shared by every await of one proxied call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    budget: Duration,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(budget: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + budget,
            budget,
            cancel,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Drive `fut` until it completes, the deadline passes or the call is cancelled.
    /// An interrupted future is dropped, closing whatever connection it held.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            out = fut => Ok(out),
            _ = tokio::time::sleep_until(self.deadline) => Err(Interrupted::DeadlineElapsed(self.budget)),
        }
    }

    /// Sleep for `delay`, waking early on deadline or cancellation.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(delay)).await
    }
}
