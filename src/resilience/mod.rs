//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to an upstream:
//!     → registry.rs (find the service's breaker)
//!     → circuit_breaker.rs (fail fast while open)
//!     → timeouts.rs (one deadline + cancellation for the whole call)
//!     → On failure: backoff.rs (exponential delay with jitter), retry
//!     → circuit_breaker.rs (record outcome)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream call has a deadline
//! - Retries spend from the call's deadline, never extend it
//! - Circuit breaker prevents cascading failures and is never retried past

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod timeouts;

pub use circuit_breaker::{BreakerError, BreakerStatistics, CircuitBreaker, CircuitOpen, CircuitState};
pub use registry::CircuitBreakerRegistry;
pub use timeouts::{dynamic_timeout, CallContext, Interrupted};
