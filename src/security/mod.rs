//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → access_control.rs (resolve caller, reject bad credentials)
//!     → rate_limit.rs (per-tier, per-client budgets)
//!         → tiers.rs (which budget applies)
//!         → store.rs / redis_store.rs (counters)
//!     → headers.rs (sanitize, add X-Forwarded-For, identity headers)
//!     → Pass to routing
//! ```
//!
//! # Design Decisions
//! - Client-supplied identity headers are never trusted
//! - Rate limiting fails open when its store is unavailable

pub mod access_control;
pub mod headers;
pub mod rate_limit;
pub mod redis_store;
pub mod store;
pub mod tiers;

pub use access_control::{Authenticator, StaticTokenAuthenticator, UserContext};
pub use rate_limit::{RateLimitDecision, RateLimiter, TierStatus};
pub use tiers::{Tier, TierPolicy, TierRule, TierTable};
