//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request path
//!     → router.rs (upstream lookup)
//!     → matcher.rs (segment-aware prefix match)
//!     → Return: ResolvedRoute or None (ROUTE_NOT_FOUND)
//!
//! Table compilation (at startup):
//!     UpstreamConfig[]
//!     → Sort by prefix specificity
//!     → Freeze as immutable UpstreamTable
//! ```
//!
//! # Design Decisions
//! - The table is static configuration, immutable at runtime
//! - Prefix matching only, no regex in the hot path
//! - Deterministic: same input always resolves to the same upstream

pub mod matcher;
pub mod router;

pub use router::{ResolvedRoute, UpstreamTable};
