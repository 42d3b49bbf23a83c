//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (request ID)
//!     → [authenticator, rate limiter] (security)
//!     → [upstream table, circuit breaker, stream proxy]
//!     → response.rs (gateway errors, rate limit headers)
//!     → Send to client
//! ```

pub mod multipart;
pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{GatewayState, HttpServer};
