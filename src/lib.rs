//! Resilient API gateway library.
//!
//! Circuit breakers, tiered rate limiting and a retrying streaming proxy in
//! front of a static set of upstream services.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod resilience;
pub mod routing;
pub mod security;

pub use config::GatewayConfig;
pub use http::{GatewayState, HttpServer};
pub use lifecycle::{Gateway, Shutdown};
