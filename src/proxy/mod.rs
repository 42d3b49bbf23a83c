//! Streaming proxy subsystem.
//!
//! # Data Flow
//! ```text
//! http/server.rs (route resolved, breaker admitted)
//!     → stream.rs (validate, deadline, attempt loop)
//!     → transport.rs (hyper client)
//!     → error.rs (classify failures)
//!     → ProxyResponse | ProxyError
//! ```

pub mod body;
pub mod error;
pub mod stream;
pub mod transport;
pub mod types;

pub use error::{classify, is_retryable, ClassifyContext, ErrorCode, ProxyError, RawError};
pub use stream::StreamProxy;
pub use transport::{HyperTransport, Transport};
pub use types::{ProxyConfig, ProxyRequest, ProxyResponse};
