//! HTTP surface of the gateway.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layer stack)
//!     → request.rs (request id)
//!     → middleware/metrics.rs (counts, latency, error codes)
//!     → backpressure (startup guard, tenant rate limit)
//!     → header policy
//!     → jobs.rs (job control + event streams)
//!     → response.rs (error envelope)
//! ```

pub mod jobs;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::X_REQUEST_ID;
pub use response::{ApiError, ErrorCode};
pub use server::{build_router, AppState, GatewayServer};
