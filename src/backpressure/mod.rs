//! Admission control ahead of business logic.
//!
//! # Data Flow
//! ```text
//! Request
//!     → startup.rs (not ready: wait up to timeout, or shed with 503; 504 on timeout)
//!     → rate_limit.rs (tenant + resource class → limiter → 429 or X-RateLimit-* headers)
//!     → header policy, handlers
//! ```
//!
//! # Design Decisions
//! - Both gates run before any handler and are configured independently
//! - Every rejection carries `Retry-After`
//! - Limiter outages fail open

pub mod rate_limit;
pub mod startup;

pub use rate_limit::{
    rate_limit_middleware, FixedWindowLimiter, RateLimitDecision, RateLimitError, RateLimiter, TenantContext,
    TenantRateLimiter,
};
pub use startup::{startup_guard_middleware, Readiness, StartupGuard};
