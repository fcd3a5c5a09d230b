//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Job attempt fails:
//!     → executor checks retryCount < maxRetries
//!     → backoff.rs computes the delay for this retry
//!     → executor sleeps (cancellable), then re-runs the attempt
//! ```
//!
//! # Design Decisions
//! - Deterministic by default; jitter is opt-in
//! - Every delay is capped

pub mod backoff;

pub use backoff::{BackoffKind, BackoffPolicy};
