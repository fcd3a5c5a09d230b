//! Cross-cutting request middleware owned by the HTTP layer.

pub mod metrics;

pub use metrics::metrics_middleware;
