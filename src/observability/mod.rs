//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Request pipeline, header engine, executor, health monitor:
//!     → metrics.rs MetricsCollector (injected, snapshot + reset)
//!         → `metrics` facade → Prometheus exporter (optional)
//!         → /admin/metrics JSON snapshot
//!     → logging.rs (structured tracing events)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems
//! - Metrics are cheap (atomic increments, sharded maps)

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{normalize_route, MetricsCollector, MetricsSnapshot};
