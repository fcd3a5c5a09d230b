//! Dependency health subsystem.
//!
//! # Data Flow
//! ```text
//! Periodic timer (active.rs)
//!     → probe each dependency role (registry, snapshot, ...)
//!     → state.rs (hysteresis)
//!     → metrics: transitions + rolling per-role histogram
//!     → all roles healthy → Readiness::mark_ready (startup guard opens)
//! ```

pub mod active;
pub mod state;

pub use active::{DependencyMonitor, HttpProbe, ReadinessProbe};
pub use state::{HealthState, RoleHealth};
