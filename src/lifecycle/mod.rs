//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build metrics, header policy, queue, executor,
//!     guards → Spawn workers, dependency monitor, config watcher → Bind listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Close queue → Workers drain → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Fail fast: any startup error is fatal
//! - Shutdown has a deadline: workers still busy after it are abandoned

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Gateway, GatewayBuilder, StartupError};
