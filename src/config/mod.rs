//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, deserialize, apply KB_* environment overrides)
//!     → validation.rs (semantic checks, policy manifests compile)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → header policies recompiled and swapped atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only header policies hot-reload
//! - All fields have defaults to allow minimal configs
//! - Debug/dry-run is a deployment-level setting, never per request

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::AdminConfig;
pub use schema::GatewayConfig;
pub use schema::HeadersConfig;
pub use schema::HealthConfig;
pub use schema::JobsConfig;
pub use schema::ObservabilityConfig;
pub use schema::RateLimitConfig;
pub use schema::StartupConfig;
