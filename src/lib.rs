//! kb gateway: HTTP control plane for knowledge-base jobs.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ trace / request id / body limit / metrics / panic boundary
//!                          │
//!                          ▼
//!                   ┌──────────────┐   not ready    ┌─────────────┐
//!                   │ startup guard│ ─────────────▶ │ 503 / 504   │
//!                   └──────┬───────┘                └─────────────┘
//!                          ▼
//!                   ┌──────────────┐   over limit   ┌─────────────┐
//!                   │  rate limit  │ ─────────────▶ │ 429         │
//!                   └──────┬───────┘                └─────────────┘
//!                          ▼
//!                   ┌──────────────┐   violation    ┌─────────────┐
//!                   │ header policy│ ─────────────▶ │ 400         │
//!                   └──────┬───────┘                └─────────────┘
//!                          ▼
//!                   ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//!                   │ jobs routes  │ ──▶ │  job queue   │ ──▶ │   executor   │
//!                   └──────────────┘     └──────┬───────┘     └──────┬───────┘
//!                                               │ lifecycle events   │ artifacts
//!                                               ▼                    ▼
//!                                        ┌──────────────┐     ┌──────────────┐
//!     SSE clients ◀───────────────────── │ event bridge │     │ artifact dir │
//!                                        └──────────────┘     └──────────────┘
//!
//!     Cross-cutting: config (+ watcher), health monitor, observability,
//!     resilience (backoff), lifecycle (startup / shutdown), admin API
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod jobs;
pub mod events;

// Request admission
pub mod backpressure;
pub mod headers;
pub mod health;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::{Gateway, GatewayBuilder, Shutdown};
