//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::headers::manifest::HeaderPolicyManifest;
use crate::headers::EnforcementMode;
use crate::resilience::backoff::BackoffPolicy;

/// Root configuration for the gateway control plane.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limits).
    pub listener: ListenerConfig,

    /// Startup guard settings.
    pub startup: StartupConfig,

    /// Tenant rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Header policy enforcement.
    pub headers: HeadersConfig,

    /// Job queue and executor settings.
    pub jobs: JobsConfig,

    /// Event bridge settings.
    pub events: EventsConfig,

    /// Dependency health probing.
    pub health: HealthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Startup guard: admission while downstream infrastructure is not ready.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Enable the guard. When disabled the gateway is treated as ready.
    pub enabled: bool,

    /// Maximum requests tracked by the guard while not ready.
    pub max_concurrent: usize,

    /// Maximum requests held waiting for readiness.
    pub queue_limit: usize,

    /// Per-request wait budget in milliseconds before answering 504.
    pub timeout_ms: u64,

    /// Value of the `Retry-After` header on 503/504, in seconds.
    pub retry_after_secs: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 32,
            queue_limit: 128,
            timeout_ms: 5_000,
            retry_after_secs: 2,
        }
    }
}

/// Tenant rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Tenant used when neither the header nor the environment names one.
    pub default_tenant: String,

    /// Requests allowed per window for tenants without an override.
    pub requests_per_window: u32,

    /// Window length in seconds.
    pub window_secs: u64,

    /// Per-tenant limit overrides.
    pub tenants: HashMap<String, u32>,

    /// Resource classes keyed by path prefix (longest prefix wins).
    pub classes: Vec<ResourceClassRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_tenant: "default".to_string(),
            requests_per_window: 600,
            window_secs: 60,
            tenants: HashMap::new(),
            classes: Vec::new(),
        }
    }
}

/// Maps a path prefix onto a rate-limit resource class.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceClassRule {
    pub path_prefix: String,
    pub class: String,
}

/// Header policy enforcement configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Enforcement mode (`off`, `debug`, `dry-run`).
    pub mode: EnforcementMode,

    /// Capacity of the decision debug ring.
    pub debug_buffer_size: usize,

    /// Policies attached to route prefixes.
    pub policies: Vec<RoutePolicyConfig>,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Off,
            debug_buffer_size: 200,
            policies: Vec::new(),
        }
    }
}

/// A header policy manifest bound to a route prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutePolicyConfig {
    /// Path prefix the policy governs.
    pub route_prefix: String,

    /// The plugin-declared policy.
    pub manifest: HeaderPolicyManifest,
}

/// Job queue and executor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Number of executor worker tasks.
    pub workers: usize,

    /// Retries applied when the enqueue call does not specify them.
    pub default_max_retries: u32,

    /// Job deadline applied when the enqueue call does not specify one.
    pub default_timeout_ms: Option<u64>,

    /// Idempotency dedup window in seconds.
    pub dedup_window_secs: u64,

    /// Retry backoff between attempts.
    pub backoff: BackoffPolicy,

    /// Working directory handed to handlers.
    pub execution_root: String,

    /// Root directory of the filesystem artifact store.
    pub artifact_root: String,

    /// Command line executed for each job kind, keyed by kind name.
    pub commands: HashMap<String, CommandSpec>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_retries: 0,
            default_timeout_ms: None,
            dedup_window_secs: 24 * 3600,
            backoff: BackoffPolicy::default(),
            execution_root: ".".to_string(),
            artifact_root: ".kb/artifacts".to_string(),
            commands: HashMap::new(),
        }
    }
}

/// Program and fixed arguments for a job kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Event bridge configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Ring buffer capacity per run.
    pub buffer_capacity: usize,

    /// SSE keep-alive interval in seconds.
    pub keep_alive_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 500,
            keep_alive_secs: 15,
        }
    }
}

/// Dependency health configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable active dependency probing.
    pub enabled: bool,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Probe timeout in seconds.
    pub timeout_secs: u64,

    /// Consecutive failures before a role is marked unhealthy.
    pub unhealthy_threshold: u32,

    /// Consecutive successes before a role is marked healthy.
    pub healthy_threshold: u32,

    /// Dependencies that must be healthy before the gateway is ready.
    pub dependencies: Vec<DependencyConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 5,
            timeout_secs: 2,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            dependencies: Vec::new(),
        }
    }
}

/// A probed dependency.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DependencyConfig {
    /// Role name (e.g., "registry", "snapshot").
    pub role: String,

    /// URL probed with an HTTP GET.
    pub url: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Latency budgets in milliseconds keyed by normalized route.
    pub sla_budgets_ms: HashMap<String, u64>,

    /// Distinct tenant labels before further tenants are counted as `other`.
    pub max_tenant_labels: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            sla_budgets_ms: HashMap::new(),
            max_tenant_labels: 100,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
