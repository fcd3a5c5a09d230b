//! Header policy enforcement subsystem.
//!
//! # Data Flow
//! ```text
//! Policy compilation (at startup / on reload):
//!     HeaderPolicyManifest (plugin-declared)
//!     → rule.rs (exact/pattern matchers, transforms, validators)
//!     → policy.rs (CompiledHeaderPolicy, PolicyRegistry by route prefix)
//!
//! Per request (middleware.rs):
//!     Request headers
//!     → engine.rs inbound pass (hop-by-hop, deny, first rule wins, fallbacks,
//!       transforms, validators, required check)
//!     → state.rs EnforcementState (vary, sensitive, rate-limit keys, counters)
//!     → sanitized map replaces request headers (unless dry-run)
//!     → handler
//!     → engine.rs outbound pass (fixed strips, Vary, CORS, HSTS)
//!     → state flushed once into metrics, decisions into the debug ring
//! ```
//!
//! # Design Decisions
//! - Rules compile once into a lookup structure; no per-request closures
//! - Custom transforms resolve once per plugin root at compile time
//! - Unmatched headers fall through to the default posture, never error
//! - Outbound failures degrade to stripping; they never fail a response

pub mod engine;
pub mod manifest;
pub mod middleware;
pub mod policy;
pub mod rule;
pub mod state;
pub mod transform;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use engine::{HeaderPolicyEngine, HeaderPolicyError};
pub use manifest::{HeaderAction, HeaderPolicyManifest, HeaderRuleSpec};
pub use policy::{CompiledHeaderPolicy, PolicyRegistry};
pub use state::{DebugRing, EnforcementState, HeaderDecision};

/// How the engine applies its decisions. Selected per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementMode {
    /// Enforce, no decision log.
    #[default]
    Off,
    /// Enforce and record every decision.
    Debug,
    /// Record every decision, never block, never mutate headers.
    DryRun,
}

impl EnforcementMode {
    pub fn records_decisions(self) -> bool {
        !matches!(self, EnforcementMode::Off)
    }

    pub fn is_dry_run(self) -> bool {
        matches!(self, EnforcementMode::DryRun)
    }
}

impl FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "0" | "false" => Ok(EnforcementMode::Off),
            "debug" | "1" | "true" => Ok(EnforcementMode::Debug),
            "dry-run" | "dryrun" | "dry_run" => Ok(EnforcementMode::DryRun),
            other => Err(format!("unknown header debug mode: {other}")),
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnforcementMode::Off => "off",
            EnforcementMode::Debug => "debug",
            EnforcementMode::DryRun => "dry-run",
        })
    }
}

/// Connection-scoped headers that never cross the gateway.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
];

/// Tracing and control headers allowed through when no rule matches.
pub const SYSTEM_HEADERS: &[&str] = &[
    "x-request-id",
    "traceparent",
    "tracestate",
    "x-trace-id",
    "x-span-id",
    "baggage",
    "x-tenant-id",
    "idempotency-key",
    "kb-mock",
];

/// Inbound headers admitted under the `allow-safe` posture.
pub const SAFE_INBOUND: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "content-type",
    "content-length",
    "user-agent",
    "host",
    "cache-control",
    "if-none-match",
    "if-modified-since",
    "last-event-id",
    "origin",
    "referer",
];

/// Response headers admitted under the `allow-safe` posture.
pub const SAFE_OUTBOUND: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "location",
    "retry-after",
    "vary",
    "date",
    "x-request-id",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
];

/// Headers treated as sensitive even without a rule saying so.
pub const DEFAULT_SENSITIVE: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

pub fn is_system_header(name: &str) -> bool {
    SYSTEM_HEADERS.contains(&name)
}

pub fn is_default_sensitive(name: &str) -> bool {
    DEFAULT_SENSITIVE.contains(&name)
}

/// Title-case a lowercase header name: `x-api-key` → `X-Api-Key`.
pub fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
