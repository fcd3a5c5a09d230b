//! Per-request enforcement state and the decision debug ring.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::observability::metrics::{HeaderPolicyCounts, MetricsCollector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why a header was kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    HopByHop,
    DenyList,
    NotAllowed,
    DefaultAllow,
    DefaultDeny,
    AllowList,
    System,
    RuleForward,
    RuleStrip,
    TransformEmpty,
    TransformError,
    Validator(&'static str),
    RequiredMissing,
    SensitiveStrip,
}

impl DecisionReason {
    pub fn code(&self) -> String {
        match self {
            DecisionReason::HopByHop => "hop-by-hop".into(),
            DecisionReason::DenyList => "deny-list".into(),
            DecisionReason::NotAllowed => "not-allowed".into(),
            DecisionReason::DefaultAllow => "default-allow".into(),
            DecisionReason::DefaultDeny => "default-deny".into(),
            DecisionReason::AllowList => "allow-list".into(),
            DecisionReason::System => "system".into(),
            DecisionReason::RuleForward => "rule-forward".into(),
            DecisionReason::RuleStrip => "rule-strip".into(),
            DecisionReason::TransformEmpty => "transform-empty".into(),
            DecisionReason::TransformError => "transform-error".into(),
            DecisionReason::Validator(kind) => format!("validator-{kind}"),
            DecisionReason::RequiredMissing => "required-missing".into(),
            DecisionReason::SensitiveStrip => "sensitive-strip".into(),
        }
    }
}

impl Serialize for DecisionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderDecision {
    pub header: String,
    pub direction: Direction,
    pub kept: bool,
    pub reason: DecisionReason,
}

/// Everything the engine learns about one request.
#[derive(Debug, Default)]
pub struct EnforcementState {
    /// Canonical names for the response `Vary` header.
    pub vary: BTreeSet<String>,
    pub sensitive: BTreeSet<String>,
    /// First value of each `rateLimitKey` header.
    pub rate_limit_keys: BTreeMap<String, String>,
    pub sanitized: HeaderMap,

    pub kept: u64,
    pub dropped: u64,
    pub validation_errors: u64,
    pub sensitive_inbound: u64,
    pub vary_applied: u64,
    pub dry_run_decisions: u64,

    decisions: Option<Vec<HeaderDecision>>,
    flushed: bool,
}

impl EnforcementState {
    pub fn new(record_decisions: bool) -> Self {
        Self {
            decisions: record_decisions.then(Vec::new),
            ..Self::default()
        }
    }

    pub fn record(&mut self, header: &str, direction: Direction, kept: bool, reason: DecisionReason) {
        if kept {
            self.kept += 1;
        } else {
            self.dropped += 1;
        }
        if let Some(decisions) = self.decisions.as_mut() {
            tracing::debug!(
                header = %header,
                direction = ?direction,
                kept,
                reason = %reason.code(),
                "Header decision"
            );
            decisions.push(HeaderDecision {
                header: header.to_string(),
                direction,
                kept,
                reason,
            });
        }
    }

    pub fn decisions(&self) -> &[HeaderDecision] {
        self.decisions.as_deref().unwrap_or_default()
    }

    pub fn take_decisions(&mut self) -> Vec<HeaderDecision> {
        self.decisions.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Push counters into metrics. Only the first call counts.
    pub fn flush(&mut self, metrics: &MetricsCollector, plugin_id: &str, dry_run: bool) -> bool {
        if self.flushed {
            return false;
        }
        self.flushed = true;
        if dry_run {
            self.dry_run_decisions = self.kept + self.dropped;
        }
        metrics.record_header_policy(
            plugin_id,
            HeaderPolicyCounts {
                filtered_in: self.kept,
                filtered_out: self.dropped,
                sensitive_inbound: self.sensitive_inbound,
                validation_errors: self.validation_errors,
                vary_applied: self.vary_applied,
                dry_run_decisions: self.dry_run_decisions,
            },
        );
        true
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub method: String,
    pub path: String,
    pub plugin_id: String,
    pub dry_run: bool,
    pub decisions: Vec<HeaderDecision>,
}

/// Bounded most-recent-first log of header decisions.
#[derive(Debug)]
pub struct DebugRing {
    capacity: usize,
    entries: Mutex<VecDeque<DebugEntry>>,
}

impl DebugRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, entry: DebugEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    pub fn snapshot(&self, limit: Option<usize>) -> Vec<DebugEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let limit = limit.unwrap_or(self.capacity);
        entries.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
