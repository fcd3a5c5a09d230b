//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Aggregate request, latency, error, header-policy, health and job counters
//! - Mirror every counter to the `metrics` facade for Prometheus scraping
//! - Serve a JSON snapshot for the admin API
//!
//! # Metrics
//! - `kb_gateway_requests_total` (counter): by method, status class, route, tenant
//! - `kb_gateway_request_duration_seconds` (histogram): by route
//! - `kb_gateway_errors_total` (counter): by error code
//! - `kb_gateway_header_decisions_total` (counter): by plugin, kind
//! - `kb_gateway_dependency_transitions_total` (counter): by role, from, to
//! - `kb_gateway_jobs_total` (counter): by kind, status
//!
//! # Design Decisions
//! - Constructed once and injected; no process-wide collector
//! - Counters are monotonic within a reset epoch; `reset()` starts a new one
//! - Routes are normalized before bucketing to bound label cardinality;
//!   unrouted paths share one label
//! - Tenant labels are capped; tenants past the cap share `other`. The cap
//!   outlives `reset()` because exported series are never withdrawn

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use serde::Serialize;

/// Per-role health observations kept for the rolling histogram.
const HEALTH_WINDOW: usize = 100;

/// Placeholder for identifier-like path segments.
const ID_PLACEHOLDER: &str = ":id";

/// Route label for requests no handler matched.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Tenant label once the distinct-tenant limit is reached.
pub const OVERFLOW_TENANT: &str = "other";

/// Distinct tenant labels tracked when no limit is configured.
pub const DEFAULT_TENANT_LABELS: usize = 100;

/// Install the Prometheus exporter on `addr`.
pub fn init_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Replace identifier-like segments (numbers, UUIDs, hex tokens) with `:id`.
pub fn normalize_route(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let segments: Vec<&str> = path
        .trim_end_matches('/')
        .split('/')
        .map(|seg| if looks_like_id(seg) { ID_PLACEHOLDER } else { seg })
        .collect();
    segments.join("/")
}

fn looks_like_id(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    let hex_or_dash = segment.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-');
    let has_digit = segment.bytes().any(|b| b.is_ascii_digit());
    // UUIDs and long hex tokens (hashes, object ids).
    hex_or_dash && has_digit && segment.len() >= 8
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLabels {
    pub method: String,
    pub status_class: &'static str,
    pub route: String,
    pub tenant: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestCount {
    #[serde(flatten)]
    pub labels: RequestLabels,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: u64,
    pub sum_ms: u64,
    pub max_ms: u64,
    pub budget_ms: Option<u64>,
    pub over_budget: u64,
}

/// Header-policy counters for one request, or accumulated per plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPolicyCounts {
    pub filtered_in: u64,
    pub filtered_out: u64,
    pub sensitive_inbound: u64,
    pub validation_errors: u64,
    pub vary_applied: u64,
    pub dry_run_decisions: u64,
}

impl HeaderPolicyCounts {
    fn merge(&mut self, other: &HeaderPolicyCounts) {
        self.filtered_in += other.filtered_in;
        self.filtered_out += other.filtered_out;
        self.sensitive_inbound += other.sensitive_inbound;
        self.validation_errors += other.validation_errors;
        self.vary_applied += other.vary_applied;
        self.dry_run_decisions += other.dry_run_decisions;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthTransition {
    pub role: String,
    pub from: &'static str,
    pub to: &'static str,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleHistogram {
    pub healthy: u64,
    pub unhealthy: u64,
    pub window: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub epoch_started_at: DateTime<Utc>,
    pub requests: Vec<RequestCount>,
    pub latency: BTreeMap<String, LatencyStats>,
    pub errors: BTreeMap<String, u64>,
    pub headers: BTreeMap<String, HeaderPolicyCounts>,
    pub health_transitions: Vec<HealthTransition>,
    pub health_roles: BTreeMap<String, RoleHistogram>,
    pub jobs: BTreeMap<String, BTreeMap<String, u64>>,
    pub admission: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.requests.iter().map(|r| r.count).sum()
    }
}

/// In-process metrics sink shared by the request pipeline and the executor.
pub struct MetricsCollector {
    requests: DashMap<RequestLabels, AtomicU64>,
    latency: DashMap<String, LatencyStats>,
    errors: DashMap<String, AtomicU64>,
    headers: DashMap<String, HeaderPolicyCounts>,
    transitions: DashMap<(String, &'static str, &'static str), AtomicU64>,
    health_window: DashMap<String, VecDeque<bool>>,
    jobs: DashMap<(String, String), AtomicU64>,
    admission: DashMap<String, AtomicU64>,
    sla_budgets: HashMap<String, u64>,
    tenants: DashSet<String>,
    max_tenants: usize,
    epoch_started_at: Mutex<DateTime<Utc>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_sla_budgets(HashMap::new())
    }

    /// Budgets are keyed by normalized route, in milliseconds.
    pub fn with_sla_budgets(sla_budgets: HashMap<String, u64>) -> Self {
        Self {
            requests: DashMap::new(),
            latency: DashMap::new(),
            errors: DashMap::new(),
            headers: DashMap::new(),
            transitions: DashMap::new(),
            health_window: DashMap::new(),
            jobs: DashMap::new(),
            admission: DashMap::new(),
            sla_budgets,
            tenants: DashSet::new(),
            max_tenants: DEFAULT_TENANT_LABELS,
            epoch_started_at: Mutex::new(Utc::now()),
        }
    }

    pub fn with_tenant_limit(mut self, max_tenants: usize) -> Self {
        self.max_tenants = max_tenants;
        self
    }

    /// The tenant's own label while under the cap, otherwise `other`.
    fn tenant_label(&self, tenant: &str) -> String {
        if self.tenants.contains(tenant) {
            return tenant.to_string();
        }
        if self.tenants.len() < self.max_tenants {
            self.tenants.insert(tenant.to_string());
            return tenant.to_string();
        }
        OVERFLOW_TENANT.to_string()
    }

    pub fn sla_budget(&self, route: &str) -> Option<u64> {
        self.sla_budgets.get(route).copied()
    }

    pub fn record_request(&self, method: &str, status: u16, path: &str, tenant: &str, elapsed: Duration) {
        let route = normalize_route(path);
        let labels = RequestLabels {
            method: method.to_string(),
            status_class: status_class(status),
            route: route.clone(),
            tenant: self.tenant_label(tenant),
        };

        metrics::counter!(
            "kb_gateway_requests_total",
            "method" => labels.method.clone(),
            "status" => labels.status_class,
            "route" => route.clone(),
            "tenant" => labels.tenant.clone()
        )
        .increment(1);
        metrics::histogram!("kb_gateway_request_duration_seconds", "route" => route.clone())
            .record(elapsed.as_secs_f64());

        self.requests
            .entry(labels)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let elapsed_ms = elapsed.as_millis() as u64;
        let budget = self.sla_budget(&route);
        let mut stats = self.latency.entry(route.clone()).or_default();
        stats.count += 1;
        stats.sum_ms += elapsed_ms;
        stats.max_ms = stats.max_ms.max(elapsed_ms);
        stats.budget_ms = budget;
        if budget.is_some_and(|b| elapsed_ms > b) {
            stats.over_budget += 1;
            tracing::debug!(route = %route, elapsed_ms, budget_ms = ?budget, "Request exceeded SLA budget");
        }
    }

    pub fn record_error(&self, code: &str) {
        metrics::counter!("kb_gateway_errors_total", "code" => code.to_string()).increment(1);
        self.errors
            .entry(code.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_header_policy(&self, plugin_id: &str, counts: HeaderPolicyCounts) {
        let mirror = [
            ("filtered_in", counts.filtered_in),
            ("filtered_out", counts.filtered_out),
            ("sensitive_inbound", counts.sensitive_inbound),
            ("validation_errors", counts.validation_errors),
            ("vary_applied", counts.vary_applied),
            ("dry_run", counts.dry_run_decisions),
        ];
        for (kind, value) in mirror {
            if value > 0 {
                metrics::counter!(
                    "kb_gateway_header_decisions_total",
                    "plugin" => plugin_id.to_string(),
                    "kind" => kind
                )
                .increment(value);
            }
        }
        self.headers
            .entry(plugin_id.to_string())
            .or_default()
            .merge(&counts);
    }

    /// A dependency role flipped between healthy and unhealthy.
    pub fn record_health_transition(&self, role: &str, healthy: bool) {
        let (from, to) = if healthy {
            ("unhealthy", "healthy")
        } else {
            ("healthy", "unhealthy")
        };
        metrics::counter!(
            "kb_gateway_dependency_transitions_total",
            "role" => role.to_string(),
            "from" => from,
            "to" => to
        )
        .increment(1);
        self.transitions
            .entry((role.to_string(), from, to))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// One probe observation for the rolling per-role histogram.
    pub fn observe_health(&self, role: &str, healthy: bool) {
        metrics::gauge!("kb_gateway_dependency_healthy", "role" => role.to_string())
            .set(if healthy { 1.0 } else { 0.0 });
        let mut window = self.health_window.entry(role.to_string()).or_default();
        window.push_back(healthy);
        while window.len() > HEALTH_WINDOW {
            window.pop_front();
        }
    }

    pub fn record_job(&self, kind: &str, status: &str) {
        metrics::counter!(
            "kb_gateway_jobs_total",
            "kind" => kind.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        self.jobs
            .entry((kind.to_string(), status.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Admission outcome from a backpressure gate, e.g. `startup_rejected`.
    pub fn record_admission(&self, outcome: &str) {
        metrics::counter!("kb_gateway_admission_total", "outcome" => outcome.to_string()).increment(1);
        self.admission
            .entry(outcome.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut requests: Vec<RequestCount> = self
            .requests
            .iter()
            .map(|e| RequestCount {
                labels: e.key().clone(),
                count: e.value().load(Ordering::Relaxed),
            })
            .collect();
        requests.sort_by(|a, b| a.labels.cmp(&b.labels));

        let mut health_transitions: Vec<HealthTransition> = self
            .transitions
            .iter()
            .map(|e| {
                let (role, from, to) = e.key();
                HealthTransition {
                    role: role.clone(),
                    from,
                    to,
                    count: e.value().load(Ordering::Relaxed),
                }
            })
            .collect();
        health_transitions.sort_by(|a, b| (&a.role, a.from).cmp(&(&b.role, b.from)));

        let health_roles = self
            .health_window
            .iter()
            .map(|e| {
                let healthy = e.value().iter().filter(|h| **h).count() as u64;
                let total = e.value().len();
                (
                    e.key().clone(),
                    RoleHistogram {
                        healthy,
                        unhealthy: total as u64 - healthy,
                        window: total,
                    },
                )
            })
            .collect();

        let mut jobs: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for e in self.jobs.iter() {
            let (kind, status) = e.key();
            jobs.entry(kind.clone())
                .or_default()
                .insert(status.clone(), e.value().load(Ordering::Relaxed));
        }

        MetricsSnapshot {
            epoch_started_at: *self.epoch_started_at.lock().unwrap_or_else(|e| e.into_inner()),
            requests,
            latency: self.latency.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            errors: counters(&self.errors),
            headers: self.headers.iter().map(|e| (e.key().clone(), *e.value())).collect(),
            health_transitions,
            health_roles,
            jobs,
            admission: counters(&self.admission),
        }
    }

    /// Clear every counter and start a new epoch.
    pub fn reset(&self) {
        self.requests.clear();
        self.latency.clear();
        self.errors.clear();
        self.headers.clear();
        self.transitions.clear();
        self.health_window.clear();
        self.jobs.clear();
        self.admission.clear();
        *self.epoch_started_at.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
        tracing::info!("Metrics reset");
    }
}

fn counters(map: &DashMap<String, AtomicU64>) -> BTreeMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}
