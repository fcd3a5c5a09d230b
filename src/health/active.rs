//! Active dependency probing.
//!
//! # Responsibilities
//! - Periodically probe each configured dependency role
//! - Drive the per-role state machine and record transitions
//! - Flip gateway readiness once every role is healthy

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;

use crate::backpressure::Readiness;
use crate::config::schema::HealthConfig;
use crate::health::state::{HealthState, RoleHealth};
use crate::observability::metrics::MetricsCollector;

/// One readiness check for a dependency.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self) -> Result<(), String>;
}

/// `GET <url>`; healthy on any 2xx.
pub struct HttpProbe {
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            url: url.into(),
            timeout,
            client,
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self) -> Result<(), String> {
        let request = Request::builder()
            .method("GET")
            .uri(&self.url)
            .header("user-agent", "kb-gateway-health-check")
            .body(Body::empty())
            .map_err(|e| format!("invalid probe request: {e}"))?;

        match time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) if response.status().is_success() => Ok(()),
            Ok(Ok(response)) => Err(format!("non-success status {}", response.status())),
            Ok(Err(e)) => Err(format!("connection error: {e}")),
            Err(_) => Err("timeout".to_string()),
        }
    }
}

struct Dependency {
    probe: Arc<dyn ReadinessProbe>,
    health: RwLock<RoleHealth>,
}

pub struct DependencyMonitor {
    dependencies: Vec<Dependency>,
    interval: Duration,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    readiness: Readiness,
    metrics: Arc<MetricsCollector>,
}

impl DependencyMonitor {
    pub fn new(config: &HealthConfig, readiness: Readiness, metrics: Arc<MetricsCollector>) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut monitor = Self {
            dependencies: Vec::new(),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            healthy_threshold: config.healthy_threshold,
            unhealthy_threshold: config.unhealthy_threshold,
            readiness,
            metrics,
        };
        for dep in &config.dependencies {
            monitor = monitor.with_probe(dep.role.clone(), Arc::new(HttpProbe::new(dep.url.clone(), timeout)));
        }
        monitor
    }

    pub fn with_probe(mut self, role: impl Into<String>, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.dependencies.push(Dependency {
            probe,
            health: RwLock::new(RoleHealth::new(role)),
        });
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn roles(&self) -> Vec<RoleHealth> {
        self.dependencies
            .iter()
            .map(|d| d.health.read().unwrap_or_else(|e| e.into_inner()).clone())
            .collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.dependencies
            .iter()
            .all(|d| d.health.read().unwrap_or_else(|e| e.into_inner()).is_healthy())
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.dependencies.is_empty() {
            tracing::info!("No dependencies configured, marking ready");
            self.readiness.mark_ready();
            return;
        }

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            dependencies = self.dependencies.len(),
            "Dependency monitor starting"
        );

        let mut ticker = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Dependency monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every dependency once.
    pub async fn check_all(&self) {
        for dep in &self.dependencies {
            let result = dep.probe.probe().await;
            let mut health = dep.health.write().unwrap_or_else(|e| e.into_inner());
            let transition = match result {
                Ok(()) => health.observe_success(self.healthy_threshold),
                Err(error) => {
                    tracing::debug!(role = %health.role, error = %error, "Dependency probe failed");
                    health.observe_failure(self.unhealthy_threshold, error)
                }
            };

            self.metrics.observe_health(&health.role, health.is_healthy());
            if let Some(state) = transition {
                let healthy = state == HealthState::Healthy;
                self.metrics.record_health_transition(&health.role, healthy);
                if healthy {
                    tracing::info!(role = %health.role, "Dependency became healthy");
                } else {
                    tracing::warn!(role = %health.role, error = ?health.last_error, "Dependency became unhealthy");
                }
            }
        }

        if self.all_healthy() {
            self.readiness.mark_ready();
        }
    }
}
