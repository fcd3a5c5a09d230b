//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Build every subsystem in dependency order and hand back the shared state
//! - Start background tasks (job workers, dependency monitor, config watcher)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listeners start last; the startup guard covers the gap until
//!   dependencies report healthy
//! - The header enforcement mode is fixed at startup; reloads swap policies only

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::setup_admin_router;
use crate::backpressure::{FixedWindowLimiter, RateLimiter, Readiness, StartupGuard, TenantRateLimiter};
use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::config::watcher::ConfigWatcher;
use crate::events::EventBridge;
use crate::headers::policy::PolicyRegistry;
use crate::headers::rule::PolicyCompileError;
use crate::headers::state::DebugRing;
use crate::headers::transform::TransformCatalog;
use crate::headers::HeaderPolicyEngine;
use crate::health::{DependencyMonitor, ReadinessProbe};
use crate::http::server::{AppState, GatewayServer};
use crate::jobs::{
    ArtifactStore, CommandHandler, CommandRunner, FsArtifactStore, JobExecutor, JobHandler, JobQueue, ProcessRunner,
    QueueSettings,
};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::spawn_signal_handler;
use crate::observability::logging::init_logging;
use crate::observability::metrics::{init_exporter, MetricsCollector};

/// How long workers get to finish in-flight jobs after the listener stops.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// How often finished jobs are checked against the dedup window.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    #[error("header policy: {0}")]
    Policy(#[from] PolicyCompileError),

    #[error("invalid {field}: {value:?}")]
    Address { field: &'static str, value: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics exporter: {0}")]
    Metrics(#[from] BuildError),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Assembles a [`Gateway`] from configuration, with seams for tests and
/// embedders to swap the job runner, artifact store, limiter and probes.
pub struct GatewayBuilder {
    config: GatewayConfig,
    runner: Option<Arc<dyn CommandRunner>>,
    handler: Option<Arc<dyn JobHandler>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    readiness: Option<Readiness>,
    transforms: TransformCatalog,
    probes: Vec<(String, Arc<dyn ReadinessProbe>)>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            runner: None,
            handler: None,
            artifacts: None,
            limiter: None,
            readiness: None,
            transforms: TransformCatalog::new(),
            probes: Vec::new(),
        }
    }

    /// Runner used by the default command handler.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Replaces the command handler for every job kind.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Share an externally driven readiness flag.
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    pub fn with_transforms(mut self, transforms: TransformCatalog) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_probe(mut self, role: impl Into<String>, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probes.push((role.into(), probe));
        self
    }

    pub fn build(self) -> Result<Gateway, StartupError> {
        let config = self.config;
        validate_config(&config).map_err(StartupError::Invalid)?;

        let metrics = Arc::new(
            MetricsCollector::with_sla_budgets(config.observability.sla_budgets_ms.clone())
                .with_tenant_limit(config.observability.max_tenant_labels),
        );
        let events = Arc::new(EventBridge::new(config.events.buffer_capacity));

        let registry = PolicyRegistry::from_config(&config.headers, &self.transforms)?;
        let headers = Arc::new(HeaderPolicyEngine::new(
            config.headers.mode,
            Arc::new(registry),
            Arc::new(DebugRing::new(config.headers.debug_buffer_size)),
            metrics.clone(),
        ));

        let queue = Arc::new(
            JobQueue::new(QueueSettings::from(&config.jobs))
                .with_events(events.clone())
                .with_metrics(metrics.clone()),
        );

        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(FsArtifactStore::new(&config.jobs.artifact_root)));
        let handler = self.handler.unwrap_or_else(|| {
            let runner = self.runner.unwrap_or_else(|| Arc::new(ProcessRunner));
            Arc::new(CommandHandler::from_config(&config.jobs.commands, runner))
        });
        let executor = Arc::new(
            JobExecutor::new(queue.clone(), artifacts)
                .with_backoff(config.jobs.backoff.clone())
                .with_execution_root(&config.jobs.execution_root)
                .with_workers(config.jobs.workers)
                .register_all(handler),
        );

        let monitored = config.health.enabled || !self.probes.is_empty();
        let readiness = self.readiness.unwrap_or_else(|| Readiness::new(!monitored));

        let mut dependencies = DependencyMonitor::new(&config.health, readiness.clone(), metrics.clone());
        for (role, probe) in self.probes {
            dependencies = dependencies.with_probe(role, probe);
        }

        let startup = Arc::new(StartupGuard::new(config.startup.clone(), readiness.clone()).with_metrics(metrics.clone()));

        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(FixedWindowLimiter::from_config(&config.rate_limit)));
        let rate_limiter = Arc::new(TenantRateLimiter::new(limiter, &config.rate_limit).with_metrics(metrics.clone()));

        tracing::info!(
            header_mode = ?config.headers.mode,
            header_policies = headers.registry().len(),
            workers = config.jobs.workers,
            startup_guard = config.startup.enabled,
            rate_limit = config.rate_limit.enabled,
            "Gateway components initialized"
        );

        let keep_alive = Duration::from_secs(config.events.keep_alive_secs.max(1));
        let state = AppState {
            config: Arc::new(config),
            queue,
            events,
            metrics,
            headers,
            transforms: Arc::new(self.transforms),
            startup,
            rate_limiter,
            dependencies: Arc::new(dependencies),
            keep_alive,
            started_at: Instant::now(),
        };

        Ok(Gateway {
            state,
            executor,
            monitored,
        })
    }
}

/// A fully wired gateway, ready to serve.
pub struct Gateway {
    state: AppState,
    executor: Arc<JobExecutor>,
    monitored: bool,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    pub fn readiness(&self) -> &Readiness {
        self.state.startup.readiness()
    }

    /// Public router (jobs, events, health).
    pub fn router(&self) -> Router {
        crate::http::build_router(self.state.clone())
    }

    /// Admin router; mounted by [`Gateway::serve`] when enabled.
    pub fn admin_router(&self) -> Router {
        setup_admin_router(self.state.clone())
    }

    /// Spawn job workers, the dependency monitor and the pruning loop.
    pub fn start_background(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = self.executor.clone().spawn(shutdown.token());

        if self.monitored {
            let monitor = self.state.dependencies.clone();
            handles.push(tokio::spawn(monitor.run(shutdown.subscribe())));
        }

        let queue = self.state.queue.clone();
        let retention = Duration::from_secs(self.state.config.jobs.dedup_window_secs);
        let token = shutdown.token();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.prune_terminal(retention);
                    }
                    _ = token.cancelled() => break,
                }
            }
        }));

        handles
    }

    /// Recompile header policies from a reloaded configuration.
    ///
    /// Other sections need a restart to take effect.
    pub fn reload(&self, config: &GatewayConfig) -> Result<(), StartupError> {
        validate_config(config).map_err(StartupError::Invalid)?;
        if config.headers.mode != self.state.headers.mode() {
            tracing::warn!(
                current = ?self.state.headers.mode(),
                requested = ?config.headers.mode,
                "Header enforcement mode changes require a restart"
            );
        }
        self.state
            .headers
            .registry()
            .reload(&config.headers, self.state.transforms.as_ref())?;
        Ok(())
    }

    /// Serve until `shutdown` fires, then drain workers.
    pub async fn serve(&self, listener: TcpListener, shutdown: Shutdown) -> Result<(), StartupError> {
        let workers = self.start_background(&shutdown);

        if self.state.config.admin.enabled {
            let address = self.state.config.admin.bind_address.clone();
            let admin_listener = TcpListener::bind(&address)
                .await
                .map_err(|source| StartupError::Bind { address, source })?;
            let admin = self.admin_router();
            let admin_shutdown = shutdown.clone();
            tokio::spawn(async move {
                match admin_listener.local_addr() {
                    Ok(addr) => tracing::info!(address = %addr, "Admin API listening"),
                    Err(e) => tracing::warn!(error = %e, "Admin listener has no local address"),
                }
                let served = axum::serve(admin_listener, admin)
                    .with_graceful_shutdown(async move { admin_shutdown.wait().await })
                    .await;
                if let Err(e) = served {
                    tracing::error!(error = %e, "Admin API stopped with error");
                }
            });
        }

        let queue = self.state.queue.clone();
        let result = GatewayServer::new(self.state.clone()).run(listener, shutdown.clone()).await;

        queue.close();
        shutdown.trigger();
        let drain = async {
            for handle in workers {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            tracing::warn!(
                deadline_secs = DRAIN_DEADLINE.as_secs(),
                "Workers still busy after shutdown deadline, abandoning"
            );
        }

        result.map_err(StartupError::from)
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, StartupError> {
    value.parse().map_err(|_| StartupError::Address {
        field,
        value: value.to_string(),
    })
}

/// Run the gateway process: load config, wire everything up and serve until
/// SIGINT or SIGTERM.
pub async fn run(config_path: Option<&Path>) -> Result<(), StartupError> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?config_path, "kb-gateway starting");

    if config.observability.metrics_enabled {
        init_exporter(parse_addr("observability.metrics_address", &config.observability.metrics_address)?)?;
    }

    let bind_address = config.listener.bind_address.clone();
    let gateway = Arc::new(GatewayBuilder::new(config).build()?);
    let shutdown = Shutdown::new();

    // Held for the life of the process; dropping it stops notifications.
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let handle = watcher.run(shutdown.subscribe())?;
            let reloader = gateway.clone();
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    match reloader.reload(&config) {
                        Ok(()) => tracing::info!("Header policies reloaded"),
                        Err(e) => tracing::error!(error = %e, "Reload rejected, keeping current policies"),
                    }
                }
            });
            Some(handle)
        }
        None => None,
    };

    let listener = TcpListener::bind(&bind_address)
        .await
        .map_err(|source| StartupError::Bind {
            address: bind_address.clone(),
            source,
        })?;
    spawn_signal_handler(shutdown.clone());

    gateway.serve(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RoutePolicyConfig;
    use crate::headers::manifest::HeaderPolicyManifest;

    #[test]
    fn build_with_defaults_is_ready_without_dependencies() {
        let gateway = GatewayBuilder::new(GatewayConfig::default()).build().unwrap();
        assert!(gateway.readiness().is_ready());
        assert_eq!(gateway.state().headers.registry().len(), 0);
    }

    #[test]
    fn health_monitoring_starts_not_ready() {
        let mut config = GatewayConfig::default();
        config.health.enabled = true;
        let gateway = GatewayBuilder::new(config).build().unwrap();
        assert!(!gateway.readiness().is_ready());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = GatewayConfig::default();
        config.jobs.workers = 0;
        assert!(matches!(
            GatewayBuilder::new(config).build(),
            Err(StartupError::Invalid(_))
        ));
    }

    #[test]
    fn reload_swaps_header_policies() {
        let gateway = GatewayBuilder::new(GatewayConfig::default()).build().unwrap();

        let mut config = GatewayConfig::default();
        config.headers.policies.push(RoutePolicyConfig {
            route_prefix: "/jobs".into(),
            manifest: HeaderPolicyManifest::new("audit"),
        });
        gateway.reload(&config).unwrap();
        assert_eq!(gateway.state().headers.registry().len(), 1);
    }
}
