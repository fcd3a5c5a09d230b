//! Shared utilities for gateway integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use serde_json::Value;
use tokio::net::TcpListener;

use kb_gateway::config::GatewayConfig;
use kb_gateway::jobs::artifacts::artifact_path;
use kb_gateway::jobs::{
    Artifact, ArtifactError, ArtifactStore, JobContext, JobError, JobHandler, JobId, JobKind, JobMetadata, JobOutput,
    JobQueue, RunId,
};
use kb_gateway::lifecycle::{Gateway, GatewayBuilder, Shutdown};

/// Config with the guard and limiter out of the way and fast backoff.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.startup.enabled = false;
    config.jobs.workers = 2;
    config.jobs.backoff = kb_gateway::resilience::BackoffPolicy::fixed(Duration::from_millis(10));
    config.events.keep_alive_secs = 1;
    config
}

/// Artifacts kept in memory, keyed by their relative location.
#[derive(Default)]
pub struct MemoryArtifacts {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn write(&self, kind: JobKind, run_id: RunId, name: &str, content: &[u8]) -> Result<String, ArtifactError> {
        let path = artifact_path(kind, run_id, name)?;
        self.files
            .lock()
            .unwrap()
            .insert(path.clone(), content.to_vec());
        Ok(path)
    }
}

/// Fails the first `failures` attempts, then succeeds.
pub struct FlakyHandler {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(JobError::reported(format!("attempt {} failed", ctx.attempt)));
        }
        ctx.progress.report(50, Some("halfway"));
        Ok(JobOutput::default().with_artifact(Artifact::new("report.json", "{}")))
    }
}

/// Runs until the job is cancelled.
pub struct BlockingHandler;

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
        ctx.cancel.cancelled().await;
        Err(JobError::Cancelled)
    }
}

pub fn gateway(config: GatewayConfig, handler: Arc<dyn JobHandler>) -> Gateway {
    GatewayBuilder::new(config)
        .with_handler(handler)
        .with_artifact_store(Arc::new(MemoryArtifacts::default()))
        .build()
        .unwrap()
}

/// Serve `gateway` on an ephemeral port.
pub async fn serve(gateway: Gateway) -> (SocketAddr, Shutdown, Arc<Gateway>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let gateway = Arc::new(gateway);

    let serving = gateway.clone();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener, signal).await;
    });
    (addr, shutdown, gateway)
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll until the job reaches a terminal status or `timeout` passes.
pub async fn wait_terminal(queue: &JobQueue, job_id: JobId, timeout: Duration) -> JobMetadata {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = queue.get(job_id).expect("job exists");
        if job.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
