use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the kb gateway", long_about = None)]
struct Cli {
    /// Admin API base URL
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    /// Public API base URL (jobs)
    #[arg(short, long, default_value = "http://localhost:8080")]
    gateway: String,

    #[arg(short, long, env = "KB_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    /// Tenant sent as x-tenant-id on job requests
    #[arg(short, long)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// Dump the metrics snapshot
    Metrics {
        /// Reset counters after printing
        #[arg(long)]
        reset: bool,
    },
    /// Show recent header policy decisions
    HeaderDebug {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// List jobs
    Jobs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one job
    Job { id: String },
    /// Enqueue a job
    Enqueue {
        kind: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Cancel a job
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut admin = HeaderMap::new();
    admin.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let mut public = HeaderMap::new();
    if let Some(tenant) = &cli.tenant {
        public.insert("x-tenant-id", HeaderValue::from_str(tenant)?);
    }

    match cli.command {
        Commands::Status => {
            let res = client.get(format!("{}/admin/status", cli.url)).headers(admin).send().await?;
            print_response(res).await?;
        }
        Commands::Metrics { reset } => {
            let res = client
                .get(format!("{}/admin/metrics", cli.url))
                .headers(admin.clone())
                .send()
                .await?;
            print_response(res).await?;
            if reset {
                let res = client
                    .post(format!("{}/admin/metrics/reset", cli.url))
                    .headers(admin)
                    .send()
                    .await?;
                if !res.status().is_success() {
                    eprintln!("Error: reset returned status {}", res.status());
                }
            }
        }
        Commands::HeaderDebug { limit } => {
            let mut req = client.get(format!("{}/admin/headers/debug", cli.url)).headers(admin);
            if let Some(limit) = limit {
                req = req.query(&[("limit", limit)]);
            }
            print_response(req.send().await?).await?;
        }
        Commands::Jobs { status, kind, limit } => {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(status) = status {
                query.push(("status", status));
            }
            if let Some(kind) = kind {
                query.push(("kind", kind));
            }
            if let Some(limit) = limit {
                query.push(("limit", limit.to_string()));
            }
            let res = client
                .get(format!("{}/jobs", cli.gateway))
                .headers(public)
                .query(&query)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Job { id } => {
            let res = client.get(format!("{}/jobs/{id}", cli.gateway)).headers(public).send().await?;
            print_response(res).await?;
        }
        Commands::Enqueue {
            kind,
            payload,
            idempotency_key,
        } => {
            let payload: Value = serde_json::from_str(&payload)?;
            if let Some(key) = idempotency_key {
                public.insert("idempotency-key", HeaderValue::from_str(&key)?);
            }
            let res = client
                .post(format!("{}/jobs", cli.gateway))
                .headers(public)
                .json(&serde_json::json!({ "kind": kind, "payload": payload }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Cancel { id } => {
            let res = client
                .post(format!("{}/jobs/{id}/cancel", cli.gateway))
                .headers(public)
                .send()
                .await?;
            print_response(res).await?;
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
