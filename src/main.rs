use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "kb-gateway", version)]
#[command(about = "HTTP control plane for knowledge-base jobs", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, env = "KB_GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Err(e) = kb_gateway::lifecycle::startup::run(args.config.as_deref()).await {
        // Logging may not be initialized if the config failed to load.
        eprintln!("kb-gateway: {e}");
        tracing::error!(error = %e, "Gateway failed");
        return Err(e.into());
    }
    Ok(())
}
