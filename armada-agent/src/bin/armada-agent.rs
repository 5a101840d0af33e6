//! Armada node agent binary.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use armada_agent::{Agent, AgentConfig};

#[derive(Parser)]
#[command(name = "armada-agent", about = "Armada node agent")]
struct Cli {
    /// Node identity; with mTLS it must equal the certificate CN.
    #[arg(long)]
    node_id: String,
    /// Relay agent endpoint, e.g. wss://relay.example.com:7443/armada/agent
    #[arg(long)]
    relay_url: String,
    /// Fleet CA certificate (enables TLS verification of the relay).
    #[arg(long)]
    ca_cert: Option<String>,
    /// Client certificate for mTLS.
    #[arg(long)]
    client_cert: Option<String>,
    /// Client private key for mTLS.
    #[arg(long)]
    client_key: Option<String>,
    /// Bearer token fallback when mTLS is not configured.
    #[arg(long)]
    token: Option<String>,
    /// Override the reported hostname.
    #[arg(long)]
    hostname: Option<String>,
    #[arg(long, default_value_t = 20)]
    heartbeat_secs: u64,
    #[arg(long, default_value = "/bin/sh")]
    shell: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    armada_identity::tls::init_crypto_provider();

    let cli = Cli::parse();
    let mut config = AgentConfig::new(&cli.node_id, &cli.relay_url);
    config.ca_cert_path = cli.ca_cert;
    config.client_cert_path = cli.client_cert;
    config.client_key_path = cli.client_key;
    config.bearer_token = cli.token;
    config.heartbeat_secs = cli.heartbeat_secs;
    config.default_shell = cli.shell;
    if let Some(hostname) = cli.hostname {
        config.hostname = hostname;
    }

    let agent = Agent::new(config)?;
    info!(node_id = %cli.node_id, "starting armada agent");

    tokio::select! {
        result = agent.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping agent");
            agent.stop();
            Ok(())
        }
    }
}
