//! Armada relay server binary.
//!
//! Runs the tunnel listener, the health/HA API, the stale-node sweeper and
//! the peer health loop. Also carries the certificate bootstrap commands
//! used to provision a fleet CA and per-node agent credentials.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use armada_core::config::{CoreConfig, StoreBackend};
use armada_core::fleet::NodeManager;
use armada_core::ha::HaCoordinator;
use armada_core::relay::{spawn_api_server, RelayServer};
use armada_core::store::{FleetStore, MemoryStore, PostgresStore, SqliteStore};
use armada_identity::CertificateAuthority;

#[derive(Parser)]
#[command(name = "armada-relay", about = "Armada fleet relay server")]
struct Cli {
    /// Path to a TOML config file; ARMADA__* env vars override it.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default).
    Run,
    /// Generate a fleet CA and a relay server certificate.
    InitCa {
        /// Output directory for the PEM bundle.
        #[arg(long, default_value = "certs")]
        dir: PathBuf,
        /// Organization embedded in every issued certificate.
        #[arg(long, default_value = "armada")]
        fleet_tag: String,
        /// Hosts/IPs for the server certificate SANs.
        #[arg(long, value_delimiter = ',', default_value = "localhost,127.0.0.1")]
        hosts: Vec<String>,
    },
    /// Issue a client certificate for one node; the CN is the node id.
    IssueNode {
        #[arg(long, default_value = "certs")]
        dir: PathBuf,
        #[arg(long, default_value = "armada")]
        fleet_tag: String,
        #[arg(long)]
        node_id: String,
    },
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
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config.as_deref()).await,
        Command::InitCa {
            dir,
            fleet_tag,
            hosts,
        } => init_ca(&dir, &fleet_tag, &hosts),
        Command::IssueNode {
            dir,
            fleet_tag,
            node_id,
        } => issue_node(&dir, &fleet_tag, &node_id),
    }
}

async fn run(config_path: Option<&str>) -> Result<()> {
    let cfg = CoreConfig::load(config_path).context("failed to load configuration")?;
    info!(instance_id = %cfg.ha.instance_id, "starting armada relay");

    let store: Arc<dyn FleetStore> = match cfg.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&cfg.store.sqlite_path).await?),
        StoreBackend::Postgres => Arc::new(
            PostgresStore::connect(&cfg.store.postgres_url, cfg.store.max_connections).await?,
        ),
    };

    let manager = Arc::new(NodeManager::new(store));
    manager.spawn_sweeper(
        Duration::from_secs(cfg.fleet.gc_interval_secs.max(1)),
        Duration::from_secs(cfg.fleet.stale_after_secs.max(1)),
    );

    let ha = HaCoordinator::new(&cfg.ha, &cfg.relay.base_path);
    ha.spawn_health_loop(Duration::from_secs(cfg.ha.probe_interval_secs.max(1)));

    let relay = RelayServer::new(cfg.relay.clone(), Arc::clone(&manager), Some(Arc::clone(&ha)))?;
    relay.start().await?;

    spawn_api_server(
        &cfg.relay.api_addr,
        &cfg.relay.base_path,
        Arc::clone(&relay),
        Arc::clone(&ha),
        Duration::from_secs(cfg.ha.drain_timeout_secs.max(1)),
    )
    .await?;

    let mut shutdown = relay.subscribe_shutdown();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            relay.shutdown();
        }
        _ = shutdown.recv() => {
            info!("drain complete, exiting");
        }
    }
    Ok(())
}

fn init_ca(dir: &PathBuf, fleet_tag: &str, hosts: &[String]) -> Result<()> {
    let ca = CertificateAuthority::generate(fleet_tag)?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("ca.crt"), ca.ca_cert_pem())?;
    std::fs::write(dir.join("ca.key"), ca.key_pem())?;

    let server = ca.issue_server(hosts)?;
    server.write_to(dir, "server")?;

    info!(dir = %dir.display(), "wrote ca.crt, ca.key, server.crt, server.key");
    Ok(())
}

fn issue_node(dir: &PathBuf, fleet_tag: &str, node_id: &str) -> Result<()> {
    let ca_cert = std::fs::read_to_string(dir.join("ca.crt"))
        .context("ca.crt not found; run init-ca first")?;
    let ca_key = std::fs::read_to_string(dir.join("ca.key"))
        .context("ca.key not found; run init-ca first")?;
    let ca = CertificateAuthority::from_pem(&ca_cert, &ca_key, fleet_tag)?;

    let issued = ca.issue_node(node_id)?;
    issued.write_to(dir, node_id)?;

    info!(dir = %dir.display(), node_id = %node_id, "wrote node certificate bundle");
    Ok(())
}
