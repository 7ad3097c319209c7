mod auth;
mod config;
mod discovery;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tessera_cluster::{ClusterObserver, Node, PeerId, PeerInfo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth::ClusterSecret;
use crate::config::TesseraConfig;
use crate::discovery::SeedDiscovery;
use crate::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "tessera-server", about = "tessera server pool node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind the peer listener to
    #[arg(long, env = "TESSERA_HOST")]
    host: Option<String>,

    /// peer listener port
    #[arg(short, long, env = "TESSERA_PORT")]
    port: Option<u16>,

    /// address other peers use to reach this one (host:port)
    #[arg(long, env = "TESSERA_ADVERTISE")]
    advertise: Option<String>,

    /// site address; peers that share it are in the same site
    #[arg(long, env = "TESSERA_SITE")]
    site: Option<String>,

    /// comma-separated host:port list of peers to announce to
    #[arg(long, env = "TESSERA_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// fixed peer id (UUID). generated when unset
    #[arg(long, env = "TESSERA_ID")]
    id: Option<String>,

    /// shared secret for authenticating peer traffic
    #[arg(long, env = "TESSERA_AUTH_PASS")]
    auth_pass: Option<String>,

    /// path to a file holding the shared secret (alternative to --auth-pass)
    #[arg(long, env = "TESSERA_AUTH_PASS_FILE")]
    auth_pass_file: Option<PathBuf>,
}

/// Applies CLI and env overrides. Only values that were given take effect.
fn apply_args(cfg: &mut TesseraConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ref v) = args.advertise {
        cfg.advertise = v.clone();
    }
    if let Some(ref v) = args.site {
        cfg.site = v.clone();
    }
    if !args.seeds.is_empty() {
        cfg.seeds = args.seeds.clone();
    }
    if let Some(ref v) = args.id {
        cfg.id = v.clone();
    }
    if let Some(ref pass) = args.auth_pass {
        cfg.auth_pass = pass.clone();
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// The config value and `--auth-pass-file` are mutually exclusive.
fn resolve_secret(cfg: &TesseraConfig, args: &Args) -> Option<Arc<ClusterSecret>> {
    if !cfg.auth_pass.is_empty() && args.auth_pass_file.is_some() {
        exit_err("error: --auth-pass and --auth-pass-file are mutually exclusive");
    }
    if !cfg.auth_pass.is_empty() {
        return match ClusterSecret::from_password(&cfg.auth_pass) {
            Ok(secret) => Some(Arc::new(secret)),
            Err(e) => exit_err(format!("error: invalid auth pass: {e}")),
        };
    }
    let path = args.auth_pass_file.as_ref()?;
    match ClusterSecret::from_file(path) {
        Ok(secret) => Some(Arc::new(secret)),
        Err(e) => exit_err(format!(
            "error: failed to read --auth-pass-file '{}': {e}",
            path.display()
        )),
    }
}

/// Logs pool lifecycle changes.
struct EventLog;

impl ClusterObserver for EventLog {
    fn new_server(&self, peer: PeerId) {
        info!(%peer, "peer joined");
    }

    fn server_failed(&self, peer: PeerId) {
        warn!(%peer, "peer failed");
    }

    fn new_leader(&self, leader: PeerId) {
        info!(%leader, "leadership moved");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match TesseraConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults, then the TOML file, then env and CLI
    let mut cfg = match &args.config {
        Some(path) => TesseraConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => TesseraConfig::default(),
    };
    apply_args(&mut cfg, &args);
    let secret = resolve_secret(&cfg, &args);

    let bind = cfg.bind_addr().unwrap_or_else(|e| exit_err(e));
    let local = PeerInfo {
        id: cfg.peer_id().unwrap_or_else(|e| exit_err(e)),
        addr: cfg.advertise_addr().unwrap_or_else(|e| exit_err(e)),
        site: cfg.site_addr().unwrap_or_else(|e| exit_err(e)),
    };
    let seeds = cfg.seed_addrs().unwrap_or_else(|e| exit_err(e));

    let listener = TcpListener::bind(bind)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind {bind}: {e}")));

    let transport = Arc::new(TcpTransport::new(secret.clone()));
    let node = Node::start(local, cfg.to_cluster_config(), transport.clone())
        .unwrap_or_else(|e| exit_err(e));
    node.add_observer(Arc::new(EventLog));
    let discovery = Arc::new(SeedDiscovery::new(seeds, local.addr, transport));
    let seed_count = discovery.seeds().len();
    node.set_discovery(discovery);

    info!(
        id = %local.id,
        addr = %local.addr,
        seeds = seed_count,
        auth = secret.is_some(),
        "tessera server starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(crate::transport::serve(
        listener,
        Arc::clone(&node),
        secret,
        shutdown_rx,
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    node.shutdown();
    let _ = server.await;
}
