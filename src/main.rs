//! TunnelHub CLI - WireGuard peer provisioning
//!
//! Manages the peers of a hub-and-spoke WireGuard network: provisions peers,
//! prints their config files, writes the hub config, and can serve the same
//! operations over a REST API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use tunnelhub::config::Hooks;
use tunnelhub::crypto::{KeyProvisioner, WgToolProvisioner, X25519Provisioner};
use tunnelhub::daemon::{AppState, HttpServer, DEFAULT_LISTEN_ADDR};
use tunnelhub::traffic::WgShowReader;
use tunnelhub::{
    load_hub_config, JsonFileStore, PeerRequest, PeerService, TrafficReport, TunnelHubError,
};

/// Where peer key pairs come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KeySource {
    /// Generate X25519 keys in-process
    X25519,
    /// Run `wg genkey` and `wg pubkey`
    Wg,
}

/// TunnelHub - WireGuard peer provisioning
#[derive(Parser, Debug)]
#[command(name = "tunnelhub")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hub configuration (YAML)
    #[arg(short, long, default_value = "server.yaml")]
    config: PathBuf,

    /// Peer store (JSON)
    #[arg(short, long, default_value = "peers.json")]
    store: PathBuf,

    /// Where `setup` writes the hub's WireGuard config
    #[arg(short, long, default_value = "wg.conf")]
    output: PathBuf,

    /// Key generation backend
    #[arg(long, value_enum, default_value_t = KeySource::X25519)]
    keys: KeySource,

    /// Path to the `wg` binary
    #[arg(long, default_value = "wg")]
    wg_binary: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the hub config covering every provisioned peer
    Setup,
    /// Provision a peer and print its config
    Add(AddArgs),
    /// Remove a peer
    Remove {
        /// Peer identifier
        id: String,
    },
    /// Print a peer's config
    Show {
        /// Peer identifier
        id: String,
    },
    /// List peers and their addresses
    List,
    /// Point every peer at the hub's current address and port
    UpdateEndpoints,
    /// Give a peer a fresh key pair and print its new config
    Rekey {
        /// Peer identifier
        id: String,
    },
    /// List routes advertised by peers
    Routes,
    /// Show live traffic counters per peer
    Traffic,
    /// Serve the REST API
    Serve {
        /// Listen address
        #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
        listen: SocketAddr,
    },
}

#[derive(ClapArgs, Debug)]
struct AddArgs {
    /// Peer identifier
    #[arg(long)]
    id: String,

    /// AllowedIPs for the peer's side (default: <address>/24)
    #[arg(long)]
    allowed_ips: Option<String>,

    /// Assign this address instead of the lowest free one
    #[arg(long)]
    ip: Option<std::net::Ipv4Addr>,

    /// Network this peer makes reachable to others
    #[arg(long)]
    advertise_route: Option<String>,

    /// Advertised routes this peer should send into the tunnel
    #[arg(long, value_delimiter = ',')]
    accept_routes: Vec<String>,

    #[arg(long)]
    pre_up: Option<String>,

    #[arg(long)]
    post_up: Option<String>,

    #[arg(long)]
    pre_down: Option<String>,

    #[arg(long)]
    post_down: Option<String>,
}

impl From<AddArgs> for PeerRequest {
    fn from(args: AddArgs) -> Self {
        PeerRequest {
            user_id: args.id,
            ip: args.ip,
            allowed_ips: args.allowed_ips,
            advertise_routes: args.advertise_route,
            accept_routes: args.accept_routes,
            hooks: Hooks {
                pre_up: args.pre_up,
                post_up: args.post_up,
                pre_down: args.pre_down,
                post_down: args.post_down,
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn open_service(args: &Args) -> Result<PeerService, TunnelHubError> {
    tracing::debug!("Loading hub config from {:?}", args.config);
    let hub = load_hub_config(&args.config)?;
    let store = Arc::new(JsonFileStore::open(&args.store)?);

    let keys: Box<dyn KeyProvisioner> = match args.keys {
        KeySource::X25519 => Box::new(X25519Provisioner),
        KeySource::Wg => Box::new(WgToolProvisioner::new(args.wg_binary.clone())),
    };
    let live = Box::new(WgShowReader::new(args.wg_binary.clone()));

    PeerService::new(hub, store, keys, live)
}

async fn run(args: Args) -> Result<(), TunnelHubError> {
    let service = open_service(&args)?;

    match args.command {
        Command::Setup => {
            service.write_hub_config(&args.output)?;
            println!("Hub config written to {}", args.output.display());
        }
        Command::Add(add) => {
            let peer = service.provision(add.into())?;
            print!("{}", service.render_peer(&peer.user_id)?);
        }
        Command::Remove { id } => {
            let removed = service.remove(&id)?;
            println!("Removed {} ({})", removed.user_id, removed.ip);
        }
        Command::Show { id } => {
            print!("{}", service.render_peer(&id)?);
        }
        Command::List => {
            let peers = service.list()?;
            let width = peers
                .iter()
                .map(|p| p.user_id.len())
                .max()
                .unwrap_or(0)
                .max("ID".len());
            println!("{:<width$}  IP", "ID", width = width);
            for peer in peers {
                println!("{:<width$}  {}", peer.user_id, peer.ip, width = width);
            }
        }
        Command::UpdateEndpoints => {
            let changed = service.rotate_endpoints()?;
            println!(
                "Updated {} peer(s) to endpoint {}",
                changed,
                service.hub().endpoint()
            );
        }
        Command::Rekey { id } => {
            service.rekey(&id)?;
            print!("{}", service.render_peer(&id)?);
        }
        Command::Routes => {
            for route in service.find_routes()? {
                println!("{}", route);
            }
        }
        Command::Traffic => {
            print!("{}", TrafficReport::new(service.traffic_report()?));
        }
        Command::Serve { listen } => {
            let state = AppState {
                service: Arc::new(service),
                hub_config_path: args.output.clone(),
            };
            HttpServer::new(listen, state)
                .run_with_shutdown(shutdown_signal())
                .await?;
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
