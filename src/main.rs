use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use ipnet::IpNet;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::info;

use multitun::dedup::MTU;
use multitun::engine::{Engine, PathPair};
use multitun::tun::{LinuxTun, TunDevice};

const DEFAULT_PORT: u16 = 4242;
const DEFAULT_TUN_NAME: &str = "mtun0";

#[derive(Parser, Debug)]
#[command(
    name = "multitun",
    version,
    about = "Redundant multipath IP-over-UDP tunnel"
)]
struct Args {
    /// Optional JSON config file; flags override file values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Server role: address to bind the shared UDP socket on.
    #[arg(long)]
    server_listen_addr: Option<Ipv4Addr>,
    /// UDP port the server listens on and clients target.
    #[arg(long)]
    server_port: Option<u16>,
    /// Address assigned to the tun interface (a /24 is configured).
    #[arg(long)]
    tun_listen_addr: Option<Ipv4Addr>,
    /// Client role: comma-separated <bind>:<server> pairs, one per path.
    #[arg(long, value_delimiter = ',')]
    client_endpoints: Vec<PathPair>,
    /// Name for the tun interface.
    #[arg(long)]
    tun_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    server_listen_addr: Option<Ipv4Addr>,
    server_port: Option<u16>,
    tun_listen_addr: Option<Ipv4Addr>,
    client_endpoints: Vec<String>,
    tun_name: Option<String>,
}

enum Role {
    Server { listen: Ipv4Addr },
    Client { paths: Vec<PathPair> },
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

fn resolve_role(args: &Args, cfg: &Config) -> Result<Role> {
    let listen = args.server_listen_addr.or(cfg.server_listen_addr);
    let paths: Vec<PathPair> = if args.client_endpoints.is_empty() {
        cfg.client_endpoints
            .iter()
            .map(|s| s.parse())
            .collect::<Result<_>>()?
    } else {
        args.client_endpoints.clone()
    };

    match (listen, paths.is_empty()) {
        (Some(listen), true) => Ok(Role::Server { listen }),
        (None, false) => Ok(Role::Client { paths }),
        (Some(_), false) => {
            bail!("--server-listen-addr and --client-endpoints are mutually exclusive")
        }
        (None, true) => bail!("one of --server-listen-addr or --client-endpoints is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    // All configuration errors surface before any socket or device exists.
    let role = resolve_role(&args, &cfg)?;
    let port = args.server_port.or(cfg.server_port).unwrap_or(DEFAULT_PORT);
    let tun_ip = args
        .tun_listen_addr
        .or(cfg.tun_listen_addr)
        .ok_or_else(|| anyhow!("--tun-listen-addr is required"))?;
    let tun_name = args
        .tun_name
        .clone()
        .or_else(|| cfg.tun_name.clone())
        .unwrap_or_else(|| DEFAULT_TUN_NAME.to_string());

    let tun_net =
        IpNet::new(IpAddr::V4(tun_ip), 24).map_err(|e| anyhow!("invalid tun prefix: {e}"))?;
    let tun = LinuxTun::create(&tun_name, tun_net, MTU as u16).context("tun setup failed")?;
    info!(dev = %tun.name(), ip = %tun_net, "tun interface up");

    match role {
        Role::Server { listen } => {
            info!(bind = %listen, port, "acting as server");
            supervise(Engine::server(tun, listen, port).await?).await
        }
        Role::Client { paths } => {
            info!(paths = paths.len(), port, "acting as client");
            supervise(Engine::client(tun, &paths, port).await?).await
        }
    }
}

async fn supervise<T: TunDevice>(engine: Engine<T>) -> Result<()> {
    tokio::select! {
        res = engine.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
            Ok(())
        }
    }
}
