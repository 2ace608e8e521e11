//! `scribe` node binary.
//!
//! Runs either the server role (`--server`) or the client role
//! (`--client`). A full cluster runs both roles per node, as two
//! processes sharing `--id` and a properties file.

mod properties;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scribe_client::{ClientConfig, Driver};
use scribe_mutex::LockService;
use scribe_net::{Location, PeerNetwork, PeerNetworkConfig};
use scribe_server::{Server, ServerConfig};
use scribe_wire::NodeId;

use properties::Properties;

/// Distributed mutually-exclusive file-append service.
#[derive(Parser, Debug)]
#[command(name = "scribe", version, about)]
struct Options {
    /// Enable the server role.
    #[arg(short = 's', long)]
    server: bool,

    /// Enable the client role.
    #[arg(short = 'c', long)]
    client: bool,

    /// Integer node ID, unique across the cluster.
    #[arg(short = 'i', long, value_parser = clap::value_parser!(u8).range(1..))]
    id: u8,

    /// Path to the properties file.
    #[arg(short = 'r', long = "props_file")]
    props_file: PathBuf,

    /// Staging directory for received file transfers.
    #[arg(short = 'w', long = "temp_dir", default_value = ".proj2_temp")]
    temp_dir: PathBuf,

    /// Socket poll timeout in milliseconds.
    #[arg(short = 't', long, default_value_t = 60_000)]
    timeout: u64,

    /// Connect-retry interval in milliseconds.
    #[arg(short = 'e', long = "retry_timeout", default_value_t = 15_000)]
    retry_timeout: u64,

    /// Listening port for the peer / server role.
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().expect("valid filter")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = Options::parse();
    if options.server == options.client {
        anyhow::bail!("exactly one of --server and --client must be on");
    }

    let props = Properties::load(&options.props_file)?;
    let running = install_shutdown_handler()?;

    if options.server {
        run_server(&options, &props, &running)
    } else {
        run_client(&options, &props, running)
    }
}

/// Flips the running flag on SIGINT / SIGTERM.
fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("cannot register signals")?;

    let flag = Arc::clone(&running);
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "shutdown requested");
                flag.store(false, Ordering::SeqCst);
            }
        })
        .context("cannot spawn signal thread")?;

    Ok(running)
}

fn run_server(options: &Options, props: &Properties, running: &AtomicBool) -> Result<()> {
    let root_dir = props.require("root_dir")?;

    let config = ServerConfig::new(options.port, root_dir)
        .with_temp_dir(options.temp_dir.clone());
    let mut server = Server::new(config).context("cannot start server")?;

    info!(id = options.id, port = options.port, "server role up");
    server.run(running)?;
    Ok(())
}

fn run_client(options: &Options, props: &Properties, running: Arc<AtomicBool>) -> Result<()> {
    let id = NodeId::new(options.id);
    let password = props.require("password")?.to_string();
    let poll_timeout = Duration::from_millis(options.timeout);

    // The server fleet this client issues file operations against.
    let servers: Vec<Location> = props
        .require("servers")?
        .split(',')
        .map(|entry| Location::parse(entry, None))
        .collect::<Result<_, _>>()
        .context("malformed server location in properties file")?;

    // The peer mesh carrying mutual exclusion traffic.
    let peers = PeerNetworkConfig::resolve_peers(props.require("clients")?, options.port)
        .context("malformed peer location in properties file")?;

    let links = PeerNetwork::establish(PeerNetworkConfig {
        id,
        port: options.port,
        peers,
        password,
        poll_timeout,
        retry_timeout: Duration::from_millis(options.retry_timeout),
        temp_dir: options.temp_dir.clone(),
    })
    .context("peer network bring-up failed")?;

    let lock = LockService::start(id, links);

    let mut config = ClientConfig::new(id, servers);
    config.poll_timeout = poll_timeout;
    config.temp_dir = options.temp_dir.clone();

    info!(id = options.id, "client role up");
    Driver::new(config, lock, running).run()?;
    Ok(())
}
