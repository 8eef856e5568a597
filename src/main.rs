use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use parley::shell::LogLevelSetter;
use parley::{Config, Node, Shell};

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about = "Peer-to-peer overlay chat client", long_about = None)]
struct Args {
    /// JSON config file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity local part.
    #[arg(short, long)]
    name: Option<String>,

    /// Identity realm.
    #[arg(short = 's', long)]
    namespace: Option<String>,

    /// Rendezvous directory host.
    #[arg(long)]
    rendezvous_host: Option<String>,

    /// Rendezvous directory port.
    #[arg(long)]
    rendezvous_port: Option<u16>,

    /// Port for inbound peer sessions.
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Initial log filter (overridden at runtime by /log).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(host) = &args.rendezvous_host {
        config.rendezvous_host = host.clone();
    }
    if let Some(port) = args.rendezvous_port {
        config.rendezvous_port = port;
    }
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    let (filter, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();

    // The /log command swaps the filter through this setter.
    let set_log_level: LogLevelSetter = Box::new(move |level: &str| {
        let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
        reload_handle.reload(filter).map_err(|e| e.to_string())
    });

    let config = resolve_config(&args).context("configuration rejected")?;
    let (node, events) = Node::start(config).await?;

    Shell::new(node, events, set_log_level).run().await
}
