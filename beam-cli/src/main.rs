// beam: send a file to a peer over a WebRTC data channel, signaled through a websocket relay.

mod channel;
mod config;
mod driver;
mod progress;
mod relay;
mod relay_server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use beam_core::{PeerId, PeerSession};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::driver::{Driver, Role};

#[derive(Parser)]
#[command(name = "beam")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default ~/.config/beam/config.toml, then /etc/beam/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay websocket URL
    #[arg(long)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a file to the peer with the given identity
    Send {
        /// Receiver identity, as printed by `beam receive`
        #[arg(long, value_parser = parse_peer_id)]
        to: PeerId,
        file: PathBuf,
    },
    /// Wait for senders and save what they send
    Receive {
        /// Download directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Run a broadcast signal relay
    Relay {
        /// Bind address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
}

fn parse_peer_id(s: &str) -> Result<PeerId, String> {
    PeerId::parse(s).ok_or_else(|| "peer identity must not be empty".to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(url) = cli.relay {
        cfg.relay_url = url;
    }

    let command = cli.command;
    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(async move {
        match command {
            Command::Relay { listen } => {
                let addr = listen.unwrap_or(cfg.listen);
                tokio::select! {
                    res = relay_server::run(addr) => res,
                    res = shutdown_signal() => res,
                }
            }
            Command::Send { to, file } => {
                if !file.is_file() {
                    anyhow::bail!("{} is not a file", file.display());
                }
                let session = PeerSession::new(cfg.core.clone());
                println!("Your identity: {}", session.local_id());
                let driver = Driver::new(session, Role::Send { to, file }, &cfg).await?;
                driver.run(shutdown_signal()).await
            }
            Command::Receive { out } => {
                let download_dir = out.unwrap_or_else(|| cfg.download_dir.clone());
                tokio::fs::create_dir_all(&download_dir)
                    .await
                    .with_context(|| format!("creating {}", download_dir.display()))?;
                let session = PeerSession::new(cfg.core.clone());
                println!("Your identity: {}", session.local_id());
                info!(dir = %download_dir.display(), relay = %cfg.relay_url, "waiting for a sender");
                let driver = Driver::new(session, Role::Receive { download_dir }, &cfg).await?;
                driver.run(shutdown_signal()).await
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}
