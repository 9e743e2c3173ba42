//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Host configuration. File: ~/.config/beam/config.toml or /etc/beam/config.toml.
/// Env overrides: BEAM_RELAY_URL, BEAM_LISTEN, BEAM_STUN_SERVERS, BEAM_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relay websocket URL (default ws://127.0.0.1:9000).
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Bind address for `beam relay` (default 0.0.0.0:9000).
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// STUN servers for candidate gathering.
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Where `beam receive` writes completed files (default current directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Protocol tunables.
    #[serde(default)]
    pub core: beam_core::Config,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:9000".to_string()
}
fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9000))
}
fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            listen: default_listen(),
            stun_servers: default_stun_servers(),
            download_dir: default_download_dir(),
            core: beam_core::Config::default(),
        }
    }
}

/// Load config: default, then config file (explicit path or first existing default path),
/// then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn parse(s: &str) -> anyhow::Result<Config> {
    toml::from_str(s).context("invalid config")
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BEAM_RELAY_URL") {
        c.relay_url = s;
    }
    if let Some(s) = var("BEAM_LISTEN") {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            c.listen = addr;
        }
    }
    if let Some(s) = var("BEAM_STUN_SERVERS") {
        c.stun_servers = s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(s) = var("BEAM_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/beam/config.toml"));
    }
    out.push(PathBuf::from("/etc/beam/config.toml"));
    out
}
