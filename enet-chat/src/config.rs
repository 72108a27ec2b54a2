//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Chat configuration. File: ~/.config/enet-chat/config.toml or /etc/enet-chat/config.toml.
/// Env overrides: ENET_CHAT_HOST, ENET_CHAT_PORT, ENET_CHAT_MAX_CLIENTS, ENET_CHAT_CHANNELS,
/// ENET_CHAT_POLL_MILLIS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server bind address (default all interfaces).
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port; also the client's default target port (default 7777).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: i32,
    #[serde(default = "default_channels")]
    pub channels: i32,
    /// Event loop poll interval in milliseconds (default 10).
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_max_clients() -> i32 {
    32
}
fn default_channels() -> i32 {
    2
}
fn default_poll_millis() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            channels: default_channels(),
            poll_millis: default_poll_millis(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|s| s.trim().parse().ok())
}

/// Override fields from `lookup` (the process environment outside tests). Unparsable values
/// are ignored.
fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(h) = lookup("ENET_CHAT_HOST") {
        c.host = h;
    }
    if let Some(p) = parse(lookup("ENET_CHAT_PORT")) {
        c.port = p;
    }
    if let Some(n) = parse::<i32>(lookup("ENET_CHAT_MAX_CLIENTS")).filter(|&n| n > 0) {
        c.max_clients = n;
    }
    if let Some(n) = parse::<i32>(lookup("ENET_CHAT_CHANNELS")).filter(|&n| n > 0) {
        c.channels = n;
    }
    if let Some(ms) = parse(lookup("ENET_CHAT_POLL_MILLIS")) {
        c.poll_millis = ms;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/enet-chat/config.toml"));
    }
    out.push(PathBuf::from("/etc/enet-chat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), "ignoring config: {}", e),
                },
                Err(e) => tracing::warn!(path = %p.display(), "cannot read config: {}", e),
            }
            break;
        }
    }
    None
}
