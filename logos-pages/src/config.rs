//! Server configuration.

use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_BIND: &str = "LOGOS_PAGES_BIND";
pub const ENV_BROADCAST_CAPACITY: &str = "LOGOS_PAGES_BROADCAST_CAPACITY";
pub const ENV_OUTBOUND_CAPACITY: &str = "LOGOS_PAGES_OUTBOUND_CAPACITY";
pub const ENV_HEARTBEAT_SECS: &str = "LOGOS_PAGES_HEARTBEAT_SECS";
pub const ENV_STORAGE: &str = "LOGOS_PAGES_STORAGE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per page room
    pub broadcast_capacity: usize,
    /// Per-connection outbound queue length
    pub outbound_capacity: usize,
    /// Heartbeat interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `LOGOS_PAGES_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(bind) = lookup(ENV_BIND) {
            config.bind_addr = bind;
        }
        overlay(&lookup, ENV_BROADCAST_CAPACITY, &mut config.broadcast_capacity);
        overlay(&lookup, ENV_OUTBOUND_CAPACITY, &mut config.outbound_capacity);
        overlay(&lookup, ENV_HEARTBEAT_SECS, &mut config.heartbeat_interval_secs);
        if let Some(path) = lookup(ENV_STORAGE).filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        config
    }
}

fn overlay<T: FromStr + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => log::warn!("Ignoring {key}={raw:?}: not a number, keeping {slot}"),
    }
}
