//! Runtime configuration, built once at startup and handed to each component.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Default change-queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Connection settings for the live (Redis protocol) store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveStoreConfig {
    /// `host:port` of the live store.
    pub addr: String,
    pub password: Option<String>,
    pub db: u32,
    /// Value applied to `notify-keyspace-events` on startup, e.g. `Kh`.
    /// `None` leaves the server setting untouched.
    pub notify_events: Option<String>,
    /// Pattern passed to PSUBSCRIBE.
    pub channel: String,
}

impl Default for LiveStoreConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            notify_events: Some("Kh".to_string()),
            channel: "__keyspace@0__:*".to_string(),
        }
    }
}

/// Full daemon configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub live: LiveStoreConfig,
    /// Directory of the fjall keyspace.
    pub data_dir: PathBuf,
    /// Address the admin command server listens on.
    pub admin_addr: SocketAddr,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Periodic fjall journal fsync (ms). `None` or 0 disables it.
    pub fsync_ms: Option<u16>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            live: LiveStoreConfig::default(),
            data_dir: PathBuf::from("./data"),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 16390)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
            fsync_ms: None,
        }
    }
}

impl MirrorConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: MirrorConfig = serde_json::from_slice(&content)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.queue_capacity > 0, "queue_capacity must be at least 1");
        anyhow::ensure!(!self.live.addr.trim().is_empty(), "live store address is empty");
        anyhow::ensure!(!self.live.channel.trim().is_empty(), "subscription channel is empty");
        Ok(())
    }
}
