use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use holo_mirror::MirrorConfig;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-mirror")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture pipeline and the admin server.
    Node(NodeArgs),
}

/// CLI options for running the mirror. Flags override `--config`.
#[derive(Parser, Debug)]
struct NodeArgs {
    /// JSON file holding a full or partial config.
    #[arg(long, env = "HOLO_MIRROR_CONFIG")]
    config: Option<PathBuf>,

    /// Live store address (host:port).
    #[arg(long, env = "HOLO_MIRROR_LIVE_ADDR")]
    live_addr: Option<String>,

    #[arg(long, env = "HOLO_MIRROR_LIVE_PASSWORD")]
    live_password: Option<String>,

    #[arg(long, env = "HOLO_MIRROR_LIVE_DB")]
    live_db: Option<u32>,

    /// Applied as `notify-keyspace-events` at subscribe time. Empty leaves
    /// the server setting untouched.
    #[arg(long, env = "HOLO_MIRROR_NOTIFY_EVENTS")]
    notify_events: Option<String>,

    /// PSUBSCRIBE pattern. Defaults to the keyspace channel of the live db.
    #[arg(long, env = "HOLO_MIRROR_CHANNEL")]
    channel: Option<String>,

    #[arg(long, env = "HOLO_MIRROR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "HOLO_MIRROR_ADMIN_ADDR")]
    admin_addr: Option<SocketAddr>,

    #[arg(long, env = "HOLO_MIRROR_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// One reconnect backoff step (ms).
    #[arg(long, env = "HOLO_MIRROR_RETRY_UNIT_MS")]
    retry_unit_ms: Option<u64>,

    /// Backoff stops growing after this many steps.
    #[arg(long, env = "HOLO_MIRROR_RETRY_CAP_STEPS")]
    retry_cap_steps: Option<u32>,

    /// Give up on a key after this many failed live reads (default: never).
    #[arg(long, env = "HOLO_MIRROR_RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,

    #[arg(long, env = "HOLO_MIRROR_FJALL_FSYNC_MS")]
    fjall_fsync_ms: Option<u16>,

    /// Also append logs (without colors) to this file.
    #[arg(long, env = "HOLO_MIRROR_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl NodeArgs {
    fn into_config(self) -> anyhow::Result<MirrorConfig> {
        let mut cfg = match &self.config {
            Some(path) => MirrorConfig::from_json_file(path)?,
            None => MirrorConfig::default(),
        };
        if let Some(addr) = self.live_addr {
            cfg.live.addr = addr;
        }
        if let Some(password) = self.live_password {
            cfg.live.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(db) = self.live_db {
            cfg.live.db = db;
            if self.channel.is_none() {
                cfg.live.channel = format!("__keyspace@{db}__:*");
            }
        }
        if let Some(events) = self.notify_events {
            cfg.live.notify_events = Some(events).filter(|e| !e.is_empty());
        }
        if let Some(channel) = self.channel {
            cfg.live.channel = channel;
        }
        if let Some(dir) = self.data_dir {
            cfg.data_dir = dir;
        }
        if let Some(addr) = self.admin_addr {
            cfg.admin_addr = addr;
        }
        if let Some(capacity) = self.queue_capacity {
            cfg.queue_capacity = capacity;
        }
        if let Some(unit_ms) = self.retry_unit_ms {
            cfg.retry.unit_ms = unit_ms;
        }
        if let Some(cap) = self.retry_cap_steps {
            cfg.retry.cap_steps = cap;
        }
        if let Some(max) = self.retry_max_attempts {
            cfg.retry.max_attempts = Some(max);
        }
        if let Some(ms) = self.fjall_fsync_ms {
            cfg.fsync_ms = Some(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => {
            init_logging(args.log_file.as_deref())?;
            let cfg = args.into_config()?;
            holo_mirror::run_node(cfg).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_args(argv: &[&str]) -> NodeArgs {
        let mut full = vec!["holo-mirror", "node"];
        full.extend_from_slice(argv);
        match Args::try_parse_from(full).expect("parse args").cmd {
            Command::Node(args) => args,
        }
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = node_args(&[
            "--live-addr",
            "10.1.1.1:7000",
            "--live-db",
            "2",
            "--queue-capacity",
            "16",
            "--retry-max-attempts",
            "5",
        ])
        .into_config()
        .unwrap();
        assert_eq!(cfg.live.addr, "10.1.1.1:7000");
        assert_eq!(cfg.live.db, 2);
        assert_eq!(cfg.live.channel, "__keyspace@2__:*");
        assert_eq!(cfg.queue_capacity, 16);
        assert_eq!(cfg.retry.max_attempts, Some(5));
        assert_eq!(cfg.retry.unit_ms, 1_000);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        std::fs::write(
            &path,
            br#"{"live":{"addr":"file-host:6379"},"queue_capacity":32}"#,
        )
        .unwrap();
        let cfg = node_args(&[
            "--config",
            path.to_str().unwrap(),
            "--queue-capacity",
            "8",
            "--notify-events",
            "",
        ])
        .into_config()
        .unwrap();
        assert_eq!(cfg.live.addr, "file-host:6379");
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.live.notify_events, None);
    }

    #[test]
    fn zero_capacity_flag_is_rejected() {
        assert!(node_args(&["--queue-capacity", "0"]).into_config().is_err());
    }
}
