//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use holo_mirror::{
    BackupStore, Fields, FjallDurableStore, LiveClients, MemoryLiveStore, MirrorConfig,
    MirrorNode, RetryPolicy,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Timeout for captures and command round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// A mirror node over an in-process live store and a fjall keyspace in a
/// temporary directory.
pub struct TestMirror {
    pub live: Arc<MemoryLiveStore>,
    pub backup: BackupStore,
    pub node: MirrorNode,
    pub dir: tempfile::TempDir,
}

pub fn fields(pairs: &[(&str, &str)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn test_config() -> MirrorConfig {
    MirrorConfig {
        admin_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        queue_capacity: 64,
        retry: RetryPolicy {
            unit_ms: 10,
            cap_steps: 3,
            max_attempts: None,
        },
        ..MirrorConfig::default()
    }
}

/// Config whose subscription matches nothing, so only `sync` commands
/// reach the storer.
pub fn quiet_config() -> MirrorConfig {
    let mut cfg = test_config();
    cfg.live.channel = "__keyspace@99__:*".to_string();
    cfg
}

pub fn open_backup(dir: &Path) -> BackupStore {
    let store = FjallDurableStore::open_dir(dir, None).expect("open fjall keyspace");
    BackupStore::new(Arc::new(store))
}

pub async fn start_mirror(cfg: MirrorConfig) -> TestMirror {
    let dir = tempfile::tempdir().expect("temp dir");
    let live = Arc::new(MemoryLiveStore::new());
    let backup = open_backup(dir.path());
    let node = MirrorNode::start(&cfg, LiveClients::shared(live.clone()), backup.clone())
        .await
        .expect("start mirror");
    TestMirror {
        live,
        backup,
        node,
        dir,
    }
}

/// Poll `check` until it holds or `IO_TIMEOUT` passes.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Block until the monitor is subscribed: keep touching `key` until a
/// capture of it shows up in the backup.
pub async fn wait_for_capture_ready(mirror: &TestMirror, key: &str) {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        mirror.live.hset(key, &fields(&[("version", "0")]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        if matches!(mirror.backup.load(key), Ok(Some(_))) {
            return;
        }
    }
    panic!("monitor never started capturing");
}

/// Minimal RESP client for the admin port.
pub struct AdminClient {
    reader: BufReader<TcpStream>,
}

impl AdminClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timeout")
            .expect("connect admin port");
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send one command. `Ok` carries a bulk reply, `Err` an error reply.
    pub async fn send_command(&mut self, parts: &[&str]) -> Result<String, String> {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            buf.extend_from_slice(part.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        let stream = self.reader.get_mut();
        stream.write_all(&buf).await.expect("write resp command");
        stream.flush().await.ok();

        tokio::time::timeout(IO_TIMEOUT, read_reply(&mut self.reader))
            .await
            .expect("reply timeout")
    }
}

async fn read_reply(reader: &mut BufReader<TcpStream>) -> Result<String, String> {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("read reply line");
    let line = line.trim_end_matches("\r\n");
    let (kind, rest) = line.split_at(1);
    match kind {
        "+" => Ok(rest.to_string()),
        "-" => Err(rest.to_string()),
        "$" => {
            let len: i64 = rest.parse().expect("bulk length");
            if len < 0 {
                return Ok(String::new());
            }
            let mut body = vec![0u8; len as usize + 2];
            reader.read_exact(&mut body).await.expect("read bulk body");
            body.truncate(len as usize);
            Ok(String::from_utf8(body).expect("utf8 reply"))
        }
        other => panic!("unexpected reply type {other:?} in {line:?}"),
    }
}
