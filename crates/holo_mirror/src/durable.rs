//! Durable (embedded, ordered) store holding backup snapshots.
//!
//! `DurableStore` is the raw ordered key/value capability. `BackupStore`
//! layers the record encoding and the reserved index range on top of it, and
//! is what the sink, checker, and restorer use.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use tracing::warn;

use crate::index::{self, RANGE_END, RANGE_START};
use crate::record::{self, Fields};

/// Entries fetched per range-scan page.
pub const SCAN_PAGE: usize = 512;

/// Ordered key/value store interface.
///
/// `scan` returns at most `limit` entries in `[start, end]` (both inclusive)
/// in ascending key order. Callers page through larger ranges by restarting
/// from [`index::successor`] of the last returned key, which keeps iterators
/// from being held across suspension points.
pub trait DurableStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;
    fn scan(&self, start: &[u8], end: &[u8], limit: usize)
        -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Force buffered writes to stable storage.
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fjall-backed durable store using a single partition.
pub struct FjallDurableStore {
    keyspace: Arc<Keyspace>,
    partition: fjall::PartitionHandle,
}

impl FjallDurableStore {
    pub const PARTITION: &'static str = "mirror";

    /// Open (or create) the keyspace under `dir`.
    pub fn open_dir(dir: &Path, fsync_ms: Option<u16>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create durable store dir {}", dir.display()))?;
        let mut cfg = fjall::Config::new(dir);
        if let Some(ms) = fsync_ms.filter(|ms| *ms > 0) {
            cfg = cfg.fsync_ms(Some(ms));
        }
        let keyspace = Arc::new(cfg.open().context("open fjall keyspace")?);
        Self::open(keyspace)
    }

    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let partition =
            keyspace.open_partition(Self::PARTITION, PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            partition,
        })
    }
}

impl DurableStore for FjallDurableStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.partition.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.partition.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.partition.remove(key)?;
        Ok(())
    }

    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        if start > end {
            return Ok(out);
        }
        for item in self.partition.range(start.to_vec()..=end.to_vec()) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist fjall keyspace")?;
        Ok(())
    }
}

/// In-memory ordered store, used by tests and embedded setups.
#[derive(Default)]
pub struct MemoryDurableStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryDurableStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        guard.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        guard.remove(key);
        Ok(())
    }

    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start > end {
            return Ok(Vec::new());
        }
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(guard
            .range(start.to_vec()..=end.to_vec())
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// One backup entry read from the index range.
#[derive(Clone, Debug)]
pub struct BackupEntry {
    pub key: String,
    pub blob: Vec<u8>,
}

/// Record-level view of the backup range of a durable store.
#[derive(Clone)]
pub struct BackupStore {
    store: Arc<dyn DurableStore>,
}

impl BackupStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn raw(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Overwrite the backup entry for `key`. Returns the stored payload size.
    pub fn save(&self, key: &str, fields: &Fields) -> anyhow::Result<usize> {
        let blob = record::encode_fields(fields)?;
        self.store.put(&index::add_prefix(key), &blob)?;
        Ok(blob.len())
    }

    pub fn load_raw(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.store.get(&index::add_prefix(key))
    }

    pub fn load(&self, key: &str) -> anyhow::Result<Option<Fields>> {
        match self.load_raw(key)? {
            Some(blob) => Ok(Some(
                record::decode_fields(&blob)
                    .with_context(|| format!("decode backup entry {key:?}"))?,
            )),
            None => Ok(None),
        }
    }

    /// Stored version of `key`.
    ///
    /// Outer `None`: no backup entry. Inner `None`: entry without a version.
    pub fn version(&self, key: &str) -> anyhow::Result<Option<Option<String>>> {
        match self.load_raw(key)? {
            Some(blob) => Ok(Some(
                record::decode_version(&blob)
                    .with_context(|| format!("decode backup version {key:?}"))?,
            )),
            None => Ok(None),
        }
    }

    /// Number of backup entries.
    pub fn count(&self) -> anyhow::Result<usize> {
        let mut cursor = BackupCursor::new();
        let mut total = 0usize;
        loop {
            let page = cursor.next_page(self)?;
            if page.is_empty() {
                return Ok(total);
            }
            total += page.len();
        }
    }

    /// Record keys `[start, start + count)` in index order.
    pub fn keys(&self, start: usize, count: usize) -> anyhow::Result<Vec<String>> {
        let mut cursor = BackupCursor::new();
        let mut position = 0usize;
        let mut out = Vec::with_capacity(count.min(SCAN_PAGE));
        let end = start.saturating_add(count);
        while position < end {
            let page = cursor.next_page(self)?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                if position >= start && position < end {
                    out.push(entry.key);
                }
                position += 1;
            }
        }
        Ok(out)
    }
}

/// Resumable position inside the backup range.
///
/// Pages are fetched synchronously and owned by the caller, so sweeps can
/// await live-store calls between pages without pinning a store iterator.
pub struct BackupCursor {
    next: Option<Vec<u8>>,
    page: usize,
}

impl BackupCursor {
    pub fn new() -> Self {
        Self::with_page(SCAN_PAGE)
    }

    pub fn with_page(page: usize) -> Self {
        Self {
            next: Some(RANGE_START.to_vec()),
            page: page.max(1),
        }
    }

    /// Fetch the next page; empty only once the range is exhausted.
    ///
    /// Rows whose key does not decode are skipped, and fetching continues
    /// until at least one entry survives.
    pub fn next_page(&mut self, backup: &BackupStore) -> anyhow::Result<Vec<BackupEntry>> {
        while let Some(start) = self.next.take() {
            let rows = backup.store.scan(&start, RANGE_END, self.page)?;
            if rows.len() == self.page {
                if let Some((last, _)) = rows.last() {
                    self.next = Some(index::successor(last));
                }
            }
            let mut out = Vec::with_capacity(rows.len());
            for (index_key, blob) in rows {
                match index::strip_prefix(&index_key) {
                    Some(key) => out.push(BackupEntry { key, blob }),
                    None => {
                        warn!(key = ?index_key, "skipping malformed index key in backup range")
                    }
                }
            }
            if !out.is_empty() {
                return Ok(out);
            }
        }
        Ok(Vec::new())
    }
}

impl Default for BackupCursor {
    fn default() -> Self {
        Self::new()
    }
}
