//! Backup to live recovery.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::durable::{BackupCursor, BackupStore};
use crate::live::LiveStore;
use crate::record::{self, Fields};

const RESTORE_PROGRESS_EVERY: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every backup field was written to the live hash.
    Restored { fields: usize },
    /// Live hash is present and at least as new as the backup.
    Skipped {
        live_version: String,
        backup_version: String,
    },
    NoBackup,
    /// Backup entry holds no fields; nothing was written.
    EmptySnapshot,
}

impl RestoreOutcome {
    /// Operator-facing line for `key`.
    pub fn describe(&self, key: &str) -> String {
        match self {
            RestoreOutcome::Restored { fields } => format!("set key:{key} ({fields} fields)"),
            RestoreOutcome::Skipped {
                live_version,
                backup_version,
            } => format!("skip key:{key} version:{live_version} >= {backup_version}"),
            RestoreOutcome::NoBackup => format!("no backup for key:{key}"),
            RestoreOutcome::EmptySnapshot => format!("empty backup for key:{key}"),
        }
    }
}

/// Whether a restore of `backup` onto `live` must be skipped.
///
/// Versions compare as plain strings; a missing version reads as empty.
pub fn should_skip(live: &Fields, backup: &Fields) -> bool {
    let live_version = record::version_of(live).unwrap_or_default();
    let backup_version = record::version_of(backup).unwrap_or_default();
    !live.is_empty() && live_version >= backup_version
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "restore key {}, total {}", self.restored, self.total)?;
        if self.skipped > 0 || self.failed > 0 {
            writeln!(f, "skipped {}, failed {}", self.skipped, self.failed)?;
        }
        Ok(())
    }
}

/// Pushes backup snapshots into the live store.
///
/// Restores are serialized among themselves; they are not coordinated with
/// application writes or with the capture pipeline.
pub struct Restorer {
    live: Arc<dyn LiveStore>,
    backup: BackupStore,
    lock: Mutex<()>,
}

impl Restorer {
    pub fn new(live: Arc<dyn LiveStore>, backup: BackupStore) -> Self {
        Self {
            live,
            backup,
            lock: Mutex::new(()),
        }
    }

    pub async fn restore_one(&self, key: &str) -> anyhow::Result<RestoreOutcome> {
        let _guard = self.lock.lock().await;
        let Some(snapshot) = self.backup.load(key)? else {
            return Ok(RestoreOutcome::NoBackup);
        };
        self.apply(key, &snapshot).await
    }

    /// Restore every backup entry. Per-key failures are logged and counted.
    pub async fn restore_all(&self) -> anyhow::Result<RestoreSummary> {
        let _guard = self.lock.lock().await;
        let mut summary = RestoreSummary::default();
        let mut cursor = BackupCursor::new();
        loop {
            let page = cursor.next_page(&self.backup)?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                summary.total += 1;
                let applied = match record::decode_fields(&entry.blob) {
                    Ok(snapshot) => self.apply(&entry.key, &snapshot).await,
                    Err(err) => Err(err),
                };
                match applied {
                    Ok(RestoreOutcome::Restored { .. }) => summary.restored += 1,
                    Ok(outcome) => {
                        summary.skipped += 1;
                        info!("{}", outcome.describe(&entry.key));
                    }
                    Err(err) => {
                        summary.failed += 1;
                        error!(key = %entry.key, error = ?err, "restore failed");
                    }
                }
                if summary.total % RESTORE_PROGRESS_EVERY == 0 {
                    info!(progress = summary.total, restored = summary.restored, "restore progress");
                }
            }
        }
        info!(
            restored = summary.restored,
            skipped = summary.skipped,
            failed = summary.failed,
            total = summary.total,
            "restore finished"
        );
        Ok(summary)
    }

    async fn apply(&self, key: &str, snapshot: &Fields) -> anyhow::Result<RestoreOutcome> {
        if snapshot.is_empty() {
            warn!(key = %key, "backup entry has no fields; nothing to restore");
            return Ok(RestoreOutcome::EmptySnapshot);
        }
        let live = self.live.get_all_fields(key).await?;
        if should_skip(&live, snapshot) {
            return Ok(RestoreOutcome::Skipped {
                live_version: record::version_of(&live).unwrap_or_default().to_string(),
                backup_version: record::version_of(snapshot).unwrap_or_default().to_string(),
            });
        }
        self.live.set_all_fields(key, snapshot).await?;
        info!(key = %key, fields = snapshot.len(), "restored key");
        Ok(RestoreOutcome::Restored {
            fields: snapshot.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::{DurableStore, MemoryDurableStore};
    use crate::index;
    use crate::live::MemoryLiveStore;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn setup() -> (Arc<MemoryLiveStore>, BackupStore, Restorer) {
        let live = Arc::new(MemoryLiveStore::new());
        let backup = BackupStore::new(Arc::new(MemoryDurableStore::new()));
        let restorer = Restorer::new(live.clone(), backup.clone());
        (live, backup, restorer)
    }

    #[test]
    fn skip_needs_nonempty_live_at_or_above_backup() {
        let v3 = fields(&[("version", "3")]);
        let v5 = fields(&[("version", "5")]);
        assert!(should_skip(&v5, &v3));
        assert!(should_skip(&v3, &v3));
        assert!(!should_skip(&v3, &v5));
        assert!(!should_skip(&Fields::new(), &v3));
        // Plain string order: "10" sorts before "9".
        assert!(!should_skip(&fields(&[("version", "10")]), &fields(&[("version", "9")])));
        // No version on a live hash still counts as present but oldest.
        assert!(!should_skip(&fields(&[("a", "b")]), &v3));
    }

    #[tokio::test]
    async fn newer_live_hash_is_left_alone() {
        let (live, backup, restorer) = setup();
        live.hset("u1", &fields(&[("version", "5")]));
        backup.save("u1", &fields(&[("version", "3"), ("a", "old")])).unwrap();

        let outcome = restorer.restore_one("u1").await.unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Skipped {
                live_version: "5".to_string(),
                backup_version: "3".to_string()
            }
        );
        assert_eq!(live.hash("u1"), Some(fields(&[("version", "5")])));
    }

    #[tokio::test]
    async fn missing_live_hash_is_restored() {
        let (live, backup, restorer) = setup();
        backup.save("u1", &fields(&[("version", "2"), ("a", "y")])).unwrap();

        let outcome = restorer.restore_one("u1").await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { fields: 2 });
        assert_eq!(live.hash("u1"), Some(fields(&[("version", "2"), ("a", "y")])));
        assert_eq!(outcome.describe("u1"), "set key:u1 (2 fields)");
        assert_eq!(
            restorer.restore_one("nobody").await.unwrap(),
            RestoreOutcome::NoBackup
        );
    }

    #[tokio::test]
    async fn older_live_hash_keeps_extra_fields() {
        let (live, backup, restorer) = setup();
        live.hset("u1", &fields(&[("version", "1"), ("a", "x"), ("extra", "e")]));
        backup.save("u1", &fields(&[("version", "2"), ("a", "y")])).unwrap();

        restorer.restore_one("u1").await.unwrap();
        assert_eq!(
            live.hash("u1"),
            Some(fields(&[("version", "2"), ("a", "y"), ("extra", "e")]))
        );
    }

    #[tokio::test]
    async fn empty_snapshot_is_not_counted_as_restored() {
        let (live, backup, restorer) = setup();
        backup.save("hollow", &Fields::new()).unwrap();

        let outcome = restorer.restore_one("hollow").await.unwrap();
        assert_eq!(outcome, RestoreOutcome::EmptySnapshot);
        assert_eq!(outcome.describe("hollow"), "empty backup for key:hollow");
        assert_eq!(live.hash("hollow"), None);

        let summary = restorer.restore_all().await.unwrap();
        assert_eq!(summary.restored, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn restore_all_counts_write_failures_and_continues() {
        let (live, backup, restorer) = setup();
        for key in ["a", "b", "c"] {
            backup.save(key, &fields(&[("version", "1")])).unwrap();
        }

        live.fail_next_writes(1);
        let summary = restorer.restore_all().await.unwrap();
        assert_eq!(
            summary,
            RestoreSummary {
                restored: 2,
                skipped: 0,
                failed: 1,
                total: 3
            }
        );
        assert!(summary.to_string().ends_with("skipped 0, failed 1\n"));
        assert_eq!(live.hash("a"), None);
        assert_eq!(live.hash("b"), Some(fields(&[("version", "1")])));
        assert_eq!(live.hash("c"), Some(fields(&[("version", "1")])));
    }

    #[tokio::test]
    async fn restore_all_continues_past_failures() {
        let (live, backup, restorer) = setup();
        backup.save("a", &fields(&[("version", "1")])).unwrap();
        backup.save("b", &fields(&[("version", "1")])).unwrap();
        live.hset("b", &fields(&[("version", "9")]));
        backup
            .raw()
            .put(&index::add_prefix("c"), b"{broken")
            .unwrap();
        live.set_text("d", "plain");
        backup.save("d", &fields(&[("version", "1")])).unwrap();

        let summary = restorer.restore_all().await.unwrap();
        assert_eq!(
            summary,
            RestoreSummary {
                restored: 1,
                skipped: 1,
                failed: 2,
                total: 4
            }
        );
        assert!(summary.to_string().starts_with("restore key 1, total 4\n"));
        assert_eq!(live.hash("a"), Some(fields(&[("version", "1")])));
    }
}
