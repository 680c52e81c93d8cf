//! Live vs backup verification.
//!
//! `check` walks the backup range and compares full field maps; `fast_check`
//! walks the live key list and compares only the `version` field. Both are
//! read-only against both stores.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::durable::{BackupCursor, BackupStore};
use crate::live::LiveStore;
use crate::record::{self, FieldDiff, Fields, VERSION_FIELD};

const FAST_CHECK_PROGRESS_EVERY: usize = 1000;

/// Per-key verification result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyVerdict {
    Match,
    Mismatch,
    MissInBackup,
    MissInLive,
}

/// Full field-map comparison used by the exhaustive check.
///
/// Differing field counts are a mismatch; an empty live hash against a
/// non-empty backup is reported as `MissInLive`.
pub fn compare_fields(live: &Fields, backup: &Fields) -> KeyVerdict {
    if live.len() != backup.len() {
        if live.is_empty() {
            return KeyVerdict::MissInLive;
        }
        return KeyVerdict::Mismatch;
    }
    let differs = live
        .iter()
        .any(|(field, value)| backup.get(field) != Some(value));
    if differs {
        KeyVerdict::Mismatch
    } else {
        KeyVerdict::Match
    }
}

/// Version-only comparison used by the fast check. Exact string equality.
pub fn classify_versions(live: &str, backup: Option<&str>) -> KeyVerdict {
    match backup {
        None => KeyVerdict::MissInBackup,
        Some(stored) if stored != live => KeyVerdict::Mismatch,
        Some(_) => KeyVerdict::Match,
    }
}

/// Live key count relative to the number of backup entries scanned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    Equal,
    LiveFewer { live: usize, backup: usize },
    LiveMore { live: usize, backup: usize },
    /// Live key list could not be read.
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Backup entries compared against the live store.
    pub compared: usize,
    /// Mismatches, `missing_in_live` included.
    pub mismatched: usize,
    pub missing_in_live: usize,
    /// Entries skipped for malformed payloads or live read errors.
    pub errors: usize,
    /// Backup entries scanned, errors included.
    pub scanned: usize,
    pub live_keys: Option<usize>,
}

impl CheckReport {
    pub fn cardinality(&self) -> Cardinality {
        let Some(live) = self.live_keys else {
            return Cardinality::Unknown;
        };
        let backup = self.scanned;
        match live.cmp(&backup) {
            std::cmp::Ordering::Equal => Cardinality::Equal,
            std::cmp::Ordering::Less => Cardinality::LiveFewer { live, backup },
            std::cmp::Ordering::Greater => Cardinality::LiveMore { live, backup },
        }
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} counts, {} keys mismatch", self.compared, self.mismatched)?;
        match self.cardinality() {
            Cardinality::Equal => writeln!(
                f,
                "{} key compared, {} mismatch",
                self.compared, self.mismatched
            )?,
            Cardinality::LiveFewer { live, backup } => writeln!(
                f,
                "live key amount is less than backup:{live} vs {backup}"
            )?,
            Cardinality::LiveMore { live, backup } => writeln!(
                f,
                "live key amount is larger than backup:{live} vs {backup}"
            )?,
            Cardinality::Unknown => writeln!(f, "live key amount unavailable")?,
        }
        if self.missing_in_live > 0 {
            writeln!(f, "missing in live: {}", self.missing_in_live)?;
        }
        if self.errors > 0 {
            writeln!(f, "errors: {}", self.errors)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FastCheckReport {
    pub total: usize,
    pub miss: usize,
    pub mismatch: usize,
    pub matched: usize,
    pub errors: usize,
    /// Offending keys, collected only in detail mode.
    pub miss_keys: Option<Vec<String>>,
    pub mismatch_keys: Option<Vec<String>>,
}

impl FastCheckReport {
    fn new(detail: bool) -> Self {
        Self {
            miss_keys: detail.then(Vec::new),
            mismatch_keys: detail.then(Vec::new),
            ..Self::default()
        }
    }

    fn record(&mut self, key: &str, verdict: KeyVerdict) {
        match verdict {
            KeyVerdict::Match => self.matched += 1,
            KeyVerdict::Mismatch | KeyVerdict::MissInLive => {
                self.mismatch += 1;
                if let Some(keys) = self.mismatch_keys.as_mut() {
                    keys.push(key.to_string());
                }
            }
            KeyVerdict::MissInBackup => {
                self.miss += 1;
                if let Some(keys) = self.miss_keys.as_mut() {
                    keys.push(key.to_string());
                }
            }
        }
    }
}

impl fmt::Display for FastCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fast check results:")?;
        writeln!(f, "total: {}", self.total)?;
        writeln!(f, "miss: {}", self.miss)?;
        writeln!(f, "mismatch: {}", self.mismatch)?;
        writeln!(f, "match: {}", self.matched)?;
        if self.errors > 0 {
            writeln!(f, "errors: {}", self.errors)?;
        }
        if let Some(keys) = self.mismatch_keys.as_ref().filter(|keys| !keys.is_empty()) {
            writeln!(f, "mismatch keys: {}", keys.join(", "))?;
        }
        if let Some(keys) = self.miss_keys.as_ref().filter(|keys| !keys.is_empty()) {
            writeln!(f, "miss keys: {}", keys.join(", "))?;
        }
        Ok(())
    }
}

pub struct Checker {
    live: Arc<dyn LiveStore>,
    backup: BackupStore,
}

impl Checker {
    pub fn new(live: Arc<dyn LiveStore>, backup: BackupStore) -> Self {
        Self { live, backup }
    }

    /// Exhaustive comparison of every backup entry with its live hash.
    pub async fn check(&self) -> anyhow::Result<CheckReport> {
        let mut report = CheckReport::default();
        report.live_keys = match self.live.list_keys("*").await {
            Ok(keys) => Some(keys.len()),
            Err(err) => {
                warn!(error = ?err, "check: listing live keys failed");
                None
            }
        };

        let mut cursor = BackupCursor::new();
        loop {
            let page = cursor.next_page(&self.backup)?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                report.scanned += 1;
                let backup = match record::decode_fields(&entry.blob) {
                    Ok(fields) => fields,
                    Err(err) => {
                        report.errors += 1;
                        warn!(key = %entry.key, error = ?err, "check: malformed backup entry");
                        continue;
                    }
                };
                let live = match self.live.get_all_fields(&entry.key).await {
                    Ok(fields) => fields,
                    Err(err) => {
                        report.errors += 1;
                        warn!(key = %entry.key, error = ?err, "check: live read failed");
                        continue;
                    }
                };
                report.compared += 1;
                match compare_fields(&live, &backup) {
                    KeyVerdict::Match | KeyVerdict::MissInBackup => {}
                    KeyVerdict::Mismatch => {
                        report.mismatched += 1;
                        let diff = FieldDiff::between(&live, &backup);
                        warn!(
                            key = %entry.key,
                            changed = ?diff.changed,
                            only_live = ?diff.only_live,
                            only_backup = ?diff.only_backup,
                            "check: mismatch"
                        );
                    }
                    KeyVerdict::MissInLive => {
                        report.mismatched += 1;
                        report.missing_in_live += 1;
                        warn!(key = %entry.key, backup_fields = backup.len(), "check: missing in live");
                    }
                }
            }
        }
        info!(
            compared = report.compared,
            mismatched = report.mismatched,
            errors = report.errors,
            "check finished"
        );
        Ok(report)
    }

    /// Version-only comparison of every live key with its backup entry.
    pub async fn fast_check(&self, detail: bool) -> anyhow::Result<FastCheckReport> {
        let mut keys = self.live.list_keys("*").await?;
        keys.sort();
        let mut report = FastCheckReport::new(detail);
        report.total = keys.len();

        for (i, key) in keys.iter().enumerate() {
            if i % FAST_CHECK_PROGRESS_EVERY == 0 {
                info!(progress = i, total = report.total, "fast check progress");
            }
            let live_version = match self.live.get_field(key, VERSION_FIELD).await {
                Ok(version) => version.unwrap_or_default(),
                Err(err) => {
                    report.errors += 1;
                    warn!(key = %key, error = ?err, "fast check: live read failed");
                    continue;
                }
            };
            let backup_version = match self.backup.version(key) {
                Ok(version) => version.map(Option::unwrap_or_default),
                Err(err) => {
                    report.errors += 1;
                    warn!(key = %key, error = ?err, "fast check: backup read failed");
                    continue;
                }
            };
            let verdict = classify_versions(&live_version, backup_version.as_deref());
            report.record(key, verdict);
        }
        info!(
            total = report.total,
            miss = report.miss,
            mismatch = report.mismatch,
            errors = report.errors,
            "fast check finished"
        );
        Ok(report)
    }

    /// Field-level diff of one key. `None` when the key has no backup entry.
    pub async fn diff(&self, key: &str) -> anyhow::Result<Option<FieldDiff>> {
        let live = self.live.get_all_fields(key).await?;
        let Some(backup) = self.backup.load(key)? else {
            return Ok(None);
        };
        Ok(Some(FieldDiff::between(&live, &backup)))
    }
}
