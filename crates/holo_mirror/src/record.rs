//! Hash records and their serialized backup form.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Reserved field holding the producer-assigned version marker.
pub const VERSION_FIELD: &str = "version";

/// Field map of one hash record.
///
/// A `BTreeMap` keeps serialization order stable, so saving unchanged data
/// twice produces byte-identical entries.
pub type Fields = BTreeMap<String, String>;

/// Serialize a field map into the blob stored in the durable store.
pub fn encode_fields(fields: &Fields) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(fields)?)
}

/// Decode a durable-store blob back into a field map.
pub fn decode_fields(data: &[u8]) -> anyhow::Result<Fields> {
    Ok(serde_json::from_slice(data)?)
}

#[derive(Deserialize)]
struct VersionOnly {
    #[serde(default)]
    version: Option<String>,
}

/// Read only the `version` field of a stored blob. Other fields are skipped
/// by the parser without being materialized.
pub fn decode_version(data: &[u8]) -> anyhow::Result<Option<String>> {
    let decoded: VersionOnly = serde_json::from_slice(data)?;
    Ok(decoded.version)
}

/// Version marker of a record, if the producer set one.
pub fn version_of(fields: &Fields) -> Option<&str> {
    fields.get(VERSION_FIELD).map(String::as_str)
}

/// Field-level difference between a live hash (left) and its backup (right).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldDiff {
    /// `(field, live value, backup value)` for fields present on both sides.
    pub changed: Vec<(String, String, String)>,
    pub only_live: Vec<String>,
    pub only_backup: Vec<String>,
}

impl FieldDiff {
    pub fn between(live: &Fields, backup: &Fields) -> Self {
        let mut diff = FieldDiff::default();
        for (field, left) in live {
            match backup.get(field) {
                Some(right) if right != left => {
                    diff.changed
                        .push((field.clone(), left.clone(), right.clone()));
                }
                Some(_) => {}
                None => diff.only_live.push(field.clone()),
            }
        }
        for field in backup.keys() {
            if !live.contains_key(field) {
                diff.only_backup.push(field.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.only_live.is_empty() && self.only_backup.is_empty()
    }
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "left:live, right:backup")?;
        if self.is_empty() {
            return writeln!(f, "perfect match");
        }
        for (field, left, right) in &self.changed {
            writeln!(f, "{field} < {left}, {right}")?;
        }
        for field in &self.only_live {
            writeln!(f, "{field}, only in left")?;
        }
        for field in &self.only_backup {
            writeln!(f, "{field}, only in right")?;
        }
        Ok(())
    }
}

/// Render a record the way the `dump` admin command prints it.
pub fn render_fields(fields: &Fields) -> String {
    let mut out = String::from("content:\n");
    for (field, value) in fields {
        out.push_str(field);
        out.push_str(":\t");
        out.push_str(value);
        out.push('\n');
    }
    out
}
