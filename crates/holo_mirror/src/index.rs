//! Durable-store key layout for backup entries.
//!
//! Every backup entry lives under `INDEX_KEY_PREFIX ++ record_key`. The prefix
//! is fixed width and reserves the contiguous range
//! `[RANGE_START, RANGE_END]` for this subsystem, so scans over backup entries
//! never touch other tenants of the same keyspace (for example a search index
//! sharing the partition).
//!
//! Record keys are UTF-8 strings and UTF-8 never contains the byte `0xFF`,
//! which is what makes `RANGE_END = prefix ++ 0xFF` a strict upper bound for
//! every prefixed key.

/// Fixed-width marker prepended to every record key.
pub const INDEX_KEY_PREFIX: &[u8] = b"\x01mirror\x00";
/// Width of [`INDEX_KEY_PREFIX`].
pub const INDEX_KEY_LEN: usize = INDEX_KEY_PREFIX.len();
/// Lowest possible index key (the prefixed empty record key).
pub const RANGE_START: &[u8] = INDEX_KEY_PREFIX;
/// Inclusive upper bound of the backup range.
pub const RANGE_END: &[u8] = b"\x01mirror\x00\xff";

/// Build the durable-store key for a record key.
pub fn add_prefix(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_KEY_LEN + key.len());
    out.extend_from_slice(INDEX_KEY_PREFIX);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Recover the record key from a durable-store key.
///
/// Returns `None` for keys outside the backup range or with a non UTF-8 tail.
pub fn strip_prefix(index_key: &[u8]) -> Option<String> {
    let tail = index_key.strip_prefix(INDEX_KEY_PREFIX)?;
    std::str::from_utf8(tail).ok().map(str::to_string)
}

/// True when `index_key` falls inside `[RANGE_START, RANGE_END]`.
pub fn in_range(index_key: &[u8]) -> bool {
    index_key >= RANGE_START && index_key <= RANGE_END
}

/// Smallest key that sorts strictly after `key`.
///
/// Used to resume a range scan after the last key of a page.
pub fn successor(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    out
}
