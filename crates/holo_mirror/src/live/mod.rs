//! Live (volatile) store capability.
//!
//! The pipeline only needs a handful of hash operations plus a change
//! notification stream. `RespLiveStore` speaks RESP2 to a Redis-compatible
//! server; `MemoryLiveStore` keeps hashes in process and is used by tests and
//! embedded setups.

mod memory;
mod resp;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::record::Fields;

pub use memory::MemoryLiveStore;
pub use resp::RespLiveStore;

/// Stream of change notifications. It ends when the subscription is lost.
pub type ChangeStream = BoxStream<'static, anyhow::Result<ChangeEvent>>;

/// Value type of a live-store key, as reported by `TYPE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    None,
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
    Other(String),
}

impl KeyKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "none" => KeyKind::None,
            "string" => KeyKind::String,
            "list" => KeyKind::List,
            "set" => KeyKind::Set,
            "zset" => KeyKind::ZSet,
            "hash" => KeyKind::Hash,
            "stream" => KeyKind::Stream,
            other => KeyKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KeyKind::None => "none",
            KeyKind::String => "string",
            KeyKind::List => "list",
            KeyKind::Set => "set",
            KeyKind::ZSet => "zset",
            KeyKind::Hash => "hash",
            KeyKind::Stream => "stream",
            KeyKind::Other(name) => name,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification delivered on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub channel: String,
    pub payload: String,
}

impl ChangeEvent {
    /// Record key affected by this event.
    ///
    /// Keyspace channels (`__keyspace@<db>__:<key>`) carry the key in the
    /// channel name and the event name in the payload; every other channel,
    /// keyevent channels included, carries the key as the payload.
    pub fn key(&self) -> &str {
        if self.channel.starts_with("__keyspace@") {
            if let Some((_, key)) = self.channel.split_once(':') {
                return key;
            }
        }
        &self.payload
    }
}

/// Operations the pipeline needs from the live store.
///
/// Implementations hold their own connection and must be usable from several
/// tasks; `reconnect` drops any broken connection and dials again.
#[async_trait]
pub trait LiveStore: Send + Sync + 'static {
    async fn type_of(&self, key: &str) -> anyhow::Result<KeyKind>;

    /// All fields of a hash. A missing key yields an empty map.
    async fn get_all_fields(&self, key: &str) -> anyhow::Result<Fields>;

    async fn get_field(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;

    /// Set every field in `fields` on the hash, leaving other fields intact.
    async fn set_all_fields(&self, key: &str, fields: &Fields) -> anyhow::Result<()>;

    async fn list_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;

    /// Pattern-subscribe to notification channels on a dedicated connection.
    async fn subscribe(&self, pattern: &str) -> anyhow::Result<ChangeStream>;

    async fn reconnect(&self) -> anyhow::Result<()>;
}
