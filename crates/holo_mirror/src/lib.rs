//! Continuous backup of Redis hashes into an embedded fjall keyspace.
//!
//! Keyspace notifications drive a bounded capture pipeline (`monitor` ->
//! `queue` -> `storer`) that overwrites one JSON blob per record under a
//! reserved key range. `checker` and `restore` compare and repair the two
//! stores on demand; `admin` exposes them as text commands over RESP.

pub mod admin;
pub mod checker;
pub mod config;
pub mod durable;
pub mod index;
pub mod live;
pub mod monitor;
pub mod node;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod restore;
pub mod retry;
pub mod stats;
pub mod storer;

pub use config::{LiveStoreConfig, MirrorConfig};
pub use durable::{BackupStore, DurableStore, FjallDurableStore, MemoryDurableStore};
pub use live::{LiveStore, MemoryLiveStore, RespLiveStore};
pub use node::{run_node, run_node_with_shutdown, LiveClients, MirrorNode};
pub use record::Fields;
pub use retry::RetryPolicy;
