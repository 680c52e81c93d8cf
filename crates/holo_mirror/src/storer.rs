//! Durable sink: single consumer of the change queue.
//!
//! Each dequeued key is re-read from the live store and its full field map
//! overwrites the backup entry, so duplicate keys in the queue coalesce to the
//! latest live state.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::durable::{BackupStore, DurableStore};
use crate::live::{KeyKind, LiveStore};
use crate::queue::QueueReceiver;
use crate::record::Fields;
use crate::retry::RetryPolicy;
use crate::stats::PipelineStats;

/// What happened to one dequeued key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved { bytes: usize },
    /// Key holds something other than a hash (or nothing at all).
    NotHash(KeyKind),
    /// Durable write failed; the key was dropped.
    Dropped,
    /// Live reads failed on every attempt the policy allowed.
    Failed,
}

pub struct Storer {
    live: Arc<dyn LiveStore>,
    backup: BackupStore,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
}

pub struct StorerHandle {
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl StorerHandle {
    /// Close the queue, persist every key still queued, then return.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("storer task join failed: {err}")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Storer {
    pub fn new(
        live: Arc<dyn LiveStore>,
        backup: BackupStore,
        policy: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            live,
            backup,
            policy,
            stats,
        }
    }

    pub fn start(self, queue: QueueReceiver) -> StorerHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(async move { self.run(queue, close_rx).await });
        StorerHandle {
            close_tx: Some(close_tx),
            task,
        }
    }

    async fn run(
        self,
        mut queue: QueueReceiver,
        mut close_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut closing = false;
        tokio::select! {
            _ = &mut close_rx => closing = true,
            _ = self.connect() => {}
        }
        if closing {
            queue.close();
        }

        loop {
            let next = if closing {
                queue.pop().await
            } else {
                tokio::select! {
                    _ = &mut close_rx => {
                        closing = true;
                        queue.close();
                        tracing::info!("change queue closed; draining");
                        continue;
                    }
                    key = queue.pop() => key,
                }
            };
            let Some(key) = next else {
                break;
            };
            self.persist(&key).await;
        }

        if let Err(err) = self.backup.raw().flush() {
            tracing::warn!(error = ?err, "durable flush after drain failed");
        }
        tracing::info!(stats = ?self.stats.snapshot(), "storer stopped");
        Ok(())
    }

    /// Dial the live store, backing off until it answers.
    async fn connect(&self) {
        let mut attempt: u32 = 0;
        loop {
            match self.live.reconnect().await {
                Ok(()) => {
                    tracing::info!(attempt, "storer connected to live store");
                    return;
                }
                Err(err) => {
                    let wait = self.policy.delay(attempt);
                    tracing::warn!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = ?err,
                        "storer connect failed"
                    );
                    tokio::time::sleep(wait).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Persist the current live state of `key`.
    pub async fn persist(&self, key: &str) -> PersistOutcome {
        let mut attempt: u32 = 0;
        let fields = loop {
            match self.read_hash(key).await {
                Ok(Ok(fields)) => break fields,
                Ok(Err(kind)) => {
                    let skipped = self.stats.record_skipped();
                    tracing::info!(key = %key, kind = %kind, skipped, "not a hash; skipped");
                    return PersistOutcome::NotHash(kind);
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    if !self.policy.allows(attempt) {
                        let failed = self.stats.record_failed();
                        tracing::error!(
                            key = %key,
                            attempts = attempt,
                            failed,
                            error = ?err,
                            "giving up on key after repeated live store errors"
                        );
                        return PersistOutcome::Failed;
                    }
                    tracing::warn!(key = %key, attempt, error = ?err, "live store read failed");
                    self.reconnect_with_backoff(attempt - 1).await;
                }
            }
        };

        match self.backup.save(key, &fields) {
            Ok(bytes) => {
                let saved = self.stats.record_saved();
                tracing::info!(key = %key, fields = fields.len(), bytes, saved, "saved record");
                PersistOutcome::Saved { bytes }
            }
            Err(err) => {
                let dropped = self.stats.record_dropped();
                tracing::error!(key = %key, dropped, error = ?err, "durable write failed; key dropped");
                PersistOutcome::Dropped
            }
        }
    }

    /// Outer error is a live-store failure; inner error is the key's type when
    /// it is not a hash.
    async fn read_hash(&self, key: &str) -> anyhow::Result<Result<Fields, KeyKind>> {
        let kind = self.live.type_of(key).await?;
        if kind != KeyKind::Hash {
            return Ok(Err(kind));
        }
        Ok(Ok(self.live.get_all_fields(key).await?))
    }

    async fn reconnect_with_backoff(&self, attempt: u32) {
        let wait = self.policy.delay(attempt);
        tokio::time::sleep(wait).await;
        let reconnects = self.stats.record_storer_reconnect();
        match self.live.reconnect().await {
            Ok(()) => tracing::info!(attempt, reconnects, "storer reconnected"),
            Err(err) => tracing::warn!(attempt, reconnects, error = ?err, "storer reconnect failed"),
        }
    }
}
