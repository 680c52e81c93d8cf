//! Change capture: keyspace notifications in, record keys onto the queue.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::live::{ChangeStream, LiveStore};
use crate::queue::QueueSender;
use crate::retry::RetryPolicy;
use crate::stats::PipelineStats;

pub struct Monitor {
    live: Arc<dyn LiveStore>,
    pattern: String,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
}

pub struct MonitorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl MonitorHandle {
    /// Unsubscribe and wait for the capture loop to exit.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("monitor task join failed: {err}")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum StreamEnd {
    Shutdown,
    Lost,
}

impl Monitor {
    pub fn new(
        live: Arc<dyn LiveStore>,
        pattern: impl Into<String>,
        policy: RetryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            live,
            pattern: pattern.into(),
            policy,
            stats,
        }
    }

    pub fn start(self, queue: QueueSender) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move { self.run(queue, shutdown_rx).await });
        MonitorHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn run(
        self,
        queue: QueueSender,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let subscribed = tokio::select! {
                _ = &mut shutdown_rx => return Ok(()),
                res = self.live.subscribe(&self.pattern) => res,
            };
            match subscribed {
                Ok(stream) => {
                    tracing::info!(pattern = %self.pattern, "subscribed to change notifications");
                    match self
                        .forward(stream, &queue, &mut shutdown_rx, &mut attempt)
                        .await
                    {
                        StreamEnd::Shutdown => return Ok(()),
                        StreamEnd::Lost => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(pattern = %self.pattern, error = ?err, "subscribe failed");
                }
            }

            let wait = self.policy.delay(attempt);
            tracing::warn!(
                attempt,
                wait_ms = wait.as_millis() as u64,
                "change subscription down; notifications are not captured until it is restored"
            );
            tokio::select! {
                _ = &mut shutdown_rx => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
            attempt = attempt.saturating_add(1);
            let reconnects = self.stats.record_monitor_reconnect();
            if let Err(err) = self.live.reconnect().await {
                tracing::warn!(attempt, reconnects, error = ?err, "monitor reconnect failed");
            }
        }
    }

    async fn forward(
        &self,
        mut stream: ChangeStream,
        queue: &QueueSender,
        shutdown_rx: &mut oneshot::Receiver<()>,
        attempt: &mut u32,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = &mut *shutdown_rx => return StreamEnd::Shutdown,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    tracing::warn!(error = ?err, "change subscription failed");
                    return StreamEnd::Lost;
                }
                None => {
                    tracing::warn!("change subscription closed");
                    return StreamEnd::Lost;
                }
            };
            // A delivered event proves the subscription is healthy again.
            *attempt = 0;
            self.stats.record_event();
            let key = event.key().to_string();
            tracing::trace!(key = %key, event = %event.payload, "change notification");
            tokio::select! {
                _ = &mut *shutdown_rx => return StreamEnd::Shutdown,
                pushed = queue.push(key) => {
                    if pushed.is_err() {
                        tracing::warn!("change queue closed; monitor exiting");
                        return StreamEnd::Shutdown;
                    }
                    self.stats.record_queued();
                }
            }
        }
    }
}
