use std::sync::Arc;

use crate::config::MirrorConfig;
use crate::durable::BackupStore;
use crate::live::LiveStore;
use crate::monitor::{Monitor, MonitorHandle};
use crate::queue::{change_queue, QueueSender};
use crate::stats::PipelineStats;
use crate::storer::{Storer, StorerHandle};

/// Running capture pipeline: monitor -> change queue -> storer.
pub struct Pipeline {
    monitor: MonitorHandle,
    storer: StorerHandle,
    queue: QueueSender,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Start both tasks. The monitor and the storer each get their own
    /// live-store client so a blocked subscription never stalls reads.
    pub fn start(
        cfg: &MirrorConfig,
        monitor_live: Arc<dyn LiveStore>,
        storer_live: Arc<dyn LiveStore>,
        backup: BackupStore,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        let (queue, receiver) = change_queue(cfg.queue_capacity);
        let storer = Storer::new(storer_live, backup, cfg.retry, stats.clone()).start(receiver);
        let monitor = Monitor::new(monitor_live, cfg.live.channel.clone(), cfg.retry, stats.clone())
            .start(queue.clone());
        tracing::info!(
            channel = %cfg.live.channel,
            queue_capacity = queue.capacity(),
            "capture pipeline started"
        );
        Self {
            monitor,
            storer,
            queue,
            stats,
        }
    }

    pub fn queue(&self) -> QueueSender {
        self.queue.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Stop capture, then let the storer drain what is already queued.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let monitor = self.monitor.stop().await;
        if let Err(err) = &monitor {
            tracing::warn!(error = ?err, "monitor stopped with error");
        }
        tracing::info!(queued = self.queue.len(), "monitor stopped; draining change queue");
        self.storer.stop().await?;
        tracing::info!(stats = ?self.stats.snapshot(), "capture pipeline stopped");
        monitor
    }
}
