//! Process bootstrap: storage, live-store clients, pipeline and admin server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::admin::{AdminContext, AdminServer, AdminServerHandle, ShutdownRequest};
use crate::config::{LiveStoreConfig, MirrorConfig};
use crate::durable::{BackupStore, DurableStore, FjallDurableStore};
use crate::live::{LiveStore, RespLiveStore};
use crate::pipeline::Pipeline;
use crate::stats::PipelineStats;

/// Live-store clients for each long-lived user.
#[derive(Clone)]
pub struct LiveClients {
    pub monitor: Arc<dyn LiveStore>,
    pub storer: Arc<dyn LiveStore>,
    pub admin: Arc<dyn LiveStore>,
}

impl LiveClients {
    /// One RESP connection per user.
    pub fn resp(cfg: &LiveStoreConfig) -> Self {
        Self {
            monitor: Arc::new(RespLiveStore::new(cfg.clone())),
            storer: Arc::new(RespLiveStore::new(cfg.clone())),
            admin: Arc::new(RespLiveStore::new(cfg.clone())),
        }
    }

    /// Every user shares `live`.
    pub fn shared(live: Arc<dyn LiveStore>) -> Self {
        Self {
            monitor: live.clone(),
            storer: live.clone(),
            admin: live,
        }
    }
}

/// A running mirror: capture pipeline plus admin server.
pub struct MirrorNode {
    pipeline: Pipeline,
    admin: AdminServerHandle,
    shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    backup: BackupStore,
}

impl MirrorNode {
    pub async fn start(
        cfg: &MirrorConfig,
        live: LiveClients,
        backup: BackupStore,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        let pipeline = Pipeline::start(cfg, live.monitor, live.storer, backup.clone());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let ctx = Arc::new(AdminContext::new(
            live.admin,
            backup.clone(),
            pipeline.queue(),
            pipeline.stats(),
            shutdown_tx,
        ));
        let admin = match AdminServer::start(cfg.admin_addr, ctx).await {
            Ok(admin) => admin,
            Err(err) => {
                if let Err(stop_err) = pipeline.shutdown().await {
                    tracing::warn!(error = ?stop_err, "pipeline stop after failed startup");
                }
                return Err(err.context(format!("bind admin server on {}", cfg.admin_addr)));
            }
        };
        Ok(Self {
            pipeline,
            admin,
            shutdown_rx,
            backup,
        })
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin.local_addr()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.pipeline.stats()
    }

    /// Run until `shutdown` resolves or an admin `shutdown confirm` arrives,
    /// then stop everything in order.
    pub async fn run_until<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
    {
        let ack = tokio::select! {
            res = shutdown => {
                if let Err(err) = res {
                    tracing::warn!(error = ?err, "shutdown signal failed");
                }
                tracing::info!("shutdown signal received");
                None
            }
            req = self.shutdown_rx.recv() => {
                tracing::info!("shutdown requested by admin command");
                req
            }
        };
        self.finish(ack).await
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.finish(None).await
    }

    async fn finish(self, ack: Option<ShutdownRequest>) -> anyhow::Result<()> {
        let stopped = self.pipeline.shutdown().await;
        if let Err(err) = self.backup.raw().flush() {
            tracing::warn!(error = ?err, "durable flush failed");
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        self.admin.stop().await?;
        tracing::info!("mirror stopped");
        stopped
    }
}

/// Run the daemon until SIGINT, SIGTERM or an admin shutdown.
pub async fn run_node(cfg: MirrorConfig) -> anyhow::Result<()> {
    run_node_with_shutdown(cfg, termination_signal()).await
}

#[cfg(unix)]
async fn termination_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> Result<(), std::io::Error> {
    tokio::signal::ctrl_c().await
}

/// Open the fjall keyspace, connect to the live store and run until
/// `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(cfg: MirrorConfig, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    cfg.validate()?;
    let store = FjallDurableStore::open_dir(&cfg.data_dir, cfg.fsync_ms)?;
    let backup = BackupStore::new(Arc::new(store));
    let node = MirrorNode::start(&cfg, LiveClients::resp(&cfg.live), backup).await?;
    tracing::info!(
        live = %cfg.live.addr,
        admin = %node.admin_addr(),
        data_dir = %cfg.data_dir.display(),
        "mirror started"
    );
    node.run_until(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::MemoryDurableStore;
    use crate::live::MemoryLiveStore;

    fn test_config() -> MirrorConfig {
        MirrorConfig {
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..MirrorConfig::default()
        }
    }

    #[tokio::test]
    async fn start_and_stop_with_memory_stores() {
        let live = Arc::new(MemoryLiveStore::new());
        let backup = BackupStore::new(Arc::new(MemoryDurableStore::new()));
        let node = MirrorNode::start(&test_config(), LiveClients::shared(live), backup)
            .await
            .unwrap();
        assert_ne!(node.admin_addr().port(), 0);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn external_signal_stops_node() {
        let live = Arc::new(MemoryLiveStore::new());
        let backup = BackupStore::new(Arc::new(MemoryDurableStore::new()));
        let node = MirrorNode::start(&test_config(), LiveClients::shared(live), backup)
            .await
            .unwrap();
        node.run_until(async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let live = Arc::new(MemoryLiveStore::new());
        let backup = BackupStore::new(Arc::new(MemoryDurableStore::new()));
        let cfg = MirrorConfig {
            queue_capacity: 0,
            ..test_config()
        };
        assert!(MirrorNode::start(&cfg, LiveClients::shared(live), backup)
            .await
            .is_err());
    }
}
