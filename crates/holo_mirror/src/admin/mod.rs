//! Operator command surface.
//!
//! Commands take free-form string arguments and return text. They dispatch
//! through a [`CommandTable`] of plain function pointers over a concrete
//! [`AdminContext`]; the RESP transport lives in [`server`].

pub mod server;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::checker::Checker;
use crate::durable::BackupStore;
use crate::live::LiveStore;
use crate::queue::QueueSender;
use crate::record;
use crate::restore::Restorer;
use crate::stats::PipelineStats;

pub use server::{AdminServer, AdminServerHandle};

const SYNC_PROGRESS_EVERY: usize = 100;
const DEFAULT_KEYS_COUNT: usize = 10;

/// A shutdown request; the receiver acknowledges once the pipeline has stopped.
pub type ShutdownRequest = oneshot::Sender<()>;

pub type CommandHandler =
    for<'a> fn(&'a AdminContext, Vec<String>) -> BoxFuture<'a, anyhow::Result<String>>;

#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: BTreeMap<&'static str, CommandHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in command.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register("help", cmd_help);
        table.register("info", cmd_info);
        table.register("sync", cmd_sync);
        table.register("sync_all", cmd_sync_all);
        table.register("dump", cmd_dump);
        table.register("count", cmd_count);
        table.register("diff", cmd_diff);
        table.register("keys", cmd_keys);
        table.register("check", cmd_check);
        table.register("fast_check", cmd_fast_check);
        table.register("restore_one", cmd_restore_one);
        table.register("restore_all", cmd_restore_all);
        table.register("shutdown", cmd_shutdown);
        table
    }

    pub fn register(&mut self, name: &'static str, handler: CommandHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<CommandHandler> {
        self.handlers.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

/// Everything an admin command may touch.
pub struct AdminContext {
    live: Arc<dyn LiveStore>,
    backup: BackupStore,
    queue: QueueSender,
    checker: Checker,
    restorer: Restorer,
    stats: Arc<PipelineStats>,
    shutdown: mpsc::Sender<ShutdownRequest>,
    commands: CommandTable,
}

impl AdminContext {
    pub fn new(
        live: Arc<dyn LiveStore>,
        backup: BackupStore,
        queue: QueueSender,
        stats: Arc<PipelineStats>,
        shutdown: mpsc::Sender<ShutdownRequest>,
    ) -> Self {
        Self {
            checker: Checker::new(live.clone(), backup.clone()),
            restorer: Restorer::new(live.clone(), backup.clone()),
            live,
            backup,
            queue,
            stats,
            shutdown,
            commands: CommandTable::builtin(),
        }
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Run one command. Unknown names and bad arguments are errors.
    pub async fn dispatch(&self, name: &str, args: Vec<String>) -> anyhow::Result<String> {
        let name = name.to_ascii_lowercase();
        let handler = self
            .commands
            .get(&name)
            .ok_or_else(|| anyhow::anyhow!("unknown command '{name}'"))?;
        handler(self, args).await
    }
}

fn required_key(command: &str, args: &[String]) -> anyhow::Result<String> {
    match args.first() {
        Some(key) if !key.is_empty() => Ok(key.clone()),
        _ => anyhow::bail!("{command} needs a key"),
    }
}

fn cmd_help(ctx: &AdminContext, _args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let mut out = String::new();
        for name in ctx.commands.names() {
            out.push_str(name);
            out.push('\n');
        }
        Ok(out)
    }
    .boxed()
}

fn cmd_info(ctx: &AdminContext, _args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let stats = ctx.stats.snapshot();
        let backup_entries = ctx.backup.count()?;
        let mut out = String::new();
        out.push_str(&format!("queue: {}/{}\n", ctx.queue.len(), ctx.queue.capacity()));
        out.push_str(&format!("backup_entries: {backup_entries}\n"));
        out.push_str(&format!("events_received: {}\n", stats.events_received));
        out.push_str(&format!("events_queued: {}\n", stats.events_queued));
        out.push_str(&format!("monitor_reconnects: {}\n", stats.monitor_reconnects));
        out.push_str(&format!("saved: {}\n", stats.saved));
        out.push_str(&format!("skipped: {}\n", stats.skipped));
        out.push_str(&format!("dropped: {}\n", stats.dropped));
        out.push_str(&format!("failed: {}\n", stats.failed));
        out.push_str(&format!("storer_reconnects: {}\n", stats.storer_reconnects));
        Ok(out)
    }
    .boxed()
}

fn cmd_sync(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let key = required_key("sync", &args)?;
        ctx.queue.push(key.clone()).await?;
        Ok(format!("queued {key}"))
    }
    .boxed()
}

fn cmd_sync_all(ctx: &AdminContext, _args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let mut keys = ctx
            .live
            .list_keys("*")
            .await
            .context("list live keys")?;
        keys.sort();
        let total = keys.len();
        for (i, key) in keys.into_iter().enumerate() {
            ctx.queue.push(key).await?;
            let done = i + 1;
            if done % SYNC_PROGRESS_EVERY == 0 {
                info!(progress = done, total, queue = ctx.queue.len(), "sync progress");
            }
        }
        info!(total, "sync finished");
        Ok(total.to_string())
    }
    .boxed()
}

fn cmd_dump(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let key = required_key("dump", &args)?;
        let Some(blob) = ctx.backup.load_raw(&key)? else {
            anyhow::bail!("no backup entry for {key}");
        };
        info!(key = %key, bytes = blob.len(), "dump key");
        let fields = record::decode_fields(&blob).context("decode backup entry")?;
        Ok(record::render_fields(&fields))
    }
    .boxed()
}

fn cmd_count(ctx: &AdminContext, _args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move { Ok(ctx.backup.count()?.to_string()) }.boxed()
}

fn cmd_diff(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let key = required_key("diff", &args)?;
        match ctx.checker.diff(&key).await? {
            Some(diff) => Ok(diff.to_string()),
            None => anyhow::bail!("no backup entry for {key}"),
        }
    }
    .boxed()
}

fn cmd_keys(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let start = match args.first() {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid start '{raw}'"))?,
            None => 0,
        };
        let count = match args.get(1) {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid count '{raw}'"))?,
            None => DEFAULT_KEYS_COUNT,
        };
        let mut out = String::from("keys:\n");
        for key in ctx.backup.keys(start, count)? {
            out.push_str(&key);
            out.push('\n');
        }
        Ok(out)
    }
    .boxed()
}

fn cmd_check(ctx: &AdminContext, _args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move { Ok(ctx.checker.check().await?.to_string()) }.boxed()
}

fn cmd_fast_check(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let detail = match args.first().map(String::as_str) {
            None => false,
            Some("detail") => true,
            Some(other) => anyhow::bail!("unknown fast_check option '{other}'"),
        };
        Ok(ctx.checker.fast_check(detail).await?.to_string())
    }
    .boxed()
}

fn cmd_restore_one(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        let key = required_key("restore_one", &args)?;
        let outcome = ctx.restorer.restore_one(&key).await?;
        Ok(outcome.describe(&key))
    }
    .boxed()
}

fn cmd_restore_all(ctx: &AdminContext, _args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move { Ok(ctx.restorer.restore_all().await?.to_string()) }.boxed()
}

fn cmd_shutdown(ctx: &AdminContext, args: Vec<String>) -> BoxFuture<'_, anyhow::Result<String>> {
    async move {
        anyhow::ensure!(
            args.first().map(String::as_str) == Some("confirm"),
            "wrong password"
        );
        let (done_tx, done_rx) = oneshot::channel();
        ctx.shutdown
            .send(done_tx)
            .await
            .map_err(|_| anyhow::anyhow!("shutdown already in progress"))?;
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("shutdown did not complete"))?;
        Ok("done".to_string())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::{DurableStore, MemoryDurableStore};
    use crate::index;
    use crate::live::MemoryLiveStore;
    use crate::queue::{change_queue, QueueReceiver};
    use crate::record::Fields;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Harness {
        live: Arc<MemoryLiveStore>,
        backup: BackupStore,
        queue: QueueReceiver,
        shutdown: mpsc::Receiver<ShutdownRequest>,
        ctx: AdminContext,
    }

    fn harness() -> Harness {
        let live = Arc::new(MemoryLiveStore::new());
        let backup = BackupStore::new(Arc::new(MemoryDurableStore::new()));
        let (tx, rx) = change_queue(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let ctx = AdminContext::new(
            live.clone(),
            backup.clone(),
            tx,
            Arc::new(PipelineStats::new()),
            shutdown_tx,
        );
        Harness {
            live,
            backup,
            queue: rx,
            shutdown: shutdown_rx,
            ctx,
        }
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn help_lists_every_command() {
        let h = harness();
        let out = h.ctx.dispatch("HELP", Vec::new()).await.unwrap();
        for name in [
            "check", "count", "diff", "dump", "fast_check", "help", "info", "keys",
            "restore_all", "restore_one", "shutdown", "sync", "sync_all",
        ] {
            assert!(out.lines().any(|line| line == name), "missing {name}");
        }
        assert!(h.ctx.dispatch("procs", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn sync_all_enqueues_sorted_live_keys() {
        let mut h = harness();
        for key in ["c", "a", "b"] {
            h.live.hset(key, &fields(&[("version", "1")]));
        }
        let out = h.ctx.dispatch("sync_all", Vec::new()).await.unwrap();
        assert_eq!(out, "3");
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(h.queue.pop().await.unwrap());
        }
        assert_eq!(seen, vec!["a", "b", "c"]);

        assert_eq!(h.ctx.dispatch("sync", args(&["z"])).await.unwrap(), "queued z");
        assert_eq!(h.queue.pop().await.as_deref(), Some("z"));
        assert!(h.ctx.dispatch("sync", Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn keys_pages_backup_range_and_rejects_bad_numbers() {
        let h = harness();
        for i in 0..15 {
            h.backup
                .save(&format!("k{i:02}"), &fields(&[("version", "1")]))
                .unwrap();
        }
        h.backup.raw().put(b"foreign", b"{}").unwrap();

        let first = h.ctx.dispatch("keys", Vec::new()).await.unwrap();
        assert_eq!(first.lines().count(), 1 + DEFAULT_KEYS_COUNT);
        assert!(first.starts_with("keys:\nk00\n"));
        let tail = h.ctx.dispatch("keys", args(&["12", "10"])).await.unwrap();
        assert_eq!(tail, "keys:\nk12\nk13\nk14\n");
        assert_eq!(h.ctx.dispatch("count", Vec::new()).await.unwrap(), "15");

        let err = h.ctx.dispatch("keys", args(&["x"])).await.unwrap_err();
        assert!(err.to_string().contains("invalid start"));
    }

    #[tokio::test]
    async fn dump_and_diff_use_the_index_key() {
        let h = harness();
        h.backup
            .save("u1", &fields(&[("version", "2"), ("a", "y")]))
            .unwrap();
        h.live.hset("u1", &fields(&[("version", "2"), ("a", "x")]));

        let dump = h.ctx.dispatch("dump", args(&["u1"])).await.unwrap();
        assert_eq!(dump, "content:\na:\ty\nversion:\t2\n");
        let diff = h.ctx.dispatch("diff", args(&["u1"])).await.unwrap();
        assert_eq!(diff, "left:live, right:backup\na < x, y\n");
        assert!(h.ctx.dispatch("dump", args(&["missing"])).await.is_err());
        assert!(h
            .backup
            .raw()
            .get(&index::add_prefix("u1"))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn fast_check_rejects_unknown_option() {
        let h = harness();
        let err = h
            .ctx
            .dispatch("fast_check", args(&["verbose"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("verbose"));
        let ok = h.ctx.dispatch("fast_check", args(&["detail"])).await.unwrap();
        assert!(ok.starts_with("fast check results:\ntotal: 0\n"));
    }

    #[tokio::test]
    async fn restore_commands_report_outcomes() {
        let h = harness();
        h.backup
            .save("u1", &fields(&[("version", "2"), ("a", "y")]))
            .unwrap();
        h.live.hset("u2", &fields(&[("version", "5")]));
        h.backup.save("u2", &fields(&[("version", "3")])).unwrap();

        let one = h.ctx.dispatch("restore_one", args(&["u2"])).await.unwrap();
        assert_eq!(one, "skip key:u2 version:5 >= 3");
        let all = h.ctx.dispatch("restore_all", Vec::new()).await.unwrap();
        assert!(all.starts_with("restore key 1, total 2\n"));
        assert_eq!(h.live.hash("u1"), Some(fields(&[("version", "2"), ("a", "y")])));
    }

    #[tokio::test]
    async fn shutdown_requires_confirmation_and_waits_for_ack() {
        let mut h = harness();
        let err = h.ctx.dispatch("shutdown", args(&["please"])).await.unwrap_err();
        assert_eq!(err.to_string(), "wrong password");

        let ctx = Arc::new(h.ctx);
        let pending = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.dispatch("shutdown", args(&["confirm"])).await })
        };
        let ack = h.shutdown.recv().await.expect("shutdown request");
        ack.send(()).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn info_reports_queue_and_backup() {
        let h = harness();
        h.backup.save("u1", &fields(&[("version", "1")])).unwrap();
        h.ctx.dispatch("sync", args(&["u1"])).await.unwrap();
        let info = h.ctx.dispatch("info", Vec::new()).await.unwrap();
        assert!(info.contains("queue: 1/64\n"));
        assert!(info.contains("backup_entries: 1\n"));
    }
}
