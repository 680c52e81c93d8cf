//! RESP2 transport for admin commands.
//!
//! A request is an array of bulk strings: command name then arguments.
//! Success replies with a bulk string, failure with `-ERR <message>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

use super::AdminContext;

/// How long open admin connections may finish after shutdown.
const CONNECTION_DRAIN: Duration = Duration::from_secs(2);

pub struct AdminServer;

pub struct AdminServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl AdminServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, give open connections a moment to finish, then return.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("admin server task join failed: {err}")),
        }
    }
}

impl AdminServer {
    /// Bind `addr` and serve commands against `ctx` until stopped.
    pub async fn start(addr: SocketAddr, ctx: Arc<AdminContext>) -> anyhow::Result<AdminServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(listener, ctx, shutdown_rx));
        tracing::info!(addr = %local_addr, "admin server listening");
        Ok(AdminServerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

async fn run(
    listener: TcpListener,
    ctx: Arc<AdminContext>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = ?err, "admin accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                conns.spawn(async move {
                    if let Err(err) = handle_conn(socket, ctx).await {
                        tracing::debug!(peer = %peer, error = ?err, "admin connection closed");
                    }
                });
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(CONNECTION_DRAIN, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!(open = conns.len(), "aborting idle admin connections");
        conns.abort_all();
    }
    Ok(())
}

async fn handle_conn(socket: TcpStream, ctx: Arc<AdminContext>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_request(frame) {
            Ok(Some((name, args))) => match ctx.dispatch(&name, args).await {
                Ok(text) => BytesFrame::BulkString(Bytes::from(text)),
                Err(err) => {
                    tracing::debug!(command = %name, error = %err, "admin command rejected");
                    error_frame(&err)
                }
            },
            Ok(None) => continue,
            Err(err) => error_frame(&err),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

fn parse_request(frame: BytesFrame) -> anyhow::Result<Option<(String, Vec<String>)>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    let mut parts = parts.into_iter();
    let Some(first) = parts.next() else {
        return Ok(None);
    };
    let name = frame_string(first).ok_or_else(|| anyhow::anyhow!("invalid command"))?;
    let args = parts
        .map(|part| frame_string(part).ok_or_else(|| anyhow::anyhow!("invalid argument")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Some((name, args)))
}

fn frame_string(frame: BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            String::from_utf8(b.to_vec()).ok()
        }
        BytesFrame::Integer(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Error replies are single-line.
fn error_frame(err: &anyhow::Error) -> BytesFrame {
    let msg = format!("ERR {err:#}").replace(['\r', '\n'], " ");
    BytesFrame::Error(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> BytesFrame {
        BytesFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn requests_split_into_name_and_args() {
        let frame = BytesFrame::Array(vec![bulk("keys"), bulk("5"), BytesFrame::Integer(3)]);
        let (name, args) = parse_request(frame).unwrap().unwrap();
        assert_eq!(name, "keys");
        assert_eq!(args, vec!["5".to_string(), "3".to_string()]);
        assert!(parse_request(BytesFrame::Array(Vec::new())).unwrap().is_none());
        assert!(parse_request(bulk("keys")).is_err());
    }

    #[test]
    fn error_replies_stay_on_one_line() {
        let err = anyhow::anyhow!("bad\r\ninput");
        match error_frame(&err) {
            BytesFrame::Error(msg) => assert_eq!(&*msg, "ERR bad  input"),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
