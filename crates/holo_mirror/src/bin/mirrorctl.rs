//! Admin client: sends one command to a running mirror and prints the reply.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[derive(Parser)]
#[command(name = "mirrorctl")]
#[command(about = "Admin client for holo-mirror", long_about = None)]
struct Args {
    /// Admin address of the mirror (host:port).
    #[arg(long, env = "HOLO_MIRROR_ADMIN_ADDR", default_value = "127.0.0.1:16390")]
    target: String,

    /// Seconds to wait for the reply. Sweeps over large stores take a while.
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// Command name, e.g. `check`, `fast_check detail`, `restore_one user:7`.
    command: String,

    args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let socket = TcpStream::connect(&args.target)
        .await
        .with_context(|| format!("connect to {}", args.target))?;
    let mut framed = Framed::new(socket, Resp2::default());

    let request = BytesFrame::Array(
        std::iter::once(&args.command)
            .chain(args.args.iter())
            .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part.as_bytes())))
            .collect(),
    );
    framed.send(request).await?;

    let reply = tokio::time::timeout(Duration::from_secs(args.timeout_secs), framed.next())
        .await
        .context("timed out waiting for reply")?
        .ok_or_else(|| anyhow::anyhow!("connection closed before reply"))??;

    match reply {
        BytesFrame::BulkString(text) | BytesFrame::SimpleString(text) => {
            let text = String::from_utf8_lossy(&text);
            print!("{text}");
            if !text.is_empty() && !text.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        BytesFrame::Error(err) => anyhow::bail!("{err}"),
        BytesFrame::Null => Ok(()),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}
