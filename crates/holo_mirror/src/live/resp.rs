use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use super::{ChangeEvent, ChangeStream, KeyKind, LiveStore};
use crate::config::LiveStoreConfig;
use crate::record::Fields;

/// Upper bound on one request/response round trip. `KEYS` on a large
/// database is the slowest call we make.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type RespConn = Framed<TcpStream, Resp2>;

/// RESP2 client for a Redis-compatible live store.
///
/// Commands share one connection guarded by a mutex. A transport error drops
/// the connection; the next call (or an explicit `reconnect`) dials again.
pub struct RespLiveStore {
    cfg: LiveStoreConfig,
    conn: Mutex<Option<RespConn>>,
}

impl RespLiveStore {
    pub fn new(cfg: LiveStoreConfig) -> Self {
        Self {
            cfg,
            conn: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LiveStoreConfig {
        &self.cfg
    }

    async fn request(&self, frame: BytesFrame) -> anyhow::Result<BytesFrame> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(dial(&self.cfg).await?);
        }
        let Some(conn) = guard.as_mut() else {
            anyhow::bail!("live store connection unavailable");
        };
        match roundtrip(conn, frame).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                // The stream may hold a half-read reply; never reuse it.
                *guard = None;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl LiveStore for RespLiveStore {
    async fn type_of(&self, key: &str) -> anyhow::Result<KeyKind> {
        let resp = self.request(command(["TYPE", key])).await?;
        let name = frame_text(resp)?.unwrap_or_else(|| "none".to_string());
        Ok(KeyKind::parse(&name))
    }

    async fn get_all_fields(&self, key: &str) -> anyhow::Result<Fields> {
        let resp = self.request(command(["HGETALL", key])).await?;
        fields_from_frame(resp)
    }

    async fn get_field(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let resp = self.request(command(["HGET", key, field])).await?;
        frame_text(resp)
    }

    async fn set_all_fields(&self, key: &str, fields: &Fields) -> anyhow::Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut parts: Vec<&str> = Vec::with_capacity(2 + fields.len() * 2);
        parts.push("HSET");
        parts.push(key);
        for (field, value) in fields {
            parts.push(field);
            parts.push(value);
        }
        match self.request(command(parts)).await? {
            BytesFrame::Integer(_) => Ok(()),
            other => Err(unexpected("HSET", other)),
        }
    }

    async fn list_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        match self.request(command(["KEYS", pattern])).await? {
            BytesFrame::Array(items) => items
                .into_iter()
                .map(|item| frame_text(item)?.context("KEYS returned a null entry"))
                .collect(),
            other => Err(unexpected("KEYS", other)),
        }
    }

    async fn subscribe(&self, pattern: &str) -> anyhow::Result<ChangeStream> {
        let mut conn = dial(&self.cfg).await?;
        if let Some(events) = self.cfg.notify_events.as_deref().filter(|e| !e.is_empty()) {
            let resp = roundtrip(
                &mut conn,
                command(["CONFIG", "SET", "notify-keyspace-events", events]),
            )
            .await?;
            if let Err(err) = expect_ok("CONFIG SET", resp) {
                // Managed servers often disable CONFIG; notifications may
                // still be enabled server-side.
                tracing::warn!(error = ?err, events, "could not enable keyspace notifications");
            }
        }

        let resp = roundtrip(&mut conn, command(["PSUBSCRIBE", pattern])).await?;
        match resp {
            BytesFrame::Array(parts)
                if parts.first().and_then(frame_str).as_deref() == Some("psubscribe") => {}
            other => return Err(unexpected("PSUBSCRIBE", other)),
        }

        let stream = futures_util::stream::unfold(Some(conn), |state| async move {
            let mut conn = state?;
            loop {
                match conn.next().await {
                    None => return None,
                    Some(Err(err)) => {
                        let err = anyhow::Error::from(err).context("read notification frame");
                        return Some((Err(err), None));
                    }
                    Some(Ok(frame)) => match parse_push(frame) {
                        Ok(Some(event)) => return Some((Ok(event), Some(conn))),
                        Ok(None) => continue,
                        Err(err) => return Some((Err(err), None)),
                    },
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().await;
        *guard = None;
        *guard = Some(dial(&self.cfg).await?);
        Ok(())
    }
}

async fn dial(cfg: &LiveStoreConfig) -> anyhow::Result<RespConn> {
    let socket = connect(&cfg.addr, CONNECT_TIMEOUT).await?;
    socket.set_nodelay(true).ok();
    let mut conn = Framed::new(socket, Resp2::default());

    if let Some(password) = cfg.password.as_deref().filter(|p| !p.is_empty()) {
        let resp = roundtrip(&mut conn, command(["AUTH", password])).await?;
        expect_ok("AUTH", resp)?;
    }
    if cfg.db != 0 {
        let db = cfg.db.to_string();
        let resp = roundtrip(&mut conn, command(["SELECT", db.as_str()])).await?;
        expect_ok("SELECT", resp)?;
    }
    Ok(conn)
}

async fn connect(addr: &str, limit: Duration) -> anyhow::Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Err(_) => anyhow::bail!("connect to live store {addr} timed out after {limit:?}"),
        Ok(res) => res.with_context(|| format!("connect to live store {addr}")),
    }
}

async fn roundtrip(conn: &mut RespConn, frame: BytesFrame) -> anyhow::Result<BytesFrame> {
    conn.send(frame).await.context("write RESP request")?;
    match tokio::time::timeout(REQUEST_TIMEOUT, conn.next()).await {
        Err(_) => anyhow::bail!("live store request timed out after {REQUEST_TIMEOUT:?}"),
        Ok(None) => anyhow::bail!("live store closed the connection"),
        Ok(Some(frame)) => Ok(frame.context("read RESP reply")?),
    }
}

/// Build a RESP command array from its parts.
fn command<I, T>(parts: I) -> BytesFrame
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    BytesFrame::Array(
        parts
            .into_iter()
            .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part.as_ref())))
            .collect(),
    )
}

fn frame_str(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            Some(String::from_utf8_lossy(b).into_owned())
        }
        _ => None,
    }
}

/// Interpret a reply as optional text; server errors become `Err`.
fn frame_text(frame: BytesFrame) -> anyhow::Result<Option<String>> {
    match frame {
        BytesFrame::Null => Ok(None),
        BytesFrame::Error(err) => anyhow::bail!("live store error: {err}"),
        BytesFrame::Integer(n) => Ok(Some(n.to_string())),
        other => match frame_str(&other) {
            Some(text) => Ok(Some(text)),
            None => Err(unexpected("text reply", other)),
        },
    }
}

fn expect_ok(what: &str, frame: BytesFrame) -> anyhow::Result<()> {
    match frame {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        other => Err(unexpected(what, other)),
    }
}

fn unexpected(what: &str, frame: BytesFrame) -> anyhow::Error {
    match frame {
        BytesFrame::Error(err) => anyhow::anyhow!("{what} failed: {err}"),
        other => anyhow::anyhow!("unexpected {what} reply: {other:?}"),
    }
}

/// Decode a flat `[field, value, ...]` HGETALL reply.
fn fields_from_frame(frame: BytesFrame) -> anyhow::Result<Fields> {
    let BytesFrame::Array(items) = frame else {
        return Err(unexpected("HGETALL", frame));
    };
    anyhow::ensure!(items.len() % 2 == 0, "HGETALL returned an odd number of items");
    let mut fields = Fields::new();
    let mut iter = items.iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let field = frame_str(field).context("HGETALL field is not a string")?;
        let value = frame_str(value).context("HGETALL value is not a string")?;
        fields.insert(field, value);
    }
    Ok(fields)
}

/// Decode a pub/sub push frame. Subscription acks yield `None`.
fn parse_push(frame: BytesFrame) -> anyhow::Result<Option<ChangeEvent>> {
    let BytesFrame::Array(parts) = frame else {
        return Err(unexpected("pub/sub push", frame));
    };
    let kind = parts.first().and_then(frame_str).unwrap_or_default();
    let (channel, payload) = match (kind.as_str(), parts.len()) {
        ("pmessage", 4) => (&parts[2], &parts[3]),
        ("message", 3) => (&parts[1], &parts[2]),
        ("psubscribe" | "subscribe" | "pong", _) => return Ok(None),
        _ => anyhow::bail!("unexpected pub/sub push {kind:?} with {} parts", parts.len()),
    };
    let channel = frame_str(channel).context("notification channel is not a string")?;
    let payload = frame_str(payload).context("notification payload is not a string")?;
    Ok(Some(ChangeEvent { channel, payload }))
}
