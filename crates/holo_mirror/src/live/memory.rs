use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeStream, KeyKind, LiveStore};
use crate::record::Fields;

const EVENT_BUFFER: usize = 4096;

#[derive(Clone, Debug)]
enum Value {
    Hash(Fields),
    Text(String),
}

/// In-process live store emitting keyspace notifications like a Redis server
/// with `notify-keyspace-events Kh` (plus `K$` for plain strings).
///
/// Connection faults can be injected to exercise reconnect paths.
pub struct MemoryLiveStore {
    db: u32,
    data: RwLock<HashMap<String, Value>>,
    events: Mutex<broadcast::Sender<ChangeEvent>>,
    fail_calls: AtomicU32,
    fail_writes: AtomicU32,
    fail_subscribes: AtomicU32,
    reconnects: AtomicU32,
}

impl Default for MemoryLiveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLiveStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            db: 0,
            data: RwLock::new(HashMap::new()),
            events: Mutex::new(events),
            fail_calls: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
            fail_subscribes: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
        }
    }

    /// Set fields on a hash the way an application would, emitting `hset`.
    pub fn hset(&self, key: &str, fields: &Fields) {
        if let Ok(mut guard) = self.data.write() {
            match guard.get_mut(key) {
                Some(Value::Hash(existing)) => {
                    existing.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                _ => {
                    guard.insert(key.to_string(), Value::Hash(fields.clone()));
                }
            }
        }
        self.publish(key, "hset");
    }

    /// Store a plain string value, emitting `set`.
    pub fn set_text(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.write() {
            guard.insert(key.to_string(), Value::Text(value.to_string()));
        }
        self.publish(key, "set");
    }

    /// Remove a key without emitting a notification (simulates data loss).
    pub fn forget(&self, key: &str) {
        if let Ok(mut guard) = self.data.write() {
            guard.remove(key);
        }
    }

    /// Current hash at `key`, if any.
    pub fn hash(&self, key: &str) -> Option<Fields> {
        let guard = self.data.read().ok()?;
        match guard.get(key)? {
            Value::Hash(fields) => Some(fields.clone()),
            Value::Text(_) => None,
        }
    }

    /// Make the next `n` data calls fail as if the connection dropped.
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_calls.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` hash writes fail; reads are unaffected.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// End every open subscription stream, as a server restart would.
    pub fn drop_subscriptions(&self) {
        if let Ok(mut guard) = self.events.lock() {
            let (events, _) = broadcast::channel(EVENT_BUFFER);
            *guard = events;
        }
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn publish(&self, key: &str, event: &str) {
        let Ok(guard) = self.events.lock() else {
            return;
        };
        // No subscribers is not an error: notifications are fire-and-forget.
        let _ = guard.send(ChangeEvent {
            channel: format!("__keyspace@{}__:{key}", self.db),
            payload: event.to_string(),
        });
    }

    fn check_fault(counter: &AtomicU32) -> anyhow::Result<()> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        anyhow::ensure!(!injected, "injected live store connection failure");
        Ok(())
    }
}

#[async_trait]
impl LiveStore for MemoryLiveStore {
    async fn type_of(&self, key: &str) -> anyhow::Result<KeyKind> {
        Self::check_fault(&self.fail_calls)?;
        let guard = self
            .data
            .read()
            .map_err(|_| anyhow::anyhow!("live store lock poisoned"))?;
        Ok(match guard.get(key) {
            None => KeyKind::None,
            Some(Value::Hash(_)) => KeyKind::Hash,
            Some(Value::Text(_)) => KeyKind::String,
        })
    }

    async fn get_all_fields(&self, key: &str) -> anyhow::Result<Fields> {
        Self::check_fault(&self.fail_calls)?;
        let guard = self
            .data
            .read()
            .map_err(|_| anyhow::anyhow!("live store lock poisoned"))?;
        match guard.get(key) {
            None => Ok(Fields::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(Value::Text(_)) => {
                anyhow::bail!("WRONGTYPE Operation against a key holding the wrong kind of value")
            }
        }
    }

    async fn get_field(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let fields = self.get_all_fields(key).await?;
        Ok(fields.get(field).cloned())
    }

    async fn set_all_fields(&self, key: &str, fields: &Fields) -> anyhow::Result<()> {
        Self::check_fault(&self.fail_calls)?;
        Self::check_fault(&self.fail_writes)?;
        {
            let guard = self
                .data
                .read()
                .map_err(|_| anyhow::anyhow!("live store lock poisoned"))?;
            if let Some(Value::Text(_)) = guard.get(key) {
                anyhow::bail!("WRONGTYPE Operation against a key holding the wrong kind of value");
            }
        }
        if !fields.is_empty() {
            self.hset(key, fields);
        }
        Ok(())
    }

    async fn list_keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        Self::check_fault(&self.fail_calls)?;
        let guard = self
            .data
            .read()
            .map_err(|_| anyhow::anyhow!("live store lock poisoned"))?;
        Ok(guard
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, pattern: &str) -> anyhow::Result<ChangeStream> {
        Self::check_fault(&self.fail_subscribes)?;
        let rx = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("live store lock poisoned"))?
            .subscribe();
        let pattern = pattern.to_string();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if glob_match(&pattern, &event.channel) => {
                            return Some((Ok(event), rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "notification subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
