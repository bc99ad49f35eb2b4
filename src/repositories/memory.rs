//! In-process store with store-enforced TTLs and a pub/sub stream that speaks the same
//! line protocol as the REST subscribe endpoint. Used by tests and local development.

use crate::error::{AppError, AppResult};
use crate::repositories::store::{frame, ByteStream, Store};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
    publishes: u64,
    subscribe_attempts: u64,
    failing_subscribes: u32,
}

impl Inner {
    /// Entry for `key` unless it has expired; expired entries are dropped on the way.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn live_set(&mut self, key: &str) -> AppResult<Option<&mut BTreeSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> AppError {
    AppError::Transport(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

/// Shared in-memory store. Clones see the same data, so several services built on clones
/// behave like several servers talking to one store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of PUBLISH calls served so far.
    pub fn publish_count(&self) -> u64 {
        self.lock().publishes
    }

    /// Number of subscribe requests received so far, failed ones included.
    pub fn subscribe_attempts(&self) -> u64 {
        self.lock().subscribe_attempts
    }

    /// Open subscribe streams on `channel` whose reader is still alive.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Make the next `n` subscribe requests fail with a transport error.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.lock().failing_subscribes = n;
    }

    /// Write raw bytes to every open stream on `channel`, bypassing framing.
    pub fn inject(&self, channel: &str, chunk: impl Into<Bytes>) -> usize {
        let chunk = chunk.into();
        let mut inner = self.lock();
        let Some(subs) = inner.subscribers.get_mut(channel) else {
            return 0;
        };
        subs.retain(|tx| tx.send(chunk.clone()).is_ok());
        subs.len()
    }

    /// End every open stream on `channel`, as a server-side disconnect would.
    pub fn drop_subscribers(&self, channel: &str) {
        self.lock().subscribers.remove(channel);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn publish(&self, channel: &str, message: &str) -> AppResult<u64> {
        let chunk = Bytes::from(frame("message", channel, message));
        let mut inner = self.lock();
        inner.publishes += 1;
        let Some(subs) = inner.subscribers.get_mut(channel) else {
            return Ok(0);
        };
        subs.retain(|tx| tx.send(chunk.clone()).is_ok());
        Ok(subs.len() as u64)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        match self.lock().live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> AppResult<()> {
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> AppResult<()> {
        let mut inner = self.lock();
        if let Some(set) = inner.live_set(key)? {
            set.insert(member.to_string());
            return Ok(());
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Set(BTreeSet::from([member.to_string()])),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> AppResult<()> {
        let mut inner = self.lock();
        let emptied = match inner.live_set(key)? {
            Some(set) => {
                set.remove(member);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.entries.remove(key);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> AppResult<Vec<String>> {
        Ok(self
            .lock()
            .live_set(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<()> {
        if let Some(entry) = self.lock().live(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<ByteStream> {
        let mut inner = self.lock();
        inner.subscribe_attempts += 1;
        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            return Err(AppError::Transport(format!(
                "subscribe to {} refused",
                channel
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Mirrors the confirmation record a real store sends first.
        let _ = tx.send(Bytes::from(frame("subscribe", channel, "1")));
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        });
        Ok(stream.boxed())
    }
}
