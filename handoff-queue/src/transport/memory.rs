//! In-process transport.
//!
//! Mirrors the consumer-group semantics of Redis Streams closely enough to
//! run the whole queue in tests or in a single process: a cursor per group,
//! a pending-entries list, claim by idle time and keys with expiry.

use super::{GroupCreation, KeyTtl, LogEntry, PendingEntry, Transport};
use crate::error::{QueueError, QueueResult};
use crate::task::EntryId;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;

/// In-memory transport.
pub struct InMemoryTransport {
    state: Mutex<State>,
    appended: Notify,
    offline: AtomicBool,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    keys: HashMap<String, KeyEntry>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

struct Group {
    /// Highest position handed to any consumer
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct KeyEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KeyEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

impl State {
    /// Live value of `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&KeyEntry> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|e| e.is_expired(now)) {
            self.keys.remove(key);
        }
        self.keys.get(key)
    }

    /// `stream`, provided `group` exists on it.
    fn grouped_stream(&mut self, stream: &str, group: &str) -> QueueResult<&mut Stream> {
        match self.streams.get_mut(stream) {
            Some(s) if s.groups.contains_key(group) => Ok(s),
            _ => Err(no_group(stream, group)),
        }
    }
}

fn no_group(stream: &str, group: &str) -> QueueError {
    QueueError::Transport(format!(
        "NOGROUP no consumer group {:?} for stream {:?}",
        group, stream
    ))
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            offline: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate losing (or regaining) the backend. While offline every call
    /// fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.appended.notify_waiters();
        }
    }

    /// Store a key without expiry, as a writer that forgot its TTL would.
    pub async fn set_persistent(&self, key: &str, value: &str) -> QueueResult<()> {
        let mut state = self.lock().await?;
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    /// Number of entries in `stream`, acknowledged or not.
    pub async fn stream_len(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map_or(0, |s| s.entries.len())
    }

    fn check(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("transport closed".to_string()));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn lock(&self) -> QueueResult<MutexGuard<'_, State>> {
        self.check()?;
        Ok(self.state.lock().await)
    }

    async fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> QueueResult<Option<LogEntry>> {
        let mut state = self.lock().await?;
        let s = state.grouped_stream(stream, group)?;

        let cursor = s.groups[group].last_delivered;
        let next = s
            .entries
            .range((Bound::Excluded(cursor), Bound::Unbounded))
            .next()
            .map(|(id, fields)| (*id, fields.clone()));

        let Some((id, fields)) = next else {
            return Ok(None);
        };

        if let Some(g) = s.groups.get_mut(group) {
            g.last_delivered = id;
            g.pending.insert(
                id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
        }

        Ok(Some(LogEntry {
            id,
            fields,
            delivery_count: 1,
        }))
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check()
    }

    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<GroupCreation> {
        let mut state = self.lock().await?;
        let s = state.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered: EntryId::MIN,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> QueueResult<EntryId> {
        let mut state = self.lock().await?;
        let s = state.streams.entry(stream.to_string()).or_default();

        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let id = s.last_id.successor(now_ms);
        s.last_id = id;
        s.entries.insert(id, fields.iter().cloned().collect());
        drop(state);

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> QueueResult<Option<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_read(stream, group, consumer).await? {
                return Ok(Some(entry));
            }
            if block.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> QueueResult<bool> {
        let mut state = self.lock().await?;
        let removed = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&id))
            .is_some();
        Ok(removed)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        let mut state = self.lock().await?;
        let s = state.grouped_stream(stream, group)?;
        let now = Instant::now();

        Ok(s.groups[group]
            .pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entries: &[PendingEntry],
    ) -> QueueResult<Vec<LogEntry>> {
        let mut state = self.lock().await?;
        let s = state.grouped_stream(stream, group)?;
        let now = Instant::now();
        let mut claimed = Vec::new();

        for entry in entries {
            let Some(g) = s.groups.get_mut(group) else {
                break;
            };
            let Some(fields) = s.entries.get(&entry.id) else {
                // Deleted from the log: drop it from the pending list too
                g.pending.remove(&entry.id);
                continue;
            };
            let Some(p) = g.pending.get_mut(&entry.id) else {
                continue;
            };
            if now.saturating_duration_since(p.delivered_at) < min_idle {
                continue;
            }

            p.consumer = consumer.to_string();
            p.delivered_at = now;
            p.delivery_count += 1;
            claimed.push(LogEntry {
                id: entry.id,
                fields: fields.clone(),
                delivery_count: p.delivery_count,
            });
        }

        Ok(claimed)
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
    ) -> QueueResult<bool> {
        let mut state = self.lock().await?;
        let s = state.grouped_stream(stream, group)?;
        match s.groups.get_mut(group).and_then(|g| g.pending.get_mut(&id)) {
            Some(p) if p.consumer == consumer => {
                p.delivered_at = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut state = self.lock().await?;
        Ok(state.live(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut state = self.lock().await?;
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_ex_if(
        &self,
        guard_key: &str,
        forbidden: &[&str],
        writes: &[(String, String)],
        ttl: Duration,
    ) -> QueueResult<bool> {
        let mut state = self.lock().await?;
        let blocked = state
            .live(guard_key)
            .is_some_and(|e| forbidden.contains(&e.value.as_str()));
        if blocked {
            return Ok(false);
        }

        let expires_at = Some(Instant::now() + ttl);
        for (key, value) in writes {
            state.keys.insert(
                key.clone(),
                KeyEntry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> QueueResult<Vec<String>> {
        let mut state = self.lock().await?;
        let now = Instant::now();
        state.keys.retain(|_, e| !e.is_expired(now));

        let mut keys: Vec<String> = state
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> QueueResult<KeyTtl> {
        let mut state = self.lock().await?;
        let now = Instant::now();
        Ok(match state.live(key) {
            None => KeyTtl::Missing,
            Some(KeyEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(KeyEntry {
                expires_at: Some(exp),
                ..
            }) => KeyTtl::Expires(exp.saturating_duration_since(now)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        let mut state = self.lock().await?;
        if state.live(key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = state.keys.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.appended.notify_waiters();
        Ok(())
    }
}
