//! Redis Streams transport.
//!
//! The log is a stream (`XADD`/`XREADGROUP`/`XACK`), reclaim uses
//! `XPENDING` + `XCLAIM`, and status/result records are plain string keys
//! with `EX` expiry. The guarded multi-key write runs as a Lua script so the
//! check and the writes happen in one server-side step.

use super::{GroupCreation, KeyTtl, LogEntry, PendingEntry, Transport};
use crate::error::{QueueError, QueueResult};
use crate::task::EntryId;
use async_trait::async_trait;
use handoff_log::{debug, info};
use handoff_redis::{Connector, RedisConfig};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

/// KEYS[1] guard, KEYS[2..] targets.
/// ARGV[1] ttl seconds, ARGV[2] number of forbidden values, then the
/// forbidden values, then one value per target key.
const GUARDED_WRITE: &str = r#"
local ttl = tonumber(ARGV[1])
local nforbidden = tonumber(ARGV[2])
local current = redis.call('GET', KEYS[1])
if current then
  for i = 1, nforbidden do
    if current == ARGV[2 + i] then
      return 0
    end
  end
end
for i = 2, #KEYS do
  redis.call('SET', KEYS[i], ARGV[2 + nforbidden + i - 1], 'EX', ttl)
end
return 1
"#;

/// KEYS[1] stream. ARGV[1] group, ARGV[2] consumer, ARGV[3] entry id.
/// `JUSTID` leaves the delivery counter alone.
const TOUCH: &str = r#"
local p = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1)
if #p == 0 or p[1][2] ~= ARGV[2] then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')
return 1
"#;

/// Redis-backed transport.
///
/// Commands share one multiplexed connection. Blocking reads get a
/// connection per consumer so that workers in the same process do not queue
/// up behind each other's `BLOCK`.
pub struct RedisTransport {
    connector: Connector,
    commands: OnceCell<ConnectionManager>,
    blocking: Mutex<HashMap<String, (Duration, ConnectionManager)>>,
    guarded_write: Script,
    touch: Script,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Create the transport. Connections are opened on first use.
    pub fn new(config: RedisConfig) -> QueueResult<Self> {
        Ok(Self {
            connector: Connector::new(config)?,
            commands: OnceCell::new(),
            blocking: Mutex::new(HashMap::new()),
            guarded_write: Script::new(GUARDED_WRITE),
            touch: Script::new(TOUCH),
            closed: AtomicBool::new(false),
        })
    }

    /// Transport configured from `REDIS_*` environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(RedisConfig::from_env().build())
    }

    async fn conn(&self) -> QueueResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("transport closed".to_string()));
        }
        let conn = self
            .commands
            .get_or_try_init(|| self.connector.connect())
            .await?;
        Ok(conn.clone())
    }

    async fn blocking_conn(&self, consumer: &str, block: Duration) -> QueueResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("transport closed".to_string()));
        }
        let mut blocking = self.blocking.lock().await;
        if let Some((max_block, conn)) = blocking.get(consumer)
            && *max_block >= block
        {
            return Ok(conn.clone());
        }

        let conn = self.connector.connect_blocking(block).await?;
        debug!("Opened blocking connection for consumer {}", consumer);
        blocking.insert(consumer.to_string(), (block, conn.clone()));
        Ok(conn)
    }
}

fn parse_id(raw: &str) -> QueueResult<EntryId> {
    raw.parse()
}

fn to_log_entry(sid: &StreamId, delivery_count: u64) -> QueueResult<LogEntry> {
    let fields = sid
        .map
        .keys()
        .filter_map(|k| sid.get::<String>(k).map(|v| (k.clone(), v)))
        .collect();
    Ok(LogEntry {
        id: parse_id(&sid.id)?,
        fields,
        delivery_count,
    })
}

/// Escape glob metacharacters so `prefix` matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        handoff_redis::ping(&mut conn).await?;
        Ok(())
    }

    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<GroupCreation> {
        let mut conn = self.conn().await?;
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> QueueResult<EntryId> {
        let mut conn = self.conn().await?;
        let id: String = conn.xadd(stream, "*", fields).await?;
        parse_id(&id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> QueueResult<Option<LogEntry>> {
        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        let mut conn = if block.is_zero() {
            self.conn().await?
        } else {
            // BLOCK 0 would wait forever, so only set it for a real timeout
            let millis = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
            options = options.block(millis.max(1));
            self.blocking_conn(consumer, block).await?
        };

        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &options).await?;
        let Some(reply) = reply else {
            return Ok(None);
        };

        reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .next()
            .map(|sid| to_log_entry(sid, 1))
            .transpose()
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.xack(stream, group, &[id.to_string()]).await?;
        Ok(removed > 0)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        reply
            .ids
            .into_iter()
            .map(|p| {
                Ok(PendingEntry {
                    id: parse_id(&p.id)?,
                    consumer: p.consumer,
                    idle: Duration::from_millis(p.last_delivered_ms as u64),
                    delivery_count: p.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entries: &[PendingEntry],
    ) -> QueueResult<Vec<LogEntry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await?;

        // XCLAIM does not report counts; it increments the one XPENDING showed
        let counts: HashMap<EntryId, u64> =
            entries.iter().map(|e| (e.id, e.delivery_count)).collect();

        reply
            .ids
            .iter()
            .map(|sid| {
                let id = parse_id(&sid.id)?;
                let previous = counts.get(&id).copied().unwrap_or(0);
                to_log_entry(sid, previous + 1)
            })
            .collect()
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: EntryId,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let touched: i64 = self
            .touch
            .key(stream)
            .arg(group)
            .arg(consumer)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn set_ex_if(
        &self,
        guard_key: &str,
        forbidden: &[&str],
        writes: &[(String, String)],
        ttl: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let mut invocation = self.guarded_write.prepare_invoke();
        invocation.key(guard_key);
        for (key, _) in writes {
            invocation.key(key);
        }
        invocation.arg(ttl_secs(ttl)).arg(forbidden.len());
        for value in forbidden {
            invocation.arg(*value);
        }
        for (_, value) in writes {
            invocation.arg(value);
        }

        let written: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(written == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut iter: redis::AsyncIter<String> = conn.scan_match(glob_escape(prefix)).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key?);
        }
        drop(iter);

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> QueueResult<KeyTtl> {
        let mut conn = self.conn().await?;
        let millis: i64 = conn.pttl(key).await?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.max(0) as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        Ok(conn.expire(key, secs).await?)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.blocking.lock().await.clear();
        info!("Redis transport closed");
        Ok(())
    }
}
