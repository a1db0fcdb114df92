//! Redis-backed queue transport.
//!
//! Each queue is a handful of keys under the service namespace:
//!
//! - `<ns>:queues` set of existing queue names
//! - `<ns>:queue:<name>:ready` list of message ids waiting for delivery
//! - `<ns>:queue:<name>:bodies` hash of message id to body
//! - `<ns>:queue:<name>:inflight` sorted set of message id by visibility deadline (ms)
//! - `<ns>:queue:<name>:receipts` hash of message id to current receipt token
//! - `<ns>:queue:<name>:counts` hash of message id to delivery count
//! - `<ns>:queue:<name>:dedup:<id>` dedup marker, expires with the dedup window
//!
//! Send, claim and delete each run as a single Lua script so a crash can
//! never leave a message both claimed and lost. Visibility deadlines use
//! the server clock (`TIME` inside the claim script), which needs Redis 5+.

use super::{deadline_after, MessageId, QueueService, ReceiptHandle, ReceivedMessage, SendOptions};
use crate::error::{DispatchError, Result};
use crate::message::QueueRef;
use ::redis::{aio::ConnectionManager, AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Pause between claim attempts while long polling.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const MISSING_QUEUE: &str = "NONEXISTENT_QUEUE";

const SEND_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
  return redis.error_reply('NONEXISTENT_QUEUE')
end
if KEYS[4] then
  local existing = redis.call('GET', KEYS[4])
  if existing then
    return existing
  end
  redis.call('SET', KEYS[4], ARGV[2], 'EX', ARGV[4])
end
redis.call('HSET', KEYS[3], ARGV[2], ARGV[3])
redis.call('LPUSH', KEYS[2], ARGV[2])
return ARGV[2]
"#;

const CLAIM_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
  return redis.error_reply('NONEXISTENT_QUEUE')
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[4], id)
  redis.call('HDEL', KEYS[5], id)
  redis.call('RPUSH', KEYS[2], id)
end
local out = {}
for i = 1, tonumber(ARGV[3]) do
  local id = redis.call('RPOP', KEYS[2])
  if not id then
    break
  end
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local receipt = ARGV[4] .. '-' .. i
    local count = redis.call('HINCRBY', KEYS[6], id, 1)
    redis.call('ZADD', KEYS[4], now + tonumber(ARGV[2]), id)
    redis.call('HSET', KEYS[5], id, receipt)
    table.insert(out, id)
    table.insert(out, receipt)
    table.insert(out, body)
    table.insert(out, tostring(count))
  end
end
return out
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

struct QueueKeys {
    ready: String,
    bodies: String,
    inflight: String,
    receipts: String,
    counts: String,
    dedup_prefix: String,
}

impl QueueKeys {
    fn new(namespace: &str, name: &str) -> Self {
        let base = format!("{namespace}:queue:{name}");
        Self {
            ready: format!("{base}:ready"),
            bodies: format!("{base}:bodies"),
            inflight: format!("{base}:inflight"),
            receipts: format!("{base}:receipts"),
            counts: format!("{base}:counts"),
            dedup_prefix: format!("{base}:dedup"),
        }
    }

    fn all(&self) -> Vec<&str> {
        vec![
            self.ready.as_str(),
            self.bodies.as_str(),
            self.inflight.as_str(),
            self.receipts.as_str(),
            self.counts.as_str(),
        ]
    }
}

/// Queue transport over a shared Redis instance.
pub struct RedisQueueService {
    /// Redis connection manager for async operations.
    conn: ConnectionManager,
    namespace: String,
    visibility_timeout: Duration,
    dedup_window: Duration,
    send_script: Script,
    claim_script: Script,
    delete_script: Script,
}

impl RedisQueueService {
    pub fn new(
        conn: ConnectionManager,
        namespace: impl Into<String>,
        visibility_timeout: Duration,
        dedup_window: Duration,
    ) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            visibility_timeout,
            dedup_window,
            send_script: Script::new(SEND_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        }
    }

    /// Opens a managed connection to `redis_url`.
    pub async fn connect(
        redis_url: &str,
        namespace: impl Into<String>,
        visibility_timeout: Duration,
        dedup_window: Duration,
    ) -> Result<Self> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| DispatchError::transport("connect", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| DispatchError::transport("connect", e))?;
        info!("Connected to Redis");
        Ok(Self::new(conn, namespace, visibility_timeout, dedup_window))
    }

    fn registry_key(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    fn keys(&self, queue: &QueueRef) -> Result<QueueKeys> {
        if queue.namespace() != self.namespace {
            return Err(DispatchError::QueueNotFound(queue.to_string()));
        }
        Ok(QueueKeys::new(&self.namespace, queue.name()))
    }

    fn map_err(queue: &QueueRef, operation: &'static str, err: RedisError) -> DispatchError {
        let missing = err.code() == Some(MISSING_QUEUE) || err.to_string().contains(MISSING_QUEUE);
        if missing {
            DispatchError::QueueNotFound(queue.to_string())
        } else {
            DispatchError::transport(operation, err)
        }
    }

    async fn claim(
        &self,
        queue: &QueueRef,
        keys: &QueueKeys,
        max: u32,
    ) -> Result<Vec<ReceivedMessage>> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(self.registry_key())
            .key(&keys.ready)
            .key(&keys.bodies)
            .key(&keys.inflight)
            .key(&keys.receipts)
            .key(&keys.counts)
            .arg(queue.name())
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg(max.max(1))
            .arg(&token);

        let mut conn = self.conn.clone();
        let flat: Vec<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err(queue, "receive", e))?;

        Ok(flat
            .chunks_exact(4)
            .map(|chunk| ReceivedMessage {
                message_id: MessageId(chunk[0].clone()),
                receipt: ReceiptHandle(format!("{}|{}", chunk[0], chunk[1])),
                body: chunk[2].clone(),
                receive_count: chunk[3].parse().unwrap_or(1),
            })
            .collect())
    }
}

#[async_trait]
impl QueueService for RedisQueueService {
    async fn create_queue(&self, name: &str) -> Result<QueueRef> {
        let queue = QueueRef::new(&self.namespace, name)?;
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(self.registry_key(), name)
            .await
            .map_err(|e| DispatchError::transport("create_queue", e))?;
        debug!(queue = %queue, "Created queue");
        Ok(queue)
    }

    async fn delete_queue(&self, queue: &QueueRef) -> Result<()> {
        let keys = self.keys(queue)?;
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .srem(self.registry_key(), queue.name())
            .await
            .map_err(|e| DispatchError::transport("delete_queue", e))?;
        if removed == 0 {
            return Err(DispatchError::QueueNotFound(queue.to_string()));
        }
        // Dedup markers are left to expire on their own.
        conn.del::<_, ()>(keys.all())
            .await
            .map_err(|e| DispatchError::transport("delete_queue", e))?;
        debug!(queue = %queue, "Deleted queue");
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueRef>> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = conn
            .smembers(self.registry_key())
            .await
            .map_err(|e| DispatchError::transport("list_queues", e))?;
        names.sort();
        names
            .iter()
            .map(|name| QueueRef::new(&self.namespace, name))
            .collect()
    }

    async fn send(&self, queue: &QueueRef, body: &str, options: SendOptions) -> Result<MessageId> {
        let keys = self.keys(queue)?;
        let id = MessageId::generate();

        let mut invocation = self.send_script.prepare_invoke();
        invocation
            .key(self.registry_key())
            .key(&keys.ready)
            .key(&keys.bodies);
        if let Some(dedup_id) = &options.dedup_id {
            invocation.key(format!("{}:{}", keys.dedup_prefix, dedup_id));
        }
        invocation
            .arg(queue.name())
            .arg(id.as_str())
            .arg(body)
            .arg(self.dedup_window.as_secs().max(1));

        let mut conn = self.conn.clone();
        let stored: String = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err(queue, "send", e))?;

        if stored != id.0 {
            debug!(queue = %queue, dedup_id = ?options.dedup_id, "Coalesced duplicate send");
        }
        Ok(MessageId(stored))
    }

    async fn receive(
        &self,
        queue: &QueueRef,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let keys = self.keys(queue)?;
        let deadline = deadline_after(wait);

        loop {
            let received = self.claim(queue, &keys, max_messages).await?;
            if !received.is_empty() {
                debug!(queue = %queue, count = received.len(), "Received messages");
                return Ok(received);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete_message(&self, queue: &QueueRef, receipt: &ReceiptHandle) -> Result<()> {
        let keys = self.keys(queue)?;
        let (id, token) = receipt.as_str().split_once('|').ok_or_else(|| {
            DispatchError::transport("delete_message", format!("invalid receipt handle {receipt}"))
        })?;

        let mut invocation = self.delete_script.prepare_invoke();
        invocation
            .key(&keys.bodies)
            .key(&keys.inflight)
            .key(&keys.receipts)
            .key(&keys.counts)
            .arg(id)
            .arg(token);

        let mut conn = self.conn.clone();
        let deleted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::map_err(queue, "delete_message", e))?;

        if deleted == 0 {
            debug!(queue = %queue, receipt = %receipt, "Ignoring stale receipt handle");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine
    // Skip in CI: cargo test --lib -- --skip queue::redis::tests

    async fn service(visibility: Duration) -> RedisQueueService {
        let namespace = format!("convert-test-{}", uuid::Uuid::new_v4().simple());
        let dedup = Duration::from_secs(60);
        RedisQueueService::connect("redis://127.0.0.1/", namespace, visibility, dedup)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_send_receive_delete() {
        let service = service(Duration::from_secs(30)).await;
        let queue = service.create_queue("work").await.unwrap();

        service.send(&queue, "hello", SendOptions::default()).await.unwrap();
        let received = service.receive(&queue, 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "hello");
        assert_eq!(received[0].receive_count, 1);

        service.delete_message(&queue, &received[0].receipt).await.unwrap();
        assert!(service.receive(&queue, 10, Duration::ZERO).await.unwrap().is_empty());

        service.delete_queue(&queue).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_dedup_and_redelivery() {
        let service = service(Duration::from_millis(300)).await;
        let queue = service.create_queue("work").await.unwrap();

        let first = service.send(&queue, "a", SendOptions::keyed("k-0")).await.unwrap();
        let second = service.send(&queue, "a", SendOptions::keyed("k-0")).await.unwrap();
        assert_eq!(first, second);

        let received = service.receive(&queue, 10, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 1);

        let again = service.receive(&queue, 10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);

        service.delete_queue(&queue).await.unwrap();
        assert!(matches!(
            service.send(&queue, "late", SendOptions::default()).await,
            Err(DispatchError::QueueNotFound(_))
        ));
    }
}
