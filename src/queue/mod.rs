//! Queue transport capability consumed by the dispatcher and the workers.
//!
//! The core never talks to a broker directly. It is handed an
//! `Arc<dyn QueueService>` and relies only on the contract below:
//!
//! - at-least-once delivery;
//! - a received message is hidden from other receivers for a visibility
//!   window and reappears if it is not deleted in time;
//! - sends sharing a dedup id within the dedup window are coalesced.

pub mod memory;
pub mod redis;

use crate::error::Result;
use crate::message::QueueRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub use memory::{InMemoryQueueService, QueueStats};
pub use self::redis::RedisQueueService;

/// Roughly thirty years, the horizon tokio uses for an unbounded sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `base + offset`, saturating at a far-future instant instead of panicking.
pub(crate) fn instant_after(base: Instant, offset: Duration) -> Instant {
    base.checked_add(offset)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// Deadline `timeout` from now; `Duration::MAX` means no practical limit.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    instant_after(Instant::now(), timeout)
}

/// Transport-assigned identifier of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token proving the holder received a particular delivery of a message.
///
/// Only the most recent delivery's handle can delete the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-send options understood by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Ordering group for strictly-ordered queue variants.
    pub group_id: Option<String>,
    /// Sends with the same id inside the dedup window are coalesced.
    pub dedup_id: Option<String>,
}

impl SendOptions {
    /// Uses `key` both as group id and as dedup id.
    pub fn keyed(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            group_id: Some(key.clone()),
            dedup_id: Some(key),
        }
    }
}

/// One delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub receive_count: u32,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Creates the queue if it does not exist yet and returns its ref.
    async fn create_queue(&self, name: &str) -> Result<QueueRef>;

    /// Deletes the queue together with every message it still holds.
    async fn delete_queue(&self, queue: &QueueRef) -> Result<()>;

    async fn list_queues(&self) -> Result<Vec<QueueRef>>;

    async fn send(&self, queue: &QueueRef, body: &str, options: SendOptions) -> Result<MessageId>;

    /// Long-polls for up to `max_messages`, waiting at most `wait`.
    ///
    /// Returns as soon as at least one message is available; an empty
    /// list means the wait elapsed.
    async fn receive(
        &self,
        queue: &QueueRef,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledges a delivery. Stale handles are ignored.
    async fn delete_message(&self, queue: &QueueRef, receipt: &ReceiptHandle) -> Result<()>;
}
