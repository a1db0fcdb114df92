//! In-process queue transport.
//!
//! Honours the same delivery contract as the durable transport (visibility
//! windows, dedup windows, long polling) so the dispatcher and the workers
//! can be exercised end to end without a broker. Fault injection hooks let
//! tests fail individual operations.

use super::{
    deadline_after, instant_after, MessageId, QueueService, ReceiptHandle, ReceivedMessage,
    SendOptions,
};
use crate::error::{DispatchError, Result};
use crate::message::QueueRef;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be received.
    pub visible: usize,
    /// Messages received but neither deleted nor expired.
    pub in_flight: usize,
    /// Sends that stored a new message.
    pub accepted: usize,
    /// Sends coalesced into an earlier message by dedup id.
    pub coalesced: usize,
}

#[derive(Debug, Clone)]
struct Stored {
    id: MessageId,
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Stored,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct Faults {
    fail_sends: usize,
    lose_send_acks: usize,
    fail_receives: usize,
    fail_deletes: usize,
}

#[derive(Debug)]
struct QueueState {
    ready: VecDeque<Stored>,
    in_flight: HashMap<ReceiptHandle, InFlight>,
    dedup: HashMap<String, (MessageId, Instant)>,
    faults: Faults,
    accepted: usize,
    coalesced: usize,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            dedup: HashMap::new(),
            faults: Faults::default(),
            accepted: 0,
            coalesced: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Returns expired in-flight messages to the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<ReceiptHandle> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(r, _)| r.clone())
            .collect();

        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                debug!(message_id = %flight.message.id, "Visibility window expired, redelivering");
                self.ready.push_front(flight.message);
            }
        }
    }

    fn next_visibility_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

/// Queue transport living entirely in process memory.
pub struct InMemoryQueueService {
    namespace: String,
    visibility_timeout: Duration,
    dedup_window: Duration,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryQueueService {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Counters for `queue`, or `None` if it does not exist.
    pub fn stats(&self, queue: &QueueRef) -> Option<QueueStats> {
        let mut queues = self.lock();
        let state = queues.get_mut(queue.name())?;
        state.reclaim_expired(Instant::now());
        Some(QueueStats {
            visible: state.ready.len(),
            in_flight: state.in_flight.len(),
            accepted: state.accepted,
            coalesced: state.coalesced,
        })
    }

    /// The next `n` sends to `queue` fail without storing anything.
    pub fn fail_sends(&self, queue: &QueueRef, n: usize) {
        self.with_faults(queue, |f| f.fail_sends += n);
    }

    /// The next `n` sends to `queue` store the message but report failure.
    pub fn lose_send_acks(&self, queue: &QueueRef, n: usize) {
        self.with_faults(queue, |f| f.lose_send_acks += n);
    }

    pub fn fail_receives(&self, queue: &QueueRef, n: usize) {
        self.with_faults(queue, |f| f.fail_receives += n);
    }

    pub fn fail_deletes(&self, queue: &QueueRef, n: usize) {
        self.with_faults(queue, |f| f.fail_deletes += n);
    }

    fn with_faults(&self, queue: &QueueRef, apply: impl FnOnce(&mut Faults)) {
        if let Some(state) = self.lock().get_mut(queue.name()) {
            apply(&mut state.faults);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // Every critical section leaves the map consistent, so poisoning is ignored.
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn owns(&self, queue: &QueueRef) -> bool {
        queue.namespace() == self.namespace
    }

    fn not_found(queue: &QueueRef) -> DispatchError {
        DispatchError::QueueNotFound(queue.to_string())
    }

    /// Claims up to `max` visible messages, or reports when to look again.
    fn try_claim(
        &self,
        queue: &QueueRef,
        max: usize,
    ) -> Result<std::result::Result<Vec<ReceivedMessage>, (Arc<Notify>, Option<Instant>)>> {
        let mut queues = self.lock();
        let state = queues
            .get_mut(queue.name())
            .ok_or_else(|| Self::not_found(queue))?;

        let now = Instant::now();
        state.reclaim_expired(now);

        if state.ready.is_empty() {
            return Ok(Err((state.notify.clone(), state.next_visibility_deadline())));
        }

        let mut received = Vec::new();
        while received.len() < max {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;
            let token = uuid::Uuid::new_v4().simple();
            let receipt = ReceiptHandle(format!("{}:{}", message.id, token));
            received.push(ReceivedMessage {
                message_id: message.id.clone(),
                receipt: receipt.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            state.in_flight.insert(
                receipt,
                InFlight {
                    message,
                    visible_at: instant_after(now, self.visibility_timeout),
                },
            );
        }
        Ok(Ok(received))
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn create_queue(&self, name: &str) -> Result<QueueRef> {
        let queue = QueueRef::new(&self.namespace, name)?;
        self.lock()
            .entry(name.to_string())
            .or_insert_with(QueueState::new);
        debug!(queue = %queue, "Created queue");
        Ok(queue)
    }

    async fn delete_queue(&self, queue: &QueueRef) -> Result<()> {
        if !self.owns(queue) {
            return Err(Self::not_found(queue));
        }
        let state = self
            .lock()
            .remove(queue.name())
            .ok_or_else(|| Self::not_found(queue))?;
        // Wake long-pollers so they observe the deletion.
        state.notify.notify_waiters();
        debug!(queue = %queue, "Deleted queue");
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueRef>> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
            .iter()
            .map(|name| QueueRef::new(&self.namespace, name))
            .collect()
    }

    async fn send(&self, queue: &QueueRef, body: &str, options: SendOptions) -> Result<MessageId> {
        if !self.owns(queue) {
            return Err(Self::not_found(queue));
        }
        let mut queues = self.lock();
        let state = queues
            .get_mut(queue.name())
            .ok_or_else(|| Self::not_found(queue))?;

        if state.faults.fail_sends > 0 {
            state.faults.fail_sends -= 1;
            return Err(DispatchError::transport("send", "injected send failure"));
        }

        let now = Instant::now();
        state.dedup.retain(|_, (_, expires)| *expires > now);

        if let Some(dedup_id) = &options.dedup_id {
            if let Some((existing, _)) = state.dedup.get(dedup_id) {
                state.coalesced += 1;
                debug!(queue = %queue, dedup_id = %dedup_id, "Coalesced duplicate send");
                return Ok(existing.clone());
            }
        }

        let id = MessageId::generate();
        if let Some(dedup_id) = options.dedup_id {
            state.dedup.insert(dedup_id, (id.clone(), instant_after(now, self.dedup_window)));
        }
        state.ready.push_back(Stored {
            id: id.clone(),
            body: body.to_string(),
            receive_count: 0,
        });
        state.accepted += 1;
        state.notify.notify_waiters();

        if state.faults.lose_send_acks > 0 {
            state.faults.lose_send_acks -= 1;
            return Err(DispatchError::transport("send", "injected lost acknowledgement"));
        }
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &QueueRef,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        if !self.owns(queue) {
            return Err(Self::not_found(queue));
        }
        {
            let mut queues = self.lock();
            let state = queues
                .get_mut(queue.name())
                .ok_or_else(|| Self::not_found(queue))?;
            if state.faults.fail_receives > 0 {
                state.faults.fail_receives -= 1;
                return Err(DispatchError::transport("receive", "injected receive failure"));
            }
        }

        let max = max_messages.max(1) as usize;
        let deadline = deadline_after(wait);

        loop {
            let (notify, next_expiry) = match self.try_claim(queue, max)? {
                Ok(received) => return Ok(received),
                Err(wake) => wake,
            };
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            // Register interest before re-checking so a send racing with us
            // is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Ok(received) = self.try_claim(queue, max)? {
                return Ok(received);
            }

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_message(&self, queue: &QueueRef, receipt: &ReceiptHandle) -> Result<()> {
        if !self.owns(queue) {
            return Err(Self::not_found(queue));
        }
        let mut queues = self.lock();
        let state = queues
            .get_mut(queue.name())
            .ok_or_else(|| Self::not_found(queue))?;

        if state.faults.fail_deletes > 0 {
            state.faults.fail_deletes -= 1;
            return Err(DispatchError::transport("delete_message", "injected delete failure"));
        }

        if state.in_flight.remove(receipt).is_none() {
            debug!(queue = %queue, receipt = %receipt, "Ignoring stale receipt handle");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_WAIT: Duration = Duration::ZERO;

    #[tokio::test]
    async fn test_send_receive_delete() {
        let service = InMemoryQueueService::new("memory");
        let queue = service.create_queue("work").await.unwrap();

        service.send(&queue, "one", SendOptions::default()).await.unwrap();
        service.send(&queue, "two", SendOptions::default()).await.unwrap();

        let received = service.receive(&queue, 10, NO_WAIT).await.unwrap();
        let bodies: Vec<_> = received.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
        assert_eq!(service.stats(&queue).unwrap().in_flight, 2);

        for message in &received {
            service.delete_message(&queue, &message.receipt).await.unwrap();
        }
        let stats = service.stats(&queue).unwrap();
        assert_eq!((stats.visible, stats.in_flight), (0, 0));
    }

    #[tokio::test]
    async fn test_dedup_coalesces_sends() {
        let service = InMemoryQueueService::new("memory");
        let queue = service.create_queue("work").await.unwrap();

        let first = service.send(&queue, "a", SendOptions::keyed("batch-0")).await.unwrap();
        let second = service.send(&queue, "a", SendOptions::keyed("batch-0")).await.unwrap();
        service.send(&queue, "b", SendOptions::keyed("batch-1")).await.unwrap();

        assert_eq!(first, second);
        let stats = service.stats(&queue).unwrap();
        assert_eq!((stats.accepted, stats.coalesced, stats.visible), (2, 1, 2));
    }

    #[tokio::test]
    async fn test_dedup_window_expires() {
        let service =
            InMemoryQueueService::new("memory").with_dedup_window(Duration::from_millis(20));
        let queue = service.create_queue("work").await.unwrap();

        service.send(&queue, "a", SendOptions::keyed("k")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        service.send(&queue, "a", SendOptions::keyed("k")).await.unwrap();

        assert_eq!(service.stats(&queue).unwrap().accepted, 2);
    }

    #[tokio::test]
    async fn test_visibility_timeout_redelivers() {
        let service =
            InMemoryQueueService::new("memory").with_visibility_timeout(Duration::from_millis(200));
        let queue = service.create_queue("work").await.unwrap();
        service.send(&queue, "job", SendOptions::default()).await.unwrap();

        let first = service.receive(&queue, 1, NO_WAIT).await.unwrap();
        assert_eq!(first[0].receive_count, 1);
        assert!(service.receive(&queue, 1, NO_WAIT).await.unwrap().is_empty());

        let again = service
            .receive(&queue, 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].receive_count, 2);

        // The first delivery's handle is stale now.
        service.delete_message(&queue, &first[0].receipt).await.unwrap();
        assert_eq!(service.stats(&queue).unwrap().in_flight, 1);
        service.delete_message(&queue, &again[0].receipt).await.unwrap();
        assert_eq!(service.stats(&queue).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let service = Arc::new(InMemoryQueueService::new("memory"));
        let queue = service.create_queue("work").await.unwrap();

        let sender = {
            let service = service.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                service.send(&queue, "late", SendOptions::default()).await.unwrap();
            })
        };

        let started = std::time::Instant::now();
        let received = service.receive(&queue, 1, Duration::from_secs(5)).await.unwrap();
        sender.await.unwrap();

        assert_eq!(received.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_queue() {
        let service = InMemoryQueueService::new("memory");
        let queue = service.create_queue("gone").await.unwrap();
        service.delete_queue(&queue).await.unwrap();

        assert!(matches!(
            service.send(&queue, "x", SendOptions::default()).await,
            Err(DispatchError::QueueNotFound(_))
        ));
        assert!(matches!(
            service.receive(&queue, 1, NO_WAIT).await,
            Err(DispatchError::QueueNotFound(_))
        ));
        assert!(service.list_queues().await.unwrap().is_empty());

        let foreign = QueueRef::new("elsewhere", "gone").unwrap();
        assert!(service.delete_queue(&foreign).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let service = InMemoryQueueService::new("memory");
        let queue = service.create_queue("work").await.unwrap();

        service.fail_sends(&queue, 1);
        assert!(service.send(&queue, "x", SendOptions::default()).await.is_err());
        assert_eq!(service.stats(&queue).unwrap().accepted, 0);

        service.lose_send_acks(&queue, 1);
        assert!(service.send(&queue, "y", SendOptions::default()).await.is_err());
        assert_eq!(service.stats(&queue).unwrap().accepted, 1);

        let received = service.receive(&queue, 1, NO_WAIT).await.unwrap();
        service.fail_deletes(&queue, 1);
        assert!(service.delete_message(&queue, &received[0].receipt).await.is_err());
        service.delete_message(&queue, &received[0].receipt).await.unwrap();

        service.fail_receives(&queue, 1);
        assert!(service.receive(&queue, 1, NO_WAIT).await.unwrap_err().is_retriable());
    }
}
