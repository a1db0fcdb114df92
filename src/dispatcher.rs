//! Producer side of the protocol: submit a batch and collect its responses.
//!
//! Each batch owns a fresh callback queue named after a random batch token.
//! Requests go to the shared processing queue with a dedup id derived from
//! `(batch token, sequence)`; responses are correlated by `sequence`, never
//! by arrival order. The callback queue is released on every exit path.

use crate::error::{DispatchError, Result};
use crate::message::{validate_object_ref, Message, MessageKind, QueueRef};
use crate::queue::{deadline_after, QueueService, ReceivedMessage, SendOptions};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Long-poll wait of each receive on the callback queue.
    pub poll_wait: Duration,
    /// Maximum messages per receive on the callback queue.
    pub poll_batch: u32,
    /// Attempts per request send; retries reuse the dedup id.
    pub send_attempts: u32,
    /// Pause after a failed send or receive.
    pub retry_backoff: Duration,
    pub callback_prefix: String,
    /// Confirm the callback queue is listed before sending requests.
    pub verify_callback_queue: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_secs(1),
            poll_batch: 10,
            send_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            callback_prefix: "callback-".to_string(),
            verify_callback_queue: true,
        }
    }
}

/// Outcome of one batch, as recorded by telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_token: String,
    pub batch_size: u32,
    pub received: usize,
    /// Responses carrying a conversion failure.
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timed_out: bool,
}

impl BatchSummary {
    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }
}

/// What happened to a message taken off the callback queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recorded {
    New,
    Duplicate,
    Foreign,
}

/// Producer-side state of an in-progress batch.
struct Batch {
    token: String,
    callback: QueueRef,
    size: u32,
    pending: BTreeSet<u32>,
    responses: BTreeMap<u32, Message>,
}

impl Batch {
    fn new(token: String, callback: QueueRef, size: u32) -> Self {
        Self {
            token,
            callback,
            size,
            pending: (0..size).collect(),
            responses: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records a response; only the first one per sequence is kept.
    fn record(&mut self, response: Message) -> Recorded {
        if response.callback_ref != self.callback
            || response.batch_size != self.size
            || response.sequence >= self.size
        {
            return Recorded::Foreign;
        }
        if !self.pending.remove(&response.sequence) {
            return Recorded::Duplicate;
        }
        self.responses.insert(response.sequence, response);
        Recorded::New
    }

    fn failed(&self) -> usize {
        self.responses.values().filter(|r| !r.is_success()).count()
    }

    fn into_responses(self) -> Vec<Message> {
        self.responses.into_values().collect()
    }
}

/// Deletes the callback queue if the batch future is dropped mid-flight.
struct CallbackQueueGuard {
    queues: Arc<dyn QueueService>,
    queue: Option<QueueRef>,
}

impl CallbackQueueGuard {
    async fn release(mut self) {
        if let Some(queue) = self.queue.take() {
            release_queue(self.queues.as_ref(), &queue).await;
        }
    }
}

impl Drop for CallbackQueueGuard {
    fn drop(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queues = self.queues.clone();
                handle.spawn(async move {
                    release_queue(queues.as_ref(), &queue).await;
                });
            }
            Err(_) => warn!(queue = %queue, "No runtime to release abandoned callback queue"),
        }
    }
}

async fn release_queue(queues: &dyn QueueService, queue: &QueueRef) {
    match queues.delete_queue(queue).await {
        Ok(()) => debug!(queue = %queue, "Released callback queue"),
        Err(e) => warn!(queue = %queue, error = %e, "Failed to release callback queue"),
    }
}

/// Submits batches onto the processing queue and drains their responses.
pub struct Dispatcher {
    queues: Arc<dyn QueueService>,
    processing_queue: QueueRef,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queues: Arc<dyn QueueService>,
        processing_queue: QueueRef,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queues,
            processing_queue,
            config,
        }
    }

    /// Converts every object in `object_refs` and returns the responses in
    /// sequence order.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Timeout`] with the missing sequences when not all
    ///   responses arrive within `timeout`
    /// - [`DispatchError::MalformedMessage`] when any object ref is invalid;
    ///   nothing is created or sent in that case
    /// - [`DispatchError::Transport`] when the callback queue cannot be
    ///   created or a request cannot be sent after all attempts
    pub async fn run_batch<S: AsRef<str>>(
        &self,
        object_refs: &[S],
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        if object_refs.is_empty() {
            return Ok(Vec::new());
        }
        let size = u32::try_from(object_refs.len()).map_err(|_| {
            DispatchError::InvalidBatch(format!("{} items exceed u32", object_refs.len()))
        })?;
        for object_ref in object_refs {
            validate_object_ref(object_ref.as_ref())?;
        }

        let started_at = Utc::now();
        let deadline = deadline_after(timeout);
        let token = uuid::Uuid::new_v4().simple().to_string();

        let callback = self
            .queues
            .create_queue(&format!("{}{}", self.config.callback_prefix, token))
            .await?;
        let guard = CallbackQueueGuard {
            queues: self.queues.clone(),
            queue: Some(callback.clone()),
        };
        info!(
            batch_token = %token,
            callback = %callback,
            batch_size = size,
            "Created callback queue"
        );

        let mut batch = Batch::new(token, callback, size);
        let outcome = self.submit_and_drain(&mut batch, object_refs, deadline).await;
        guard.release().await;

        let summary = BatchSummary {
            batch_token: batch.token.clone(),
            batch_size: size,
            received: batch.responses.len(),
            failed: batch.failed(),
            started_at,
            finished_at: Utc::now(),
            timed_out: matches!(outcome, Err(DispatchError::Timeout { .. })),
        };
        telemetry::record_batch_telemetry(&summary);

        outcome.map(|()| batch.into_responses())
    }

    async fn submit_and_drain<S: AsRef<str>>(
        &self,
        batch: &mut Batch,
        object_refs: &[S],
        deadline: Instant,
    ) -> Result<()> {
        if self.config.verify_callback_queue {
            self.verify_callback_queue(&batch.callback).await?;
        }

        // Build every request before the first send so a bad item leaves
        // nothing on the processing queue.
        let requests = (0..batch.size)
            .zip(object_refs)
            .map(|(sequence, object_ref)| {
                Message::request(
                    object_ref.as_ref(),
                    batch.callback.clone(),
                    batch.size,
                    sequence,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        for request in &requests {
            self.send_request(request).await?;
        }
        info!(batch_token = %batch.token, batch_size = batch.size, "Submitted batch");

        while !batch.is_complete() {
            let now = Instant::now();
            if now >= deadline {
                return Err(DispatchError::Timeout {
                    batch_token: batch.token.clone(),
                    missing: batch.pending.clone(),
                });
            }

            let wait = self.config.poll_wait.min(deadline - now);
            match self
                .queues
                .receive(&batch.callback, self.config.poll_batch, wait)
                .await
            {
                Ok(received) => {
                    for message in received {
                        self.collect(batch, message).await;
                    }
                }
                Err(e) => {
                    warn!(batch_token = %batch.token, error = %e, "Failed to poll callback queue");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(self.config.retry_backoff.min(remaining)).await;
                }
            }
        }

        Ok(())
    }

    async fn verify_callback_queue(&self, callback: &QueueRef) -> Result<()> {
        let queues = self.queues.list_queues().await?;
        if queues.contains(callback) {
            Ok(())
        } else {
            Err(DispatchError::QueueNotFound(callback.to_string()))
        }
    }

    /// Sends one request, retrying with the same dedup id.
    async fn send_request(&self, request: &Message) -> Result<()> {
        let body = request.to_json()?;
        let attempts = self.config.send_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .queues
                .send(&self.processing_queue, &body, SendOptions::keyed(request.dedup_key()))
                .await
            {
                Ok(message_id) => {
                    debug!(sequence = request.sequence, message_id = %message_id, "Sent request");
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt < attempts => {
                    warn!(
                        sequence = request.sequence,
                        attempt = attempt,
                        error = %e,
                        "Request send failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => {
                    error!(sequence = request.sequence, error = %e, "Request send failed");
                    return Err(e);
                }
            }
        }
    }

    /// Records a delivery, then deletes it from the callback queue.
    async fn collect(&self, batch: &mut Batch, message: ReceivedMessage) {
        match Message::parse_kind(&message.body, MessageKind::Response) {
            Ok(response) => {
                let sequence = response.sequence;
                match batch.record(response) {
                    Recorded::New => debug!(
                        batch_token = %batch.token,
                        sequence = sequence,
                        remaining = batch.pending.len(),
                        "Recorded response"
                    ),
                    Recorded::Duplicate => {
                        debug!(
                            batch_token = %batch.token,
                            sequence = sequence,
                            "Ignoring duplicate response"
                        )
                    }
                    Recorded::Foreign => {
                        warn!(
                            batch_token = %batch.token,
                            sequence = sequence,
                            "Discarding response for another batch"
                        )
                    }
                }
            }
            Err(e) => {
                warn!(batch_token = %batch.token, error = %e, "Discarding malformed response")
            }
        }

        // A failed delete only means the response comes back and is ignored.
        if let Err(e) = self
            .queues
            .delete_message(&batch.callback, &message.receipt)
            .await
        {
            warn!(batch_token = %batch.token, error = %e, "Failed to delete response");
        }
    }
}
