//! Consumer side of the protocol.
//!
//! A worker long-polls the shared processing queue, converts each requested
//! object and posts the answer to the callback queue named in the request.
//! The request is deleted only after the answer was sent, so a crash
//! anywhere before that point leads to redelivery instead of loss.

use crate::converter::Converter;
use crate::error::DispatchError;
use crate::message::{Message, MessageKind, QueueRef};
use crate::queue::{QueueService, ReceivedMessage, SendOptions};
use crate::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum requests taken per receive.
    pub max_messages: u32,
    /// Long-poll wait of each receive.
    pub wait: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
    /// Emit a heartbeat every this many handled messages (0 disables).
    pub heartbeat_every: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
            heartbeat_every: 10,
        }
    }
}

/// What the worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The response was sent and the request acknowledged.
    Responded,
    /// Deleted without a response: poison message or abandoned batch.
    Discarded,
    /// The response could not be sent; the request will be redelivered.
    Redeliver,
}

pub struct Worker {
    id: usize,
    queues: Arc<dyn QueueService>,
    converter: Arc<dyn Converter>,
    processing_queue: QueueRef,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: usize,
        queues: Arc<dyn QueueService>,
        converter: Arc<dyn Converter>,
        processing_queue: QueueRef,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            queues,
            converter,
            processing_queue,
            config,
        }
    }

    /// Runs until `stop` is cancelled.
    ///
    /// Cancellation is observed between messages and while idle in a long
    /// poll, never between receiving a request and acknowledging it.
    pub async fn run(&self, stop: CancellationToken) {
        info!(worker_id = self.id, queue = %self.processing_queue, "Worker started");
        let mut handled: u64 = 0;

        while !stop.is_cancelled() {
            // Requests claimed by a receive dropped here stay hidden until their
            // visibility window expires, then redeliver.
            let received = tokio::select! {
                _ = stop.cancelled() => break,
                received = self.queues.receive(
                    &self.processing_queue,
                    self.config.max_messages,
                    self.config.wait,
                ) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "Failed to receive requests");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            };

            for message in messages {
                self.handle(message).await;
                handled += 1;
                if self.config.heartbeat_every > 0 && handled % self.config.heartbeat_every == 0 {
                    telemetry::record_worker_heartbeat(self.id, handled);
                }
            }
        }

        info!(worker_id = self.id, handled = handled, "Worker stopped");
    }

    /// Performs a single receive and handles whatever arrived.
    ///
    /// Returns the dispositions in delivery order.
    pub async fn poll_once(&self) -> crate::error::Result<Vec<Disposition>> {
        let messages = self
            .queues
            .receive(
                &self.processing_queue,
                self.config.max_messages,
                self.config.wait,
            )
            .await?;

        let mut dispositions = Vec::with_capacity(messages.len());
        for message in messages {
            dispositions.push(self.handle(message).await);
        }
        Ok(dispositions)
    }

    /// Converts one delivered request and answers it.
    pub async fn handle(&self, delivery: ReceivedMessage) -> Disposition {
        let request = match Message::parse_kind(&delivery.body, MessageKind::Request) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    worker_id = self.id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Discarding poison message"
                );
                self.acknowledge(&delivery).await;
                return Disposition::Discarded;
            }
        };

        debug!(
            worker_id = self.id,
            sequence = request.sequence,
            batch_size = request.batch_size,
            receive_count = delivery.receive_count,
            object = %request.object_ref,
            "Processing request"
        );

        let started = Instant::now();
        let response = match self.converter.convert(&request.object_ref).await {
            Ok(artifact) => request.reply_ok(artifact),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(
                    worker_id = self.id,
                    sequence = request.sequence,
                    object = %request.object_ref,
                    error = %reason,
                    "Conversion failed"
                );
                request.reply_failed(&reason)
            }
        };

        let body = match response.to_json() {
            Ok(body) => body,
            Err(e) => {
                error!(worker_id = self.id, error = %e, "Failed to encode response");
                return Disposition::Redeliver;
            }
        };

        let sent = self
            .queues
            .send(&request.callback_ref, &body, SendOptions::keyed(response.dedup_key()))
            .await;

        match sent {
            Ok(_) => {
                self.acknowledge(&delivery).await;
                let duration_ms = started.elapsed().as_millis() as i64;
                telemetry::record_request_telemetry(self.id, &response, duration_ms);
                info!(
                    worker_id = self.id,
                    sequence = request.sequence,
                    callback = %request.callback_ref,
                    result = response.result.as_deref().unwrap_or_default(),
                    "Answered request"
                );
                Disposition::Responded
            }
            Err(DispatchError::QueueNotFound(queue)) => {
                // The dispatcher already gave up on this batch.
                warn!(
                    worker_id = self.id,
                    callback = %queue,
                    sequence = request.sequence,
                    "Callback queue is gone, dropping request"
                );
                self.acknowledge(&delivery).await;
                Disposition::Discarded
            }
            Err(e) => {
                error!(
                    worker_id = self.id,
                    sequence = request.sequence,
                    error = %e,
                    "Failed to send response, leaving request for redelivery"
                );
                Disposition::Redeliver
            }
        }
    }

    async fn acknowledge(&self, delivery: &ReceivedMessage) {
        if let Err(e) = self
            .queues
            .delete_message(&self.processing_queue, &delivery.receipt)
            .await
        {
            // The request comes back; its duplicate response is ignored.
            warn!(
                worker_id = self.id,
                message_id = %delivery.message_id,
                error = %e,
                "Failed to delete request"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::MockConverter;
    use crate::queue::{InMemoryQueueService, QueueStats};
    use pretty_assertions::assert_eq;

    struct Fixture {
        service: Arc<InMemoryQueueService>,
        processing: QueueRef,
        callback: QueueRef,
    }

    async fn fixture() -> Fixture {
        let service = Arc::new(
            InMemoryQueueService::new("memory").with_visibility_timeout(Duration::from_millis(100)),
        );
        let processing = service.create_queue("requests").await.unwrap();
        let callback = service.create_queue("callback-t").await.unwrap();
        Fixture {
            service,
            processing,
            callback,
        }
    }

    fn worker(fx: &Fixture, converter: MockConverter) -> Worker {
        Worker::new(
            0,
            fx.service.clone(),
            Arc::new(converter),
            fx.processing.clone(),
            WorkerConfig {
                wait: Duration::ZERO,
                ..WorkerConfig::default()
            },
        )
    }

    async fn submit(fx: &Fixture, object_ref: &str, size: u32, sequence: u32) -> Message {
        let request = Message::request(object_ref, fx.callback.clone(), size, sequence).unwrap();
        fx.service
            .send(
                &fx.processing,
                &request.to_json().unwrap(),
                SendOptions::keyed(request.dedup_key()),
            )
            .await
            .unwrap();
        request
    }

    async fn responses(fx: &Fixture) -> Vec<Message> {
        fx.service
            .receive(&fx.callback, 10, Duration::ZERO)
            .await
            .unwrap()
            .iter()
            .map(|m| Message::parse(&m.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_conversion_is_answered_then_deleted() {
        let fx = fixture().await;
        let request = submit(&fx, "in.svg", 2, 1).await;

        let mut converter = MockConverter::new();
        converter
            .expect_convert()
            .withf(|object_ref| object_ref == "in.svg")
            .times(1)
            .returning(|_| Ok("out.pdf".to_string()));

        let dispositions = worker(&fx, converter).poll_once().await.unwrap();

        assert_eq!(dispositions, vec![Disposition::Responded]);
        assert_eq!(responses(&fx).await, vec![request.reply_ok("out.pdf")]);
        assert_eq!(fx.service.stats(&fx.processing).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_conversion_failure_becomes_error_response() {
        let fx = fixture().await;
        submit(&fx, "broken.svg", 1, 0).await;

        let mut converter = MockConverter::new();
        converter
            .expect_convert()
            .returning(|_| Err(anyhow::anyhow!("bad svg")));

        let dispositions = worker(&fx, converter).poll_once().await.unwrap();
        let answers = responses(&fx).await;

        assert_eq!(dispositions, vec![Disposition::Responded]);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].result.as_deref(), Some("ERROR: bad svg"));
        assert_eq!(answers[0].object_ref, "broken.svg");
    }

    #[tokio::test]
    async fn test_poison_message_is_discarded() {
        let fx = fixture().await;
        fx.service
            .send(&fx.processing, "{\"kind\":\"request\"}", SendOptions::default())
            .await
            .unwrap();
        let response = Message::request("x", fx.callback.clone(), 1, 0).unwrap().reply_ok("y");
        fx.service
            .send(&fx.processing, &response.to_json().unwrap(), SendOptions::default())
            .await
            .unwrap();

        let mut converter = MockConverter::new();
        converter.expect_convert().times(0);

        let w = Worker::new(
            0,
            fx.service.clone(),
            Arc::new(converter),
            fx.processing.clone(),
            WorkerConfig {
                max_messages: 10,
                wait: Duration::ZERO,
                ..WorkerConfig::default()
            },
        );
        let dispositions = w.poll_once().await.unwrap();

        assert_eq!(dispositions, vec![Disposition::Discarded, Disposition::Discarded]);
        let stats = fx.service.stats(&fx.processing).unwrap();
        assert_eq!((stats.visible, stats.in_flight), (0, 0));
    }

    #[tokio::test]
    async fn test_failed_send_leaves_request_for_redelivery() {
        let fx = fixture().await;
        submit(&fx, "in.svg", 1, 0).await;
        fx.service.fail_sends(&fx.callback, 1);

        let mut converter = MockConverter::new();
        converter
            .expect_convert()
            .times(2)
            .returning(|_| Ok("out.pdf".to_string()));
        let w = worker(&fx, converter);

        assert_eq!(w.poll_once().await.unwrap(), vec![Disposition::Redeliver]);
        assert!(responses(&fx).await.is_empty());
        assert_eq!(fx.service.stats(&fx.processing).unwrap().in_flight, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(w.poll_once().await.unwrap(), vec![Disposition::Responded]);
        assert_eq!(responses(&fx).await.len(), 1);
        assert_eq!(
            fx.service.stats(&fx.processing).unwrap(),
            QueueStats {
                visible: 0,
                in_flight: 0,
                accepted: 1,
                coalesced: 0
            }
        );
    }

    #[tokio::test]
    async fn test_abandoned_batch_request_is_dropped() {
        let fx = fixture().await;
        submit(&fx, "in.svg", 1, 0).await;
        fx.service.delete_queue(&fx.callback).await.unwrap();

        let mut converter = MockConverter::new();
        converter
            .expect_convert()
            .returning(|_| Ok("out.pdf".to_string()));

        let dispositions = worker(&fx, converter).poll_once().await.unwrap();

        assert_eq!(dispositions, vec![Disposition::Discarded]);
        assert_eq!(fx.service.stats(&fx.processing).unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fx = fixture().await;
        let converter = MockConverter::new();
        let w = Arc::new(Worker::new(
            0,
            fx.service.clone(),
            Arc::new(converter),
            fx.processing.clone(),
            WorkerConfig::default(),
        ));

        let stop = CancellationToken::new();
        let handle = {
            let w = w.clone();
            let stop = stop.clone();
            tokio::spawn(async move { w.run(stop).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap();
    }
}
