//! Queue-mediated conversion dispatch.
//!
//! A producer submits a batch of object references onto a shared processing
//! queue; workers convert each object and post the answer onto a callback
//! queue owned by the batch; the producer drains that queue until every
//! item is answered or the batch times out.
//!
//! ## Module Overview
//!
//! - `message`: wire model and validation
//! - `queue`: queue transport capability, with Redis and in-memory transports
//! - `converter`: conversion capability and the SVG to PDF converter
//! - `dispatcher`: producer role (`run_batch`)
//! - `worker`: consumer role (`run`)
//! - `config`: environment settings
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use convert_dispatch::{
//!     converter::SvgToPdfConverter,
//!     dispatcher::{Dispatcher, DispatcherConfig},
//!     queue::{InMemoryQueueService, QueueService},
//!     worker::{Worker, WorkerConfig},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let queues = Arc::new(InMemoryQueueService::new("memory"));
//!     let requests = queues.create_queue("convert-requests").await.unwrap();
//!
//!     let worker = Worker::new(
//!         0,
//!         queues.clone(),
//!         Arc::new(SvgToPdfConverter::new()),
//!         requests.clone(),
//!         WorkerConfig::default(),
//!     );
//!     let stop = CancellationToken::new();
//!     let running = tokio::spawn({
//!         let stop = stop.clone();
//!         async move { worker.run(stop).await }
//!     });
//!
//!     let dispatcher = Dispatcher::new(queues, requests, DispatcherConfig::default());
//!     let responses = dispatcher
//!         .run_batch(&["/tmp/a.svg", "/tmp/b.svg"], Duration::from_secs(30))
//!         .await
//!         .unwrap();
//!     assert_eq!(responses.len(), 2);
//!
//!     stop.cancel();
//!     running.await.unwrap();
//! }
//! ```

pub mod config;
pub mod converter;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod queue;
pub mod telemetry;
pub mod worker;

pub use error::{DispatchError, Result};
pub use message::{Message, MessageKind, QueueRef};
