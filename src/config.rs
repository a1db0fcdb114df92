//! Environment-driven settings shared by the worker service and the submit CLI.
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `QUEUE_NAMESPACE`: key prefix / queue ref namespace (default: convert)
//! - `PROCESSING_QUEUE`: shared request queue name (default: convert-requests)
//! - `WORKER_CONCURRENCY`: number of worker loops (default: 4)
//! - `RECEIVE_BATCH_SIZE`: requests taken per receive (default: 1)
//! - `RECEIVE_WAIT_SECONDS`: worker long-poll wait (default: 20)
//! - `VISIBILITY_TIMEOUT_SECONDS`: redelivery window (default: 30)
//! - `DEDUP_WINDOW_SECONDS`: dedup interval (default: 300)
//! - `CONVERT_OUTPUT_DIR`: where PDFs are written (default: next to the source)
//! - `BATCH_TIMEOUT_SECONDS`: overall batch deadline (default: 300)
//! - `CALLBACK_WAIT_SECONDS`: dispatcher long-poll wait (default: 1)

use crate::dispatcher::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::worker::WorkerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub redis_url: String,
    pub queue_namespace: String,
    pub processing_queue: String,
    pub worker_concurrency: usize,
    pub receive_batch_size: u32,
    pub receive_wait: Duration,
    pub visibility_timeout: Duration,
    pub dedup_window: Duration,
    pub output_dir: Option<PathBuf>,
    pub batch_timeout: Duration,
    pub callback_wait: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| parse(&lookup, key, default).map(Duration::from_secs);

        let settings = Self {
            redis_url: text("REDIS_URL", "redis://127.0.0.1/"),
            queue_namespace: text("QUEUE_NAMESPACE", "convert"),
            processing_queue: text("PROCESSING_QUEUE", "convert-requests"),
            worker_concurrency: parse(&lookup, "WORKER_CONCURRENCY", 4)?,
            receive_batch_size: parse(&lookup, "RECEIVE_BATCH_SIZE", 1)?,
            receive_wait: secs("RECEIVE_WAIT_SECONDS", 20)?,
            visibility_timeout: secs("VISIBILITY_TIMEOUT_SECONDS", 30)?,
            dedup_window: secs("DEDUP_WINDOW_SECONDS", 300)?,
            output_dir: lookup("CONVERT_OUTPUT_DIR").map(PathBuf::from),
            batch_timeout: secs("BATCH_TIMEOUT_SECONDS", 300)?,
            callback_wait: secs("CALLBACK_WAIT_SECONDS", 1)?,
        };

        if settings.worker_concurrency == 0 {
            return Err(DispatchError::Config(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if settings.receive_batch_size == 0 {
            return Err(DispatchError::Config(
                "RECEIVE_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_messages: self.receive_batch_size,
            wait: self.receive_wait,
            ..WorkerConfig::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_wait: self.callback_wait,
            ..DispatcherConfig::default()
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DispatchError::Config(format!("{key}={raw:?} is not a valid value"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();

        assert_eq!(settings.redis_url, "redis://127.0.0.1/");
        assert_eq!(settings.processing_queue, "convert-requests");
        assert_eq!(settings.worker_concurrency, 4);
        assert_eq!(settings.receive_wait, Duration::from_secs(20));
        assert_eq!(settings.output_dir, None);
        assert_eq!(settings.dispatcher_config().poll_wait, Duration::from_secs(1));
        assert_eq!(settings.worker_config().max_messages, 1);
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("WORKER_CONCURRENCY", "8"),
            ("RECEIVE_BATCH_SIZE", " 5 "),
            ("BATCH_TIMEOUT_SECONDS", "30"),
            ("CONVERT_OUTPUT_DIR", "/tmp/pdf"),
        ]))
        .unwrap();

        assert_eq!(settings.worker_concurrency, 8);
        assert_eq!(settings.worker_config().max_messages, 5);
        assert_eq!(settings.batch_timeout, Duration::from_secs(30));
        assert_eq!(settings.output_dir, Some(PathBuf::from("/tmp/pdf")));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Settings::from_lookup(lookup(&[("RECEIVE_WAIT_SECONDS", "soon")])),
            Err(DispatchError::Config(_))
        ));
        assert!(Settings::from_lookup(lookup(&[("WORKER_CONCURRENCY", "0")])).is_err());
    }
}
