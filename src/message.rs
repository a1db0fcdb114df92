//! Wire model exchanged between the dispatcher and the workers.

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result marker for a successful conversion.
pub const RESULT_OK: &str = "OK";

/// Prefix of the result marker for a failed conversion.
pub const RESULT_ERROR_PREFIX: &str = "ERROR";

/// Longest queue name accepted by either transport.
pub const MAX_QUEUE_NAME_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
        }
    }
}

/// Rejects object refs a worker could never resolve.
pub fn validate_object_ref(object_ref: &str) -> Result<()> {
    if object_ref.is_empty() {
        return Err(DispatchError::MalformedMessage(
            "objectRef must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Checks a queue name against the rules shared by all transports.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return Err(DispatchError::InvalidQueueName(format!(
            "{name:?} must be 1-{MAX_QUEUE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DispatchError::InvalidQueueName(format!(
            "{name:?} may only contain ASCII alphanumerics, '-' and '_'"
        )));
    }
    Ok(())
}

/// Address of a queue, in the form `<scheme>://<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueRef(String);

impl QueueRef {
    pub const SCHEME: &'static str = "queue";

    /// Builds the ref a transport hands out for `name` in `namespace`.
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        validate_queue_name(name)?;
        Self::parse(&format!("{}://{}/{}", Self::SCHEME, namespace, name))
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| {
                DispatchError::MalformedMessage(format!("queue ref {uri:?} is not a URI"))
            })?;

        let scheme_ok = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !scheme_ok {
            return Err(DispatchError::MalformedMessage(format!(
                "queue ref {uri:?} has an invalid scheme"
            )));
        }

        let name = rest.rsplit('/').next().unwrap_or_default();
        if rest.is_empty() || validate_queue_name(name).is_err() {
            return Err(DispatchError::MalformedMessage(format!(
                "queue ref {uri:?} does not name a queue"
            )));
        }

        Ok(Self(uri.to_string()))
    }

    /// The queue name, i.e. the last path segment.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Everything between the scheme separator and the name.
    pub fn namespace(&self) -> &str {
        let rest = self.0.split_once("://").map(|(_, r)| r).unwrap_or_default();
        rest.rsplit_once('/').map(|(ns, _)| ns).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QueueRef {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for QueueRef {
    type Error = DispatchError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<QueueRef> for String {
    fn from(value: QueueRef) -> Self {
        value.0
    }
}

/// A request or response travelling through the queues.
///
/// Immutable once sent: a response is a new value built from the request
/// it answers, carrying the same correlation fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub kind: MessageKind,
    pub object_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub callback_ref: QueueRef,
    pub batch_size: u32,
    pub sequence: u32,
}

impl Message {
    /// Builds a validated request for item `sequence` of a batch.
    pub fn request(
        object_ref: impl Into<String>,
        callback_ref: QueueRef,
        batch_size: u32,
        sequence: u32,
    ) -> Result<Self> {
        let message = Self {
            kind: MessageKind::Request,
            object_ref: object_ref.into(),
            result: None,
            callback_ref,
            batch_size,
            sequence,
        };
        message.validate()?;
        Ok(message)
    }

    /// Answer for a successful conversion, pointing at the produced artifact.
    pub fn reply_ok(&self, artifact_ref: impl Into<String>) -> Self {
        self.reply(artifact_ref.into(), RESULT_OK.to_string())
    }

    /// Answer for a failed conversion; echoes the source object ref.
    pub fn reply_failed(&self, reason: &str) -> Self {
        self.reply(
            self.object_ref.clone(),
            format!("{RESULT_ERROR_PREFIX}: {reason}"),
        )
    }

    fn reply(&self, object_ref: String, result: String) -> Self {
        Self {
            kind: MessageKind::Response,
            object_ref,
            result: Some(result),
            callback_ref: self.callback_ref.clone(),
            batch_size: self.batch_size,
            sequence: self.sequence,
        }
    }

    /// Structural checks applied on construction and after every parse.
    pub fn validate(&self) -> Result<()> {
        validate_object_ref(&self.object_ref)?;
        if self.batch_size == 0 {
            return Err(DispatchError::MalformedMessage(
                "batchSize must be at least 1".to_string(),
            ));
        }
        if self.sequence >= self.batch_size {
            return Err(DispatchError::MalformedMessage(format!(
                "sequence {} is outside batch of {}",
                self.sequence, self.batch_size
            )));
        }
        match (self.kind, &self.result) {
            (MessageKind::Request, Some(_)) => Err(DispatchError::MalformedMessage(
                "request must not carry a result".to_string(),
            )),
            (MessageKind::Response, None) => Err(DispatchError::MalformedMessage(
                "response must carry a result".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Decodes and validates a message body.
    pub fn parse(body: &str) -> Result<Self> {
        let message: Message = serde_json::from_str(body)
            .map_err(|e| DispatchError::MalformedMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    /// Like [`Message::parse`] but also insists on the expected kind.
    pub fn parse_kind(body: &str, kind: MessageKind) -> Result<Self> {
        let message = Self::parse(body)?;
        if message.kind != kind {
            return Err(DispatchError::MalformedMessage(format!(
                "expected {kind}, got {}",
                message.kind
            )));
        }
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DispatchError::MalformedMessage(e.to_string()))
    }

    /// Dedup and group id for this item: `<callback queue name>-<sequence>`.
    ///
    /// The callback queue name embeds the batch token, so the key is unique
    /// per logical item and stable across retried sends.
    pub fn dedup_key(&self) -> String {
        format!("{}-{}", self.callback_ref.name(), self.sequence)
    }

    pub fn is_success(&self) -> bool {
        self.result.as_deref() == Some(RESULT_OK)
    }

    /// The produced artifact, or the failure recorded by the worker.
    pub fn artifact(&self) -> Result<&str> {
        if self.is_success() {
            Ok(&self.object_ref)
        } else {
            Err(DispatchError::Conversion {
                object_ref: self.object_ref.clone(),
                reason: self.result.clone().unwrap_or_default(),
            })
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} object={} result={} callback={}",
            self.kind,
            self.sequence,
            self.batch_size,
            self.object_ref,
            self.result.as_deref().unwrap_or("-"),
            self.callback_ref
        )
    }
}
