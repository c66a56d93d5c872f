use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Error types for publish/subscribe operations.
///
/// Synchronous operations (opening handles, publishing, provisioning) return
/// these to the caller. Errors raised inside the receive loop are logged by the
/// consumer instead of being returned.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Required configuration is missing or malformed.
    ///
    /// This error typically happens when region or account settings are absent
    /// from the environment, or when logging cannot be initialized.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("topic `{topic}` not found")]
    TopicNotFound { topic: String },

    #[error("subscription `{subscription}` not found")]
    SubscriptionNotFound { subscription: String },

    /// The service reported that the resource is already there.
    ///
    /// The provisioner turns this into a successful lookup of the existing resource.
    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{operation} exceeded its deadline of {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("topic `{topic}` has been shut down")]
    TopicClosed { topic: String },

    /// The subscription can no longer be received from because it was shut down.
    #[error("subscription `{subscription}` has been shut down")]
    SubscriptionClosed { subscription: String },

    /// The service signalled that the subscription will not deliver any more messages.
    #[error("receiving from `{subscription}` failed: {message}")]
    Receive {
        subscription: String,
        message: String,
    },

    #[error("{operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("concurrency bound must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("consumer for `{subscription}` has already been started")]
    ConsumerAlreadyStarted { subscription: String },

    #[error("manager is already running")]
    ManagerRunning,
}

impl PubSubError {
    /// Wraps a service or SDK error raised by `operation`.
    pub fn transport(operation: &'static str, err: impl std::fmt::Display) -> Self {
        PubSubError::Transport {
            operation,
            message: err.to_string(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, PubSubError::AlreadyExists { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, PubSubError::DeadlineExceeded { .. })
    }
}

/// Kind of provisioned resource, used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Topic,
    Subscription,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Topic => write!(f, "topic"),
            ResourceKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// Error returned by a message handler.
///
/// Any handler failure makes the consumer nack the message; the error itself
/// is only logged.
#[derive(Debug, Error)]
pub struct HandlerError(String);

impl HandlerError {
    /// Creates a new `HandlerError` with the provided message.
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HandlerError {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(HandlerError::new(s))
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError::new(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError::new(s)
    }
}

impl From<PubSubError> for HandlerError {
    fn from(err: PubSubError) -> Self {
        HandlerError::new(err.to_string())
    }
}

/// Runs `fut`, failing with [`PubSubError::DeadlineExceeded`] once `timeout` elapses.
///
/// The future is dropped on expiry, so drivers must not leave partial work behind
/// when cancelled.
pub(crate) async fn with_deadline<T, F>(
    operation: &'static str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| PubSubError::DeadlineExceeded { operation, timeout })?,
        None => fut.await,
    }
}
