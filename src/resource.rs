use std::time::Duration;

/// Handle to a provisioned topic. Identity is the name.
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    path: String,
}

impl Topic {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Topic {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service-level address of the topic (an SNS ARN, or a `memory://` URL).
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Topic {}

/// Settings a subscription is created with. Never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Default concurrency bound for consumers of this subscription.
    pub max_outstanding: usize,

    /// How long a delivered message stays invisible before the service redelivers it.
    pub ack_deadline: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            max_outstanding: 1,
            ack_deadline: Duration::from_secs(30),
        }
    }
}

/// Handle to a provisioned subscription, bound to exactly one topic.
#[derive(Debug, Clone)]
pub struct Subscription {
    name: String,
    topic: String,
    path: String,
    config: SubscriptionConfig,
}

impl Subscription {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        path: impl Into<String>,
        config: SubscriptionConfig,
    ) -> Self {
        Subscription {
            name: name.into(),
            topic: topic.into(),
            path: path.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the topic this subscription is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Subscription {}
