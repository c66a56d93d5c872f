//! Seams between the pub/sub layer and the queue service.
//!
//! A [`Driver`] provisions and opens topics and subscriptions. Opened handles
//! implement [`TopicDriver`] and [`SubscriptionDriver`]; every delivery carries
//! an [`Acknowledger`] that settles it with the service.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::message::{Delivery, OutgoingMessage};
use crate::resource::{Subscription, SubscriptionConfig, Topic};

pub mod memory;
pub mod sqs;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Looks a topic up by name. A missing topic is `Ok(None)`, not an error.
    async fn get_topic(&self, name: &str) -> Result<Option<Topic>>;

    /// Creates a topic. May fail with `AlreadyExists`.
    async fn create_topic(&self, name: &str) -> Result<Topic>;

    /// Looks a subscription up by name. A missing subscription is `Ok(None)`.
    async fn get_subscription(&self, name: &str) -> Result<Option<Subscription>>;

    /// Creates a subscription bound to `topic`. May fail with `AlreadyExists`.
    async fn create_subscription(
        &self,
        name: &str,
        topic: &Topic,
        config: &SubscriptionConfig,
    ) -> Result<Subscription>;

    /// Makes sure `subscription` receives what is published to `topic`.
    ///
    /// Must be idempotent. Run against subscriptions that already exist, since a
    /// create interrupted between making the subscription and binding it leaves
    /// it unbound.
    async fn ensure_bound(&self, subscription: &Subscription, topic: &Topic) -> Result<()>;

    async fn open_topic(&self, name: &str) -> Result<Arc<dyn TopicDriver>>;

    async fn open_subscription(&self, name: &str) -> Result<Arc<dyn SubscriptionDriver>>;
}

#[async_trait]
pub trait TopicDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Publishes one message and resolves to the service-issued message id.
    async fn send(&self, message: OutgoingMessage) -> Result<String>;

    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
pub trait SubscriptionDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Waits for the next message.
    ///
    /// Must be cancel-safe: dropping the future may not lose a message that the
    /// service would not redeliver. An error means the subscription will not
    /// deliver any more messages.
    async fn receive(&self) -> Result<Delivery>;

    /// Releases the subscription. Pending and future `receive` calls fail.
    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self) -> Result<()>;
}
