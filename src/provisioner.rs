//! Idempotent creation of topics and subscriptions.
//!
//! Creating something that already exists is not an error here: the existing
//! resource is looked up and returned instead. Subscriptions are never
//! reconfigured, so a second create with different settings returns the
//! original subscription unchanged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Span, debug, error, info, info_span, warn};

use crate::driver::Driver;
use crate::errors::{PubSubError, Result, with_deadline};
use crate::resource::{Subscription, SubscriptionConfig, Topic};

pub struct Provisioner {
    driver: Arc<dyn Driver>,
    timeout: Option<Duration>,
    span: Span,
}

impl Provisioner {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Provisioner {
            driver,
            timeout: None,
            span: info_span!("provisioner"),
        }
    }

    /// Fails calls that take longer than `timeout` with `DeadlineExceeded`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn topic_exists(&self, name: &str) -> Result<bool> {
        let topic = with_deadline("get_topic", self.timeout, self.driver.get_topic(name)).await?;
        Ok(topic.is_some())
    }

    pub async fn subscription_exists(&self, name: &str) -> Result<bool> {
        let subscription =
            with_deadline("get_subscription", self.timeout, self.driver.get_subscription(name))
                .await?;
        Ok(subscription.is_some())
    }

    /// Creates `name`, or returns the existing topic of that name.
    pub async fn create_or_get_topic(&self, name: &str) -> Result<Topic> {
        with_deadline("create_topic", self.timeout, self.create_topic(name)).await
    }

    /// Creates subscription `name` bound to `topic`, or returns the existing one.
    ///
    /// Fails with `TopicNotFound` when `topic` does not exist.
    pub async fn create_or_get_subscription(
        &self,
        name: &str,
        topic: &str,
        config: SubscriptionConfig,
    ) -> Result<Subscription> {
        if config.max_outstanding == 0 {
            return Err(PubSubError::InvalidConcurrency(0));
        }

        with_deadline(
            "create_subscription",
            self.timeout,
            self.create_subscription(name, topic, &config),
        )
        .await
    }

    async fn create_topic(&self, name: &str) -> Result<Topic> {
        match self.driver.create_topic(name).await {
            Ok(topic) => {
                info!(parent: &self.span, topic_id = %name, "topic_created");
                Ok(topic)
            }
            Err(err) if err.is_already_exists() => {
                debug!(parent: &self.span, topic_id = %name, "topic_already_exists");
                self.driver
                    .get_topic(name)
                    .await?
                    .ok_or_else(|| PubSubError::TopicNotFound {
                        topic: name.to_string(),
                    })
            }
            Err(err) => {
                error!(parent: &self.span, topic_id = %name, error = %err, "topic_create_error");
                Err(err)
            }
        }
    }

    async fn create_subscription(
        &self,
        name: &str,
        topic_name: &str,
        config: &SubscriptionConfig,
    ) -> Result<Subscription> {
        let topic = self
            .driver
            .get_topic(topic_name)
            .await?
            .ok_or_else(|| PubSubError::TopicNotFound {
                topic: topic_name.to_string(),
            })?;

        if let Some(existing) = self.driver.get_subscription(name).await? {
            debug!(parent: &self.span, subscription_id = %name, "subscription_already_exists");
            return self.rebind(existing, &topic).await;
        }

        match self.driver.create_subscription(name, &topic, config).await {
            Ok(subscription) => {
                info!(
                    parent: &self.span,
                    subscription_id = %name,
                    topic_id = %topic_name,
                    "subscription_created"
                );
                Ok(subscription)
            }
            Err(err) if err.is_already_exists() => {
                let existing = self.driver.get_subscription(name).await?.ok_or_else(|| {
                    PubSubError::SubscriptionNotFound {
                        subscription: name.to_string(),
                    }
                })?;
                self.rebind(existing, &topic).await
            }
            Err(err) => {
                error!(
                    parent: &self.span,
                    subscription_id = %name,
                    error = %err,
                    "subscription_create_error"
                );
                Err(err)
            }
        }
    }

    /// Repairs the topic binding of an existing subscription.
    ///
    /// A subscription bound to a different topic is returned as is.
    async fn rebind(&self, existing: Subscription, topic: &Topic) -> Result<Subscription> {
        if existing.topic() != topic.name() {
            warn!(
                parent: &self.span,
                subscription_id = %existing.name(),
                topic_id = %topic.name(),
                bound_topic_id = %existing.topic(),
                "subscription_bound_to_other_topic"
            );
            return Ok(existing);
        }

        self.driver.ensure_bound(&existing, topic).await?;
        Ok(existing)
    }
}
