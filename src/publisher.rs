use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Span, error, info, info_span};

use crate::driver::{Driver, TopicDriver};
use crate::errors::{Result, with_deadline};
use crate::message::OutgoingMessage;

/// Sends messages to one topic.
pub struct Publisher {
    topic: Arc<dyn TopicDriver>,
    send_timeout: Option<Duration>,
    span: Span,
}

impl Publisher {
    /// Opens a publisher for an existing topic.
    ///
    /// Fails with `TopicNotFound` if the topic has not been provisioned.
    pub async fn open(driver: &dyn Driver, topic: &str) -> Result<Self> {
        let handle = driver.open_topic(topic).await?;
        Ok(Self::new(handle))
    }

    pub fn new(topic: Arc<dyn TopicDriver>) -> Self {
        let span = info_span!("publisher", topic = %topic.name());
        Publisher {
            topic,
            send_timeout: None,
            span,
        }
    }

    /// Fails sends that take longer than `timeout` with `DeadlineExceeded`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    /// Publishes `message` and returns the id assigned by the service.
    ///
    /// Dropping the returned future abandons the publish.
    pub async fn send(&self, message: OutgoingMessage) -> Result<String> {
        let body = String::from_utf8_lossy(&message.body).into_owned();
        let attributes = message.attributes.clone();

        let result = with_deadline("publish", self.send_timeout, self.topic.send(message)).await;
        match &result {
            Ok(message_id) => info!(
                parent: &self.span,
                message_id = %message_id,
                msg_body = %body,
                msg_attributes = ?attributes,
                "producer_message_sent"
            ),
            Err(err) => error!(
                parent: &self.span,
                msg_body = %body,
                msg_attributes = ?attributes,
                error = %err,
                "producer_message_send_error"
            ),
        }
        result
    }

    /// Shorthand for sending a payload with attributes.
    pub async fn publish(
        &self,
        payload: impl Into<Vec<u8>>,
        attributes: HashMap<String, String>,
    ) -> Result<String> {
        self.send(OutgoingMessage::new(payload).with_attributes(attributes))
            .await
    }

    /// Releases the topic. Later sends fail with `TopicClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.topic.shutdown().await
    }
}
