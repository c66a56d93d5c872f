//! AWS driver: topics are SNS topics, subscriptions are SQS queues.
//!
//! Creating a subscription creates an SQS queue whose access policy lets the
//! topic deliver into it, tags the queue with the topic name and subscribes it
//! to the topic with raw message delivery, so SNS message attributes arrive as
//! SQS message attributes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sns::types::MessageAttributeValue as SnsAttributeValue;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message as SqsMessage, QueueAttributeName};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::AwsClients;
use crate::config::Namespace;
use crate::driver::{Acknowledger, Driver, SubscriptionDriver, TopicDriver};
use crate::errors::{PubSubError, ResourceKind, Result};
use crate::message::{Delivery, Message, OutgoingMessage};
use crate::receiver::config::AwsSqsReceiverConfig;
use crate::resource::{Subscription, SubscriptionConfig, Topic};

/// Queue tag recording which topic a subscription queue is bound to.
pub const TOPIC_TAG: &str = "pubsub-topic";

#[derive(Debug, Clone)]
pub struct SqsDriver {
    clients: AwsClients,
    namespace: Namespace,
    receiver_config: AwsSqsReceiverConfig,
}

impl SqsDriver {
    pub fn new(clients: AwsClients, namespace: Namespace) -> Self {
        SqsDriver {
            clients,
            namespace,
            receiver_config: AwsSqsReceiverConfig::default(),
        }
    }

    /// Overrides the long-polling parameters used by opened subscriptions.
    pub fn with_receiver_config(mut self, config: AwsSqsReceiverConfig) -> Self {
        self.receiver_config = config;
        self
    }

    /// Subscribes `queue_arn` to `topic_arn` with raw message delivery.
    ///
    /// SNS returns the existing subscription when the same endpoint and
    /// attributes are subscribed again, so repeating this is safe.
    async fn subscribe_queue(&self, topic_arn: &str, queue_arn: &str) -> Result<()> {
        let input = subscribe_request(topic_arn, queue_arn);
        self.clients
            .sns
            .subscribe()
            .set_topic_arn(input.topic_arn)
            .set_protocol(input.protocol)
            .set_endpoint(input.endpoint)
            .set_attributes(input.attributes)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|err| {
                PubSubError::transport(
                    "subscribe",
                    aws_sdk_sns::error::DisplayErrorContext(err.into_service_error()),
                )
            })?;
        Ok(())
    }

    async fn queue_url(&self, name: &str) -> Result<Option<String>> {
        match self.clients.sqs.get_queue_url().queue_name(name).send().await {
            Ok(output) => Ok(output.queue_url().map(str::to_string)),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_queue_does_not_exist() {
                    Ok(None)
                } else {
                    Err(PubSubError::transport("get_queue_url", DisplayErrorContext(err)))
                }
            }
        }
    }
}

#[async_trait]
impl Driver for SqsDriver {
    async fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        let arn = self.namespace.topic_arn(name);
        match self
            .clients
            .sns
            .get_topic_attributes()
            .topic_arn(&arn)
            .send()
            .await
        {
            Ok(_) => Ok(Some(Topic::new(name, arn))),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found_exception() {
                    Ok(None)
                } else {
                    Err(PubSubError::transport(
                        "get_topic_attributes",
                        aws_sdk_sns::error::DisplayErrorContext(err),
                    ))
                }
            }
        }
    }

    async fn create_topic(&self, name: &str) -> Result<Topic> {
        // CreateTopic returns the existing ARN when the topic is already there.
        let output = self
            .clients
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|err| {
                PubSubError::transport(
                    "create_topic",
                    aws_sdk_sns::error::DisplayErrorContext(err.into_service_error()),
                )
            })?;

        let arn = output
            .topic_arn()
            .map(str::to_string)
            .unwrap_or_else(|| self.namespace.topic_arn(name));
        Ok(Topic::new(name, arn))
    }

    async fn get_subscription(&self, name: &str) -> Result<Option<Subscription>> {
        let Some(url) = self.queue_url(name).await? else {
            return Ok(None);
        };

        let tags = self
            .clients
            .sqs
            .list_queue_tags()
            .queue_url(&url)
            .send()
            .await
            .map_err(|err| {
                PubSubError::transport("list_queue_tags", DisplayErrorContext(err.into_service_error()))
            })?;
        let topic = tags
            .tags()
            .and_then(|tags| tags.get(TOPIC_TAG))
            .cloned()
            .unwrap_or_default();

        let attributes = self
            .clients
            .sqs
            .get_queue_attributes()
            .queue_url(&url)
            .attribute_names(QueueAttributeName::VisibilityTimeout)
            .send()
            .await
            .map_err(|err| {
                PubSubError::transport(
                    "get_queue_attributes",
                    DisplayErrorContext(err.into_service_error()),
                )
            })?;
        let mut config = SubscriptionConfig::default();
        if let Some(secs) = attributes
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::VisibilityTimeout))
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.ack_deadline = Duration::from_secs(secs);
        }

        Ok(Some(Subscription::new(name, topic, url, config)))
    }

    async fn create_subscription(
        &self,
        name: &str,
        topic: &Topic,
        config: &SubscriptionConfig,
    ) -> Result<Subscription> {
        let queue_arn = self.namespace.queue_arn(name);

        let created = self
            .clients
            .sqs
            .create_queue()
            .queue_name(name)
            .attributes(
                QueueAttributeName::Policy,
                delivery_policy(&queue_arn, topic.path()),
            )
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                config.ack_deadline.as_secs().to_string(),
            )
            .tags(TOPIC_TAG, topic.name())
            .send()
            .await;

        let url = match created {
            Ok(output) => output.queue_url().map(str::to_string).ok_or_else(|| {
                PubSubError::transport("create_queue", "response did not include a queue url")
            })?,
            Err(err) => {
                let err = err.into_service_error();
                if err.is_queue_name_exists() {
                    return Err(PubSubError::AlreadyExists {
                        kind: ResourceKind::Subscription,
                        name: name.to_string(),
                    });
                }
                return Err(PubSubError::transport("create_queue", DisplayErrorContext(err)));
            }
        };

        // A failure here leaves the queue unbound; `ensure_bound` repairs it
        // on the next create of the same name.
        self.subscribe_queue(topic.path(), &queue_arn).await?;

        Ok(Subscription::new(name, topic.name(), url, config.clone()))
    }

    async fn ensure_bound(&self, subscription: &Subscription, topic: &Topic) -> Result<()> {
        let queue_arn = self.namespace.queue_arn(subscription.name());
        self.subscribe_queue(topic.path(), &queue_arn).await
    }

    async fn open_topic(&self, name: &str) -> Result<Arc<dyn TopicDriver>> {
        let topic = self
            .get_topic(name)
            .await?
            .ok_or_else(|| PubSubError::TopicNotFound {
                topic: name.to_string(),
            })?;

        Ok(Arc::new(SnsTopic {
            sns: self.clients.sns.clone(),
            name: name.to_string(),
            arn: topic.path().to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_subscription(&self, name: &str) -> Result<Arc<dyn SubscriptionDriver>> {
        let url = self
            .queue_url(name)
            .await?
            .ok_or_else(|| PubSubError::SubscriptionNotFound {
                subscription: name.to_string(),
            })?;

        Ok(Arc::new(SqsSubscription {
            sqs: self.clients.sqs.clone(),
            name: name.to_string(),
            url,
            config: self.receiver_config.clone(),
            buffer: tokio::sync::Mutex::new(VecDeque::new()),
            closed: CancellationToken::new(),
        }))
    }
}

/// Parameters of the SNS subscribe call binding a queue to a topic.
#[derive(Debug, PartialEq, Eq)]
struct SubscribeRequest {
    topic_arn: Option<String>,
    protocol: Option<String>,
    endpoint: Option<String>,
    attributes: Option<HashMap<String, String>>,
}

fn subscribe_request(topic_arn: &str, queue_arn: &str) -> SubscribeRequest {
    SubscribeRequest {
        topic_arn: Some(topic_arn.to_string()),
        protocol: Some("sqs".to_string()),
        endpoint: Some(queue_arn.to_string()),
        attributes: Some(HashMap::from([(
            "RawMessageDelivery".to_string(),
            "true".to_string(),
        )])),
    }
}

/// Queue access policy allowing `topic_arn` to deliver into `queue_arn`.
fn delivery_policy(queue_arn: &str, topic_arn: &str) -> String {
    format!(
        concat!(
            r#"{{"Version":"2012-10-17","Statement":[{{"#,
            r#""Effect":"Allow","Principal":{{"Service":"sns.amazonaws.com"}},"#,
            r#""Action":"sqs:SendMessage","Resource":"{queue}","#,
            r#""Condition":{{"ArnEquals":{{"aws:SourceArn":"{topic}"}}}}}}]}}"#
        ),
        queue = queue_arn,
        topic = topic_arn,
    )
}

struct SnsTopic {
    sns: aws_sdk_sns::Client,
    name: String,
    arn: String,
    closed: AtomicBool,
}

#[async_trait]
impl TopicDriver for SnsTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::TopicClosed {
                topic: self.name.clone(),
            });
        }

        let body = String::from_utf8(message.body)
            .map_err(|_| PubSubError::Publish("message body must be valid UTF-8".to_string()))?;

        let mut attributes = HashMap::with_capacity(message.attributes.len());
        for (key, value) in message.attributes {
            let value = SnsAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|err| PubSubError::Publish(err.to_string()))?;
            attributes.insert(key, value);
        }

        let output = self
            .sns
            .publish()
            .topic_arn(&self.arn)
            .message(body)
            .set_message_attributes((!attributes.is_empty()).then_some(attributes))
            .send()
            .await
            .map_err(|err| {
                PubSubError::Publish(
                    aws_sdk_sns::error::DisplayErrorContext(err.into_service_error()).to_string(),
                )
            })?;

        output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| PubSubError::Publish("response did not include a message id".to_string()))
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct SqsSubscription {
    sqs: aws_sdk_sqs::Client,
    name: String,
    url: String,
    config: AwsSqsReceiverConfig,
    buffer: tokio::sync::Mutex<VecDeque<SqsMessage>>,
    closed: CancellationToken,
}

impl SqsSubscription {
    fn closed_error(&self) -> PubSubError {
        PubSubError::SubscriptionClosed {
            subscription: self.name.clone(),
        }
    }
}

#[async_trait]
impl SubscriptionDriver for SqsSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    // Messages of a batch that is dropped mid-poll stay invisible until their
    // visibility timeout expires, after which SQS redelivers them.
    async fn receive(&self) -> Result<Delivery> {
        let mut buffer = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            guard = self.buffer.lock() => guard,
        };

        loop {
            if self.closed.is_cancelled() {
                return Err(self.closed_error());
            }

            if let Some(raw) = buffer.pop_front() {
                match into_message(&raw) {
                    Some((message, receipt_handle)) => {
                        return Ok(Delivery::new(
                            message,
                            Box::new(SqsAcker {
                                sqs: self.sqs.clone(),
                                url: self.url.clone(),
                                receipt_handle,
                            }),
                        ));
                    }
                    None => {
                        warn!(
                            subscription = %self.name,
                            message_id = raw.message_id().unwrap_or("unknown"),
                            "sqs_message_without_receipt_handle"
                        );
                        continue;
                    }
                }
            }

            let polled = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(self.closed_error()),
                polled = self
                    .sqs
                    .receive_message()
                    .queue_url(&self.url)
                    .max_number_of_messages(self.config.max_number_of_messages)
                    .wait_time_seconds(self.config.wait_time_seconds)
                    .message_attribute_names("All")
                    .send() => polled,
            };

            match polled {
                Ok(output) => buffer.extend(output.messages.unwrap_or_default()),
                Err(err) => {
                    let err = err.into_service_error();
                    if err.is_queue_does_not_exist() {
                        return Err(PubSubError::Receive {
                            subscription: self.name.clone(),
                            message: DisplayErrorContext(err).to_string(),
                        });
                    }

                    warn!(
                        subscription = %self.name,
                        error = %DisplayErrorContext(&err),
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "sqs_receive_error"
                    );
                    tokio::select! {
                        _ = self.closed.cancelled() => return Err(self.closed_error()),
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Converts an SQS message, returning it with its receipt handle.
///
/// Only `String` attributes are carried over.
fn into_message(raw: &SqsMessage) -> Option<(Message, String)> {
    let receipt_handle = raw.receipt_handle()?.to_string();
    let attributes = raw
        .message_attributes()
        .map(|attrs| {
            attrs
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .string_value()
                        .map(|value| (key.clone(), value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let message = Message {
        id: raw.message_id().unwrap_or_default().to_string(),
        body: raw.body().unwrap_or_default().as_bytes().to_vec(),
        attributes,
    };
    Some((message, receipt_handle))
}

struct SqsAcker {
    sqs: aws_sdk_sqs::Client,
    url: String,
    receipt_handle: String,
}

#[async_trait]
impl Acknowledger for SqsAcker {
    async fn ack(&self) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(|err| {
                PubSubError::transport("delete_message", DisplayErrorContext(err.into_service_error()))
            })?;
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        // Zero visibility makes the message immediately receivable again.
        self.sqs
            .change_message_visibility()
            .queue_url(&self.url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|err| {
                PubSubError::transport(
                    "change_message_visibility",
                    DisplayErrorContext(err.into_service_error()),
                )
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::types::MessageAttributeValue;

    #[test]
    fn policy_scopes_delivery_to_the_topic() {
        let policy = delivery_policy(
            "arn:aws:sqs:us-east-1:123456789012:audit",
            "arn:aws:sns:us-east-1:123456789012:events",
        );
        assert!(policy.starts_with(r#"{"Version":"2012-10-17""#));
        assert!(policy.contains(r#""Resource":"arn:aws:sqs:us-east-1:123456789012:audit""#));
        assert!(policy.contains(r#""aws:SourceArn":"arn:aws:sns:us-east-1:123456789012:events""#));
        assert!(policy.ends_with("}]}"));
    }

    #[test]
    fn repeated_subscribe_requests_are_identical() {
        // SNS only treats a repeated subscribe as a no-op when every parameter matches.
        let topic = "arn:aws:sns:us-east-1:123456789012:events";
        let queue = "arn:aws:sqs:us-east-1:123456789012:audit";

        let first = subscribe_request(topic, queue);
        assert_eq!(first, subscribe_request(topic, queue));
        assert_eq!(first.protocol.as_deref(), Some("sqs"));
        assert_eq!(first.endpoint.as_deref(), Some(queue));
        assert_eq!(
            first
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get("RawMessageDelivery"))
                .map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn converts_string_attributes_and_body() {
        let raw = SqsMessage::builder()
            .message_id("m-1")
            .receipt_handle("rh-1")
            .body("message-body")
            .message_attributes(
                "attr1",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("attr1")
                    .build()
                    .unwrap(),
            )
            .build();

        let (message, receipt_handle) = into_message(&raw).unwrap();
        assert_eq!(receipt_handle, "rh-1");
        assert_eq!(message.id, "m-1");
        assert_eq!(message.body, b"message-body");
        assert_eq!(message.attribute("attr1"), Some("attr1"));
    }

    #[test]
    fn message_without_receipt_handle_is_skipped() {
        let raw = SqsMessage::builder().message_id("m-2").body("x").build();
        assert!(into_message(&raw).is_none());
    }
}
