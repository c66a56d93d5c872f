//! In-process broker with topic fan-out, ack/nack and bounded redelivery.
//!
//! Mirrors the behavior of the hosted service closely enough to exercise the
//! consumer engine without network access: every subscription bound to a topic
//! receives its own copy of each published message, nacked messages are
//! redelivered until `max_delivery_attempts` is reached and are then moved to
//! a dead-letter list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{Acknowledger, Driver, SubscriptionDriver, TopicDriver};
use crate::errors::{PubSubError, ResourceKind, Result};
use crate::message::{Delivery, Message, OutgoingMessage};
use crate::resource::{Subscription, SubscriptionConfig, Topic};

/// Per-subscription delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Messages fanned out to this subscription by a publish.
    pub published: u64,
    /// Deliveries handed to a receiver, redeliveries included.
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

impl DeliveryStats {
    /// Deliveries that have been received but not yet acked or nacked.
    pub fn outstanding(&self) -> u64 {
        self.delivered - self.acked - self.nacked
    }
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    broker: Arc<Mutex<BrokerState>>,
    latency: Option<Duration>,
    max_delivery_attempts: Option<u32>,
    interrupt_next_bind: Arc<AtomicBool>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicEntry>,
    subscriptions: HashMap<String, Arc<SubscriptionQueue>>,
    next_message_id: u64,
}

struct TopicEntry {
    topic: Topic,
    subscriptions: Vec<String>,
}

struct Pending {
    message: Message,
    attempt: u32,
}

struct SubscriptionQueue {
    subscription: Subscription,
    sender: mpsc::UnboundedSender<Pending>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Pending>>,
    stats: Mutex<DeliveryStats>,
    dead_letters: Mutex<Vec<Message>>,
    max_delivery_attempts: Option<u32>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every provisioning and publish call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Dead-letters a message once it has been nacked `attempts` times.
    ///
    /// Applies to subscriptions created afterwards. Without a limit nacked
    /// messages are redelivered forever.
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts.max(1));
        self
    }

    /// Makes the next `create_subscription` fail after the subscription exists
    /// but before it is bound to its topic, like a dropped connection between
    /// creating an SQS queue and subscribing it to SNS.
    pub fn interrupt_next_bind(&self) {
        self.interrupt_next_bind.store(true, Ordering::Release);
    }

    /// True when publishing to `topic` reaches `subscription`.
    pub fn is_bound(&self, subscription: &str, topic: &str) -> bool {
        lock(&self.broker)
            .topics
            .get(topic)
            .is_some_and(|entry| entry.subscriptions.iter().any(|name| name == subscription))
    }

    pub fn stats(&self, subscription: &str) -> Option<DeliveryStats> {
        self.queue(subscription).map(|queue| *lock(&queue.stats))
    }

    pub fn dead_letters(&self, subscription: &str) -> Vec<Message> {
        self.queue(subscription)
            .map(|queue| lock(&queue.dead_letters).clone())
            .unwrap_or_default()
    }

    fn queue(&self, subscription: &str) -> Option<Arc<SubscriptionQueue>> {
        lock(&self.broker).subscriptions.get(subscription).cloned()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        self.simulate_latency().await;
        Ok(lock(&self.broker)
            .topics
            .get(name)
            .map(|entry| entry.topic.clone()))
    }

    async fn create_topic(&self, name: &str) -> Result<Topic> {
        self.simulate_latency().await;
        let mut state = lock(&self.broker);
        if state.topics.contains_key(name) {
            return Err(PubSubError::AlreadyExists {
                kind: ResourceKind::Topic,
                name: name.to_string(),
            });
        }

        let topic = Topic::new(name, format!("memory://topics/{name}"));
        state.topics.insert(
            name.to_string(),
            TopicEntry {
                topic: topic.clone(),
                subscriptions: Vec::new(),
            },
        );
        Ok(topic)
    }

    async fn get_subscription(&self, name: &str) -> Result<Option<Subscription>> {
        self.simulate_latency().await;
        Ok(self.queue(name).map(|queue| queue.subscription.clone()))
    }

    async fn create_subscription(
        &self,
        name: &str,
        topic: &Topic,
        config: &SubscriptionConfig,
    ) -> Result<Subscription> {
        self.simulate_latency().await;
        let mut state = lock(&self.broker);
        if state.subscriptions.contains_key(name) {
            return Err(PubSubError::AlreadyExists {
                kind: ResourceKind::Subscription,
                name: name.to_string(),
            });
        }

        if !state.topics.contains_key(topic.name()) {
            return Err(PubSubError::TopicNotFound {
                topic: topic.name().to_string(),
            });
        }

        let subscription = Subscription::new(
            name,
            topic.name(),
            format!("memory://subscriptions/{name}"),
            config.clone(),
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscriptions.insert(
            name.to_string(),
            Arc::new(SubscriptionQueue {
                subscription: subscription.clone(),
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                stats: Mutex::new(DeliveryStats::default()),
                dead_letters: Mutex::new(Vec::new()),
                max_delivery_attempts: self.max_delivery_attempts,
            }),
        );

        if self.interrupt_next_bind.swap(false, Ordering::AcqRel) {
            return Err(PubSubError::transport("subscribe", "connection reset"));
        }
        bind(&mut state, name, topic.name())?;
        Ok(subscription)
    }

    async fn ensure_bound(&self, subscription: &Subscription, topic: &Topic) -> Result<()> {
        self.simulate_latency().await;
        let mut state = lock(&self.broker);
        if !state.subscriptions.contains_key(subscription.name()) {
            return Err(PubSubError::SubscriptionNotFound {
                subscription: subscription.name().to_string(),
            });
        }
        bind(&mut state, subscription.name(), topic.name())
    }

    async fn open_topic(&self, name: &str) -> Result<Arc<dyn TopicDriver>> {
        if !lock(&self.broker).topics.contains_key(name) {
            return Err(PubSubError::TopicNotFound {
                topic: name.to_string(),
            });
        }

        Ok(Arc::new(MemoryTopic {
            name: name.to_string(),
            driver: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_subscription(&self, name: &str) -> Result<Arc<dyn SubscriptionDriver>> {
        let queue = self
            .queue(name)
            .ok_or_else(|| PubSubError::SubscriptionNotFound {
                subscription: name.to_string(),
            })?;

        Ok(Arc::new(MemorySubscription {
            queue,
            closed: CancellationToken::new(),
        }))
    }
}

fn bind(state: &mut BrokerState, subscription: &str, topic: &str) -> Result<()> {
    let Some(entry) = state.topics.get_mut(topic) else {
        return Err(PubSubError::TopicNotFound {
            topic: topic.to_string(),
        });
    };
    if !entry.subscriptions.iter().any(|name| name == subscription) {
        entry.subscriptions.push(subscription.to_string());
    }
    Ok(())
}

struct MemoryTopic {
    name: String,
    driver: MemoryDriver,
    closed: AtomicBool,
}

#[async_trait]
impl TopicDriver for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::TopicClosed {
                topic: self.name.clone(),
            });
        }
        self.driver.simulate_latency().await;

        let mut state = lock(&self.driver.broker);
        state.next_message_id += 1;
        let id = state.next_message_id.to_string();

        let Some(entry) = state.topics.get(&self.name) else {
            return Err(PubSubError::TopicNotFound {
                topic: self.name.clone(),
            });
        };

        let delivered = Message {
            id: id.clone(),
            body: message.body,
            attributes: message.attributes,
        };
        for subscription in &entry.subscriptions {
            if let Some(queue) = state.subscriptions.get(subscription) {
                queue.enqueue(delivered.clone());
            }
        }

        Ok(id)
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl SubscriptionQueue {
    fn enqueue(&self, message: Message) {
        lock(&self.stats).published += 1;
        // The receiver lives as long as the queue, so sending cannot fail.
        let _ = self.sender.send(Pending {
            message,
            attempt: 0,
        });
    }

    fn closed_error(&self) -> PubSubError {
        PubSubError::SubscriptionClosed {
            subscription: self.subscription.name().to_string(),
        }
    }
}

struct MemorySubscription {
    queue: Arc<SubscriptionQueue>,
    closed: CancellationToken,
}

#[async_trait]
impl SubscriptionDriver for MemorySubscription {
    fn name(&self) -> &str {
        self.queue.subscription.name()
    }

    async fn receive(&self) -> Result<Delivery> {
        let mut receiver = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.queue.closed_error()),
            guard = self.queue.receiver.lock() => guard,
        };

        let pending = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.queue.closed_error()),
            pending = receiver.recv() => pending,
        };
        let Some(pending) = pending else {
            return Err(self.queue.closed_error());
        };

        lock(&self.queue.stats).delivered += 1;
        Ok(Delivery::new(
            pending.message.clone(),
            Box::new(MemoryAcker {
                queue: self.queue.clone(),
                message: pending.message,
                attempt: pending.attempt,
            }),
        ))
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct MemoryAcker {
    queue: Arc<SubscriptionQueue>,
    message: Message,
    attempt: u32,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        lock(&self.queue.stats).acked += 1;
        Ok(())
    }

    async fn nack(&self) -> Result<()> {
        let attempts = self.attempt + 1;
        let mut stats = lock(&self.queue.stats);
        stats.nacked += 1;

        if self
            .queue
            .max_delivery_attempts
            .is_some_and(|max| attempts >= max)
        {
            stats.dead_lettered += 1;
            lock(&self.queue.dead_letters).push(self.message.clone());
            debug!(
                subscription = %self.queue.subscription.name(),
                message_id = %self.message.id,
                attempts,
                "memory_message_dead_lettered"
            );
            return Ok(());
        }

        stats.redelivered += 1;
        let _ = self.queue.sender.send(Pending {
            message: self.message.clone(),
            attempt: attempts,
        });
        Ok(())
    }
}
