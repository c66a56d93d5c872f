mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::init_logs;
use rs_sqs_pubsub::driver::Driver;
use rs_sqs_pubsub::driver::memory::MemoryDriver;
use rs_sqs_pubsub::errors::PubSubError;
use rs_sqs_pubsub::message::OutgoingMessage;
use rs_sqs_pubsub::provisioner::Provisioner;
use rs_sqs_pubsub::publisher::Publisher;
use rs_sqs_pubsub::resource::SubscriptionConfig;

fn provisioner(driver: &MemoryDriver) -> Provisioner {
    init_logs();
    Provisioner::new(Arc::new(driver.clone()))
}

#[tokio::test]
async fn topic_creation_is_idempotent() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);

    assert!(!provisioner.topic_exists("orders").await.unwrap());
    let first = provisioner.create_or_get_topic("orders").await.unwrap();
    let second = provisioner.create_or_get_topic("orders").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.path(), second.path());
    assert!(provisioner.topic_exists("orders").await.unwrap());
}

#[tokio::test]
async fn subscription_creation_is_idempotent_and_never_reconfigures() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);
    provisioner.create_or_get_topic("orders").await.unwrap();

    let original = SubscriptionConfig {
        max_outstanding: 4,
        ack_deadline: Duration::from_secs(45),
    };
    let first = provisioner
        .create_or_get_subscription("orders-audit", "orders", original.clone())
        .await
        .unwrap();
    let second = provisioner
        .create_or_get_subscription(
            "orders-audit",
            "orders",
            SubscriptionConfig {
                max_outstanding: 8,
                ..SubscriptionConfig::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.topic(), "orders");
    assert_eq!(second.config(), &original);
    assert!(provisioner.subscription_exists("orders-audit").await.unwrap());
    assert!(!provisioner.subscription_exists("orders-billing").await.unwrap());
}

#[tokio::test]
async fn subscription_requires_an_existing_topic() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);

    let err = provisioner
        .create_or_get_subscription("orphan", "nowhere", SubscriptionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::TopicNotFound { ref topic } if topic == "nowhere"));
    assert!(!provisioner.subscription_exists("orphan").await.unwrap());
}

#[tokio::test]
async fn zero_bound_subscription_is_rejected() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);
    provisioner.create_or_get_topic("orders").await.unwrap();

    let err = provisioner
        .create_or_get_subscription(
            "orders-audit",
            "orders",
            SubscriptionConfig {
                max_outstanding: 0,
                ..SubscriptionConfig::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidConcurrency(0)));
}

#[tokio::test]
async fn slow_provisioning_hits_the_deadline() {
    let driver = MemoryDriver::new().with_latency(Duration::from_millis(200));
    let provisioner = provisioner(&driver).with_timeout(Duration::from_millis(20));

    let err = provisioner.create_or_get_topic("orders").await.unwrap_err();
    assert!(err.is_deadline_exceeded());
}

#[tokio::test]
async fn publisher_returns_the_service_id() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);
    provisioner.create_or_get_topic("orders").await.unwrap();
    provisioner
        .create_or_get_subscription("orders-audit", "orders", SubscriptionConfig::default())
        .await
        .unwrap();

    let publisher = Publisher::open(&driver, "orders").await.unwrap();
    assert_eq!(publisher.topic(), "orders");

    let mut attributes = HashMap::new();
    attributes.insert("kind".to_string(), "created".to_string());
    let id = publisher.publish("order #1", attributes).await.unwrap();

    let subscription = driver.open_subscription("orders-audit").await.unwrap();
    let delivery = subscription.receive().await.unwrap();
    assert_eq!(delivery.message().id, id);
    assert_eq!(delivery.message().body_lossy(), "order #1");
    assert_eq!(delivery.message().attribute("kind"), Some("created"));
    delivery.ack().await.unwrap();
    assert_eq!(driver.stats("orders-audit").unwrap().published, 1);
}

#[tokio::test]
async fn publisher_requires_an_existing_topic() {
    let driver = MemoryDriver::new();
    init_logs();

    let err = Publisher::open(&driver, "missing").await.err().unwrap();
    assert!(matches!(err, PubSubError::TopicNotFound { .. }));
}

#[tokio::test]
async fn slow_publish_hits_the_deadline() {
    let driver = MemoryDriver::new().with_latency(Duration::from_millis(200));
    driver.create_topic("orders").await.unwrap();

    let publisher = Publisher::open(&driver, "orders")
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(20));
    let err = publisher
        .send(OutgoingMessage::new("too slow"))
        .await
        .unwrap_err();
    assert!(err.is_deadline_exceeded());
}

#[tokio::test]
async fn publishing_after_shutdown_fails() {
    let driver = MemoryDriver::new();
    driver.create_topic("orders").await.unwrap();

    let publisher = Publisher::open(&driver, "orders").await.unwrap();
    publisher.shutdown().await.unwrap();

    let err = publisher
        .send(OutgoingMessage::new("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::TopicClosed { .. }));
}

#[tokio::test]
async fn retry_binds_a_subscription_left_unbound_by_a_failed_create() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);
    provisioner.create_or_get_topic("orders").await.unwrap();

    driver.interrupt_next_bind();
    let err = provisioner
        .create_or_get_subscription("orders-audit", "orders", SubscriptionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Transport { .. }));
    assert!(provisioner.subscription_exists("orders-audit").await.unwrap());
    assert!(!driver.is_bound("orders-audit", "orders"));

    let subscription = provisioner
        .create_or_get_subscription("orders-audit", "orders", SubscriptionConfig::default())
        .await
        .unwrap();
    assert_eq!(subscription.topic(), "orders");
    assert!(driver.is_bound("orders-audit", "orders"));

    Publisher::open(&driver, "orders")
        .await
        .unwrap()
        .send(OutgoingMessage::new("reaches the repaired subscription"))
        .await
        .unwrap();
    assert_eq!(driver.stats("orders-audit").unwrap().published, 1);
}

#[tokio::test]
async fn existing_subscription_keeps_its_original_topic() {
    let driver = MemoryDriver::new();
    let provisioner = provisioner(&driver);
    provisioner.create_or_get_topic("orders").await.unwrap();
    provisioner.create_or_get_topic("refunds").await.unwrap();
    provisioner
        .create_or_get_subscription("audit", "orders", SubscriptionConfig::default())
        .await
        .unwrap();

    let subscription = provisioner
        .create_or_get_subscription("audit", "refunds", SubscriptionConfig::default())
        .await
        .unwrap();
    assert_eq!(subscription.topic(), "orders");
    assert!(driver.is_bound("audit", "orders"));
    assert!(!driver.is_bound("audit", "refunds"));
}
