mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{Gauge, broker_with, gauge_handler, wait_for};
use rs_sqs_pubsub::driver::memory::MemoryDriver;
use rs_sqs_pubsub::errors::{HandlerError, PubSubError};
use rs_sqs_pubsub::message::{Message, OutgoingMessage};
use rs_sqs_pubsub::provisioner::Provisioner;
use rs_sqs_pubsub::publisher::Publisher;
use rs_sqs_pubsub::receiver::{HandlerFn, Manager, MessageHandler, StopReason};
use rs_sqs_pubsub::resource::SubscriptionConfig;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Counting(Arc<AtomicUsize>);

#[async_trait]
impl MessageHandler for Counting {
    async fn handle(&self, _cancel: CancellationToken, _message: Message) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn counting_handler(counter: Arc<AtomicUsize>) -> Counting {
    Counting(counter)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_subscription_of_a_topic_receives_the_message() {
    let driver = broker_with(MemoryDriver::new(), "T", &["audit", "billing"]).await;

    let audit = Arc::new(AtomicUsize::new(0));
    let billing = Arc::new(AtomicUsize::new(0));

    let manager = Arc::new(Manager::new(Arc::new(driver.clone())));
    manager.add_consumer("audit", counting_handler(audit.clone()), 2).unwrap();
    manager.add_consumer("billing", counting_handler(billing.clone()), 1).unwrap();
    assert_eq!(manager.consumer_count(), 2);

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    Publisher::open(&driver, "T")
        .await
        .unwrap()
        .send(OutgoingMessage::new("fan-out"))
        .await
        .unwrap();

    wait_for(Duration::from_secs(5), "both handlers", || {
        audit.load(Ordering::SeqCst) == 1 && billing.load(Ordering::SeqCst) == 1
    })
    .await;

    manager.stop();
    manager.stop();
    assert!(manager.is_stopped());

    timeout(Duration::from_secs(5), runner)
        .await
        .expect("run did not return after stop")
        .unwrap()
        .unwrap();

    let reasons = manager.wait().await;
    assert_eq!(reasons, vec![StopReason::Cancelled, StopReason::Cancelled]);
    assert_eq!(driver.stats("audit").unwrap().acked, 1);
    assert_eq!(driver.stats("billing").unwrap().acked, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_is_closed_once_running() {
    let driver = broker_with(MemoryDriver::new(), "events", &["late"]).await;
    let manager = Arc::new(Manager::new(Arc::new(driver.clone())));

    let err = manager
        .add_consumer("late", HandlerFn::new(|_cancel, _message: Message| async move { Ok(()) }), 0)
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidConcurrency(0)));

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };
    wait_for(Duration::from_secs(5), "manager running", || manager.is_running()).await;

    let err = manager
        .add_consumer("late", HandlerFn::new(|_cancel, _message: Message| async move { Ok(()) }), 1)
        .unwrap_err();
    assert!(matches!(err, PubSubError::ManagerRunning));
    assert!(matches!(manager.run().await, Err(PubSubError::ManagerRunning)));

    manager.stop();
    runner.await.unwrap().unwrap();
    assert!(manager.wait().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unopenable_subscription_is_skipped() {
    let driver = broker_with(MemoryDriver::new(), "events", &["present"]).await;
    let manager = Arc::new(Manager::new(Arc::new(driver.clone())));

    let handled = Arc::new(AtomicUsize::new(0));
    manager.add_consumer("present", counting_handler(handled.clone()), 1).unwrap();
    manager.add_consumer("missing", counting_handler(handled.clone()), 1).unwrap();
    assert_eq!(manager.consumer_count(), 2);

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    Publisher::open(&driver, "events")
        .await
        .unwrap()
        .send(OutgoingMessage::new("still delivered"))
        .await
        .unwrap();
    wait_for(Duration::from_secs(5), "present handler", || {
        handled.load(Ordering::SeqCst) == 1
    })
    .await;

    manager.stop();
    runner.await.unwrap().unwrap();
    // Only the consumer that opened is counted once running.
    assert_eq!(manager.consumer_count(), 1);
    assert_eq!(manager.wait().await, vec![StopReason::Cancelled]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscription_config_supplies_the_bound() {
    let driver = broker_with(MemoryDriver::new(), "events", &[]).await;
    let provisioner = Provisioner::new(Arc::new(driver.clone()));
    let subscription = provisioner
        .create_or_get_subscription(
            "configured",
            "events",
            SubscriptionConfig {
                max_outstanding: 4,
                ..SubscriptionConfig::default()
            },
        )
        .await
        .unwrap();

    let publisher = Publisher::open(&driver, "events").await.unwrap();
    for i in 0..12 {
        publisher
            .send(OutgoingMessage::new(format!("job-{i}")))
            .await
            .unwrap();
    }

    let manager = Arc::new(Manager::new(Arc::new(driver.clone())));
    let gauge = Arc::new(Gauge::default());
    manager
        .add_subscription(&subscription, gauge_handler(gauge.clone(), Duration::from_millis(30)))
        .unwrap();
    assert_eq!(manager.consumer_count(), 1);

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };
    wait_for(Duration::from_secs(10), "all jobs acked", || {
        driver.stats("configured").unwrap().acked == 12
    })
    .await;

    manager.stop();
    runner.await.unwrap().unwrap();
    assert_eq!(manager.wait().await, vec![StopReason::Cancelled]);

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak concurrency {peak} exceeded the configured bound");
    assert!(peak > 1, "handlers never overlapped");
    assert_eq!(gauge.finished.load(Ordering::SeqCst), 12);
}
