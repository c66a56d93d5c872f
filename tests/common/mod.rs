#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rs_sqs_pubsub::driver::Driver;
use rs_sqs_pubsub::driver::memory::MemoryDriver;
use rs_sqs_pubsub::errors::HandlerError;
use rs_sqs_pubsub::logging::{LogFormat, init_logging};
use rs_sqs_pubsub::message::Message;
use rs_sqs_pubsub::receiver::MessageHandler;
use rs_sqs_pubsub::resource::SubscriptionConfig;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct SharedCounter {
    count: Arc<Mutex<i32>>,
}

impl SharedCounter {
    pub fn new() -> Self {
        Self {
            count: Arc::new(Mutex::new(0)),
        }
    }

    pub async fn increment(&self) {
        let mut count = self.count.lock().await;
        *count += 1;
    }

    pub async fn get_count(&self) -> i32 {
        *self.count.lock().await
    }
}

/// Installs the log subscriber once per test binary; later calls are no-ops.
pub fn init_logs() {
    let _ = init_logging(LogFormat::from_env());
}

/// Creates `topic` and one subscription per name on a fresh broker.
pub async fn broker_with(driver: MemoryDriver, topic: &str, subscriptions: &[&str]) -> MemoryDriver {
    init_logs();
    let created = driver.create_topic(topic).await.unwrap();
    for name in subscriptions {
        driver
            .create_subscription(name, &created, &SubscriptionConfig::default())
            .await
            .unwrap();
    }
    driver
}

/// Polls `condition` every 10ms until it holds, panicking after `limit`.
pub async fn wait_for<F>(limit: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let result = timeout(limit, async {
        loop {
            if condition() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if result.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

/// Tracks how many handlers run at once and the highest value seen.
#[derive(Default)]
pub struct Gauge {
    pub current: AtomicUsize,
    pub peak: AtomicUsize,
    pub finished: AtomicUsize,
}

impl Gauge {
    pub async fn hold(&self, duration: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(duration).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds each message for a fixed time while recording concurrency.
pub struct GaugeHandler {
    gauge: Arc<Gauge>,
    hold: Duration,
}

#[async_trait]
impl MessageHandler for GaugeHandler {
    async fn handle(&self, _cancel: CancellationToken, _message: Message) -> Result<(), HandlerError> {
        self.gauge.hold(self.hold).await;
        Ok(())
    }
}

pub fn gauge_handler(gauge: Arc<Gauge>, hold: Duration) -> GaugeHandler {
    GaugeHandler { gauge, hold }
}
