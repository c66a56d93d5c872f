use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Span, error, info, info_span, warn};

use crate::driver::Driver;
use crate::errors::{PubSubError, Result};
use crate::resource::Subscription;

pub mod config;
pub mod consumer;
mod functions;

pub use consumer::{Consumer, ConsumerState, StopReason};
pub use functions::{HandlerFn, MessageHandler, SharedHandlerFn};

struct Registration {
    subscription: String,
    handler: Arc<dyn MessageHandler>,
    max_outstanding: usize,
}

/// Runs one [`Consumer`] per registered subscription under a shared cancellation token.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rs_sqs_pubsub::driver::memory::MemoryDriver;
/// use rs_sqs_pubsub::receiver::{HandlerFn, Manager};
///
/// # async fn run() -> rs_sqs_pubsub::errors::Result<()> {
/// let manager = Arc::new(Manager::new(Arc::new(MemoryDriver::new())));
/// manager.add_consumer(
///     "orders-audit",
///     HandlerFn::new(|_cancel, message| async move {
///         println!("audit: {}", message.body_lossy());
///         Ok(())
///     }),
///     4,
/// )?;
///
/// let runner = manager.clone();
/// tokio::spawn(async move { runner.run().await });
/// // ...
/// manager.stop();
/// manager.wait().await;
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    driver: Arc<dyn Driver>,
    registrations: Mutex<Vec<Registration>>,
    running: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<Option<StopReason>>>>,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Manager {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Manager {
            driver,
            registrations: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            span: info_span!("manager"),
        }
    }

    /// Uses `span` as the parent of every log event emitted by this manager and its consumers.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Registers a handler for `subscription`. Must be called before [`Manager::run`].
    pub fn add_consumer<H>(&self, subscription: &str, handler: H, max_outstanding: usize) -> Result<()>
    where
        H: MessageHandler,
    {
        if max_outstanding == 0 {
            return Err(PubSubError::InvalidConcurrency(max_outstanding));
        }

        let mut registrations = lock(&self.registrations);
        if self.running.load(Ordering::Acquire) {
            return Err(PubSubError::ManagerRunning);
        }
        registrations.push(Registration {
            subscription: subscription.to_string(),
            handler: Arc::new(handler),
            max_outstanding,
        });
        Ok(())
    }

    /// Registers a handler using the subscription's configured `max_outstanding`.
    pub fn add_subscription<H>(&self, subscription: &Subscription, handler: H) -> Result<()>
    where
        H: MessageHandler,
    {
        self.add_consumer(
            subscription.name(),
            handler,
            subscription.config().max_outstanding,
        )
    }

    /// True once [`Manager::run`] has been called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Registered consumers before [`Manager::run`], started consumers after.
    ///
    /// A registration whose subscription fails to open is skipped by `run` and
    /// no longer counted.
    pub fn consumer_count(&self) -> usize {
        lock(&self.registrations).len() + lock(&self.tasks).len()
    }

    /// Starts every registered consumer and blocks until [`Manager::stop`] is called.
    ///
    /// Returns as soon as the stop signal is observed; use [`Manager::wait`] to
    /// wait for the consumers to drain. A subscription that cannot be opened is
    /// logged and skipped.
    pub async fn run(&self) -> Result<()> {
        let registrations = {
            let mut registrations = lock(&self.registrations);
            if self.running.swap(true, Ordering::AcqRel) {
                return Err(PubSubError::ManagerRunning);
            }
            std::mem::take(&mut *registrations)
        };

        info!(parent: &self.span, consumers = registrations.len(), "manager_run_started");

        for registration in registrations {
            let consumer = match Consumer::open_shared(
                self.driver.as_ref(),
                &registration.subscription,
                registration.handler,
                registration.max_outstanding,
            )
            .await
            {
                Ok(consumer) => consumer.with_parent_span(&self.span),
                Err(err) => {
                    error!(
                        parent: &self.span,
                        subscription = %registration.subscription,
                        error = %err,
                        "manager_consumer_open_error"
                    );
                    continue;
                }
            };

            let cancel = self.cancel.child_token();
            let span = self.span.clone();
            let task = tokio::spawn(async move {
                let reason = consumer.start(cancel).await;
                if let Err(err) = consumer.shutdown().await {
                    warn!(
                        parent: &span,
                        subscription = %consumer.subscription(),
                        error = %err,
                        "manager_consumer_shutdown_error"
                    );
                }
                reason.ok()
            });
            lock(&self.tasks).push(task);
        }

        self.cancel.cancelled().await;
        info!(parent: &self.span, "manager_run_finished");
        Ok(())
    }

    /// Signals every consumer to stop receiving and drain. Safe to call more than once.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(parent: &self.span, "manager_stop");
        }
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for every consumer started by [`Manager::run`] to drain and release
    /// its subscription. Call after `run` has returned.
    pub async fn wait(&self) -> Vec<StopReason> {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        let mut reasons = Vec::with_capacity(tasks.len());

        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(Some(reason)) => reasons.push(reason),
                Ok(None) => {}
                Err(err) => error!(parent: &self.span, error = %err, "manager_consumer_task_error"),
            }
        }

        reasons
    }
}
