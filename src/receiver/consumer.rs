//! Bounded-concurrency consumer for a single subscription.
//!
//! The receive loop pulls one message at a time and hands each to a new task
//! running the handler. A semaphore sized to the concurrency bound gates
//! admission: a permit is taken before a task is spawned and released when the
//! task ends, however it ends. Once receiving stops the loop reacquires every
//! permit, which only succeeds after each admitted message has been acked or
//! nacked.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::driver::{Driver, SubscriptionDriver};
use crate::errors::{PubSubError, Result};
use crate::message::Delivery;
use crate::receiver::functions::MessageHandler;

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Receiving,
    Dispatching,
    Draining,
    Stopped,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Idle,
            1 => ConsumerState::Receiving,
            2 => ConsumerState::Dispatching,
            3 => ConsumerState::Draining,
            _ => ConsumerState::Stopped,
        }
    }
}

/// Why a consumer stopped receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The run token was cancelled.
    Cancelled,
    /// The subscription returned a terminal receive error. The error is logged.
    ReceiveEnded,
}

pub struct Consumer {
    subscription: Arc<dyn SubscriptionDriver>,
    handler: Arc<dyn MessageHandler>,
    max_outstanding: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    state: AtomicU8,
    span: Span,
}

impl Consumer {
    /// Opens `subscription` through `driver` and binds `handler` to it.
    ///
    /// At most `max_outstanding` handler invocations run at once.
    pub async fn open<H>(
        driver: &dyn Driver,
        subscription: &str,
        handler: H,
        max_outstanding: usize,
    ) -> Result<Self>
    where
        H: MessageHandler,
    {
        Self::open_shared(driver, subscription, Arc::new(handler), max_outstanding).await
    }

    pub async fn open_shared(
        driver: &dyn Driver,
        subscription: &str,
        handler: Arc<dyn MessageHandler>,
        max_outstanding: usize,
    ) -> Result<Self> {
        validate_concurrency(max_outstanding)?;
        let subscription = driver.open_subscription(subscription).await?;
        Self::new(subscription, handler, max_outstanding)
    }

    pub fn new(
        subscription: Arc<dyn SubscriptionDriver>,
        handler: Arc<dyn MessageHandler>,
        max_outstanding: usize,
    ) -> Result<Self> {
        validate_concurrency(max_outstanding)?;
        let span = info_span!("consumer", subscription = %subscription.name());

        Ok(Consumer {
            subscription,
            handler,
            max_outstanding,
            semaphore: Arc::new(Semaphore::new(max_outstanding)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            state: AtomicU8::new(ConsumerState::Idle as u8),
            span,
        })
    }

    /// Nests this consumer's log span under `parent`.
    pub fn with_parent_span(mut self, parent: &Span) -> Self {
        self.span = info_span!(parent: parent, "consumer", subscription = %self.subscription.name());
        self
    }

    pub fn subscription(&self) -> &str {
        self.subscription.name()
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of handler invocations currently running.
    ///
    /// Counted per task rather than from free permits, which the drain holds
    /// while it waits.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs the receive loop until `cancel` fires or the subscription stops
    /// delivering, then waits for every admitted message to be settled.
    ///
    /// Receive and handler errors are logged, not returned; the error case is
    /// reserved for calling `start` on a consumer that was already started.
    pub async fn start(&self, cancel: CancellationToken) -> Result<StopReason> {
        if self
            .state
            .compare_exchange(
                ConsumerState::Idle as u8,
                ConsumerState::Receiving as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PubSubError::ConsumerAlreadyStarted {
                subscription: self.subscription.name().to_string(),
            });
        }

        let reason = self
            .receive_loop(&cancel)
            .instrument(self.span.clone())
            .await;

        self.set_state(ConsumerState::Draining);
        self.drain().instrument(self.span.clone()).await;
        self.set_state(ConsumerState::Stopped);

        Ok(reason)
    }

    /// Releases the subscription.
    ///
    /// Called while `start` is running, this ends the receive loop and starts draining.
    pub async fn shutdown(&self) -> Result<()> {
        self.span.in_scope(|| debug!("consumer_shutdown"));
        self.subscription.shutdown().await
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    async fn receive_loop(&self, cancel: &CancellationToken) -> StopReason {
        info!(max_outstanding = self.max_outstanding, "consumer_started");

        loop {
            self.set_state(ConsumerState::Receiving);
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("consumer_cancelled");
                    return StopReason::Cancelled;
                }
                received = self.subscription.receive() => match received {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = %err, "consumer_receiving_error");
                        return StopReason::ReceiveEnded;
                    }
                },
            };

            self.set_state(ConsumerState::Dispatching);
            // A message that was already received is dispatched even when
            // cancellation arrives while waiting for capacity.
            let (permit, cancelled) = tokio::select! {
                biased;
                permit = self.semaphore.clone().acquire_owned() => (permit, false),
                _ = cancel.cancelled() => {
                    debug!(
                        message_id = %delivery.message().id,
                        "consumer_cancelled_while_dispatching"
                    );
                    (self.semaphore.clone().acquire_owned().await, true)
                }
            };

            let Ok(permit) = permit else {
                error!(message_id = %delivery.message().id, "consumer_semaphore_closed");
                if let Err(err) = delivery.nack().await {
                    warn!(error = %err, "consumer_message_nack_error");
                }
                return StopReason::ReceiveEnded;
            };

            let slot = Slot::new(permit, self.in_flight.clone());
            tokio::spawn(
                handle_delivery(self.handler.clone(), delivery, cancel.child_token(), slot)
                    .instrument(self.span.clone()),
            );

            if cancelled {
                return StopReason::Cancelled;
            }
        }
    }

    async fn drain(&self) {
        info!(in_flight = self.in_flight(), "consumer_draining");
        // Permits are only taken by this consumer, so the count fits in u32
        // (checked by `validate_concurrency`).
        match self
            .semaphore
            .acquire_many(self.max_outstanding as u32)
            .await
        {
            Ok(_all) => info!("consumer_drained"),
            Err(err) => warn!(error = %err, "consumer_drain_error"),
        }
    }
}

fn validate_concurrency(max_outstanding: usize) -> Result<()> {
    if max_outstanding == 0 || max_outstanding > Semaphore::MAX_PERMITS.min(u32::MAX as usize) {
        return Err(PubSubError::InvalidConcurrency(max_outstanding));
    }
    Ok(())
}

/// Admission held by one running handler. Dropping it frees the permit.
struct Slot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit, in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Slot {
            _permit: permit,
            in_flight,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn handle_delivery(
    handler: Arc<dyn MessageHandler>,
    delivery: Delivery,
    cancel: CancellationToken,
    slot: Slot,
) {
    let _slot = slot; // released when the task ends, even on panic

    let message = delivery.message().clone();
    let message_id = message.id.clone();
    let outcome = AssertUnwindSafe(handler.handle(cancel, message))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    };

    match failure {
        None => match delivery.ack().await {
            Ok(()) => info!(message_id = %message_id, "consumer_message_handled"),
            Err(err) => warn!(message_id = %message_id, error = %err, "consumer_message_ack_error"),
        },
        Some(failure) => {
            let message = delivery.message();
            error!(
                message_id = %message_id,
                msg_body = %message.body_lossy(),
                msg_attributes = ?message.attributes,
                error = %failure,
                "consumer_message_handle_error"
            );
            if let Err(err) = delivery.nack().await {
                warn!(message_id = %message_id, error = %err, "consumer_message_nack_error");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}
