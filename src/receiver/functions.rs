use crate::errors::HandlerError;
use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Trait for implementing message handlers.
///
/// The consumer acks the message when `handle` returns `Ok(())` and nacks it
/// when it returns an error or panics. Handlers never settle messages
/// themselves.
///
/// `cancel` is triggered when the consumer is asked to stop. Handlers should
/// observe it, but a running handler is never interrupted.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<(), HandlerError>;
}

/// Adapts an async function or closure into a [`MessageHandler`].
///
/// # Example
///
/// ```rust
/// use rs_sqs_pubsub::receiver::HandlerFn;
///
/// let handler = HandlerFn::new(|_cancel, message| async move {
///     println!("got {}", message.body_lossy());
///     Ok(())
/// });
/// ```
pub struct HandlerFn<F> {
    handler_fn: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    pub fn new(handler_fn: F) -> Self {
        HandlerFn { handler_fn }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<(), HandlerError> {
        (self.handler_fn)(cancel, message).await
    }
}

/// Adapts a function that also receives a clone of a shared resource on every call.
///
/// # Type Parameters
///
/// * `F` - The message handler function type
/// * `TShared` - The type of shared resources passed to the handler
pub struct SharedHandlerFn<F, TShared> {
    handler_fn: F,
    shared_resources: TShared,
}

impl<F, Fut, TShared> SharedHandlerFn<F, TShared>
where
    F: Fn(CancellationToken, Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    /// Creates a new handler.
    ///
    /// # Arguments
    ///
    /// * `handler_fn` - The message handler function
    /// * `shared_resources` - Resources shared between message processing calls
    pub fn new(handler_fn: F, shared_resources: TShared) -> Self {
        SharedHandlerFn {
            handler_fn,
            shared_resources,
        }
    }
}

#[async_trait]
impl<F, Fut, TShared> MessageHandler for SharedHandlerFn<F, TShared>
where
    F: Fn(CancellationToken, Message, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    TShared: Send + Sync + Clone + 'static,
{
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<(), HandlerError> {
        (self.handler_fn)(cancel, message, self.shared_resources.clone()).await
    }
}
