//! # rs-sqs-pubsub
//!
//! Topic/subscription provisioning and a bounded-concurrency consumer engine on
//! top of a managed publish/subscribe service. The AWS driver maps topics to SNS
//! topics and subscriptions to SQS queues; an in-memory driver with the same
//! semantics is included for tests and local development.
//!
//! ## Features
//!
//! - Idempotent creation of topics and subscriptions
//! - Publishing with attributes and an optional send deadline
//! - Consumers that run up to N handlers at once, ack on success, nack on
//!   failure or panic, and drain every in-flight handler before returning
//! - A manager that runs many consumers under one stop signal
//! - Trait-based handlers, with closure adapters that can carry a shared resource
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rs_sqs_pubsub::client::create_clients_from_env;
//! use rs_sqs_pubsub::config::Namespace;
//! use rs_sqs_pubsub::driver::sqs::SqsDriver;
//! use rs_sqs_pubsub::message::OutgoingMessage;
//! use rs_sqs_pubsub::provisioner::Provisioner;
//! use rs_sqs_pubsub::publisher::Publisher;
//! use rs_sqs_pubsub::receiver::{Consumer, HandlerFn};
//! use rs_sqs_pubsub::resource::SubscriptionConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clients = create_clients_from_env().await;
//!     let driver = Arc::new(SqsDriver::new(clients, Namespace::from_env()?));
//!
//!     let provisioner = Provisioner::new(driver.clone());
//!     provisioner.create_or_get_topic("orders").await?;
//!     provisioner
//!         .create_or_get_subscription("orders-audit", "orders", SubscriptionConfig::default())
//!         .await?;
//!
//!     let publisher = Publisher::open(driver.as_ref(), "orders").await?;
//!     publisher
//!         .send(OutgoingMessage::new("order created").with_attribute("kind", "created"))
//!         .await?;
//!
//!     let consumer = Consumer::open(
//!         driver.as_ref(),
//!         "orders-audit",
//!         HandlerFn::new(|_cancel, message| async move {
//!             println!("Processing message: {}", message.body_lossy());
//!             Ok(())
//!         }),
//!         4,
//!     )
//!     .await?;
//!     consumer.start(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod message;
pub mod provisioner;
pub mod publisher;
pub mod receiver;
pub mod resource;
