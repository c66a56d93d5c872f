use std::collections::HashMap;
use std::fmt;

use crate::driver::Acknowledger;
use crate::errors::Result;

/// A message as delivered to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opaque, service-issued message id.
    pub id: String,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl Message {
    /// Body decoded as UTF-8, with invalid sequences replaced.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A message to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        OutgoingMessage {
            body: body.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

/// A received message together with its acknowledgement capability.
///
/// `ack` and `nack` take the delivery by value, so a message can be disposed
/// of at most once.
pub struct Delivery {
    message: Message,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Delivery { message, acker }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Marks the message as processed.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Asks the service to redeliver the message.
    pub async fn nack(self) -> Result<()> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
