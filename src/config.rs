use std::env;

use crate::errors::{PubSubError, Result};

/// Scope in which topic and subscription names are unique.
///
/// On AWS a namespace is an account within a region; topic and queue ARNs are
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub region: String,
    pub account_id: String,
}

impl Namespace {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Namespace {
            region: region.into(),
            account_id: account_id.into(),
        }
    }

    /// Loads the namespace from the environment.
    ///
    /// Reads `AWS_REGION` (falling back to `AWS_DEFAULT_REGION`) and `AWS_ACCOUNT_ID`.
    pub fn from_env() -> Result<Self> {
        let region = env::var("AWS_REGION")
            .or_else(|_| env::var("AWS_DEFAULT_REGION"))
            .map_err(|_| PubSubError::Config("AWS_REGION is not set".to_string()))?;
        let account_id = env::var("AWS_ACCOUNT_ID")
            .map_err(|_| PubSubError::Config("AWS_ACCOUNT_ID is not set".to_string()))?;

        if region.is_empty() || account_id.is_empty() {
            return Err(PubSubError::Config(
                "AWS_REGION and AWS_ACCOUNT_ID must not be empty".to_string(),
            ));
        }

        Ok(Namespace::new(region, account_id))
    }

    pub fn topic_arn(&self, topic: &str) -> String {
        format!("arn:aws:sns:{}:{}:{}", self.region, self.account_id, topic)
    }

    pub fn queue_arn(&self, subscription: &str) -> String {
        format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, subscription)
    }
}
