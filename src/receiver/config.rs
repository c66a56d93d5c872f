use std::time::Duration;

/// Long-polling parameters for receiving from an SQS-backed subscription.
///
/// # Fields
/// - `max_number_of_messages`: The maximum number of messages to fetch in a single request.
/// - `wait_time_seconds`: The wait time for long polling, in seconds.
/// - `error_backoff`: Pause before polling again after a transient receive error.
#[derive(Debug, Clone)]
pub struct AwsSqsReceiverConfig {
    /// The maximum number of messages to fetch in a single request (1..=10).
    ///
    /// Fetched messages are buffered and handed to the consumer one at a time.
    pub max_number_of_messages: i32,

    /// The wait time for long polling, in seconds.
    pub wait_time_seconds: i32,

    pub error_backoff: Duration,
}

impl Default for AwsSqsReceiverConfig {
    fn default() -> Self {
        AwsSqsReceiverConfig {
            max_number_of_messages: 10,
            wait_time_seconds: 20,
            error_backoff: Duration::from_secs(1),
        }
    }
}
