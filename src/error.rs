use thiserror::Error;

/// Generic error type for the retry pipeline.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Error reported by a broker transport.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// An inbound delivery was not a valid error envelope.
    #[error("Failed to deserialize error envelope: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The stored message body did not match the configured body encoding.
    #[error("Failed to decode error message body: {0}")]
    BodyDecoding(#[from] base64::DecodeError),

    /// Invalid configuration supplied at startup.
    #[error("Retry configuration error: {message}")]
    Config { message: String },

    /// Dispatcher workers could not be started or joined.
    #[error("Dispatcher worker error: {0}")]
    Worker(#[from] std::io::Error),

    /// Error from the envelope handler logic.
    #[error("Envelope handler failed: {0}")]
    HandlerError(Box<dyn std::error::Error + Send + Sync>),

    /// The dispatcher no longer accepts submissions.
    #[error("Retry pipeline has stopped accepting work")]
    PipelineStopped,

    /// Dispatched work failed outside the expected outcomes.
    #[error(transparent)]
    Pipeline(#[from] PipelineFault),
}

impl From<&str> for RetryError {
    fn from(s: &str) -> Self {
        RetryError::Config { message: s.to_string() }
    }
}

impl From<String> for RetryError {
    fn from(s: String) -> Self {
        RetryError::Config { message: s }
    }
}

/// Failure talking to the broker while verifying or publishing.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Failure from a non-AMQP transport such as [`crate::broker::InMemoryBroker`].
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A defect raised inside dispatched work. Fatal to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Message processing exception - check the default error queue (ContextId={correlation_id}): {reason}")]
pub struct PipelineFault {
    /// Correlation id active when the fault was raised.
    pub correlation_id: String,
    pub reason: String,
}

impl PipelineFault {
    pub fn new(correlation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            reason: reason.into(),
        }
    }
}
