//! # Hosepipe Retry
//! Drains a RabbitMQ error queue and republishes each captured message to the
//! exchange it was recorded with, on a bounded pool of dedicated workers.

pub mod broker;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod republish;
pub mod subscription;

// Re-export key components for easy access
pub use broker::{Broker, BrokerEndpoint, ExchangeCheck, InMemoryBroker, LapinBroker};
pub use config::{RetryConfig, DEFAULT_ERROR_QUEUE};
pub use context::{CorrelationStore, ExecutionContext, CONTEXT_ID};
pub use dispatcher::{Completion, Dispatcher, DispatcherConfig};
pub use envelope::{BodyEncoding, ErrorEnvelope, MessageProperties, WorkItem};
pub use error::{BrokerError, PipelineFault, RetryError};
pub use handler::EnvelopeHandler;
pub use republish::{RepublishOutcome, Republisher};
pub use subscription::{Acknowledge, DeliverySource, InboundDelivery, SubscriptionAdapter, SubscriptionReport};
