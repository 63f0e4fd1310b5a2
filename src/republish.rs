//! Republishes captured error envelopes to the exchange they were recorded with.

use crate::broker::{Broker, ExchangeCheck};
use crate::context::ExecutionContext;
use crate::envelope::{BodyEncoding, ErrorEnvelope};
use crate::error::{BrokerError, RetryError};
use crate::handler::EnvelopeHandler;
use async_trait::async_trait;
use std::sync::Arc;

/// Represents the outcome of a single republish attempt.
#[derive(Debug)]
pub enum RepublishOutcome {
    /// The message was published back to its exchange.
    Published,
    /// The recorded exchange does not exist on the broker; nothing was published.
    DestinationMissing(String),
    /// The broker rejected or dropped the verify/publish call.
    TransportFailure(BrokerError),
}

impl RepublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, RepublishOutcome::Published)
    }
}

/// Republishes envelopes through a [`Broker`].
///
/// The destination is the exchange recorded in the envelope. When the failure was
/// captured on an error exchange, that is where the message goes back to.
pub struct Republisher<B: ?Sized> {
    broker: Arc<B>,
    body_encoding: BodyEncoding,
}

impl<B: Broker + ?Sized> Republisher<B> {
    pub fn new(broker: Arc<B>, body_encoding: BodyEncoding) -> Self {
        Self { broker, body_encoding }
    }

    /// Verifies the destination, rebuilds the message and publishes it with
    /// `mandatory = false`.
    ///
    /// Only an undecodable body is an error; broker conditions are outcomes.
    pub async fn republish(&self, ctx: &ExecutionContext, envelope: &ErrorEnvelope) -> Result<RepublishOutcome, RetryError> {
        let correlation_id = ctx.correlation_id();
        let endpoint = self.broker.endpoint();

        if !envelope.exchange.is_empty() {
            match self.broker.verify_exchange(&envelope.exchange).await {
                Ok(ExchangeCheck::Exists) => {}
                Ok(ExchangeCheck::NotFound) => {
                    log::warn!(
                        "[ContextId={}] The exchange, '{}', described in the error message does not exist on '{}', '{}'",
                        correlation_id, envelope.exchange, endpoint.host, endpoint.vhost
                    );
                    return Ok(RepublishOutcome::DestinationMissing(envelope.exchange.clone()));
                }
                Err(e) => {
                    log::error!(
                        "[ContextId={}] Failed to verify exchange '{}' on '{}', '{}': {}",
                        correlation_id, envelope.exchange, endpoint.host, endpoint.vhost, e
                    );
                    return Ok(RepublishOutcome::TransportFailure(e));
                }
            }
        }

        let body = envelope.body(self.body_encoding)?;

        match self
            .broker
            .publish(&envelope.exchange, &envelope.routing_key, false, &envelope.basic_properties, &body)
            .await
        {
            Ok(()) => {
                log::info!(
                    "[ContextId={}] Message republished to exchange '{}' with routing key '{}'",
                    correlation_id, envelope.exchange, envelope.routing_key
                );
                Ok(RepublishOutcome::Published)
            }
            Err(e) => {
                log::error!(
                    "[ContextId={}] Failed to republish message to exchange '{}' on '{}', '{}'. Left for manual inspection: {}",
                    correlation_id, envelope.exchange, endpoint.host, endpoint.vhost, e
                );
                Ok(RepublishOutcome::TransportFailure(e))
            }
        }
    }
}

#[async_trait]
impl<B: Broker + ?Sized + 'static> EnvelopeHandler for Republisher<B> {
    async fn handle_envelope(&self, ctx: &ExecutionContext, envelope: ErrorEnvelope) -> Result<RepublishOutcome, RetryError> {
        log::debug!(
            "[ContextId={}] Error message received for exchange '{}': {}",
            ctx.correlation_id(), envelope.exchange, envelope.exception
        );
        self.republish(ctx, &envelope).await
    }

    fn handler_name(&self) -> &str {
        "Republisher"
    }
}
