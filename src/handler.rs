//! Defines the core trait for handling captured error envelopes.

use crate::context::ExecutionContext;
use crate::envelope::ErrorEnvelope;
use crate::error::RetryError;
use crate::republish::RepublishOutcome;
use async_trait::async_trait;

/// A trait for processing envelopes drained from the error queue.
///
/// Expected per-message conditions are reported through [`RepublishOutcome`].
/// Returning `Err` signals a defect and faults the whole pipeline.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    /// Processes a single envelope inside its dispatched execution context.
    ///
    /// # Arguments
    /// * `ctx` - The logical operation this envelope runs in; resolves the correlation id.
    /// * `envelope` - The captured failed message.
    async fn handle_envelope(&self, ctx: &ExecutionContext, envelope: ErrorEnvelope) -> Result<RepublishOutcome, RetryError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}
