use async_trait::async_trait;

use crate::errors::DataError;
use crate::models::StreamMessage;

/// A destination for accepted stream messages. The recorder drives a set of
/// these; each invocation owns its sinks exclusively for its duration.
#[async_trait]
pub trait StreamSink: Send {
    /// Persist one accepted (non-heartbeat, validated) message.
    async fn record(&mut self, message: &StreamMessage) -> Result<(), DataError>;

    /// Release held resources. Must be safe to call more than once.
    async fn close(&mut self) -> Result<(), DataError> {
        Ok(())
    }
}
