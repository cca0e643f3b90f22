//! Core trait for projections fed from the log.

use async_trait::async_trait;
use event_store::RecordedMessage;

use crate::Result;

/// A projection that processes messages and updates a read model.
///
/// Messages are delivered at least once: a processor that crashes between
/// handling a batch and storing its checkpoint re-delivers the batch, so
/// `handle` must tolerate seeing a message twice.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Returns the name of this projection.
    fn name(&self) -> &str;

    /// Message types this projection wants; others are never delivered.
    fn can_handle(&self) -> &[&'static str];

    /// Handles a single message, updating the projection's read model.
    async fn handle(&self, message: &RecordedMessage) -> Result<()>;

    /// Resets the projection to its initial state.
    async fn reset(&self) -> Result<()>;

    fn handles(&self, message_type: &str) -> bool {
        self.can_handle().contains(&message_type)
    }
}
