//! Outbound dispatch channels.

use async_trait::async_trait;

use herald_core::Recipient;

use crate::error::ChannelError;
use crate::message::Message;

/// Delivers one message to one recipient.
///
/// Implementations must be safe for concurrent calls from multiple
/// notifications in the same partition. Wire protocols (SMTP and friends)
/// live entirely behind this contract.
#[async_trait]
pub trait Channel: Send + Sync {
    /// The channel type string notifications are routed by.
    fn channel_type(&self) -> &str;

    /// Deliver `message` to `recipient`.
    ///
    /// Returns an opaque send id when the transport produces one.
    async fn send(
        &self,
        recipient: &Recipient,
        message: &Message,
    ) -> Result<Option<String>, ChannelError>;
}
