//! Channel payloads and message resolution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use herald_core::JobInstance;

use crate::error::ResolveError;

/// A channel-specific payload, resolved per notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Subject line, for channels that have one.
    pub subject: Option<String>,
    /// Message body.
    pub body: String,
    /// Binary attachments.
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// A body-only message.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            subject: None,
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// Attach a subject line.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attach a file.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// A named binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub filename: String,
    /// MIME type of the content.
    pub content_type: String,
    /// Raw content bytes.
    pub content: Vec<u8>,
}

/// Produces the channel payload for a notification.
///
/// Pure given the notification's configuration parameters and the
/// recipient (including locale); template engines plug in behind this
/// contract.
#[async_trait]
pub trait MessageResolver: Send + Sync {
    /// Resolve the payload for `notification`.
    async fn resolve(&self, notification: &JobInstance) -> Result<Message, ResolveError>;
}
