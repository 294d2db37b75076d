//! In-memory channel for tests and embedding demos.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use herald_core::Recipient;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::message::Message;

/// A delivery recorded by the memory channel.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Who the message went to.
    pub recipient: Recipient,
    /// What was sent.
    pub message: Message,
    /// The generated send id.
    pub send_id: String,
}

/// A channel that records deliveries instead of sending them.
///
/// Failures can be scripted per recipient; each scripted failure is
/// consumed by one send attempt, after which sends succeed again.
#[derive(Default)]
pub struct MemoryChannel {
    channel_type: String,
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<HashMap<String, VecDeque<ChannelError>>>,
}

impl MemoryChannel {
    /// Create a recording channel answering to `channel_type`.
    pub fn new(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            ..Default::default()
        }
    }

    /// Script the next send to `recipient_id` to fail with `error`.
    pub fn fail_next(&self, recipient_id: impl Into<String>, error: ChannelError) {
        self.failures
            .lock()
            .expect("memory channel lock poisoned")
            .entry(recipient_id.into())
            .or_default()
            .push_back(error);
    }

    /// Everything delivered so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .expect("memory channel lock poisoned")
            .clone()
    }

    /// Number of deliveries to one recipient.
    pub fn sent_to(&self, recipient_id: &str) -> usize {
        self.sent
            .lock()
            .expect("memory channel lock poisoned")
            .iter()
            .filter(|sent| sent.recipient.id == recipient_id)
            .count()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn channel_type(&self) -> &str {
        &self.channel_type
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &Message,
    ) -> Result<Option<String>, ChannelError> {
        let scripted = self
            .failures
            .lock()
            .expect("memory channel lock poisoned")
            .get_mut(&recipient.id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        let send_id = Uuid::new_v4().to_string();
        debug!(
            channel = %self.channel_type,
            recipient = %recipient.id,
            send_id = %send_id,
            "recorded delivery"
        );
        self.sent
            .lock()
            .expect("memory channel lock poisoned")
            .push(SentMessage {
                recipient: recipient.clone(),
                message: message.clone(),
                send_id: send_id.clone(),
            });
        Ok(Some(send_id))
    }
}
