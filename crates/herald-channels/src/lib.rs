//! Channel and resolver contracts for Herald notification dispatch.
//!
//! This crate holds the boundary the engine dispatches notifications
//! through:
//! - [`Channel`]: delivers one message to one recipient
//! - [`RecipientResolver`]: resolves a job's recipients one page at a time
//! - [`MessageResolver`]: produces the channel payload per notification
//! - [`TransportPool`]: bounded checkout of outbound connections
//! - [`MemoryChannel`]: a recording channel for tests and demos
//!
//! Wire protocols (SMTP, MIME construction) live entirely behind
//! [`Channel`] in the embedding application.

mod channel;
mod error;
mod memory;
mod message;
mod pool;
mod recipient;

pub use channel::Channel;
pub use error::{ChannelError, ResolveError};
pub use memory::{MemoryChannel, SentMessage};
pub use message::{Attachment, Message, MessageResolver};
pub use pool::{PooledTransport, TransportPool};
pub use recipient::{RecipientPage, RecipientResolver};
