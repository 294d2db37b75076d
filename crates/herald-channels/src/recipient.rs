//! Incremental recipient resolution.

use async_trait::async_trait;

use herald_core::{JobInstance, Recipient, RecipientCursor};

use crate::error::ResolveError;

/// One bounded batch of recipients plus the cursor to continue from.
#[derive(Debug, Clone)]
pub struct RecipientPage {
    /// Recipients in this batch.
    pub recipients: Vec<Recipient>,
    /// Cursor for the next batch; `None` when the set is exhausted.
    pub next_cursor: Option<RecipientCursor>,
}

impl RecipientPage {
    /// A page followed by more.
    pub fn new(recipients: Vec<Recipient>, next_cursor: RecipientCursor) -> Self {
        Self {
            recipients,
            next_cursor: Some(next_cursor),
        }
    }

    /// The final page.
    pub fn last(recipients: Vec<Recipient>) -> Self {
        Self {
            recipients,
            next_cursor: None,
        }
    }

    /// Whether this is the final page.
    pub fn is_final(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Resolves a job's recipients one bounded page at a time.
///
/// Must be deterministic for a given cursor: re-invocation after a crash
/// with the last durable cursor must not re-produce recipients from
/// earlier pages. The engine guarantees at-least-once overall; stronger
/// deduplication is the resolver's (or host's) concern.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Resolve the page following `cursor` (`None` means the beginning).
    async fn resolve(
        &self,
        instance: &JobInstance,
        cursor: Option<&RecipientCursor>,
    ) -> Result<RecipientPage, ResolveError>;
}
