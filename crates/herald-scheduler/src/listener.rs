//! Lifecycle observation hooks.

use herald_core::JobInstance;

/// Observes instance lifecycle events.
///
/// Called on creation and on every terminal transition; deferral is not
/// surfaced separately and is observable through defer-count growth. The
/// embedding application typically uses this to mirror mutations into its
/// persistence layer.
pub trait JobListener: Send + Sync {
    /// A new instance was accepted for scheduling.
    fn on_created(&self, instance: &JobInstance) {
        let _ = instance;
    }

    /// An instance reached a terminal state.
    fn on_terminal(&self, instance: &JobInstance) {
        let _ = instance;
    }
}
