//! Context configuration and validation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use herald_core::PartitionKey;
use herald_scheduler::{JobListener, Processor};

/// One partition and the job types it owns.
#[derive(Clone)]
pub struct PartitionSpec {
    /// The partition key.
    pub key: PartitionKey,
    /// Job types scheduled on this partition.
    pub job_types: Vec<String>,
}

impl PartitionSpec {
    /// A partition owning no job types yet.
    pub fn new(key: impl Into<PartitionKey>) -> Self {
        Self {
            key: key.into(),
            job_types: Vec::new(),
        }
    }

    /// Route a job type onto this partition.
    pub fn route(mut self, job_type: impl Into<String>) -> Self {
        self.job_types.push(job_type.into());
        self
    }
}

/// A specific problem found during configuration validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigIssue {
    /// The context has no partitions at all.
    #[error("no partitions configured")]
    NoPartitions,

    /// A partition routes no job types.
    #[error("partition {0} routes no job types")]
    EmptyPartition(String),

    /// A routed job type has no processor.
    #[error("no processor registered for job type {0}")]
    MissingProcessor(String),

    /// The poll interval is zero.
    #[error("poll interval must be non-zero")]
    ZeroPollInterval,

    /// Notification fan-out is configured without a recipient resolver.
    #[error("notification fan-out requires a recipient resolver")]
    MissingRecipientResolver,

    /// Channels are configured without a message resolver.
    #[error("channel dispatch requires a message resolver")]
    MissingMessageResolver,

    /// Notification fan-out is configured without any channel.
    #[error("notification fan-out requires at least one channel")]
    NoChannels,
}

/// Everything a [`JobContext`](crate::JobContext) needs, supplied
/// explicitly by the embedding application at startup.
///
/// Factories are a plain registry; nothing is discovered reflectively.
/// [`validate`](Self::validate) enumerates every problem up front rather
/// than failing at the first missing field.
pub struct ContextConfig {
    /// Partitions and their job-type routing.
    pub partitions: Vec<PartitionSpec>,
    /// Processor registry, keyed by job type.
    pub processors: HashMap<String, Arc<dyn Processor>>,
    /// Lifecycle observers shared by every partition.
    pub listeners: Vec<Arc<dyn JobListener>>,
    /// Upper bound on scheduler poll sleep.
    pub poll_interval: Duration,
    /// Backoff for recoverable failures without an explicit delay.
    pub default_backoff: Duration,
    /// Flat property lookup handed through to factories uninterpreted.
    pub properties: HashMap<String, String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            processors: HashMap::new(),
            listeners: Vec::new(),
            poll_interval: Duration::from_secs(30),
            default_backoff: Duration::from_secs(60),
            properties: HashMap::new(),
        }
    }
}

impl ContextConfig {
    /// An empty configuration with default timings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partition.
    pub fn with_partition(mut self, spec: PartitionSpec) -> Self {
        self.partitions.push(spec);
        self
    }

    /// Register the processor for a job type.
    pub fn with_processor(
        mut self,
        job_type: impl Into<String>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        self.processors.insert(job_type.into(), processor);
        self
    }

    /// Add a lifecycle observer.
    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override the scheduler poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the default failure backoff.
    pub fn with_default_backoff(mut self, default_backoff: Duration) -> Self {
        self.default_backoff = default_backoff;
        self
    }

    /// Attach a pass-through property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Enumerate every problem with this configuration.
    ///
    /// An empty list means the configuration is usable.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.partitions.is_empty() {
            issues.push(ConfigIssue::NoPartitions);
        }

        let mut missing: HashSet<&str> = HashSet::new();
        for spec in &self.partitions {
            if spec.job_types.is_empty() {
                issues.push(ConfigIssue::EmptyPartition(spec.key.to_string()));
            }
            for job_type in &spec.job_types {
                if !self.processors.contains_key(job_type) {
                    missing.insert(job_type);
                }
            }
        }
        let mut missing: Vec<&str> = missing.into_iter().collect();
        missing.sort_unstable();
        issues.extend(
            missing
                .into_iter()
                .map(|job_type| ConfigIssue::MissingProcessor(job_type.to_string())),
        );

        if self.poll_interval.is_zero() {
            issues.push(ConfigIssue::ZeroPollInterval);
        }

        issues
    }
}
