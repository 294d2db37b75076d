//! Process-wide scheduling façade.
//!
//! A [`JobContext`] owns one [`JobScheduler`] per partition key, the
//! read-mostly routing table from job type to partition keys, and the
//! processor registry. All engine state hangs off the context instance;
//! there are no process-wide singletons.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, info};

use herald_core::{JobInstance, PartitionKey, RecipientCursor};
use herald_scheduler::{
    ExecutionError, JobListener, JobScheduler, Processor, SchedulerOptions,
};

use crate::config::ContextConfig;
use crate::error::ContextError;

/// Dispatches executions to the processor registered for the instance's
/// job type.
struct RouteProcessor {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl RouteProcessor {
    fn knows(&self, job_type: &str) -> bool {
        self.processors.contains_key(job_type)
    }
}

#[async_trait]
impl Processor for RouteProcessor {
    async fn process(
        &self,
        instance: &mut JobInstance,
    ) -> Result<Option<RecipientCursor>, ExecutionError> {
        match self.processors.get(&instance.job_type) {
            Some(processor) => processor.process(instance).await,
            None => Err(ExecutionError::permanent(format!(
                "no processor for job type {}",
                instance.job_type
            ))),
        }
    }
}

pub(crate) struct ContextInner {
    /// Job type -> partition keys owning it; built once, read-mostly.
    routing: HashMap<String, Vec<PartitionKey>>,
    processor: Arc<RouteProcessor>,
    schedulers: DashMap<PartitionKey, Arc<JobScheduler>>,
    listeners: Vec<Arc<dyn JobListener>>,
    poll_interval: Duration,
    default_backoff: Duration,
    properties: HashMap<String, String>,
    started: AtomicBool,
}

impl ContextInner {
    fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: self.poll_interval,
            default_backoff: self.default_backoff,
            listeners: self.listeners.clone(),
        }
    }

    /// Get or lazily create the scheduler owning `key`.
    ///
    /// Triggers use their own id as partition key, so partitions appear
    /// dynamically beyond the configured set.
    fn scheduler_for(&self, key: PartitionKey) -> Arc<JobScheduler> {
        let entry = self.schedulers.entry(key.clone()).or_insert_with(|| {
            debug!(partition = %key, "creating scheduler");
            Arc::new(JobScheduler::new(
                key,
                Arc::clone(&self.processor) as Arc<dyn Processor>,
                self.scheduler_options(),
            ))
        });
        Arc::clone(entry.value())
    }

    fn all_schedulers(&self) -> Vec<Arc<JobScheduler>> {
        self.schedulers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) async fn submit(&self, instance: JobInstance) -> Result<(), ContextError> {
        // Configuration errors are fatal here, never at runtime: both
        // ill-formed frames and frames that can no longer be satisfied.
        instance.config.validate()?;
        instance.config.time_frames.earliest_instant(Utc::now())?;

        if !self.processor.knows(&instance.job_type) {
            return Err(ContextError::UnknownJobType(instance.job_type));
        }

        let scheduler = self.scheduler_for(instance.partition_key.clone());
        if self.started.load(Ordering::SeqCst) {
            scheduler.start().await;
        }

        let snapshot = instance.clone();
        scheduler.submit(instance).await?;
        for listener in &self.listeners {
            listener.on_created(&snapshot);
        }
        Ok(())
    }

    pub(crate) async fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        let schedulers = self.all_schedulers();
        for scheduler in &schedulers {
            scheduler.start().await;
        }
        info!(partitions = schedulers.len(), "job context started");
    }

    pub(crate) async fn stop(&self, timeout: Duration) -> bool {
        self.started.store(false, Ordering::SeqCst);
        let schedulers = self.all_schedulers();
        let drained = join_all(
            schedulers
                .iter()
                .map(|scheduler| scheduler.stop(timeout)),
        )
        .await;
        let clean = drained.into_iter().all(|drained| drained);
        info!(clean, "job context stopped");
        clean
    }
}

/// Process-wide façade wiring partitions, processors, and listeners
/// together.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("partitions", &self.inner.routing.len())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl JobContext {
    /// Build a context from a validated configuration.
    ///
    /// Fails with the complete list of configuration problems, not just
    /// the first one found.
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        let issues = config.validate();
        if !issues.is_empty() {
            return Err(ContextError::Invalid(issues));
        }
        Ok(Self::from_validated(config))
    }

    /// Build without re-validating; the caller has already collected
    /// issues across a wider configuration.
    pub(crate) fn from_validated(config: ContextConfig) -> Self {
        let mut routing: HashMap<String, Vec<PartitionKey>> = HashMap::new();
        for spec in &config.partitions {
            for job_type in &spec.job_types {
                routing
                    .entry(job_type.clone())
                    .or_default()
                    .push(spec.key.clone());
            }
        }

        let inner = Arc::new(ContextInner {
            routing,
            processor: Arc::new(RouteProcessor {
                processors: config.processors,
            }),
            schedulers: DashMap::new(),
            listeners: config.listeners,
            poll_interval: config.poll_interval,
            default_backoff: config.default_backoff,
            properties: config.properties,
            started: AtomicBool::new(false),
        });

        // Declared partitions exist up front; trigger partitions appear on
        // submission.
        let context = Self { inner };
        for key in context
            .inner
            .routing
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>()
        {
            context.inner.scheduler_for(key);
        }
        context
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }

    /// Start every partition loop.
    pub async fn start(&self) {
        self.inner.start().await;
    }

    /// Stop every partition loop, draining in-flight work.
    ///
    /// Returns whether all partitions drained within `timeout`; `false`
    /// means shutdown is not yet complete, not that data was lost.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.inner.stop(timeout).await
    }

    /// Accept an instance (task, trigger, or fan-out job) for scheduling.
    pub async fn submit(&self, instance: JobInstance) -> Result<(), ContextError> {
        self.inner.submit(instance).await
    }

    /// Signal that `job_type` work may be due at or before `earliest`.
    ///
    /// Routed to every partition owning the job type; non-blocking.
    pub fn refresh_schedules(&self, job_type: &str, earliest: DateTime<Utc>) {
        if let Some(keys) = self.inner.routing.get(job_type) {
            for key in keys {
                if let Some(scheduler) = self.inner.schedulers.get(key) {
                    scheduler.refresh_schedules(earliest);
                }
            }
        }
    }

    /// Signal every partition, including dynamically created ones.
    pub fn refresh_all_schedules(&self, earliest: DateTime<Utc>) {
        for entry in self.inner.schedulers.iter() {
            entry.value().refresh_schedules(earliest);
        }
    }

    /// Snapshot a pending instance from its partition's working set.
    pub async fn instance(&self, partition: &PartitionKey, id: &str) -> Option<JobInstance> {
        let scheduler = self.inner.schedulers.get(partition)?.clone();
        scheduler.instance(id).await
    }

    /// A pass-through configuration property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.inner.properties.get(key).map(String::as_str)
    }
}
