//! Notification specialization: incremental fan-out and channel dispatch.
//!
//! A fan-out job resolves its recipients one bounded page per processor
//! invocation and creates one notification per recipient, each submitted
//! to its channel's partition. Notifications are then dispatched through
//! the registered [`Channel`], with channel failures mapped 1:1 onto the
//! scheduler's failure taxonomy.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tracing::debug;

use herald_channels::{Channel, ChannelError, MessageResolver, RecipientResolver};
use herald_core::{JobConfiguration, JobInstance, JobKind, PartitionKey, RecipientCursor};
use herald_scheduler::{ExecutionError, Processor};

use crate::config::{ConfigIssue, ContextConfig, PartitionSpec};
use crate::context::{ContextInner, JobContext};
use crate::error::ContextError;

/// Maps one fan-out job type onto the partition that runs it.
#[derive(Clone)]
pub struct FanoutRoute {
    /// The fan-out job type.
    pub job_type: String,
    /// Partition the fan-out jobs run on.
    pub partition: PartitionKey,
}

impl FanoutRoute {
    /// Route `job_type` fan-out jobs onto `partition`.
    pub fn new(job_type: impl Into<String>, partition: impl Into<PartitionKey>) -> Self {
        Self {
            job_type: job_type.into(),
            partition: partition.into(),
        }
    }
}

/// Configuration for a [`NotificationJobContext`].
///
/// Extends a base [`ContextConfig`] with the channel registry, the
/// recipient/message resolvers, and the fan-out job routing.
#[derive(Default)]
pub struct NotificationContextConfig {
    /// Plain job configuration (partitions, processors, listeners).
    pub base: ContextConfig,
    /// Dispatch channels, keyed by their declared channel type.
    pub channels: Vec<Arc<dyn Channel>>,
    /// Resolves recipients one page at a time during fan-out.
    pub recipient_resolver: Option<Arc<dyn RecipientResolver>>,
    /// Produces channel payloads per notification.
    pub message_resolver: Option<Arc<dyn MessageResolver>>,
    /// Which job types fan out, and where they run.
    pub fanout_routes: Vec<FanoutRoute>,
}

impl NotificationContextConfig {
    /// An empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the base job configuration.
    pub fn with_base(mut self, base: ContextConfig) -> Self {
        self.base = base;
        self
    }

    /// Register a dispatch channel.
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Set the recipient resolver.
    pub fn with_recipient_resolver(mut self, resolver: Arc<dyn RecipientResolver>) -> Self {
        self.recipient_resolver = Some(resolver);
        self
    }

    /// Set the message resolver.
    pub fn with_message_resolver(mut self, resolver: Arc<dyn MessageResolver>) -> Self {
        self.message_resolver = Some(resolver);
        self
    }

    /// Declare a fan-out job type and its partition.
    pub fn with_fanout_route(mut self, route: FanoutRoute) -> Self {
        self.fanout_routes.push(route);
        self
    }
}

/// Job context specialized for notification fan-out and channel dispatch.
#[derive(Clone, Debug)]
pub struct NotificationJobContext {
    jobs: JobContext,
    channel_types: HashSet<String>,
    fanout_partitions: HashMap<String, PartitionKey>,
}

impl NotificationJobContext {
    /// Build the context, wiring per-channel delivery partitions and the
    /// fan-out processor into the base configuration.
    ///
    /// Fails with the complete list of configuration problems.
    pub fn new(config: NotificationContextConfig) -> Result<Self, ContextError> {
        let NotificationContextConfig {
            mut base,
            channels,
            recipient_resolver,
            message_resolver,
            fanout_routes,
        } = config;

        let mut issues = Vec::new();
        if !fanout_routes.is_empty() && recipient_resolver.is_none() {
            issues.push(ConfigIssue::MissingRecipientResolver);
        }
        if !channels.is_empty() && message_resolver.is_none() {
            issues.push(ConfigIssue::MissingMessageResolver);
        }
        if !fanout_routes.is_empty() && channels.is_empty() {
            issues.push(ConfigIssue::NoChannels);
        }

        // One delivery partition per channel; notifications are routed by
        // their channel type string.
        let mut channel_types = HashSet::new();
        if let Some(messages) = &message_resolver {
            for channel in &channels {
                let channel_type = channel.channel_type().to_string();
                base = base
                    .with_partition(
                        PartitionSpec::new(channel_type.clone()).route(channel_type.clone()),
                    )
                    .with_processor(
                        channel_type.clone(),
                        Arc::new(DeliveryProcessor {
                            channel: Arc::clone(channel),
                            messages: Arc::clone(messages),
                        }),
                    );
                channel_types.insert(channel_type);
            }
        }

        let fanout = recipient_resolver.map(|recipients| {
            Arc::new(FanoutProcessor {
                recipients,
                context: OnceLock::new(),
            })
        });
        let mut fanout_partitions = HashMap::new();
        if let Some(fanout) = &fanout {
            for route in &fanout_routes {
                base = base
                    .with_partition(
                        PartitionSpec::new(route.partition.clone()).route(route.job_type.clone()),
                    )
                    .with_processor(
                        route.job_type.clone(),
                        Arc::clone(fanout) as Arc<dyn Processor>,
                    );
                fanout_partitions.insert(route.job_type.clone(), route.partition.clone());
            }
        }

        issues.extend(base.validate());
        if !issues.is_empty() {
            return Err(ContextError::Invalid(issues));
        }

        let jobs = JobContext::from_validated(base);
        if let Some(fanout) = &fanout {
            // Bound after construction; the schedulers are not running yet.
            let _ = fanout.context.set(Arc::downgrade(jobs.inner()));
        }

        Ok(Self {
            jobs,
            channel_types,
            fanout_partitions,
        })
    }

    /// The underlying job context.
    pub fn jobs(&self) -> &JobContext {
        &self.jobs
    }

    /// Start every partition loop.
    pub async fn start(&self) {
        self.jobs.start().await;
    }

    /// Stop every partition loop, draining in-flight work.
    pub async fn stop(&self, timeout: std::time::Duration) -> bool {
        self.jobs.stop(timeout).await
    }

    /// Create and submit a fan-out job for `job_type` dispatching through
    /// `channel_type`. Returns the new instance's id.
    pub async fn submit_notification_job(
        &self,
        job_type: &str,
        channel_type: &str,
        config: JobConfiguration,
    ) -> Result<String, ContextError> {
        if !self.channel_types.contains(channel_type) {
            return Err(ContextError::UnknownChannel(channel_type.to_string()));
        }
        let partition = self
            .fanout_partitions
            .get(job_type)
            .ok_or_else(|| ContextError::UnknownJobType(job_type.to_string()))?;

        let instance =
            JobInstance::fanout(job_type, partition.clone(), channel_type, config);
        let id = instance.id.clone();
        self.jobs.submit(instance).await?;
        Ok(id)
    }
}

/// Processes a fan-out job one recipient page per invocation.
///
/// Returns the advanced cursor until the recipient set is exhausted; the
/// scheduler keeps re-invoking with the stored cursor and marks the job
/// done on `None`. The cursor is the only state needed to resume after a
/// crash.
struct FanoutProcessor {
    recipients: Arc<dyn RecipientResolver>,
    context: OnceLock<Weak<ContextInner>>,
}

#[async_trait]
impl Processor for FanoutProcessor {
    async fn process(
        &self,
        instance: &mut JobInstance,
    ) -> Result<Option<RecipientCursor>, ExecutionError> {
        let JobKind::Fanout { channel_type, .. } = &instance.kind else {
            return Err(ExecutionError::permanent(format!(
                "instance {} is not a fan-out job",
                instance.id
            )));
        };
        let channel_type = channel_type.clone();

        let context = self
            .context
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ExecutionError::permanent("fan-out context no longer available"))?;

        let cursor = instance.recipient_cursor().cloned();
        let page = self
            .recipients
            .resolve(instance, cursor.as_ref())
            .await
            .map_err(|err| {
                ExecutionError::permanent(format!("recipient resolution failed: {err}"))
            })?;

        let count = page.recipients.len();
        for recipient in page.recipients {
            let notification = JobInstance::notification(instance, recipient, &channel_type);
            // A failed submission retries the whole page from the same
            // cursor; duplicates are within the at-least-once contract.
            context.submit(notification).await.map_err(|err| {
                ExecutionError::temporary(format!("notification submission failed: {err}"))
            })?;
        }

        debug!(
            job = %instance.id,
            recipients = count,
            exhausted = page.next_cursor.is_none(),
            "fan-out page submitted"
        );
        Ok(page.next_cursor)
    }
}

/// Dispatches one notification through its channel.
struct DeliveryProcessor {
    channel: Arc<dyn Channel>,
    messages: Arc<dyn MessageResolver>,
}

#[async_trait]
impl Processor for DeliveryProcessor {
    async fn process(
        &self,
        instance: &mut JobInstance,
    ) -> Result<Option<RecipientCursor>, ExecutionError> {
        let JobKind::Notification { recipient, .. } = &instance.kind else {
            return Err(ExecutionError::permanent(format!(
                "instance {} is not a notification",
                instance.id
            )));
        };
        let recipient = recipient.clone();

        let message = self.messages.resolve(instance).await.map_err(|err| {
            ExecutionError::permanent(format!("message resolution failed: {err}"))
        })?;

        let send_id = self
            .channel
            .send(&recipient, &message)
            .await
            .map_err(channel_failure)?;

        debug!(
            notification = %instance.id,
            recipient = %recipient.id,
            send_id = ?send_id,
            "notification dispatched"
        );
        Ok(None)
    }
}

/// Map a channel failure onto the scheduler's taxonomy, 1:1.
fn channel_failure(err: ChannelError) -> ExecutionError {
    match err {
        ChannelError::Permanent { reason } => ExecutionError::Permanent { reason },
        ChannelError::Temporary {
            reason,
            retry_after,
        } => ExecutionError::Temporary {
            reason,
            defer: retry_after,
        },
        ChannelError::RateLimited {
            reason,
            retry_after,
        } => ExecutionError::RateLimited {
            reason,
            retry_after,
        },
    }
}
