//! Per-partition scheduling loop.
//!
//! One [`JobScheduler`] owns every instance assigned to its partition key.
//! The loop polls for due instances, dispatches each execution onto its own
//! task, and interprets execution outcomes into state transitions: success,
//! permanent failure, deferral with default or explicit backoff, drop after
//! an exceeded defer budget, or deadline abandonment. Nothing else mutates
//! instance state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use herald_core::{
    JobInstance, JobKind, JobState, PartitionKey, ScheduleContext, TimeFrameError,
};

use crate::{ExecutionError, JobListener, Processor, SchedulerError};

/// Tuning knobs for a partition loop.
pub struct SchedulerOptions {
    /// Upper bound on how long the loop sleeps between polls.
    pub poll_interval: Duration,
    /// Backoff applied to recoverable failures without an explicit delay.
    pub default_backoff: Duration,
    /// Lifecycle observers, shared by every instance in the partition.
    pub listeners: Vec<Arc<dyn JobListener>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            default_backoff: Duration::from_secs(60),
            listeners: Vec::new(),
        }
    }
}

/// Outcome of one dispatched execution, routed back to the loop.
struct Completion {
    instance: JobInstance,
    started: DateTime<Utc>,
    outcome: Result<(), ExecutionError>,
}

/// What to do with a due instance, decided under the partition lock.
enum Decision {
    /// Leave the instance as-is for a later tick.
    Skip,
    /// Abandon: the configured deadline has passed.
    Deadline,
    /// Wait for the next time-frame window (or drop on exhausted budget).
    DeferTo(DateTime<Utc>),
    /// The time frames can never be satisfied again.
    FailConfig(TimeFrameError),
    /// Hand the instance to the processor.
    Dispatch,
}

#[derive(Default)]
struct PartitionState {
    /// Not-yet-terminal instances, keyed by id.
    jobs: HashMap<String, JobInstance>,
    /// In-flight execution count per instance id.
    running: HashMap<String, u32>,
}

struct SchedulerInner {
    partition: PartitionKey,
    processor: Arc<dyn Processor>,
    options: SchedulerOptions,
    state: Mutex<PartitionState>,
    wake: Notify,
    shutdown_tx: watch::Sender<Option<Duration>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

/// The scheduling loop for one partition key.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    loop_handle: Mutex<Option<JoinHandle<bool>>>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
}

impl JobScheduler {
    /// Create a scheduler for `partition`. Call [`start`](Self::start) to
    /// begin polling.
    pub fn new(
        partition: PartitionKey,
        processor: Arc<dyn Processor>,
        options: SchedulerOptions,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SchedulerInner {
                partition,
                processor,
                options,
                state: Mutex::new(PartitionState::default()),
                wake: Notify::new(),
                shutdown_tx,
                completion_tx,
            }),
            loop_handle: Mutex::new(None),
            completion_rx: Mutex::new(Some(completion_rx)),
        }
    }

    /// The partition this scheduler owns.
    pub fn partition(&self) -> &PartitionKey {
        &self.inner.partition
    }

    /// Spawn the partition loop. Idempotent.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let Some(completions) = self.completion_rx.lock().await.take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(run_loop(inner, completions)));
        info!(partition = %self.inner.partition, "scheduler started");
    }

    /// Request cooperative shutdown and wait for in-flight executions.
    ///
    /// Dispatched executions are not interrupted; they are given `timeout`
    /// to reach a terminal or deferred state. Returns whether the drain
    /// completed — `false` means "shutdown is not yet complete", not an
    /// error.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let handle = self.loop_handle.lock().await.take();
        let Some(handle) = handle else {
            return true;
        };

        let _ = self.inner.shutdown_tx.send(Some(timeout));
        match tokio::time::timeout(timeout + Duration::from_millis(250), handle).await {
            Ok(Ok(drained)) => drained,
            _ => false,
        }
    }

    /// Accept a new instance into the partition's working set.
    pub async fn submit(&self, instance: JobInstance) -> Result<(), SchedulerError> {
        if instance.partition_key != self.inner.partition {
            return Err(SchedulerError::WrongPartition {
                id: instance.id,
                expected: self.inner.partition.to_string(),
                actual: instance.partition_key.to_string(),
            });
        }
        if instance.state.is_terminal() {
            return Err(SchedulerError::Terminal(instance.id));
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.jobs.contains_key(&instance.id) || state.running.contains_key(&instance.id) {
                return Err(SchedulerError::InstanceExists(instance.id));
            }
            debug!(
                partition = %self.inner.partition,
                id = %instance.id,
                schedule_time = %instance.schedule_time,
                "instance accepted"
            );
            state.jobs.insert(instance.id.clone(), instance);
        }

        self.inner.wake.notify_one();
        Ok(())
    }

    /// Hint that work may be due at or before `earliest`.
    ///
    /// Non-blocking and safe from any task. The loop re-derives its wake-up
    /// time from the full working set, so every instance with
    /// `schedule_time <= earliest` that existed at this call is considered
    /// — including ones scheduled exactly at `earliest`.
    pub fn refresh_schedules(&self, earliest: DateTime<Utc>) {
        trace!(partition = %self.inner.partition, %earliest, "schedule refresh requested");
        self.inner.wake.notify_one();
    }

    /// Snapshot a pending (not in-flight, not terminal) instance.
    pub async fn instance(&self, id: &str) -> Option<JobInstance> {
        self.inner.state.lock().await.jobs.get(id).cloned()
    }

    /// Number of instances in the working set.
    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.jobs.len()
    }
}

async fn run_loop(
    inner: Arc<SchedulerInner>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) -> bool {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    debug!(partition = %inner.partition, "partition loop running");

    let drain_timeout = loop {
        if let Some(timeout) = *shutdown_rx.borrow() {
            break timeout;
        }

        let sleep_for = inner.dispatch_due().await;

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = shutdown_rx.changed() => {}
            completion = completions.recv() => {
                if let Some(completion) = completion {
                    inner.apply_completion(completion).await;
                }
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }
    };

    let drained = inner.drain(&mut completions, drain_timeout).await;
    info!(partition = %inner.partition, drained, "partition loop stopped");
    drained
}

impl SchedulerInner {
    /// Dispatch everything due, in non-decreasing schedule-time order, and
    /// compute how long the loop may sleep.
    async fn dispatch_due(self: &Arc<Self>) -> Duration {
        let now = Utc::now();
        let mut terminal = Vec::new();

        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, String)> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now))
            .map(|job| (job.schedule_time, job.id.clone()))
            .collect();
        due.sort();

        for (_, id) in due {
            let decision = {
                let Some(job) = state.jobs.get(&id) else {
                    continue;
                };
                let in_flight = state.running.get(&id).copied().unwrap_or(0);
                decide(job, in_flight, now)
            };

            match decision {
                Decision::Skip => {}
                Decision::Deadline => {
                    if let Some(mut job) = state.jobs.remove(&id) {
                        job.state = JobState::DeadlineReached;
                        warn!(
                            partition = %self.partition,
                            id = %id,
                            "deadline passed, abandoning instance"
                        );
                        terminal.push(job);
                    }
                }
                Decision::DeferTo(target) => {
                    if let Some(job) = state.jobs.get_mut(&id) {
                        let dropped = job.mark_deferred(target);
                        debug!(
                            partition = %self.partition,
                            id = %id,
                            until = %target,
                            defer_count = job.defer_count,
                            "outside time frame, deferred"
                        );
                        if dropped {
                            warn!(
                                partition = %self.partition,
                                id = %id,
                                "defer budget exceeded, dropping instance"
                            );
                            if let Some(job) = state.jobs.remove(&id) {
                                terminal.push(job);
                            }
                        }
                    }
                }
                Decision::FailConfig(err) => {
                    if let Some(mut job) = state.jobs.remove(&id) {
                        job.state = JobState::Failed;
                        error!(
                            partition = %self.partition,
                            id = %id,
                            error = %err,
                            "time frames unsatisfiable, failing instance"
                        );
                        terminal.push(job);
                    }
                }
                Decision::Dispatch => {
                    let is_trigger = state
                        .jobs
                        .get(&id)
                        .is_some_and(|job| matches!(job.kind, JobKind::Trigger { .. }));

                    let snapshot = if is_trigger {
                        // A trigger stays in the working set: compute its
                        // next fire before dispatch so it remains scheduled
                        // while this execution is in flight.
                        state.jobs.get_mut(&id).map(|job| {
                            let snapshot = job.clone();
                            if let Some(schedule) = job.trigger_schedule() {
                                let ctx = ScheduleContext {
                                    last_scheduled_execution: Some(job.schedule_time),
                                    last_actual_execution: job.last_execution_time,
                                    last_completion: job.last_completion_time,
                                };
                                job.schedule_time = schedule.next_schedule(&ctx);
                            }
                            snapshot
                        })
                    } else {
                        state.jobs.remove(&id)
                    };

                    if let Some(mut snapshot) = snapshot {
                        *state.running.entry(id.clone()).or_insert(0) += 1;
                        snapshot.last_execution_time = Some(now);
                        self.spawn_execution(snapshot);
                    }
                }
            }
        }

        let next_due = state
            .jobs
            .values()
            .map(|job| job.schedule_time)
            .min();

        drop(state);

        for instance in &terminal {
            self.notify_terminal(instance);
        }

        match next_due {
            Some(next) => {
                let until = (next - now).num_milliseconds();
                if until <= 0 {
                    // Something stayed due (overlap suppression); retry on
                    // the next tick.
                    self.options.poll_interval
                } else {
                    Duration::from_millis(until as u64).min(self.options.poll_interval)
                }
            }
            None => self.options.poll_interval,
        }
    }

    /// Run one execution on its own task and route the outcome back.
    fn spawn_execution(self: &Arc<Self>, mut instance: JobInstance) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let started = instance.last_execution_time.unwrap_or_else(Utc::now);
            debug!(partition = %inner.partition, id = %instance.id, "executing instance");

            let mut outcome = Ok(());
            loop {
                match inner.processor.process(&mut instance).await {
                    Ok(Some(cursor)) => {
                        if matches!(instance.kind, JobKind::Fanout { .. }) {
                            // Keep re-invoking with the advanced cursor
                            // until the recipient set is exhausted.
                            instance.set_recipient_cursor(Some(cursor));
                        } else {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        outcome = Err(err);
                        break;
                    }
                }
            }

            let _ = inner.completion_tx.send(Completion {
                instance,
                started,
                outcome,
            });
        });
    }

    /// Interpret an execution outcome into a state transition.
    async fn apply_completion(&self, completion: Completion) {
        let Completion {
            mut instance,
            started,
            outcome,
        } = completion;
        let id = instance.id.clone();
        let is_trigger = matches!(instance.kind, JobKind::Trigger { .. });
        let mut terminal = Vec::new();

        {
            let mut state = self.state.lock().await;

            let remaining = state.running.get_mut(&id).map(|count| {
                *count -= 1;
                *count
            });
            if remaining == Some(0) {
                state.running.remove(&id);
            }

            match outcome {
                Ok(()) => {
                    if is_trigger {
                        if let Some(trigger) = state.jobs.get_mut(&id) {
                            trigger.last_execution_time = Some(started);
                            trigger.last_completion_time = Some(Utc::now());
                            debug!(
                                partition = %self.partition,
                                id = %id,
                                next = %trigger.schedule_time,
                                "trigger execution completed"
                            );
                        }
                    } else {
                        instance.state = JobState::Done;
                        instance.last_completion_time = Some(Utc::now());
                        debug!(partition = %self.partition, id = %id, "instance done");
                        terminal.push(instance);
                    }
                }
                Err(err) => {
                    self.apply_failure(&mut state, instance, is_trigger, err, &mut terminal);
                }
            }
        }

        for instance in &terminal {
            self.notify_terminal(instance);
        }

        // A deferred instance may already be due again.
        self.wake.notify_one();
    }

    fn apply_failure(
        &self,
        state: &mut PartitionState,
        mut instance: JobInstance,
        is_trigger: bool,
        err: ExecutionError,
        terminal: &mut Vec<JobInstance>,
    ) {
        let id = instance.id.clone();

        let delay = match &err {
            ExecutionError::Permanent { reason } => {
                error!(
                    partition = %self.partition,
                    id = %id,
                    reason = %reason,
                    "permanent failure"
                );
                if is_trigger {
                    if let Some(mut trigger) = state.jobs.remove(&id) {
                        trigger.state = JobState::Failed;
                        terminal.push(trigger);
                    }
                } else {
                    instance.state = JobState::Failed;
                    instance.last_completion_time = Some(Utc::now());
                    terminal.push(instance);
                }
                return;
            }
            ExecutionError::Temporary { reason, defer } => {
                let delay = (*defer).unwrap_or(self.options.default_backoff);
                warn!(
                    partition = %self.partition,
                    id = %id,
                    reason = %reason,
                    retry_in_ms = delay.as_millis() as u64,
                    "temporary failure, deferring"
                );
                delay
            }
            ExecutionError::RateLimited {
                reason,
                retry_after,
            } => {
                let delay = (*retry_after).unwrap_or(self.options.default_backoff);
                warn!(
                    partition = %self.partition,
                    id = %id,
                    reason = %reason,
                    retry_in_ms = delay.as_millis() as u64,
                    "rate limited by remote end, deferring"
                );
                delay
            }
        };

        let target =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);

        if is_trigger {
            // The trigger entry was already rescheduled at pickup; the
            // deferral overrides that with the backoff instant.
            if let Some(trigger) = state.jobs.get_mut(&id) {
                let dropped = trigger.mark_deferred(target);
                trigger.last_completion_time = Some(Utc::now());
                if dropped {
                    warn!(
                        partition = %self.partition,
                        id = %id,
                        "defer budget exceeded, dropping trigger"
                    );
                    if let Some(trigger) = state.jobs.remove(&id) {
                        terminal.push(trigger);
                    }
                }
            }
        } else {
            let dropped = instance.mark_deferred(target);
            instance.last_completion_time = Some(Utc::now());
            if dropped {
                warn!(
                    partition = %self.partition,
                    id = %id,
                    defer_count = instance.defer_count,
                    "defer budget exceeded, dropping instance"
                );
                terminal.push(instance);
            } else {
                state.jobs.insert(id, instance);
            }
        }
    }

    /// Wait for in-flight executions after shutdown was requested.
    async fn drain(
        &self,
        completions: &mut mpsc::UnboundedReceiver<Completion>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.state.lock().await.running.is_empty() {
                return true;
            }
            match tokio::time::timeout_at(deadline, completions.recv()).await {
                Ok(Some(completion)) => self.apply_completion(completion).await,
                Ok(None) => return self.state.lock().await.running.is_empty(),
                Err(_) => {
                    warn!(
                        partition = %self.partition,
                        "shutdown timeout with executions still in flight"
                    );
                    return false;
                }
            }
        }
    }

    fn notify_terminal(&self, instance: &JobInstance) {
        for listener in &self.options.listeners {
            listener.on_terminal(instance);
        }
    }
}

/// Decide what to do with a due instance.
fn decide(job: &JobInstance, in_flight: u32, now: DateTime<Utc>) -> Decision {
    if in_flight > 0 && !job.allow_overlap() {
        // Still executing; the instance stays due and is retried on the
        // next tick rather than dropped.
        return Decision::Skip;
    }

    if let Some(deadline) = job.config.deadline
        && now > deadline
    {
        return Decision::Deadline;
    }

    if !job.config.time_frames.contains(now) {
        let budget_spent = job.config.defer_budget_exhausted(job.defer_count);
        if budget_spent && !job.config.droppable {
            // The budget only buys waiting for a window; once spent the
            // instance runs unconditionally.
        } else {
            return match job.config.time_frames.earliest_instant(now) {
                Ok(target) => Decision::DeferTo(target),
                Err(err) => Decision::FailConfig(err),
            };
        }
    }

    Decision::Dispatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use herald_core::{
        IntervalSchedule, JobConfiguration, RecipientCursor, TimeFrame, TimeFrameSet,
    };

    /// Succeeds, counting invocations and recording instance ids in order.
    struct RecordingProcessor {
        calls: AtomicUsize,
        seen: StdMutex<Vec<String>>,
    }

    impl RecordingProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Processor for RecordingProcessor {
        async fn process(
            &self,
            instance: &mut JobInstance,
        ) -> Result<Option<RecipientCursor>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(instance.id.clone());
            Ok(None)
        }
    }

    /// Pops scripted outcomes, succeeding once the script is exhausted.
    struct ScriptedProcessor {
        script: StdMutex<VecDeque<ExecutionError>>,
        calls: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn new(script: Vec<ExecutionError>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Processor for ScriptedProcessor {
        async fn process(
            &self,
            _instance: &mut JobInstance,
        ) -> Result<Option<RecipientCursor>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(None),
            }
        }
    }

    /// Sleeps while tracking the peak number of concurrent executions.
    struct SlowProcessor {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowProcessor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Processor for SlowProcessor {
        async fn process(
            &self,
            _instance: &mut JobInstance,
        ) -> Result<Option<RecipientCursor>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    /// Collects terminal transitions.
    #[derive(Default)]
    struct CollectingListener {
        events: StdMutex<Vec<(String, JobState)>>,
    }

    impl CollectingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn terminal_state(&self, id: &str) -> Option<JobState> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|(event_id, _)| event_id == id)
                .map(|(_, state)| *state)
        }
    }

    impl JobListener for CollectingListener {
        fn on_terminal(&self, instance: &JobInstance) {
            self.events
                .lock()
                .unwrap()
                .push((instance.id.clone(), instance.state));
        }
    }

    fn fast_options(listener: &Arc<CollectingListener>) -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: Duration::from_millis(10),
            default_backoff: Duration::from_secs(60),
            listeners: vec![Arc::clone(listener) as Arc<dyn JobListener>],
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    /// A time-frame set whose window opens roughly an hour from now.
    fn closed_frame() -> TimeFrameSet {
        let start = Utc::now().time() + chrono::Duration::hours(1);
        let end = start + chrono::Duration::minutes(5);
        TimeFrameSet::new(vec![TimeFrame::new().with_times(start, end)])
    }

    #[tokio::test]
    async fn due_instance_runs_to_done() {
        let listener = CollectingListener::new();
        let processor = RecordingProcessor::new();
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new("report", "reports", JobConfiguration::new());
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();

        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::Done),
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(processor.calls(), 1);
        assert!(scheduler.instance(&id).await.is_none());
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn submit_rejects_wrong_partition_and_duplicates() {
        let listener = CollectingListener::new();
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            RecordingProcessor::new(),
            fast_options(&listener),
        );

        let foreign = JobInstance::new("report", "billing", JobConfiguration::new());
        assert!(matches!(
            scheduler.submit(foreign).await,
            Err(SchedulerError::WrongPartition { .. })
        ));

        let instance = JobInstance::new("report", "reports", JobConfiguration::new())
            .with_schedule_time(Utc::now() + chrono::Duration::hours(1));
        let duplicate = instance.clone();
        scheduler.submit(instance).await.unwrap();
        assert!(matches!(
            scheduler.submit(duplicate).await,
            Err(SchedulerError::InstanceExists(_))
        ));
    }

    #[tokio::test]
    async fn temporary_failure_defers_with_default_backoff() {
        let listener = CollectingListener::new();
        let processor = ScriptedProcessor::new(vec![ExecutionError::temporary("smtp down")]);
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new(
            "report",
            "reports",
            JobConfiguration::new().with_max_defer_count(3),
        );
        let id = instance.id.clone();
        let before = Utc::now();
        scheduler.submit(instance).await.unwrap();

        assert!(wait_until(|| processor.calls() == 1, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let deferred = scheduler.instance(&id).await.expect("instance requeued");
        assert_eq!(deferred.state, JobState::New);
        assert_eq!(deferred.defer_count, 1);
        let delay = deferred.schedule_time - before;
        assert!(delay >= chrono::Duration::seconds(59));
        assert!(delay <= chrono::Duration::seconds(62));
        assert!(listener.terminal_state(&id).is_none());
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn rate_limit_uses_explicit_delay_over_default() {
        let listener = CollectingListener::new();
        let processor = ScriptedProcessor::new(vec![ExecutionError::rate_limited_after(
            "throttled",
            Duration::from_millis(60_000),
        )]);
        let mut options = fast_options(&listener);
        options.default_backoff = Duration::from_secs(1);
        let scheduler =
            JobScheduler::new(PartitionKey::new("reports"), processor.clone(), options);
        scheduler.start().await;

        let instance = JobInstance::new("report", "reports", JobConfiguration::new());
        let id = instance.id.clone();
        let before = Utc::now();
        scheduler.submit(instance).await.unwrap();

        assert!(wait_until(|| processor.calls() == 1, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let deferred = scheduler.instance(&id).await.expect("instance requeued");
        let delay = deferred.schedule_time - before;
        assert!(delay >= chrono::Duration::seconds(59));
        assert!(delay <= chrono::Duration::seconds(62));
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal() {
        let listener = CollectingListener::new();
        let processor = ScriptedProcessor::new(vec![ExecutionError::permanent("bad payload")]);
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new("report", "reports", JobConfiguration::new());
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();

        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::Failed),
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(processor.calls(), 1);
        assert!(scheduler.instance(&id).await.is_none());
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn droppable_instance_drops_after_budget() {
        let listener = CollectingListener::new();
        // Every attempt fails recoverably with a tiny explicit delay, so the
        // instance cycles through deferral quickly.
        let processor = ScriptedProcessor::new(vec![
            ExecutionError::temporary_after("busy", Duration::from_millis(1)),
            ExecutionError::temporary_after("busy", Duration::from_millis(1)),
            ExecutionError::temporary_after("busy", Duration::from_millis(1)),
        ]);
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new(
            "report",
            "reports",
            JobConfiguration::new().droppable().with_max_defer_count(1),
        );
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();

        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::Dropped),
                Duration::from_secs(2)
            )
            .await
        );
        // First deferral is within budget, the second drops.
        assert_eq!(processor.calls(), 2);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unlimited_budget_never_drops() {
        let listener = CollectingListener::new();
        let processor = ScriptedProcessor::new(
            (0..20)
                .map(|_| ExecutionError::temporary_after("busy", Duration::from_millis(1)))
                .collect(),
        );
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance =
            JobInstance::new("report", "reports", JobConfiguration::new().droppable());
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();

        // Exhausts the 20 scripted failures and finally completes.
        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::Done),
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(processor.calls(), 21);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn deadline_reached_without_invoking_processor() {
        let listener = CollectingListener::new();
        let processor = RecordingProcessor::new();
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new(
            "report",
            "reports",
            JobConfiguration::new().with_deadline(Utc::now() - chrono::Duration::seconds(1)),
        );
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();

        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::DeadlineReached),
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(processor.calls(), 0);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn closed_time_frame_defers_without_invoking_processor() {
        let listener = CollectingListener::new();
        let processor = RecordingProcessor::new();
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new(
            "report",
            "reports",
            JobConfiguration::new().with_time_frames(closed_frame()),
        );
        let id = instance.id.clone();
        let before = Utc::now();
        scheduler.submit(instance).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let deferred = scheduler.instance(&id).await.expect("instance deferred");
        assert_eq!(deferred.defer_count, 1);
        assert!(deferred.schedule_time > before);
        assert_eq!(processor.calls(), 0);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn exhausted_budget_runs_unconditionally_outside_frame() {
        let listener = CollectingListener::new();
        let processor = RecordingProcessor::new();
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let mut instance = JobInstance::new(
            "report",
            "reports",
            JobConfiguration::new()
                .with_max_defer_count(0)
                .with_time_frames(closed_frame()),
        );
        // Budget already spent waiting for a window once.
        instance.defer_count = 1;
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();

        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::Done),
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(processor.calls(), 1);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn trigger_without_overlap_never_runs_concurrently() {
        let listener = CollectingListener::new();
        let processor = SlowProcessor::new(Duration::from_millis(80));
        let scheduler_options = SchedulerOptions {
            poll_interval: Duration::from_millis(10),
            default_backoff: Duration::from_secs(60),
            listeners: vec![Arc::clone(&listener) as Arc<dyn JobListener>],
        };

        let trigger = JobInstance::trigger(
            "sync",
            JobConfiguration::new(),
            Arc::new(IntervalSchedule::new(chrono::Duration::milliseconds(5))),
            false,
        );
        let id = trigger.id.clone();
        let scheduler = JobScheduler::new(
            trigger.partition_key.clone(),
            processor.clone(),
            scheduler_options,
        );
        scheduler.start().await;
        scheduler.submit(trigger).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        scheduler.stop(Duration::from_secs(1)).await;

        assert!(processor.calls() >= 2, "trigger should fire repeatedly");
        assert_eq!(processor.peak(), 1, "overlap must be suppressed");
        // The trigger survives as pending work.
        assert!(listener.terminal_state(&id).is_none());
    }

    #[tokio::test]
    async fn trigger_with_overlap_runs_concurrently() {
        let listener = CollectingListener::new();
        let processor = SlowProcessor::new(Duration::from_millis(120));
        let trigger = JobInstance::trigger(
            "sync",
            JobConfiguration::new(),
            Arc::new(IntervalSchedule::new(chrono::Duration::milliseconds(10))),
            true,
        );
        let scheduler = JobScheduler::new(
            trigger.partition_key.clone(),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;
        scheduler.submit(trigger).await.unwrap();

        assert!(wait_until(|| processor.peak() >= 2, Duration::from_secs(2)).await);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn dispatch_follows_schedule_time_order() {
        let listener = CollectingListener::new();
        let processor = RecordingProcessor::new();
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );

        let now = Utc::now();
        let mut expected = Vec::new();
        // Staggered due times, submitted out of order before the loop runs.
        for offset in [80, 20, 50] {
            let instance = JobInstance::new("report", "reports", JobConfiguration::new())
                .with_schedule_time(now + chrono::Duration::milliseconds(offset));
            expected.push((offset, instance.id.clone()));
            scheduler.submit(instance).await.unwrap();
        }
        expected.sort();
        let expected: Vec<String> = expected.into_iter().map(|(_, id)| id).collect();

        scheduler.start().await;
        assert!(wait_until(|| processor.calls() == 3, Duration::from_secs(2)).await);
        assert_eq!(processor.seen(), expected);
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn submit_wakes_a_long_polling_loop() {
        let listener = CollectingListener::new();
        let processor = RecordingProcessor::new();
        let options = SchedulerOptions {
            poll_interval: Duration::from_secs(10),
            default_backoff: Duration::from_secs(60),
            listeners: vec![Arc::clone(&listener) as Arc<dyn JobListener>],
        };
        let scheduler =
            JobScheduler::new(PartitionKey::new("reports"), processor.clone(), options);
        scheduler.start().await;

        // Give the loop time to park on its 10s poll.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let instance = JobInstance::new("report", "reports", JobConfiguration::new());
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();
        scheduler.refresh_schedules(Utc::now());

        assert!(
            wait_until(
                || listener.terminal_state(&id) == Some(JobState::Done),
                Duration::from_secs(1)
            )
            .await,
            "refresh must beat the poll interval"
        );
        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_drains_in_flight_work() {
        let listener = CollectingListener::new();
        let processor = SlowProcessor::new(Duration::from_millis(150));
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new("report", "reports", JobConfiguration::new());
        let id = instance.id.clone();
        scheduler.submit(instance).await.unwrap();
        assert!(wait_until(|| processor.calls() == 1, Duration::from_secs(2)).await);

        assert!(scheduler.stop(Duration::from_secs(2)).await);
        assert_eq!(listener.terminal_state(&id), Some(JobState::Done));
    }

    #[tokio::test]
    async fn stop_times_out_with_slow_execution() {
        let listener = CollectingListener::new();
        let processor = SlowProcessor::new(Duration::from_secs(5));
        let scheduler = JobScheduler::new(
            PartitionKey::new("reports"),
            processor.clone(),
            fast_options(&listener),
        );
        scheduler.start().await;

        let instance = JobInstance::new("report", "reports", JobConfiguration::new());
        scheduler.submit(instance).await.unwrap();
        assert!(wait_until(|| processor.calls() == 1, Duration::from_secs(2)).await);

        assert!(!scheduler.stop(Duration::from_millis(50)).await);
    }
}
