//! Async completion waiter for long-running pipeline stages
//!
//! Suspends a scenario until a backend stage (GEM2S, QC) reaches a terminal
//! status or a per-stage deadline passes. Status is observed by polling a
//! [`StatusSource`] with backoff, optionally woken early by pushed
//! [`StatusUpdate`]s.
//!
//! ```text
//!            ┌──────────── Succeeded ──> Ok(WaitOutcome)
//! Pending ───┼──── Failed/Aborted/... ──> Err(PipelineFailed)
//!            └──────── deadline passed ──> Err(Timeout)
//! ```
//!
//! The waiter only inspects. It never mutates the job or retries the
//! operation that started it.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::pipeline::{JobId, JobStatus, PipelineStage, StatusUpdate};

/// Lower bound on the interval between two status checks
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline used when `start + timeout` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Something that can report the current status of a job
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self, job: &JobId) -> E2eResult<JobStatus>;
}

/// How long and how often to check a job
#[derive(Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    /// Maximum time to wait for a terminal status
    pub timeout: Duration,

    /// Interval before the second check
    pub poll_interval: Duration,

    /// Upper bound for the interval once backoff kicks in
    pub max_poll_interval: Duration,

    /// Multiplier applied to the interval after every pending check
    pub backoff: f64,

    /// Ignore polled terminal statuses until the job changed since arming.
    ///
    /// Set when the job is (re)launched after arming: a terminal status left
    /// over from a previous run must not count. Any polled or pushed status
    /// that differs from the one seen at arm time marks the job as changed.
    /// Pushed terminal updates always count.
    pub fresh_only: bool,
}

impl WaitPolicy {
    /// Default policy for a stage, using its expected duration as timeout
    pub fn for_stage(stage: PipelineStage) -> Self {
        Self {
            timeout: stage.default_timeout(),
            poll_interval: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(30),
            backoff: 1.5,
            fresh_only: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn fresh_only(mut self) -> Self {
        self.fresh_only = true;
        self
    }

    pub fn with_backoff(mut self, backoff: f64, max_poll_interval: Duration) -> Self {
        self.backoff = backoff;
        self.max_poll_interval = max_poll_interval;
        self
    }

    fn ceiling(&self) -> Duration {
        self.max_poll_interval.max(MIN_POLL_INTERVAL)
    }

    fn first_interval(&self) -> Duration {
        self.poll_interval.clamp(MIN_POLL_INTERVAL, self.ceiling())
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff.is_finite() && self.backoff >= 1.0 {
            self.backoff
        } else {
            1.0
        };
        Duration::try_from_secs_f64(current.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
            .clamp(MIN_POLL_INTERVAL, self.ceiling())
    }
}

/// Successful completion of a wait
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitOutcome {
    pub job: JobId,
    pub status: JobStatus,
    pub elapsed: Duration,
    /// Number of status checks performed, pushed updates excluded
    pub checks: usize,
}

/// Waits for pipeline stages to complete
#[derive(Clone)]
pub struct CompletionWaiter {
    source: Arc<dyn StatusSource>,
    updates: Option<broadcast::Sender<StatusUpdate>>,
}

impl CompletionWaiter {
    /// Create a waiter that only polls
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self { source, updates: None }
    }

    /// Also wake up on pushed status updates
    pub fn with_updates(mut self, updates: broadcast::Sender<StatusUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Start listening for a job before triggering it.
    ///
    /// Pushed updates sent after this call are delivered to the returned
    /// wait even if they arrive before [`ArmedWait::wait`] is awaited. With a
    /// `fresh_only` policy the current status is recorded as the baseline a
    /// new run has to move away from.
    pub async fn arm(&self, job: JobId, policy: WaitPolicy) -> E2eResult<ArmedWait> {
        let updates = self.updates.as_ref().map(|tx| tx.subscribe());
        let baseline = if policy.fresh_only {
            Some(self.source.status(&job).await?)
        } else {
            None
        };
        debug!(job = %job, ?baseline, "Arming completion waiter");

        Ok(ArmedWait {
            fresh: !policy.fresh_only,
            job,
            policy,
            source: Arc::clone(&self.source),
            updates,
            baseline,
        })
    }

    /// Wait for a job that was already triggered
    pub async fn wait(&self, job: JobId, policy: WaitPolicy) -> E2eResult<WaitOutcome> {
        self.arm(job, policy).await?.wait().await
    }

    /// Wait for a stage with its default policy
    pub async fn wait_for_stage(
        &self,
        experiment_id: &str,
        stage: PipelineStage,
    ) -> E2eResult<WaitOutcome> {
        self.wait(JobId::new(experiment_id, stage), WaitPolicy::for_stage(stage))
            .await
    }
}

/// A wait that is already subscribed to pushed updates
pub struct ArmedWait {
    job: JobId,
    policy: WaitPolicy,
    source: Arc<dyn StatusSource>,
    updates: Option<broadcast::Receiver<StatusUpdate>>,
    /// Status at arm time, when only fresh results count
    baseline: Option<JobStatus>,
    /// Whether the job changed since arming
    fresh: bool,
}

impl ArmedWait {
    pub fn job(&self) -> &JobId {
        &self.job
    }

    /// Block until the job is terminal or the policy's timeout elapses
    pub async fn wait(mut self) -> E2eResult<WaitOutcome> {
        let start = Instant::now();
        let deadline = start
            .checked_add(self.policy.timeout)
            .unwrap_or_else(|| start + FAR_FUTURE);
        let mut interval = self.policy.first_interval();
        let mut checks = 0;

        info!(job = %self.job, timeout = ?self.policy.timeout, "Waiting for pipeline stage");

        loop {
            checks += 1;
            let status = match timeout_at(deadline, self.source.status(&self.job)).await {
                Ok(status) => status?,
                Err(_) => return Err(self.timed_out(start)),
            };

            self.observe(&status);

            if status.is_terminal() && !self.fresh {
                debug!(job = %self.job, %status, "Ignoring terminal status from a previous run");
            } else if let Some(result) = self.settle(status, start, checks) {
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(start));
            }

            let next_check = now.checked_add(interval).map_or(deadline, |at| at.min(deadline));
            interval = self.policy.next_interval(interval);

            if let Some(pushed) = self.pushed_terminal(next_check).await {
                debug!(job = %self.job, status = %pushed, "Terminal status pushed");
                if let Some(result) = self.settle(pushed, start, checks) {
                    return result;
                }
            }
        }
    }

    /// Mark the wait fresh once the job leaves its arm-time status
    fn observe(&mut self, status: &JobStatus) {
        if !self.fresh && self.baseline.as_ref() != Some(status) {
            debug!(job = %self.job, %status, "Job changed since arming");
            self.fresh = true;
        }
    }

    /// Sleep until `until`, returning early with a pushed terminal status
    async fn pushed_terminal(&mut self, until: Instant) -> Option<JobStatus> {
        let Some(rx) = self.updates.as_mut() else {
            sleep_until(until).await;
            return None;
        };

        loop {
            match timeout_at(until, rx.recv()).await {
                Err(_) => return None,
                Ok(Ok(update)) if update.job == self.job => {
                    if update.status.is_terminal() {
                        return Some(update.status);
                    }
                    if !self.fresh && self.baseline.as_ref() != Some(&update.status) {
                        debug!(job = %self.job, status = %update.status, "Job changed since arming");
                        self.fresh = true;
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(job = %self.job, skipped, "Status updates lagged; relying on polling");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
            }
        }

        warn!(job = %self.job, "Status update channel closed; falling back to polling");
        self.updates = None;
        sleep_until(until).await;
        None
    }

    fn settle(
        &self,
        status: JobStatus,
        start: Instant,
        checks: usize,
    ) -> Option<E2eResult<WaitOutcome>> {
        if status.is_success() {
            let elapsed = start.elapsed();
            info!(job = %self.job, ?elapsed, checks, "Pipeline stage completed");
            Some(Ok(WaitOutcome {
                job: self.job.clone(),
                status,
                elapsed,
                checks,
            }))
        } else if status.is_failure() {
            warn!(job = %self.job, %status, "Pipeline stage failed");
            Some(Err(E2eError::PipelineFailed {
                job: self.job.clone(),
                status,
            }))
        } else {
            debug!(job = %self.job, %status, checks, "Pipeline stage still pending");
            None
        }
    }

    fn timed_out(&self, start: Instant) -> E2eError {
        let waited = start.elapsed();
        warn!(job = %self.job, ?waited, "Timed out waiting for pipeline stage");
        E2eError::Timeout {
            job: self.job.clone(),
            waited,
        }
    }
}
