use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::backoff::exponential_jitter_backoff;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_frac: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            jitter_frac: 0.2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("job {0} is not active")]
    NotActive(JobId),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone)]
pub struct ClaimedJob<P> {
    pub id: JobId,
    /// 1-based attempt number for this execution.
    pub attempt: u32,
    pub payload: P,
}

/// At-least-once work queue. A handler error (`nack`) re-schedules the job
/// with exponential backoff until `max_attempts` is burned; `ack` completes
/// it. Claimed jobs that are neither acked nor nacked are reclaimed after the
/// stall window without consuming an attempt.
#[async_trait]
pub trait JobQueue<P>: Send + Sync {
    async fn enqueue(&self, payload: P, policy: RetryPolicy) -> Result<JobId>;
    /// Awaits the next due job. Returns `None` once the queue is closed and
    /// drained.
    async fn claim(&self) -> Option<ClaimedJob<P>>;
    async fn ack(&self, id: JobId, output: serde_json::Value) -> Result<()>;
    async fn nack(&self, id: JobId, error: String) -> Result<()>;
    async fn state(&self, id: JobId) -> Option<JobState>;
    async fn close(&self);
}

struct Job<P> {
    payload: P,
    policy: RetryPolicy,
    attempts: u32,
    state: JobState,
    run_at: Instant,
    claimed_at: Option<Instant>,
    seq: u64,
    last_error: Option<String>,
    output: Option<serde_json::Value>,
}

struct QueueInner<P> {
    jobs: HashMap<JobId, Job<P>>,
    next_seq: u64,
    closed: bool,
}

/// Tokio-backed in-process implementation. Production deployments can swap a
/// persistent broker behind the same `JobQueue` trait.
pub struct InProcessQueue<P> {
    inner: Mutex<QueueInner<P>>,
    notify: Notify,
    stalled_after: Duration,
}

impl<P> InProcessQueue<P> {
    pub fn new(stalled_after: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            stalled_after,
        }
    }

    pub async fn last_error(&self, id: JobId) -> Option<String> {
        let guard = self.inner.lock().await;
        guard.jobs.get(&id).and_then(|job| job.last_error.clone())
    }

    pub async fn output(&self, id: JobId) -> Option<serde_json::Value> {
        let guard = self.inner.lock().await;
        guard.jobs.get(&id).and_then(|job| job.output.clone())
    }
}

impl<P> Default for InProcessQueue<P> {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> JobQueue<P> for InProcessQueue<P> {
    async fn enqueue(&self, payload: P, policy: RetryPolicy) -> Result<JobId> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Err(QueueError::Closed);
            }
            let seq = guard.next_seq;
            guard.next_seq += 1;
            guard.jobs.insert(
                id,
                Job {
                    payload,
                    policy,
                    attempts: 0,
                    state: JobState::Waiting,
                    run_at: Instant::now(),
                    claimed_at: None,
                    seq,
                    last_error: None,
                    output: None,
                },
            );
        }
        self.notify.notify_one();
        Ok(id)
    }

    async fn claim(&self) -> Option<ClaimedJob<P>> {
        loop {
            // Register for wakeups before inspecting state so a notify that
            // lands between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            let next_deadline = {
                let mut guard = self.inner.lock().await;
                let now = Instant::now();

                // Reclaim jobs whose worker died mid-processing. A stall is
                // not a handler failure, so attempts stay untouched.
                for job in guard.jobs.values_mut() {
                    if job.state == JobState::Active {
                        if let Some(claimed_at) = job.claimed_at {
                            if now.duration_since(claimed_at) >= self.stalled_after {
                                debug!(attempts = job.attempts, "reclaiming stalled job");
                                job.state = JobState::Waiting;
                                job.claimed_at = None;
                                job.run_at = now;
                                job.attempts = job.attempts.saturating_sub(1);
                            }
                        }
                    }
                }

                let candidate = guard
                    .jobs
                    .iter()
                    .filter(|(_, job)| job.state == JobState::Waiting && job.run_at <= now)
                    .min_by_key(|(_, job)| (job.run_at, job.seq))
                    .map(|(id, _)| *id);

                if let Some(id) = candidate {
                    if let Some(job) = guard.jobs.get_mut(&id) {
                        job.state = JobState::Active;
                        job.attempts += 1;
                        job.claimed_at = Some(now);
                        return Some(ClaimedJob {
                            id,
                            attempt: job.attempts,
                            payload: job.payload.clone(),
                        });
                    }
                }

                let pending = guard
                    .jobs
                    .values()
                    .any(|job| matches!(job.state, JobState::Waiting | JobState::Active));
                if guard.closed && !pending {
                    return None;
                }

                guard
                    .jobs
                    .values()
                    .filter_map(|job| match job.state {
                        JobState::Waiting => Some(job.run_at),
                        JobState::Active => job.claimed_at.map(|at| at + self.stalled_after),
                        _ => None,
                    })
                    .min()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, id: JobId, output: serde_json::Value) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let job = guard.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(id));
        }
        job.state = JobState::Completed;
        job.claimed_at = None;
        job.output = Some(output);
        drop(guard);
        // A terminal transition may leave the queue closed and drained, so
        // every parked claimer has to re-check, not just one.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, id: JobId, error: String) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let job = guard.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive(id));
        }
        job.last_error = Some(error);
        job.claimed_at = None;
        if job.attempts >= job.policy.max_attempts {
            job.state = JobState::Failed;
            drop(guard);
            self.notify.notify_waiters();
        } else {
            job.state = JobState::Waiting;
            let backoff = exponential_jitter_backoff(
                job.policy.backoff_base,
                job.attempts - 1,
                job.policy.backoff_max,
                job.policy.jitter_frac,
            );
            job.run_at = Instant::now() + backoff;
            drop(guard);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn state(&self, id: JobId) -> Option<JobState> {
        let guard = self.inner.lock().await;
        guard.jobs.get(&id).map(|job| {
            if job.state == JobState::Active {
                if let Some(claimed_at) = job.claimed_at {
                    if claimed_at.elapsed() >= self.stalled_after {
                        return JobState::Stalled;
                    }
                }
            }
            job.state
        })
    }

    async fn close(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.closed = true;
        }
        self.notify.notify_waiters();
    }
}
