pub mod backoff;
pub mod queue;

pub use backoff::exponential_jitter_backoff;
pub use queue::{
    ClaimedJob, InProcessQueue, JobId, JobQueue, JobState, QueueError, RetryPolicy,
};
