use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source used wherever the core waits on wall-clock time (rate-limit
/// pauses, inter-page delays). Tests substitute a fake to avoid real sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
