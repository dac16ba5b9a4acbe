use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue payload for one historical import run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImportJob {
    pub repository_id: Uuid,
    /// Lookback window in days, counted back from the start of today (UTC).
    pub days: u32,
}
