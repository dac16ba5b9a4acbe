use std::sync::Arc;
use std::time::Duration;

use common::config::ImporterConfig;
use queue::JobQueue;
use tracing::{info, warn};

use crate::job::ImportJob;
use crate::pipeline::ImportPipeline;

/// Pulls import jobs off the queue with a fixed number of concurrent slots.
/// Each job gets a hard deadline; a timed-out or failed run is nacked so the
/// queue can retry it with backoff.
pub struct ImportWorker {
    pipeline: Arc<ImportPipeline>,
    queue: Arc<dyn JobQueue<ImportJob>>,
    concurrency: usize,
    job_timeout: Duration,
}

impl ImportWorker {
    pub fn new(
        pipeline: Arc<ImportPipeline>,
        queue: Arc<dyn JobQueue<ImportJob>>,
        config: &ImporterConfig,
    ) -> Self {
        Self {
            pipeline,
            queue,
            concurrency: config.worker_concurrency,
            job_timeout: Duration::from_secs(config.job_timeout_secs),
        }
    }

    /// Runs until the queue is closed and drained.
    pub async fn run(&self) {
        let slots = (0..self.concurrency).map(|slot| self.run_slot(slot));
        futures::future::join_all(slots).await;
    }

    async fn run_slot(&self, slot: usize) {
        while let Some(job) = self.queue.claim().await {
            let ImportJob {
                repository_id,
                days,
            } = job.payload;
            info!(
                slot,
                job_id = %job.id,
                attempt = job.attempt,
                repository_id = %repository_id,
                "import job claimed"
            );

            let outcome = tokio::time::timeout(
                self.job_timeout,
                self.pipeline.import_historical_data(repository_id, days),
            )
            .await;

            match outcome {
                Ok(Ok(summary)) => {
                    info!(
                        slot,
                        job_id = %job.id,
                        commits = summary.commits,
                        change_requests = summary.change_requests,
                        issues = summary.issues,
                        stream_errors = summary.errors.len(),
                        "import job completed"
                    );
                    let output =
                        serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null);
                    if let Err(err) = self.queue.ack(job.id, output).await {
                        warn!(slot, job_id = %job.id, error = %err, "failed to ack import job");
                    }
                }
                Ok(Err(err)) => {
                    warn!(
                        slot,
                        job_id = %job.id,
                        attempt = job.attempt,
                        error = %err,
                        "import job failed"
                    );
                    if let Err(nack_err) = self.queue.nack(job.id, err.to_string()).await {
                        warn!(slot, job_id = %job.id, error = %nack_err, "failed to nack import job");
                    }
                }
                Err(_) => {
                    let message =
                        format!("import timed out after {}s", self.job_timeout.as_secs());
                    warn!(slot, job_id = %job.id, attempt = job.attempt, "import job timed out");
                    // The deadline dropped the pipeline future before it could
                    // record the failure itself.
                    self.pipeline.mark_import_failed(repository_id).await;
                    if let Err(nack_err) = self.queue.nack(job.id, message).await {
                        warn!(slot, job_id = %job.id, error = %nack_err, "failed to nack import job");
                    }
                }
            }
        }
        info!(slot, "queue closed, worker slot exiting");
    }
}
