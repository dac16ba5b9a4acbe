use std::sync::Arc;
use std::time::Duration;

use common::{logging, AppConfig, Clock, SystemClock};
use db::pg::PgDatabase;
use db::{Database, SyncStatus};
use gh_client::{ConfigCredentialService, CredentialService, HostClientFactory, RestClientFactory};
use importer::{ImportJob, ImportPipeline, ImportWorker};
use queue::{InProcessQueue, JobQueue, RetryPolicy};
use tracing::info;
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging("info");
    let config = AppConfig::load()?;

    let pg = PgDatabase::connect(&config.database.url).await?;
    let db: Arc<dyn Database> = Arc::new(pg);

    let credentials: Arc<dyn CredentialService> =
        Arc::new(ConfigCredentialService::from_config(&config.github));
    let base = Url::parse(&config.github.api_base)?;
    let clients: Arc<dyn HostClientFactory> = Arc::new(RestClientFactory::new(
        base,
        config.github.user_agent.clone(),
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue: Arc<InProcessQueue<ImportJob>> = Arc::new(InProcessQueue::new(
        Duration::from_secs(config.queue.stalled_after_secs),
    ));

    let pipeline = Arc::new(ImportPipeline::new(
        db.clone(),
        credentials,
        clients,
        clock,
        config.importer.clone(),
    ));

    // The in-process queue loses jobs on restart, so repositories that
    // connected but never started importing are re-enqueued here.
    let policy = RetryPolicy {
        max_attempts: config.queue.max_attempts,
        backoff_base: Duration::from_secs(config.queue.backoff_base_secs),
        backoff_max: Duration::from_secs(config.queue.backoff_max_secs),
        jitter_frac: config.queue.jitter_frac,
    };
    let pending = db
        .repositories()
        .list_by_status(SyncStatus::Pending)
        .await?;
    for repo in &pending {
        queue
            .enqueue(
                ImportJob {
                    repository_id: repo.id,
                    days: config.connector.import_days,
                },
                policy,
            )
            .await?;
    }
    info!(count = pending.len(), "re-enqueued pending repositories");

    let worker = ImportWorker::new(pipeline, queue, &config.importer);
    info!(
        concurrency = config.importer.worker_concurrency,
        "import worker started"
    );
    worker.run().await;
    Ok(())
}
