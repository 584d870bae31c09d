use crate::runner::{PassOptions, PassRunner};
use harvest_core::NodeType;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// Runs harvesting passes on a cron schedule, never two at once.
pub struct PassScheduler {
    scheduler: Mutex<JobScheduler>,
    runner: Arc<PassRunner>,
    running: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

/// Guard for a new pass, unless shutting down or a pass is still running.
fn begin_pass<'a>(running: &'a Mutex<()>, shutdown: &CancellationToken) -> Option<MutexGuard<'a, ()>> {
    if shutdown.is_cancelled() {
        tracing::info!("Shutdown requested; not starting scheduled pass");
        return None;
    }
    match running.try_lock() {
        Ok(guard) => Some(guard),
        Err(_) => {
            tracing::warn!("Skipping scheduled pass: previous pass still running");
            None
        }
    }
}

impl PassScheduler {
    pub async fn new(runner: Arc<PassRunner>, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            runner,
            running: Arc::new(Mutex::new(())),
            shutdown,
        })
    }

    /// Held for the duration of a pass.
    pub fn running(&self) -> Arc<Mutex<()>> {
        self.running.clone()
    }

    pub async fn schedule(
        &self,
        cron_expression: &str,
        profile: &str,
        node_types: Vec<NodeType>,
    ) -> anyhow::Result<()> {
        let runner = self.runner.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let profile = profile.to_string();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let runner = runner.clone();
            let running = running.clone();
            let shutdown = shutdown.clone();
            let profile = profile.clone();
            let node_types = node_types.clone();
            Box::pin(async move {
                let Some(_guard) = begin_pass(&running, &shutdown) else {
                    return;
                };

                let job_id = uuid::Uuid::new_v4().to_string();
                tracing::info!(job_id = %job_id, profile = %profile, "Starting scheduled pass");
                let opts = PassOptions {
                    job_id: job_id.clone(),
                    profile,
                    node_types,
                };
                if let Err(e) = runner.run(opts).await {
                    tracing::error!(job_id = %job_id, error = %e, "Scheduled pass failed");
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Harvesting pass scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
