use crate::error::{AdapterError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};
use uuid::Uuid;

/// Runs periodic discovery on a cron schedule.
pub struct DiscoveryScheduler {
    scheduler: JobScheduler,
    job: tokio::sync::Mutex<Option<Uuid>>,
}

fn scheduler_error(context: &str, e: impl std::fmt::Display) -> AdapterError {
    AdapterError::Config(format!("{}: {}", context, e))
}

impl DiscoveryScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| scheduler_error("failed to create scheduler", e))?;
        scheduler
            .start()
            .await
            .map_err(|e| scheduler_error("failed to start scheduler", e))?;
        debug!("scheduler started");

        Ok(Self {
            scheduler,
            job: tokio::sync::Mutex::new(None),
        })
    }

    /// Run `task` on every tick of the 6-field `cron` expression, replacing
    /// any schedule set before.
    pub async fn schedule<F, Fut>(&self, cron: &str, task: F) -> Result<Uuid>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = Arc::new(task);
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let task = task.clone();
            Box::pin(async move {
                debug!("scheduled discovery tick");
                task().await;
            })
        })
        .map_err(|e| scheduler_error(&format!("invalid discovery schedule {:?}", cron), e))?;

        let mut current = self.job.lock().await;
        if let Some(previous) = current.take() {
            self.scheduler
                .remove(&previous)
                .await
                .map_err(|e| scheduler_error("failed to remove job", e))?;
        }
        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| scheduler_error("failed to add job", e))?;
        *current = Some(job_id);

        info!(cron, job = %job_id, "periodic discovery scheduled");
        Ok(job_id)
    }

    pub async fn job_id(&self) -> Option<Uuid> {
        *self.job.lock().await
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| scheduler_error("failed to stop scheduler", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_cron_is_a_config_error() {
        let scheduler = DiscoveryScheduler::new().await.unwrap();
        let err = scheduler.schedule("every now and then", || async {}).await.unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
        assert!(scheduler.job_id().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reschedule_replaces_job() {
        let scheduler = DiscoveryScheduler::new().await.unwrap();
        let first = scheduler.schedule("0 */15 * * * *", || async {}).await.unwrap();
        let second = scheduler.schedule("0 0 * * * *", || async {}).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(scheduler.job_id().await, Some(second));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_job_fires() {
        let scheduler = DiscoveryScheduler::new().await.unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        scheduler
            .schedule("* * * * * *", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);
        scheduler.shutdown().await.unwrap();
    }
}
