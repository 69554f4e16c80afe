use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::PullConfig;
use crate::controller::{ControllerError, JobController};

/// Build a scheduler that starts a pull on `PULL_CRON`, or `None` when unset.
///
/// The caller starts the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &PullConfig,
    controller: JobController,
) -> Result<Option<JobScheduler>> {
    let Some(cron) = config.pull_cron.as_deref() else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let controller = controller.clone();
        Box::pin(async move {
            match controller.start(None).await {
                Ok(state) => info!(run_id = ?state.run_id, "scheduled pull started"),
                Err(ControllerError::AlreadyRunning) => {
                    warn!("scheduled pull skipped; a pull is already running")
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "pull scheduler configured");
    Ok(Some(sched))
}
