use std::sync::Arc;

use anyhow::Result;

use crate::app::tasks::Tasks;
use crate::config::WorkerArgs;
use crate::service::GpuMounter;

/// Application core structure with explicit dependencies
pub struct Application {
    pub(crate) mounter: Arc<GpuMounter>,
    pub(crate) worker_args: WorkerArgs,
}

impl Application {
    pub fn mounter(&self) -> &Arc<GpuMounter> {
        &self.mounter
    }

    pub fn worker_args(&self) -> &WorkerArgs {
        &self.worker_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {e}");
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }
}
