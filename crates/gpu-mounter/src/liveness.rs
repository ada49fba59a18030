//! Process liveness guard.

use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use crate::device::Device;
use crate::errors::MounterError;
use crate::errors::MounterResult;
use crate::platform::nvml::DeviceTelemetry;
use crate::splicer::ContainerTarget;

pub struct LivenessGuard {
    telemetry: Arc<dyn DeviceTelemetry>,
}

impl LivenessGuard {
    pub fn new(telemetry: Arc<dyn DeviceTelemetry>) -> Self {
        Self { telemetry }
    }

    /// Processes of the container that currently use the device, sorted.
    ///
    /// Read only, an empty result means the device can be revoked.
    #[tracing::instrument(skip_all, fields(container = %target, uuid = %device.uuid))]
    pub async fn active_users(
        &self,
        target: &ContainerTarget,
        device: &Device,
    ) -> MounterResult<Vec<u32>> {
        let resident: BTreeSet<u32> = target.pids()?.into_iter().collect();

        let telemetry = self.telemetry.clone();
        let uuid = device.uuid.clone();
        let processes = tokio::task::spawn_blocking(move || telemetry.active_processes(&uuid))
            .await
            .map_err(|e| Report::new(MounterError::internal(format!("telemetry task failed: {e}"))))?
            .change_context_lazy(|| {
                MounterError::internal(format!("failed to list processes on GPU {}", device.uuid))
            })?;

        let users: BTreeSet<u32> = processes
            .iter()
            .map(|process| process.pid)
            .filter(|pid| resident.contains(pid))
            .collect();

        debug!(users = ?users, "active GPU users in container");
        Ok(users.into_iter().collect())
    }
}
