//! Device splicer.
//!
//! Grants and revokes access to one GPU for one running container by editing
//! its devices cgroup and the device node inside its mount namespace.

use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::config::CgroupConfig;
use crate::device::Device;
use crate::device::DEFAULT_CGROUP_PERMISSION;
use crate::device::DEFAULT_DEVICE_FILE_MODE;
use crate::errors::MounterError;
use crate::errors::MounterResult;
use crate::platform::cgroup::container_cgroup_path;
use crate::platform::cgroup::CgroupDriver;
use crate::platform::cgroup::CgroupError;
use crate::platform::cgroup::ContainerId;
use crate::platform::cgroup::DeviceCgroup;
use crate::platform::cgroup::DeviceRule;
use crate::platform::cgroup::QosClass;
use crate::platform::namespace::DeviceNode;
use crate::platform::namespace::NamespaceExecutor;

/// The container devices are spliced into, the first container of the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerTarget {
    pub pod_name: String,
    pub namespace: String,
    pub container_id: ContainerId,
    pub cgroup: DeviceCgroup,
}

impl std::fmt::Display for ContainerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.pod_name, self.container_id)
    }
}

impl ContainerTarget {
    /// Resident process ids of the container.
    pub fn pids(&self) -> MounterResult<Vec<u32>> {
        self.cgroup.pids().change_context_lazy(|| self.unresolved())
    }

    fn representative_pid(&self) -> MounterResult<u32> {
        self.cgroup
            .representative_pid()
            .change_context_lazy(|| self.unresolved())
    }

    fn unresolved(&self) -> MounterError {
        MounterError::CgroupPathUnresolved {
            reason: format!(
                "cannot read processes of {}",
                self.cgroup.path().display()
            ),
        }
    }
}

pub struct DeviceSplicer {
    executor: Arc<dyn NamespaceExecutor>,
    cgroup_root: PathBuf,
    driver: CgroupDriver,
    device_major: u32,
}

impl DeviceSplicer {
    pub fn new(
        executor: Arc<dyn NamespaceExecutor>,
        cgroup: &CgroupConfig,
        device_major: u32,
    ) -> Self {
        let driver = cgroup.resolve_driver();
        info!(?driver, root = %cgroup.root.display(), "using devices cgroup");
        Self {
            executor,
            cgroup_root: cgroup.root.clone(),
            driver,
            device_major,
        }
    }

    /// Locates the devices cgroup of the pod's first container.
    pub fn resolve(&self, pod: &Pod) -> MounterResult<ContainerTarget> {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();

        let raw_id = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| statuses.first())
            .and_then(|status| status.container_id.clone())
            .ok_or_else(|| {
                Report::new(MounterError::InvalidRequest {
                    message: format!("pod {namespace}/{pod_name} has no running container"),
                })
            })?;
        let pod_uid = pod.metadata.uid.as_deref().ok_or_else(|| {
            Report::new(MounterError::CgroupPathUnresolved {
                reason: format!("pod {namespace}/{pod_name} has no uid"),
            })
        })?;

        let unresolved = |e: Report<CgroupError>| {
            let reason = e.current_context().to_string();
            e.change_context(MounterError::CgroupPathUnresolved { reason })
        };
        let container_id = ContainerId::parse(&raw_id).map_err(unresolved)?;
        let qos = QosClass::of_pod(pod).map_err(unresolved)?;
        let path =
            container_cgroup_path(self.driver, qos, pod_uid, &container_id).map_err(unresolved)?;

        Ok(ContainerTarget {
            pod_name,
            namespace,
            container_id,
            cgroup: DeviceCgroup::new(&self.cgroup_root, &path),
        })
    }

    fn rule(&self, device: &Device) -> DeviceRule {
        DeviceRule {
            major: self.device_major,
            minor: device.minor_number,
            permission: DEFAULT_CGROUP_PERMISSION.to_string(),
        }
    }

    fn write_failed(target: &ContainerTarget) -> MounterError {
        MounterError::CgroupWriteFailed {
            path: target.cgroup.path().display().to_string(),
        }
    }

    /// Allows the device in the container's cgroup and creates its node.
    #[tracing::instrument(skip_all, fields(container = %target, device = %device))]
    pub async fn grant(&self, target: &ContainerTarget, device: &Device) -> MounterResult<()> {
        target
            .cgroup
            .allow(&self.rule(device))
            .change_context_lazy(|| Self::write_failed(target))?;

        let pid = target.representative_pid()?;
        let node = DeviceNode {
            path: device.device_path().to_path_buf(),
            major: self.device_major,
            minor: device.minor_number,
            mode: DEFAULT_DEVICE_FILE_MODE,
        };
        self.executor
            .create_device_node(pid, &node)
            .await
            .change_context(MounterError::NamespaceOpFailed { pid })?;

        info!(pid, "GPU granted");
        Ok(())
    }

    /// Denies the device, removes its node and, when forced, kills the
    /// processes still holding it open.
    #[tracing::instrument(skip_all, fields(container = %target, device = %device, force))]
    pub async fn revoke(
        &self,
        target: &ContainerTarget,
        device: &Device,
        active_users: &[u32],
        force: bool,
    ) -> MounterResult<()> {
        if !active_users.is_empty() && !force {
            return Err(Report::new(MounterError::DeviceBusy {
                uuid: device.uuid.clone(),
                pids: active_users.to_vec(),
            }));
        }

        target
            .cgroup
            .deny(&self.rule(device))
            .change_context_lazy(|| Self::write_failed(target))?;

        let pid = target.representative_pid()?;
        self.executor
            .remove_device_node(pid, device.device_path())
            .await
            .change_context(MounterError::NamespaceOpFailed { pid })?;

        if !active_users.is_empty() {
            info!(pids = ?active_users, "killing processes using GPU");
            self.executor
                .kill_processes(pid, active_users)
                .await
                .change_context(MounterError::NamespaceOpFailed { pid })?;
        }

        info!(pid, "GPU revoked");
        Ok(())
    }
}
