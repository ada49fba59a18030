//! Attach / detach orchestration.

use std::collections::BTreeSet;
use std::sync::Arc;

use api_types::AttachRequest;
use api_types::DetachRequest;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::allocator::Claim;
use crate::allocator::PlaceholderAllocator;
use crate::config::MounterConfig;
use crate::device::Device;
use crate::errors::MounterError;
use crate::errors::MounterResult;
use crate::inventory::DeviceInventory;
use crate::liveness::LivenessGuard;
use crate::mount_type::can_mount;
use crate::mount_type::classify;
use crate::mount_type::classify_devices;
use crate::mount_type::MountType;
use crate::platform::kube::is_not_found;
use crate::platform::kube::ClusterClient;
use crate::splicer::ContainerTarget;
use crate::splicer::DeviceSplicer;
use crate::util::keyed_lock::KeyedAsyncLock;

pub struct GpuMounter {
    cluster: Arc<dyn ClusterClient>,
    inventory: Arc<DeviceInventory>,
    allocator: PlaceholderAllocator,
    splicer: DeviceSplicer,
    liveness: LivenessGuard,
    config: MounterConfig,
    locks: KeyedAsyncLock<(String, String)>,
}

impl GpuMounter {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        inventory: Arc<DeviceInventory>,
        allocator: PlaceholderAllocator,
        splicer: DeviceSplicer,
        liveness: LivenessGuard,
        config: MounterConfig,
    ) -> Self {
        Self {
            cluster,
            inventory,
            allocator,
            splicer,
            liveness,
            config,
            locks: KeyedAsyncLock::new(),
        }
    }

    async fn consumer(&self, name: &str, namespace: &str) -> MounterResult<Pod> {
        if name.is_empty() || namespace.is_empty() {
            return Err(Report::new(MounterError::InvalidRequest {
                message: "pod name and namespace are required".to_string(),
            }));
        }
        match self.cluster.get_pod(namespace, name).await {
            Ok(pod) => Ok(pod),
            Err(report) if is_not_found(&report) => {
                Err(report.change_context(MounterError::ConsumerNotFound {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }))
            }
            Err(report) => Err(report.change_context(MounterError::internal(format!(
                "failed to read pod {namespace}/{name}"
            )))),
        }
    }

    fn ensure_local(&self, pod: &Pod) -> MounterResult<()> {
        let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref());
        match node_name {
            Some(node) if node == self.config.node_name => Ok(()),
            Some(node) => Err(Report::new(MounterError::InvalidRequest {
                message: format!(
                    "pod runs on node {node}, this worker manages {}",
                    self.config.node_name
                ),
            })),
            None => Err(Report::new(MounterError::InvalidRequest {
                message: "pod is not bound to a node".to_string(),
            })),
        }
    }

    /// Claims `gpu_num` GPUs and splices them into the pod's container.
    #[tracing::instrument(skip_all, fields(pod = %request.pod_name, namespace = %request.namespace, gpu_num = request.gpu_num, entire_mount = request.entire_mount))]
    pub async fn attach(&self, request: &AttachRequest) -> MounterResult<Vec<Device>> {
        let key = (request.namespace.clone(), request.pod_name.clone());
        let _guard = self.locks.lock(&key).await;

        let consumer = self.consumer(&request.pod_name, &request.namespace).await?;
        if request.gpu_num == 0 {
            return Err(Report::new(MounterError::InvalidRequest {
                message: "gpu_num must be greater than zero".to_string(),
            }));
        }
        self.ensure_local(&consumer)?;
        let target = self.splicer.resolve(&consumer)?;

        let mount_type = self
            .mount_type(&consumer, &request.pod_name, &request.namespace)
            .await;
        if !can_mount(mount_type, request.entire_mount) {
            warn!(%mount_type, "mount request rejected");
            return Err(Report::new(match mount_type {
                MountType::UnknownMount => MounterError::UnknownMountType,
                mount_type => MounterError::MountRejected { mount_type },
            }));
        }

        match self.allocator.sweep_stale(&consumer).await {
            Ok(0) => {}
            Ok(swept) => info!(swept, "removed stale placeholder pods"),
            Err(report) => warn!("failed to sweep stale placeholder pods: {report:?}"),
        }

        let claims = self
            .allocator
            .claim(&consumer, request.gpu_num as usize)
            .await?;

        let mut spliced: Vec<&Device> = Vec::with_capacity(claims.len());
        for (idx, claim) in claims.iter().enumerate() {
            info!(total = claims.len(), current = idx + 1, device = %claim.device, "mounting GPU");
            if let Err(report) = self.splicer.grant(&target, &claim.device).await {
                error!(device = %claim.device, "failed to mount GPU: {report:?}");
                // the failed device may be half granted
                spliced.push(&claim.device);
                self.unwind(&target, &spliced, &claims).await;
                return Err(report);
            }
            spliced.push(&claim.device);
        }

        info!("successfully mounted all GPUs");
        Ok(claims.into_iter().map(|claim| claim.device).collect())
    }

    /// Mount posture of the consumer, counting only the placeholders whose
    /// owner reference is this very pod.
    async fn mount_type(&self, consumer: &Pod, name: &str, namespace: &str) -> MountType {
        match self.allocator.placeholders_of(consumer).await {
            Ok(placeholders) => classify(&self.inventory, name, namespace, &placeholders).await,
            Err(report) => {
                warn!(pod = name, namespace, "failed to list placeholder pods: {report:?}");
                MountType::UnknownMount
            }
        }
    }

    /// Reverses spliced devices in LIFO order and releases every claim.
    async fn unwind(&self, target: &ContainerTarget, spliced: &[&Device], claims: &[Claim]) {
        for device in spliced.iter().rev() {
            if let Err(report) = self.splicer.revoke(target, device, &[], false).await {
                error!(device = %device, "failed to undo GPU mount: {report:?}");
            }
        }
        let placeholders: Vec<String> = claims.iter().map(|c| c.placeholder.clone()).collect();
        if let Err(report) = self.allocator.release(&placeholders).await {
            error!(?placeholders, "failed to release placeholder pods: {report:?}");
        }
    }

    /// Revokes the requested GPUs from the pod's container and releases
    /// their placeholders.
    ///
    /// Every device is probed before anything is changed, so a busy device
    /// without `force` leaves the container untouched.
    #[tracing::instrument(skip_all, fields(pod = %request.pod_name, namespace = %request.namespace, force = request.force))]
    pub async fn detach(&self, request: &DetachRequest) -> MounterResult<Vec<Device>> {
        let key = (request.namespace.clone(), request.pod_name.clone());
        let _guard = self.locks.lock(&key).await;

        let consumer = self.consumer(&request.pod_name, &request.namespace).await?;
        let requested: BTreeSet<&str> = request
            .uuids
            .iter()
            .map(|uuid| uuid.trim())
            .filter(|uuid| !uuid.is_empty())
            .collect();
        if requested.is_empty() {
            return Err(Report::new(MounterError::InvalidRequest {
                message: "at least one GPU uuid is required".to_string(),
            }));
        }
        let target = self.splicer.resolve(&consumer)?;

        let removable = self
            .removable_devices(&consumer, &request.pod_name, &request.namespace, &requested)
            .await?;

        let mut probed = Vec::with_capacity(removable.len());
        for device in removable {
            let users = self.liveness.active_users(&target, &device).await?;
            if !users.is_empty() && !request.force {
                info!(uuid = %device.uuid, pids = ?users, "GPU is busy");
                return Err(Report::new(MounterError::DeviceBusy {
                    uuid: device.uuid.clone(),
                    pids: users,
                }));
            }
            probed.push((device, users));
        }

        let mut removed = Vec::with_capacity(probed.len());
        let mut revoked = Ok(());
        for (device, users) in probed {
            if let Err(report) = self
                .splicer
                .revoke(&target, &device, &users, request.force)
                .await
            {
                revoked = Err(report);
                break;
            }
            info!(device = %device, "successfully unmounted GPU");
            removed.push(device);
        }

        // placeholders of revoked devices go away together
        let placeholders: Vec<String> = removed
            .iter()
            .filter_map(|device| device.owner.as_ref())
            .map(|owner| owner.name.clone())
            .collect();
        let released = self.allocator.release(&placeholders).await;
        if let Err(report) = revoked {
            if let Err(release_report) = released {
                error!(?placeholders, "failed to release placeholder pods: {release_report:?}");
            }
            return Err(report);
        }
        released?;
        Ok(removed)
    }

    /// Devices held by the consumer's placeholders that match the request.
    ///
    /// An entire mounted consumer gives up all of its placeholder devices at
    /// once; in both cases the request must name exactly that set.
    async fn removable_devices(
        &self,
        consumer: &Pod,
        name: &str,
        namespace: &str,
        requested: &BTreeSet<&str>,
    ) -> MounterResult<Vec<Device>> {
        let placeholders = self.allocator.placeholders_of(consumer).await?;
        let snapshot = self.inventory.refresh().await?;
        let owned = self
            .inventory
            .owned_by(&snapshot, name, namespace, &placeholders);
        let entire = classify_devices(&owned, name, namespace) == MountType::EntireMount;

        let removable: Vec<Device> = owned
            .into_iter()
            .filter(|device| !device.is_owned_by(name, namespace))
            .filter(|device| entire || requested.contains(device.uuid.as_str()))
            .collect();

        let matched: BTreeSet<&str> = removable.iter().map(|d| d.uuid.as_str()).collect();
        if matched != *requested {
            let mut unknown: Vec<String> = requested
                .difference(&matched)
                .map(|uuid| uuid.to_string())
                .collect();
            if unknown.is_empty() {
                unknown = requested.iter().map(|uuid| uuid.to_string()).collect();
            }
            return Err(Report::new(MounterError::DeviceNotFound { uuids: unknown }));
        }
        Ok(removable)
    }

    /// All devices of the node with their current owners.
    pub async fn inventory(&self) -> MounterResult<Vec<Device>> {
        let snapshot = self.inventory.refresh().await?;
        let mut devices: Vec<Device> = snapshot.into_values().collect();
        devices.sort_by_key(|device| device.minor_number);
        Ok(devices)
    }
}
