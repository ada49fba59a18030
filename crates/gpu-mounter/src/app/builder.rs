use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::allocator::PlaceholderAllocator;
use crate::app::Application;
use crate::config::AllocatorConfig;
use crate::config::CgroupConfig;
use crate::config::MounterConfig;
use crate::config::WorkerArgs;
use crate::inventory::DeviceInventory;
use crate::liveness::LivenessGuard;
use crate::platform::kube::init_kube_client;
use crate::platform::kube::KubeClusterClient;
use crate::platform::namespace::MountNamespaceExecutor;
use crate::platform::nvml::NvmlTelemetry;
use crate::platform::pod_resources::KubeletResourceLister;
use crate::service::GpuMounter;
use crate::splicer::DeviceSplicer;

pub const KUBELET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Application builder
pub struct ApplicationBuilder {
    worker_args: WorkerArgs,
}

impl ApplicationBuilder {
    pub fn new(worker_args: WorkerArgs) -> Self {
        Self { worker_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let mounter_config = MounterConfig::from(&self.worker_args);
        let cgroup_config = CgroupConfig::from(&self.worker_args);
        let allocator_config = AllocatorConfig::from(&self.worker_args);

        let client = init_kube_client(self.worker_args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize kubernetes client: {e:?}"))?;
        let cluster = Arc::new(KubeClusterClient::new(client));

        let lister = Arc::new(KubeletResourceLister::new(
            self.worker_args.kubelet_socket_path.clone(),
            KUBELET_CONNECT_TIMEOUT,
        ));
        let telemetry = Arc::new(NvmlTelemetry::new());

        let inventory = Arc::new(
            DeviceInventory::new(telemetry.as_ref(), lister, &mounter_config)
                .map_err(|e| anyhow::anyhow!("Failed to initialize GPU inventory: {e:?}"))?,
        );
        let allocator =
            PlaceholderAllocator::new(cluster.clone(), inventory.clone(), allocator_config);
        let splicer = DeviceSplicer::new(
            Arc::new(MountNamespaceExecutor::default()),
            &cgroup_config,
            mounter_config.device_major,
        );
        let liveness = LivenessGuard::new(telemetry);

        let mounter = GpuMounter::new(
            cluster,
            inventory,
            allocator,
            splicer,
            liveness,
            mounter_config,
        );
        tracing::info!(
            node = %self.worker_args.node_name,
            "application components are ready"
        );

        Ok(Application {
            mounter: Arc::new(mounter),
            worker_args: self.worker_args,
        })
    }
}
