//! In-memory node used by unit tests: cluster, kubelet listing, NVML and
//! namespace operations backed by one shared state and a temporary cgroup
//! hierarchy.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tempfile::TempDir;

use crate::allocator::PlaceholderAllocator;
use crate::config::AllocatorConfig;
use crate::config::CgroupConfig;
use crate::config::CgroupDriverArg;
use crate::config::MounterConfig;
use crate::config::DEFAULT_POOL_NAMESPACE;
use crate::config::DEFAULT_RESOURCE_NAME;
use crate::device::DEFAULT_NVIDIA_MAJOR_NUMBER;
use crate::device::PLACEHOLDER_INFIX;
use crate::inventory::DeviceInventory;
use crate::liveness::LivenessGuard;
use crate::platform::kube::ClusterClient;
use crate::platform::kube::KubernetesError;
use crate::platform::namespace::DeviceNode;
use crate::platform::namespace::NamespaceError;
use crate::platform::namespace::NamespaceExecutor;
use crate::platform::nvml::DeviceIdentity;
use crate::platform::nvml::DeviceTelemetry;
use crate::platform::nvml::GpuProcess;
use crate::platform::nvml::TelemetryError;
use crate::platform::pod_resources::ListingError;
use crate::platform::pod_resources::ResourceAssignment;
use crate::platform::pod_resources::ResourceLister;
use crate::service::GpuMounter;
use crate::splicer::ContainerTarget;
use crate::splicer::DeviceSplicer;

pub const NODE_NAME: &str = "node-a";
const FIRST_PID: u32 = 1000;

/// How the fake scheduler treats newly created pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheduling {
    /// Bind a free GPU and run, or report Unschedulable when none is left.
    #[default]
    Running,
    /// Leave every pod pending without conditions.
    Pending,
}

#[derive(Debug, Clone)]
struct Assignment {
    pod_name: String,
    namespace: String,
    resource_name: String,
}

#[derive(Debug, Clone)]
struct GpuUser {
    uuid: String,
    procs: PathBuf,
}

struct State {
    pods: Vec<Pod>,
    assignments: BTreeMap<String, Assignment>,
    listing_available: bool,
    scheduling: Scheduling,
    creates_left: Option<usize>,
    device_nodes_left: Option<usize>,
    namespace_ops_fail: bool,
    pod_reads_fail: bool,
    termination_delay: Duration,
    terminating: BTreeMap<(String, String), Instant>,
    device_nodes: BTreeSet<PathBuf>,
    processes: BTreeMap<u32, GpuUser>,
    next_pid: u32,
}

impl State {
    fn allocate_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    fn position(&self, namespace: &str, name: &str) -> Option<usize> {
        self.pods.iter().position(|pod| {
            pod.metadata.namespace.as_deref() == Some(namespace)
                && pod.metadata.name.as_deref() == Some(name)
        })
    }

    fn remove_pod(&mut self, namespace: &str, name: &str) {
        if let Some(idx) = self.position(namespace, name) {
            self.pods.remove(idx);
        }
        self.assignments
            .retain(|_, a| !(a.pod_name == name && a.namespace == namespace));
    }

    /// Drops terminating pods whose grace period is over.
    fn reap(&mut self) {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .terminating
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for (namespace, name) in expired {
            self.terminating.remove(&(namespace.clone(), name.clone()));
            self.remove_pod(&namespace, &name);
        }
    }
}

pub struct FakeNode {
    devices: Vec<DeviceIdentity>,
    cgroup_root: TempDir,
    state: Mutex<State>,
}

/// A running consumer pod bound to `node-a`, not registered anywhere.
pub fn consumer_pod(name: &str, namespace: &str) -> Pod {
    consumer_pod_on(name, namespace, NODE_NAME)
}

fn consumer_pod_on(name: &str, namespace: &str, node_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            qos_class: Some("BestEffort".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                container_id: Some(format!("docker://cid-{name}")),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn remove_pid(procs: &Path, pid: u32) {
    let remaining: String = read_lines(procs)
        .into_iter()
        .filter(|line| line.trim() != pid.to_string())
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(procs, remaining).unwrap();
}

impl FakeNode {
    /// A node with `count` GPUs named `GPU-<i>` with minor number `i`.
    pub fn new(count: u32) -> Arc<Self> {
        let devices = (0..count)
            .map(|minor| DeviceIdentity {
                minor_number: minor,
                uuid: format!("GPU-{minor}"),
            })
            .collect();
        Arc::new(Self {
            devices,
            cgroup_root: tempfile::tempdir().unwrap(),
            state: Mutex::new(State {
                pods: Vec::new(),
                assignments: BTreeMap::new(),
                listing_available: true,
                scheduling: Scheduling::default(),
                creates_left: None,
                device_nodes_left: None,
                namespace_ops_fail: false,
                pod_reads_fail: false,
                termination_delay: Duration::ZERO,
                terminating: BTreeMap::new(),
                device_nodes: BTreeSet::new(),
                processes: BTreeMap::new(),
                next_pid: FIRST_PID,
            }),
        })
    }

    pub fn cgroup_root(&self) -> PathBuf {
        self.cgroup_root.path().to_path_buf()
    }

    /// Registers a running consumer and its container cgroup.
    pub fn add_consumer(&self, name: &str, namespace: &str) -> Pod {
        self.add_consumer_on(name, namespace, NODE_NAME)
    }

    pub fn add_consumer_on(&self, name: &str, namespace: &str, node_name: &str) -> Pod {
        let pod = consumer_pod_on(name, namespace, node_name);
        let uid = pod.metadata.uid.clone().unwrap();
        let mut state = self.state.lock().unwrap();

        let cgroup = self
            .cgroup_root
            .path()
            .join(format!("kubepods/besteffort/pod{uid}/cid-{name}"));
        std::fs::create_dir_all(&cgroup).unwrap();
        std::fs::write(cgroup.join("devices.allow"), "").unwrap();
        std::fs::write(cgroup.join("devices.deny"), "").unwrap();
        let init = state.allocate_pid();
        std::fs::write(cgroup.join("cgroup.procs"), format!("{init}\n")).unwrap();

        state.pods.push(pod.clone());
        pod
    }

    pub fn assign_device(&self, uuid: &str, pod_name: &str, namespace: &str) {
        self.assign_foreign_resource(uuid, pod_name, namespace, DEFAULT_RESOURCE_NAME);
    }

    pub fn assign_foreign_resource(
        &self,
        uuid: &str,
        pod_name: &str,
        namespace: &str,
        resource_name: &str,
    ) {
        self.state.lock().unwrap().assignments.insert(
            uuid.to_string(),
            Assignment {
                pod_name: pod_name.to_string(),
                namespace: namespace.to_string(),
                resource_name: resource_name.to_string(),
            },
        );
    }

    pub fn release_device(&self, uuid: &str) {
        self.state.lock().unwrap().assignments.remove(uuid);
    }

    pub fn set_listing_available(&self, available: bool) {
        self.state.lock().unwrap().listing_available = available;
    }

    pub fn set_scheduling(&self, scheduling: Scheduling) {
        self.state.lock().unwrap().scheduling = scheduling;
    }

    /// Pod creations after the first `n` fail.
    pub fn fail_creates_after(&self, n: usize) {
        self.state.lock().unwrap().creates_left = Some(n);
    }

    /// Device node creations after the first `n` fail.
    pub fn fail_device_node_after(&self, n: usize) {
        self.state.lock().unwrap().device_nodes_left = Some(n);
    }

    pub fn fail_namespace_ops(&self, fail: bool) {
        self.state.lock().unwrap().namespace_ops_fail = fail;
    }

    /// Pod reads through the cluster client fail with a request error.
    pub fn fail_pod_reads(&self, fail: bool) {
        self.state.lock().unwrap().pod_reads_fail = fail;
    }

    /// Deletions without a zero grace period leave the pod terminating for
    /// `delay` before it is gone.
    pub fn set_termination_delay(&self, delay: Duration) {
        self.state.lock().unwrap().termination_delay = delay;
    }

    /// Replaces a control file of the container's cgroup with a directory,
    /// so every write to it fails.
    pub fn break_cgroup_file(&self, target: &ContainerTarget, file: &str) {
        let path = target.cgroup.path().join(file);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
    }

    /// Placeholder pods of the consumer in creation order.
    pub fn placeholders_of(&self, consumer: &str) -> Vec<String> {
        let prefix = format!("{consumer}{PLACEHOLDER_INFIX}");
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(DEFAULT_POOL_NAMESPACE))
            .filter_map(|pod| pod.metadata.name.clone())
            .filter(|name| name.starts_with(&prefix))
            .collect()
    }

    pub fn free_devices(&self) -> usize {
        let state = self.state.lock().unwrap();
        self.devices
            .iter()
            .filter(|device| !state.assignments.contains_key(&device.uuid))
            .count()
    }

    pub fn allow_rules(&self, target: &ContainerTarget) -> Vec<String> {
        read_lines(&target.cgroup.path().join("devices.allow"))
    }

    pub fn deny_rules(&self, target: &ContainerTarget) -> Vec<String> {
        read_lines(&target.cgroup.path().join("devices.deny"))
    }

    pub fn has_device_node(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .device_nodes
            .contains(Path::new(path))
    }

    /// Starts a process in the container that holds a context on the GPU.
    pub fn start_gpu_process(&self, target: &ContainerTarget, uuid: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        let pid = state.allocate_pid();
        let procs = target.cgroup.path().join("cgroup.procs");
        let mut lines = read_lines(&procs);
        lines.push(pid.to_string());
        std::fs::write(&procs, lines.join("\n") + "\n").unwrap();
        state.processes.insert(
            pid,
            GpuUser {
                uuid: uuid.to_string(),
                procs,
            },
        );
        pid
    }

    pub fn is_process_running(&self, pid: u32) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    pub fn splicer(self: &Arc<Self>) -> DeviceSplicer {
        let cgroup = CgroupConfig {
            root: self.cgroup_root(),
            driver: CgroupDriverArg::Cgroupfs,
        };
        DeviceSplicer::new(self.clone(), &cgroup, DEFAULT_NVIDIA_MAJOR_NUMBER)
    }

    /// A mount engine wired entirely to this node.
    pub fn mounter(self: &Arc<Self>) -> GpuMounter {
        let config = MounterConfig::new(NODE_NAME);
        let inventory = Arc::new(
            DeviceInventory::new(&**self, self.clone(), &config).unwrap(),
        );
        let allocator = PlaceholderAllocator::new(
            self.clone(),
            inventory.clone(),
            AllocatorConfig {
                poll_interval: Duration::from_millis(5),
                claim_timeout: Duration::from_secs(2),
                release_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        );
        GpuMounter::new(
            self.clone(),
            inventory,
            allocator,
            self.splicer(),
            LivenessGuard::new(self.clone()),
            config,
        )
    }

    fn schedule(&self, state: &mut State, pod: &mut Pod, namespace: &str, name: &str) {
        let status = pod.status.get_or_insert_with(PodStatus::default);
        status.phase = Some("Pending".to_string());
        if state.scheduling == Scheduling::Pending {
            return;
        }

        let free = self
            .devices
            .iter()
            .find(|device| !state.assignments.contains_key(&device.uuid));
        match free {
            Some(device) => {
                state.assignments.insert(
                    device.uuid.clone(),
                    Assignment {
                        pod_name: name.to_string(),
                        namespace: namespace.to_string(),
                        resource_name: DEFAULT_RESOURCE_NAME.to_string(),
                    },
                );
                status.phase = Some("Running".to_string());
            }
            None => {
                status.conditions = Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("0/1 nodes are available: 1 Insufficient nvidia.com/gpu.".to_string()),
                    ..Default::default()
                }]);
            }
        }
    }
}

fn not_found(namespace: &str, name: &str) -> Report<KubernetesError> {
    Report::new(KubernetesError::NotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    })
}

#[async_trait]
impl ClusterClient for FakeNode {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        state.reap();
        if state.pod_reads_fail {
            return Err(Report::new(KubernetesError::RequestFailed {
                message: "etcdserver: request timed out".to_string(),
            }));
        }
        state
            .position(namespace, name)
            .map(|idx| state.pods[idx].clone())
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        if let Some(left) = state.creates_left.as_mut() {
            if *left == 0 {
                return Err(Report::new(KubernetesError::RequestFailed {
                    message: "admission webhook denied the request".to_string(),
                }));
            }
            *left -= 1;
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.uid = Some(format!("uid-{name}"));
        self.schedule(&mut state, &mut created, namespace, &name);
        state.pods.push(created.clone());
        Ok(created)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Report<KubernetesError>> {
        let mut state = self.state.lock().unwrap();
        state.reap();
        if state.position(namespace, name).is_none() {
            return Err(not_found(namespace, name));
        }
        if grace_period_seconds == Some(0) || state.termination_delay.is_zero() {
            state.remove_pod(namespace, name);
        } else {
            let deadline = Instant::now() + state.termination_delay;
            state
                .terminating
                .entry((namespace.to_string(), name.to_string()))
                .or_insert(deadline);
        }
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let (key, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        let mut state = self.state.lock().unwrap();
        state.reap();
        Ok(state
            .pods
            .iter()
            .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(key))
                    .is_some_and(|v| v == value)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResourceLister for FakeNode {
    async fn list_assignments(&self) -> Result<Vec<ResourceAssignment>, Report<ListingError>> {
        let mut state = self.state.lock().unwrap();
        state.reap();
        if !state.listing_available {
            return Err(Report::new(ListingError::ConnectionFailed {
                message: "connection refused".to_string(),
            }));
        }
        Ok(state
            .assignments
            .iter()
            .map(|(uuid, a)| ResourceAssignment {
                pod_name: a.pod_name.clone(),
                namespace: a.namespace.clone(),
                resource_name: a.resource_name.clone(),
                device_ids: vec![uuid.clone()],
            })
            .collect())
    }
}

impl DeviceTelemetry for FakeNode {
    fn devices(&self) -> Result<Vec<DeviceIdentity>, Report<TelemetryError>> {
        Ok(self.devices.clone())
    }

    fn active_processes(&self, uuid: &str) -> Result<Vec<GpuProcess>, Report<TelemetryError>> {
        if !self.devices.iter().any(|device| device.uuid == uuid) {
            return Err(Report::new(TelemetryError::QueryFailed {
                message: format!("no GPU with uuid {uuid}"),
            }));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .processes
            .iter()
            .filter(|(_, user)| user.uuid == uuid)
            .map(|(pid, _)| GpuProcess {
                pid: *pid,
                used_memory: None,
            })
            .collect())
    }
}

#[async_trait]
impl NamespaceExecutor for FakeNode {
    async fn create_device_node(
        &self,
        pid: u32,
        node: &DeviceNode,
    ) -> Result<(), Report<NamespaceError>> {
        let mut state = self.state.lock().unwrap();
        if state.namespace_ops_fail {
            return Err(Report::new(NamespaceError::EnterFailed { pid }));
        }
        if let Some(left) = state.device_nodes_left.as_mut() {
            if *left == 0 {
                return Err(Report::new(NamespaceError::CreateNodeFailed {
                    path: node.path.display().to_string(),
                }));
            }
            *left -= 1;
        }
        state.device_nodes.insert(node.path.clone());
        Ok(())
    }

    async fn remove_device_node(&self, pid: u32, path: &Path) -> Result<(), Report<NamespaceError>> {
        let mut state = self.state.lock().unwrap();
        if state.namespace_ops_fail {
            return Err(Report::new(NamespaceError::EnterFailed { pid }));
        }
        state.device_nodes.remove(path);
        Ok(())
    }

    async fn kill_processes(&self, pid: u32, pids: &[u32]) -> Result<(), Report<NamespaceError>> {
        let mut state = self.state.lock().unwrap();
        if state.namespace_ops_fail {
            return Err(Report::new(NamespaceError::EnterFailed { pid }));
        }
        for target in pids {
            if let Some(user) = state.processes.remove(target) {
                remove_pid(&user.procs, *target);
            }
        }
        Ok(())
    }
}
