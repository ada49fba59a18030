//! Placeholder allocator.
//!
//! GPU capacity is reserved by scheduling one placeholder pod per device on
//! the consumer's node. A monitor task polls the placeholders and reports a
//! single terminal outcome over a oneshot channel; the caller bounds the wait
//! and deletes whatever it created when the claim does not succeed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::AllocatorConfig;
use crate::device::Device;
use crate::device::Owner;
use crate::device::PLACEHOLDER_INFIX;
use crate::errors::MounterError;
use crate::errors::MounterResult;
use crate::inventory::DeviceInventory;
use crate::platform::kube::is_not_found;
use crate::platform::kube::ClusterClient;

pub const PLACEHOLDER_LABEL_KEY: &str = "app";
pub const PLACEHOLDER_LABEL_VALUE: &str = "gpu-pool";
const PLACEHOLDER_CONTAINER_NAME: &str = "gpu-container";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const UNSCHEDULABLE_REASON: &str = "Unschedulable";

/// Terminal result of the claim monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Running,
    Unschedulable { placeholder: String },
    Failed { message: String },
}

/// Terminal result of the release monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Deleted,
    Failed { message: String },
}

/// A device reserved through one placeholder pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub placeholder: String,
    pub device: Device,
}

/// Identity of the pod a claim is made for.
#[derive(Debug, Clone)]
struct Consumer {
    name: String,
    namespace: String,
    uid: String,
    node_name: String,
}

impl Consumer {
    fn from_pod(pod: &Pod) -> MounterResult<Self> {
        let metadata = &pod.metadata;
        let (Some(name), Some(namespace), Some(uid)) = (
            metadata.name.clone(),
            metadata.namespace.clone(),
            metadata.uid.clone(),
        ) else {
            return Err(Report::new(MounterError::internal(
                "consumer pod is missing name, namespace or uid",
            )));
        };
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .ok_or_else(|| {
                Report::new(MounterError::InvalidRequest {
                    message: format!("pod {namespace}/{name} is not bound to a node"),
                })
            })?;
        Ok(Self {
            name,
            namespace,
            uid,
            node_name,
        })
    }
}

pub struct PlaceholderAllocator {
    cluster: Arc<dyn ClusterClient>,
    inventory: Arc<DeviceInventory>,
    config: AllocatorConfig,
}

impl PlaceholderAllocator {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        inventory: Arc<DeviceInventory>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            cluster,
            inventory,
            config,
        }
    }

    /// Reserves `count` devices on the consumer's node, one placeholder each.
    ///
    /// Claims are returned in creation order. On any failure every
    /// placeholder created by this call is deleted before returning.
    #[tracing::instrument(skip(self, consumer), fields(pod = ?consumer.metadata.name, namespace = ?consumer.metadata.namespace))]
    pub async fn claim(&self, consumer: &Pod, count: usize) -> MounterResult<Vec<Claim>> {
        let consumer = Consumer::from_pod(consumer)?;

        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let placeholder = self.placeholder_pod(&consumer);
            let name = placeholder.metadata.name.clone().unwrap_or_default();
            match self
                .cluster
                .create_pod(&self.config.pool_namespace, &placeholder)
                .await
            {
                Ok(pod) => {
                    let name = pod.metadata.name.unwrap_or(name);
                    info!(placeholder = %name, "created placeholder pod");
                    created.push(name);
                }
                Err(report) => {
                    self.rollback(&created).await;
                    return Err(report.change_context(MounterError::CreateFailed {
                        message: format!("failed to create placeholder pod {name}"),
                    }));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(monitor_claim(
            self.cluster.clone(),
            self.config.pool_namespace.clone(),
            created.clone(),
            self.config.poll_interval,
            tx,
        ));

        let outcome = match tokio::time::timeout(self.config.claim_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ClaimOutcome::Failed {
                message: "claim monitor exited without a result".to_string(),
            },
            Err(_) => {
                warn!(placeholders = ?created, "placeholder claim timed out");
                self.rollback(&created).await;
                return Err(Report::new(MounterError::Timeout {
                    operation: "placeholder claim".to_string(),
                    after: self.config.claim_timeout,
                }));
            }
        };

        match outcome {
            ClaimOutcome::Running => {}
            ClaimOutcome::Unschedulable { placeholder } => {
                warn!(%placeholder, "insufficient GPU for placeholder pod");
                self.rollback(&created).await;
                return Err(Report::new(MounterError::InsufficientCapacity {
                    node: consumer.node_name,
                    requested: count,
                })
                .attach_printable(format!("placeholder {placeholder} is unschedulable")));
            }
            ClaimOutcome::Failed { message } => {
                self.rollback(&created).await;
                return Err(Report::new(MounterError::CreateFailed { message }));
            }
        }

        match self.resolve(&created).await {
            Ok(claims) => {
                info!(placeholders = ?created, "placeholder pods are running");
                Ok(claims)
            }
            Err(report) => {
                self.rollback(&created).await;
                Err(report)
            }
        }
    }

    async fn resolve(&self, placeholders: &[String]) -> MounterResult<Vec<Claim>> {
        let snapshot = self.inventory.refresh().await?;
        placeholders
            .iter()
            .map(|name| {
                DeviceInventory::held_by(&snapshot, name, &self.config.pool_namespace)
                    .map(|device| Claim {
                        placeholder: name.clone(),
                        device: device.clone(),
                    })
                    .ok_or_else(|| {
                        Report::new(MounterError::CreateFailed {
                            message: format!("placeholder pod {name} holds no GPU"),
                        })
                    })
            })
            .collect()
    }

    /// Deletes the placeholders and waits until all of them are gone.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, placeholders: &[String]) -> MounterResult<()> {
        if placeholders.is_empty() {
            return Ok(());
        }

        for name in placeholders {
            match self
                .cluster
                .delete_pod(&self.config.pool_namespace, name, None)
                .await
            {
                Ok(()) => debug!(placeholder = %name, "deleting placeholder pod"),
                Err(report) if is_not_found(&report) => {}
                Err(report) => {
                    return Err(report.change_context(MounterError::DeleteFailed {
                        message: format!("failed to delete placeholder pod {name}"),
                    }))
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(monitor_release(
            self.cluster.clone(),
            self.config.pool_namespace.clone(),
            placeholders.to_vec(),
            self.config.poll_interval,
            tx,
        ));

        match tokio::time::timeout(self.config.release_timeout, rx).await {
            Ok(Ok(ReleaseOutcome::Deleted)) => {
                info!(?placeholders, "placeholder pods deleted");
                Ok(())
            }
            Ok(Ok(ReleaseOutcome::Failed { message })) => {
                Err(Report::new(MounterError::DeleteFailed { message }))
            }
            Ok(Err(_)) => Err(Report::new(MounterError::DeleteFailed {
                message: "release monitor exited without a result".to_string(),
            })),
            Err(_) => Err(Report::new(MounterError::Timeout {
                operation: "placeholder release".to_string(),
                after: self.config.release_timeout,
            })),
        }
    }

    /// Best-effort immediate deletion of placeholders of a failed request.
    async fn rollback(&self, placeholders: &[String]) {
        for name in placeholders {
            match self
                .cluster
                .delete_pod(&self.config.pool_namespace, name, Some(0))
                .await
            {
                Ok(()) => info!(placeholder = %name, "rolled back placeholder pod"),
                Err(report) if is_not_found(&report) => {}
                Err(report) => {
                    warn!(placeholder = %name, "failed to roll back placeholder pod: {report:?}")
                }
            }
        }
    }

    /// Names of the placeholder pods whose owner reference is the consumer,
    /// whatever their phase.
    pub async fn placeholders_of(&self, consumer: &Pod) -> MounterResult<BTreeSet<String>> {
        let consumer = Consumer::from_pod(consumer)?;
        Ok(self
            .owned_placeholders(&consumer)
            .await?
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    /// Removes placeholders of the consumer that never started running,
    /// e.g. leftovers of a worker restart in the middle of a claim.
    pub async fn sweep_stale(&self, consumer: &Pod) -> MounterResult<usize> {
        let consumer = Consumer::from_pod(consumer)?;
        let stale: Vec<String> = self
            .owned_placeholders(&consumer)
            .await?
            .into_iter()
            .filter(|pod| pod_phase(pod) != Some("Running"))
            .filter_map(|pod| pod.metadata.name)
            .collect();

        if !stale.is_empty() {
            info!(pod = %consumer.name, placeholders = ?stale, "removing stale placeholder pods");
            self.rollback(&stale).await;
        }
        Ok(stale.len())
    }

    async fn owned_placeholders(&self, consumer: &Consumer) -> MounterResult<Vec<Pod>> {
        let selector = format!("{PLACEHOLDER_LABEL_KEY}={PLACEHOLDER_LABEL_VALUE}");
        let pods = self
            .cluster
            .list_pods(&self.config.pool_namespace, &selector)
            .await
            .change_context_lazy(|| {
                MounterError::internal(format!(
                    "failed to list placeholder pods in {}",
                    self.config.pool_namespace
                ))
            })?;

        Ok(pods
            .into_iter()
            .filter(|pod| is_owned_by(pod, &consumer.uid))
            .filter(|pod| {
                pod.metadata.name.as_deref().is_some_and(|name| {
                    Owner::new(name, self.config.pool_namespace.as_str())
                        .is_placeholder_of(&consumer.name, &self.config.pool_namespace)
                })
            })
            .collect())
    }

    fn placeholder_pod(&self, consumer: &Consumer) -> Pod {
        let suffix: String = rand::random::<[u8; 3]>()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let name = format!("{}{PLACEHOLDER_INFIX}{suffix}", consumer.name);

        Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.config.pool_namespace.clone()),
                labels: Some(BTreeMap::from([(
                    PLACEHOLDER_LABEL_KEY.to_string(),
                    PLACEHOLDER_LABEL_VALUE.to_string(),
                )])),
                // deleting the consumer garbage collects its placeholders
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    name: consumer.name.clone(),
                    uid: consumer.uid.clone(),
                    block_owner_deletion: Some(true),
                    controller: Some(true),
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: PLACEHOLDER_CONTAINER_NAME.to_string(),
                    image: Some(self.config.placeholder_image.clone()),
                    command: Some(vec!["/bin/sh".to_string()]),
                    args: Some(vec![
                        "-c".to_string(),
                        "while true; do echo this is a gpu pool container; sleep 10; done"
                            .to_string(),
                    ]),
                    resources: Some(ResourceRequirements {
                        limits: Some(BTreeMap::from([(
                            self.config.resource_name.clone(),
                            Quantity("1".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                node_selector: Some(BTreeMap::from([(
                    HOSTNAME_LABEL.to_string(),
                    consumer.node_name.clone(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|status| status.phase.as_deref())
}

fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.reason.as_deref() == Some(UNSCHEDULABLE_REASON))
        })
}

fn is_owned_by(pod: &Pod, uid: &str) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

async fn poll_claim(
    cluster: &dyn ClusterClient,
    namespace: &str,
    placeholders: &[String],
) -> Option<ClaimOutcome> {
    let mut all_running = true;
    for name in placeholders {
        let pod = match cluster.get_pod(namespace, name).await {
            Ok(pod) => pod,
            Err(report) if is_not_found(&report) => {
                return Some(ClaimOutcome::Failed {
                    message: format!("placeholder pod {name} disappeared"),
                })
            }
            Err(report) => {
                return Some(ClaimOutcome::Failed {
                    message: format!("failed to read placeholder pod {name}: {report}"),
                })
            }
        };

        match pod_phase(&pod) {
            Some("Running") => continue,
            Some(phase @ ("Failed" | "Succeeded")) => {
                return Some(ClaimOutcome::Failed {
                    message: format!("placeholder pod {name} terminated in phase {phase}"),
                })
            }
            _ => {}
        }
        if is_unschedulable(&pod) {
            return Some(ClaimOutcome::Unschedulable {
                placeholder: name.clone(),
            });
        }
        debug!(placeholder = %name, "placeholder pod is pending");
        all_running = false;
    }
    all_running.then_some(ClaimOutcome::Running)
}

async fn monitor_claim(
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    placeholders: Vec<String>,
    interval: Duration,
    mut tx: oneshot::Sender<ClaimOutcome>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(?placeholders, "claim monitor abandoned");
                return;
            }
            _ = ticker.tick() => {}
        }
        if let Some(outcome) = poll_claim(cluster.as_ref(), &namespace, &placeholders).await {
            let _ = tx.send(outcome);
            return;
        }
    }
}

async fn poll_release(
    cluster: &dyn ClusterClient,
    namespace: &str,
    placeholders: &[String],
) -> Option<ReleaseOutcome> {
    let mut all_deleted = true;
    for name in placeholders {
        match cluster.get_pod(namespace, name).await {
            Ok(_) => all_deleted = false,
            Err(report) if is_not_found(&report) => {}
            Err(report) => {
                return Some(ReleaseOutcome::Failed {
                    message: format!("failed to read placeholder pod {name}: {report}"),
                })
            }
        }
    }
    all_deleted.then_some(ReleaseOutcome::Deleted)
}

async fn monitor_release(
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    placeholders: Vec<String>,
    interval: Duration,
    mut tx: oneshot::Sender<ReleaseOutcome>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(?placeholders, "release monitor abandoned");
                return;
            }
            _ = ticker.tick() => {}
        }
        if let Some(outcome) = poll_release(cluster.as_ref(), &namespace, &placeholders).await {
            let _ = tx.send(outcome);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::MounterConfig;
    use crate::testing::consumer_pod;
    use crate::testing::FakeNode;
    use crate::testing::Scheduling;

    fn allocator(node: &Arc<FakeNode>) -> PlaceholderAllocator {
        let inventory = Arc::new(
            DeviceInventory::new(node.as_ref(), node.clone(), &MounterConfig::new("node-a"))
                .unwrap(),
        );
        PlaceholderAllocator::new(
            node.clone(),
            inventory,
            AllocatorConfig {
                poll_interval: Duration::from_millis(5),
                claim_timeout: Duration::from_secs(2),
                release_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
    }

    #[test]
    fn placeholder_pod_is_pinned_and_owned() {
        let node = FakeNode::new(1);
        let allocator = allocator(&node);
        let consumer = Consumer::from_pod(&consumer_pod("p1", "ns")).unwrap();

        let pod = allocator.placeholder_pod(&consumer);
        let name = pod.metadata.name.clone().unwrap();
        assert!(name.starts_with("p1-slave-pod-"));
        assert_eq!(name.len(), "p1-slave-pod-".len() + 6);
        assert_eq!(pod.metadata.namespace.as_deref(), Some("gpu-pool"));
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap()["app"],
            "gpu-pool".to_string()
        );

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.name, "p1");
        assert_eq!(owner.uid, "uid-ns-p1");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));

        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.node_selector.unwrap()["kubernetes.io/hostname"],
            "node-a".to_string()
        );
        let limits = spec.containers[0]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .clone()
            .unwrap();
        assert_eq!(limits["nvidia.com/gpu"], Quantity("1".to_string()));
    }

    #[test]
    fn unbound_consumer_is_invalid() {
        let mut pod = consumer_pod("p1", "ns");
        pod.spec.as_mut().unwrap().node_name = None;

        let err = Consumer::from_pod(&pod).unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::InvalidRequest { .. }
        ));
    }

    #[tokio::test]
    async fn claim_returns_devices_in_creation_order() {
        let node = FakeNode::new(3);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);

        let claims = allocator.claim(&consumer, 2).await.unwrap();
        assert_eq!(claims.len(), 2);
        for claim in &claims {
            assert!(claim.device.is_owned_by(&claim.placeholder, "gpu-pool"));
        }
        assert_eq!(node.placeholders_of("p1"), vec![
            claims[0].placeholder.clone(),
            claims[1].placeholder.clone(),
        ]);
    }

    #[tokio::test]
    async fn insufficient_capacity_rolls_back_every_placeholder() {
        let node = FakeNode::new(1);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);

        let err = allocator.claim(&consumer, 2).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::InsufficientCapacity { requested: 2, .. }
        ));
        assert!(node.placeholders_of("p1").is_empty());
        assert_eq!(node.free_devices(), 1);
    }

    #[tokio::test]
    async fn pending_forever_times_out_and_rolls_back() {
        let node = FakeNode::new(1);
        node.set_scheduling(Scheduling::Pending);
        let consumer = node.add_consumer("p1", "ns");
        let mut allocator = allocator(&node);
        allocator.config.claim_timeout = Duration::from_millis(50);

        let err = allocator.claim(&consumer, 1).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::Timeout { .. }
        ));
        assert!(node.placeholders_of("p1").is_empty());
    }

    #[tokio::test]
    async fn create_failure_rolls_back_created_placeholders() {
        let node = FakeNode::new(2);
        node.fail_creates_after(1);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);

        let err = allocator.claim(&consumer, 2).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::CreateFailed { .. }
        ));
        assert!(node.placeholders_of("p1").is_empty());
    }

    #[tokio::test]
    async fn release_waits_until_placeholders_are_gone() {
        let node = FakeNode::new(2);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);
        let claims = allocator.claim(&consumer, 2).await.unwrap();

        let names: Vec<String> = claims.into_iter().map(|c| c.placeholder).collect();
        allocator.release(&names).await.unwrap();
        assert!(node.placeholders_of("p1").is_empty());
        assert_eq!(node.free_devices(), 2);

        // already deleted placeholders are not an error
        allocator.release(&names).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_only_pending_placeholders_of_the_consumer() {
        let node = FakeNode::new(1);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);
        let running = allocator.claim(&consumer, 1).await.unwrap();

        node.set_scheduling(Scheduling::Pending);
        let stale = allocator.placeholder_pod(&Consumer::from_pod(&consumer).unwrap());
        node.create_pod("gpu-pool", &stale).await.unwrap();

        assert_eq!(allocator.sweep_stale(&consumer).await.unwrap(), 1);
        assert_eq!(node.placeholders_of("p1"), vec![running[0].placeholder.clone()]);
    }

    #[tokio::test]
    async fn unreadable_placeholder_fails_claim_and_rolls_back() {
        let node = FakeNode::new(1);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);
        node.fail_pod_reads(true);

        let err = allocator.claim(&consumer, 1).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::CreateFailed { .. }
        ));
        assert!(node.placeholders_of("p1").is_empty());
        assert_eq!(node.free_devices(), 1);
    }

    #[tokio::test]
    async fn unreadable_placeholder_fails_release() {
        let node = FakeNode::new(1);
        let consumer = node.add_consumer("p1", "ns");
        let allocator = allocator(&node);
        let claims = allocator.claim(&consumer, 1).await.unwrap();
        node.fail_pod_reads(true);

        let err = allocator
            .release(&[claims[0].placeholder.clone()])
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::DeleteFailed { .. }
        ));
    }

    #[tokio::test]
    async fn lingering_placeholder_times_out_release() {
        let node = FakeNode::new(1);
        let consumer = node.add_consumer("p1", "ns");
        let mut allocator = allocator(&node);
        allocator.config.release_timeout = Duration::from_millis(50);
        let claims = allocator.claim(&consumer, 1).await.unwrap();
        node.set_termination_delay(Duration::from_secs(30));

        let err = allocator
            .release(&[claims[0].placeholder.clone()])
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            MounterError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn placeholders_are_matched_by_owner_uid() {
        let node = FakeNode::new(2);
        let team_a = node.add_consumer("p1", "team-a");
        let team_b = node.add_consumer("p1", "team-b");
        let allocator = allocator(&node);
        let claims = allocator.claim(&team_a, 1).await.unwrap();

        assert_eq!(
            allocator.placeholders_of(&team_a).await.unwrap(),
            BTreeSet::from([claims[0].placeholder.clone()])
        );
        assert!(allocator.placeholders_of(&team_b).await.unwrap().is_empty());
        assert_eq!(allocator.sweep_stale(&team_b).await.unwrap(), 0);
    }
}
