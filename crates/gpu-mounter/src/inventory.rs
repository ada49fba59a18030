//! Device inventory collector.
//!
//! The physical device set is read once from telemetry. Ownership is never
//! cached: every query re-lists the kubelet assignments and rebuilds it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use crate::config::MounterConfig;
use crate::device::Device;
use crate::device::Owner;
use crate::errors::MounterError;
use crate::errors::MounterResult;
use crate::platform::nvml::DeviceTelemetry;
use crate::platform::pod_resources::ResourceLister;

pub struct DeviceInventory {
    lister: Arc<dyn ResourceLister>,
    devices: Vec<Device>,
    resource_name: String,
    pool_namespace: String,
}

impl DeviceInventory {
    /// Enumerates the node's devices, sorted by minor number.
    pub fn new(
        telemetry: &dyn DeviceTelemetry,
        lister: Arc<dyn ResourceLister>,
        config: &MounterConfig,
    ) -> MounterResult<Self> {
        let identities = telemetry
            .devices()
            .change_context_lazy(|| MounterError::internal("failed to enumerate GPU devices"))?;

        let mut devices: Vec<Device> = identities
            .into_iter()
            .map(|identity| {
                Device::new(identity.minor_number, identity.uuid, &config.device_prefix)
            })
            .collect();
        devices.sort_by_key(|device| device.minor_number);

        info!(count = devices.len(), "GPU inventory initialised");
        Ok(Self {
            lister,
            devices,
            resource_name: config.resource_name.clone(),
            pool_namespace: config.pool_namespace.clone(),
        })
    }

    /// Current ownership of every device, keyed by uuid.
    pub async fn refresh(&self) -> MounterResult<BTreeMap<String, Device>> {
        let assignments = self
            .lister
            .list_assignments()
            .await
            .change_context(MounterError::ListingUnavailable)?;

        let mut devices: BTreeMap<String, Device> = self
            .devices
            .iter()
            .map(|device| {
                let mut device = device.clone();
                device.reset();
                (device.uuid.clone(), device)
            })
            .collect();

        for assignment in assignments
            .iter()
            .filter(|a| a.resource_name == self.resource_name)
        {
            for device_id in &assignment.device_ids {
                let Some(device) = devices.get_mut(device_id) else {
                    return Err(Report::new(MounterError::internal(format!(
                        "pod {}/{} holds GPU {device_id} which does not exist on this node",
                        assignment.namespace, assignment.pod_name
                    ))));
                };
                device.assign(Owner::new(&assignment.pod_name, &assignment.namespace));
                debug!(
                    uuid = %device.uuid,
                    pod = %assignment.pod_name,
                    namespace = %assignment.namespace,
                    "GPU allocated"
                );
            }
        }
        Ok(devices)
    }

    /// Devices held by the consumer itself or by one of `placeholders`, in
    /// minor number order.
    ///
    /// `placeholders` are the names of the pool pods whose owner reference
    /// points at the consumer. Pod names alone do not identify the owner:
    /// consumers with the same name in different namespaces share the pool.
    pub async fn find_by_owner(
        &self,
        name: &str,
        namespace: &str,
        placeholders: &BTreeSet<String>,
    ) -> MounterResult<Vec<Device>> {
        let snapshot = self.refresh().await?;
        Ok(self.owned_by(&snapshot, name, namespace, placeholders))
    }

    pub(crate) fn owned_by(
        &self,
        snapshot: &BTreeMap<String, Device>,
        name: &str,
        namespace: &str,
        placeholders: &BTreeSet<String>,
    ) -> Vec<Device> {
        let mut owned: Vec<Device> = snapshot
            .values()
            .filter(|device| {
                device.owner.as_ref().is_some_and(|owner| {
                    owner.is(name, namespace)
                        || (owner.namespace == self.pool_namespace
                            && placeholders.contains(&owner.name))
                })
            })
            .cloned()
            .collect();
        owned.sort_by_key(|device| device.minor_number);
        owned
    }

    /// The device held by one placeholder pod.
    pub fn held_by<'a>(
        snapshot: &'a BTreeMap<String, Device>,
        pod_name: &str,
        namespace: &str,
    ) -> Option<&'a Device> {
        snapshot
            .values()
            .find(|device| device.is_owned_by(pod_name, namespace))
    }
}
