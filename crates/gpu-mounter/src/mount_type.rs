//! Mount posture of a consumer and the request guard derived from it.

use std::collections::BTreeSet;
use std::collections::HashSet;

use tracing::warn;

use crate::device::Device;
use crate::inventory::DeviceInventory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MountType {
    #[display("not mounted")]
    NoMount,
    #[display("single mounted")]
    SingleMount,
    #[display("entire mounted")]
    EntireMount,
    #[display("of unknown mount type")]
    UnknownMount,
}

/// Classifies the devices held by a consumer and its placeholders.
///
/// A device owned directly by the consumer leaves fewer distinct placeholder
/// owners than devices, which marks the consumer as entire mounted.
pub fn classify_devices(devices: &[Device], name: &str, namespace: &str) -> MountType {
    if devices.is_empty() {
        return MountType::NoMount;
    }

    let placeholders: HashSet<_> = devices
        .iter()
        .filter_map(|device| device.owner.as_ref())
        .filter(|owner| !owner.is(name, namespace))
        .collect();

    if placeholders.len() < devices.len() {
        MountType::EntireMount
    } else {
        MountType::SingleMount
    }
}

/// Classifies a consumer against a fresh inventory, a failed refresh yields
/// [`MountType::UnknownMount`].
///
/// Only devices of the consumer and of `placeholders` are counted.
pub async fn classify(
    inventory: &DeviceInventory,
    name: &str,
    namespace: &str,
    placeholders: &BTreeSet<String>,
) -> MountType {
    match inventory.find_by_owner(name, namespace, placeholders).await {
        Ok(devices) => classify_devices(&devices, name, namespace),
        Err(report) => {
            warn!(pod = name, namespace, "failed to classify mount type: {report:?}");
            MountType::UnknownMount
        }
    }
}

/// Whether an attach request is allowed for the current mount type.
pub fn can_mount(mount_type: MountType, entire_mount: bool) -> bool {
    match mount_type {
        MountType::NoMount => true,
        MountType::SingleMount => !entire_mount,
        MountType::EntireMount | MountType::UnknownMount => false,
    }
}
