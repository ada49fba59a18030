//! Physical GPU model shared by the inventory, classifier and splicer.

use std::path::Path;
use std::path::PathBuf;

use api_types::DeviceInfo;
use api_types::DeviceState;

/// Major number of NVIDIA character devices.
pub const DEFAULT_NVIDIA_MAJOR_NUMBER: u32 = 195;
/// Device file prefix, the minor number is appended.
pub const NVIDIA_DEVICE_FILE_PREFIX: &str = "/dev/nvidia";
/// Permission granted in the devices cgroup.
pub const DEFAULT_CGROUP_PERMISSION: &str = "rw";
/// Mode of the device special file created in the container.
pub const DEFAULT_DEVICE_FILE_MODE: u32 = 0o666;
/// Placeholder pods are named `<consumer>-slave-pod-<suffix>`.
pub const PLACEHOLDER_INFIX: &str = "-slave-pod-";

/// Pod holding a device, either the consumer itself or one of its placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub name: String,
    pub namespace: String,
}

impl Owner {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    /// True for a placeholder pod created on behalf of `consumer`.
    pub fn is_placeholder_of(&self, consumer: &str, pool_namespace: &str) -> bool {
        self.namespace == pool_namespace
            && self
                .name
                .strip_prefix(consumer)
                .and_then(|rest| rest.strip_prefix(PLACEHOLDER_INFIX))
                .is_some_and(|suffix| !suffix.is_empty())
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A physical GPU, identified by its UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub minor_number: u32,
    pub device_path: PathBuf,
    pub uuid: String,
    pub state: DeviceState,
    pub owner: Option<Owner>,
}

impl Device {
    pub fn new(minor_number: u32, uuid: impl Into<String>, device_prefix: &str) -> Self {
        Self {
            minor_number,
            device_path: PathBuf::from(format!("{device_prefix}{minor_number}")),
            uuid: uuid.into(),
            state: DeviceState::Free,
            owner: None,
        }
    }

    pub fn assign(&mut self, owner: Owner) {
        self.state = DeviceState::Allocated;
        self.owner = Some(owner);
    }

    pub fn reset(&mut self) {
        self.state = DeviceState::Free;
        self.owner = None;
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn is_owned_by(&self, name: &str, namespace: &str) -> bool {
        self.owner.as_ref().is_some_and(|owner| owner.is(name, namespace))
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.device_path.display(), self.uuid)
    }
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            uuid: device.uuid.clone(),
            minor_number: device.minor_number,
            device_path: device.device_path.display().to_string(),
            state: device.state,
            owner_pod: device.owner.as_ref().map(|o| o.name.clone()),
            owner_namespace: device.owner.as_ref().map(|o| o.namespace.clone()),
        }
    }
}
