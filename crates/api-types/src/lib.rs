//! Shared API type definitions
//!
//! This crate contains the request and response types of the GPU mounter
//! worker: attaching GPUs to a running pod, detaching them again and
//! inspecting the device inventory of a node.

use serde::Deserialize;
use serde::Serialize;

/// Request to attach GPUs to a running pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachRequest {
    /// Consumer pod name
    pub pod_name: String,
    /// Consumer pod namespace
    pub namespace: String,
    /// Number of GPUs to attach
    pub gpu_num: u32,
    /// Whether the request claims the whole device set of the pod
    #[serde(default)]
    pub entire_mount: bool,
}

/// Request to detach GPUs from a running pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachRequest {
    /// Consumer pod name
    pub pod_name: String,
    /// Consumer pod namespace
    pub namespace: String,
    /// UUIDs of the GPUs to detach
    pub uuids: Vec<String>,
    /// Kill processes still using the GPUs instead of refusing
    #[serde(default)]
    pub force: bool,
}

/// Outcome of an attach request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachResult {
    Success,
    InsufficientCapacity,
    ConsumerNotFound,
    /// The current mount posture of the pod forbids this request
    MountRejected,
    InvalidRequest,
    InternalError,
}

/// Outcome of a detach request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetachResult {
    Success,
    ConsumerNotFound,
    DeviceBusy,
    DeviceNotFound,
    InvalidRequest,
    InternalError,
}

impl std::fmt::Display for AttachResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::fmt::Display for DetachResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Allocation state of a physical GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Free,
    Allocated,
}

/// Device information as exposed by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// GPU UUID
    pub uuid: String,
    /// Minor number of the character device
    pub minor_number: u32,
    /// Device special file path, e.g. `/dev/nvidia0`
    pub device_path: String,
    /// Allocation state
    pub state: DeviceState,
    /// Name of the pod owning the device
    pub owner_pod: Option<String>,
    /// Namespace of the pod owning the device
    pub owner_namespace: Option<String>,
}

/// Response for an attach request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachResponse {
    pub result: AttachResult,
    /// Devices attached by this request (present on success)
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    /// Response message
    pub message: String,
}

/// Response for a detach request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachResponse {
    pub result: DetachResult,
    /// Response message
    pub message: String,
}

/// Response for the device inventory query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryResponse {
    /// Whether the inventory could be read
    pub success: bool,
    pub devices: Vec<DeviceInfo>,
    pub message: String,
}
