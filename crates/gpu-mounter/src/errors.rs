use core::error::Error;
use std::time::Duration;

use api_types::AttachResult;
use api_types::DetachResult;
use error_stack::Report;

use crate::mount_type::MountType;

/// Errors surfaced by the mount engine.
///
/// Every collaborator failure is converted into one of these kinds at the
/// component boundary; callers only ever match on the enum.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum MounterError {
    #[display("Pod not found: {name} in namespace {namespace}")]
    ConsumerNotFound { name: String, namespace: String },
    #[display("Insufficient GPU on node {node}: requested {requested}")]
    InsufficientCapacity { node: String, requested: usize },
    #[display("Failed to create placeholder pods: {message}")]
    CreateFailed { message: String },
    #[display("Failed to delete placeholder pods: {message}")]
    DeleteFailed { message: String },
    #[display("GPU {uuid} is busy, running processes: {pids:?}")]
    DeviceBusy { uuid: String, pids: Vec<u32> },
    #[display("GPU(s) not mounted by GPU mounter: {uuids:?}")]
    DeviceNotFound { uuids: Vec<String> },
    #[display("Mount type of pod is unknown")]
    UnknownMountType,
    #[display("Pod is {mount_type}, request is not allowed")]
    MountRejected { mount_type: MountType },
    #[display("Failed to resolve cgroup path: {reason}")]
    CgroupPathUnresolved { reason: String },
    #[display("Failed to update device cgroup {path}")]
    CgroupWriteFailed { path: String },
    #[display("Failed to operate in mount namespace of pid {pid}")]
    NamespaceOpFailed { pid: u32 },
    #[display("Pod resources listing is unavailable")]
    ListingUnavailable,
    #[display("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[display("Invalid request: {message}")]
    InvalidRequest { message: String },
    #[display("Internal error: {message}")]
    InternalError { message: String },
}

impl Error for MounterError {}

pub type MounterResult<T> = Result<T, Report<MounterError>>;

impl MounterError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Maps the error onto the attach contract.
    pub fn attach_result(&self) -> AttachResult {
        match self {
            Self::ConsumerNotFound { .. } => AttachResult::ConsumerNotFound,
            Self::InsufficientCapacity { .. } => AttachResult::InsufficientCapacity,
            Self::MountRejected { .. } | Self::UnknownMountType => AttachResult::MountRejected,
            Self::InvalidRequest { .. } => AttachResult::InvalidRequest,
            _ => AttachResult::InternalError,
        }
    }

    /// Maps the error onto the detach contract.
    pub fn detach_result(&self) -> DetachResult {
        match self {
            Self::ConsumerNotFound { .. } => DetachResult::ConsumerNotFound,
            Self::DeviceBusy { .. } => DetachResult::DeviceBusy,
            Self::DeviceNotFound { .. } => DetachResult::DeviceNotFound,
            Self::InvalidRequest { .. } => DetachResult::InvalidRequest,
            _ => DetachResult::InternalError,
        }
    }
}
