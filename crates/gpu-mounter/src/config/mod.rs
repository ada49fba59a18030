pub mod cli;
pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

pub use cli::*;
pub use worker::*;

use crate::device::DEFAULT_NVIDIA_MAJOR_NUMBER;
use crate::device::NVIDIA_DEVICE_FILE_PREFIX;
use crate::platform::cgroup::CgroupDriver;
use crate::platform::cgroup::DEFAULT_DEVICES_CGROUP_ROOT;

pub const DEFAULT_POOL_NAMESPACE: &str = "gpu-pool";
pub const DEFAULT_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "alpine:latest";

/// Node identity and device naming shared by the mount engine.
#[derive(Debug, Clone)]
pub struct MounterConfig {
    pub node_name: String,
    pub pool_namespace: String,
    pub resource_name: String,
    pub device_major: u32,
    pub device_prefix: String,
}

impl MounterConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            pool_namespace: DEFAULT_POOL_NAMESPACE.to_string(),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            device_major: DEFAULT_NVIDIA_MAJOR_NUMBER,
            device_prefix: NVIDIA_DEVICE_FILE_PREFIX.to_string(),
        }
    }
}

impl From<&WorkerArgs> for MounterConfig {
    fn from(args: &WorkerArgs) -> Self {
        Self {
            node_name: args.node_name.clone(),
            pool_namespace: args.pool_namespace.clone(),
            resource_name: args.resource_name.clone(),
            device_major: args.device_major,
            device_prefix: args.device_prefix.clone(),
        }
    }
}

impl From<&ListDevicesArgs> for MounterConfig {
    fn from(args: &ListDevicesArgs) -> Self {
        Self {
            pool_namespace: args.pool_namespace.clone(),
            resource_name: args.resource_name.clone(),
            device_prefix: args.device_prefix.clone(),
            ..Self::new(String::new())
        }
    }
}

/// Location and layout of the devices cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupConfig {
    pub root: PathBuf,
    pub driver: CgroupDriverArg,
}

impl CgroupConfig {
    /// The configured driver, probing the hierarchy for `auto`.
    pub fn resolve_driver(&self) -> CgroupDriver {
        match self.driver {
            CgroupDriverArg::Cgroupfs => CgroupDriver::Cgroupfs,
            CgroupDriverArg::Systemd => CgroupDriver::Systemd,
            CgroupDriverArg::Auto => CgroupDriver::detect(&self.root),
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_DEVICES_CGROUP_ROOT),
            driver: CgroupDriverArg::Auto,
        }
    }
}

impl From<&WorkerArgs> for CgroupConfig {
    fn from(args: &WorkerArgs) -> Self {
        Self {
            root: args.cgroup_root.clone(),
            driver: args.cgroup_driver,
        }
    }
}

/// Placeholder pod template and monitor bounds.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub pool_namespace: String,
    pub resource_name: String,
    pub placeholder_image: String,
    pub poll_interval: Duration,
    pub claim_timeout: Duration,
    pub release_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            pool_namespace: DEFAULT_POOL_NAMESPACE.to_string(),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            placeholder_image: DEFAULT_PLACEHOLDER_IMAGE.to_string(),
            poll_interval: Duration::from_millis(500),
            claim_timeout: Duration::from_secs(120),
            release_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&WorkerArgs> for AllocatorConfig {
    fn from(args: &WorkerArgs) -> Self {
        Self {
            pool_namespace: args.pool_namespace.clone(),
            resource_name: args.resource_name.clone(),
            placeholder_image: args.placeholder_image.clone(),
            poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
            claim_timeout: Duration::from_secs(args.claim_timeout_secs),
            release_timeout: Duration::from_secs(args.release_timeout_secs),
        }
    }
}
