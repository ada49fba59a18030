pub mod cgroup;
pub mod kube;
pub mod namespace;
pub mod nvml;
pub mod pod_resources;
