use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

/// How the devices cgroup hierarchy is laid out by the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CgroupDriverArg {
    /// Probe the hierarchy at startup
    Auto,
    Cgroupfs,
    Systemd,
}

#[derive(Parser, Clone, Debug)]
pub struct WorkerArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this worker manages"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        default_value = "gpu-pool",
        help = "Namespace holding placeholder pods"
    )]
    pub pool_namespace: String,

    #[arg(
        long,
        help = "Kubelet pod-resources socket used to resolve device assignments",
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        value_hint = clap::ValueHint::FilePath,
    )]
    pub kubelet_socket_path: PathBuf,

    #[arg(
        long,
        help = "Mount point of the devices cgroup controller",
        default_value = "/sys/fs/cgroup/devices",
        value_hint = clap::ValueHint::DirPath,
    )]
    pub cgroup_root: PathBuf,

    #[arg(long, value_enum, default_value_t = CgroupDriverArg::Auto)]
    pub cgroup_driver: CgroupDriverArg,

    #[arg(long, default_value_t = 195, help = "Major number of GPU character devices")]
    pub device_major: u32,

    #[arg(
        long,
        default_value = "/dev/nvidia",
        help = "Device file prefix, the minor number is appended"
    )]
    pub device_prefix: String,

    #[arg(
        long,
        default_value = "nvidia.com/gpu",
        help = "Extended resource name requested by placeholder pods"
    )]
    pub resource_name: String,

    #[arg(long, default_value = "alpine:latest", help = "Image of placeholder pods")]
    pub placeholder_image: String,

    #[arg(
        long,
        default_value_t = 500,
        help = "Interval between placeholder status polls in milliseconds"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long,
        default_value_t = 120,
        help = "Time allowed for placeholder pods to start running"
    )]
    pub claim_timeout_secs: u64,

    #[arg(
        long,
        default_value_t = 60,
        help = "Time allowed for placeholder pods to disappear after deletion"
    )]
    pub release_timeout_secs: u64,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:1200",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "GPU_MOUNTER_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/log/GPUMounter/GPUMounter-worker.log",
        help = "Log file, rotated daily"
    )]
    pub log_file: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct ListDevicesArgs {
    #[arg(
        long,
        default_value = "/var/lib/kubelet/pod-resources/kubelet.sock",
        value_hint = clap::ValueHint::FilePath,
    )]
    pub kubelet_socket_path: PathBuf,

    #[arg(long, default_value = "nvidia.com/gpu")]
    pub resource_name: String,

    #[arg(long, default_value = "/dev/nvidia")]
    pub device_prefix: String,

    #[arg(long, default_value = "gpu-pool")]
    pub pool_namespace: String,
}
