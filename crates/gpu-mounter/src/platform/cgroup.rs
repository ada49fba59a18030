//! Device control-group (cgroup v1) access for running containers.
//!
//! Path resolution follows the kubelet layout:
//! `kubepods[/<qos>]/pod<uid>/<container>` for the cgroupfs driver and the
//! expanded `kubepods.slice/...` form for the systemd driver.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Default mount point of the devices controller.
pub const DEFAULT_DEVICES_CGROUP_ROOT: &str = "/sys/fs/cgroup/devices";

const KUBEPODS: &str = "kubepods";
const SYSTEMD_SLICE_SUFFIX: &str = ".slice";
const DEVICES_ALLOW: &str = "devices.allow";
const DEVICES_DENY: &str = "devices.deny";
const CGROUP_PROCS: &str = "cgroup.procs";

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("Invalid container id: {container_id}")]
    InvalidContainerId { container_id: String },
    #[error("Invalid systemd slice name: {slice}")]
    InvalidSlice { slice: String },
    #[error("Invalid resource quantity: {quantity}")]
    InvalidQuantity { quantity: String },
    #[error("Failed to write {path}")]
    WriteFailed { path: String },
    #[error("Failed to read {path}")]
    ReadFailed { path: String },
    #[error("No process in cgroup {path}")]
    NoProcesses { path: String },
}

/// Cgroup driver used by the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
}

impl CgroupDriver {
    /// Probes the devices hierarchy, the systemd driver nests pods under
    /// `kubepods.slice`.
    pub fn detect(root: &Path) -> Self {
        if root.join(format!("{KUBEPODS}{SYSTEMD_SLICE_SUFFIX}")).is_dir() {
            CgroupDriver::Systemd
        } else {
            CgroupDriver::Cgroupfs
        }
    }
}

/// Pod quality-of-service class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    /// Uses the class recorded in the pod status, computing it the way the
    /// kubelet does when the status is not populated yet.
    pub fn of_pod(pod: &Pod) -> Result<Self, Report<CgroupError>> {
        let recorded = pod.status.as_ref().and_then(|s| s.qos_class.as_deref());
        match recorded {
            Some("Guaranteed") => Ok(QosClass::Guaranteed),
            Some("Burstable") => Ok(QosClass::Burstable),
            Some("BestEffort") => Ok(QosClass::BestEffort),
            _ => Self::compute(pod),
        }
    }

    fn compute(pod: &Pod) -> Result<Self, Report<CgroupError>> {
        let mut requests: BTreeMap<&str, i128> = BTreeMap::new();
        let mut limits: BTreeMap<&str, i128> = BTreeMap::new();
        let mut is_guaranteed = true;

        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();

        for container in containers {
            let resources = container.resources.as_ref();

            if let Some(container_requests) = resources.and_then(|r| r.requests.as_ref()) {
                for (name, quantity) in container_requests {
                    let Some(name) = qos_resource(name) else {
                        continue;
                    };
                    let value = parse_quantity(&quantity.0)?;
                    if value > 0 {
                        *requests.entry(name).or_default() += value;
                    }
                }
            }

            let mut limits_found = 0;
            if let Some(container_limits) = resources.and_then(|r| r.limits.as_ref()) {
                for (name, quantity) in container_limits {
                    let Some(name) = qos_resource(name) else {
                        continue;
                    };
                    let value = parse_quantity(&quantity.0)?;
                    if value > 0 {
                        limits_found += 1;
                        *limits.entry(name).or_default() += value;
                    }
                }
            }
            if limits_found < 2 {
                is_guaranteed = false;
            }
        }

        if requests.is_empty() && limits.is_empty() {
            return Ok(QosClass::BestEffort);
        }
        if is_guaranteed {
            is_guaranteed = requests
                .iter()
                .all(|(name, request)| limits.get(name) == Some(request));
        }
        if is_guaranteed && requests.len() == limits.len() {
            return Ok(QosClass::Guaranteed);
        }
        Ok(QosClass::Burstable)
    }

    fn parent_components(&self) -> Vec<&'static str> {
        match self {
            QosClass::Guaranteed => vec![KUBEPODS],
            QosClass::Burstable => vec![KUBEPODS, "burstable"],
            QosClass::BestEffort => vec![KUBEPODS, "besteffort"],
        }
    }
}

fn qos_resource(name: &str) -> Option<&'static str> {
    match name {
        "cpu" => Some("cpu"),
        "memory" => Some("memory"),
        _ => None,
    }
}

/// Parses a Kubernetes resource quantity into nano units.
pub fn parse_quantity(quantity: &str) -> Result<i128, Report<CgroupError>> {
    let invalid = || CgroupError::InvalidQuantity {
        quantity: quantity.to_string(),
    };
    let trimmed = quantity.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(Report::new(invalid()));
    }

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(Report::new(invalid()));
    }
    let digits: String = whole.chars().chain(fraction.chars()).collect();
    let mantissa: i128 = digits.parse().map_err(|_| Report::new(invalid()))?;

    // value = mantissa * 10^(9 - fraction_digits) * multiplier, in nano units
    let mut decimal_exponent: i32 = 9 - fraction.len() as i32;
    let mut binary_multiplier: i128 = 1;
    match suffix {
        "" => {}
        "n" => decimal_exponent -= 9,
        "u" => decimal_exponent -= 6,
        "m" => decimal_exponent -= 3,
        "k" => decimal_exponent += 3,
        "M" => decimal_exponent += 6,
        "G" => decimal_exponent += 9,
        "T" => decimal_exponent += 12,
        "P" => decimal_exponent += 15,
        "E" => decimal_exponent += 18,
        "Ki" => binary_multiplier = 1 << 10,
        "Mi" => binary_multiplier = 1 << 20,
        "Gi" => binary_multiplier = 1 << 30,
        "Ti" => binary_multiplier = 1 << 40,
        "Pi" => binary_multiplier = 1 << 50,
        "Ei" => binary_multiplier = 1 << 60,
        other => {
            let exponent = other
                .strip_prefix(['e', 'E'])
                .and_then(|e| e.parse::<i32>().ok())
                .ok_or_else(|| Report::new(invalid()))?;
            decimal_exponent += exponent;
        }
    }

    let mut value = mantissa
        .checked_mul(binary_multiplier)
        .ok_or_else(|| Report::new(invalid()))?;
    if decimal_exponent >= 0 {
        let scale = 10i128
            .checked_pow(decimal_exponent as u32)
            .ok_or_else(|| Report::new(invalid()))?;
        value = value.checked_mul(scale).ok_or_else(|| Report::new(invalid()))?;
    } else {
        // sub-nano precision rounds up like the apiserver does
        let scale = 10i128
            .checked_pow(decimal_exponent.unsigned_abs())
            .ok_or_else(|| Report::new(invalid()))?;
        value = (value + scale - 1) / scale;
    }
    Ok(if negative { -value } else { value })
}

/// Container id as reported in the pod status, `<runtime>://<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId {
    pub runtime: String,
    pub id: String,
}

impl ContainerId {
    pub fn parse(raw: &str) -> Result<Self, Report<CgroupError>> {
        let invalid = || {
            Report::new(CgroupError::InvalidContainerId {
                container_id: raw.to_string(),
            })
        };
        let (runtime, id) = raw.split_once("://").ok_or_else(invalid)?;
        if runtime.is_empty() || id.is_empty() || id.contains('/') {
            return Err(invalid());
        }
        Ok(Self {
            runtime: runtime.to_string(),
            id: id.to_string(),
        })
    }

    /// Prefix of the container's systemd scope unit.
    fn scope_prefix(&self) -> &str {
        match self.runtime.as_str() {
            "containerd" => "cri-containerd",
            "cri-o" => "crio",
            other => other,
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.runtime, self.id)
    }
}

/// Cgroup path of a container relative to the controller root.
pub fn container_cgroup_path(
    driver: CgroupDriver,
    qos: QosClass,
    pod_uid: &str,
    container: &ContainerId,
) -> Result<String, Report<CgroupError>> {
    let pod_component = format!("pod{pod_uid}");
    let mut components = qos.parent_components();
    components.push(&pod_component);

    match driver {
        CgroupDriver::Cgroupfs => Ok(format!("/{}/{}", components.join("/"), container.id)),
        CgroupDriver::Systemd => {
            let escaped: Vec<String> = components.iter().map(|c| c.replace('-', "_")).collect();
            let slice = expand_slice(&format!("{}{SYSTEMD_SLICE_SUFFIX}", escaped.join("-")))?;
            Ok(format!(
                "{slice}/{}-{}.scope",
                container.scope_prefix(),
                container.id
            ))
        }
    }
}

/// Expands a systemd slice name into its full hierarchy, e.g.
/// `a-b.slice` becomes `/a.slice/a-b.slice`.
pub fn expand_slice(slice: &str) -> Result<String, Report<CgroupError>> {
    let invalid = || {
        Report::new(CgroupError::InvalidSlice {
            slice: slice.to_string(),
        })
    };
    let name = slice.strip_suffix(SYSTEMD_SLICE_SUFFIX).ok_or_else(invalid)?;
    if name.contains('/') {
        return Err(invalid());
    }
    if name == "-" {
        return Ok("/".to_string());
    }

    let mut path = String::new();
    let mut prefix = String::new();
    for component in name.split('-') {
        if component.is_empty() {
            return Err(invalid());
        }
        path.push('/');
        path.push_str(&prefix);
        path.push_str(component);
        path.push_str(SYSTEMD_SLICE_SUFFIX);
        prefix.push_str(component);
        prefix.push('-');
    }
    Ok(path)
}

/// The devices cgroup of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCgroup {
    path: PathBuf,
}

impl DeviceCgroup {
    pub fn new(root: &Path, relative_path: &str) -> Self {
        Self {
            path: root.join(relative_path.trim_start_matches('/')),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn allow(&self, rule: &DeviceRule) -> Result<(), Report<CgroupError>> {
        self.write_rule(DEVICES_ALLOW, rule)
    }

    pub fn deny(&self, rule: &DeviceRule) -> Result<(), Report<CgroupError>> {
        self.write_rule(DEVICES_DENY, rule)
    }

    fn write_rule(&self, file: &str, rule: &DeviceRule) -> Result<(), Report<CgroupError>> {
        let target = self.path.join(file);
        let write_failed = || CgroupError::WriteFailed {
            path: target.display().to_string(),
        };
        let mut handle = OpenOptions::new()
            .append(true)
            .open(&target)
            .change_context_lazy(write_failed)?;
        handle
            .write_all(format!("{rule}\n").as_bytes())
            .change_context_lazy(write_failed)?;
        tracing::debug!(path = %target.display(), %rule, "wrote device rule");
        Ok(())
    }

    /// Process ids resident in the cgroup, in file order.
    pub fn pids(&self) -> Result<Vec<u32>, Report<CgroupError>> {
        let procs = self.path.join(CGROUP_PROCS);
        let read_failed = || CgroupError::ReadFailed {
            path: procs.display().to_string(),
        };
        let content = std::fs::read_to_string(&procs).change_context_lazy(read_failed)?;
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<u32>()
                    .change_context_lazy(read_failed)
                    .attach_printable_lazy(|| format!("invalid pid {line:?}"))
            })
            .collect()
    }

    /// A process whose namespaces represent the container.
    pub fn representative_pid(&self) -> Result<u32, Report<CgroupError>> {
        self.pids()?.into_iter().next().ok_or_else(|| {
            Report::new(CgroupError::NoProcesses {
                path: self.path.display().to_string(),
            })
        })
    }
}

/// A character device rule as written to `devices.allow` / `devices.deny`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
    pub major: u32,
    pub minor: u32,
    pub permission: String,
}

impl std::fmt::Display for DeviceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c {}:{} {}", self.major, self.minor, self.permission)
    }
}
