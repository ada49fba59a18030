//! NVIDIA Management Library (NVML) integration
//!
//! NVML is initialised for every query and shut down when the handle is
//! dropped, so a driver reload on the node never leaves a stale session.

use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use thiserror::Error;

/// Static identity of a GPU as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub minor_number: u32,
    pub uuid: String,
}

/// A process holding a context on a GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: u32,
    pub used_memory: Option<u64>,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to initialize NVML")]
    InitFailed,
    #[error("NVML query failed: {message}")]
    QueryFailed { message: String },
}

/// Device inventory and process telemetry.
pub trait DeviceTelemetry: Send + Sync {
    /// Every GPU on the node.
    fn devices(&self) -> Result<Vec<DeviceIdentity>, Report<TelemetryError>>;

    /// Graphics and compute processes currently running on the GPU.
    fn active_processes(&self, uuid: &str) -> Result<Vec<GpuProcess>, Report<TelemetryError>>;
}

pub fn init_nvml() -> Result<Nvml, Report<TelemetryError>> {
    match Nvml::init() {
        Ok(nvml) => Ok(nvml),
        Err(_) => {
            tracing::debug!("Standard NVML init failed, trying with explicit library path");
            Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
                .change_context(TelemetryError::InitFailed)
        }
    }
}

/// [`DeviceTelemetry`] backed by NVML.
#[derive(Debug, Default)]
pub struct NvmlTelemetry;

impl NvmlTelemetry {
    pub fn new() -> Self {
        Self
    }
}

fn query_failed(what: String) -> TelemetryError {
    TelemetryError::QueryFailed { message: what }
}

impl DeviceTelemetry for NvmlTelemetry {
    fn devices(&self) -> Result<Vec<DeviceIdentity>, Report<TelemetryError>> {
        let nvml = init_nvml()?;
        let device_count = nvml
            .device_count()
            .change_context_lazy(|| query_failed("device count".to_string()))?;

        tracing::info!("Discovered {} GPU device(s)", device_count);

        let mut devices = Vec::with_capacity(device_count as usize);
        for i in 0..device_count {
            let device = nvml
                .device_by_index(i)
                .change_context_lazy(|| query_failed(format!("handle of GPU {i}")))?;
            let minor_number = device
                .minor_number()
                .change_context_lazy(|| query_failed(format!("minor number of GPU {i}")))?;
            let uuid = device
                .uuid()
                .change_context_lazy(|| query_failed(format!("uuid of GPU {i}")))?;

            tracing::info!(minor_number, uuid = %uuid, "Found GPU {i}");
            devices.push(DeviceIdentity { minor_number, uuid });
        }
        Ok(devices)
    }

    fn active_processes(&self, uuid: &str) -> Result<Vec<GpuProcess>, Report<TelemetryError>> {
        let nvml = init_nvml()?;
        let device = nvml
            .device_by_uuid(uuid)
            .change_context_lazy(|| query_failed(format!("handle of GPU {uuid}")))?;

        let graphics = device
            .running_graphics_processes()
            .change_context_lazy(|| query_failed(format!("graphics processes on GPU {uuid}")))?;
        let compute = device
            .running_compute_processes()
            .change_context_lazy(|| query_failed(format!("compute processes on GPU {uuid}")))?;

        Ok(graphics
            .into_iter()
            .chain(compute)
            .map(|process| GpuProcess {
                pid: process.pid,
                used_memory: match process.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => Some(bytes),
                    UsedGpuMemory::Unavailable => None,
                },
            })
            .collect())
    }
}
