use std::sync::Arc;

use api_types::AttachRequest;
use api_types::AttachResponse;
use api_types::AttachResult;
use api_types::DetachRequest;
use api_types::DetachResponse;
use api_types::DetachResult;
use api_types::DeviceInfo;
use api_types::InventoryResponse;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::web::Query;
use poem::web::WithStatus;
use poem::IntoResponse;
use poem::Request;
use serde::Deserialize;
use tracing::info;
use tracing::warn;
use url::form_urlencoded;

use crate::service::GpuMounter;

const UUIDS_FIELD: &str = "uuids";

#[derive(Debug, Default, Deserialize)]
pub struct AddGpuQuery {
    #[serde(default)]
    pub entire_mount: bool,
}

fn attach_status(result: AttachResult) -> StatusCode {
    match result {
        AttachResult::Success => StatusCode::OK,
        AttachResult::ConsumerNotFound => StatusCode::NOT_FOUND,
        AttachResult::InsufficientCapacity
        | AttachResult::MountRejected
        | AttachResult::InvalidRequest => StatusCode::BAD_REQUEST,
        AttachResult::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn detach_status(result: DetachResult) -> StatusCode {
    match result {
        DetachResult::Success => StatusCode::OK,
        DetachResult::ConsumerNotFound => StatusCode::NOT_FOUND,
        DetachResult::DeviceBusy | DetachResult::DeviceNotFound | DetachResult::InvalidRequest => {
            StatusCode::BAD_REQUEST
        }
        DetachResult::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn attach_response(response: AttachResponse) -> WithStatus<Json<AttachResponse>> {
    let status = attach_status(response.result);
    Json(response).with_status(status)
}

fn detach_response(response: DetachResponse) -> WithStatus<Json<DetachResponse>> {
    let status = detach_status(response.result);
    Json(response).with_status(status)
}

/// Liveness banner.
#[handler]
pub async fn index() -> &'static str {
    "Hello From GPU Mounter Worker"
}

/// Attach `gpu_num` GPUs to a running pod
#[handler]
pub async fn add_gpu(
    Path((namespace, pod_name, gpu_num)): Path<(String, String, String)>,
    Query(query): Query<AddGpuQuery>,
    mounter: Data<&Arc<GpuMounter>>,
) -> WithStatus<Json<AttachResponse>> {
    let Ok(gpu_num) = gpu_num.parse::<u32>() else {
        warn!(%gpu_num, "invalid gpu number");
        return attach_response(AttachResponse {
            result: AttachResult::InvalidRequest,
            devices: Vec::new(),
            message: format!("invalid gpu number {gpu_num}"),
        });
    };

    let request = AttachRequest {
        pod_name,
        namespace,
        gpu_num,
        entire_mount: query.entire_mount,
    };
    info!(
        pod = %request.pod_name,
        namespace = %request.namespace,
        gpu_num,
        entire_mount = request.entire_mount,
        "received add gpu request"
    );

    match mounter.attach(&request).await {
        Ok(devices) => attach_response(AttachResponse {
            result: AttachResult::Success,
            devices: devices.iter().map(DeviceInfo::from).collect(),
            message: format!(
                "added {gpu_num} GPU(s) to pod {}/{}",
                request.namespace, request.pod_name
            ),
        }),
        Err(report) => {
            warn!("add gpu request failed: {report:?}");
            let error = report.current_context();
            attach_response(AttachResponse {
                result: error.attach_result(),
                devices: Vec::new(),
                message: error.to_string(),
            })
        }
    }
}

/// Detach GPUs from a running pod
#[handler]
pub async fn remove_gpu(
    req: &Request,
    Path((namespace, pod_name, force)): Path<(String, String, String)>,
    body: String,
    mounter: Data<&Arc<GpuMounter>>,
) -> WithStatus<Json<DetachResponse>> {
    let force = match force.as_str() {
        "0" => false,
        "1" => true,
        other => {
            warn!(force = other, "invalid force flag");
            return detach_response(DetachResponse {
                result: DetachResult::InvalidRequest,
                message: format!("invalid force flag {other}, expected 0 or 1"),
            });
        }
    };

    let query = req.uri().query().unwrap_or_default();
    let mut uuids = form_values(query.as_bytes(), UUIDS_FIELD);
    uuids.extend(form_values(body.as_bytes(), UUIDS_FIELD));

    let request = DetachRequest {
        pod_name,
        namespace,
        uuids,
        force,
    };
    info!(
        pod = %request.pod_name,
        namespace = %request.namespace,
        uuids = ?request.uuids,
        force,
        "received remove gpu request"
    );

    match mounter.detach(&request).await {
        Ok(removed) => detach_response(DetachResponse {
            result: DetachResult::Success,
            message: format!(
                "removed {} GPU(s) from pod {}/{}",
                removed.len(),
                request.namespace,
                request.pod_name
            ),
        }),
        Err(report) => {
            warn!("remove gpu request failed: {report:?}");
            let error = report.current_context();
            detach_response(DetachResponse {
                result: error.detach_result(),
                message: error.to_string(),
            })
        }
    }
}

/// Inventory of the node's GPUs
#[handler]
pub async fn list_devices(
    mounter: Data<&Arc<GpuMounter>>,
) -> WithStatus<Json<InventoryResponse>> {
    match mounter.inventory().await {
        Ok(devices) => Json(InventoryResponse {
            success: true,
            message: format!("{} GPU(s) on node", devices.len()),
            devices: devices.iter().map(DeviceInfo::from).collect(),
        })
        .with_status(StatusCode::OK),
        Err(report) => {
            warn!("failed to list devices: {report:?}");
            Json(InventoryResponse {
                success: false,
                devices: Vec::new(),
                message: report.current_context().to_string(),
            })
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Values of `field` in urlencoded input, both repeated and comma-separated
/// forms.
fn form_values(encoded: &[u8], field: &str) -> Vec<String> {
    form_urlencoded::parse(encoded)
        .filter(|(key, _)| key == field)
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}
