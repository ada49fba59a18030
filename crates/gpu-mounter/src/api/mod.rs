//! HTTP API of the worker
//!
//! # API Endpoints
//!
//! - `GET /` - banner
//! - `GET /addgpu/namespace/:namespace/pod/:pod/gpu/:gpu_num?entire_mount=true` -
//!   attach GPUs to a running pod
//! - `POST /removegpu/namespace/:namespace/pod/:pod/force/:force` - detach the
//!   GPUs named by the `uuids` form field (repeated or comma separated)
//! - `GET /devices` - GPU inventory of the node

use core::error::Error;
use std::sync::Arc;

use poem::get;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;

use crate::service::GpuMounter;

pub mod handlers;
pub mod server;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

pub fn routes(mounter: Arc<GpuMounter>) -> impl Endpoint {
    Route::new()
        .at("/", get(handlers::index))
        .at(
            "/addgpu/namespace/:namespace/pod/:pod/gpu/:gpu_num",
            get(handlers::add_gpu),
        )
        .at(
            "/removegpu/namespace/:namespace/pod/:pod/force/:force",
            post(handlers::remove_gpu),
        )
        .at("/devices", get(handlers::list_devices))
        .data(mounter)
}
