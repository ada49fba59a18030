//! Client of the kubelet pod-resources API.
//!
//! The kubelet serves `PodResourcesLister` on a local unix socket. Listing it
//! is the authoritative source of which pod currently holds which device.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;
use tracing::debug;

// Include generated protobuf code
pub mod pod_resources {
    tonic::include_proto!("v1");
}

/// Default path of the kubelet pod-resources socket.
pub const DEFAULT_KUBELET_SOCKET_PATH: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Devices of one resource assigned to one container of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAssignment {
    pub pod_name: String,
    pub namespace: String,
    pub resource_name: String,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("Kubelet socket file does not exist: {path}")]
    SocketMissing { path: String },
    #[error("Failed to connect to kubelet socket: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to list pod resources: {message}")]
    RequestFailed { message: String },
}

/// Source of the node's current device assignments.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list_assignments(&self) -> Result<Vec<ResourceAssignment>, Report<ListingError>>;
}

pub struct KubeletResourceLister {
    socket_path: PathBuf,
    timeout: Duration,
}

impl KubeletResourceLister {
    pub fn new<P: Into<PathBuf>>(socket_path: P, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Create a gRPC channel connected to the kubelet unix socket
    async fn create_unix_channel(&self) -> Result<tonic::transport::Channel, io::Error> {
        use hyper_util::rt::TokioIo;
        use tonic::transport::{Endpoint, Uri};
        use tower::service_fn;

        let socket_path = self.socket_path.clone();

        // The URI is a placeholder, the connector always dials the unix socket
        let channel: tonic::transport::Channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| io::Error::other(e.to_string()))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    tokio::net::UnixStream::connect(socket_path)
                        .await
                        .map(TokioIo::new)
                }
            }))
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(channel)
    }
}

#[async_trait]
impl ResourceLister for KubeletResourceLister {
    #[tracing::instrument(skip(self), fields(socket = %self.socket_path.display()))]
    async fn list_assignments(&self) -> Result<Vec<ResourceAssignment>, Report<ListingError>> {
        if tokio::fs::metadata(&self.socket_path).await.is_err() {
            return Err(Report::new(ListingError::SocketMissing {
                path: self.socket_path.display().to_string(),
            }));
        }

        let channel =
            self.create_unix_channel()
                .await
                .map_err(|e| ListingError::ConnectionFailed {
                    message: e.to_string(),
                })?;

        let mut client =
            pod_resources::pod_resources_lister_client::PodResourcesListerClient::new(channel);

        let request = tonic::Request::new(pod_resources::ListPodResourcesRequest {});
        let response = client
            .list(request)
            .await
            .map_err(|e| ListingError::RequestFailed {
                message: e.to_string(),
            })?
            .into_inner();

        debug!(
            "Processing {} pods for assigned devices",
            response.pod_resources.len()
        );

        Ok(flatten_response(response))
    }
}

fn flatten_response(response: pod_resources::ListPodResourcesResponse) -> Vec<ResourceAssignment> {
    let mut assignments = Vec::new();
    for pod in response.pod_resources {
        for container in pod.containers {
            for devices in container.devices {
                if devices.device_ids.is_empty() {
                    continue;
                }
                assignments.push(ResourceAssignment {
                    pod_name: pod.name.clone(),
                    namespace: pod.namespace.clone(),
                    resource_name: devices.resource_name,
                    device_ids: devices.device_ids,
                });
            }
        }
    }
    assignments
}
