//! Kubernetes API access for consumer and placeholder pods.

use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Pod not found: {name} in namespace {namespace}")]
    NotFound { name: String, namespace: String },
    #[error("Kubernetes API request failed: {message}")]
    RequestFailed { message: String },
}

/// Returns true when the report is rooted in a missing object.
pub fn is_not_found(report: &Report<KubernetesError>) -> bool {
    matches!(report.current_context(), KubernetesError::NotFound { .. })
}

/// Pod operations the mount engine needs from the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Report<KubernetesError>>;

    /// Deletes a pod, `grace_period_seconds = Some(0)` removes it immediately.
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Report<KubernetesError>>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, Report<KubernetesError>>;
}

pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            // Load kubeconfig from the specified file
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => {
            // Use default configuration (in-cluster or ~/.kube/config)
            Client::try_default()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "Failed to create Kubernetes client".to_string(),
                })?
        }
    };
    Ok(client)
}

/// [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error(err: kube::Error, namespace: &str, name: &str) -> Report<KubernetesError> {
    match err {
        kube::Error::Api(response) if response.code == 404 => {
            Report::new(KubernetesError::NotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
        }
        other => Report::new(KubernetesError::RequestFailed {
            message: format!("pod {namespace}/{name}: {other}"),
        }),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, namespace, name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Report<KubernetesError>> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        debug!(namespace, name, "creating pod");
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| map_kube_error(e, namespace, name))
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Report<KubernetesError>> {
        let params = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        self.pods(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, namespace, name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let params = ListParams::default().labels(label_selector);
        self.pods(namespace)
            .list(&params)
            .await
            .map(|list| list.items)
            .change_context(KubernetesError::RequestFailed {
                message: format!("list pods in {namespace} with selector {label_selector}"),
            })
    }
}
