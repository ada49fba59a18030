use std::sync::Arc;

use error_stack::Report;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::EndpointExt;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::routes;
use super::ApiError;
use crate::service::GpuMounter;

/// HTTP API server of the worker
pub struct ApiServer {
    mounter: Arc<GpuMounter>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(mounter: Arc<GpuMounter>, listen_addr: String) -> Self {
        Self {
            mounter,
            listen_addr,
        }
    }

    /// Serves requests until the token is cancelled
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.mounter).with(Tracing);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeNode;

    #[tokio::test]
    async fn cancelled_server_returns_ok() {
        let node = FakeNode::new(1);
        let server = ApiServer::new(Arc::new(node.mounter()), "127.0.0.1:0".to_string());
        let token = CancellationToken::new();
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), server.run(token))
            .await
            .expect("server should stop once cancelled");
        assert!(result.is_ok());
    }
}
