//! In-cluster source: the API server's own OIDC endpoints through `kube::Client`
//!
//! The client carries the pod's service account credentials, which the API
//! server requires for these endpoints unless anonymous access is granted.

use async_trait::async_trait;
use kube::Client;
use std::time::Duration;

use super::{UpstreamError, UpstreamSource, DISCOVERY_ENDPOINT, JWKS_ENDPOINT};

#[derive(Clone)]
pub struct KubernetesSource {
    client: Client,
    timeout: Duration,
}

impl std::fmt::Debug for KubernetesSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesSource").field("timeout", &self.timeout).finish()
    }
}

impl KubernetesSource {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn get(&self, endpoint: &str) -> Result<Vec<u8>, UpstreamError> {
        let request = ::http::Request::get(endpoint)
            .header(::http::header::ACCEPT, "application/json")
            .body(Vec::new())
            .map_err(|e| UpstreamError::Http { endpoint: endpoint.to_string(), message: e.to_string() })?;

        match tokio::time::timeout(self.timeout, self.client.request_text(request)).await {
            Ok(Ok(body)) => Ok(body.into_bytes()),
            Ok(Err(kube::Error::Api(e))) => {
                Err(UpstreamError::Status { endpoint: endpoint.to_string(), status: e.code })
            }
            Ok(Err(e)) => Err(UpstreamError::Kubernetes { message: format!("{endpoint}: {e}") }),
            Err(_) => Err(UpstreamError::Timeout { endpoint: endpoint.to_string(), after: self.timeout }),
        }
    }
}

#[async_trait]
impl UpstreamSource for KubernetesSource {
    async fn discovery(&self) -> Result<Vec<u8>, UpstreamError> {
        self.get(DISCOVERY_ENDPOINT).await
    }

    async fn jwks(&self) -> Result<Vec<u8>, UpstreamError> {
        self.get(JWKS_ENDPOINT).await
    }

    fn describe(&self) -> String {
        "kubernetes-api-server".to_string()
    }
}
