//! Plain HTTPS source, for issuers reachable outside the Kubernetes client
//! (API server behind a proxy, local development, tests).

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use super::{UpstreamError, UpstreamSource, DISCOVERY_ENDPOINT, JWKS_ENDPOINT};
use crate::secrets::SecretString;

#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    token_file: Option<PathBuf>,
}

impl HttpSource {
    pub fn new(
        base_url: impl Into<String>,
        token_file: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            UpstreamError::Http { endpoint: base_url.clone(), message: e.to_string() }
        })?;
        Ok(Self { client, base_url, token_file })
    }

    async fn get(&self, endpoint: &str) -> Result<Vec<u8>, UpstreamError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.client.get(&url).header(reqwest::header::ACCEPT, "application/json");

        if let Some(path) = &self.token_file {
            let token = SecretString::from_file(path).await.map_err(|e| UpstreamError::Http {
                endpoint: url.clone(),
                message: format!("failed to read token file '{}': {}", path.display(), e),
            })?;
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout { endpoint: url.clone(), after: Duration::ZERO }
            } else {
                UpstreamError::Http { endpoint: url.clone(), message: e.to_string() }
            }
        })?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status { endpoint: url, status: response.status().as_u16() });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Http { endpoint: url.clone(), message: e.to_string() })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl UpstreamSource for HttpSource {
    async fn discovery(&self) -> Result<Vec<u8>, UpstreamError> {
        self.get(DISCOVERY_ENDPOINT).await
    }

    async fn jwks(&self) -> Result<Vec<u8>, UpstreamError> {
        self.get(JWKS_ENDPOINT).await
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
