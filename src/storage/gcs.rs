//! Google Cloud Storage provider (JSON API over `reqwest`)
//!
//! Versions are object generations. Conditional writes use
//! `ifGenerationMatch`, where generation `0` means "must not exist"; a failed
//! precondition comes back as HTTP 412.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ObjectVersion, Precondition, StorageBackend, StorageBackendType, StorageError, StorageResult,
    StoredObject, WriteOutcome,
};
use crate::config::StorageConfig;
use crate::secrets::SecretString;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const GENERATION_HEADER: &str = "x-goog-generation";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// How requests are authorized
#[derive(Debug, Clone)]
pub enum GcsCredentials {
    /// No `Authorization` header, for emulators
    Anonymous,
    /// OAuth access token read from a file on every request, so rotated
    /// tokens are picked up without a restart
    TokenFile(PathBuf),
    /// Workload identity through the GCE metadata server
    MetadataServer { url: String, cached: Arc<Mutex<Option<CachedToken>>> },
}

impl GcsCredentials {
    pub fn metadata_server() -> Self {
        Self::MetadataServer { url: METADATA_TOKEN_URL.to_string(), cached: Arc::default() }
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    token: SecretString,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: SecretString,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    generation: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectName>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectName {
    name: String,
}

#[derive(Debug, Clone)]
pub struct GcsBackend {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    credentials: GcsCredentials,
}

impl GcsBackend {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        credentials: GcsCredentials,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            credentials,
        }
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::config("GCS storage requires a bucket name"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StorageError::config(format!("Failed to build HTTP client: {}", e)))?;

        let credentials = match (&config.gcs_token_file, &config.endpoint) {
            (Some(path), _) => GcsCredentials::TokenFile(path.clone()),
            (None, Some(_)) => GcsCredentials::Anonymous,
            (None, None) => GcsCredentials::metadata_server(),
        };
        let endpoint = config.endpoint.clone().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Ok(Self::new(client, endpoint, config.bucket.clone(), credentials))
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/storage/v1/b/{}/o/{}", self.endpoint, self.bucket, urlencoding::encode(path))
    }

    async fn access_token(&self) -> StorageResult<Option<SecretString>> {
        match &self.credentials {
            GcsCredentials::Anonymous => Ok(None),
            GcsCredentials::TokenFile(path) => SecretString::from_file(path)
                .await
                .map(Some)
                .map_err(|e| {
                    StorageError::config(format!(
                        "Failed to read GCS token file '{}': {}",
                        path.display(),
                        e
                    ))
                }),
            GcsCredentials::MetadataServer { url, cached } => {
                let mut cached = cached.lock().await;
                if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
                    return Ok(Some(token.token.clone()));
                }

                let response =
                    self.client.get(url).header("Metadata-Flavor", "Google").send().await?;
                if !response.status().is_success() {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(StorageError::from_status(status, "metadata token", &body));
                }

                let token: MetadataToken = response.json().await?;
                let lifetime = Duration::from_secs(token.expires_in)
                    .saturating_sub(TOKEN_REFRESH_MARGIN);
                debug!(expires_in = token.expires_in, "Refreshed GCS access token");

                *cached = Some(CachedToken {
                    token: token.access_token.clone(),
                    refresh_at: Instant::now() + lifetime,
                });
                Ok(Some(token.access_token))
            }
        }
    }

    async fn authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> StorageResult<reqwest::RequestBuilder> {
        Ok(match self.access_token().await? {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        })
    }
}

async fn error_for(response: reqwest::Response, context: &str) -> StorageError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StorageError::from_status(status, context, &body)
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        let request = self.client.get(self.object_url(path)).query(&[("alt", "media")]);
        let response = self.authorized(request).await?.send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response, "GCS read").await);
        }

        let generation = response
            .headers()
            .get(GENERATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StorageError::internal("GCS read response has no generation header"))?;
        let bytes = response.bytes().await?;

        Ok(Some(StoredObject { bytes, version: ObjectVersion::new(generation) }))
    }

    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome> {
        let generation = match precondition {
            Precondition::Absent => "0",
            Precondition::Matches(version) => version.as_str(),
        };

        let url = format!("{}/upload/storage/v1/b/{}/o", self.endpoint, self.bucket);
        let request = self
            .client
            .post(url)
            .query(&[("uploadType", "media"), ("name", path), ("ifGenerationMatch", generation)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes);
        let response = self.authorized(request).await?.send().await?;

        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Ok(WriteOutcome::PreconditionFailed);
        }
        if !response.status().is_success() {
            return Err(error_for(response, "GCS write").await);
        }

        let object: ObjectResource = response.json().await?;
        Ok(WriteOutcome::Written(ObjectVersion::new(object.generation)))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let url = format!("{}/storage/v1/b/{}/o", self.endpoint, self.bucket);
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("prefix", prefix.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let request = self.client.get(&url).query(&query);
            let response = self.authorized(request).await?.send().await?;
            if !response.status().is_success() {
                return Err(error_for(response, "GCS list").await);
            }

            let page: ObjectList = response.json().await?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn backend_type(&self) -> StorageBackendType {
        StorageBackendType::Gcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> GcsBackend {
        GcsBackend::new(reqwest::Client::new(), server.uri(), "oidc-bucket", GcsCredentials::Anonymous)
    }

    #[tokio::test]
    async fn read_returns_bytes_and_generation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/oidc-bucket/o/openid%2Fv1%2Fjwks"))
            .and(query_param("alt", "media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-goog-generation", "1712")
                    .set_body_string("{\"keys\":[]}"),
            )
            .mount(&server)
            .await;

        let object = backend(&server).read("openid/v1/jwks").await.unwrap().unwrap();
        assert_eq!(object.version.as_str(), "1712");
        assert_eq!(object.bytes, Bytes::from_static(b"{\"keys\":[]}"));
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        assert!(backend(&server).read("openid/v1/jwks").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_uses_generation_zero() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/oidc-bucket/o"))
            .and(query_param("name", "openid/v1/jwks"))
            .and(query_param("ifGenerationMatch", "0"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "openid/v1/jwks",
                "generation": "42"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = backend(&server)
            .write_if_match("openid/v1/jwks", Bytes::from_static(b"{}"), &Precondition::Absent)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(ObjectVersion::new("42")));
    }

    #[tokio::test]
    async fn precondition_failure_maps_to_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("ifGenerationMatch", "41"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let outcome = backend(&server)
            .write_if_match(
                "openid/v1/jwks",
                Bytes::from_static(b"{}"),
                &Precondition::Matches(ObjectVersion::new("41")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::PreconditionFailed);
    }

    #[tokio::test]
    async fn forbidden_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("caller lacks storage.objects.create"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .write_if_match("a", Bytes::from_static(b"{}"), &Precondition::Absent)
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn list_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/oidc-bucket/o"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "prod/clusters/a1/openid/v1/jwks"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/oidc-bucket/o"))
            .and(query_param("prefix", "prod/clusters/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "prod/clusters/b2/openid/v1/jwks"}],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;

        let names = backend(&server).list("prod/clusters/").await.unwrap();
        assert_eq!(
            names,
            vec!["prod/clusters/a1/openid/v1/jwks".to_string(), "prod/clusters/b2/openid/v1/jwks".to_string()]
        );
    }

    #[tokio::test]
    async fn token_file_is_sent_as_bearer() {
        let server = MockServer::start().await;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"ya29.test\n").unwrap();

        Mock::given(method("GET"))
            .and(header("authorization", "Bearer ya29.test"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let backend = GcsBackend::new(
            reqwest::Client::new(),
            server.uri(),
            "oidc-bucket",
            GcsCredentials::TokenFile(file.path().to_path_buf()),
        );
        assert!(backend.read("a").await.unwrap().is_none());
    }
}
