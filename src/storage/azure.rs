//! Azure Blob Storage provider (Blob REST API over `reqwest`, SAS auth)
//!
//! Versions are blob ETags. Replacing uses `If-Match: <etag>`, creating uses
//! `If-None-Match: *`. Azure answers a failed `If-Match` with 412 and a
//! create over an existing blob with 409, both mapped to
//! [`WriteOutcome::PreconditionFailed`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::StatusCode;

use super::{
    ObjectVersion, Precondition, StorageBackend, StorageBackendType, StorageError, StorageResult,
    StoredObject, WriteOutcome,
};
use crate::config::StorageConfig;
use crate::secrets::SecretString;

const API_VERSION: &str = "2021-08-06";

#[derive(Debug, Clone)]
pub struct AzureBackend {
    client: reqwest::Client,
    endpoint: String,
    container: String,
    sas_token: Option<SecretString>,
}

impl AzureBackend {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        container: impl Into<String>,
        sas_token: Option<SecretString>,
    ) -> Self {
        let sas_token = sas_token
            .map(|t| SecretString::new(t.expose_secret().trim_start_matches('?')))
            .filter(|t| !t.is_empty());
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            container: container.into(),
            sas_token,
        }
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::config("Azure storage requires a container name"));
        }

        let endpoint = match (&config.endpoint, &config.azure_account) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(account)) => format!("https://{}.blob.core.windows.net", account),
            (None, None) => {
                return Err(StorageError::config(
                    "Azure storage requires an account name or an explicit endpoint",
                ))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StorageError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::new(client, endpoint, config.bucket.clone(), config.azure_sas_token.clone()))
    }

    /// Blob or container URL; the SAS token is appended verbatim
    fn url(&self, path: Option<&str>, query: &str) -> String {
        let mut url = match path {
            Some(path) => format!("{}/{}/{}", self.endpoint, self.container, encode_blob_path(path)),
            None => format!("{}/{}", self.endpoint, self.container),
        };

        let mut params: Vec<&str> = Vec::new();
        if !query.is_empty() {
            params.push(query);
        }
        if let Some(sas) = &self.sas_token {
            params.push(sas.expose_secret());
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client.request(method, url).header("x-ms-version", API_VERSION)
    }
}

/// Percent-encode each path segment but keep the `/` separators
fn encode_blob_path(path: &str) -> String {
    path.split('/').map(|segment| urlencoding::encode(segment).into_owned()).collect::<Vec<_>>().join("/")
}

async fn error_for(response: reqwest::Response, context: &str) -> StorageError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StorageError::from_status(status, context, &body)
}

fn etag_of(response: &reqwest::Response) -> StorageResult<ObjectVersion> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ObjectVersion::new)
        .ok_or_else(|| StorageError::internal("Azure response has no ETag header"))
}

#[async_trait]
impl StorageBackend for AzureBackend {
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        let response = self.request(reqwest::Method::GET, self.url(Some(path), "")).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_for(response, "Azure read").await);
        }

        let version = etag_of(&response)?;
        let bytes = response.bytes().await?;
        Ok(Some(StoredObject { bytes, version }))
    }

    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome> {
        let request = self
            .request(reqwest::Method::PUT, self.url(Some(path), ""))
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-blob-content-type", "application/json")
            .header(CONTENT_TYPE, "application/json");
        let request = match precondition {
            Precondition::Absent => request.header(IF_NONE_MATCH, "*"),
            Precondition::Matches(version) => request.header(IF_MATCH, version.as_str()),
        };

        let response = request.body(bytes).send().await?;
        match response.status() {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                Ok(WriteOutcome::PreconditionFailed)
            }
            status if status.is_success() => Ok(WriteOutcome::Written(etag_of(&response)?)),
            _ => Err(error_for(response, "Azure write").await),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut query =
                format!("restype=container&comp=list&prefix={}", urlencoding::encode(prefix));
            if let Some(marker) = marker.take() {
                query.push_str(&format!("&marker={}", urlencoding::encode(&marker)));
            }

            let response = self.request(reqwest::Method::GET, self.url(None, &query)).send().await?;
            if !response.status().is_success() {
                return Err(error_for(response, "Azure list").await);
            }

            let body = response.text().await?;
            names.extend(xml_elements(&body, "Name"));

            match xml_elements(&body, "NextMarker").into_iter().next() {
                Some(next) if !next.is_empty() => marker = Some(next),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn backend_type(&self) -> StorageBackendType {
        StorageBackendType::Azure
    }
}

/// Text content of every `<tag>...</tag>` element in a list response.
///
/// The List Blobs response is flat enough that a tag scan is sufficient;
/// only the five predefined XML entities need decoding.
fn xml_elements(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = body;

    while let Some(start) = rest.find(&open) {
        let after_open = &rest[start + open.len()..];
        let Some(end) = after_open.find(&close) else { break };
        values.push(decode_xml_entities(&after_open[..end]));
        rest = &after_open[end + close.len()..];
    }
    values
}

fn decode_xml_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
