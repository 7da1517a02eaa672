//! Amazon S3 provider (`aws-sdk-s3`)
//!
//! Versions are ETags. Conditional writes use S3's `If-Match` and
//! `If-None-Match: *` on `PutObject`; S3 rejects a stale precondition with 412
//! and a concurrent conditional create with 409.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;

use super::{
    ObjectVersion, Precondition, StorageBackend, StorageBackendType, StorageError, StorageResult,
    StoredObject, WriteOutcome,
};
use crate::config::StorageConfig;

#[derive(Debug, Clone)]
pub struct S3Backend {
    client: S3Client,
    bucket: String,
}

impl S3Backend {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }

    pub async fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::config("S3 storage requires a bucket name"));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let timeouts = aws_sdk_s3::config::timeout::TimeoutConfig::builder()
            .operation_attempt_timeout(config.timeout())
            .build();
        let mut builder = aws_sdk_s3::config::Builder::from(&shared).timeout_config(timeouts);
        if let Some(endpoint) = &config.endpoint {
            // S3-compatible stores generally need path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::new(S3Client::from_conf(builder.build()), config.bucket.clone()))
    }
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, context: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageError::transient(format!("{context}: {}", DisplayErrorContext(&err)))
        }
        _ => match status_of(&err) {
            Some(status) => {
                StorageError::from_status(status, context, &DisplayErrorContext(&err).to_string())
            }
            None => StorageError::internal(format!("{context}: {}", DisplayErrorContext(&err))),
        },
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        let result = self.client.get_object().bucket(&self.bucket).key(path).send().await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let missing = err.as_service_error().is_some_and(|e| e.is_no_such_key())
                    || status_of(&err) == Some(404);
                if missing {
                    return Ok(None);
                }
                return Err(map_sdk_error(err, "S3 read"));
            }
        };

        let version = output
            .e_tag()
            .map(ObjectVersion::new)
            .ok_or_else(|| StorageError::internal("S3 object has no ETag"))?;
        let bytes: Bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::transient(format!("S3 read body: {}", e)))?
            .into_bytes();

        Ok(Some(StoredObject { bytes, version }))
    }

    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type("application/json")
            .body(ByteStream::from(bytes));
        let request = match precondition {
            Precondition::Absent => request.if_none_match("*"),
            Precondition::Matches(version) => request.if_match(version.as_str()),
        };

        match request.send().await {
            Ok(output) => {
                let version = output
                    .e_tag()
                    .map(ObjectVersion::new)
                    .ok_or_else(|| StorageError::internal("S3 PutObject returned no ETag"))?;
                Ok(WriteOutcome::Written(version))
            }
            Err(err) => match status_of(&err) {
                Some(412) | Some(409) => Ok(WriteOutcome::PreconditionFailed),
                _ => Err(map_sdk_error(err, "S3 write")),
            },
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, "S3 list"))?;

            names.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn backend_type(&self) -> StorageBackendType {
        StorageBackendType::S3
    }
}
