//! Conditional publishing with bounded retries
//!
//! [`ConditionalWriter`] is the single write path for every published object:
//! read the current version, skip if the bytes are already there, otherwise
//! write with the observed version as precondition. A lost race ends the
//! operation successfully. Callers that derive their bytes from a versioned
//! source pass a currency check, consulted before every write, so a retry never
//! lands content that a newer source version has replaced. Transient failures
//! are retried with exponential backoff, each attempt bounded by its own
//! timeout; permission faults and other terminal errors are returned
//! immediately.

use bytes::Bytes;
use futures::future;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ObjectVersion, Precondition, StorageBackend, StorageError, StorageResult, StoredObject,
    WriteOutcome,
};

/// Configuration for retry behavior on transient errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration before first retry
    pub initial_backoff: Duration,
    /// Maximum backoff duration (cap for exponential growth)
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub backoff_multiplier: f64,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Calculate the backoff duration for a given attempt number (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * multiplier;
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }
}

/// Result of publishing one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Our write committed
    Written(ObjectVersion),
    /// The object already held these exact bytes
    Unchanged,
    /// Another writer changed the object between our read and write
    LostRace,
    /// The bytes no longer reflect the latest source version; nothing was written
    Superseded,
}

impl PublishOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Written(_) => "written",
            Self::Unchanged => "unchanged",
            Self::LostRace => "lost_race",
            Self::Superseded => "superseded",
        }
    }
}

#[derive(Debug)]
pub struct ConditionalWriter<S> {
    backend: Arc<S>,
    retry: RetryConfig,
}

impl<S> Clone for ConditionalWriter<S> {
    fn clone(&self) -> Self {
        Self { backend: Arc::clone(&self.backend), retry: self.retry.clone() }
    }
}

impl<S: StorageBackend> ConditionalWriter<S> {
    pub fn new(backend: Arc<S>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.backend
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Publish `bytes` at `path` unless it already holds them
    pub async fn publish(&self, path: &str, bytes: Bytes) -> StorageResult<PublishOutcome> {
        self.publish_while(path, bytes, || future::ready(Ok(true))).await
    }

    /// Publish `bytes` while `is_current` holds
    ///
    /// `is_current` runs after each attempt has read the object and before it
    /// writes. A newer publication that lands after that read changes the
    /// object version, so the conditional write loses instead of overwriting it.
    pub async fn publish_while<G, GFut>(
        &self,
        path: &str,
        bytes: Bytes,
        is_current: G,
    ) -> StorageResult<PublishOutcome>
    where
        G: Fn() -> GFut,
        GFut: Future<Output = StorageResult<bool>>,
    {
        let outcome = self
            .with_retry("publish", path, || self.publish_attempt(path, &bytes, &is_current))
            .await?;

        match &outcome {
            PublishOutcome::Written(version) => {
                debug!(path = %path, version = %version, "Published object");
            }
            PublishOutcome::Unchanged => debug!(path = %path, "Object already up to date"),
            PublishOutcome::LostRace => {
                debug!(path = %path, "Conditional write lost to a concurrent writer");
            }
            PublishOutcome::Superseded => {
                debug!(path = %path, "Source moved on before the write, dropping stale content");
            }
        }
        Ok(outcome)
    }

    pub async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        self.with_retry("read", path, || self.backend.read(path)).await
    }

    pub async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.with_retry("list", prefix, || self.backend.list(prefix)).await
    }

    async fn publish_attempt<G, GFut>(
        &self,
        path: &str,
        bytes: &Bytes,
        is_current: &G,
    ) -> StorageResult<PublishOutcome>
    where
        G: Fn() -> GFut,
        GFut: Future<Output = StorageResult<bool>>,
    {
        let current = self.backend.read(path).await?;
        if current.as_ref().is_some_and(|object| object.bytes == *bytes) {
            return Ok(PublishOutcome::Unchanged);
        }
        if !is_current().await? {
            return Ok(PublishOutcome::Superseded);
        }

        let precondition = Precondition::from_current(current.as_ref());
        match self.backend.write_if_match(path, bytes.clone(), &precondition).await? {
            WriteOutcome::Written(version) => Ok(PublishOutcome::Written(version)),
            WriteOutcome::PreconditionFailed => Ok(PublishOutcome::LostRace),
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        path: &str,
        mut attempt_fn: F,
    ) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let backoff = self.retry.backoff_for_attempt(attempt);
                warn!(
                    operation,
                    path = %path,
                    attempt = attempt + 1,
                    max_attempts = self.retry.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying storage operation after backoff"
                );
                tokio::time::sleep(backoff).await;
            }

            let error = match tokio::time::timeout(self.retry.attempt_timeout, attempt_fn()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => StorageError::Timeout { after: self.retry.attempt_timeout },
            };

            if error.is_retryable() && attempt + 1 < self.retry.max_attempts {
                warn!(
                    operation,
                    path = %path,
                    error = %error,
                    attempt = attempt + 1,
                    "Transient storage error, will retry"
                );
                last_error = Some(error);
                continue;
            }

            return Err(error);
        }

        Err(last_error.unwrap_or_else(|| {
            StorageError::config(format!("{operation} on '{path}' configured with zero attempts"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    fn writer(backend: &MemoryBackend, max_attempts: u32) -> ConditionalWriter<MemoryBackend> {
        ConditionalWriter::new(Arc::new(backend.clone()), fast_retry(max_attempts))
    }

    #[test]
    fn test_retry_config_backoff_calculation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            ..RetryConfig::default()
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn publish_creates_then_skips_identical_bytes() {
        let backend = MemoryBackend::new();
        let writer = writer(&backend, 3);

        let first = writer.publish("openid/v1/jwks", Bytes::from_static(b"{}")).await.unwrap();
        assert!(matches!(first, PublishOutcome::Written(_)));

        let second = writer.publish("openid/v1/jwks", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(second, PublishOutcome::Unchanged);
        assert_eq!(backend.successful_writes().await, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = MemoryBackend::new();
        backend.fail_next_writes(2).await;

        let outcome = writer(&backend, 3).publish("a", Bytes::from_static(b"1")).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Written(_)));
        assert_eq!(backend.write_attempts().await, 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = MemoryBackend::new();
        backend.fail_next_writes(10).await;

        let err = writer(&backend, 3).publish("a", Bytes::from_static(b"1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.write_attempts().await, 3);
        assert!(backend.get_bytes("a").await.is_none());
    }

    #[tokio::test]
    async fn retry_after_source_moved_on_is_superseded() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let backend = MemoryBackend::new();
        backend.fail_next_writes(1).await;
        let checks = AtomicU32::new(0);

        let outcome = writer(&backend, 3)
            .publish_while("a", Bytes::from_static(b"old"), || {
                future::ready(Ok(checks.fetch_add(1, Ordering::SeqCst) == 0))
            })
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Superseded);
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert_eq!(backend.write_attempts().await, 1);
        assert!(backend.get_bytes("a").await.is_none());
    }

    #[tokio::test]
    async fn permission_denied_is_not_retried() {
        let backend = MemoryBackend::new();
        backend.deny_writes(true).await;

        let err = writer(&backend, 5).publish("a", Bytes::from_static(b"1")).await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(backend.write_attempts().await, 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let backend = MemoryBackend::new();
        backend.set_latency(Some(Duration::from_secs(5))).await;

        let err = writer(&backend, 2).read("a").await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout { .. }));
    }
}
