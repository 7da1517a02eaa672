//! In-process object store
//!
//! Implements the same conditional-write contract as the cloud providers, with
//! generation numbers as versions. Clones share state, so several in-process
//! "replicas" can race against one store. Fault injection hooks let tests
//! drive the retry and permission paths.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    ObjectVersion, Precondition, StorageBackend, StorageBackendType, StorageError, StorageResult,
    StoredObject, WriteOutcome,
};

#[derive(Debug, Clone)]
struct MemoryObject {
    bytes: Bytes,
    generation: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, MemoryObject>,
    last_generation: u64,
    read_failures: u32,
    write_failures: u32,
    deny_writes: bool,
    latency: Option<Duration>,
    write_attempts: usize,
    successful_writes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object unconditionally, returning its version
    pub async fn insert(&self, path: &str, bytes: impl Into<Bytes>) -> ObjectVersion {
        let mut state = self.state.lock().await;
        state.last_generation += 1;
        let generation = state.last_generation;
        state.objects.insert(path.to_string(), MemoryObject { bytes: bytes.into(), generation });
        ObjectVersion::new(generation.to_string())
    }

    pub async fn remove(&self, path: &str) -> bool {
        self.state.lock().await.objects.remove(path).is_some()
    }

    pub async fn get_bytes(&self, path: &str) -> Option<Bytes> {
        self.state.lock().await.objects.get(path).map(|o| o.bytes.clone())
    }

    pub async fn paths(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    /// Fail the next `count` reads with a transient error
    pub async fn fail_next_reads(&self, count: u32) {
        self.state.lock().await.read_failures = count;
    }

    /// Fail the next `count` writes with a transient error
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.write_failures = count;
    }

    /// Reject every write with a permission error
    pub async fn deny_writes(&self, deny: bool) {
        self.state.lock().await.deny_writes = deny;
    }

    /// Delay every operation, for exercising per-attempt timeouts
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Write calls received, including failed and rejected ones
    pub async fn write_attempts(&self) -> usize {
        self.state.lock().await.write_attempts
    }

    pub async fn successful_writes(&self) -> usize {
        self.state.lock().await.successful_writes
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;

        if state.read_failures > 0 {
            state.read_failures -= 1;
            return Err(StorageError::transient(format!("injected read failure for '{path}'")));
        }

        Ok(state.objects.get(path).map(|object| StoredObject {
            bytes: object.bytes.clone(),
            version: ObjectVersion::new(object.generation.to_string()),
        }))
    }

    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.write_attempts += 1;

        if state.deny_writes {
            return Err(StorageError::permission_denied(format!("writes to '{path}' are denied")));
        }
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(StorageError::transient(format!("injected write failure for '{path}'")));
        }

        let current = state.objects.get(path).map(|o| o.generation);
        let matches = match (precondition, current) {
            (Precondition::Absent, None) => true,
            (Precondition::Matches(expected), Some(generation)) => {
                expected.as_str() == generation.to_string()
            }
            _ => false,
        };
        if !matches {
            return Ok(WriteOutcome::PreconditionFailed);
        }

        state.last_generation += 1;
        let generation = state.last_generation;
        state.objects.insert(path.to_string(), MemoryObject { bytes, generation });
        state.successful_writes += 1;

        Ok(WriteOutcome::Written(ObjectVersion::new(generation.to_string())))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        Ok(state.objects.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    fn backend_type(&self) -> StorageBackendType {
        StorageBackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conformance;

    #[tokio::test]
    async fn memory_backend_conformance() {
        conformance::run_all(&MemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next_writes(2).await;

        for _ in 0..2 {
            let err = backend
                .write_if_match("a", Bytes::from_static(b"1"), &Precondition::Absent)
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }

        let outcome =
            backend.write_if_match("a", Bytes::from_static(b"1"), &Precondition::Absent).await;
        assert!(matches!(outcome, Ok(WriteOutcome::Written(_))));
        assert_eq!(backend.write_attempts().await, 3);
        assert_eq!(backend.successful_writes().await, 1);
    }

    #[tokio::test]
    async fn denied_writes_report_permission_error() {
        let backend = MemoryBackend::new();
        backend.deny_writes(true).await;
        let err = backend
            .write_if_match("a", Bytes::from_static(b"1"), &Precondition::Absent)
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn generations_are_never_reused() {
        let backend = MemoryBackend::new();
        let first = backend.insert("a", Bytes::from_static(b"1")).await;
        backend.remove("a").await;
        let second = backend.insert("a", Bytes::from_static(b"1")).await;
        assert_ne!(first, second);

        let stale = backend
            .write_if_match("a", Bytes::from_static(b"2"), &Precondition::Matches(first))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::PreconditionFailed);
    }
}
