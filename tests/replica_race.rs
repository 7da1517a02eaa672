//! Concurrent replicas racing on storage and on the shared cache

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Barrier};

use oidc_bridge::cache::{CacheError, CacheSnapshot, CacheVersion, MemoryCache, SharedCache, VersionedSnapshot};
use oidc_bridge::domain::{DISCOVERY_PATH, JWKS_PATH};
use oidc_bridge::services::{Bridge, BridgeSettings, PollOutcome, PublicationTarget, Publisher, RotationNotifier};
use oidc_bridge::storage::{
    ConditionalWriter, MemoryBackend, Precondition, PublishOutcome, StorageBackend, StorageBackendType,
    StorageResult, StoredObject, WriteOutcome,
};

use common::*;

/// Holds every read until all replicas have read, so they write against the same version
#[derive(Debug)]
struct LockstepBackend {
    inner: MemoryBackend,
    barrier: Arc<Barrier>,
    writes: AtomicUsize,
}

impl LockstepBackend {
    fn replicas(inner: &MemoryBackend, count: usize) -> Vec<Arc<Self>> {
        let barrier = Arc::new(Barrier::new(count));
        (0..count)
            .map(|_| {
                Arc::new(Self { inner: inner.clone(), barrier: barrier.clone(), writes: AtomicUsize::new(0) })
            })
            .collect()
    }
}

#[async_trait]
impl StorageBackend for LockstepBackend {
    async fn read(&self, path: &str) -> StorageResult<Option<StoredObject>> {
        let result = self.inner.read(path).await;
        self.barrier.wait().await;
        result
    }

    async fn write_if_match(
        &self,
        path: &str,
        bytes: Bytes,
        precondition: &Precondition,
    ) -> StorageResult<WriteOutcome> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_if_match(path, bytes, precondition).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_type(&self) -> StorageBackendType {
        StorageBackendType::Memory
    }
}

/// Shared cache whose reads wait for every racing leader
#[derive(Debug)]
struct LockstepCache {
    inner: MemoryCache,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl SharedCache for LockstepCache {
    async fn read(&self) -> Result<Option<VersionedSnapshot>, CacheError> {
        let result = self.inner.read().await;
        self.barrier.wait().await;
        result
    }

    async fn write(
        &self,
        snapshot: &CacheSnapshot,
        expected: Option<&CacheVersion>,
    ) -> Result<CacheVersion, CacheError> {
        self.inner.write(snapshot, expected).await
    }

    fn subscribe(&self) -> watch::Receiver<Option<CacheVersion>> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn exactly_one_conditional_write_wins() {
    let store = MemoryBackend::new();
    let replicas = LockstepBackend::replicas(&store, 2);
    let writers: Vec<_> = replicas.iter().map(|r| ConditionalWriter::new(r.clone(), fast_retry(3))).collect();

    let body = Bytes::from_static(br#"{"keys":[]}"#);
    let (first, second) = tokio::join!(
        writers[0].publish(JWKS_PATH, body.clone()),
        writers[1].publish(JWKS_PATH, body),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let written = outcomes.iter().filter(|o| matches!(o, PublishOutcome::Written(_))).count();
    let lost = outcomes.iter().filter(|o| **o == PublishOutcome::LostRace).count();
    assert_eq!((written, lost), (1, 1), "{outcomes:?}");

    for replica in &replicas {
        assert_eq!(replica.writes.load(Ordering::SeqCst), 1, "no replica writes twice");
    }
    assert_eq!(store.successful_writes().await, 1);
}

#[tokio::test]
async fn racing_publishers_converge_on_identical_documents() {
    let store = MemoryBackend::new();
    let cache = Arc::new(MemoryCache::new());
    let upstream = ScriptedUpstream::new(ISSUER, key_set(&[&rsa_key("a"), &rsa_key("b")]));
    let (_leader, leadership) = watch::channel(true);
    let (notifier, _events) = RotationNotifier::new();
    let settings = BridgeSettings {
        issuer: ISSUER.to_string(),
        poll_interval: std::time::Duration::from_secs(60),
        overlap: DAY,
        record_refresh: None,
    };
    Bridge::new(upstream, cache.clone(), notifier, settings).poll_once(&leadership, at_hours(0)).await.unwrap();

    let replicas = LockstepBackend::replicas(&store, 2);
    let publishers: Vec<_> = replicas
        .iter()
        .map(|r| {
            Publisher::new(
                ConditionalWriter::new(r.clone(), fast_retry(3)),
                cache.clone(),
                PublicationTarget::Issuer { issuer: ISSUER.to_string() },
            )
        })
        .collect();

    let (a, b) = tokio::join!(publishers[0].publish_once(), publishers[1].publish_once());
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
    assert_eq!(a.version, b.version);

    for path in [JWKS_PATH, DISCOVERY_PATH] {
        let outcomes: Vec<_> = [&a, &b]
            .iter()
            .flat_map(|r| r.objects.iter().filter(|(p, _)| p == path).map(|(_, o)| o.clone()))
            .collect();
        assert_eq!(outcomes.iter().filter(|o| matches!(o, PublishOutcome::Written(_))).count(), 1, "{path}");
        assert_eq!(outcomes.iter().filter(|o| **o == PublishOutcome::LostRace).count(), 1, "{path}");
    }
    for replica in &replicas {
        assert_eq!(replica.writes.load(Ordering::SeqCst), 2, "one attempt per document");
    }

    // A later trigger for the same version finds the bytes in place
    let writes_before = store.successful_writes().await;
    let plain = Publisher::new(
        ConditionalWriter::new(Arc::new(store.clone()), fast_retry(3)),
        cache.clone(),
        PublicationTarget::Issuer { issuer: ISSUER.to_string() },
    );
    let report = plain.publish_once().await.unwrap().unwrap();
    assert!(report.objects.iter().all(|(_, o)| *o == PublishOutcome::Unchanged));
    assert_eq!(store.successful_writes().await, writes_before);
}

#[tokio::test]
async fn split_brain_leaders_commit_once() {
    let cache = Arc::new(LockstepCache { inner: MemoryCache::new(), barrier: Arc::new(Barrier::new(2)) });
    let settings = BridgeSettings {
        issuer: ISSUER.to_string(),
        poll_interval: std::time::Duration::from_secs(60),
        overlap: DAY,
        record_refresh: None,
    };
    let bridges: Vec<_> = (0..2)
        .map(|_| {
            let upstream = ScriptedUpstream::new(ISSUER, key_set(&[&rsa_key("a")]));
            Bridge::new(upstream, cache.clone(), RotationNotifier::new().0, settings.clone())
        })
        .collect();
    let (_leader, leadership) = watch::channel(true);

    let (a, b) = tokio::join!(
        bridges[0].poll_once(&leadership, at_hours(0)),
        bridges[1].poll_once(&leadership, at_hours(0)),
    );
    let outcomes = [a.unwrap().outcome, b.unwrap().outcome];
    assert_eq!(outcomes.iter().filter(|o| matches!(o, PollOutcome::Committed { .. })).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == PollOutcome::Conflict).count(), 1);
}
