//! In-process shared cache backed by a `tokio::sync::watch` channel.
//!
//! Clones share one entry, so tests can run several replicas against it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::{CacheError, CacheSnapshot, CacheVersion, SharedCache, VersionedSnapshot};

#[derive(Debug)]
struct Inner {
    entry: Mutex<Option<(Vec<u8>, u64)>>,
    last_version: Mutex<u64>,
    changes: watch::Sender<Option<CacheVersion>>,
}

#[derive(Debug, Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                entry: Mutex::new(None),
                last_version: Mutex::new(0),
                changes,
            }),
        }
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn read(&self) -> Result<Option<VersionedSnapshot>, CacheError> {
        let entry = self.inner.entry.lock().await;
        match entry.as_ref() {
            Some((bytes, version)) => Ok(Some(VersionedSnapshot {
                snapshot: CacheSnapshot::from_slice(bytes)?,
                version: CacheVersion::new(version.to_string()),
            })),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        snapshot: &CacheSnapshot,
        expected: Option<&CacheVersion>,
    ) -> Result<CacheVersion, CacheError> {
        let bytes = snapshot.to_bytes()?;
        let mut entry = self.inner.entry.lock().await;

        let current = entry.as_ref().map(|(_, v)| CacheVersion::new(v.to_string()));
        if current.as_ref() != expected {
            return Err(CacheError::Conflict { expected: expected.cloned() });
        }

        let mut last_version = self.inner.last_version.lock().await;
        *last_version += 1;
        *entry = Some((bytes, *last_version));

        let version = CacheVersion::new(last_version.to_string());
        self.inner.changes.send_replace(Some(version.clone()));
        Ok(version)
    }

    fn subscribe(&self) -> watch::Receiver<Option<CacheVersion>> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RotationState;
    use chrono::Utc;
    use std::time::Duration;

    fn snapshot(issuer: &str) -> CacheSnapshot {
        CacheSnapshot {
            rotation: RotationState::new(Duration::from_secs(3600)),
            fetched_at: Utc::now(),
            issuer: issuer.to_string(),
        }
    }

    #[tokio::test]
    async fn first_write_requires_absent() {
        let cache = MemoryCache::new();
        assert!(cache.read().await.unwrap().is_none());

        let err = cache.write(&snapshot("a"), Some(&CacheVersion::new("1"))).await.unwrap_err();
        assert!(err.is_conflict());

        let version = cache.write(&snapshot("a"), None).await.unwrap();
        let read = cache.read().await.unwrap().unwrap();
        assert_eq!(read.version, version);
        assert_eq!(read.snapshot.issuer, "a");
    }

    #[tokio::test]
    async fn stale_leader_write_conflicts() {
        let cache = MemoryCache::new();
        let v1 = cache.write(&snapshot("a"), None).await.unwrap();

        let leader_a = cache.clone();
        let leader_b = cache.clone();
        let v2 = leader_a.write(&snapshot("b"), Some(&v1)).await.unwrap();
        assert_ne!(v1, v2);

        let err = leader_b.write(&snapshot("c"), Some(&v1)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cache.read().await.unwrap().unwrap().snapshot.issuer, "b");
    }

    #[tokio::test]
    async fn subscribers_see_latest_version() {
        let cache = MemoryCache::new();
        let mut rx = cache.subscribe();
        assert!(rx.borrow().is_none());

        let v1 = cache.write(&snapshot("a"), None).await.unwrap();
        let v2 = cache.write(&snapshot("b"), Some(&v1)).await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().clone(), Some(v2));
    }
}
