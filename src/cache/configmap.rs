//! Kubernetes ConfigMap shared cache
//!
//! The snapshot lives in one ConfigMap data key. The object's
//! `resourceVersion` is the cache version: creates rely on the API server's
//! name uniqueness, replaces carry the expected `resourceVersion` and the API
//! server answers a stale one with 409. A watcher on the ConfigMap feeds the
//! change channel on every replica.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheError, CacheSnapshot, CacheVersion, SharedCache, VersionedSnapshot};

/// Data key holding the serialized snapshot
pub const SNAPSHOT_KEY: &str = "snapshot.json";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Upper bound for a single API server round trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConfigMapCache {
    api: Api<ConfigMap>,
    name: String,
    changes: Arc<watch::Sender<Option<CacheVersion>>>,
}

impl ConfigMapCache {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(None);
        Self { api: Api::namespaced(client, namespace), name: name.into(), changes: Arc::new(changes) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watch the ConfigMap and publish its `resourceVersion` on every change
    /// until `shutdown` fires. The watcher reconnects with backoff on errors.
    pub fn spawn_watcher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let api = self.api.clone();
        let name = self.name.clone();
        let changes = Arc::clone(&self.changes);

        tokio::spawn(async move {
            let config = WatcherConfig::default().fields(&format!("metadata.name={}", name));
            let mut stream = pin!(watcher(api, config).default_backoff());

            info!(configmap = %name, "Starting shared cache watcher");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(configmap = %name, "Shared cache watcher shutting down");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(Ok(Event::Apply(cm) | Event::InitApply(cm))) => {
                            let version = cm.metadata.resource_version.map(CacheVersion::new);
                            debug!(configmap = %name, version = ?version, "Shared cache changed");
                            changes.send_if_modified(|current| {
                                if *current == version {
                                    false
                                } else {
                                    *current = version;
                                    true
                                }
                            });
                        }
                        Some(Ok(Event::Delete(_))) => {
                            warn!(configmap = %name, "Shared cache ConfigMap was deleted");
                            changes.send_replace(None);
                        }
                        Some(Ok(Event::Init | Event::InitDone)) => {}
                        Some(Err(e)) => {
                            warn!(configmap = %name, error = %e, "Shared cache watcher error, will retry");
                        }
                        None => {
                            debug!(configmap = %name, "Shared cache watch stream ended");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn build(&self, snapshot: &CacheSnapshot, resource_version: Option<String>) -> Result<ConfigMap, CacheError> {
        let json = String::from_utf8(snapshot.to_bytes()?)
            .map_err(|e| CacheError::Serialization { message: e.to_string() })?;

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version,
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    crate::APP_NAME.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(SNAPSHOT_KEY.to_string(), json)])),
            ..Default::default()
        })
    }

    async fn bounded<T, F>(&self, operation: &str, request: F) -> Result<Result<T, kube::Error>, CacheError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        tokio::time::timeout(REQUEST_TIMEOUT, request).await.map_err(|_| {
            CacheError::backend(format!(
                "{operation} configmap '{}' timed out after {}s",
                self.name,
                REQUEST_TIMEOUT.as_secs()
            ))
        })
    }

    fn notify(&self, version: &CacheVersion) {
        self.changes.send_replace(Some(version.clone()));
    }
}

fn committed_version(cm: ConfigMap) -> Result<CacheVersion, CacheError> {
    cm.metadata
        .resource_version
        .map(CacheVersion::new)
        .ok_or_else(|| CacheError::backend("API server response has no resourceVersion"))
}

#[async_trait]
impl SharedCache for ConfigMapCache {
    async fn read(&self) -> Result<Option<VersionedSnapshot>, CacheError> {
        let cm = self
            .bounded("get", self.api.get_opt(&self.name))
            .await?
            .map_err(|e| CacheError::backend(format!("get configmap '{}': {}", self.name, e)))?;

        let Some(cm) = cm else { return Ok(None) };
        let Some(json) = cm.data.as_ref().and_then(|d| d.get(SNAPSHOT_KEY)) else {
            // Created by hand or truncated; treat as empty so the next commit overwrites it
            warn!(configmap = %self.name, "Shared cache ConfigMap has no snapshot entry");
            return Ok(None);
        };

        let snapshot = CacheSnapshot::from_slice(json.as_bytes())?;
        let version = committed_version(cm)?;
        Ok(Some(VersionedSnapshot { snapshot, version }))
    }

    async fn write(
        &self,
        snapshot: &CacheSnapshot,
        expected: Option<&CacheVersion>,
    ) -> Result<CacheVersion, CacheError> {
        let conflict = || CacheError::Conflict { expected: expected.cloned() };

        let result = match expected {
            None => {
                let cm = self.build(snapshot, None)?;
                self.bounded("create", self.api.create(&PostParams::default(), &cm)).await?
            }
            Some(version) => {
                let cm = self.build(snapshot, Some(version.as_str().to_string()))?;
                self.bounded("replace", self.api.replace(&self.name, &PostParams::default(), &cm)).await?
            }
        };

        match result {
            Ok(cm) => {
                let version = committed_version(cm)?;
                self.notify(&version);
                Ok(version)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Err(conflict()),
            // Replacing an entry that was deleted underneath us
            Err(kube::Error::Api(e)) if e.code == 404 && expected.is_some() => Err(conflict()),
            Err(e) => {
                Err(CacheError::backend(format!("write configmap '{}': {}", self.name, e)))
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<Option<CacheVersion>> {
        self.changes.subscribe()
    }
}
