//! Publisher: shared cache into object storage
//!
//! Runs on every replica. Each trigger re-reads the cache and derives the
//! documents from the snapshot it finds, so a stale notification can never
//! publish old content. All replicas derive identical bytes from one cache
//! version; whichever conditional write lands first wins and the rest see an
//! unchanged object or a lost race. Before every write attempt the cache is
//! checked again, and content from a replaced version is dropped unwritten.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::cache::{CacheSnapshot, CacheVersion, SharedCache};
use crate::domain::{
    ClusterId, ClusterRecord, DiscoveryDocument, FleetLayout, JwksDocument, DISCOVERY_PATH,
    JWKS_PATH,
};
use crate::errors::{BridgeError, Result};
use crate::observability::metrics;
use crate::storage::{
    ConditionalWriter, PublishOutcome, StorageBackend, StorageError, StorageResult,
};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// What this replica publishes for its cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationTarget {
    /// Discovery document and JWKS at the storage root
    Issuer { issuer: String },
    /// A per-cluster record inside a fleet
    ClusterRecord { layout: FleetLayout, cluster: ClusterId },
}

impl PublicationTarget {
    /// Serialized objects for `snapshot`, in write order
    ///
    /// The JWKS goes first so the discovery document never points at keys
    /// that are not published yet.
    pub fn documents(&self, snapshot: &CacheSnapshot) -> Result<Vec<(String, Bytes)>> {
        let published = snapshot.published();
        match self {
            Self::Issuer { issuer } => {
                let jwks = JwksDocument::new(&published).to_bytes()?;
                let discovery = DiscoveryDocument::new(issuer, &published).to_bytes()?;
                Ok(vec![
                    (JWKS_PATH.to_string(), Bytes::from(jwks)),
                    (DISCOVERY_PATH.to_string(), Bytes::from(discovery)),
                ])
            }
            Self::ClusterRecord { layout, cluster } => {
                let record = ClusterRecord {
                    cluster_id: cluster.clone(),
                    key_set: published,
                    last_published: snapshot.fetched_at,
                };
                Ok(vec![(layout.cluster_record_path(cluster), Bytes::from(record.to_bytes()?))])
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub version: CacheVersion,
    pub objects: Vec<(String, PublishOutcome)>,
}

#[derive(Debug)]
pub struct Publisher<S> {
    writer: ConditionalWriter<S>,
    cache: Arc<dyn SharedCache>,
    target: PublicationTarget,
    retry_interval: Duration,
}

impl<S> Clone for Publisher<S> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            cache: Arc::clone(&self.cache),
            target: self.target.clone(),
            retry_interval: self.retry_interval,
        }
    }
}

impl<S: StorageBackend + 'static> Publisher<S> {
    pub fn new(
        writer: ConditionalWriter<S>,
        cache: Arc<dyn SharedCache>,
        target: PublicationTarget,
    ) -> Self {
        Self { writer, cache, target, retry_interval: DEFAULT_RETRY_INTERVAL }
    }

    /// How long `run` waits before retrying a failed cycle with no cache change
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn target(&self) -> &PublicationTarget {
        &self.target
    }

    /// Whether `version` is still the latest committed snapshot
    async fn is_current(&self, version: &CacheVersion) -> StorageResult<bool> {
        match self.cache.read().await {
            Ok(latest) => Ok(latest.is_some_and(|latest| latest.version == *version)),
            Err(e) => Err(StorageError::transient(format!("cache re-read failed: {e}"))),
        }
    }

    /// Publish the current snapshot; `None` when nothing has been committed yet
    #[instrument(skip(self), name = "publish")]
    pub async fn publish_once(&self) -> Result<Option<PublishReport>> {
        let Some(current) = self.cache.read().await? else {
            debug!("No snapshot committed yet, nothing to publish");
            return Ok(None);
        };

        let mut objects = Vec::new();
        for (path, bytes) in self.target.documents(&current.snapshot)? {
            let span = crate::storage_span!("publish", path, version = %current.version);
            let outcome = match self
                .writer
                .publish_while(&path, bytes, || self.is_current(&current.version))
                .instrument(span)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    let kind = if e.is_retryable() { "transient" } else { "terminal" };
                    metrics::record_publish(&path, "error");
                    metrics::record_storage_error("publish", kind);
                    return Err(BridgeError::storage(path, e));
                }
            };
            metrics::record_publish(&path, outcome.as_str());
            let superseded = outcome == PublishOutcome::Superseded;
            objects.push((path, outcome));
            if superseded {
                // the newer version's own cycle publishes the remaining objects
                break;
            }
        }

        let summary: Vec<String> =
            objects.iter().map(|(p, o)| format!("{p}={}", o.as_str())).collect();
        info!(version = %current.version, objects = ?summary, "Published snapshot");
        Ok(Some(PublishReport { version: current.version, objects }))
    }

    /// Publish at startup, then after every cache change until `shutdown`
    ///
    /// A cycle that failed for any reason other than rejected credentials is
    /// also retried after `retry_interval` if the cache stays quiet.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut changes = self.cache.subscribe();
        info!(target = ?self.target, "Publisher started");

        loop {
            changes.borrow_and_update();

            let retry_pending = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.publish_once() => match result {
                    Ok(_) => false,
                    Err(e @ BridgeError::PermissionDenied { .. }) => {
                        error!(
                            error = %e,
                            "Storage rejected our credentials; operator action required"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            retry_in_seconds = self.retry_interval.as_secs(),
                            "Publish failed, retrying on the next cache change or timer"
                        );
                        true
                    }
                },
            };

            let retry_timer = async {
                if retry_pending {
                    tokio::time::sleep(self.retry_interval).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        warn!("Cache change channel closed, publisher stopping");
                        break;
                    }
                }
                _ = retry_timer => debug!("Retrying failed publish"),
            }
        }

        info!("Publisher stopped");
        Ok(())
    }
}
