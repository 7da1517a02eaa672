//! Fleet aggregator
//!
//! Leader-only, fleet mode only. Periodically reads every cluster record in
//! the fleet, drops stale and unreadable ones, and publishes the union of the
//! rest as the fleet's discovery document and JWKS through the same
//! conditional write path the Publisher uses. Once every record has gone
//! stale the union is empty and an empty key set is published. Only a listing
//! with no records at all leaves the existing fleet documents in place.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::domain::{aggregate, ClusterId, ClusterRecord, DiscoveryDocument, FleetLayout, JwksDocument};
use crate::errors::{BridgeError, Result};
use crate::observability::metrics;
use crate::storage::{ConditionalWriter, PublishOutcome, StorageBackend};

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Issuer of the fleet documents
    pub issuer: String,
    pub interval: Duration,
    pub cluster_ttl: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateReport {
    pub live: Vec<ClusterId>,
    pub stale: Vec<ClusterId>,
    /// Paths of records that could not be parsed
    pub malformed: Vec<String>,
    pub keys: usize,
    /// Empty when the fleet prefix held no records
    pub published: Vec<(String, PublishOutcome)>,
}

#[derive(Debug)]
pub struct FleetAggregator<S> {
    writer: ConditionalWriter<S>,
    layout: FleetLayout,
    settings: AggregatorSettings,
}

impl<S> Clone for FleetAggregator<S> {
    fn clone(&self) -> Self {
        Self { writer: self.writer.clone(), layout: self.layout.clone(), settings: self.settings.clone() }
    }
}

impl<S: StorageBackend + 'static> FleetAggregator<S> {
    pub fn new(writer: ConditionalWriter<S>, layout: FleetLayout, settings: AggregatorSettings) -> Self {
        Self { writer, layout, settings }
    }

    /// Read every record under the fleet prefix
    async fn load_records(&self) -> Result<(Vec<ClusterRecord>, Vec<String>)> {
        let prefix = self.layout.clusters_prefix();
        let paths = self.writer.list(&prefix).await.map_err(|e| BridgeError::storage(&prefix, e))?;

        let mut records = Vec::new();
        let mut malformed = Vec::new();
        for path in paths {
            let Some(cluster) = self.layout.cluster_from_path(&path) else {
                continue;
            };
            let Some(object) =
                self.writer.read(&path).await.map_err(|e| BridgeError::storage(&path, e))?
            else {
                debug!(path = %path, "Record deleted while aggregating");
                continue;
            };

            match ClusterRecord::from_slice(&object.bytes) {
                Ok(record) if record.cluster_id == cluster => records.push(record),
                Ok(record) => {
                    warn!(path = %path, cluster_id = %record.cluster_id, "Record names a different cluster, skipping");
                    malformed.push(path);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Malformed cluster record, skipping");
                    malformed.push(path);
                }
            }
        }
        Ok((records, malformed))
    }

    /// One aggregation pass at `now`
    #[instrument(skip(self, leadership), fields(fleet = %self.layout.name()), name = "fleet_aggregate")]
    pub async fn aggregate_once(
        &self,
        leadership: &watch::Receiver<bool>,
        now: DateTime<Utc>,
    ) -> Result<AggregateReport> {
        let (records, malformed) = self.load_records().await?;
        let listed_nothing = records.is_empty() && malformed.is_empty();
        let result = aggregate(&records, &self.settings.issuer, now, self.settings.cluster_ttl);

        let mut report = AggregateReport {
            keys: result.aggregate.key_set.len(),
            live: result.live,
            stale: result.stale,
            malformed,
            published: Vec::new(),
        };
        metrics::set_fleet_clusters(report.live.len(), report.stale.len(), report.malformed.len(), report.keys);

        if !report.stale.is_empty() {
            info!(stale = ?report.stale, "Leaving stale clusters out of the fleet key set");
        }
        if listed_nothing {
            warn!("No cluster records under the fleet prefix, keeping the published fleet documents");
            return Ok(report);
        }
        if result.aggregate.key_set.is_empty() {
            warn!(stale = report.stale.len(), "No live cluster records, publishing an empty fleet key set");
        }

        if !*leadership.borrow() {
            return Err(BridgeError::leader_lost("fleet publish"));
        }

        let keys = &result.aggregate.key_set;
        let objects = [
            (self.layout.jwks_path(), JwksDocument::new(keys).to_bytes()?),
            (self.layout.discovery_path(), DiscoveryDocument::new(&result.aggregate.issuer, keys).to_bytes()?),
        ];
        for (path, bytes) in objects {
            let span = crate::storage_span!("publish", path);
            let outcome = match self.writer.publish(&path, Bytes::from(bytes)).instrument(span).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    metrics::record_publish(&path, "error");
                    return Err(BridgeError::storage(path, e));
                }
            };
            metrics::record_publish(&path, outcome.as_str());
            report.published.push((path, outcome));
        }

        info!(live = report.live.len(), keys = report.keys, "Fleet aggregate published");
        Ok(report)
    }

    /// Aggregate every interval until `term` is cancelled
    pub async fn run(&self, leadership: watch::Receiver<bool>, term: CancellationToken) -> Result<()> {
        info!(
            fleet = %self.layout.name(),
            interval_seconds = self.settings.interval.as_secs(),
            cluster_ttl_seconds = self.settings.cluster_ttl.as_secs(),
            "Fleet aggregator started"
        );

        loop {
            let span = crate::cycle_span!("aggregator", fleet = %self.layout.name());
            let result = tokio::select! {
                _ = term.cancelled() => break,
                result = self.aggregate_once(&leadership, Utc::now()).instrument(span) => result,
            };
            match result {
                Ok(_) => {}
                Err(e @ BridgeError::PermissionDenied { .. }) => {
                    error!(error = %e, "Storage rejected our credentials; operator action required");
                }
                Err(BridgeError::LeaderLost { .. }) => debug!("Aggregation abandoned"),
                Err(e) => warn!(error = %e, "Fleet aggregation failed"),
            }

            tokio::select! {
                _ = term.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        info!("Fleet aggregator stopped");
        Ok(())
    }
}
