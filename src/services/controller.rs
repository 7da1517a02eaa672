//! Process wiring and task supervision
//!
//! Builds every component from configuration, validates the upstream issuer,
//! then runs the elector, the Publisher and the leader-gated loops side by
//! side until shutdown. A task that fails cancels the rest, so the elector
//! still gets to release its lease on the way out.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::{ConfigMapCache, MemoryCache, SharedCache};
use crate::config::{AppConfig, CacheBackendType, LeaderElectionMode, UpstreamSourceType};
use crate::errors::{BridgeError, Result};
use crate::leader::{run_while_leader, LeaderElector, LeaseLeaderElector, StaticLeaderElector};
use crate::services::aggregator::{AggregatorSettings, FleetAggregator};
use crate::services::bridge::{Bridge, BridgeSettings};
use crate::services::notifications::RotationNotifier;
use crate::services::publisher::{PublicationTarget, Publisher};
use crate::storage::{ConditionalWriter, ObjectStore, RetryConfig};
use crate::upstream::{parse_discovery, HttpSource, KubernetesSource, UpstreamSource};

pub struct Controller {
    config: AppConfig,
    store: Arc<ObjectStore>,
    cache: Arc<dyn SharedCache>,
    upstream: Arc<dyn UpstreamSource>,
    elector: Arc<dyn LeaderElector>,
    notifier: RotationNotifier,
    watchers: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Assemble from already-built parts
    pub fn new(
        config: AppConfig,
        store: Arc<ObjectStore>,
        cache: Arc<dyn SharedCache>,
        upstream: Arc<dyn UpstreamSource>,
        elector: Arc<dyn LeaderElector>,
    ) -> Self {
        let (notifier, _) = RotationNotifier::new();
        Self { config, store, cache, upstream, elector, notifier, watchers: Vec::new() }
    }

    /// Build every part named in `config`
    pub async fn from_config(config: AppConfig, shutdown: &CancellationToken) -> Result<Self> {
        let needs_kube = config.upstream.source == UpstreamSourceType::Kubernetes
            || config.cache.backend == CacheBackendType::ConfigMap
            || config.leader.mode == LeaderElectionMode::Lease;
        let client = if needs_kube { Some(kube::Client::try_default().await?) } else { None };
        let kube_client = || {
            client.clone().ok_or_else(|| BridgeError::internal("Kubernetes client was not initialized"))
        };

        let store = ObjectStore::from_config(&config.storage)
            .await
            .map_err(|e| BridgeError::storage(config.storage.bucket.clone(), e))?;

        let upstream: Arc<dyn UpstreamSource> = match config.upstream.source {
            UpstreamSourceType::Kubernetes => {
                Arc::new(KubernetesSource::new(kube_client()?, config.upstream.timeout()))
            }
            UpstreamSourceType::Http => {
                let url = config.upstream.url.clone().ok_or_else(|| {
                    BridgeError::validation_field("Upstream URL is required", "upstream.url")
                })?;
                Arc::new(HttpSource::new(url, config.upstream.token_file.clone(), config.upstream.timeout())?)
            }
        };

        let mut watchers = Vec::new();
        let cache: Arc<dyn SharedCache> = match config.cache.backend {
            CacheBackendType::ConfigMap => {
                let cache = ConfigMapCache::new(kube_client()?, &config.cache.namespace, config.cache.name.clone());
                watchers.push(cache.spawn_watcher(shutdown.child_token()));
                Arc::new(cache)
            }
            CacheBackendType::Memory => Arc::new(MemoryCache::new()),
        };

        let elector: Arc<dyn LeaderElector> = match config.leader.mode {
            LeaderElectionMode::Lease => Arc::new(LeaseLeaderElector::new(
                kube_client()?,
                config.leader.lease_config(&config.cache.namespace),
            )),
            LeaderElectionMode::Static => Arc::new(StaticLeaderElector::new(true)),
        };

        let mut controller = Self::new(config, Arc::new(store), cache, upstream, elector);
        controller.watchers = watchers;
        Ok(controller)
    }

    pub fn notifier(&self) -> &RotationNotifier {
        &self.notifier
    }

    fn retry_config(&self) -> RetryConfig {
        self.config.storage.retry_config()
    }

    fn target(&self) -> Result<PublicationTarget> {
        Ok(match (self.config.fleet.layout(), self.config.fleet.cluster()?) {
            (Some(layout), Some(cluster)) => PublicationTarget::ClusterRecord { layout, cluster },
            _ => PublicationTarget::Issuer { issuer: self.config.bridge.public_base_url.clone() },
        })
    }

    /// Run until `shutdown` fires or a task fails
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        validate_issuer(self.upstream.as_ref(), &self.config.bridge.public_base_url, &self.retry_config())
            .await?;

        let writer = ConditionalWriter::new(Arc::clone(&self.store), self.retry_config());
        let leadership = self.elector.leadership();
        let fleet = &self.config.fleet;

        let bridge = Arc::new(Bridge::new(
            Arc::clone(&self.upstream),
            Arc::clone(&self.cache),
            self.notifier.clone(),
            BridgeSettings {
                issuer: self.config.bridge.public_base_url.clone(),
                poll_interval: self.config.bridge.poll_interval(),
                overlap: self.config.bridge.overlap(),
                record_refresh: fleet.is_enabled().then(|| fleet.record_refresh()),
            },
        ));
        let publisher = Publisher::new(writer.clone(), Arc::clone(&self.cache), self.target()?)
            .with_retry_interval(self.config.bridge.poll_interval());
        let aggregator = match fleet.layout() {
            Some(layout) if fleet.aggregate => Some(Arc::new(FleetAggregator::new(
                writer,
                layout,
                AggregatorSettings {
                    issuer: self.config.bridge.public_base_url.clone(),
                    interval: fleet.aggregation_interval(),
                    cluster_ttl: fleet.cluster_ttl(),
                },
            ))),
            _ => None,
        };

        info!(
            fleet = %fleet.name,
            aggregator = aggregator.is_some(),
            target = ?publisher.target(),
            "Controller starting"
        );

        let elector_task = {
            let elector = Arc::clone(&self.elector);
            let shutdown = shutdown.clone();
            async move { elector.run(shutdown).await }
        };

        let publisher_task = {
            let shutdown = shutdown.clone();
            async move { publisher.run(shutdown).await }
        };

        let bridge_task = {
            let leadership = leadership.clone();
            run_while_leader("bridge", leadership.clone(), shutdown.clone(), move |term| {
                let bridge = Arc::clone(&bridge);
                let leadership = leadership.clone();
                async move { bridge.run(leadership, term).await }
            })
        };

        let aggregator_task = {
            let leadership = leadership.clone();
            let shutdown = shutdown.clone();
            async move {
                let Some(aggregator) = aggregator else {
                    return Ok(());
                };
                run_while_leader("aggregator", leadership.clone(), shutdown, move |term| {
                    let aggregator = Arc::clone(&aggregator);
                    let leadership = leadership.clone();
                    async move { aggregator.run(leadership, term).await }
                })
                .await
            }
        };

        let (elector, publisher, bridge, aggregator) = tokio::join!(
            supervise("elector", elector_task, &shutdown),
            supervise("publisher", publisher_task, &shutdown),
            supervise("bridge", bridge_task, &shutdown),
            supervise("aggregator", aggregator_task, &shutdown),
        );

        for watcher in self.watchers {
            watcher.abort();
        }

        elector?;
        publisher?;
        bridge?;
        aggregator?;
        info!("Controller stopped");
        Ok(())
    }
}

/// Await `task`; on failure cancel `shutdown` so sibling tasks wind down
async fn supervise<F>(name: &'static str, task: F, shutdown: &CancellationToken) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = task.await;
    if let Err(e) = &result {
        error!(task = name, error = %e, "Task failed, shutting down");
        shutdown.cancel();
    }
    result
}

/// Check the upstream issuer against the configured public URL.
///
/// Transient fetch errors are retried with backoff. A mismatch or a
/// malformed discovery document is fatal.
pub async fn validate_issuer(
    upstream: &dyn UpstreamSource,
    expected: &str,
    retry: &RetryConfig,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let fetched = upstream.discovery().await.and_then(|bytes| parse_discovery(&bytes));
        match fetched {
            Ok(discovery) if discovery.issuer == expected => {
                info!(issuer = %expected, "Upstream issuer matches the public base URL");
                return Ok(());
            }
            Ok(discovery) => {
                return Err(BridgeError::issuer_mismatch(expected, discovery.issuer));
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let backoff = retry.backoff_for_attempt(attempt);
                warn!(
                    error = %e,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Upstream discovery fetch failed during startup, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Resolve when the process is asked to stop
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Build from configuration and run until a shutdown signal
pub async fn run(config: AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    let controller = Controller::from_config(config, &shutdown).await?;

    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => shutdown.cancel(),
                _ = shutdown.cancelled() => {}
            }
        })
    };

    let started = Utc::now();
    let result = controller.run(shutdown.clone()).await;
    shutdown.cancel();
    signal_task.abort();

    info!(uptime_seconds = (Utc::now() - started).num_seconds(), "Shutdown complete");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct FlakyDiscovery {
        issuer: String,
        failures: AtomicU32,
    }

    #[async_trait]
    impl UpstreamSource for FlakyDiscovery {
        async fn discovery(&self) -> std::result::Result<Vec<u8>, UpstreamError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(UpstreamError::Status { endpoint: "/x".into(), status: 503 });
            }
            Ok(serde_json::to_vec(&serde_json::json!({ "issuer": self.issuer })).unwrap())
        }

        async fn jwks(&self) -> std::result::Result<Vec<u8>, UpstreamError> {
            Ok(br#"{"keys":[]}"#.to_vec())
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig { initial_backoff: Duration::from_millis(1), max_attempts: 3, ..Default::default() }
    }

    #[tokio::test]
    async fn issuer_validation_retries_transient_errors() {
        let upstream = FlakyDiscovery { issuer: "https://a.example.com".into(), failures: AtomicU32::new(2) };
        validate_issuer(&upstream, "https://a.example.com", &fast_retry()).await.unwrap();
    }

    #[tokio::test]
    async fn issuer_validation_gives_up_after_max_attempts() {
        let upstream = FlakyDiscovery { issuer: "https://a.example.com".into(), failures: AtomicU32::new(5) };
        let err = validate_issuer(&upstream, "https://a.example.com", &fast_retry()).await.unwrap_err();
        assert!(matches!(err, BridgeError::UpstreamFetch { .. }));
    }

    #[tokio::test]
    async fn issuer_mismatch_is_fatal_on_trailing_slash() {
        let upstream = FlakyDiscovery { issuer: "https://a.example.com/".into(), failures: AtomicU32::new(0) };
        let err = validate_issuer(&upstream, "https://a.example.com", &fast_retry()).await.unwrap_err();
        assert!(matches!(err, BridgeError::IssuerMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn failing_task_cancels_siblings() {
        let shutdown = CancellationToken::new();
        let sibling = {
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                Ok(())
            }
        };
        let (failed, stopped) = tokio::join!(
            supervise("failing", async { Err(BridgeError::internal("boom")) }, &shutdown),
            supervise("sibling", sibling, &shutdown),
        );
        assert!(failed.is_err());
        assert!(stopped.is_ok());
    }
}
