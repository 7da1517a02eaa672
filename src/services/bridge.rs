//! Bridge: upstream polling into the shared cache
//!
//! Runs only on the leader. Each poll starts from the committed snapshot,
//! never from memory, so a freshly elected leader continues exactly where the
//! previous one stopped. A poll that fails for any reason commits nothing.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::cache::{CacheSnapshot, CacheVersion, SharedCache};
use crate::domain::{observe, RotationState, RotationTransition};
use crate::errors::{BridgeError, Result};
use crate::observability::metrics;
use crate::services::notifications::{RotationEvent, RotationNotifier};
use crate::upstream::UpstreamSource;

/// Floor for the wait between polls when a retirement deadline is due
const MIN_WAIT: Duration = Duration::from_secs(1);

/// Slack added to a retirement deadline so the poll lands after it
const RETIREMENT_SLACK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Configured public issuer; the upstream must report exactly this
    pub issuer: String,
    pub poll_interval: Duration,
    pub overlap: Duration,
    /// Fleet mode only: re-commit an unchanged state once it is this old
    pub record_refresh: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A new snapshot was committed
    Committed { version: CacheVersion, transition: Option<RotationTransition> },
    /// Nothing changed and no refresh was due
    Unchanged,
    /// Another writer committed first; the next poll re-reads
    Conflict,
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::Unchanged => "unchanged",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Earliest `retire_at` in the state the poll left behind
    pub next_retirement: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Bridge {
    upstream: Arc<dyn UpstreamSource>,
    cache: Arc<dyn SharedCache>,
    notifier: RotationNotifier,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        cache: Arc<dyn SharedCache>,
        notifier: RotationNotifier,
        settings: BridgeSettings,
    ) -> Self {
        Self { upstream, cache, notifier, settings }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// One poll: read cache, fetch upstream, observe, commit if changed.
    ///
    /// Leadership is checked again right before the cache write; the version
    /// precondition catches any overlap the signal misses.
    #[instrument(skip(self, leadership), fields(issuer = %self.settings.issuer), name = "bridge_poll")]
    pub async fn poll_once(
        &self,
        leadership: &watch::Receiver<bool>,
        now: DateTime<Utc>,
    ) -> Result<PollReport> {
        let current = self.cache.read().await?;

        let observation = self.upstream.fetch(now).await.inspect_err(|e| {
            metrics::record_upstream_error(e.kind());
        })?;

        if observation.issuer != self.settings.issuer {
            return Err(BridgeError::issuer_mismatch(&self.settings.issuer, &observation.issuer));
        }

        let base = current
            .as_ref()
            .map(|c| c.snapshot.rotation.clone())
            .unwrap_or_else(|| RotationState::new(self.settings.overlap));
        let observed = observe(&base, &observation.key_set, now, self.settings.overlap);
        let next_retirement = observed.state.next_retirement();

        let changed = match &current {
            None => true,
            Some(c) => {
                c.snapshot.issuer != observation.issuer
                    || c.snapshot.rotation.content_hash() != observed.state.content_hash()
            }
        };
        let refresh_due = match (&current, self.settings.record_refresh) {
            (Some(c), Some(refresh)) => {
                (now - c.snapshot.fetched_at).to_std().is_ok_and(|age| age >= refresh)
            }
            _ => false,
        };

        if !changed && !refresh_due {
            debug!("Upstream key set unchanged");
            return Ok(PollReport { outcome: PollOutcome::Unchanged, next_retirement });
        }

        if !*leadership.borrow() {
            return Err(BridgeError::leader_lost("cache commit"));
        }

        let snapshot = CacheSnapshot {
            rotation: observed.state,
            fetched_at: now,
            issuer: observation.issuer,
        };
        let expected = current.as_ref().map(|c| &c.version);

        let version = match self.cache.write(&snapshot, expected).await {
            Ok(version) => version,
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Cache changed since it was read, re-reading on the next poll");
                return Ok(PollReport { outcome: PollOutcome::Conflict, next_retirement });
            }
            Err(e) => return Err(e.into()),
        };

        metrics::set_published_keys(snapshot.rotation.active().len(), snapshot.rotation.retiring().len());

        if let Some(transition) = &observed.transition {
            info!(
                version = %version,
                added = ?transition.added,
                retiring = ?transition.retiring,
                resurrected = ?transition.resurrected,
                dropped = ?transition.dropped,
                "Key rotation committed"
            );
            metrics::record_rotation(transition);
            self.notifier.notify(RotationEvent {
                issuer: snapshot.issuer.clone(),
                version: version.clone(),
                transition: transition.clone(),
                observed_at: now,
            });
        } else {
            debug!(version = %version, "Refreshed unchanged snapshot");
        }

        Ok(PollReport {
            outcome: PollOutcome::Committed { version, transition: observed.transition },
            next_retirement,
        })
    }

    /// Poll until `term` is cancelled.
    ///
    /// Waits one poll interval between polls, or less when a retiring key's
    /// deadline comes first. Cancellation drops an in-flight poll.
    pub async fn run(&self, leadership: watch::Receiver<bool>, term: CancellationToken) -> Result<()> {
        info!(
            poll_interval_seconds = self.settings.poll_interval.as_secs(),
            overlap_seconds = self.settings.overlap.as_secs(),
            upstream = %self.upstream.describe(),
            "Bridge started"
        );

        loop {
            let started = Instant::now();
            let span = crate::cycle_span!("bridge");
            let result = tokio::select! {
                _ = term.cancelled() => break,
                result = self.poll_once(&leadership, Utc::now()).instrument(span) => result,
            };

            let next_retirement = match result {
                Ok(report) => {
                    metrics::record_poll(report.outcome.as_str(), started.elapsed().as_secs_f64());
                    report.next_retirement
                }
                Err(e) => {
                    let outcome = match &e {
                        BridgeError::UpstreamFetch { .. } => "fetch_error",
                        BridgeError::IssuerMismatch { .. } => "issuer_mismatch",
                        BridgeError::LeaderLost { .. } => "leader_lost",
                        _ => "error",
                    };
                    metrics::record_poll(outcome, started.elapsed().as_secs_f64());
                    match &e {
                        BridgeError::IssuerMismatch { .. } => {
                            error!(error = %e, "Upstream issuer mismatch, nothing committed")
                        }
                        BridgeError::LeaderLost { .. } => debug!(error = %e, "Poll abandoned"),
                        _ => warn!(error = %e, "Poll failed, keeping the last committed state"),
                    }
                    None
                }
            };

            let wait = next_wait(self.settings.poll_interval, next_retirement, Utc::now());
            tokio::select! {
                _ = term.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Bridge stopped");
        Ok(())
    }
}

/// Time until the next poll: the poll interval, shortened to land just
/// after the nearest retirement deadline
pub fn next_wait(
    poll_interval: Duration,
    next_retirement: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let Some(retire_at) = next_retirement else {
        return poll_interval;
    };
    let until = (retire_at - now).to_std().unwrap_or(Duration::ZERO) + RETIREMENT_SLACK;
    until.clamp(MIN_WAIT.min(poll_interval), poll_interval)
}
