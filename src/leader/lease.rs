//! `coordination.k8s.io/v1` Lease leader election
//!
//! Every replica tries to acquire or renew the same Lease each retry period.
//! All updates are compare-and-swap `replace` calls carrying the observed
//! `resourceVersion`, so two replicas can never both believe they renewed. A
//! leader that cannot renew within the renew deadline steps down before its
//! lease can expire for others. On shutdown the holder clears the lease so a
//! successor does not have to wait out the lease duration.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LeaderElector;
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    /// Holder identity, normally the pod name
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Result of one acquire-or-renew round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Held,
    HeldByOther,
}

pub struct LeaseLeaderElector {
    api: Api<Lease>,
    config: LeaseConfig,
    leadership: watch::Sender<bool>,
}

impl std::fmt::Debug for LeaseLeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLeaderElector").field("config", &self.config).finish()
    }
}

impl LeaseLeaderElector {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        let (leadership, _) = watch::channel(false);
        Self { api: Api::namespaced(client, &config.namespace), config, leadership }
    }

    fn set_leader(&self, is_leader: bool) {
        let changed = self.leadership.send_if_modified(|current| {
            let changed = *current != is_leader;
            *current = is_leader;
            changed
        });
        if changed {
            info!(
                lease = %self.config.name,
                identity = %self.config.identity,
                is_leader,
                "Leadership changed"
            );
        }
    }

    fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    fn lease_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn desired_spec(&self, previous: Option<&LeaseSpec>) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        let renewing = previous
            .and_then(|s| s.holder_identity.as_deref())
            .is_some_and(|holder| holder == self.config.identity);

        let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.lease_seconds()),
            acquire_time: if renewing {
                previous.and_then(|s| s.acquire_time.clone()).or_else(|| Some(now.clone()))
            } else {
                Some(now.clone())
            },
            renew_time: Some(now),
            lease_transitions: Some(if renewing { transitions } else { transitions + 1 }),
            ..Default::default()
        }
    }

    async fn try_acquire_or_renew(&self) -> std::result::Result<Attempt, kube::Error> {
        let name = &self.config.name;

        let Some(existing) = self.api.get_opt(name).await? else {
            let lease = Lease {
                metadata: ObjectMeta { name: Some(name.clone()), ..Default::default() },
                spec: Some(LeaseSpec { lease_transitions: Some(0), ..self.desired_spec(None) }),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(Attempt::Held),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(Attempt::HeldByOther),
                Err(e) => Err(e),
            };
        };

        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref()).unwrap_or("");
        let duration = spec
            .and_then(|s| s.lease_duration_seconds)
            .map(|s| chrono::Duration::seconds(i64::from(s)))
            .unwrap_or_else(|| chrono::Duration::seconds(i64::from(self.lease_seconds())));
        let expired = spec
            .and_then(|s| s.renew_time.as_ref())
            .map_or(true, |renewed| Utc::now() > renewed.0 + duration);

        let is_ours = holder == self.config.identity;
        if !(is_ours || holder.is_empty() || expired) {
            debug!(lease = %name, holder, "Lease held by another replica");
            return Ok(Attempt::HeldByOther);
        }

        let updated = Lease {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                resource_version: existing.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(self.desired_spec(spec)),
        };

        match self.api.replace(name, &PostParams::default(), &updated).await {
            Ok(_) => Ok(Attempt::Held),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %name, "Lease CAS conflict, another replica updated it");
                Ok(Attempt::HeldByOther)
            }
            Err(e) => Err(e),
        }
    }

    /// Clear the holder so the next replica can acquire immediately
    async fn release(&self) {
        let name = &self.config.name;
        let existing = match self.api.get_opt(name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!(lease = %name, error = %e, "Failed to read lease for release");
                return;
            }
        };

        let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.config.identity.as_str()) {
            return;
        }

        let released = Lease {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                resource_version: existing.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: None,
                lease_duration_seconds: Some(1),
                renew_time: Some(MicroTime(Utc::now())),
                lease_transitions: existing.spec.as_ref().and_then(|s| s.lease_transitions),
                ..Default::default()
            }),
        };

        match self.api.replace(name, &PostParams::default(), &released).await {
            Ok(_) => info!(lease = %name, "Released leadership lease"),
            Err(e) => warn!(lease = %name, error = %e, "Failed to release leadership lease"),
        }
    }
}

#[async_trait]
impl LeaderElector for LeaseLeaderElector {
    fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            lease = %self.config.name,
            namespace = %self.config.namespace,
            identity = %self.config.identity,
            "Starting lease leader election"
        );
        let mut last_renewal: Option<Instant> = None;

        loop {
            let attempt = match tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {}s", self.config.renew_deadline.as_secs())),
            };

            match attempt {
                Ok(Attempt::Held) => {
                    last_renewal = Some(Instant::now());
                    self.set_leader(true);
                }
                Ok(Attempt::HeldByOther) => {
                    last_renewal = None;
                    self.set_leader(false);
                }
                Err(e) => {
                    warn!(lease = %self.config.name, error = %e, "Lease acquire/renew failed");
                    let deadline_passed = last_renewal
                        .map_or(true, |at| at.elapsed() >= self.config.renew_deadline);
                    if self.is_leader() && deadline_passed {
                        warn!(lease = %self.config.name, "Renew deadline exceeded, stepping down");
                        self.set_leader(false);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        let was_leader = self.is_leader();
        self.set_leader(false);
        if was_leader && tokio::time::timeout(self.config.renew_deadline, self.release()).await.is_err() {
            warn!(lease = %self.config.name, "Lease release timed out, it will expire on its own");
        }
        Ok(())
    }
}
