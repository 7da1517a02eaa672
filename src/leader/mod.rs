//! # Leadership
//!
//! A [`LeaderElector`] publishes "am I leader" on a `watch` channel.
//! [`run_while_leader`] turns that signal into task lifetimes: a leader-only
//! loop is started fresh on every acquisition and cancelled through its
//! [`CancellationToken`] the moment leadership is lost. Loops keep no state
//! across terms; everything durable lives in the shared cache or in storage.

pub mod lease;

use async_trait::async_trait;
use std::future::Future;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::Result;

pub use lease::{LeaseConfig, LeaseLeaderElector};

#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Leadership signal; `true` while this replica holds the lease
    fn leadership(&self) -> watch::Receiver<bool>;

    /// Participate in the election until `shutdown` fires, then step down
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Fixed leadership, for single-replica deployments and tests
#[derive(Debug)]
pub struct StaticLeaderElector {
    leadership: watch::Sender<bool>,
}

impl StaticLeaderElector {
    pub fn new(is_leader: bool) -> Self {
        let (leadership, _) = watch::channel(is_leader);
        Self { leadership }
    }

    /// Flip leadership by hand
    pub fn set_leader(&self, is_leader: bool) {
        self.leadership.send_replace(is_leader);
    }
}

#[async_trait]
impl LeaderElector for StaticLeaderElector {
    fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        self.leadership.send_replace(false);
        Ok(())
    }
}

/// Run `make_loop` for every leadership term until `shutdown` fires.
///
/// Each term gets a child token of `shutdown` that is cancelled on loss of
/// leadership; the gate waits for the loop to finish before waiting for the
/// next term. An `Err` from a loop ends the gate and is returned.
pub async fn run_while_leader<F, Fut>(
    role: &'static str,
    mut leadership: watch::Receiver<bool>,
    shutdown: CancellationToken,
    mut make_loop: F,
) -> Result<()>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        while !*leadership.borrow_and_update() {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        info!(role, "Leadership acquired, starting leader loop");
        crate::observability::metrics::record_leadership(role, true);

        let term = shutdown.child_token();
        let mut task = tokio::spawn(make_loop(term.clone()));

        let finished = loop {
            tokio::select! {
                result = &mut task => break Some(result),
                changed = leadership.changed() => {
                    if changed.is_err() || !*leadership.borrow_and_update() {
                        info!(role, "Leadership lost, stopping leader loop");
                        break None;
                    }
                }
                _ = shutdown.cancelled() => break None,
            }
        };

        crate::observability::metrics::record_leadership(role, false);

        let result = match finished {
            Some(result) => result,
            None => {
                term.cancel();
                task.await
            }
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(role, error = %e, "Leader loop failed");
                return Err(e);
            }
            Err(join_error) => {
                error!(role, error = %join_error, "Leader loop panicked");
                return Err(crate::errors::BridgeError::internal(format!(
                    "{role} leader loop panicked: {join_error}"
                )));
            }
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
    }
}
