//! Rotation notifications
//!
//! The Bridge announces every committed key-set transition on a broadcast
//! channel. Polls that change nothing announce nothing. Subscribers that lag
//! behind lose the oldest events; the cache remains the source of truth.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::CacheVersion;
use crate::domain::RotationTransition;

const CHANNEL_CAPACITY: usize = 64;

/// A committed change to the published key set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationEvent {
    pub issuer: String,
    pub version: CacheVersion,
    pub transition: RotationTransition,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RotationNotifier {
    tx: broadcast::Sender<RotationEvent>,
}

impl RotationNotifier {
    pub fn new() -> (Self, broadcast::Receiver<RotationEvent>) {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.tx.subscribe()
    }

    /// Broadcast `event`; having no subscribers is not an error
    pub fn notify(&self, event: RotationEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscribers for rotation event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn event(version: &str) -> RotationEvent {
        RotationEvent {
            issuer: "https://oidc.example.com".to_string(),
            version: CacheVersion::new(version),
            transition: RotationTransition { added: vec!["k1".into()], ..Default::default() },
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let (notifier, mut rx) = RotationNotifier::new();
        let mut late = notifier.subscribe();

        notifier.notify(event("1"));
        assert_eq!(rx.recv().await.unwrap().version.as_str(), "1");
        assert_eq!(late.recv().await.unwrap().transition.added, vec!["k1".to_string()]);
    }

    #[test]
    #[traced_test]
    fn notify_without_subscribers_is_silent() {
        let (notifier, rx) = RotationNotifier::new();
        drop(rx);
        notifier.notify(event("2"));
        assert!(logs_contain("No subscribers for rotation event"));
    }
}
