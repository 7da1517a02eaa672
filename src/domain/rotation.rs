//! Key rotation overlap state machine
//!
//! [`observe`] merges a freshly fetched key set into the previous
//! [`RotationState`]. Keys that vanish upstream stay publishable until their
//! retirement deadline; keys that come back before the deadline are promoted
//! to active again. The function is pure: it never reads the clock and never
//! persists anything, the Bridge owns both.

use super::key::KeyEntry;
use super::key_set::KeySet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// A key that disappeared upstream and is waiting out its overlap window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiringKey {
    pub entry: KeyEntry,
    pub retire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    active: KeySet,
    #[serde(default)]
    retiring: Vec<RetiringKey>,
    #[serde(default)]
    overlap_seconds: u64,
}

impl RotationState {
    pub fn new(overlap: Duration) -> Self {
        Self { active: KeySet::new(), retiring: Vec::new(), overlap_seconds: overlap.as_secs() }
    }

    pub fn active(&self) -> &KeySet {
        &self.active
    }

    pub fn retiring(&self) -> &[RetiringKey] {
        &self.retiring
    }

    pub fn overlap(&self) -> Duration {
        Duration::from_secs(self.overlap_seconds)
    }

    pub fn retire_at(&self, kid: &str) -> Option<DateTime<Utc>> {
        self.retiring.iter().find(|r| r.entry.kid == kid).map(|r| r.retire_at)
    }

    /// Keys to publish: active keys first, then keys still inside their overlap window
    pub fn published(&self) -> KeySet {
        let mut set = self.active.clone();
        for retiring in &self.retiring {
            set.insert(retiring.entry.clone());
        }
        set
    }

    /// Earliest pending retirement, used to wake the poller on time
    pub fn next_retirement(&self) -> Option<DateTime<Utc>> {
        self.retiring.iter().map(|r| r.retire_at).min()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.retiring.is_empty()
    }

    /// Hex SHA-256 of the canonical JSON encoding
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

/// What a single [`observe`] call changed, by `kid`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationTransition {
    pub added: Vec<String>,
    pub retiring: Vec<String>,
    pub resurrected: Vec<String>,
    pub dropped: Vec<String>,
}

impl RotationTransition {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.retiring.is_empty()
            && self.resurrected.is_empty()
            && self.dropped.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: RotationState,
    /// `None` when the poll observed nothing new
    pub transition: Option<RotationTransition>,
}

/// Merge `fetched` into `current` at time `now`.
///
/// Resurrection is evaluated before expiry: a key that reappears on the same
/// tick its retirement deadline passes stays active.
pub fn observe(
    current: &RotationState,
    fetched: &KeySet,
    now: DateTime<Utc>,
    overlap: Duration,
) -> Observation {
    let retire_at = chrono::Duration::from_std(overlap)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let mut transition = RotationTransition::default();
    let mut active = KeySet::new();
    let mut newly_retiring = Vec::new();

    for entry in current.active.iter() {
        if fetched.contains(&entry.kid) {
            active.insert(entry.clone());
        } else if retire_at <= now {
            transition.dropped.push(entry.kid.clone());
        } else {
            transition.retiring.push(entry.kid.clone());
            newly_retiring.push(RetiringKey { entry: entry.clone(), retire_at });
        }
    }

    for entry in fetched.iter() {
        if active.contains(&entry.kid) {
            continue;
        }
        match current.retiring.iter().find(|r| r.entry.kid == entry.kid) {
            Some(previous) => {
                transition.resurrected.push(entry.kid.clone());
                active.insert(previous.entry.clone());
            }
            None => {
                transition.added.push(entry.kid.clone());
                active.insert(KeyEntry { first_seen: now, ..entry.clone() });
            }
        }
    }

    let mut retiring = Vec::with_capacity(current.retiring.len() + newly_retiring.len());
    for previous in &current.retiring {
        if active.contains(&previous.entry.kid) {
            continue;
        }
        if previous.retire_at <= now {
            transition.dropped.push(previous.entry.kid.clone());
        } else {
            retiring.push(previous.clone());
        }
    }
    retiring.extend(newly_retiring);

    let state = RotationState { active, retiring, overlap_seconds: overlap.as_secs() };
    let transition = (!transition.is_empty()).then_some(transition);

    Observation { state, transition }
}
