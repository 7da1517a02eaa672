//! Property tests for the overlap state machine against a reference model

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use oidc_bridge::domain::{observe, KeyEntry, KeySet, RotationState};
use proptest::prelude::*;

use common::{epoch, rsa_key};

const POOL: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Active,
    Retiring(DateTime<Utc>),
}

fn pool() -> Vec<KeyEntry> {
    (0..POOL).map(|i| rsa_key(&format!("pool-{i}"))).collect()
}

fn fetched(pool: &[KeyEntry], mask: u8) -> KeySet {
    pool.iter().enumerate().filter(|(i, _)| mask & (1 << i) != 0).map(|(_, k)| k.clone()).collect()
}

/// One step of the reference model
fn step(model: &mut BTreeMap<String, Model>, fetched: &KeySet, now: DateTime<Utc>, overlap: Duration) {
    let retire_at = now + chrono::Duration::from_std(overlap).unwrap();
    let mut next = BTreeMap::new();
    for (kid, state) in model.iter() {
        if fetched.contains(kid) {
            continue;
        }
        match state {
            Model::Active if retire_at > now => {
                next.insert(kid.clone(), Model::Retiring(retire_at));
            }
            Model::Retiring(deadline) if *deadline > now => {
                next.insert(kid.clone(), Model::Retiring(*deadline));
            }
            _ => {}
        }
    }
    for kid in fetched.kids() {
        next.insert(kid.to_string(), Model::Active);
    }
    *model = next;
}

fn steps() -> impl Strategy<Value = Vec<(u8, u64)>> {
    proptest::collection::vec((1u8..(1 << POOL), 0u64..=48 * 3600), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// The published set always equals the model's active plus unexpired retiring keys
    #[test]
    fn published_set_matches_model(steps in steps(), overlap_hours in 0u64..=48) {
        let pool = pool();
        let overlap = Duration::from_secs(overlap_hours * 3600);
        let mut state = RotationState::new(overlap);
        let mut model = BTreeMap::new();
        let mut now = epoch();

        for (mask, advance) in steps {
            now += chrono::Duration::seconds(advance as i64);
            let fetched = fetched(&pool, mask);
            state = observe(&state, &fetched, now, overlap).state;
            step(&mut model, &fetched, now, overlap);

            let published: BTreeSet<String> = state.published().kids().into_iter().map(String::from).collect();
            let expected: BTreeSet<String> = model.keys().cloned().collect();
            prop_assert_eq!(&published, &expected);

            for (kid, m) in &model {
                if let Model::Retiring(deadline) = m {
                    prop_assert_eq!(state.retire_at(kid), Some(*deadline));
                }
            }
        }
    }

    /// Every fetched key is active; the published set is never empty
    #[test]
    fn fetched_keys_are_always_active(steps in steps(), overlap_hours in 0u64..=48) {
        let pool = pool();
        let overlap = Duration::from_secs(overlap_hours * 3600);
        let mut state = RotationState::new(overlap);
        let mut now = epoch();

        for (mask, advance) in steps {
            now += chrono::Duration::seconds(advance as i64);
            let fetched = fetched(&pool, mask);
            state = observe(&state, &fetched, now, overlap).state;

            let active: BTreeSet<&str> = state.active().kids().into_iter().collect();
            let want: BTreeSet<&str> = fetched.kids().into_iter().collect();
            prop_assert_eq!(active, want);
            prop_assert!(!state.published().is_empty());
            prop_assert!(state.retiring().iter().all(|r| r.retire_at > now));
        }
    }

    /// Observing the same fetch again at the same instant changes nothing
    #[test]
    fn repeated_observation_is_idempotent(steps in steps(), overlap_hours in 0u64..=48) {
        let pool = pool();
        let overlap = Duration::from_secs(overlap_hours * 3600);
        let mut state = RotationState::new(overlap);
        let mut now = epoch();

        for (mask, advance) in steps {
            now += chrono::Duration::seconds(advance as i64);
            let fetched = fetched(&pool, mask);
            state = observe(&state, &fetched, now, overlap).state;

            let again = observe(&state, &fetched, now, overlap);
            prop_assert!(again.transition.is_none());
            prop_assert_eq!(again.state.content_hash(), state.content_hash());
        }
    }
}
