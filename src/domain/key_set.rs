//! Insertion-ordered set of signing keys, unique by `kid`

use super::key::{KeyEntry, SigningAlgorithm};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<KeyEntry>", into = "Vec<KeyEntry>")]
pub struct KeySet {
    entries: Vec<KeyEntry>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns `false` and leaves the set untouched when an
    /// entry with the same `kid` is already present.
    pub fn insert(&mut self, entry: KeyEntry) -> bool {
        if self.contains(&entry.kid) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.entries.iter().any(|e| e.kid == kid)
    }

    pub fn get(&self, kid: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.kid == kid)
    }

    pub fn remove(&mut self, kid: &str) -> Option<KeyEntry> {
        let index = self.entries.iter().position(|e| e.kid == kid)?;
        Some(self.entries.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.kid.as_str()).collect()
    }

    /// Distinct algorithms in the set, sorted
    pub fn algorithms(&self) -> Vec<SigningAlgorithm> {
        self.entries.iter().map(|e| e.algorithm).collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Append every entry of `other` whose `kid` is not yet present
    pub fn extend_new(&mut self, other: &KeySet) {
        for entry in other.iter() {
            self.insert(entry.clone());
        }
    }
}

impl From<Vec<KeyEntry>> for KeySet {
    fn from(entries: Vec<KeyEntry>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<KeySet> for Vec<KeyEntry> {
    fn from(set: KeySet) -> Self {
        set.entries
    }
}

impl FromIterator<KeyEntry> for KeySet {
    fn from_iter<I: IntoIterator<Item = KeyEntry>>(iter: I) -> Self {
        let mut set = KeySet::new();
        for entry in iter {
            set.insert(entry);
        }
        set
    }
}

impl IntoIterator for KeySet {
    type Item = KeyEntry;
    type IntoIter = std::vec::IntoIter<KeyEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a KeySet {
    type Item = &'a KeyEntry;
    type IntoIter = std::slice::Iter<'a, KeyEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::key::tests::rsa_material;
    use chrono::Utc;

    fn entry(seed: &str) -> KeyEntry {
        KeyEntry::new(rsa_material(seed), SigningAlgorithm::RS256, Utc::now())
    }

    #[test]
    fn insert_is_unique_by_kid() {
        let mut set = KeySet::new();
        let a = entry("a");
        assert!(set.insert(a.clone()));
        assert!(!set.insert(a.clone()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn preserves_insertion_order() {
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));
        let set: KeySet = vec![c.clone(), a.clone(), b.clone()].into();
        assert_eq!(set.kids(), vec![c.kid.as_str(), a.kid.as_str(), b.kid.as_str()]);
    }

    #[test]
    fn deserialization_drops_duplicates() {
        let a = entry("a");
        let json = serde_json::to_string(&vec![a.clone(), a.clone()]).unwrap();
        let set: KeySet = serde_json::from_str(&json).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_returns_entry() {
        let a = entry("a");
        let mut set: KeySet = vec![a.clone(), entry("b")].into();
        assert_eq!(set.remove(&a.kid), Some(a.clone()));
        assert!(!set.contains(&a.kid));
        assert_eq!(set.remove(&a.kid), None);
    }
}
