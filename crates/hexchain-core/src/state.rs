//! Post-execution world state as seen by the validator.
//!
//! The storage engine is external; the validator only needs an ordered
//! key/value view with a deterministic root and the ability to diff two
//! snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::{CanonicalHasher, Hash};

/// An ordered key/value snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Root commitment over all entries in key order.
    pub fn root(&self) -> Hash {
        let mut h = CanonicalHasher::new("hexchain.world-state");
        h.u64(self.entries.len() as u64);
        for (k, v) in &self.entries {
            h.bytes(k).bytes(v);
        }
        h.finalize()
    }

    /// Writes that turn `base` into `self`.
    pub fn diff(&self, base: &WorldState) -> StateDelta {
        let mut writes = BTreeMap::new();
        for (k, v) in &self.entries {
            if base.entries.get(k) != Some(v) {
                writes.insert(k.clone(), Some(v.clone()));
            }
        }
        for k in base.entries.keys() {
            if !self.entries.contains_key(k) {
                writes.insert(k.clone(), None);
            }
        }
        StateDelta { writes }
    }

    /// Apply a single write. `None` deletes the key.
    pub fn apply_write(&mut self, key: &[u8], value: Option<&[u8]>) {
        match value {
            Some(v) => {
                self.entries.insert(key.to_vec(), v.to_vec());
            }
            None => {
                self.entries.remove(key);
            }
        }
    }

    pub fn apply(&mut self, delta: &StateDelta) {
        for (k, v) in delta.iter() {
            self.apply_write(k, v);
        }
    }
}

impl<K: Into<Vec<u8>>, V: Into<Vec<u8>>> FromIterator<(K, V)> for WorldState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// The set of writes separating two snapshots, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.writes.get(key).map(|v| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.writes.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
    }
}
