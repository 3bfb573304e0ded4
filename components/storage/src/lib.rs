// Copyright 2020 The Trilith Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Embedded key-value storage of the Trilith ledger.
//!
//! The store is organized as a set of **named indices** (accounts, blocks by
//! hash, chain tips, reservations, ...), each a flat byte-keyed map. Two
//! backends implement the [`Database`] trait:
//!
//! - [`TemporaryDB`] — an in-memory backend for tests;
//! - [`RocksDB`] — the production backend, mapping each named index to a
//!   column family.
//!
//! Writes go through a [`Fork`]: an overlay of uncommitted changes on top of
//! a snapshot, turned into a [`Patch`] and applied atomically with
//! [`Database::merge`]. The node's writer domain owns the only long-lived
//! fork; all other domains read snapshots.

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]

mod rocks;
mod temporary;

pub use crate::{rocks::RocksDB, temporary::TemporaryDB};

use std::collections::BTreeMap;

/// Storage error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend-level failure (I/O, corruption). Per the error taxonomy this
    /// is fatal for the writer domain; the caller decides whether to abort.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Storage result.
pub type Result<T> = std::result::Result<T, Error>;

/// A read-only view of the database.
///
/// `TemporaryDB` snapshots are true point-in-time copies. The RocksDB
/// backend serves reads from the live database; with a single writer merging
/// atomic patches this still never observes a torn write.
pub trait Snapshot: Send + Sync {
    /// Reads a value from the named index.
    fn get(&self, index: &str, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns `true` if the named index contains the key.
    fn contains(&self, index: &str, key: &[u8]) -> bool {
        self.get(index, key).is_some()
    }
}

impl Snapshot for Box<dyn Snapshot> {
    fn get(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        (**self).get(index, key)
    }
}

/// A database supporting snapshots and atomic merges.
pub trait Database: Send + Sync + 'static {
    /// Creates a new snapshot of the current state.
    fn snapshot(&self) -> Box<dyn Snapshot>;

    /// Atomically applies a patch. Either every change in the patch becomes
    /// visible or none does.
    fn merge(&self, patch: Patch) -> Result<()>;

    /// Creates a fork of the current state.
    fn fork(&self) -> Fork {
        Fork {
            snapshot: self.snapshot(),
            patch: Patch::default(),
        }
    }
}

/// A single uncommitted change to one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Set the key to the given value.
    Put(Vec<u8>),
    /// Remove the key.
    Delete,
}

/// An ordered set of changes across named indices, ready to be merged.
#[derive(Debug, Default)]
pub struct Patch {
    changes: BTreeMap<String, BTreeMap<Vec<u8>, Change>>,
}

impl Patch {
    /// Iterates over `(index, key, change)` entries of the patch.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8], &Change)> {
        self.changes.iter().flat_map(|(index, changes)| {
            changes
                .iter()
                .map(move |(key, change)| (index.as_str(), key.as_slice(), change))
        })
    }

    /// Returns `true` if the patch contains no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(BTreeMap::is_empty)
    }

    fn put(&mut self, index: &str, key: Vec<u8>, change: Change) {
        self.changes
            .entry(index.to_owned())
            .or_insert_with(BTreeMap::new)
            .insert(key, change);
    }

    fn get(&self, index: &str, key: &[u8]) -> Option<&Change> {
        self.changes.get(index)?.get(key)
    }
}

/// A mutable overlay on top of a snapshot.
///
/// Reads see the overlay first and fall through to the snapshot, so the
/// writer observes its own uncommitted changes (required when several blocks
/// of one commit round touch the same accounts).
pub struct Fork {
    snapshot: Box<dyn Snapshot>,
    patch: Patch,
}

impl Fork {
    /// Reads a value, preferring uncommitted changes of this fork.
    pub fn get(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        match self.patch.get(index, key) {
            Some(Change::Put(value)) => Some(value.clone()),
            Some(Change::Delete) => None,
            None => self.snapshot.get(index, key),
        }
    }

    /// Returns `true` if the key is present in this fork's view.
    pub fn contains(&self, index: &str, key: &[u8]) -> bool {
        self.get(index, key).is_some()
    }

    /// Stages a put.
    pub fn put(&mut self, index: &str, key: Vec<u8>, value: Vec<u8>) {
        self.patch.put(index, key, Change::Put(value));
    }

    /// Stages a removal.
    pub fn remove(&mut self, index: &str, key: Vec<u8>) {
        self.patch.put(index, key, Change::Delete);
    }

    /// Consumes the fork, yielding the accumulated patch.
    pub fn into_patch(self) -> Patch {
        self.patch
    }
}

impl std::fmt::Debug for Fork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fork").field("patch", &self.patch).finish()
    }
}

impl Snapshot for Fork {
    fn get(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        Fork::get(self, index, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kv(byte: u8) -> Vec<u8> {
        vec![byte]
    }

    #[test]
    fn fork_overlay_and_merge() {
        let db = TemporaryDB::new();
        let mut fork = db.fork();
        fork.put("accounts", kv(1), kv(10));
        fork.put("accounts", kv(2), kv(20));
        fork.remove("accounts", kv(2));

        // The fork sees its own changes; the database does not yet.
        assert_eq!(fork.get("accounts", &kv(1)), Some(kv(10)));
        assert_eq!(fork.get("accounts", &kv(2)), None);
        assert_eq!(db.snapshot().get("accounts", &kv(1)), None);

        db.merge(fork.into_patch()).unwrap();
        let snapshot = db.snapshot();
        assert_eq!(snapshot.get("accounts", &kv(1)), Some(kv(10)));
        assert_eq!(snapshot.get("accounts", &kv(2)), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_merges() {
        let db = TemporaryDB::new();
        let mut fork = db.fork();
        fork.put("tips", kv(1), kv(1));
        db.merge(fork.into_patch()).unwrap();

        let snapshot = db.snapshot();
        let mut fork = db.fork();
        fork.put("tips", kv(1), kv(2));
        db.merge(fork.into_patch()).unwrap();

        assert_eq!(snapshot.get("tips", &kv(1)), Some(kv(1)));
        assert_eq!(db.snapshot().get("tips", &kv(1)), Some(kv(2)));
    }

    #[test]
    fn indices_do_not_alias() {
        let db = TemporaryDB::new();
        let mut fork = db.fork();
        fork.put("micro_tip", kv(0), kv(1));
        db.merge(fork.into_patch()).unwrap();

        let snapshot = db.snapshot();
        assert_eq!(snapshot.get("micro_tip", &kv(0)), Some(kv(1)));
        assert_eq!(snapshot.get("epoch_tip", &kv(0)), None);
    }
}
