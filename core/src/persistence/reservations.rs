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

//! Account reservations.
//!
//! A reservation pins an account to at most one in-flight request. It is
//! taken when the request passes validation, released when the request
//! commits, and expires `RESERVATION_PERIOD` epochs after it was taken.
//! Reservations are never rolled back speculatively: a backup that voted for
//! a proposal which never commits keeps the reservation until expiry, which
//! is what prevents double-spend races across concurrent backups.

use log::warn;

use std::collections::HashMap;

use crate::{
    account::ReservationInfo,
    constants::RESERVATION_PERIOD,
    schema::{LedgerSchema, SchemaAccess},
    types::{AccountAddress, Epoch},
};
use trilith_crypto::Hash;

/// Outcome of a reservation probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// No conflicting reservation; the account may be reserved.
    Available,
    /// The same request already holds the reservation.
    Duplicate,
    /// A different request holds an unexpired reservation.
    Conflict,
}

/// In-memory reservation cache in front of the `reservations` index.
///
/// The cache is authoritative between commits; the index catches up when the
/// writer applies a block. A node restart therefore sees the reservations of
/// every committed block and loses only those of proposals that never
/// committed, which expire on their own.
#[derive(Debug, Default)]
pub struct Reservations {
    cache: HashMap<AccountAddress, ReservationInfo>,
}

impl Reservations {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes whether `account` can be reserved for `hash`.
    pub fn can_acquire<A: SchemaAccess>(
        &mut self,
        schema: &LedgerSchema<A>,
        account: &AccountAddress,
        hash: &Hash,
        current_epoch: Epoch,
    ) -> Acquire {
        let info = match self.cache.get(account) {
            Some(info) => *info,
            None => match schema.reservation(account) {
                Some(info) => {
                    // Populate the cache from the store.
                    self.cache.insert(*account, info);
                    info
                }
                None => return Acquire::Available,
            },
        };

        if info.hash == *hash {
            Acquire::Duplicate
        } else if current_epoch >= info.epoch + RESERVATION_PERIOD {
            Acquire::Available
        } else {
            Acquire::Conflict
        }
    }

    /// Records a reservation. Only called after [`can_acquire`] allowed it.
    ///
    /// [`can_acquire`]: Self::can_acquire
    pub fn update(&mut self, account: AccountAddress, hash: Hash, epoch: Epoch) {
        if let Some(existing) = self.cache.get(&account) {
            if existing.hash != hash && existing.epoch + RESERVATION_PERIOD > epoch {
                // The probe must have run first; an overwrite of a live
                // reservation is an invariant violation in the caller.
                warn!(
                    "overwriting live reservation of {} ({} -> {})",
                    account, existing.hash, hash
                );
            }
        }
        self.cache.insert(account, ReservationInfo { hash, epoch });
    }

    /// Releases an account's reservation after its request committed.
    pub fn release(&mut self, account: &AccountAddress) {
        self.cache.remove(account);
    }

    /// The reservation currently cached for an account.
    pub fn get(&self, account: &AccountAddress) -> Option<&ReservationInfo> {
        self.cache.get(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith_crypto::hash;
    use trilith_storage::{Database, Snapshot, TemporaryDB};

    fn schema_of(snapshot: &dyn Snapshot) -> LedgerSchema<&dyn Snapshot> {
        LedgerSchema::new(snapshot)
    }

    #[test]
    fn conflict_until_committed_or_expired() {
        let db = TemporaryDB::new();
        let snapshot = db.snapshot();
        let schema = schema_of(&*snapshot);
        let mut reservations = Reservations::new();
        let account = AccountAddress([1; 32]);
        let (r1, r2) = (hash(b"r1"), hash(b"r2"));

        assert_eq!(
            reservations.can_acquire(&schema, &account, &r1, 5),
            Acquire::Available
        );
        reservations.update(account, r1, 5);

        assert_eq!(
            reservations.can_acquire(&schema, &account, &r1, 5),
            Acquire::Duplicate
        );
        assert_eq!(
            reservations.can_acquire(&schema, &account, &r2, 5),
            Acquire::Conflict
        );

        // Expires RESERVATION_PERIOD epochs later.
        assert_eq!(
            reservations.can_acquire(&schema, &account, &r2, 5 + RESERVATION_PERIOD),
            Acquire::Available
        );

        // Or is released by commit.
        reservations.release(&account);
        assert_eq!(
            reservations.can_acquire(&schema, &account, &r2, 5),
            Acquire::Available
        );
    }

    #[test]
    fn cache_is_populated_from_the_store() {
        use crate::account::ReservationInfo;

        let db = TemporaryDB::new();
        let account = AccountAddress([2; 32]);
        let reserved = hash(b"persisted");

        let mut fork = db.fork();
        let mut schema = LedgerSchema::new(&mut fork);
        schema.put_reservation(
            &account,
            &ReservationInfo {
                hash: reserved,
                epoch: 3,
            },
        );
        db.merge(fork.into_patch()).unwrap();

        let snapshot = db.snapshot();
        let schema = schema_of(&*snapshot);
        let mut reservations = Reservations::new();
        assert_eq!(
            reservations.can_acquire(&schema, &account, &hash(b"other"), 4),
            Acquire::Conflict
        );
        assert_eq!(
            reservations.can_acquire(&schema, &account, &reserved, 4),
            Acquire::Duplicate
        );
    }
}
