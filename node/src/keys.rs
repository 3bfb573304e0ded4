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

//! Per-epoch delegate key tables.
//!
//! Delegate ids index the key table of their epoch, populated from the epoch
//! block that elected the committee (two epochs back). Non-delegate
//! observers obtain the same tables through the [`ValidatorBuilder`], which
//! walks the epoch chain on demand and caches the result.

use log::warn;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use trilith::{
    blocks::{AggSignature, DelegateInfo},
    constants::NUM_DELEGATES,
    persistence::epoch::ELECTION_LOOKAHEAD,
    schema::LedgerSchema,
    types::{Amount, DelegateId, Epoch},
};
use trilith_crypto::{
    bls::{self, BlsPublicKey},
    CryptoError, Hash,
};
use trilith_storage::Database;

/// The BLS keys and voting weights of one epoch's committee.
#[derive(Debug, Clone)]
pub struct DelegateKeyStore {
    epoch: Epoch,
    keys: Vec<BlsPublicKey>,
    weights: Vec<Amount>,
}

impl DelegateKeyStore {
    /// Builds the table for `epoch` from the elected committee.
    pub fn from_delegates(epoch: Epoch, delegates: &[DelegateInfo]) -> Self {
        assert_eq!(delegates.len(), NUM_DELEGATES);
        Self {
            epoch,
            keys: delegates.iter().map(|d| d.bls_key).collect(),
            weights: delegates.iter().map(|d| d.vote_weight).collect(),
        }
    }

    /// Epoch this table serves.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The key of one delegate.
    pub fn key(&self, id: DelegateId) -> Option<&BlsPublicKey> {
        self.keys.get(id.index())
    }

    /// The voting weight of one delegate.
    pub fn weight(&self, id: DelegateId) -> Amount {
        self.weights.get(id.index()).copied().unwrap_or_default()
    }

    /// Voting weights of the whole committee, by delegate id.
    pub fn weights(&self) -> &[Amount] {
        &self.weights
    }

    /// Replaces a delegate's key from a key advertisement.
    pub fn advertise(&mut self, id: DelegateId, key: BlsPublicKey) {
        if let Some(slot) = self.keys.get_mut(id.index()) {
            if *slot != key {
                warn!("delegate {} re-advertised its key for epoch {}", id, self.epoch);
            }
            *slot = key;
        }
    }

    /// Verifies an aggregate signature over `msg` against the keys selected
    /// by the aggregate's participation bitmap.
    pub fn verify_aggregate(&self, msg: &Hash, aggregate: &AggSignature) -> Result<(), CryptoError> {
        let keys: Vec<BlsPublicKey> = aggregate
            .map
            .ids()
            .into_iter()
            .filter_map(|id| self.key(id).copied())
            .collect();
        if keys.len() != aggregate.map.count() {
            return Err(CryptoError::Aggregation("unknown delegate in bitmap"));
        }
        bls::verify_aggregate(msg.as_ref(), &aggregate.signature, &keys)
    }

    /// Total voting weight selected by a participation bitmap.
    pub fn aggregate_weight(&self, aggregate: &AggSignature) -> Amount {
        aggregate
            .map
            .ids()
            .into_iter()
            .fold(Amount::ZERO, |acc, id| acc + self.weight(id))
    }
}

/// Builds and caches key stores for arbitrary epochs.
///
/// The committee of epoch `E` was announced by the epoch block closing
/// `E - 2`. The builder first consults the `delegate_keys` index; if the
/// table was not materialized (a fresh observer), it walks the epoch chain
/// backwards from the tip to the announcing block.
pub struct ValidatorBuilder {
    db: Arc<dyn Database>,
    cache: Mutex<HashMap<Epoch, Arc<DelegateKeyStore>>>,
}

impl ValidatorBuilder {
    /// Creates a builder over the store.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The key store of `epoch`, if derivable from the ledger.
    pub fn key_store(&self, epoch: Epoch) -> Option<Arc<DelegateKeyStore>> {
        if let Some(store) = self.cache.lock().expect("validator cache").get(&epoch) {
            return Some(Arc::clone(store));
        }

        let snapshot = self.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);

        let delegates = schema.delegates(epoch).or_else(|| {
            // Walk the epoch chain to the block that announced this epoch's
            // committee.
            let target = epoch.saturating_sub(ELECTION_LOOKAHEAD);
            let mut cursor = schema.epoch_tip();
            if cursor.is_empty() {
                return None;
            }
            let mut block = schema.epoch_block(&cursor.digest)?;
            while block.epoch > target {
                cursor.digest = block.previous;
                block = schema.epoch_block(&cursor.digest)?;
            }
            if block.epoch == target {
                Some(block.delegates)
            } else {
                None
            }
        })?;

        let store = Arc::new(DelegateKeyStore::from_delegates(epoch, &delegates));
        self.cache
            .lock()
            .expect("validator cache")
            .insert(epoch, Arc::clone(&store));
        Some(store)
    }

    /// Drops cached tables of epochs before `epoch`.
    pub fn retire_before(&self, epoch: Epoch) {
        self.cache
            .lock()
            .expect("validator cache")
            .retain(|&cached, _| cached >= epoch);
    }
}

impl std::fmt::Debug for ValidatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValidatorBuilder(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith::{
        blocks::ParticipationMap,
        genesis::{initialize, GenesisConfig},
        types::AccountAddress,
    };
    use trilith_crypto::bls::BlsKeyPair;
    use trilith_storage::TemporaryDB;

    fn committee(seed: u8) -> (Vec<BlsKeyPair>, Vec<DelegateInfo>) {
        let pairs: Vec<_> = (0..NUM_DELEGATES)
            .map(|i| BlsKeyPair::from_seed(&[seed.wrapping_add(i as u8 + 1); 32]))
            .collect();
        let infos = pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| DelegateInfo {
                account: AccountAddress([i as u8 + 1; 32]),
                bls_key: pair.public_key(),
                vote_weight: Amount(1),
                stake: Amount(100),
            })
            .collect();
        (pairs, infos)
    }

    #[test]
    fn aggregate_verification_selects_keys_by_bitmap() {
        let (pairs, infos) = committee(1);
        let store = DelegateKeyStore::from_delegates(1, &infos);
        let msg = trilith_crypto::hash(b"phase digest");

        let voters = [0_usize, 5, 9];
        let partials: Vec<_> = voters
            .iter()
            .map(|&i| pairs[i].sign(msg.as_ref()))
            .collect();
        let mut map = ParticipationMap::new();
        for &i in &voters {
            map.set(DelegateId(i as u8));
        }
        let aggregate = AggSignature {
            map,
            signature: bls::aggregate(&partials).unwrap(),
        };

        store.verify_aggregate(&msg, &aggregate).unwrap();
        assert_eq!(store.aggregate_weight(&aggregate), Amount(3));

        // A bitmap naming a delegate that did not sign fails.
        let mut wrong = aggregate.clone();
        wrong.map.set(DelegateId(11));
        assert!(store.verify_aggregate(&msg, &wrong).is_err());
    }

    #[test]
    fn validator_builder_reads_the_delegate_table() {
        let (_, infos) = committee(2);
        let db = Arc::new(TemporaryDB::new());
        let config = GenesisConfig {
            accounts: vec![],
            delegates: infos.clone(),
            timestamp: 0,
        };
        initialize(db.as_ref(), &config).unwrap();

        let builder = ValidatorBuilder::new(db);
        let store = builder.key_store(1).unwrap();
        assert_eq!(store.key(DelegateId(4)), Some(&infos[4].bls_key));
        assert!(builder.key_store(ELECTION_LOOKAHEAD + 1).is_none());
    }
}
