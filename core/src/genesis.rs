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

//! Deterministic genesis initialization.
//!
//! An empty store is seeded with the configured accounts and an epoch-0
//! epoch block carrying the initial delegate committee. The committee serves
//! unchanged through the first epochs until elections take over via the
//! regular two-epoch lookahead.

use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::{
    account::Account,
    blocks::{DelegateInfo, EpochBlock},
    constants::NUM_DELEGATES,
    persistence::epoch::ELECTION_LOOKAHEAD,
    schema::LedgerSchema,
    tip::Tip,
    types::{AccountAddress, Amount},
};
use trilith_crypto::{Hash, ObjectHash};
use trilith_storage::Database;

/// The ledger's initial state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Initial accounts and balances.
    pub accounts: Vec<GenesisAccount>,
    /// The initial delegate committee.
    pub delegates: Vec<DelegateInfo>,
    /// Timestamp of the genesis block, milliseconds since the Unix epoch.
    /// Doubles as the anchor of the epoch clock.
    pub timestamp: u64,
}

/// One pre-funded account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// The account address.
    pub address: AccountAddress,
    /// Its initial balance.
    pub balance: Amount,
}

/// Seeds an empty store. Returns the digest of the genesis epoch block; on a
/// store that is already initialized this is a no-op returning the stored
/// digest.
pub fn initialize(
    db: &dyn Database,
    config: &GenesisConfig,
) -> Result<Hash, trilith_storage::Error> {
    assert_eq!(
        config.delegates.len(),
        NUM_DELEGATES,
        "genesis requires a full delegate committee"
    );

    {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let tip = schema.epoch_tip();
        if !tip.is_empty() {
            return Ok(tip.digest);
        }
    }

    let mut total_supply = Amount::ZERO;
    let mut fork = db.fork();
    let mut schema = LedgerSchema::new(&mut fork);

    for genesis_account in &config.accounts {
        schema.put_account(&genesis_account.address, &Account::open(genesis_account.balance, 0));
        total_supply = total_supply
            .checked_add(genesis_account.balance)
            .expect("genesis supply fits u128");
    }

    let block = EpochBlock::new(
        Hash::zero(),
        0,
        config.timestamp,
        crate::types::DelegateId(0),
        Tip::empty(),
        config.delegates.clone(),
        Amount::ZERO,
        total_supply,
    );
    let digest = block.object_hash();
    schema.put_epoch_block(&digest, &block);

    // The genesis committee serves until elected sets take over.
    for epoch in 0..=ELECTION_LOOKAHEAD {
        schema.put_delegates(epoch, &config.delegates);
    }
    schema.put_total_supply(total_supply);

    db.merge(fork.into_patch())?;
    info!(
        "initialized genesis: {} accounts, supply {}, epoch block {}",
        config.accounts.len(),
        total_supply,
        digest
    );
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith_crypto::bls::BlsKeyPair;
    use trilith_storage::TemporaryDB;

    /// A committee of freshly generated delegates with uniform weight.
    pub fn test_delegates(seed: u8) -> Vec<DelegateInfo> {
        (0..NUM_DELEGATES)
            .map(|i| DelegateInfo {
                account: AccountAddress([i as u8 + 1; 32]),
                bls_key: BlsKeyPair::from_seed(&[seed.wrapping_add(i as u8 + 1); 32]).public_key(),
                vote_weight: Amount(1),
                stake: Amount(1_000),
            })
            .collect()
    }

    #[test]
    fn initialize_is_idempotent() {
        let db = TemporaryDB::new();
        let config = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: AccountAddress([1; 32]),
                balance: Amount(500),
            }],
            delegates: test_delegates(1),
            timestamp: 1_000,
        };

        let first = initialize(&db, &config).unwrap();
        let second = initialize(&db, &config).unwrap();
        assert_eq!(first, second);

        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(schema.epoch_tip().epoch, 0);
        assert_eq!(schema.total_supply(), Amount(500));
        assert_eq!(
            schema.account(&AccountAddress([1; 32])).unwrap().balance,
            Amount(500)
        );
        assert!(schema.delegates(2).is_some());
        assert!(schema.delegates(3).is_none());
    }
}
