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

//! Typed access to the named indices of the ledger store.
//!
//! `LedgerSchema::new(&snapshot)` gives read access; `LedgerSchema::new(&mut
//! fork)` additionally exposes the write methods used by the writer domain.

use crate::{
    account::{Account, ReceiveRecord, ReservationInfo},
    blocks::{DelegateInfo, EpochBlock, MicroBlock, RequestBlock},
    constants::NUM_DELEGATES,
    tip::Tip,
    token::{user_status_key, TokenAccount, TokenUserStatus},
    types::{AccountAddress, Amount, DelegateId, Epoch},
    wire::{WireDecode, WireEncode, WireReader},
};
use trilith_crypto::Hash;
use trilith_storage::{Fork, Snapshot};

/// Names of the store's indices. Each maps to a column family on disk.
pub mod indexes {
    /// Account state by address.
    pub const ACCOUNTS: &str = "accounts";
    /// Request blocks by digest.
    pub const REQUEST_BLOCKS: &str = "request_blocks";
    /// Micro blocks by digest.
    pub const MICRO_BLOCKS: &str = "micro_blocks";
    /// Epoch blocks by digest.
    pub const EPOCH_BLOCKS: &str = "epoch_blocks";
    /// Per-delegate request-chain tips.
    pub const REQUEST_TIPS: &str = "request_tips";
    /// The micro-chain tip.
    pub const MICRO_TIP: &str = "micro_tip";
    /// The epoch-chain tip.
    pub const EPOCH_TIP: &str = "epoch_tip";
    /// Receive-chain entries by `(send_hash, index)`.
    pub const RECEIVE_BLOCKS: &str = "receive_blocks";
    /// Token administrative records and per-user status entries.
    pub const TOKEN_ACCOUNTS: &str = "token_accounts";
    /// Account reservations.
    pub const RESERVATIONS: &str = "reservations";
    /// Delegate committees by the epoch they serve in.
    pub const DELEGATE_KEYS: &str = "delegate_keys";
    /// Ledger-wide counters (fee pool, total supply).
    pub const META: &str = "meta";
}

const TIP_KEY: &[u8] = b"tip";
const FEE_POOL_KEY: &[u8] = b"fee_pool";
const TOTAL_SUPPLY_KEY: &[u8] = b"total_supply";

/// Raw read access to the store, implemented by snapshots and forks.
pub trait SchemaAccess {
    /// Reads a raw value from a named index.
    fn fetch(&self, index: &str, key: &[u8]) -> Option<Vec<u8>>;
}

impl<S: Snapshot + ?Sized> SchemaAccess for &S {
    fn fetch(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.get(index, key)
    }
}

impl SchemaAccess for &mut Fork {
    fn fetch(&self, index: &str, key: &[u8]) -> Option<Vec<u8>> {
        (**self).get(index, key)
    }
}

/// Typed schema over the ledger store.
#[derive(Debug)]
pub struct LedgerSchema<T> {
    access: T,
}

impl<T: SchemaAccess> LedgerSchema<T> {
    /// Wraps an access handle.
    pub fn new(access: T) -> Self {
        Self { access }
    }

    fn decode<V: WireDecode>(&self, index: &str, key: &[u8]) -> Option<V> {
        let bytes = self.access.fetch(index, key)?;
        match V::from_wire(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                // A record that does not decode means the store is corrupt.
                panic!("corrupt record in index {}: {}", index, e);
            }
        }
    }

    /// Reads an account.
    pub fn account(&self, address: &AccountAddress) -> Option<Account> {
        self.decode(indexes::ACCOUNTS, address.as_bytes())
    }

    /// Reads a request block by digest.
    pub fn request_block(&self, hash: &Hash) -> Option<RequestBlock> {
        self.decode(indexes::REQUEST_BLOCKS, hash.as_bytes())
    }

    /// Reads a micro block by digest.
    pub fn micro_block(&self, hash: &Hash) -> Option<MicroBlock> {
        self.decode(indexes::MICRO_BLOCKS, hash.as_bytes())
    }

    /// Reads an epoch block by digest.
    pub fn epoch_block(&self, hash: &Hash) -> Option<EpochBlock> {
        self.decode(indexes::EPOCH_BLOCKS, hash.as_bytes())
    }

    /// Returns `true` if a block with this digest is stored on any chain.
    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.access
            .fetch(indexes::REQUEST_BLOCKS, hash.as_bytes())
            .is_some()
            || self
                .access
                .fetch(indexes::MICRO_BLOCKS, hash.as_bytes())
                .is_some()
            || self
                .access
                .fetch(indexes::EPOCH_BLOCKS, hash.as_bytes())
                .is_some()
    }

    /// Tip of a delegate's request chain.
    pub fn request_tip(&self, delegate: DelegateId) -> Tip {
        self.decode(indexes::REQUEST_TIPS, &[delegate.0])
            .unwrap_or_else(Tip::empty)
    }

    /// Tips of all request chains, indexed by delegate id.
    pub fn request_tips(&self) -> Vec<Tip> {
        (0..NUM_DELEGATES)
            .map(|i| self.request_tip(DelegateId(i as u8)))
            .collect()
    }

    /// Tip of the micro chain.
    pub fn micro_tip(&self) -> Tip {
        self.decode(indexes::MICRO_TIP, TIP_KEY)
            .unwrap_or_else(Tip::empty)
    }

    /// Tip of the epoch chain.
    pub fn epoch_tip(&self) -> Tip {
        self.decode(indexes::EPOCH_TIP, TIP_KEY)
            .unwrap_or_else(Tip::empty)
    }

    /// Reads a receive-chain entry.
    pub fn receive_record(&self, send_hash: &Hash, index: u16) -> Option<ReceiveRecord> {
        self.decode(
            indexes::RECEIVE_BLOCKS,
            &ReceiveRecord::key(send_hash, index),
        )
    }

    /// Reads a token's administrative record.
    pub fn token_account(&self, token_id: &Hash) -> Option<TokenAccount> {
        self.decode(indexes::TOKEN_ACCOUNTS, token_id.as_bytes())
    }

    /// Reads a user's status under a token.
    pub fn token_user_status(
        &self,
        token_id: &Hash,
        account: &AccountAddress,
    ) -> TokenUserStatus {
        self.decode(indexes::TOKEN_ACCOUNTS, &user_status_key(token_id, account))
            .unwrap_or_default()
    }

    /// Reads an account's reservation.
    pub fn reservation(&self, account: &AccountAddress) -> Option<ReservationInfo> {
        self.decode(indexes::RESERVATIONS, account.as_bytes())
    }

    /// The delegate committee serving in `epoch`, if already known.
    pub fn delegates(&self, epoch: Epoch) -> Option<Vec<DelegateInfo>> {
        let bytes = self
            .access
            .fetch(indexes::DELEGATE_KEYS, &epoch.to_le_bytes())?;
        let mut r = WireReader::new(&bytes);
        let mut delegates = Vec::with_capacity(NUM_DELEGATES);
        for _ in 0..NUM_DELEGATES {
            delegates.push(DelegateInfo::decode(&mut r).expect("corrupt delegate table"));
        }
        Some(delegates)
    }

    /// Fees accumulated since the last epoch block.
    pub fn fee_pool(&self) -> Amount {
        self.decode(indexes::META, FEE_POOL_KEY).unwrap_or_default()
    }

    /// Total supply of base units.
    pub fn total_supply(&self) -> Amount {
        self.decode(indexes::META, TOTAL_SUPPLY_KEY)
            .unwrap_or_default()
    }
}

impl<'a> LedgerSchema<&'a mut Fork> {
    /// The underlying fork, for writers layered on top of the schema.
    pub fn fork(&mut self) -> &mut Fork {
        self.access
    }

    /// Writes an account.
    pub fn put_account(&mut self, address: &AccountAddress, account: &Account) {
        self.access
            .put(indexes::ACCOUNTS, address.as_bytes().to_vec(), account.to_wire());
    }

    /// Writes a request block and advances the proposing delegate's tip.
    pub fn put_request_block(&mut self, hash: &Hash, block: &RequestBlock) {
        self.access
            .put(indexes::REQUEST_BLOCKS, hash.as_bytes().to_vec(), block.to_wire());
        let tip = Tip::new(block.epoch, block.sequence, *hash);
        self.access
            .put(indexes::REQUEST_TIPS, vec![block.primary.0], tip.to_wire());
    }

    /// Writes a micro block and advances the micro tip.
    pub fn put_micro_block(&mut self, hash: &Hash, block: &MicroBlock) {
        self.access
            .put(indexes::MICRO_BLOCKS, hash.as_bytes().to_vec(), block.to_wire());
        let tip = Tip::new(block.epoch, block.sequence, *hash);
        self.access
            .put(indexes::MICRO_TIP, TIP_KEY.to_vec(), tip.to_wire());
    }

    /// Writes an epoch block and advances the epoch tip.
    pub fn put_epoch_block(&mut self, hash: &Hash, block: &EpochBlock) {
        self.access
            .put(indexes::EPOCH_BLOCKS, hash.as_bytes().to_vec(), block.to_wire());
        let tip = Tip::new(block.epoch, block.epoch, *hash);
        self.access
            .put(indexes::EPOCH_TIP, TIP_KEY.to_vec(), tip.to_wire());
    }

    /// Writes a receive-chain entry.
    pub fn put_receive_record(&mut self, record: &ReceiveRecord) {
        self.access.put(
            indexes::RECEIVE_BLOCKS,
            ReceiveRecord::key(&record.send_hash, record.transaction_index),
            record.to_wire(),
        );
    }

    /// Writes a token's administrative record.
    pub fn put_token_account(&mut self, token_id: &Hash, token: &TokenAccount) {
        self.access
            .put(indexes::TOKEN_ACCOUNTS, token_id.as_bytes().to_vec(), token.to_wire());
    }

    /// Writes a user's status under a token.
    pub fn put_token_user_status(
        &mut self,
        token_id: &Hash,
        account: &AccountAddress,
        status: TokenUserStatus,
    ) {
        self.access.put(
            indexes::TOKEN_ACCOUNTS,
            user_status_key(token_id, account),
            status.to_wire(),
        );
    }

    /// Writes an account's reservation.
    pub fn put_reservation(&mut self, account: &AccountAddress, info: &ReservationInfo) {
        self.access
            .put(indexes::RESERVATIONS, account.as_bytes().to_vec(), info.to_wire());
    }

    /// Removes an account's reservation.
    pub fn remove_reservation(&mut self, account: &AccountAddress) {
        self.access
            .remove(indexes::RESERVATIONS, account.as_bytes().to_vec());
    }

    /// Writes the delegate committee serving in `epoch`.
    pub fn put_delegates(&mut self, epoch: Epoch, delegates: &[DelegateInfo]) {
        debug_assert_eq!(delegates.len(), NUM_DELEGATES);
        let mut buf = Vec::new();
        for delegate in delegates {
            delegate.encode(&mut buf);
        }
        self.access
            .put(indexes::DELEGATE_KEYS, epoch.to_le_bytes().to_vec(), buf);
    }

    /// Updates the accumulated fee pool.
    pub fn put_fee_pool(&mut self, amount: Amount) {
        self.access
            .put(indexes::META, FEE_POOL_KEY.to_vec(), amount.to_wire());
    }

    /// Updates the recorded total supply.
    pub fn put_total_supply(&mut self, amount: Amount) {
        self.access
            .put(indexes::META, TOTAL_SUPPLY_KEY.to_vec(), amount.to_wire());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith_storage::{Database, TemporaryDB};

    #[test]
    fn tips_default_to_empty() {
        let db = TemporaryDB::new();
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(schema.request_tip(DelegateId(5)), Tip::empty());
        assert_eq!(schema.micro_tip(), Tip::empty());
        assert_eq!(schema.request_tips().len(), NUM_DELEGATES);
    }

    #[test]
    fn account_write_is_visible_after_merge() {
        let db = TemporaryDB::new();
        let address = AccountAddress([1; 32]);

        let mut fork = db.fork();
        let mut schema = LedgerSchema::new(&mut fork);
        schema.put_account(&address, &Account::open(Amount(10), 0));
        db.merge(fork.into_patch()).unwrap();

        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(schema.account(&address).unwrap().balance, Amount(10));
        assert_eq!(schema.account(&AccountAddress([2; 32])), None);
    }

    #[test]
    fn request_block_write_advances_tip() {
        use crate::blocks::RequestBlock;
        use trilith_crypto::ObjectHash;

        let db = TemporaryDB::new();
        let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(3), vec![]);
        let hash = block.object_hash();

        let mut fork = db.fork();
        let mut schema = LedgerSchema::new(&mut fork);
        schema.put_request_block(&hash, &block);
        db.merge(fork.into_patch()).unwrap();

        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(schema.request_tip(DelegateId(3)), Tip::new(1, 0, hash));
        assert_eq!(schema.request_tip(DelegateId(4)), Tip::empty());
        assert!(schema.contains_block(&hash));
    }
}
