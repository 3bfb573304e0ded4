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

//! Account state records.

use serde_derive::{Deserialize, Serialize};

use crate::{
    types::{AccountAddress, Amount, Epoch},
    wire::{write_u16, write_u32, WireDecode, WireEncode, WireError, WireReader},
};
use trilith_crypto::Hash;

/// Persistent state of one account.
///
/// `head` names the account's latest committed send (its nonce substitute:
/// a new request must reference it as `previous`). `receive_head` is the
/// head of the account's receive chain, linking every credit the account
/// ever received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Spendable balance in base units.
    pub balance: Amount,
    /// Digest of the latest committed request sent by this account.
    pub head: Hash,
    /// Head of the account's receive chain.
    pub receive_head: Hash,
    /// Number of committed requests sent by this account.
    pub block_count: u32,
    /// Number of entries in the receive chain.
    pub receive_count: u32,
    /// The delegate account this account delegates its vote to.
    pub representative: AccountAddress,
    /// Epoch in which the account was opened.
    pub open_epoch: Epoch,
    /// Per-token balances of this account.
    pub tokens: Vec<TokenEntry>,
}

impl Account {
    /// Creates an account opened in `epoch` with the given balance.
    pub fn open(balance: Amount, epoch: Epoch) -> Self {
        Self {
            balance,
            head: Hash::zero(),
            receive_head: Hash::zero(),
            block_count: 0,
            receive_count: 0,
            representative: AccountAddress::zero(),
            open_epoch: epoch,
            tokens: Vec::new(),
        }
    }

    /// Finds the entry for a token, if the account holds any.
    pub fn token_entry(&self, token_id: &Hash) -> Option<&TokenEntry> {
        self.tokens.iter().find(|entry| entry.token_id == *token_id)
    }

    /// Returns the mutable entry for a token, creating a zero-balance one.
    pub fn token_entry_mut(&mut self, token_id: &Hash) -> &mut TokenEntry {
        if let Some(i) = self
            .tokens
            .iter()
            .position(|entry| entry.token_id == *token_id)
        {
            return &mut self.tokens[i];
        }
        self.tokens.push(TokenEntry {
            token_id: *token_id,
            balance: Amount::ZERO,
        });
        self.tokens.last_mut().expect("just pushed")
    }
}

impl WireEncode for Account {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.balance.encode(buf);
        self.head.encode(buf);
        self.receive_head.encode(buf);
        write_u32(buf, self.block_count);
        write_u32(buf, self.receive_count);
        self.representative.encode(buf);
        write_u32(buf, self.open_epoch);
        write_u16(buf, self.tokens.len() as u16);
        for entry in &self.tokens {
            entry.encode(buf);
        }
    }
}

impl WireDecode for Account {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let balance = Amount::decode(r)?;
        let head = Hash::decode(r)?;
        let receive_head = Hash::decode(r)?;
        let block_count = r.read_u32()?;
        let receive_count = r.read_u32()?;
        let representative = AccountAddress::decode(r)?;
        let open_epoch = r.read_u32()?;
        let token_count = r.read_u16()? as usize;
        let mut tokens = Vec::with_capacity(token_count);
        for _ in 0..token_count {
            tokens.push(TokenEntry::decode(r)?);
        }
        Ok(Self {
            balance,
            head,
            receive_head,
            block_count,
            receive_count,
            representative,
            open_epoch,
            tokens,
        })
    }
}

/// Balance of one token held by an account.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    /// The token.
    pub token_id: Hash,
    /// Units held.
    pub balance: Amount,
}

impl WireEncode for TokenEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.token_id.encode(buf);
        self.balance.encode(buf);
    }
}

impl WireDecode for TokenEntry {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            token_id: Hash::decode(r)?,
            balance: Amount::decode(r)?,
        })
    }
}

/// One credit in an account's receive chain: the receive half of a send
/// transaction, keyed by `(send_hash, transaction_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveRecord {
    /// Digest of the send request this credit belongs to.
    pub send_hash: Hash,
    /// Index of the transaction within the send.
    pub transaction_index: u16,
    /// The sending account.
    pub source: AccountAddress,
    /// The credited amount.
    pub amount: Amount,
    /// Previous entry of the destination's receive chain.
    pub previous: Hash,
}

impl ReceiveRecord {
    /// Storage key of this record.
    pub fn key(send_hash: &Hash, transaction_index: u16) -> Vec<u8> {
        let mut key = Vec::with_capacity(34);
        key.extend_from_slice(send_hash.as_bytes());
        key.extend_from_slice(&transaction_index.to_le_bytes());
        key
    }

    /// Digest identifying this record in the receive chain.
    pub fn digest(&self) -> Hash {
        trilith_crypto::hash(&Self::key(&self.send_hash, self.transaction_index))
    }
}

impl WireEncode for ReceiveRecord {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.send_hash.encode(buf);
        write_u16(buf, self.transaction_index);
        self.source.encode(buf);
        self.amount.encode(buf);
        self.previous.encode(buf);
    }
}

impl WireDecode for ReceiveRecord {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            send_hash: Hash::decode(r)?,
            transaction_index: r.read_u16()?,
            source: AccountAddress::decode(r)?,
            amount: Amount::decode(r)?,
            previous: Hash::decode(r)?,
        })
    }
}

/// The reservation entry of an account: at most one in-flight request per
/// account, held for `RESERVATION_PERIOD` epochs unless committed earlier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReservationInfo {
    /// Digest of the reserved request.
    pub hash: Hash,
    /// Epoch the reservation was taken in.
    pub epoch: Epoch,
}

impl WireEncode for ReservationInfo {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.hash.encode(buf);
        write_u32(buf, self.epoch);
    }
}

impl WireDecode for ReservationInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            hash: Hash::decode(r)?,
            epoch: r.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn account_roundtrip() {
        let mut account = Account::open(Amount(100), 2);
        account.head = trilith_crypto::hash(b"head");
        account.block_count = 3;
        account.token_entry_mut(&trilith_crypto::hash(b"token")).balance = Amount(7);

        let restored = Account::from_wire(&account.to_wire()).unwrap();
        assert_eq!(restored, account);
    }

    #[test]
    fn token_entries_are_created_on_demand() {
        let mut account = Account::open(Amount::ZERO, 0);
        let token = trilith_crypto::hash(b"token");
        assert!(account.token_entry(&token).is_none());
        account.token_entry_mut(&token).balance = Amount(5);
        assert_eq!(account.token_entry(&token).unwrap().balance, Amount(5));
        assert_eq!(account.tokens.len(), 1);
    }

    #[test]
    fn receive_record_roundtrip() {
        let record = ReceiveRecord {
            send_hash: trilith_crypto::hash(b"send"),
            transaction_index: 2,
            source: AccountAddress([1; 32]),
            amount: Amount(55),
            previous: Hash::zero(),
        };
        let restored = ReceiveRecord::from_wire(&record.to_wire()).unwrap();
        assert_eq!(restored, record);
    }
}
