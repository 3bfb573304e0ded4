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

//! The three block types of the ledger.
//!
//! A block's digest covers its header and content but not the aggregated
//! signatures: the digest is fixed when the primary broadcasts the proposal,
//! and the PostPrepare/PostCommit aggregates are attached as consensus
//! progresses.

use bit_vec::BitVec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};

use std::fmt;

use crate::{
    constants::{BATCH_SIZE, NUM_DELEGATES},
    requests::Request,
    tip::Tip,
    types::{AccountAddress, Amount, ChainKind, DelegateId, Epoch, Sequence},
    wire::{write_u16, write_u32, write_u64, WireDecode, WireEncode, WireError, WireReader},
};
use trilith_crypto::{
    bls::{BlsPublicKey, BlsSignature},
    hash, Hash, ObjectHash,
};

/// Bitmap over the delegate committee selecting which delegates contributed
/// partial signatures to an aggregate.
#[derive(Clone, PartialEq, Eq)]
pub struct ParticipationMap(BitVec);

impl ParticipationMap {
    /// An empty bitmap.
    pub fn new() -> Self {
        Self(BitVec::from_elem(NUM_DELEGATES, false))
    }

    /// Marks a delegate as participating.
    pub fn set(&mut self, id: DelegateId) {
        self.0.set(id.index(), true);
    }

    /// Returns `true` if the delegate participated.
    pub fn contains(&self, id: DelegateId) -> bool {
        self.0.get(id.index()).unwrap_or(false)
    }

    /// Number of participating delegates.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|bit| *bit).count()
    }

    /// Participating delegate ids, in ascending order.
    pub fn ids(&self) -> Vec<DelegateId> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, bit)| *bit)
            .map(|(i, _)| DelegateId(i as u8))
            .collect()
    }

    /// Packs the bitmap into its 32-bit wire form.
    pub fn to_bits(&self) -> u32 {
        let mut bits = 0;
        for id in self.ids() {
            bits |= 1 << u32::from(id.0);
        }
        bits
    }

    /// Restores a bitmap from its 32-bit wire form.
    pub fn from_bits(bits: u32) -> Self {
        let mut map = Self::new();
        for i in 0..NUM_DELEGATES {
            if bits & (1 << i as u32) != 0 {
                map.set(DelegateId(i as u8));
            }
        }
        map
    }
}

impl Default for ParticipationMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ParticipationMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParticipationMap({:#010x})", self.to_bits())
    }
}

impl WireEncode for ParticipationMap {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.to_bits());
    }
}

impl WireDecode for ParticipationMap {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self::from_bits(r.read_u32()?))
    }
}

impl Serialize for ParticipationMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.to_bits())
    }
}

impl<'de> Deserialize<'de> for ParticipationMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits)
    }
}

/// An aggregated BLS signature together with the bitmap naming the
/// delegates whose partials were aggregated.
#[derive(Debug, Clone, PartialEq, Default, DeriveSerialize, DeriveDeserialize)]
pub struct AggSignature {
    /// Which delegates contributed.
    pub map: ParticipationMap,
    /// The aggregated 96-byte point.
    pub signature: BlsSignature,
}

impl AggSignature {
    /// The unsigned placeholder carried by a proposal before consensus.
    pub fn placeholder() -> Self {
        Self::default()
    }
}

impl WireEncode for AggSignature {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.map.encode(buf);
        self.signature.encode(buf);
    }
}

impl WireDecode for AggSignature {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            map: ParticipationMap::decode(r)?,
            signature: BlsSignature::decode(r)?,
        })
    }
}

/// A batch of user requests proposed by one delegate.
///
/// Every delegate owns one request chain per epoch; blocks are totally
/// ordered by `sequence`, which resets to zero at each epoch boundary.
#[derive(Debug, Clone, PartialEq, DeriveSerialize, DeriveDeserialize)]
pub struct RequestBlock {
    /// Digest of the previous block of this delegate's chain in this epoch;
    /// zero at sequence 0.
    pub previous: Hash,
    /// Epoch the block belongs to.
    pub epoch: Epoch,
    /// Position within the delegate's chain.
    pub sequence: Sequence,
    /// Proposal time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The proposing delegate.
    pub primary: DelegateId,
    /// Batched requests, in admission order.
    pub requests: Vec<Request>,
    /// Aggregate attached after the Prepare round.
    pub post_prepare: AggSignature,
    /// Aggregate attached after the Commit round.
    pub post_commit: AggSignature,
}

impl RequestBlock {
    /// Creates a block with placeholder aggregates.
    pub fn new(
        previous: Hash,
        epoch: Epoch,
        sequence: Sequence,
        timestamp: u64,
        primary: DelegateId,
        requests: Vec<Request>,
    ) -> Self {
        debug_assert!(requests.len() <= BATCH_SIZE);
        Self {
            previous,
            epoch,
            sequence,
            timestamp,
            primary,
            requests,
            post_prepare: AggSignature::placeholder(),
            post_commit: AggSignature::placeholder(),
        }
    }

    fn encode_header(&self, buf: &mut Vec<u8>) {
        buf.push(ChainKind::Request.code());
        self.previous.encode(buf);
        write_u32(buf, self.epoch);
        write_u32(buf, self.sequence);
        write_u64(buf, self.timestamp);
        buf.push(self.primary.0);
    }
}

impl ObjectHash for RequestBlock {
    fn object_hash(&self) -> Hash {
        let mut buf = Vec::new();
        self.encode_header(&mut buf);
        write_u16(&mut buf, self.requests.len() as u16);
        for request in &self.requests {
            request.object_hash().encode(&mut buf);
        }
        hash(&buf)
    }
}

impl WireEncode for RequestBlock {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.previous.encode(buf);
        write_u32(buf, self.epoch);
        write_u32(buf, self.sequence);
        write_u64(buf, self.timestamp);
        buf.push(self.primary.0);
        write_u16(buf, self.requests.len() as u16);
        for request in &self.requests {
            request.encode(buf);
        }
        self.post_prepare.encode(buf);
        self.post_commit.encode(buf);
    }
}

impl WireDecode for RequestBlock {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let previous = Hash::decode(r)?;
        let epoch = r.read_u32()?;
        let sequence = r.read_u32()?;
        let timestamp = r.read_u64()?;
        let primary = DelegateId(r.read_u8()?);
        let count = r.read_u16()? as usize;
        if count > BATCH_SIZE {
            return Err(WireError::Malformed("request count"));
        }
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(Request::decode(r)?);
        }
        Ok(Self {
            previous,
            epoch,
            sequence,
            timestamp,
            primary,
            requests,
            post_prepare: AggSignature::decode(r)?,
            post_commit: AggSignature::decode(r)?,
        })
    }
}

/// A cut of all request chains, pinning them into a total order.
#[derive(Debug, Clone, PartialEq, DeriveSerialize, DeriveDeserialize)]
pub struct MicroBlock {
    /// Digest of the previous micro block.
    pub previous: Hash,
    /// Epoch the block belongs to.
    pub epoch: Epoch,
    /// Position within the epoch's micro chain.
    pub sequence: Sequence,
    /// Cut time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The proposing delegate.
    pub primary: DelegateId,
    /// `true` on the final micro block of the epoch.
    pub last_micro: bool,
    /// Request-chain tip of every delegate at cut time.
    pub tips: Vec<Tip>,
    /// Aggregate attached after the Prepare round.
    pub post_prepare: AggSignature,
    /// Aggregate attached after the Commit round.
    pub post_commit: AggSignature,
}

impl MicroBlock {
    /// Creates a micro block with placeholder aggregates.
    pub fn new(
        previous: Hash,
        epoch: Epoch,
        sequence: Sequence,
        timestamp: u64,
        primary: DelegateId,
        last_micro: bool,
        tips: Vec<Tip>,
    ) -> Self {
        debug_assert_eq!(tips.len(), NUM_DELEGATES);
        Self {
            previous,
            epoch,
            sequence,
            timestamp,
            primary,
            last_micro,
            tips,
            post_prepare: AggSignature::placeholder(),
            post_commit: AggSignature::placeholder(),
        }
    }

    fn encode_content(&self, buf: &mut Vec<u8>) {
        self.previous.encode(buf);
        write_u32(buf, self.epoch);
        write_u32(buf, self.sequence);
        write_u64(buf, self.timestamp);
        buf.push(self.primary.0);
        buf.push(self.last_micro as u8);
        for tip in &self.tips {
            tip.encode(buf);
        }
    }
}

impl ObjectHash for MicroBlock {
    fn object_hash(&self) -> Hash {
        let mut buf = vec![ChainKind::Micro.code()];
        self.encode_content(&mut buf);
        hash(&buf)
    }
}

impl WireEncode for MicroBlock {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_content(buf);
        self.post_prepare.encode(buf);
        self.post_commit.encode(buf);
    }
}

impl WireDecode for MicroBlock {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let previous = Hash::decode(r)?;
        let epoch = r.read_u32()?;
        let sequence = r.read_u32()?;
        let timestamp = r.read_u64()?;
        let primary = DelegateId(r.read_u8()?);
        let last_micro = r.read_bool()?;
        let mut tips = Vec::with_capacity(NUM_DELEGATES);
        for _ in 0..NUM_DELEGATES {
            tips.push(Tip::decode(r)?);
        }
        Ok(Self {
            previous,
            epoch,
            sequence,
            timestamp,
            primary,
            last_micro,
            tips,
            post_prepare: AggSignature::decode(r)?,
            post_commit: AggSignature::decode(r)?,
        })
    }
}

/// A delegate of an elected committee.
#[derive(Debug, Clone, PartialEq, DeriveSerialize, DeriveDeserialize)]
pub struct DelegateInfo {
    /// The delegate's account.
    pub account: AccountAddress,
    /// BLS key the delegate signs consensus messages with.
    pub bls_key: BlsPublicKey,
    /// Voting weight within the committee.
    pub vote_weight: Amount,
    /// Stake backing the delegate.
    pub stake: Amount,
}

impl WireEncode for DelegateInfo {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.account.encode(buf);
        self.bls_key.encode(buf);
        self.vote_weight.encode(buf);
        self.stake.encode(buf);
    }
}

impl WireDecode for DelegateInfo {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            account: AccountAddress::decode(r)?,
            bls_key: BlsPublicKey::decode(r)?,
            vote_weight: Amount::decode(r)?,
            stake: Amount::decode(r)?,
        })
    }
}

/// The block closing an epoch: carries the micro tip that seals the epoch
/// and the delegate set elected for a future epoch.
#[derive(Debug, Clone, PartialEq, DeriveSerialize, DeriveDeserialize)]
pub struct EpochBlock {
    /// Digest of the previous epoch block.
    pub previous: Hash,
    /// The epoch this block closes.
    pub epoch: Epoch,
    /// Proposal time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The proposing delegate.
    pub primary: DelegateId,
    /// Tip of the micro chain that closes the epoch.
    pub micro_tip: Tip,
    /// The elected delegate committee.
    pub delegates: Vec<DelegateInfo>,
    /// Fees collected over the epoch.
    pub fee_pool: Amount,
    /// Total supply of base units.
    pub total_supply: Amount,
    /// Aggregate attached after the Prepare round.
    pub post_prepare: AggSignature,
    /// Aggregate attached after the Commit round.
    pub post_commit: AggSignature,
}

impl EpochBlock {
    /// Creates an epoch block with placeholder aggregates.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        previous: Hash,
        epoch: Epoch,
        timestamp: u64,
        primary: DelegateId,
        micro_tip: Tip,
        delegates: Vec<DelegateInfo>,
        fee_pool: Amount,
        total_supply: Amount,
    ) -> Self {
        debug_assert_eq!(delegates.len(), NUM_DELEGATES);
        Self {
            previous,
            epoch,
            timestamp,
            primary,
            micro_tip,
            delegates,
            fee_pool,
            total_supply,
            post_prepare: AggSignature::placeholder(),
            post_commit: AggSignature::placeholder(),
        }
    }

    /// Sum of all delegates' voting weight; the basis of the quorum rule.
    pub fn total_vote_weight(&self) -> Amount {
        self.delegates
            .iter()
            .fold(Amount::ZERO, |acc, delegate| acc + delegate.vote_weight)
    }

    fn encode_content(&self, buf: &mut Vec<u8>) {
        self.previous.encode(buf);
        write_u32(buf, self.epoch);
        write_u64(buf, self.timestamp);
        buf.push(self.primary.0);
        self.micro_tip.encode(buf);
        for delegate in &self.delegates {
            delegate.encode(buf);
        }
        self.fee_pool.encode(buf);
        self.total_supply.encode(buf);
    }
}

impl ObjectHash for EpochBlock {
    fn object_hash(&self) -> Hash {
        let mut buf = vec![ChainKind::Epoch.code()];
        self.encode_content(&mut buf);
        hash(&buf)
    }
}

impl WireEncode for EpochBlock {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_content(buf);
        self.post_prepare.encode(buf);
        self.post_commit.encode(buf);
    }
}

impl WireDecode for EpochBlock {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let previous = Hash::decode(r)?;
        let epoch = r.read_u32()?;
        let timestamp = r.read_u64()?;
        let primary = DelegateId(r.read_u8()?);
        let micro_tip = Tip::decode(r)?;
        let mut delegates = Vec::with_capacity(NUM_DELEGATES);
        for _ in 0..NUM_DELEGATES {
            delegates.push(DelegateInfo::decode(r)?);
        }
        Ok(Self {
            previous,
            epoch,
            timestamp,
            primary,
            micro_tip,
            delegates,
            fee_pool: Amount::decode(r)?,
            total_supply: Amount::decode(r)?,
            post_prepare: AggSignature::decode(r)?,
            post_commit: AggSignature::decode(r)?,
        })
    }
}

/// A block of any chain kind.
#[derive(Debug, Clone, PartialEq, DeriveSerialize, DeriveDeserialize)]
#[serde(tag = "chain", rename_all = "snake_case")]
pub enum Block {
    /// A request block.
    Request(RequestBlock),
    /// A micro block.
    Micro(MicroBlock),
    /// An epoch block.
    Epoch(EpochBlock),
}

impl Block {
    /// Chain kind of the block.
    pub fn kind(&self) -> ChainKind {
        match self {
            Self::Request(_) => ChainKind::Request,
            Self::Micro(_) => ChainKind::Micro,
            Self::Epoch(_) => ChainKind::Epoch,
        }
    }

    /// Epoch the block belongs to.
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Request(block) => block.epoch,
            Self::Micro(block) => block.epoch,
            Self::Epoch(block) => block.epoch,
        }
    }

    /// The block's `previous` reference.
    pub fn previous(&self) -> Hash {
        match self {
            Self::Request(block) => block.previous,
            Self::Micro(block) => block.previous,
            Self::Epoch(block) => block.previous,
        }
    }
}

impl ObjectHash for Block {
    fn object_hash(&self) -> Hash {
        match self {
            Self::Request(block) => block.object_hash(),
            Self::Micro(block) => block.object_hash(),
            Self::Epoch(block) => block.object_hash(),
        }
    }
}

impl WireEncode for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind().code());
        match self {
            Self::Request(block) => block.encode(buf),
            Self::Micro(block) => block.encode(buf),
            Self::Epoch(block) => block.encode(buf),
        }
    }
}

impl WireDecode for Block {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let kind = ChainKind::from_code(r.read_u8()?).ok_or(WireError::Malformed("chain kind"))?;
        Ok(match kind {
            ChainKind::Request => Self::Request(RequestBlock::decode(r)?),
            ChainKind::Micro => Self::Micro(MicroBlock::decode(r)?),
            ChainKind::Epoch => Self::Epoch(EpochBlock::decode(r)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::Transaction;
    use pretty_assertions::assert_eq;
    use trilith_crypto::{account::AccountKeyPair, bls::BlsKeyPair};

    fn sample_request_block() -> RequestBlock {
        let keys = AccountKeyPair::from_seed(&[5; 32]);
        let mut request = Request::send(
            AccountAddress(keys.address()),
            Hash::zero(),
            Amount(crate::constants::MIN_TRANSACTION_FEE),
            vec![Transaction::new(AccountAddress([9; 32]), Amount(1))],
        );
        request.sign(&keys);
        RequestBlock::new(Hash::zero(), 3, 0, 1_000, DelegateId(4), vec![request])
    }

    fn sample_micro_block() -> MicroBlock {
        let tips = (0..NUM_DELEGATES)
            .map(|i| Tip::new(3, i as u32, hash(&[i as u8])))
            .collect();
        MicroBlock::new(hash(b"prev"), 3, 7, 2_000, DelegateId(1), false, tips)
    }

    fn sample_epoch_block() -> EpochBlock {
        let delegates = (0..NUM_DELEGATES)
            .map(|i| DelegateInfo {
                account: AccountAddress([i as u8 + 1; 32]),
                bls_key: BlsKeyPair::from_seed(&[i as u8 + 8; 32]).public_key(),
                vote_weight: Amount(1),
                stake: Amount(100),
            })
            .collect();
        EpochBlock::new(
            hash(b"prev epoch"),
            3,
            3_000,
            DelegateId(2),
            Tip::new(3, 71, hash(b"last micro")),
            delegates,
            Amount(5),
            Amount(1_000_000),
        )
    }

    #[test]
    fn participation_map_bits() {
        let mut map = ParticipationMap::new();
        map.set(DelegateId(0));
        map.set(DelegateId(21));
        map.set(DelegateId(31));

        assert!(map.contains(DelegateId(21)));
        assert!(!map.contains(DelegateId(1)));
        assert_eq!(map.count(), 3);
        assert_eq!(ParticipationMap::from_bits(map.to_bits()), map);
        assert_eq!(
            map.ids(),
            vec![DelegateId(0), DelegateId(21), DelegateId(31)]
        );
    }

    #[test]
    fn digest_ignores_aggregates() {
        let mut block = sample_request_block();
        let digest = block.object_hash();
        block.post_commit.map.set(DelegateId(7));
        block.post_commit.signature = BlsSignature::from_raw([1; 96]);
        assert_eq!(block.object_hash(), digest);

        block.sequence += 1;
        assert_ne!(block.object_hash(), digest);
    }

    #[test]
    fn request_block_wire_roundtrip() {
        let block = sample_request_block();
        let restored = RequestBlock::from_wire(&block.to_wire()).unwrap();
        assert_eq!(restored, block);
        assert_eq!(restored.object_hash(), block.object_hash());
    }

    #[test]
    fn micro_block_wire_roundtrip() {
        let block = sample_micro_block();
        let restored = MicroBlock::from_wire(&block.to_wire()).unwrap();
        assert_eq!(restored, block);
    }

    #[test]
    fn epoch_block_wire_roundtrip() {
        let block = sample_epoch_block();
        let restored = EpochBlock::from_wire(&block.to_wire()).unwrap();
        assert_eq!(restored, block);
        assert_eq!(block.total_vote_weight(), Amount(NUM_DELEGATES as u128));
    }

    #[test]
    fn block_enum_wire_roundtrip() {
        for block in vec![
            Block::Request(sample_request_block()),
            Block::Micro(sample_micro_block()),
            Block::Epoch(sample_epoch_block()),
        ] {
            let restored = Block::from_wire(&block.to_wire()).unwrap();
            assert_eq!(restored, block);
        }
    }
}
