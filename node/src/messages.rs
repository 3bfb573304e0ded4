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

//! Messages exchanged between delegates.
//!
//! Every message is framed by an 8-byte [`MessageHeader`]:
//! `{ version: u8, message_type: u8, consensus_type: u8, reserved: u8,
//! payload_size: u32 LE }`. Consensus messages carry the chain kind in
//! `consensus_type`; every other message sets it to [`NO_CONSENSUS`].
//!
//! Prepare and Commit partials do not sign the raw proposal digest but a
//! *phase-tagged* digest (`blake2b(kind ‖ phase ‖ digest)`), so a partial
//! collected in one phase cannot be replayed in another.

use bit_vec::BitVec;

use std::fmt;

use trilith::{
    blocks::{AggSignature, Block},
    constants::{NUM_DELEGATES, WIRE_VERSION},
    persistence::{RejectionReason, ValidationRejection},
    tip::Tip,
    types::{ChainKind, DelegateId, Epoch},
    wire::{write_u16, write_u32, WireDecode, WireEncode, WireError, WireReader},
};
use trilith_crypto::{bls::BlsPublicKey, bls::BlsSignature, Hash, HashStream};

/// Size of the framing header.
pub const HEADER_SIZE: usize = 8;

/// `consensus_type` value of messages outside any consensus chain.
pub const NO_CONSENSUS: u8 = 0xFF;

/// Wire codes of the message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A proposal broadcast by the primary.
    PrePrepare = 0,
    /// A backup's partial signature over the proposal.
    Prepare = 1,
    /// The primary's aggregate of the Prepare partials.
    PostPrepare = 2,
    /// A backup's partial over the PostPrepare round.
    Commit = 3,
    /// The primary's aggregate of the Commit partials.
    PostCommit = 4,
    /// Advertisement of a delegate's BLS key for an epoch.
    KeyAdvert = 5,
    /// Keep-alive on an idle channel.
    HeartBeat = 6,
    /// A backup's refusal to vote for a proposal.
    Rejection = 7,
    /// Request for a block by digest.
    PullRequest = 8,
    /// Answer to a pull request.
    PullResponse = 9,
    /// Request for the peer's chain tips.
    TipRequest = 10,
    /// All chain tips of the answering peer.
    TipResponse = 11,
    /// A transaction submitted through the admission channel.
    TxAcceptor = 12,
    /// The connection handshake.
    ConnectedClientIds = 13,
}

impl MessageType {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::PrePrepare,
            1 => Self::Prepare,
            2 => Self::PostPrepare,
            3 => Self::Commit,
            4 => Self::PostCommit,
            5 => Self::KeyAdvert,
            6 => Self::HeartBeat,
            7 => Self::Rejection,
            8 => Self::PullRequest,
            9 => Self::PullResponse,
            10 => Self::TipRequest,
            11 => Self::TipResponse,
            12 => Self::TxAcceptor,
            13 => Self::ConnectedClientIds,
            _ => return None,
        })
    }
}

/// The 8-byte framing prequel of every message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MessageHeader {
    /// Wire-format version.
    pub version: u8,
    /// Message type code.
    pub message_type: u8,
    /// Chain kind code, or [`NO_CONSENSUS`].
    pub consensus_type: u8,
    /// Reserved; always zero.
    pub reserved: u8,
    /// Length of the payload that follows.
    pub payload_size: u32,
}

impl MessageHeader {
    /// Creates a header for a payload of the given size.
    pub fn new(message_type: MessageType, consensus_type: u8, payload_size: u32) -> Self {
        Self {
            version: WIRE_VERSION,
            message_type: message_type as u8,
            consensus_type,
            reserved: 0,
            payload_size,
        }
    }
}

impl WireEncode for MessageHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.push(self.message_type);
        buf.push(self.consensus_type);
        buf.push(self.reserved);
        write_u32(buf, self.payload_size);
    }
}

impl WireDecode for MessageHeader {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            version: r.read_u8()?,
            message_type: r.read_u8()?,
            consensus_type: r.read_u8()?,
            reserved: r.read_u8()?,
            payload_size: r.read_u32()?,
        })
    }
}

/// The handshake sent by each side right after connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedClientIds {
    /// Epoch the connection belongs to.
    pub epoch: Epoch,
    /// The sender's delegate id in that epoch.
    pub delegate_id: DelegateId,
    /// Connection kind code (see the epoch-transition connection model).
    pub connection_kind: u8,
    /// The sender's advertised address.
    pub ip: String,
}

impl WireEncode for ConnectedClientIds {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.epoch);
        buf.push(self.delegate_id.0);
        buf.push(self.connection_kind);
        trilith::wire::write_short_string(buf, &self.ip);
    }
}

impl WireDecode for ConnectedClientIds {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            epoch: r.read_u32()?,
            delegate_id: DelegateId(r.read_u8()?),
            connection_kind: r.read_u8()?,
            ip: trilith::wire::read_short_string(r)?,
        })
    }
}

/// A backup's refusal to vote for a proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectionMessage {
    /// Chain the proposal belongs to.
    pub kind: ChainKind,
    /// Digest of the rejected proposal.
    pub preprepare: Hash,
    /// The rejecting delegate.
    pub delegate: DelegateId,
    /// Why the proposal was rejected.
    pub reason: RejectionReason,
    /// For `ContainsInvalidRequest`: which requests are at fault.
    pub rejection_map: BitVec,
    /// The delegate's signature over the rejection digest.
    pub signature: BlsSignature,
}

impl RejectionMessage {
    /// Builds an unsigned rejection from a validation verdict.
    pub fn from_rejection(
        kind: ChainKind,
        preprepare: Hash,
        delegate: DelegateId,
        rejection: ValidationRejection,
    ) -> Self {
        Self {
            kind,
            preprepare,
            delegate,
            reason: rejection.reason,
            rejection_map: rejection.invalid_requests,
            signature: BlsSignature::empty(),
        }
    }

    /// The digest a rejection is signed over.
    pub fn signing_digest(&self) -> Hash {
        let mut map_bytes = self.rejection_map.to_bytes();
        let mut prefix = vec![
            self.kind.code(),
            MessageType::Rejection as u8,
            self.reason.code(),
        ];
        prefix.append(&mut map_bytes);
        HashStream::new()
            .update(&prefix)
            .update(self.preprepare.as_ref())
            .finalize()
    }
}

/// Any message exchanged between delegates.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum PeerMessage {
    /// A proposal; the first phase of consensus.
    PrePrepare {
        /// The proposed block, aggregates still blank.
        block: Block,
    },
    /// A backup's partial signature over the proposal.
    Prepare {
        /// Chain the proposal belongs to.
        kind: ChainKind,
        /// Digest of the proposal.
        preprepare: Hash,
        /// The voting delegate.
        delegate: DelegateId,
        /// Partial over the Prepare phase digest.
        signature: BlsSignature,
    },
    /// The primary's aggregate of a quorum of Prepare partials.
    PostPrepare {
        /// Chain the proposal belongs to.
        kind: ChainKind,
        /// Digest of the proposal.
        preprepare: Hash,
        /// Aggregate and participation bitmap.
        aggregate: AggSignature,
    },
    /// A backup's partial over the Commit phase.
    Commit {
        /// Chain the proposal belongs to.
        kind: ChainKind,
        /// Digest of the proposal.
        preprepare: Hash,
        /// The voting delegate.
        delegate: DelegateId,
        /// Partial over the Commit phase digest.
        signature: BlsSignature,
    },
    /// The primary's aggregate of a quorum of Commit partials.
    PostCommit {
        /// Chain the proposal belongs to.
        kind: ChainKind,
        /// Digest of the proposal.
        preprepare: Hash,
        /// Aggregate and participation bitmap.
        aggregate: AggSignature,
    },
    /// Advertisement of a delegate's BLS key for an epoch.
    KeyAdvert {
        /// Epoch the key serves in.
        epoch: Epoch,
        /// The advertising delegate.
        delegate: DelegateId,
        /// The BLS public key.
        key: BlsPublicKey,
    },
    /// Keep-alive.
    HeartBeat,
    /// A backup's refusal to vote.
    Rejection(RejectionMessage),
    /// Request for a block by digest.
    PullRequest {
        /// The wanted block.
        hash: Hash,
    },
    /// Answer to a pull request; `None` if the block is unknown.
    PullResponse {
        /// The block, if known.
        block: Option<Block>,
    },
    /// Request for the peer's chain tips.
    TipRequest,
    /// All chain tips of the answering peer.
    TipResponse {
        /// Request-chain tip of every delegate.
        request_tips: Vec<Tip>,
        /// The micro-chain tip.
        micro_tip: Tip,
        /// The epoch-chain tip.
        epoch_tip: Tip,
    },
    /// The connection handshake.
    ConnectedClientIds(ConnectedClientIds),
}

impl PeerMessage {
    /// The message's type code.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::PrePrepare { .. } => MessageType::PrePrepare,
            Self::Prepare { .. } => MessageType::Prepare,
            Self::PostPrepare { .. } => MessageType::PostPrepare,
            Self::Commit { .. } => MessageType::Commit,
            Self::PostCommit { .. } => MessageType::PostCommit,
            Self::KeyAdvert { .. } => MessageType::KeyAdvert,
            Self::HeartBeat => MessageType::HeartBeat,
            Self::Rejection(_) => MessageType::Rejection,
            Self::PullRequest { .. } => MessageType::PullRequest,
            Self::PullResponse { .. } => MessageType::PullResponse,
            Self::TipRequest => MessageType::TipRequest,
            Self::TipResponse { .. } => MessageType::TipResponse,
            Self::ConnectedClientIds(_) => MessageType::ConnectedClientIds,
        }
    }

    /// The chain kind of a consensus message.
    pub fn consensus_kind(&self) -> Option<ChainKind> {
        match self {
            Self::PrePrepare { block } => Some(block.kind()),
            Self::Prepare { kind, .. }
            | Self::PostPrepare { kind, .. }
            | Self::Commit { kind, .. }
            | Self::PostCommit { kind, .. } => Some(*kind),
            Self::Rejection(rejection) => Some(rejection.kind),
            _ => None,
        }
    }

    /// Frames the message: header plus payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);
        let consensus_type = self
            .consensus_kind()
            .map(ChainKind::code)
            .unwrap_or(NO_CONSENSUS);
        let header = MessageHeader::new(self.message_type(), consensus_type, payload.len() as u32);
        let mut frame = header.to_wire();
        frame.append(&mut payload);
        frame
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Self::PrePrepare { block } => block.encode(buf),
            Self::Prepare {
                preprepare,
                delegate,
                signature,
                ..
            }
            | Self::Commit {
                preprepare,
                delegate,
                signature,
                ..
            } => {
                preprepare.encode(buf);
                buf.push(delegate.0);
                signature.encode(buf);
            }
            Self::PostPrepare {
                preprepare,
                aggregate,
                ..
            }
            | Self::PostCommit {
                preprepare,
                aggregate,
                ..
            } => {
                preprepare.encode(buf);
                aggregate.encode(buf);
            }
            Self::KeyAdvert {
                epoch,
                delegate,
                key,
            } => {
                write_u32(buf, *epoch);
                buf.push(delegate.0);
                key.encode(buf);
            }
            Self::HeartBeat | Self::TipRequest => {}
            Self::Rejection(rejection) => {
                rejection.preprepare.encode(buf);
                buf.push(rejection.delegate.0);
                buf.push(rejection.reason.code());
                let bits = rejection.rejection_map.len() as u16;
                write_u16(buf, bits);
                buf.extend_from_slice(&rejection.rejection_map.to_bytes());
                rejection.signature.encode(buf);
            }
            Self::PullRequest { hash } => hash.encode(buf),
            Self::PullResponse { block } => match block {
                Some(block) => {
                    buf.push(1);
                    block.encode(buf);
                }
                None => buf.push(0),
            },
            Self::TipResponse {
                request_tips,
                micro_tip,
                epoch_tip,
            } => {
                for tip in request_tips {
                    tip.encode(buf);
                }
                micro_tip.encode(buf);
                epoch_tip.encode(buf);
            }
            Self::ConnectedClientIds(ids) => ids.encode(buf),
        }
    }

    /// Decodes a message from a header and its payload.
    pub fn decode_payload(header: &MessageHeader, payload: &[u8]) -> Result<Self, WireError> {
        let message_type = MessageType::from_code(header.message_type)
            .ok_or(WireError::Malformed("message type"))?;
        let kind = ChainKind::from_code(header.consensus_type);
        let consensus_kind = || kind.ok_or(WireError::Malformed("consensus type"));

        let mut r = WireReader::new(payload);
        let message = match message_type {
            MessageType::PrePrepare => Self::PrePrepare {
                block: Block::decode(&mut r)?,
            },
            MessageType::Prepare => Self::Prepare {
                kind: consensus_kind()?,
                preprepare: Hash::decode(&mut r)?,
                delegate: DelegateId(r.read_u8()?),
                signature: BlsSignature::decode(&mut r)?,
            },
            MessageType::PostPrepare => Self::PostPrepare {
                kind: consensus_kind()?,
                preprepare: Hash::decode(&mut r)?,
                aggregate: AggSignature::decode(&mut r)?,
            },
            MessageType::Commit => Self::Commit {
                kind: consensus_kind()?,
                preprepare: Hash::decode(&mut r)?,
                delegate: DelegateId(r.read_u8()?),
                signature: BlsSignature::decode(&mut r)?,
            },
            MessageType::PostCommit => Self::PostCommit {
                kind: consensus_kind()?,
                preprepare: Hash::decode(&mut r)?,
                aggregate: AggSignature::decode(&mut r)?,
            },
            MessageType::KeyAdvert => Self::KeyAdvert {
                epoch: r.read_u32()?,
                delegate: DelegateId(r.read_u8()?),
                key: BlsPublicKey::decode(&mut r)?,
            },
            MessageType::HeartBeat => Self::HeartBeat,
            MessageType::Rejection => {
                let preprepare = Hash::decode(&mut r)?;
                let delegate = DelegateId(r.read_u8()?);
                let reason = RejectionReason::from_code(r.read_u8()?)
                    .ok_or(WireError::Malformed("rejection reason"))?;
                let bits = r.read_u16()? as usize;
                let bytes = r.read_bytes((bits + 7) / 8)?;
                let mut rejection_map = BitVec::from_bytes(bytes);
                rejection_map.truncate(bits);
                Self::Rejection(RejectionMessage {
                    kind: consensus_kind()?,
                    preprepare,
                    delegate,
                    reason,
                    rejection_map,
                    signature: BlsSignature::decode(&mut r)?,
                })
            }
            MessageType::PullRequest => Self::PullRequest {
                hash: Hash::decode(&mut r)?,
            },
            MessageType::PullResponse => {
                let block = if r.read_bool()? {
                    Some(Block::decode(&mut r)?)
                } else {
                    None
                };
                Self::PullResponse { block }
            }
            MessageType::TipRequest => Self::TipRequest,
            MessageType::TipResponse => {
                let mut request_tips = Vec::with_capacity(NUM_DELEGATES);
                for _ in 0..NUM_DELEGATES {
                    request_tips.push(Tip::decode(&mut r)?);
                }
                Self::TipResponse {
                    request_tips,
                    micro_tip: Tip::decode(&mut r)?,
                    epoch_tip: Tip::decode(&mut r)?,
                }
            }
            MessageType::TxAcceptor => return Err(WireError::Malformed("tx on delegate channel")),
            MessageType::ConnectedClientIds => {
                Self::ConnectedClientIds(ConnectedClientIds::decode(&mut r)?)
            }
        };
        if r.remaining() != 0 {
            return Err(WireError::TrailingBytes(r.remaining()));
        }
        Ok(message)
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.message_type())
    }
}

/// The digest a Prepare partial signs: `blake2b(kind ‖ phase ‖ digest)`.
pub fn prepare_digest(kind: ChainKind, preprepare: &Hash) -> Hash {
    phase_digest(kind, MessageType::Prepare as u8, preprepare)
}

/// The digest a Commit partial signs.
pub fn commit_digest(kind: ChainKind, preprepare: &Hash) -> Hash {
    phase_digest(kind, MessageType::Commit as u8, preprepare)
}

fn phase_digest(kind: ChainKind, phase: u8, preprepare: &Hash) -> Hash {
    HashStream::new()
        .update(&[kind.code(), phase])
        .update(preprepare.as_ref())
        .finalize()
}
