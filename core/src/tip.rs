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

//! Chain tips.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::{
    types::{Epoch, Sequence},
    wire::{write_u32, WireDecode, WireEncode, WireError, WireReader},
};
use trilith_crypto::Hash;

/// Head of a chain: `(epoch, sequence, digest)`.
///
/// Tips are ordered by `(epoch, sequence)`, with one refinement: within the
/// same epoch, a zero-sequence tip with a zero digest (an empty chain)
/// precedes a zero-sequence tip whose block exists. Tips of distinct blocks
/// at the same position are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tip {
    /// Epoch of the chain head.
    pub epoch: Epoch,
    /// Sequence of the chain head. For epoch chains this equals the epoch.
    pub sequence: Sequence,
    /// Digest of the head block; zero for an empty chain.
    pub digest: Hash,
}

/// Size of a tip record on the wire and in storage.
pub const TIP_WIRE_SIZE: usize = 4 + 4 + 32;

impl Tip {
    /// Creates a tip.
    pub fn new(epoch: Epoch, sequence: Sequence, digest: Hash) -> Self {
        Self {
            epoch,
            sequence,
            digest,
        }
    }

    /// The tip of an empty chain.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns `true` if no block stands at this tip yet.
    pub fn is_empty(&self) -> bool {
        self.digest.is_zero()
    }

    /// Strict precedence: `true` if `self` stands strictly before `other`.
    pub fn precedes(&self, other: &Self) -> bool {
        if self.epoch != other.epoch {
            return self.epoch < other.epoch;
        }
        if self.sequence != other.sequence {
            return self.sequence < other.sequence;
        }
        // Same position: an absent block precedes a present one.
        self.sequence == 0 && self.digest.is_zero() && !other.digest.is_zero()
    }

    /// Monotonicity check used for micro-block validation: `true` if `self`
    /// equals `prev` or stands after it.
    pub fn advances(&self, prev: &Self) -> bool {
        *self == *prev || prev.precedes(self)
    }
}

impl fmt::Display for Tip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.epoch, self.sequence, self.digest)
    }
}

impl WireEncode for Tip {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.epoch);
        write_u32(buf, self.sequence);
        self.digest.encode(buf);
    }
}

impl WireDecode for Tip {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            epoch: r.read_u32()?,
            sequence: r.read_u32()?,
            digest: Hash::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith_crypto::hash;

    #[test]
    fn ordering_is_lexicographic_by_epoch_and_sequence() {
        let a = Tip::new(1, 5, hash(b"a"));
        let b = Tip::new(1, 6, hash(b"b"));
        let c = Tip::new(2, 0, hash(b"c"));

        assert!(a.precedes(&b));
        assert!(b.precedes(&c));
        assert!(a.precedes(&c));
        assert!(!b.precedes(&a));
        assert!(!a.precedes(&a));
    }

    #[test]
    fn empty_tip_precedes_same_epoch_first_block() {
        let empty = Tip::new(3, 0, Hash::zero());
        let first = Tip::new(3, 0, hash(b"first"));

        assert!(empty.precedes(&first));
        assert!(!first.precedes(&empty));
    }

    #[test]
    fn distinct_blocks_at_same_position_do_not_precede_each_other() {
        let a = Tip::new(3, 4, hash(b"a"));
        let b = Tip::new(3, 4, hash(b"b"));
        assert!(!a.precedes(&b));
        assert!(!b.precedes(&a));
        assert!(a.advances(&a));
        assert!(!a.advances(&b));
    }

    #[test]
    fn wire_roundtrip() {
        let tip = Tip::new(7, 42, hash(b"tip"));
        let bytes = tip.to_wire();
        assert_eq!(bytes.len(), TIP_WIRE_SIZE);
        assert_eq!(Tip::from_wire(&bytes).unwrap(), tip);
    }
}
