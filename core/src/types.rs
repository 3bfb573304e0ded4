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

//! Scalar types of the ledger.

use hex::FromHex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};

use std::{
    fmt,
    ops::{Add, AddAssign},
    str::FromStr,
};

/// Epoch number. Epochs are fixed-length time windows during which the
/// delegate set is immutable.
pub type Epoch = u32;

/// Position of a block within its chain; resets at each epoch for request
/// chains.
pub type Sequence = u32;

/// The three consensus chain kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKind {
    /// Per-delegate request-block chains.
    Request,
    /// The single micro-block chain.
    Micro,
    /// The single epoch-block chain.
    Epoch,
}

impl ChainKind {
    /// All chain kinds, in wire-code order.
    pub const ALL: [Self; 3] = [Self::Request, Self::Micro, Self::Epoch];

    /// Wire code of the chain kind.
    pub fn code(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Micro => 1,
            Self::Epoch => 2,
        }
    }

    /// Parses a chain kind from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Request),
            1 => Some(Self::Micro),
            2 => Some(Self::Epoch),
            _ => None,
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Micro => "micro",
            Self::Epoch => "epoch",
        };
        f.write_str(name)
    }
}

/// Identifier of a delegate within an epoch's committee; indexes the
/// per-epoch key table populated from the electing epoch block.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    DeriveSerialize,
    DeriveDeserialize,
)]
pub struct DelegateId(pub u8);

impl fmt::Display for DelegateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl DelegateId {
    /// Index of the delegate, as `usize`.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A 32-byte account address. The address is the account's ed25519 public
/// key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AccountAddress(pub [u8; 32]);

impl AccountAddress {
    /// The all-zero address: the burn account. It can receive funds but may
    /// never be opened or send.
    pub const fn zero() -> Self {
        Self([0; 32])
    }

    /// Returns `true` for the burn account address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Raw bytes of the address.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation of the address.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses an address from its hex representation.
    pub fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, hex::FromHexError> {
        <[u8; 32]>::from_hex(hex).map(Self)
    }
}

impl fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Account({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AccountAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(hex).map_err(de::Error::custom)
    }
}

/// An amount of base units. 16 bytes little-endian on the wire; rendered as
/// a decimal string in JSON to survive consumers without 128-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(pub u128);

impl Amount {
    /// The zero amount.
    pub const ZERO: Self = Self(0);

    /// Checked addition.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Amount {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = String::deserialize(deserializer)?;
        repr.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_kind_codes_roundtrip() {
        for kind in ChainKind::ALL.iter() {
            assert_eq!(ChainKind::from_code(kind.code()), Some(*kind));
        }
        assert_eq!(ChainKind::from_code(3), None);
    }

    #[test]
    fn amount_arithmetic_guards() {
        let max = Amount(u128::MAX);
        assert_eq!(max.checked_add(Amount(1)), None);
        assert_eq!(Amount(5).checked_sub(Amount(6)), None);
        assert_eq!(Amount(5).checked_sub(Amount(5)), Some(Amount::ZERO));
    }

    #[test]
    fn amount_json_is_a_decimal_string() {
        let amount = Amount(340_282_366_920_938_463_463_374_607_431_768_211_455);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211455\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }
}
