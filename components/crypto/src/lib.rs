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

//! Cryptography primitives used throughout Trilith.
//!
//! Three families of primitives live here:
//!
//! - [`Hash`] — Blake2b-256 content digests, used to identify blocks and
//!   requests, together with the streaming [`HashStream`] builder and the
//!   [`ObjectHash`] trait.
//! - [`bls`] — BLS12-381 keys and signatures for delegate consensus
//!   messages, including signature aggregation over a participation bitmap.
//! - [`account`] — ed25519 signatures for user requests; an account address
//!   is the ed25519 public key itself.

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]

pub mod account;
pub mod bls;

use blake2::{
    digest::{Update, VariableOutput},
    VarBlake2b,
};
use hex::{FromHex, FromHexError};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use std::fmt;

/// Number of bytes in a digest.
pub const HASH_SIZE: usize = 32;

/// The number of bytes rendered in `Debug` output before eliding.
const BYTES_IN_DEBUG: usize = 4;

pub(crate) fn write_short_hex(f: &mut fmt::Formatter<'_>, slice: &[u8]) -> fmt::Result {
    for byte in slice.iter().take(BYTES_IN_DEBUG) {
        write!(f, "{:02x}", byte)?;
    }
    if slice.len() > BYTES_IN_DEBUG {
        write!(f, "...")?;
    }
    Ok(())
}

/// Blake2b-256 digest of a byte sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Creates a digest from raw bytes.
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// The all-zero digest, used as the `previous` reference of the first
    /// block in a chain.
    pub const fn zero() -> Self {
        Self([0; HASH_SIZE])
    }

    /// Returns `true` for the all-zero digest.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_SIZE]
    }

    /// Raw bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Creates a digest from a byte slice; fails unless the slice is exactly
    /// [`HASH_SIZE`] bytes long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() == HASH_SIZE {
            let mut bytes = [0; HASH_SIZE];
            bytes.copy_from_slice(slice);
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Hex representation of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a digest from its hex representation.
    pub fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, FromHexError> {
        <[u8; HASH_SIZE]>::from_hex(hex).map(Self)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hash(")?;
        write_short_hex(f, &self.0)?;
        f.write_str(")")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(hex).map_err(de::Error::custom)
    }
}

/// Computes the Blake2b-256 digest of a byte slice.
pub fn hash(data: impl AsRef<[u8]>) -> Hash {
    HashStream::new().update(data.as_ref()).finalize()
}

/// Incremental digest computation over several byte slices.
///
/// Block and request digests are built by feeding fields into a stream in
/// their canonical wire order.
pub struct HashStream(VarBlake2b);

impl HashStream {
    /// Creates an empty stream.
    pub fn new() -> Self {
        Self(VarBlake2b::new(HASH_SIZE).expect("Blake2b supports 32-byte output"))
    }

    /// Feeds a chunk of data into the stream.
    pub fn update(mut self, data: &[u8]) -> Self {
        self.0.update(data);
        self
    }

    /// Completes the computation and returns the digest.
    pub fn finalize(self) -> Hash {
        let mut out = [0; HASH_SIZE];
        self.0.finalize_variable(|res| out.copy_from_slice(res));
        Hash(out)
    }
}

impl Default for HashStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HashStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashStream(..)")
    }
}

/// A type with a canonical content digest.
pub trait ObjectHash {
    /// Computes the digest identifying this object.
    fn object_hash(&self) -> Hash;
}

impl ObjectHash for Hash {
    fn object_hash(&self) -> Hash {
        *self
    }
}

/// Errors produced by signature handling.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CryptoError {
    /// Bytes do not decode to a valid curve point.
    #[error("malformed {0} point")]
    MalformedPoint(&'static str),
    /// A signature failed verification.
    #[error("signature verification failed")]
    VerificationFailed,
    /// Signature aggregation failed (e.g. empty partial set).
    #[error("cannot aggregate signatures: {0}")]
    Aggregation(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hash_is_stable_and_length_sensitive() {
        let a = hash(b"trilith");
        let b = hash(b"trilith");
        let c = hash(b"trilith!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Hash::zero());
    }

    #[test]
    fn stream_equals_one_shot() {
        let streamed = HashStream::new()
            .update(b"tri")
            .update(b"lith")
            .finalize();
        assert_eq!(streamed, hash(b"trilith"));
    }

    #[test]
    fn to_from_hex() {
        let original = hash(b"roundtrip");
        let parsed = Hash::from_hex(original.to_hex()).unwrap();
        assert_eq!(original, parsed);
    }
}
