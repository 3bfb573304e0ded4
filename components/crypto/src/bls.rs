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

//! BLS12-381 signatures for delegate consensus messages.
//!
//! The min-pk ciphersuite is used: public keys are 48-byte compressed G1
//! points, signatures are 96-byte compressed G2 points. Partial signatures
//! from individual delegates over the same digest are aggregated into a
//! single point; verification selects the participating public keys by the
//! bitmap carried next to the aggregate.

use blst::min_pk::{AggregateSignature as RawAggregate, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::{CryptoRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use std::fmt;

use crate::{write_short_hex, CryptoError};

/// Domain separation tag of the min-pk BLS ciphersuite.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// Number of bytes in a compressed BLS public key.
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
/// Number of bytes in a compressed BLS signature.
pub const BLS_SIGNATURE_SIZE: usize = 96;

/// Compressed BLS12-381 public key of a delegate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlsPublicKey([u8; BLS_PUBLIC_KEY_SIZE]);

impl BlsPublicKey {
    /// Raw compressed bytes of the key.
    pub fn as_bytes(&self) -> &[u8; BLS_PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Restores a key from compressed bytes, checking that they decode to a
    /// valid point in the correct subgroup.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let point =
            PublicKey::from_bytes(bytes).map_err(|_| CryptoError::MalformedPoint("public key"))?;
        Ok(Self(point.to_bytes()))
    }

    /// Restores a key from compressed bytes without a subgroup check.
    ///
    /// Used when reading keys back from trusted storage; keys arriving from
    /// the wire go through [`from_bytes`](Self::from_bytes).
    pub fn from_bytes_unchecked(bytes: [u8; BLS_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn decode(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_bytes(&self.0).map_err(|_| CryptoError::MalformedPoint("public key"))
    }

    /// Verifies a partial signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &BlsSignature) -> Result<(), CryptoError> {
        let pk = self.decode()?;
        let sig = signature.decode()?;
        match sig.verify(true, msg, DST, &[], &pk, false) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(CryptoError::VerificationFailed),
        }
    }

    /// Hex representation of the compressed key.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[..])
    }

    /// Parses a key from its hex representation.
    pub fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(hex.as_ref()).map_err(|_| CryptoError::MalformedPoint("public key"))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlsPublicKey(")?;
        write_short_hex(f, &self.0)?;
        f.write_str(")")
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(hex).map_err(de::Error::custom)
    }
}

/// Compressed BLS12-381 signature: a delegate's partial or an aggregate.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature([u8; BLS_SIGNATURE_SIZE]);

impl BlsSignature {
    /// Raw compressed bytes of the signature.
    pub fn as_bytes(&self) -> &[u8; BLS_SIGNATURE_SIZE] {
        &self.0
    }

    /// Restores a signature from compressed bytes, checking the point decodes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let point =
            Signature::from_bytes(bytes).map_err(|_| CryptoError::MalformedPoint("signature"))?;
        Ok(Self(point.to_bytes()))
    }

    /// The all-zero placeholder used in messages before signing.
    pub fn empty() -> Self {
        Self([0; BLS_SIGNATURE_SIZE])
    }

    /// Builds a signature value from raw bytes without checking that they
    /// decode to a valid point; the check happens on first verification.
    pub fn from_raw(bytes: [u8; BLS_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    fn decode(&self) -> Result<Signature, CryptoError> {
        Signature::from_bytes(&self.0).map_err(|_| CryptoError::MalformedPoint("signature"))
    }
}

impl Default for BlsSignature {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlsSignature(")?;
        write_short_hex(f, &self.0)?;
        f.write_str(")")
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0[..]))
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_repr = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex_repr).map_err(de::Error::custom)?;
        if bytes.len() != BLS_SIGNATURE_SIZE {
            return Err(de::Error::custom("signature must be 96 bytes"));
        }
        let mut raw = [0; BLS_SIGNATURE_SIZE];
        raw.copy_from_slice(&bytes);
        Ok(Self(raw))
    }
}

/// A delegate's BLS key pair.
pub struct BlsKeyPair {
    secret: SecretKey,
    public: BlsPublicKey,
}

impl BlsKeyPair {
    /// Generates a fresh key pair from the given randomness source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut ikm = [0_u8; 32];
        rng.fill_bytes(&mut ikm);
        let secret = SecretKey::key_gen(&ikm, &[]).expect("32 bytes of key material");
        let public = BlsPublicKey(secret.sk_to_pk().to_bytes());
        Self { secret, public }
    }

    /// Derives a key pair deterministically from 32 bytes of key material.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = SecretKey::key_gen(seed, &[]).expect("32 bytes of key material");
        let public = BlsPublicKey(secret.sk_to_pk().to_bytes());
        Self { secret, public }
    }

    /// Restores a key pair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret =
            SecretKey::from_bytes(bytes).map_err(|_| CryptoError::MalformedPoint("secret key"))?;
        let public = BlsPublicKey(secret.sk_to_pk().to_bytes());
        Ok(Self { secret, public })
    }

    /// The public half of the pair.
    pub fn public_key(&self) -> BlsPublicKey {
        self.public
    }

    /// Raw bytes of the secret key.
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// Signs `msg` with the secret key.
    pub fn sign(&self, msg: &[u8]) -> BlsSignature {
        BlsSignature(self.secret.sign(msg, DST, &[]).to_bytes())
    }
}

impl fmt::Debug for BlsKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsKeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Aggregates partial signatures over the same message into a single point.
///
/// Fails on an empty set or if any partial does not decode to a valid point.
pub fn aggregate(partials: &[BlsSignature]) -> Result<BlsSignature, CryptoError> {
    if partials.is_empty() {
        return Err(CryptoError::Aggregation("empty partial set"));
    }
    let decoded = partials
        .iter()
        .map(BlsSignature::decode)
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&Signature> = decoded.iter().collect();
    let agg = RawAggregate::aggregate(&refs, true)
        .map_err(|_| CryptoError::Aggregation("invalid partial"))?;
    Ok(BlsSignature(agg.to_signature().to_bytes()))
}

/// Verifies an aggregate signature over `msg` against the set of public keys
/// selected by the participation bitmap.
///
/// Succeeds iff every selected delegate contributed a valid partial over the
/// same `msg`.
pub fn verify_aggregate(
    msg: &[u8],
    signature: &BlsSignature,
    public_keys: &[BlsPublicKey],
) -> Result<(), CryptoError> {
    if public_keys.is_empty() {
        return Err(CryptoError::Aggregation("empty key set"));
    }
    let decoded = public_keys
        .iter()
        .map(BlsPublicKey::decode)
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&PublicKey> = decoded.iter().collect();
    let sig = signature.decode()?;
    match sig.fast_aggregate_verify(true, msg, DST, &refs) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(CryptoError::VerificationFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn keys(count: usize) -> Vec<BlsKeyPair> {
        let mut rng = StdRng::from_seed([7; 32]);
        (0..count).map(|_| BlsKeyPair::generate(&mut rng)).collect()
    }

    #[test]
    fn sign_and_verify() {
        let pair = keys(1).pop().unwrap();
        let sig = pair.sign(b"digest");
        assert!(pair.public_key().verify(b"digest", &sig).is_ok());
        assert_eq!(
            pair.public_key().verify(b"other", &sig),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn public_key_roundtrip() {
        let pair = keys(1).pop().unwrap();
        let restored = BlsPublicKey::from_bytes(pair.public_key().as_bytes()).unwrap();
        assert_eq!(restored, pair.public_key());
    }

    #[test]
    fn aggregate_verifies_iff_all_partials_verify() {
        let pairs = keys(4);
        let msg = b"phase digest";

        let partials: Vec<_> = pairs.iter().map(|pair| pair.sign(msg)).collect();
        let publics: Vec<_> = pairs.iter().map(BlsKeyPair::public_key).collect();
        for (partial, public) in partials.iter().zip(&publics) {
            assert!(public.verify(msg, partial).is_ok());
        }

        let agg = aggregate(&partials).unwrap();
        assert!(verify_aggregate(msg, &agg, &publics).is_ok());

        // One partial over a different message poisons the aggregate.
        let mut poisoned = partials.clone();
        poisoned[2] = pairs[2].sign(b"another digest");
        let bad_agg = aggregate(&poisoned).unwrap();
        assert_eq!(
            verify_aggregate(msg, &bad_agg, &publics),
            Err(CryptoError::VerificationFailed)
        );

        // Aggregate does not verify against a mismatched key subset.
        assert_eq!(
            verify_aggregate(msg, &agg, &publics[..3]),
            Err(CryptoError::VerificationFailed)
        );
    }

    #[test]
    fn aggregate_of_nothing_is_an_error() {
        assert_eq!(
            aggregate(&[]),
            Err(CryptoError::Aggregation("empty partial set"))
        );
    }
}
