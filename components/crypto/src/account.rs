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

//! Account-level signatures.
//!
//! User requests are signed with ed25519; the 32-byte account address *is*
//! the ed25519 public key, so no separate key registry exists for accounts.

use ed25519_dalek::{Keypair, PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use signature::{Signature as _, Signer, Verifier};

use std::fmt;

use crate::{write_short_hex, CryptoError};

/// Number of bytes in an account signature.
pub const ACCOUNT_SIGNATURE_SIZE: usize = 64;
/// Number of bytes in an account public key (= account address).
pub const ACCOUNT_KEY_SIZE: usize = 32;

/// Detached ed25519 signature over a request digest.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AccountSignature([u8; ACCOUNT_SIGNATURE_SIZE]);

impl AccountSignature {
    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; ACCOUNT_SIGNATURE_SIZE] {
        &self.0
    }

    /// Builds a signature value from raw bytes. The bytes are validated
    /// lazily, during verification.
    pub fn from_bytes(bytes: [u8; ACCOUNT_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// The all-zero placeholder used before signing.
    pub fn empty() -> Self {
        Self([0; ACCOUNT_SIGNATURE_SIZE])
    }
}

impl Default for AccountSignature {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for AccountSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountSignature(")?;
        write_short_hex(f, &self.0)?;
        f.write_str(")")
    }
}

impl Serialize for AccountSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0[..]))
    }
}

impl<'de> Deserialize<'de> for AccountSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_repr = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex_repr).map_err(de::Error::custom)?;
        if bytes.len() != ACCOUNT_SIGNATURE_SIZE {
            return Err(de::Error::custom("signature must be 64 bytes"));
        }
        let mut raw = [0; ACCOUNT_SIGNATURE_SIZE];
        raw.copy_from_slice(&bytes);
        Ok(Self(raw))
    }
}

/// An account key pair; the public half doubles as the account address.
pub struct AccountKeyPair(Keypair);

impl AccountKeyPair {
    /// Generates a fresh account key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Keypair::generate(rng))
    }

    /// Derives a key pair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = SecretKey::from_bytes(seed).expect("any 32 bytes are a valid secret");
        let public = PublicKey::from(&secret);
        Self(Keypair { secret, public })
    }

    /// Restores a key pair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret =
            SecretKey::from_bytes(bytes).map_err(|_| CryptoError::MalformedPoint("secret key"))?;
        let public = PublicKey::from(&secret);
        Ok(Self(Keypair { secret, public }))
    }

    /// The account address (= public key bytes).
    pub fn address(&self) -> [u8; ACCOUNT_KEY_SIZE] {
        self.0.public.to_bytes()
    }

    /// Signs a request digest.
    pub fn sign(&self, msg: &[u8]) -> AccountSignature {
        AccountSignature(self.0.sign(msg).to_bytes())
    }
}

impl fmt::Debug for AccountKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccountKeyPair(")?;
        write_short_hex(f, &self.address())?;
        f.write_str(")")
    }
}

/// Verifies an account signature over `msg` for the account whose address is
/// `address` (i.e. whose public key bytes equal the address).
pub fn verify_account_signature(
    address: &[u8; ACCOUNT_KEY_SIZE],
    msg: &[u8],
    signature: &AccountSignature,
) -> Result<(), CryptoError> {
    let key =
        PublicKey::from_bytes(address).map_err(|_| CryptoError::MalformedPoint("public key"))?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0[..])
        .map_err(|_| CryptoError::MalformedPoint("signature"))?;
    key.verify(msg, &sig)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn sign_and_verify() {
        let mut rng = StdRng::from_seed([3; 32]);
        let pair = AccountKeyPair::generate(&mut rng);
        let sig = pair.sign(b"request digest");

        assert!(verify_account_signature(&pair.address(), b"request digest", &sig).is_ok());
        assert_eq!(
            verify_account_signature(&pair.address(), b"tampered", &sig),
            Err(CryptoError::VerificationFailed)
        );

        let other = AccountKeyPair::generate(&mut rng);
        assert_eq!(
            verify_account_signature(&other.address(), b"request digest", &sig),
            Err(CryptoError::VerificationFailed)
        );
    }
}
