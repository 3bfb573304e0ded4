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

//! User requests.
//!
//! Every request shares a common prologue — `origin`, `signature`,
//! `previous` (the origin account's head at signing time), `fee` — followed
//! by a kind-specific payload. The request digest is the Blake2b-256 hash of
//! the canonical encoding with the signature omitted; the origin account
//! signs that digest with its ed25519 key.
//!
//! On the wire a request is its kind byte followed by the prologue and
//! payload. For `Send` (kind 0) this yields exactly the admission layout
//! `{ origin: 32 B, signature: 64 B, previous: 32 B, fee: 16 B LE,
//! n_transactions: 1 B, (destination: 32 B, amount: 16 B LE)* }` after the
//! kind byte.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::{
    constants::MAX_SEND_TRANSACTIONS,
    token::{TokenFeeType, TokenSetting, TokenSettings},
    types::{AccountAddress, Amount},
    wire::{write_u16, WireDecode, WireEncode, WireError, WireReader},
};
use trilith_crypto::{
    account::{verify_account_signature, AccountKeyPair, AccountSignature},
    hash, CryptoError, Hash, ObjectHash,
};

/// Discriminant of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Transfer of base units to up to [`MAX_SEND_TRANSACTIONS`] destinations.
    Send,
    /// Change of the origin account's representative delegate.
    ChangeRepresentative,
    /// Creation of a new token.
    IssueTokens,
    /// Transfer of token units from the token's central supply to a user.
    DistributeTokens,
    /// Forcible transfer of token units between user accounts.
    RevokeTokens,
    /// Freezing or unfreezing a user's token balance.
    FreezeTokens,
    /// Change of the token transfer fee.
    SetTokenFee,
    /// Change of a user's whitelist status.
    UpdateWhitelist,
    /// Addition or removal of a token controller.
    UpdateController,
    /// Destruction of token units held by the central supply.
    BurnTokens,
    /// Transfer of token units between user accounts.
    SendTokens,
    /// Permanently freezing one of a token's capability bits.
    ImmuteTokenSetting,
}

impl RequestKind {
    /// Wire code of the request kind.
    pub fn code(self) -> u8 {
        match self {
            Self::Send => 0,
            Self::ChangeRepresentative => 1,
            Self::IssueTokens => 2,
            Self::DistributeTokens => 3,
            Self::RevokeTokens => 4,
            Self::FreezeTokens => 5,
            Self::SetTokenFee => 6,
            Self::UpdateWhitelist => 7,
            Self::UpdateController => 8,
            Self::BurnTokens => 9,
            Self::SendTokens => 10,
            Self::ImmuteTokenSetting => 11,
        }
    }

    /// Parses a request kind from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Send,
            1 => Self::ChangeRepresentative,
            2 => Self::IssueTokens,
            3 => Self::DistributeTokens,
            4 => Self::RevokeTokens,
            5 => Self::FreezeTokens,
            6 => Self::SetTokenFee,
            7 => Self::UpdateWhitelist,
            8 => Self::UpdateController,
            9 => Self::BurnTokens,
            10 => Self::SendTokens,
            11 => Self::ImmuteTokenSetting,
            _ => return None,
        })
    }
}

/// One `(destination, amount)` entry of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Receiving account.
    pub destination: AccountAddress,
    /// Transferred amount.
    pub amount: Amount,
}

impl Transaction {
    /// Creates a transfer entry.
    pub fn new(destination: AccountAddress, amount: Amount) -> Self {
        Self {
            destination,
            amount,
        }
    }
}

impl WireEncode for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.destination.encode(buf);
        self.amount.encode(buf);
    }
}

impl WireDecode for Transaction {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            destination: AccountAddress::decode(r)?,
            amount: Amount::decode(r)?,
        })
    }
}

/// Common prologue of all requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prologue {
    /// Sending account; its ed25519 key verifies the signature.
    pub origin: AccountAddress,
    /// Signature over the request digest.
    #[serde(default = "AccountSignature::empty")]
    pub signature: AccountSignature,
    /// Head of the origin account's send chain at signing time.
    pub previous: Hash,
    /// Fee paid in base units; at least `MIN_TRANSACTION_FEE`.
    pub fee: Amount,
}

impl Prologue {
    /// Creates an unsigned prologue.
    pub fn new(origin: AccountAddress, previous: Hash, fee: Amount) -> Self {
        Self {
            origin,
            signature: AccountSignature::empty(),
            previous,
            fee,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        self.origin.encode(buf);
        self.signature.encode(buf);
        self.previous.encode(buf);
        self.fee.encode(buf);
    }

    fn encode_unsigned(&self, buf: &mut Vec<u8>) {
        self.origin.encode(buf);
        self.previous.encode(buf);
        self.fee.encode(buf);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            origin: AccountAddress::decode(r)?,
            signature: AccountSignature::decode(r)?,
            previous: Hash::decode(r)?,
            fee: Amount::decode(r)?,
        })
    }
}

/// Whether an `UpdateController` request adds or removes a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerAction {
    /// Add the account to the controller set.
    Add,
    /// Remove the account from the controller set.
    Remove,
}

/// Kind-specific payload of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Base-unit transfer.
    Send {
        /// Destinations and amounts; self-targeting entries are dropped on
        /// application.
        transactions: Vec<Transaction>,
    },
    /// Representative change.
    ChangeRepresentative {
        /// The new representative delegate account.
        representative: AccountAddress,
    },
    /// Token creation; the token id is this request's digest.
    IssueTokens {
        /// Token symbol, at most 8 characters.
        symbol: String,
        /// Initial (and total) supply.
        total_supply: Amount,
        /// Transfer fee mode.
        fee_type: TokenFeeType,
        /// Transfer fee rate.
        fee_rate: Amount,
        /// Initial capability bits.
        settings: TokenSettings,
        /// Initial controllers besides the issuer.
        controllers: Vec<AccountAddress>,
    },
    /// Distribution from central supply.
    DistributeTokens {
        /// Token being distributed.
        token_id: Hash,
        /// Destination and amount.
        transaction: Transaction,
    },
    /// Forcible transfer between users.
    RevokeTokens {
        /// Token being revoked.
        token_id: Hash,
        /// Account the units are taken from.
        source: AccountAddress,
        /// Destination and amount.
        transaction: Transaction,
    },
    /// Freeze toggle for a user's token balance.
    FreezeTokens {
        /// Token in question.
        token_id: Hash,
        /// Target account.
        account: AccountAddress,
        /// `true` to freeze, `false` to unfreeze.
        freeze: bool,
    },
    /// Fee change.
    SetTokenFee {
        /// Token in question.
        token_id: Hash,
        /// New fee mode.
        fee_type: TokenFeeType,
        /// New fee rate.
        fee_rate: Amount,
    },
    /// Whitelist toggle for a user.
    UpdateWhitelist {
        /// Token in question.
        token_id: Hash,
        /// Target account.
        account: AccountAddress,
        /// New whitelist status.
        whitelisted: bool,
    },
    /// Controller set change.
    UpdateController {
        /// Token in question.
        token_id: Hash,
        /// Add or remove.
        action: ControllerAction,
        /// The controller account.
        controller: AccountAddress,
    },
    /// Destruction of central-supply units.
    BurnTokens {
        /// Token in question.
        token_id: Hash,
        /// Amount burned from the central supply.
        amount: Amount,
    },
    /// Token transfer between users.
    SendTokens {
        /// Token being transferred.
        token_id: Hash,
        /// Destinations and amounts.
        transactions: Vec<Transaction>,
    },
    /// Permanent freeze of a capability bit.
    ImmuteTokenSetting {
        /// Token in question.
        token_id: Hash,
        /// The capability whose mutable bit is cleared.
        setting: TokenSetting,
    },
}

impl Payload {
    fn kind(&self) -> RequestKind {
        match self {
            Self::Send { .. } => RequestKind::Send,
            Self::ChangeRepresentative { .. } => RequestKind::ChangeRepresentative,
            Self::IssueTokens { .. } => RequestKind::IssueTokens,
            Self::DistributeTokens { .. } => RequestKind::DistributeTokens,
            Self::RevokeTokens { .. } => RequestKind::RevokeTokens,
            Self::FreezeTokens { .. } => RequestKind::FreezeTokens,
            Self::SetTokenFee { .. } => RequestKind::SetTokenFee,
            Self::UpdateWhitelist { .. } => RequestKind::UpdateWhitelist,
            Self::UpdateController { .. } => RequestKind::UpdateController,
            Self::BurnTokens { .. } => RequestKind::BurnTokens,
            Self::SendTokens { .. } => RequestKind::SendTokens,
            Self::ImmuteTokenSetting { .. } => RequestKind::ImmuteTokenSetting,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Send { transactions } => {
                buf.push(transactions.len() as u8);
                for tx in transactions {
                    tx.encode(buf);
                }
            }
            Self::ChangeRepresentative { representative } => representative.encode(buf),
            Self::IssueTokens {
                symbol,
                total_supply,
                fee_type,
                fee_rate,
                settings,
                controllers,
            } => {
                crate::wire::write_short_string(buf, symbol);
                total_supply.encode(buf);
                buf.push(match fee_type {
                    TokenFeeType::Flat => 0,
                    TokenFeeType::Percentage => 1,
                });
                fee_rate.encode(buf);
                write_u16(buf, settings.0);
                buf.push(controllers.len() as u8);
                for controller in controllers {
                    controller.encode(buf);
                }
            }
            Self::DistributeTokens {
                token_id,
                transaction,
            } => {
                token_id.encode(buf);
                transaction.encode(buf);
            }
            Self::RevokeTokens {
                token_id,
                source,
                transaction,
            } => {
                token_id.encode(buf);
                source.encode(buf);
                transaction.encode(buf);
            }
            Self::FreezeTokens {
                token_id,
                account,
                freeze,
            } => {
                token_id.encode(buf);
                account.encode(buf);
                buf.push(*freeze as u8);
            }
            Self::SetTokenFee {
                token_id,
                fee_type,
                fee_rate,
            } => {
                token_id.encode(buf);
                buf.push(match fee_type {
                    TokenFeeType::Flat => 0,
                    TokenFeeType::Percentage => 1,
                });
                fee_rate.encode(buf);
            }
            Self::UpdateWhitelist {
                token_id,
                account,
                whitelisted,
            } => {
                token_id.encode(buf);
                account.encode(buf);
                buf.push(*whitelisted as u8);
            }
            Self::UpdateController {
                token_id,
                action,
                controller,
            } => {
                token_id.encode(buf);
                buf.push(match action {
                    ControllerAction::Add => 0,
                    ControllerAction::Remove => 1,
                });
                controller.encode(buf);
            }
            Self::BurnTokens { token_id, amount } => {
                token_id.encode(buf);
                amount.encode(buf);
            }
            Self::SendTokens {
                token_id,
                transactions,
            } => {
                token_id.encode(buf);
                buf.push(transactions.len() as u8);
                for tx in transactions {
                    tx.encode(buf);
                }
            }
            Self::ImmuteTokenSetting { token_id, setting } => {
                token_id.encode(buf);
                buf.push(setting.code());
            }
        }
    }

    fn decode(kind: RequestKind, r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(match kind {
            RequestKind::Send => Self::Send {
                transactions: decode_transactions(r)?,
            },
            RequestKind::ChangeRepresentative => Self::ChangeRepresentative {
                representative: AccountAddress::decode(r)?,
            },
            RequestKind::IssueTokens => {
                let symbol = crate::wire::read_short_string(r)?;
                if symbol.is_empty() || symbol.len() > 8 {
                    return Err(WireError::Malformed("token symbol"));
                }
                let total_supply = Amount::decode(r)?;
                let fee_type = match r.read_u8()? {
                    0 => TokenFeeType::Flat,
                    1 => TokenFeeType::Percentage,
                    _ => return Err(WireError::Malformed("token fee type")),
                };
                let fee_rate = Amount::decode(r)?;
                let settings = TokenSettings(r.read_u16()?);
                let controller_count = r.read_u8()? as usize;
                let mut controllers = Vec::with_capacity(controller_count);
                for _ in 0..controller_count {
                    controllers.push(AccountAddress::decode(r)?);
                }
                Self::IssueTokens {
                    symbol,
                    total_supply,
                    fee_type,
                    fee_rate,
                    settings,
                    controllers,
                }
            }
            RequestKind::DistributeTokens => Self::DistributeTokens {
                token_id: Hash::decode(r)?,
                transaction: Transaction::decode(r)?,
            },
            RequestKind::RevokeTokens => Self::RevokeTokens {
                token_id: Hash::decode(r)?,
                source: AccountAddress::decode(r)?,
                transaction: Transaction::decode(r)?,
            },
            RequestKind::FreezeTokens => Self::FreezeTokens {
                token_id: Hash::decode(r)?,
                account: AccountAddress::decode(r)?,
                freeze: r.read_bool()?,
            },
            RequestKind::SetTokenFee => Self::SetTokenFee {
                token_id: Hash::decode(r)?,
                fee_type: match r.read_u8()? {
                    0 => TokenFeeType::Flat,
                    1 => TokenFeeType::Percentage,
                    _ => return Err(WireError::Malformed("token fee type")),
                },
                fee_rate: Amount::decode(r)?,
            },
            RequestKind::UpdateWhitelist => Self::UpdateWhitelist {
                token_id: Hash::decode(r)?,
                account: AccountAddress::decode(r)?,
                whitelisted: r.read_bool()?,
            },
            RequestKind::UpdateController => Self::UpdateController {
                token_id: Hash::decode(r)?,
                action: match r.read_u8()? {
                    0 => ControllerAction::Add,
                    1 => ControllerAction::Remove,
                    _ => return Err(WireError::Malformed("controller action")),
                },
                controller: AccountAddress::decode(r)?,
            },
            RequestKind::BurnTokens => Self::BurnTokens {
                token_id: Hash::decode(r)?,
                amount: Amount::decode(r)?,
            },
            RequestKind::SendTokens => Self::SendTokens {
                token_id: Hash::decode(r)?,
                transactions: decode_transactions(r)?,
            },
            RequestKind::ImmuteTokenSetting => Self::ImmuteTokenSetting {
                token_id: Hash::decode(r)?,
                setting: TokenSetting::from_code(r.read_u8()?)
                    .ok_or(WireError::Malformed("token setting"))?,
            },
        })
    }
}

fn decode_transactions(r: &mut WireReader<'_>) -> Result<Vec<Transaction>, WireError> {
    let count = r.read_u8()? as usize;
    if count > MAX_SEND_TRANSACTIONS {
        return Err(WireError::Malformed("too many transactions"));
    }
    let mut transactions = Vec::with_capacity(count);
    for _ in 0..count {
        transactions.push(Transaction::decode(r)?);
    }
    Ok(transactions)
}

/// A user request: prologue plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Common prologue.
    #[serde(flatten)]
    pub prologue: Prologue,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Request {
    /// Creates an unsigned request.
    pub fn new(origin: AccountAddress, previous: Hash, fee: Amount, payload: Payload) -> Self {
        Self {
            prologue: Prologue::new(origin, previous, fee),
            payload,
        }
    }

    /// Convenience constructor for a `Send`.
    pub fn send(
        origin: AccountAddress,
        previous: Hash,
        fee: Amount,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self::new(origin, previous, fee, Payload::Send { transactions })
    }

    /// Kind of the request.
    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }

    /// Sending account.
    pub fn origin(&self) -> AccountAddress {
        self.prologue.origin
    }

    /// Head of the origin's send chain at signing time.
    pub fn previous(&self) -> Hash {
        self.prologue.previous
    }

    /// Fee paid by the request.
    pub fn fee(&self) -> Amount {
        self.prologue.fee
    }

    /// Signs the request with the origin account's key pair.
    pub fn sign(&mut self, keys: &AccountKeyPair) {
        let digest = self.object_hash();
        self.prologue.signature = keys.sign(digest.as_ref());
    }

    /// Verifies the signature against the origin address.
    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        let digest = self.object_hash();
        verify_account_signature(
            self.prologue.origin.as_bytes(),
            digest.as_ref(),
            &self.prologue.signature,
        )
    }

    fn unsigned_wire(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.kind().code());
        self.prologue.encode_unsigned(&mut buf);
        self.payload.encode(&mut buf);
        buf
    }
}

impl ObjectHash for Request {
    fn object_hash(&self) -> Hash {
        hash(&self.unsigned_wire())
    }
}

impl WireEncode for Request {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind().code());
        self.prologue.encode(buf);
        self.payload.encode(buf);
    }
}

impl WireDecode for Request {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let kind =
            RequestKind::from_code(r.read_u8()?).ok_or(WireError::Malformed("request kind"))?;
        let prologue = Prologue::decode(r)?;
        let payload = Payload::decode(kind, r)?;
        Ok(Self { prologue, payload })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} from {} ({})",
            self.kind(),
            self.prologue.origin,
            self.object_hash()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn keys() -> AccountKeyPair {
        AccountKeyPair::from_seed(&[1; 32])
    }

    fn sample_send(keys: &AccountKeyPair) -> Request {
        let mut request = Request::send(
            AccountAddress(keys.address()),
            Hash::zero(),
            Amount(crate::constants::MIN_TRANSACTION_FEE),
            vec![
                Transaction::new(AccountAddress([2; 32]), Amount(5)),
                Transaction::new(AccountAddress([3; 32]), Amount(7)),
            ],
        );
        request.sign(keys);
        request
    }

    #[test]
    fn send_wire_layout_matches_admission_encoding() {
        let keys = keys();
        let request = sample_send(&keys);
        let wire = request.to_wire();

        // kind ‖ origin ‖ signature ‖ previous ‖ fee ‖ n ‖ entries
        assert_eq!(wire[0], 0);
        assert_eq!(&wire[1..33], &keys.address()[..]);
        assert_eq!(
            &wire[33..97],
            &request.prologue.signature.as_bytes()[..]
        );
        assert_eq!(&wire[97..129], Hash::zero().as_bytes());
        assert_eq!(wire[145], 2);
        assert_eq!(wire.len(), 146 + 2 * 48);
    }

    #[test]
    fn wire_roundtrip_preserves_digest_and_signature() {
        let keys = keys();
        let request = sample_send(&keys);
        let restored = Request::from_wire(&request.to_wire()).unwrap();
        assert_eq!(restored, request);
        assert_eq!(restored.object_hash(), request.object_hash());
        assert!(restored.verify_signature().is_ok());
    }

    #[test]
    fn signature_covers_the_payload() {
        let keys = keys();
        let mut request = sample_send(&keys);
        assert!(request.verify_signature().is_ok());

        if let Payload::Send { transactions } = &mut request.payload {
            transactions[0].amount = Amount(1_000_000);
        }
        assert!(request.verify_signature().is_err());
    }

    #[test]
    fn token_request_roundtrip() {
        use crate::token::TokenSetting;

        let keys = keys();
        let mut request = Request::new(
            AccountAddress(keys.address()),
            Hash::zero(),
            Amount(crate::constants::MIN_TRANSACTION_FEE),
            Payload::IssueTokens {
                symbol: "TRI".to_owned(),
                total_supply: Amount(1_000_000),
                fee_type: TokenFeeType::Flat,
                fee_rate: Amount(1),
                settings: TokenSettings::enabled(&[TokenSetting::Whitelist]),
                controllers: vec![AccountAddress([4; 32])],
            },
        );
        request.sign(&keys);
        let restored = Request::from_wire(&request.to_wire()).unwrap();
        assert_eq!(restored, request);
    }

    #[test]
    fn json_roundtrip() {
        let keys = keys();
        let request = sample_send(&keys);
        let json = serde_json::to_string(&request).unwrap();
        let restored: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, request);
    }
}
