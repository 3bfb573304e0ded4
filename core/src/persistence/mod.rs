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

//! Validation and application of requests and blocks.
//!
//! Validation failures are values, never errors: a request failing admission
//! returns a typed [`AdmissionOutcome`] to its submitter, a proposal failing
//! backup validation produces a [`ValidationRejection`] that is sent back to
//! the primary. Only invariant breakage inside the writer domain panics.

pub mod epoch;
pub mod micro;
pub mod request;
pub mod reservations;
pub mod token;

use bit_vec::BitVec;

use std::fmt;

/// Result of submitting a request through the admission interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The request was accepted and will ride through consensus.
    Progress,
    /// The request was parked in the admission buffer.
    Buffered,
    /// A byte-identical request was already admitted or committed.
    Duplicate,
    /// The fee is below the minimum.
    InsufficientFee,
    /// The signature does not verify against the origin.
    BadSignature,
    /// The request attempts to act as the burn account.
    OpenedBurnAccount,
    /// The origin already has a different request in flight.
    Reserved,
    /// A field-level failure.
    Invalid(InvalidReason),
}

impl AdmissionOutcome {
    /// `true` if the request entered the pipeline.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Progress | Self::Buffered)
    }

    /// The stable result code reported to submitters.
    pub fn code(&self) -> String {
        match self {
            Self::Progress => "progress".to_owned(),
            Self::Buffered => "buffered".to_owned(),
            Self::Duplicate => "duplicate".to_owned(),
            Self::InsufficientFee => "insufficient_fee".to_owned(),
            Self::BadSignature => "bad_signature".to_owned(),
            Self::OpenedBurnAccount => "opened_burn_account".to_owned(),
            Self::Reserved => "reserved".to_owned(),
            Self::Invalid(reason) => format!("invalid_{}", reason.field()),
        }
    }
}

impl fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Field-level admission failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The origin account does not exist.
    UnknownAccount,
    /// `previous` does not match the origin account's head.
    WrongPrevious,
    /// A send with no transactions.
    NoTransactions,
    /// Every transaction of the send targets the origin itself.
    SelfTargetOnly,
    /// More transactions than a send may carry.
    TooManyTransactions,
    /// The origin cannot cover amounts plus fee.
    InsufficientBalance,
    /// The referenced token does not exist.
    UnknownToken,
    /// A token with this id already exists.
    TokenExists,
    /// The token symbol is empty or too long.
    BadSymbol,
    /// The origin is not a controller of the token.
    NotController,
    /// The required token capability is disabled.
    SettingDisabled,
    /// The token capability can no longer be changed.
    SettingImmutable,
    /// A participant is not whitelisted under the token.
    NotWhitelisted,
    /// A participant's token balance is frozen.
    AccountFrozen,
    /// The token's supply cannot cover the operation.
    InsufficientTokenBalance,
}

impl InvalidReason {
    /// The offending field, as reported in the `invalid_<field>` code.
    pub fn field(&self) -> &'static str {
        match self {
            Self::UnknownAccount => "account",
            Self::WrongPrevious => "previous",
            Self::NoTransactions | Self::TooManyTransactions => "transactions",
            Self::SelfTargetOnly => "destination",
            Self::InsufficientBalance => "balance",
            Self::UnknownToken | Self::TokenExists => "token",
            Self::BadSymbol => "symbol",
            Self::NotController => "controller",
            Self::SettingDisabled | Self::SettingImmutable => "setting",
            Self::NotWhitelisted => "whitelist",
            Self::AccountFrozen => "frozen",
            Self::InsufficientTokenBalance => "token_balance",
        }
    }
}

/// Reason a backup rejects a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The proposal timestamp is outside the drift envelope.
    ClockDrift,
    /// One or more contained requests failed validation.
    ContainsInvalidRequest,
    /// A signature did not verify.
    BadSignature,
    /// `previous` does not match the local chain tip.
    InvalidPreviousHash,
    /// The sequence number does not follow the local tip.
    WrongSequenceNumber,
    /// The proposal belongs to a wrong epoch.
    InvalidEpoch,
    /// The proposal belongs to the next epoch; retry after the transition.
    NewEpoch,
}

impl RejectionReason {
    /// Wire code of the reason.
    pub fn code(self) -> u8 {
        match self {
            Self::ClockDrift => 0,
            Self::ContainsInvalidRequest => 1,
            Self::BadSignature => 2,
            Self::InvalidPreviousHash => 3,
            Self::WrongSequenceNumber => 4,
            Self::InvalidEpoch => 5,
            Self::NewEpoch => 6,
        }
    }

    /// Parses a reason from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::ClockDrift,
            1 => Self::ContainsInvalidRequest,
            2 => Self::BadSignature,
            3 => Self::InvalidPreviousHash,
            4 => Self::WrongSequenceNumber,
            5 => Self::InvalidEpoch,
            6 => Self::NewEpoch,
            _ => return None,
        })
    }
}

/// A backup's verdict on a proposal it cannot vote for.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRejection {
    /// Why the proposal was rejected.
    pub reason: RejectionReason,
    /// For [`RejectionReason::ContainsInvalidRequest`], which requests are
    /// at fault (by position in the batch).
    pub invalid_requests: BitVec,
}

impl ValidationRejection {
    /// A rejection without per-request detail.
    pub fn new(reason: RejectionReason) -> Self {
        Self {
            reason,
            invalid_requests: BitVec::new(),
        }
    }

    /// A `ContainsInvalidRequest` rejection naming the offenders.
    pub fn invalid_requests(bitmap: BitVec) -> Self {
        Self {
            reason: RejectionReason::ContainsInvalidRequest,
            invalid_requests: bitmap,
        }
    }
}
