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

//! Validation, assembly and application of epoch blocks.
//!
//! The epoch block closing epoch `N` carries the delegate set that will
//! serve in epoch `N + 2`: announcing the committee one epoch ahead leaves a
//! full epoch for the incoming delegates to connect and catch up.

use std::time::Duration;

use crate::{
    blocks::{DelegateInfo, EpochBlock},
    constants::NUM_DELEGATES,
    persistence::{RejectionReason, ValidationRejection},
    schema::{LedgerSchema, SchemaAccess},
    types::{Amount, DelegateId, Epoch},
};
use trilith_crypto::ObjectHash;
use trilith_storage::Fork;

/// How far ahead of its closing epoch an epoch block's delegate set serves.
pub const ELECTION_LOOKAHEAD: Epoch = 2;

/// Validates an epoch-block proposal on a backup.
pub fn validate_block<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    block: &EpochBlock,
    now_ms: u64,
    current_epoch: Epoch,
    drift: Duration,
) -> Result<(), ValidationRejection> {
    if block.delegates.len() != NUM_DELEGATES {
        return Err(ValidationRejection::new(RejectionReason::InvalidEpoch));
    }

    let drift_ms = drift.as_millis() as u64;
    if block.timestamp.max(now_ms) - block.timestamp.min(now_ms) > drift_ms {
        return Err(ValidationRejection::new(RejectionReason::ClockDrift));
    }

    let tip = schema.epoch_tip();
    if tip.is_empty() {
        // Only the genesis initializer writes the first epoch block.
        return Err(ValidationRejection::new(RejectionReason::InvalidEpoch));
    }
    if block.previous != tip.digest {
        return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
    }
    if block.epoch != tip.epoch + 1 {
        let reason = if block.epoch == current_epoch + 1 {
            RejectionReason::NewEpoch
        } else {
            RejectionReason::InvalidEpoch
        };
        return Err(ValidationRejection::new(reason));
    }

    // The sealing micro tip belongs to the epoch this block closes and may
    // only move forward relative to the previous epoch block.
    if block.micro_tip.epoch != block.epoch {
        return Err(ValidationRejection::new(RejectionReason::InvalidEpoch));
    }
    if let Some(previous) = schema.epoch_block(&tip.digest) {
        if !block.micro_tip.advances(&previous.micro_tip) {
            return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
        }
    }
    if let Some(sealing) = schema.micro_block(&block.micro_tip.digest) {
        if !sealing.last_micro {
            return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
        }
    }
    Ok(())
}

/// Assembles the epoch block closing `epoch`.
pub fn build<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    epoch: Epoch,
    timestamp: u64,
    primary: DelegateId,
    delegates: Vec<DelegateInfo>,
) -> EpochBlock {
    let tip = schema.epoch_tip();
    EpochBlock::new(
        tip.digest,
        epoch,
        timestamp,
        primary,
        schema.micro_tip(),
        delegates,
        schema.fee_pool(),
        schema.total_supply(),
    )
}

/// Applies a post-committed epoch block: stores it, advances the epoch tip,
/// installs the elected committee for its target epoch and rolls the fee
/// pool into the block.
pub fn apply(fork: &mut Fork, block: &EpochBlock) {
    let hash = block.object_hash();
    let mut schema = LedgerSchema::new(fork);
    schema.put_epoch_block(&hash, block);
    schema.put_delegates(block.epoch + ELECTION_LOOKAHEAD, &block.delegates);
    schema.put_fee_pool(Amount::ZERO);
    schema.put_total_supply(block.total_supply);
}
