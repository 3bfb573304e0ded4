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

//! Validation, assembly and application of micro blocks.

use std::time::Duration;

use crate::{
    blocks::MicroBlock,
    persistence::{RejectionReason, ValidationRejection},
    schema::{LedgerSchema, SchemaAccess},
    types::{DelegateId, Epoch},
};
use trilith_crypto::ObjectHash;
use trilith_storage::Fork;

/// Validates a micro-block proposal on a backup.
pub fn validate_block<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    block: &MicroBlock,
    now_ms: u64,
    current_epoch: Epoch,
    drift: Duration,
) -> Result<(), ValidationRejection> {
    if block.epoch != current_epoch {
        let reason = if block.epoch == current_epoch + 1 {
            RejectionReason::NewEpoch
        } else {
            RejectionReason::InvalidEpoch
        };
        return Err(ValidationRejection::new(reason));
    }

    let drift_ms = drift.as_millis() as u64;
    if block.timestamp.max(now_ms) - block.timestamp.min(now_ms) > drift_ms {
        return Err(ValidationRejection::new(RejectionReason::ClockDrift));
    }

    let tip = schema.micro_tip();
    if tip.is_empty() {
        if !block.previous.is_zero() {
            return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
        }
        if block.sequence != 0 {
            return Err(ValidationRejection::new(RejectionReason::WrongSequenceNumber));
        }
        return Ok(());
    }

    if block.previous != tip.digest {
        return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
    }

    let previous = schema.micro_block(&tip.digest);
    let expected_sequence = match &previous {
        Some(prev) if prev.last_micro => {
            if block.epoch != tip.epoch + 1 {
                return Err(ValidationRejection::new(RejectionReason::InvalidEpoch));
            }
            0
        }
        _ => {
            if block.epoch != tip.epoch {
                return Err(ValidationRejection::new(RejectionReason::InvalidEpoch));
            }
            tip.sequence + 1
        }
    };
    if block.sequence != expected_sequence {
        return Err(ValidationRejection::new(RejectionReason::WrongSequenceNumber));
    }

    // Every request tip must advance component-wise.
    if let Some(prev) = previous {
        for (current, earlier) in block.tips.iter().zip(&prev.tips) {
            if !current.advances(earlier) {
                return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
            }
        }
    }
    Ok(())
}

/// Assembles the next micro block: a cut of all request chains at this
/// moment.
pub fn build<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    epoch: Epoch,
    timestamp: u64,
    primary: DelegateId,
    last_micro: bool,
) -> MicroBlock {
    let tip = schema.micro_tip();
    let sequence = if tip.is_empty() || tip.epoch != epoch {
        0
    } else {
        tip.sequence + 1
    };
    MicroBlock::new(
        tip.digest,
        epoch,
        sequence,
        timestamp,
        primary,
        last_micro,
        schema.request_tips(),
    )
}

/// Applies a post-committed micro block.
pub fn apply(fork: &mut Fork, block: &MicroBlock) {
    let hash = block.object_hash();
    let mut schema = LedgerSchema::new(fork);
    schema.put_micro_block(&hash, block);
}
