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

//! Validation and application of requests and request blocks.

use bit_vec::BitVec;
use log::warn;

use std::time::Duration;

use crate::{
    account::{Account, ReceiveRecord},
    blocks::RequestBlock,
    constants::{MAX_SEND_TRANSACTIONS, MIN_TRANSACTION_FEE},
    persistence::{
        reservations::{Acquire, Reservations},
        token, AdmissionOutcome, InvalidReason, RejectionReason, ValidationRejection,
    },
    requests::{Payload, Request},
    schema::{LedgerSchema, SchemaAccess},
    types::{Amount, Epoch},
};
use trilith_crypto::ObjectHash;
use trilith_storage::Fork;

/// Validates a request at admission and, if admissible, takes the origin's
/// reservation.
///
/// Returns [`AdmissionOutcome::Progress`] on success; every failure is a
/// typed outcome reported back to the submitter.
pub fn validate_and_reserve<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    reservations: &mut Reservations,
    request: &Request,
    current_epoch: Epoch,
) -> AdmissionOutcome {
    let outcome = validate(schema, reservations, request, current_epoch, false);
    if outcome == AdmissionOutcome::Progress {
        reservations.update(request.origin(), request.object_hash(), current_epoch);
    }
    outcome
}

/// Validates a single request. `allow_duplicates` relaxes the reservation
/// probe for backup validation of a proposal, where the reservation taken at
/// admission refers to the very request being checked.
pub fn validate<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    reservations: &mut Reservations,
    request: &Request,
    current_epoch: Epoch,
    allow_duplicates: bool,
) -> AdmissionOutcome {
    let origin = request.origin();
    if origin.is_zero() {
        return AdmissionOutcome::OpenedBurnAccount;
    }
    if request.fee() < Amount(MIN_TRANSACTION_FEE) {
        return AdmissionOutcome::InsufficientFee;
    }
    if request.verify_signature().is_err() {
        return AdmissionOutcome::BadSignature;
    }

    let account = match schema.account(&origin) {
        Some(account) => account,
        None => return AdmissionOutcome::Invalid(InvalidReason::UnknownAccount),
    };

    let digest = request.object_hash();
    if account.head == digest {
        // The request is already committed.
        return AdmissionOutcome::Duplicate;
    }

    match reservations.can_acquire(schema, &origin, &digest, current_epoch) {
        Acquire::Available => {}
        Acquire::Duplicate if allow_duplicates => {}
        Acquire::Duplicate => return AdmissionOutcome::Duplicate,
        Acquire::Conflict => return AdmissionOutcome::Reserved,
    }

    if request.previous() != account.head {
        return AdmissionOutcome::Invalid(InvalidReason::WrongPrevious);
    }

    if let Err(reason) = validate_payload(schema, request, &account) {
        return AdmissionOutcome::Invalid(reason);
    }
    AdmissionOutcome::Progress
}

fn validate_payload<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    request: &Request,
    account: &Account,
) -> Result<(), InvalidReason> {
    let origin = request.origin();
    let mut debit = request.fee();

    if let Payload::Send { transactions } = &request.payload {
        if transactions.is_empty() {
            return Err(InvalidReason::NoTransactions);
        }
        if transactions.len() > MAX_SEND_TRANSACTIONS {
            return Err(InvalidReason::TooManyTransactions);
        }
        if transactions.iter().all(|tx| tx.destination == origin) {
            return Err(InvalidReason::SelfTargetOnly);
        }
        for tx in transactions.iter().filter(|tx| tx.destination != origin) {
            debit = debit
                .checked_add(tx.amount)
                .ok_or(InvalidReason::InsufficientBalance)?;
        }
    }

    if account.balance.checked_sub(debit).is_none() {
        return Err(InvalidReason::InsufficientBalance);
    }

    token::validate(schema, request)
}

/// Validates a request-block proposal on a backup.
///
/// On success the reservations of all contained requests are taken, exactly
/// as if each request had arrived through admission.
pub fn validate_block<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    reservations: &mut Reservations,
    block: &RequestBlock,
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

    let tip = schema.request_tip(block.primary);
    let (expected_sequence, expected_previous) = if tip.is_empty() || tip.epoch < block.epoch {
        (0, trilith_crypto::Hash::zero())
    } else if tip.epoch == block.epoch {
        (tip.sequence + 1, tip.digest)
    } else {
        return Err(ValidationRejection::new(RejectionReason::InvalidEpoch));
    };
    if block.previous != expected_previous {
        return Err(ValidationRejection::new(RejectionReason::InvalidPreviousHash));
    }
    if block.sequence != expected_sequence {
        return Err(ValidationRejection::new(RejectionReason::WrongSequenceNumber));
    }

    let mut invalid = BitVec::from_elem(block.requests.len(), false);
    let mut any_invalid = false;
    for (i, request) in block.requests.iter().enumerate() {
        let outcome = validate(schema, reservations, request, current_epoch, true);
        if outcome != AdmissionOutcome::Progress {
            warn!("request {} of proposal rejected: {}", i, outcome);
            invalid.set(i, true);
            any_invalid = true;
        }
    }
    if any_invalid {
        return Err(ValidationRejection::invalid_requests(invalid));
    }

    for request in &block.requests {
        reservations.update(request.origin(), request.object_hash(), current_epoch);
    }
    Ok(())
}

/// Applies a post-committed request block to the fork and releases the
/// reservations of its requests.
///
/// Application is infallible by construction: every request was validated
/// before the block reached quorum. A request that still cannot be applied
/// is skipped with a warning rather than poisoning the block.
pub fn apply(fork: &mut Fork, block: &RequestBlock, reservations: &mut Reservations) {
    let block_hash = block.object_hash();
    let mut schema = LedgerSchema::new(fork);
    let mut fee_pool = schema.fee_pool();

    for request in &block.requests {
        apply_request(&mut schema, request, block.epoch);
        fee_pool = fee_pool
            .checked_add(request.fee())
            .unwrap_or(fee_pool);
        schema.remove_reservation(&request.origin());
        reservations.release(&request.origin());
    }

    schema.put_fee_pool(fee_pool);
    schema.put_request_block(&block_hash, block);
}

fn apply_request(schema: &mut LedgerSchema<&mut Fork>, request: &Request, epoch: Epoch) {
    let origin = request.origin();
    let digest = request.object_hash();

    let mut account = match schema.account(&origin) {
        Some(account) => account,
        None => {
            warn!("skipping request {} from unknown account {}", digest, origin);
            return;
        }
    };

    // Debit the origin once: amounts of non-self transactions plus the fee.
    let mut debit = request.fee();
    if let Payload::Send { transactions } = &request.payload {
        for tx in transactions.iter().filter(|tx| tx.destination != origin) {
            debit = match debit.checked_add(tx.amount) {
                Some(sum) => sum,
                None => {
                    warn!("skipping request {}: amount overflow", digest);
                    return;
                }
            };
        }
    }
    account.balance = match account.balance.checked_sub(debit) {
        Some(balance) => balance,
        None => {
            warn!("skipping request {}: balance underflow", digest);
            return;
        }
    };
    account.head = digest;
    account.block_count += 1;
    if let Payload::ChangeRepresentative { representative } = &request.payload {
        account.representative = *representative;
    }
    schema.put_account(&origin, &account);

    // Credit each non-self destination and append the receive half to its
    // receive chain, in transaction order.
    if let Payload::Send { transactions } = &request.payload {
        for (index, tx) in transactions
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.destination != origin)
        {
            let mut destination = schema
                .account(&tx.destination)
                .unwrap_or_else(|| Account::open(Amount::ZERO, epoch));
            destination.balance = match destination.balance.checked_add(tx.amount) {
                Some(balance) => balance,
                None => {
                    warn!(
                        "dropping credit {}:{}: destination balance overflow",
                        digest, index
                    );
                    continue;
                }
            };
            let record = ReceiveRecord {
                send_hash: digest,
                transaction_index: index as u16,
                source: origin,
                amount: tx.amount,
                previous: destination.receive_head,
            };
            destination.receive_head = record.digest();
            destination.receive_count += 1;
            schema.put_receive_record(&record);
            schema.put_account(&tx.destination, &destination);
        }
    }

    token::apply(schema.fork(), request, epoch);
}
