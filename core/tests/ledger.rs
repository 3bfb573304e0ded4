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

//! End-to-end tests of the persistence layer: account application rules,
//! reservations, and the validation/application cycle of all three chains.

use pretty_assertions::assert_eq;

use std::time::Duration;

use trilith::{
    account::Account,
    blocks::{DelegateInfo, RequestBlock},
    constants::{CLOCK_DRIFT, MIN_TRANSACTION_FEE, NUM_DELEGATES, RESERVATION_PERIOD},
    genesis::{initialize, GenesisAccount, GenesisConfig},
    persistence::{
        epoch as epoch_persistence, micro as micro_persistence, request as request_persistence,
        reservations::Reservations, AdmissionOutcome, InvalidReason, RejectionReason,
    },
    requests::{Request, Transaction},
    schema::LedgerSchema,
    types::{AccountAddress, Amount, DelegateId},
};
use trilith_crypto::{account::AccountKeyPair, bls::BlsKeyPair, Hash, ObjectHash};
use trilith_storage::{Database, TemporaryDB};

fn delegates(seed: u8) -> Vec<DelegateInfo> {
    (0..NUM_DELEGATES)
        .map(|i| DelegateInfo {
            account: AccountAddress([i as u8 + 1; 32]),
            bls_key: BlsKeyPair::from_seed(&[seed.wrapping_add(i as u8 + 1); 32]).public_key(),
            vote_weight: Amount(1),
            stake: Amount(1_000),
        })
        .collect()
}

fn open_account(db: &TemporaryDB, address: AccountAddress, balance: Amount) {
    let mut fork = db.fork();
    let mut schema = LedgerSchema::new(&mut fork);
    schema.put_account(&address, &Account::open(balance, 0));
    db.merge(fork.into_patch()).unwrap();
}

fn apply_block(db: &TemporaryDB, block: &RequestBlock, reservations: &mut Reservations) {
    let mut fork = db.fork();
    request_persistence::apply(&mut fork, block, reservations);
    db.merge(fork.into_patch()).unwrap();
}

fn balance_of(db: &TemporaryDB, address: &AccountAddress) -> Amount {
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    schema
        .account(address)
        .map(|account| account.balance)
        .unwrap_or_default()
}

#[test]
fn self_send_is_dropped_but_other_transactions_apply() {
    let db = TemporaryDB::new();
    let a = AccountAddress([11; 32]);
    let b = AccountAddress([34; 32]);
    open_account(&db, a, Amount(100));

    // A sends 5 to B and 5 to itself; only the A -> B half applies.
    let send = Request::send(
        a,
        Hash::zero(),
        Amount::ZERO,
        vec![
            Transaction::new(a, Amount(5)),
            Transaction::new(b, Amount(5)),
        ],
    );
    let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![send]);
    apply_block(&db, &block, &mut Reservations::new());

    assert_eq!(balance_of(&db, &a), Amount(95));
    assert_eq!(balance_of(&db, &b), Amount(5));

    // The receive chain of B records exactly one credit.
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    let account_b = schema.account(&b).unwrap();
    assert_eq!(account_b.receive_count, 1);
    assert!(!account_b.receive_head.is_zero());
}

#[test]
fn self_send_cannot_overflow_a_full_balance() {
    let db = TemporaryDB::new();
    let c = AccountAddress([42; 32]);
    open_account(&db, c, Amount(u128::MAX));

    let send = Request::send(
        c,
        Hash::zero(),
        Amount::ZERO,
        vec![Transaction::new(c, Amount(100_000))],
    );
    let digest = send.object_hash();
    let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![send]);
    apply_block(&db, &block, &mut Reservations::new());

    assert_eq!(balance_of(&db, &c), Amount(u128::MAX));
    // The request itself still committed (head advanced).
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    assert_eq!(schema.account(&c).unwrap().head, digest);
}

#[test]
fn all_self_targets_is_rejected_at_validation() {
    let db = TemporaryDB::new();
    let keys = AccountKeyPair::from_seed(&[9; 32]);
    let a = AccountAddress(keys.address());
    open_account(&db, a, Amount(10 * MIN_TRANSACTION_FEE));

    let mut send = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(a, Amount(5))],
    );
    send.sign(&keys);

    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    let outcome = request_persistence::validate_and_reserve(
        &schema,
        &mut Reservations::new(),
        &send,
        1,
    );
    assert_eq!(
        outcome,
        AdmissionOutcome::Invalid(InvalidReason::SelfTargetOnly)
    );
}

#[test]
fn reservation_conflict_until_commit() {
    let db = TemporaryDB::new();
    let keys = AccountKeyPair::from_seed(&[7; 32]);
    let a = AccountAddress(keys.address());
    let b = AccountAddress([2; 32]);
    open_account(&db, a, Amount(100 * MIN_TRANSACTION_FEE));

    let mut r1 = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(b, Amount(5))],
    );
    r1.sign(&keys);
    let mut r2 = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(b, Amount(6))],
    );
    r2.sign(&keys);
    assert_ne!(r1.object_hash(), r2.object_hash());

    let mut reservations = Reservations::new();
    {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(
            request_persistence::validate_and_reserve(&schema, &mut reservations, &r1, 1),
            AdmissionOutcome::Progress
        );
        // A different request from the same origin conflicts.
        assert_eq!(
            request_persistence::validate_and_reserve(&schema, &mut reservations, &r2, 1),
            AdmissionOutcome::Reserved
        );
    }

    // After committing R1, R2 becomes admissible (with updated previous).
    let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![r1.clone()]);
    apply_block(&db, &block, &mut reservations);

    let mut r2 = Request::send(
        a,
        r1.object_hash(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(b, Amount(6))],
    );
    r2.sign(&keys);
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    assert_eq!(
        request_persistence::validate_and_reserve(&schema, &mut reservations, &r2, 1),
        AdmissionOutcome::Progress
    );
}

#[test]
fn resubmission_is_a_duplicate_before_and_after_commit() {
    let db = TemporaryDB::new();
    let keys = AccountKeyPair::from_seed(&[8; 32]);
    let a = AccountAddress(keys.address());
    open_account(&db, a, Amount(100 * MIN_TRANSACTION_FEE));

    let mut r1 = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(AccountAddress([3; 32]), Amount(5))],
    );
    r1.sign(&keys);

    let mut reservations = Reservations::new();
    {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(
            request_persistence::validate_and_reserve(&schema, &mut reservations, &r1, 1),
            AdmissionOutcome::Progress
        );
        assert_eq!(
            request_persistence::validate_and_reserve(&schema, &mut reservations, &r1, 1),
            AdmissionOutcome::Duplicate
        );
    }

    let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![r1.clone()]);
    apply_block(&db, &block, &mut reservations);

    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    assert_eq!(
        request_persistence::validate_and_reserve(&schema, &mut reservations, &r1, 1),
        AdmissionOutcome::Duplicate
    );
}

#[test]
fn reservations_expire_after_two_epochs() {
    let db = TemporaryDB::new();
    let keys = AccountKeyPair::from_seed(&[6; 32]);
    let a = AccountAddress(keys.address());
    open_account(&db, a, Amount(100 * MIN_TRANSACTION_FEE));

    let mut r1 = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(AccountAddress([3; 32]), Amount(5))],
    );
    r1.sign(&keys);
    let mut r2 = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(AccountAddress([3; 32]), Amount(6))],
    );
    r2.sign(&keys);

    let mut reservations = Reservations::new();
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    assert_eq!(
        request_persistence::validate_and_reserve(&schema, &mut reservations, &r1, 1),
        AdmissionOutcome::Progress
    );
    assert_eq!(
        request_persistence::validate_and_reserve(&schema, &mut reservations, &r2, 1),
        AdmissionOutcome::Reserved
    );
    // The reservation taken in epoch 1 no longer binds in epoch 3.
    assert_eq!(
        request_persistence::validate_and_reserve(
            &schema,
            &mut reservations,
            &r2,
            1 + RESERVATION_PERIOD
        ),
        AdmissionOutcome::Progress
    );
}

#[test]
fn receive_entries_preserve_send_order() {
    let db = TemporaryDB::new();
    let a = AccountAddress([1; 32]);
    let b = AccountAddress([2; 32]);
    open_account(&db, a, Amount(1_000));

    let send = Request::send(
        a,
        Hash::zero(),
        Amount::ZERO,
        vec![
            Transaction::new(b, Amount(1)),
            Transaction::new(b, Amount(2)),
            Transaction::new(b, Amount(3)),
        ],
    );
    let digest = send.object_hash();
    let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![send]);
    apply_block(&db, &block, &mut Reservations::new());

    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    let account_b = schema.account(&b).unwrap();
    assert_eq!(account_b.balance, Amount(6));
    assert_eq!(account_b.receive_count, 3);

    // Walk the receive chain backwards: entries come out newest first, in
    // reverse transaction order.
    let head = schema.receive_record(&digest, 2).unwrap();
    assert_eq!(account_b.receive_head, head.digest());
    let middle = schema.receive_record(&digest, 1).unwrap();
    assert_eq!(head.previous, middle.digest());
    let first = schema.receive_record(&digest, 0).unwrap();
    assert_eq!(middle.previous, first.digest());
    assert_eq!(first.previous, Hash::zero());
    assert_eq!(first.amount, Amount(1));
}

#[test]
fn block_validation_rejects_drift_sequence_and_bad_requests() {
    let db = TemporaryDB::new();
    let keys = AccountKeyPair::from_seed(&[4; 32]);
    let a = AccountAddress(keys.address());
    open_account(&db, a, Amount(100 * MIN_TRANSACTION_FEE));

    let mut good = Request::send(
        a,
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(AccountAddress([3; 32]), Amount(5))],
    );
    good.sign(&keys);
    // Unsigned request: fails validation inside the batch.
    let bad = Request::send(
        AccountAddress([5; 32]),
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(AccountAddress([3; 32]), Amount(5))],
    );

    let now_ms = 1_000_000;
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);

    // Clock drift.
    let block = RequestBlock::new(
        Hash::zero(),
        1,
        0,
        now_ms + CLOCK_DRIFT.as_millis() as u64 + 1,
        DelegateId(0),
        vec![good.clone()],
    );
    let rejection = request_persistence::validate_block(
        &schema,
        &mut Reservations::new(),
        &block,
        now_ms,
        1,
        CLOCK_DRIFT,
    )
    .unwrap_err();
    assert_eq!(rejection.reason, RejectionReason::ClockDrift);

    // Wrong sequence.
    let block = RequestBlock::new(Hash::zero(), 1, 3, now_ms, DelegateId(0), vec![good.clone()]);
    let rejection = request_persistence::validate_block(
        &schema,
        &mut Reservations::new(),
        &block,
        now_ms,
        1,
        CLOCK_DRIFT,
    )
    .unwrap_err();
    assert_eq!(rejection.reason, RejectionReason::WrongSequenceNumber);

    // Epoch ahead.
    let block = RequestBlock::new(Hash::zero(), 2, 0, now_ms, DelegateId(0), vec![good.clone()]);
    let rejection = request_persistence::validate_block(
        &schema,
        &mut Reservations::new(),
        &block,
        now_ms,
        1,
        CLOCK_DRIFT,
    )
    .unwrap_err();
    assert_eq!(rejection.reason, RejectionReason::NewEpoch);

    // Invalid request inside the batch: the bitmap names the offender.
    let block = RequestBlock::new(
        Hash::zero(),
        1,
        0,
        now_ms,
        DelegateId(0),
        vec![good.clone(), bad],
    );
    let rejection = request_persistence::validate_block(
        &schema,
        &mut Reservations::new(),
        &block,
        now_ms,
        1,
        CLOCK_DRIFT,
    )
    .unwrap_err();
    assert_eq!(rejection.reason, RejectionReason::ContainsInvalidRequest);
    assert_eq!(rejection.invalid_requests.get(0), Some(false));
    assert_eq!(rejection.invalid_requests.get(1), Some(true));

    // A clean batch validates.
    let block = RequestBlock::new(Hash::zero(), 1, 0, now_ms, DelegateId(0), vec![good]);
    request_persistence::validate_block(
        &schema,
        &mut Reservations::new(),
        &block,
        now_ms,
        1,
        CLOCK_DRIFT,
    )
    .unwrap();
}

#[test]
fn micro_chain_grows_and_rolls_over_epochs() {
    let db = TemporaryDB::new();
    let a = AccountAddress([1; 32]);
    open_account(&db, a, Amount(100));

    // Commit one request block so delegate 0's tip is non-empty.
    let send = Request::send(
        a,
        Hash::zero(),
        Amount::ZERO,
        vec![Transaction::new(AccountAddress([2; 32]), Amount(1))],
    );
    let request_block = RequestBlock::new(Hash::zero(), 1, 0, 500, DelegateId(0), vec![send]);
    apply_block(&db, &request_block, &mut Reservations::new());

    let now_ms = 1_000;
    let drift = Duration::from_secs(8 * 60 + 20);

    // First micro block of epoch 1.
    let first = {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let block = micro_persistence::build(&schema, 1, now_ms, DelegateId(0), false);
        micro_persistence::validate_block(&schema, &block, now_ms, 1, drift).unwrap();
        block
    };
    assert_eq!(first.sequence, 0);
    assert!(first.previous.is_zero());
    assert_eq!(first.tips.len(), NUM_DELEGATES);
    assert_eq!(first.tips[0].digest, request_block.object_hash());

    let mut fork = db.fork();
    micro_persistence::apply(&mut fork, &first);
    db.merge(fork.into_patch()).unwrap();

    // Closing micro block of epoch 1.
    let last = {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let block = micro_persistence::build(&schema, 1, now_ms + 1, DelegateId(0), true);
        micro_persistence::validate_block(&schema, &block, now_ms + 1, 1, drift).unwrap();
        block
    };
    assert_eq!(last.sequence, 1);
    assert_eq!(last.previous, first.object_hash());

    let mut fork = db.fork();
    micro_persistence::apply(&mut fork, &last);
    db.merge(fork.into_patch()).unwrap();

    // The next cut must open epoch 2 at sequence 0.
    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    let next = micro_persistence::build(&schema, 2, now_ms + 2, DelegateId(1), false);
    assert_eq!(next.sequence, 0);
    assert_eq!(next.previous, last.object_hash());
    micro_persistence::validate_block(&schema, &next, now_ms + 2, 2, drift).unwrap();

    // Staying in epoch 1 after a closing block is rejected.
    let stale = trilith::blocks::MicroBlock::new(
        last.object_hash(),
        1,
        2,
        now_ms + 2,
        DelegateId(1),
        false,
        schema.request_tips(),
    );
    let rejection =
        micro_persistence::validate_block(&schema, &stale, now_ms + 2, 1, drift).unwrap_err();
    assert_eq!(rejection.reason, RejectionReason::InvalidEpoch);
}

#[test]
fn epoch_block_rotates_the_committee_two_epochs_ahead() {
    let db = TemporaryDB::new();
    let config = GenesisConfig {
        accounts: vec![GenesisAccount {
            address: AccountAddress([1; 32]),
            balance: Amount(1_000),
        }],
        delegates: delegates(1),
        timestamp: 0,
    };
    initialize(&db, &config).unwrap();

    let now_ms = 10_000;
    let drift = Duration::from_secs(8 * 60 + 20);

    // Seal epoch 1 with a closing micro block.
    let closing = {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        micro_persistence::build(&schema, 1, now_ms, DelegateId(0), true)
    };
    let mut fork = db.fork();
    micro_persistence::apply(&mut fork, &closing);
    db.merge(fork.into_patch()).unwrap();

    let next_committee = delegates(2);
    let block = {
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let block = epoch_persistence::build(
            &schema,
            1,
            now_ms,
            DelegateId(0),
            next_committee.clone(),
        );
        epoch_persistence::validate_block(&schema, &block, now_ms, 1, drift).unwrap();
        block
    };

    let mut fork = db.fork();
    epoch_persistence::apply(&mut fork, &block);
    db.merge(fork.into_patch()).unwrap();

    let snapshot = db.snapshot();
    let schema = LedgerSchema::new(&*snapshot);
    assert_eq!(schema.epoch_tip().epoch, 1);
    // Epochs 2 (genesis carry-over) and 3 (elected here) are both known.
    assert_eq!(schema.delegates(2).unwrap(), config.delegates);
    assert_eq!(schema.delegates(3).unwrap(), next_committee);
}
