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

//! The request pipeline: admission, batching and the secondary waiting
//! list.
//!
//! The pending set is held under two indices: an insertion-ordered queue
//! for draining batches and a hash-keyed map for deduplication and restore.
//! The pair encodes request state across re-proposals: a hash present in
//! both indices is queued, present only in the map is in flight in the
//! current batch, and absent from both is committed.

use log::trace;

use std::collections::{HashMap, VecDeque};

use trilith::{
    blocks::RequestBlock,
    constants::BATCH_SIZE,
    persistence::{request as request_persistence, reservations::Reservations, AdmissionOutcome},
    requests::Request,
    schema::{LedgerSchema, SchemaAccess},
    types::Epoch,
};
use trilith_crypto::{Hash, ObjectHash};

/// The admission and batching pipeline of request consensus.
#[derive(Debug, Default)]
pub struct RequestPipeline {
    queue: VecDeque<Hash>,
    by_hash: HashMap<Hash, Request>,
    buffering: bool,
    buffered: Vec<Request>,
}

impl RequestPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a request: validates it, takes the origin's reservation and
    /// enqueues it for the next batch.
    pub fn submit<A: SchemaAccess>(
        &mut self,
        schema: &LedgerSchema<A>,
        reservations: &mut Reservations,
        request: Request,
        current_epoch: Epoch,
    ) -> AdmissionOutcome {
        let hash = request.object_hash();
        if self.by_hash.contains_key(&hash) {
            return AdmissionOutcome::Duplicate;
        }

        let outcome =
            request_persistence::validate_and_reserve(schema, reservations, &request, current_epoch);
        if outcome != AdmissionOutcome::Progress {
            return outcome;
        }

        if self.buffering {
            self.buffered.push(request);
            return AdmissionOutcome::Buffered;
        }
        trace!("queueing request {}", hash);
        self.queue.push_back(hash);
        self.by_hash.insert(hash, request);
        AdmissionOutcome::Progress
    }

    /// Switches the pipeline into buffered admission; submissions are
    /// parked until [`buffer_complete`](Self::buffer_complete).
    pub fn start_buffering(&mut self) {
        self.buffering = true;
    }

    /// Flushes buffered submissions into the queue, in admission order.
    pub fn buffer_complete(&mut self) {
        self.buffering = false;
        for request in self.buffered.drain(..) {
            let hash = request.object_hash();
            self.queue.push_back(hash);
            self.by_hash.insert(hash, request);
        }
    }

    /// Drains up to [`BATCH_SIZE`] requests in FIFO order, re-checking that
    /// each is still applicable. Requests whose applicability changed since
    /// admission are dropped. Drained requests stay in the hash index until
    /// the batch commits or is restored.
    pub fn prepare_next_batch<A: SchemaAccess>(
        &mut self,
        schema: &LedgerSchema<A>,
        reservations: &mut Reservations,
        current_epoch: Epoch,
    ) -> Vec<Request> {
        let mut batch = Vec::new();
        while batch.len() < BATCH_SIZE {
            let hash = match self.queue.pop_front() {
                Some(hash) => hash,
                None => break,
            };
            let request = match self.by_hash.get(&hash) {
                Some(request) => request.clone(),
                None => continue,
            };
            let outcome =
                request_persistence::validate(schema, reservations, &request, current_epoch, true);
            if outcome == AdmissionOutcome::Progress {
                batch.push(request);
            } else {
                trace!("dropping stale request {}: {}", hash, outcome);
                self.by_hash.remove(&hash);
            }
        }
        batch
    }

    /// Restores the uncommitted requests of a batch to the head of the
    /// queue, preserving their order. Used when a proposal is re-proposed or
    /// abandoned.
    pub fn insert_front(&mut self, requests: &[Request]) {
        for request in requests.iter().rev() {
            let hash = request.object_hash();
            self.by_hash.entry(hash).or_insert_with(|| request.clone());
            if !self.queue.contains(&hash) {
                self.queue.push_front(hash);
            }
        }
    }

    /// Re-registers the requests of a foreign batch this pipeline has not
    /// seen, so a later re-proposal can pick them up.
    pub fn acquire(&mut self, block: &RequestBlock) {
        for request in &block.requests {
            let hash = request.object_hash();
            if !self.by_hash.contains_key(&hash) {
                self.by_hash.insert(hash, request.clone());
                self.queue.push_back(hash);
            }
        }
    }

    /// Clears the requests of a committed block from both indices.
    pub fn on_post_commit(&mut self, block: &RequestBlock) {
        for request in &block.requests {
            let hash = request.object_hash();
            if self.by_hash.remove(&hash).is_some() {
                self.queue.retain(|queued| *queued != hash);
            }
        }
    }

    /// Drops one request from both indices (e.g. after the committee
    /// rejected it as invalid).
    pub fn discard(&mut self, hash: &Hash) {
        if self.by_hash.remove(hash).is_some() {
            self.queue.retain(|queued| queued != hash);
        }
    }

    /// Returns `true` if the request is queued or in flight.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Number of queued requests.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The secondary waiting list.
///
/// A backup that receives a request directly holds it here with a sampled
/// expiration. If the expiration fires and the request was still not seen
/// in any proposal, the backup promotes itself and proposes the request —
/// a bounded stand-in for an unresponsive primary. Expiration timers are
/// armed by the consensus manager; the list itself only tracks membership.
#[derive(Debug, Default)]
pub struct WaitingList {
    entries: HashMap<Hash, Request>,
}

impl WaitingList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a request. Returns `false` if it is already waiting.
    pub fn insert(&mut self, request: Request) -> bool {
        let hash = request.object_hash();
        self.entries.insert(hash, request).is_none()
    }

    /// Returns `true` if the request is waiting.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Takes a request out on expiry; `None` if it was pruned meanwhile.
    pub fn take(&mut self, hash: &Hash) -> Option<Request> {
        self.entries.remove(hash)
    }

    /// Prunes every request contained in an observed proposal: the primary
    /// is alive and has them in flight.
    pub fn prune_proposal(&mut self, block: &RequestBlock) {
        for request in &block.requests {
            self.entries.remove(&request.object_hash());
        }
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith::{
        account::Account,
        constants::MIN_TRANSACTION_FEE,
        requests::Transaction,
        types::{AccountAddress, Amount, DelegateId},
    };
    use trilith_crypto::account::AccountKeyPair;
    use trilith_storage::{Database, TemporaryDB};

    struct Fixture {
        db: TemporaryDB,
        keys: Vec<AccountKeyPair>,
    }

    impl Fixture {
        fn new(accounts: usize) -> Self {
            let db = TemporaryDB::new();
            let keys: Vec<_> = (0..accounts)
                .map(|i| AccountKeyPair::from_seed(&[17 + i as u8; 32]))
                .collect();
            let mut fork = db.fork();
            let mut schema = LedgerSchema::new(&mut fork);
            for key in &keys {
                schema.put_account(
                    &AccountAddress(key.address()),
                    &Account::open(Amount(100 * MIN_TRANSACTION_FEE), 0),
                );
            }
            db.merge(fork.into_patch()).unwrap();
            Self { db, keys }
        }

        fn send(&self, account: usize, amount: u128) -> Request {
            let mut request = Request::send(
                AccountAddress(self.keys[account].address()),
                Hash::zero(),
                Amount(MIN_TRANSACTION_FEE),
                vec![Transaction::new(AccountAddress([99; 32]), Amount(amount))],
            );
            request.sign(&self.keys[account]);
            request
        }
    }

    #[test]
    fn submit_then_duplicate() {
        let fixture = Fixture::new(1);
        let mut pipeline = RequestPipeline::new();
        let mut reservations = Reservations::new();
        let request = fixture.send(0, 1);

        let snapshot = fixture.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(
            pipeline.submit(&schema, &mut reservations, request.clone(), 1),
            AdmissionOutcome::Progress
        );
        assert_eq!(
            pipeline.submit(&schema, &mut reservations, request, 1),
            AdmissionOutcome::Duplicate
        );
        assert_eq!(pipeline.queued_len(), 1);
    }

    #[test]
    fn batch_preserves_fifo_order_and_leaves_requests_in_flight() {
        let fixture = Fixture::new(3);
        let mut pipeline = RequestPipeline::new();
        let mut reservations = Reservations::new();

        let snapshot = fixture.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let requests: Vec<_> = (0..3).map(|i| fixture.send(i, i as u128 + 1)).collect();
        for request in &requests {
            pipeline.submit(&schema, &mut reservations, request.clone(), 1);
        }

        let batch = pipeline.prepare_next_batch(&schema, &mut reservations, 1);
        assert_eq!(batch, requests);
        assert!(pipeline.is_empty());
        // Still known while in flight.
        assert!(pipeline.contains(&requests[0].object_hash()));

        // Restoring puts them back at the front in order.
        pipeline.insert_front(&batch);
        let again = pipeline.prepare_next_batch(&schema, &mut reservations, 1);
        assert_eq!(again, requests);
    }

    #[test]
    fn post_commit_clears_both_indices() {
        let fixture = Fixture::new(1);
        let mut pipeline = RequestPipeline::new();
        let mut reservations = Reservations::new();
        let request = fixture.send(0, 1);

        let snapshot = fixture.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        pipeline.submit(&schema, &mut reservations, request.clone(), 1);

        let block = RequestBlock::new(
            Hash::zero(),
            1,
            0,
            0,
            DelegateId(0),
            vec![request.clone()],
        );
        pipeline.on_post_commit(&block);
        assert!(!pipeline.contains(&request.object_hash()));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn buffered_admission_flushes_in_order() {
        let fixture = Fixture::new(2);
        let mut pipeline = RequestPipeline::new();
        let mut reservations = Reservations::new();

        let snapshot = fixture.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        pipeline.start_buffering();
        let first = fixture.send(0, 1);
        let second = fixture.send(1, 2);
        assert_eq!(
            pipeline.submit(&schema, &mut reservations, first.clone(), 1),
            AdmissionOutcome::Buffered
        );
        assert_eq!(
            pipeline.submit(&schema, &mut reservations, second.clone(), 1),
            AdmissionOutcome::Buffered
        );
        assert!(pipeline.is_empty());

        pipeline.buffer_complete();
        let batch = pipeline.prepare_next_batch(&schema, &mut reservations, 1);
        assert_eq!(batch, vec![first, second]);
    }

    #[test]
    fn waiting_list_prunes_observed_proposals() {
        let fixture = Fixture::new(1);
        let request = fixture.send(0, 1);
        let hash = request.object_hash();

        let mut list = WaitingList::new();
        assert!(list.insert(request.clone()));
        assert!(!list.insert(request.clone()));
        assert!(list.contains(&hash));

        let block = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(2), vec![request]);
        list.prune_proposal(&block);
        assert!(!list.contains(&hash));
        assert_eq!(list.take(&hash), None);
    }
}
