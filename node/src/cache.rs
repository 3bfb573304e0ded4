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

//! The pending-block cache and the writer domain.
//!
//! Post-committed blocks may arrive out of order: a request block before its
//! parent, a micro block before the request blocks its tips name, an epoch
//! block before its sealing micro block. The cache parks such blocks,
//! indexed by the dependency that blocks them, and releases them in
//! topological order once the dependency is written.
//!
//! Exactly one writer owns the cache and the store's write path. Producers
//! (consensus engines, bootstrap, peer intake) enqueue candidates through a
//! bounded queue and never block on storage.

use log::{debug, warn};
use tokio::sync::mpsc;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};

use trilith::{
    blocks::Block,
    persistence::{
        epoch as epoch_persistence, micro as micro_persistence, request as request_persistence,
        reservations::Reservations,
    },
    schema::LedgerSchema,
    types::{AccountAddress, DelegateId, Epoch},
};
use trilith_crypto::{Hash, ObjectHash};
use trilith_storage::Database;

/// Capacity of the writer's intake queue; enqueueing past it applies
/// backpressure to producers.
const WRITE_QUEUE_CAPACITY: usize = 1024;

/// What blocks a parked block from being written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Dependency {
    /// A block with this digest must be stored first.
    Block(Hash),
    /// This account's head must advance first (a request in the parked
    /// block chains onto a send the writer has not applied yet).
    Account(AccountAddress),
}

/// Bookkeeping of one epoch's parked blocks.
#[derive(Debug, Default)]
struct EpochPeriod {
    epoch_block: Option<Hash>,
    micro_blocks: Vec<Hash>,
    request_blocks: HashMap<DelegateId, Vec<Hash>>,
}

/// The forest of parked blocks plus its wake-up indices.
pub struct PendingBlockContainer {
    db: Arc<dyn Database>,
    reservations: Arc<Mutex<Reservations>>,
    epochs: BTreeMap<Epoch, EpochPeriod>,
    parked: HashMap<Hash, Block>,
    waiters: HashMap<Dependency, Vec<Hash>>,
    cached: Arc<RwLock<HashSet<Hash>>>,
}

impl std::fmt::Debug for PendingBlockContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBlockContainer")
            .field("parked", &self.parked.len())
            .field("epochs", &self.epochs.len())
            .finish()
    }
}

impl PendingBlockContainer {
    /// Creates an empty container over the store.
    pub fn new(db: Arc<dyn Database>, reservations: Arc<Mutex<Reservations>>) -> Self {
        Self {
            db,
            reservations,
            epochs: BTreeMap::new(),
            parked: HashMap::new(),
            waiters: HashMap::new(),
            cached: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Shared view answering [`CacheHandle::is_cached`] queries.
    pub fn cached_view(&self) -> Arc<RwLock<HashSet<Hash>>> {
        Arc::clone(&self.cached)
    }

    /// Accepts a validated block: writes it immediately if all its
    /// dependencies are storable, parks it otherwise. Returns the digests
    /// written, in write order.
    pub fn add(&mut self, block: Block) -> Vec<Hash> {
        let hash = block.object_hash();
        if self.is_stored(&hash) || self.parked.contains_key(&hash) {
            debug!("ignoring block {} seen before", hash);
            return Vec::new();
        }

        let missing = self.unmet_dependencies(&block);
        if !missing.is_empty() {
            self.park(hash, block, missing);
            return Vec::new();
        }

        let mut written = vec![];
        self.write(&hash, &block);
        written.push(hash);
        self.release_dependents(&block, &hash, &mut written);
        written
    }

    fn is_stored(&self, hash: &Hash) -> bool {
        let snapshot = self.db.snapshot();
        LedgerSchema::new(&*snapshot).contains_block(hash)
    }

    fn unmet_dependencies(&self, block: &Block) -> Vec<Dependency> {
        let snapshot = self.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let mut missing = Vec::new();

        let mut need_block = |missing: &mut Vec<Dependency>, digest: Hash| {
            if !digest.is_zero() && !schema.contains_block(&digest) {
                missing.push(Dependency::Block(digest));
            }
        };

        match block {
            Block::Request(rb) => {
                need_block(&mut missing, rb.previous);
                for request in &rb.requests {
                    // A request chained onto an unapplied send waits on its
                    // account, not on a specific block.
                    let head = schema
                        .account(&request.origin())
                        .map(|account| account.head)
                        .unwrap_or_else(Hash::zero);
                    if request.previous() != head && !request.previous().is_zero() {
                        missing.push(Dependency::Account(request.origin()));
                    }
                }
            }
            Block::Micro(mb) => {
                need_block(&mut missing, mb.previous);
                for tip in &mb.tips {
                    need_block(&mut missing, tip.digest);
                }
            }
            Block::Epoch(eb) => {
                need_block(&mut missing, eb.previous);
                need_block(&mut missing, eb.micro_tip.digest);
            }
        }
        missing.sort();
        missing.dedup();
        missing
    }

    fn park(&mut self, hash: Hash, block: Block, missing: Vec<Dependency>) {
        debug!("parking block {} on {} dependencies", hash, missing.len());
        let period = self.epochs.entry(block.epoch()).or_insert_with(EpochPeriod::default);
        match &block {
            Block::Request(rb) => period
                .request_blocks
                .entry(rb.primary)
                .or_insert_with(Vec::new)
                .push(hash),
            Block::Micro(_) => period.micro_blocks.push(hash),
            Block::Epoch(_) => period.epoch_block = Some(hash),
        }
        for dependency in missing {
            self.waiters.entry(dependency).or_insert_with(Vec::new).push(hash);
        }
        self.parked.insert(hash, block);
        self.cached.write().expect("cache lock").insert(hash);
    }

    fn write(&mut self, hash: &Hash, block: &Block) {
        let mut fork = self.db.fork();
        match block {
            Block::Request(rb) => {
                let mut reservations = self.reservations.lock().expect("reservations lock");
                request_persistence::apply(&mut fork, rb, &mut reservations);
            }
            Block::Micro(mb) => micro_persistence::apply(&mut fork, mb),
            Block::Epoch(eb) => epoch_persistence::apply(&mut fork, eb),
        }
        // A failed merge means the store is gone; nothing above the writer
        // can make progress without it.
        self.db
            .merge(fork.into_patch())
            .unwrap_or_else(|e| panic!("cannot write block {}: {}", hash, e));
        debug!("wrote {} block {}", block.kind(), hash);
    }

    /// After writing `hash`, releases every parked block whose dependencies
    /// are now all met, cascading.
    fn release_dependents(&mut self, block: &Block, hash: &Hash, written: &mut Vec<Hash>) {
        let mut woken: Vec<Hash> = Vec::new();
        if let Some(waiters) = self.waiters.remove(&Dependency::Block(*hash)) {
            woken.extend(waiters);
        }
        if let Block::Request(rb) = block {
            for request in &rb.requests {
                if let Some(waiters) = self.waiters.remove(&Dependency::Account(request.origin())) {
                    woken.extend(waiters);
                }
            }
        }

        for candidate in woken {
            let parked = match self.parked.get(&candidate) {
                Some(block) => block.clone(),
                None => continue,
            };
            let missing = self.unmet_dependencies(&parked);
            if !missing.is_empty() {
                // Still blocked; re-register the remaining edges.
                for dependency in missing {
                    let waiters = self.waiters.entry(dependency).or_insert_with(Vec::new);
                    if !waiters.contains(&candidate) {
                        waiters.push(candidate);
                    }
                }
                continue;
            }
            self.unpark(&candidate);
            self.write(&candidate, &parked);
            written.push(candidate);
            self.release_dependents(&parked, &candidate, written);
        }
    }

    fn unpark(&mut self, hash: &Hash) {
        let block = match self.parked.remove(hash) {
            Some(block) => block,
            None => return,
        };
        self.cached.write().expect("cache lock").remove(hash);
        if let Some(period) = self.epochs.get_mut(&block.epoch()) {
            match &block {
                Block::Request(rb) => {
                    if let Some(chain) = period.request_blocks.get_mut(&rb.primary) {
                        chain.retain(|parked| parked != hash);
                    }
                }
                Block::Micro(_) => period.micro_blocks.retain(|parked| parked != hash),
                Block::Epoch(_) => {
                    if period.epoch_block == Some(*hash) {
                        period.epoch_block = None;
                    }
                }
            }
        }
    }

    /// Returns `true` if the block is parked, waiting for dependencies.
    pub fn is_cached(&self, hash: &Hash) -> bool {
        self.parked.contains_key(hash)
    }

    /// Number of parked blocks.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

/// Producer-side handle to the writer domain.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    queue: mpsc::Sender<Block>,
    cached: Arc<RwLock<HashSet<Hash>>>,
}

impl CacheHandle {
    /// Enqueues a validated block for writing. Applies backpressure when
    /// the writer queue is full.
    pub async fn submit(&self, block: Block) {
        if self.queue.send(block).await.is_err() {
            warn!("writer is gone; dropping block");
        }
    }

    /// Blocking enqueue for non-async producers.
    pub fn submit_blocking(&self, block: Block) {
        if self.queue.blocking_send(block).is_err() {
            warn!("writer is gone; dropping block");
        }
    }

    /// Returns `true` if the block is parked in the cache.
    pub fn is_cached(&self, hash: &Hash) -> bool {
        self.cached.read().expect("cache lock").contains(hash)
    }
}

/// Spawns the writer task. Returns the producer handle and a channel of
/// committed blocks (driving the pipeline cleanup and the webhook).
pub fn spawn_writer(
    db: Arc<dyn Database>,
    reservations: Arc<Mutex<Reservations>>,
) -> (CacheHandle, mpsc::UnboundedReceiver<Block>) {
    let (queue_tx, mut queue_rx) = mpsc::channel::<Block>(WRITE_QUEUE_CAPACITY);
    let (committed_tx, committed_rx) = mpsc::unbounded_channel();

    let mut container = PendingBlockContainer::new(db, reservations);
    let handle = CacheHandle {
        queue: queue_tx,
        cached: container.cached_view(),
    };

    tokio::spawn(async move {
        while let Some(block) = queue_rx.recv().await {
            let lookup: HashMap<Hash, Block> = std::iter::once(&block)
                .map(|b| (b.object_hash(), b.clone()))
                .collect();
            for hash in container.add(block) {
                // Freshly released descendants are read back from the
                // parked copies; the direct block is at hand.
                if let Some(block) = lookup.get(&hash) {
                    let _ = committed_tx.send(block.clone());
                } else if let Some(block) = container.stored_block(&hash) {
                    let _ = committed_tx.send(block);
                }
            }
        }
        debug!("writer queue closed; writer exits");
    });

    (handle, committed_rx)
}

impl PendingBlockContainer {
    /// Reads a block back from the store after it was written.
    fn stored_block(&self, hash: &Hash) -> Option<Block> {
        let snapshot = self.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        schema
            .request_block(hash)
            .map(Block::Request)
            .or_else(|| schema.micro_block(hash).map(Block::Micro))
            .or_else(|| schema.epoch_block(hash).map(Block::Epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith::{
        account::Account,
        blocks::{MicroBlock, RequestBlock},
        constants::NUM_DELEGATES,
        requests::{Request, Transaction},
        tip::Tip,
        types::{AccountAddress, Amount},
    };
    use trilith_storage::TemporaryDB;

    fn container() -> (Arc<TemporaryDB>, PendingBlockContainer) {
        let db = Arc::new(TemporaryDB::new());
        let reservations = Arc::new(Mutex::new(Reservations::new()));
        let container = PendingBlockContainer::new(db.clone(), reservations);
        (db, container)
    }

    fn fund(db: &TemporaryDB, address: AccountAddress, balance: u128) {
        let mut fork = db.fork();
        let mut schema = LedgerSchema::new(&mut fork);
        schema.put_account(&address, &Account::open(Amount(balance), 0));
        db.merge(fork.into_patch()).unwrap();
    }

    #[test]
    fn out_of_order_request_blocks_release_in_order() {
        let (db, mut container) = container();
        let a = AccountAddress([1; 32]);
        fund(&db, a, 1_000);

        let send1 = Request::send(
            a,
            Hash::zero(),
            Amount::ZERO,
            vec![Transaction::new(AccountAddress([2; 32]), Amount(1))],
        );
        let b1 = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![send1.clone()]);
        let send2 = Request::send(
            a,
            send1.object_hash(),
            Amount::ZERO,
            vec![Transaction::new(AccountAddress([2; 32]), Amount(2))],
        );
        let b2 = RequestBlock::new(b1.object_hash(), 1, 1, 0, DelegateId(0), vec![send2]);

        // Child first: parked.
        let written = container.add(Block::Request(b2.clone()));
        assert!(written.is_empty());
        assert!(container.is_cached(&b2.object_hash()));

        // Parent arrives: both are written, parent first.
        let written = container.add(Block::Request(b1.clone()));
        assert_eq!(written, vec![b1.object_hash(), b2.object_hash()]);
        assert!(!container.is_cached(&b2.object_hash()));
        assert_eq!(container.parked_len(), 0);

        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(schema.account(&a).unwrap().balance, Amount(997));
        assert_eq!(schema.request_tip(DelegateId(0)).sequence, 1);
    }

    #[test]
    fn micro_block_waits_for_the_request_blocks_it_pins() {
        let (db, mut container) = container();
        let a = AccountAddress([1; 32]);
        fund(&db, a, 1_000);

        let send = Request::send(
            a,
            Hash::zero(),
            Amount::ZERO,
            vec![Transaction::new(AccountAddress([2; 32]), Amount(1))],
        );
        let rb = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(3), vec![send]);

        let mut tips = vec![Tip::empty(); NUM_DELEGATES];
        tips[3] = Tip::new(1, 0, rb.object_hash());
        let mb = MicroBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), false, tips);

        assert!(container.add(Block::Micro(mb.clone())).is_empty());
        assert!(container.is_cached(&mb.object_hash()));

        let written = container.add(Block::Request(rb.clone()));
        assert_eq!(written, vec![rb.object_hash(), mb.object_hash()]);

        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        assert_eq!(schema.micro_tip().digest, mb.object_hash());
    }

    #[test]
    fn request_block_waits_on_a_foreign_account_head() {
        let (db, mut container) = container();
        let a = AccountAddress([1; 32]);
        fund(&db, a, 1_000);

        // The send committed by delegate 0's chain...
        let send1 = Request::send(
            a,
            Hash::zero(),
            Amount::ZERO,
            vec![Transaction::new(AccountAddress([2; 32]), Amount(1))],
        );
        let b1 = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![send1.clone()]);

        // ...is the `previous` of a send batched by delegate 7.
        let send2 = Request::send(
            a,
            send1.object_hash(),
            Amount::ZERO,
            vec![Transaction::new(AccountAddress([2; 32]), Amount(2))],
        );
        let foreign = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(7), vec![send2]);

        assert!(container.add(Block::Request(foreign.clone())).is_empty());
        assert!(container.is_cached(&foreign.object_hash()));

        let written = container.add(Block::Request(b1.clone()));
        assert_eq!(written, vec![b1.object_hash(), foreign.object_hash()]);
    }

    #[test]
    fn duplicate_blocks_are_ignored() {
        let (db, mut container) = container();
        let a = AccountAddress([1; 32]);
        fund(&db, a, 1_000);

        let rb = RequestBlock::new(Hash::zero(), 1, 0, 0, DelegateId(0), vec![]);
        assert_eq!(container.add(Block::Request(rb.clone())).len(), 1);
        assert!(container.add(Block::Request(rb)).is_empty());
        drop(db);
    }
}
