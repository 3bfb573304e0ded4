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

//! Full three-phase consensus rounds driven in-process across a complete
//! 32-delegate committee, with every BLS partial and aggregate verified for
//! real.

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use trilith::{
    blocks::{Block, DelegateInfo, RequestBlock},
    constants::{MIN_TRANSACTION_FEE, NUM_DELEGATES},
    genesis::{initialize, GenesisAccount, GenesisConfig},
    persistence::reservations::Reservations,
    requests::{Request, Transaction},
    schema::LedgerSchema,
    types::{AccountAddress, Amount, ChainKind, DelegateId, Epoch},
};
use trilith_crypto::{account::AccountKeyPair, bls::BlsKeyPair, Hash, ObjectHash};
use trilith_node::{
    cache::spawn_writer,
    consensus::{
        target_delegate, ConsensusManager, ConsensusState, EngineConfig, EngineEvent, MessageSink,
        TimerRequest,
    },
    keys::DelegateKeyStore,
    messages::PeerMessage,
    pipeline::RequestPipeline,
};
use trilith_storage::{Database, TemporaryDB};

/// Collects everything an engine sends, for the harness to route by hand.
#[derive(Debug, Default)]
struct TestSink {
    outbox: Mutex<VecDeque<(Option<DelegateId>, PeerMessage)>>,
}

impl MessageSink for TestSink {
    fn broadcast(&self, _epoch: Epoch, message: PeerMessage) {
        self.outbox
            .lock()
            .unwrap()
            .push_back((None, message));
    }

    fn send_to(&self, _epoch: Epoch, to: DelegateId, message: PeerMessage) {
        self.outbox
            .lock()
            .unwrap()
            .push_back((Some(to), message));
    }
}

impl TestSink {
    fn drain(&self) -> Vec<(Option<DelegateId>, PeerMessage)> {
        self.outbox.lock().unwrap().drain(..).collect()
    }
}

struct TestNode {
    id: DelegateId,
    db: Arc<TemporaryDB>,
    manager: ConsensusManager,
    sink: Arc<TestSink>,
    // Kept alive so the engine can arm timers without warnings.
    timers: mpsc::UnboundedReceiver<TimerRequest>,
}

struct Committee {
    nodes: Vec<TestNode>,
    user: AccountKeyPair,
}

const USER_BALANCE: u128 = 1_000_000 * MIN_TRANSACTION_FEE;

impl Committee {
    fn new(seed: u8) -> Self {
        let bls_pairs: Vec<Arc<BlsKeyPair>> = (0..NUM_DELEGATES)
            .map(|i| Arc::new(BlsKeyPair::from_seed(&[seed.wrapping_add(i as u8 + 1); 32])))
            .collect();
        let delegates: Vec<DelegateInfo> = bls_pairs
            .iter()
            .enumerate()
            .map(|(i, pair)| DelegateInfo {
                account: AccountAddress([i as u8 + 1; 32]),
                bls_key: pair.public_key(),
                vote_weight: Amount(1),
                stake: Amount(1_000),
            })
            .collect();
        let user = AccountKeyPair::from_seed(&[seed.wrapping_add(101); 32]);
        let genesis = GenesisConfig {
            accounts: vec![GenesisAccount {
                address: AccountAddress(user.address()),
                balance: Amount(USER_BALANCE),
            }],
            delegates: delegates.clone(),
            timestamp: 0,
        };

        let nodes = bls_pairs
            .into_iter()
            .enumerate()
            .map(|(i, keys)| {
                let db = Arc::new(TemporaryDB::new());
                initialize(db.as_ref(), &genesis).unwrap();
                let reservations = Arc::new(Mutex::new(Reservations::new()));
                let (cache, _committed) =
                    spawn_writer(db.clone() as Arc<dyn Database>, Arc::clone(&reservations));
                let sink = Arc::new(TestSink::default());
                let (timer_tx, timer_rx) = mpsc::unbounded_channel();
                let manager = ConsensusManager::new(EngineConfig {
                    kind: ChainKind::Request,
                    epoch: 1,
                    local_id: DelegateId(i as u8),
                    keys,
                    key_store: Arc::new(DelegateKeyStore::from_delegates(1, &delegates)),
                    db: db.clone(),
                    reservations,
                    pipeline: Some(Arc::new(Mutex::new(RequestPipeline::new()))),
                    cache,
                    sink: sink.clone(),
                    timers: timer_tx,
                });
                TestNode {
                    id: DelegateId(i as u8),
                    db,
                    manager,
                    sink,
                    timers: timer_rx,
                }
            })
            .collect();

        Self { nodes, user }
    }

    fn signed_send(&self, previous: Hash, amount: u128) -> Request {
        let mut request = Request::send(
            AccountAddress(self.user.address()),
            previous,
            Amount(MIN_TRANSACTION_FEE),
            vec![Transaction::new(AccountAddress([200; 32]), Amount(amount))],
        );
        request.sign(&self.user);
        request
    }

    /// Routes every pending outgoing message of `from` to its addressees.
    async fn pump_from(&mut self, from: usize) {
        let messages = self.nodes[from].sink.drain();
        let sender = self.nodes[from].id;
        for (to, message) in messages {
            match to {
                Some(target) => {
                    let index = target.index();
                    self.nodes[index]
                        .manager
                        .handle_event(EngineEvent::Peer {
                            from: sender,
                            message,
                        })
                        .await;
                }
                None => {
                    for index in 0..self.nodes.len() {
                        if index == from {
                            continue;
                        }
                        self.nodes[index]
                            .manager
                            .handle_event(EngineEvent::Peer {
                                from: sender,
                                message: message.clone(),
                            })
                            .await;
                    }
                }
            }
        }
    }

    /// Pumps every node's outbox until the network is quiet.
    async fn settle(&mut self) {
        loop {
            let mut any = false;
            for index in 0..self.nodes.len() {
                let pending = { !self.nodes[index].sink.outbox.lock().unwrap().is_empty() };
                if pending {
                    any = true;
                    self.pump_from(index).await;
                }
            }
            if !any {
                break;
            }
        }
    }

    /// Polls a delegate's store until its request tip reaches `sequence`.
    async fn wait_for_tip(&self, node: usize, sequence: u32) -> trilith::tip::Tip {
        for _ in 0..200 {
            let tip = {
                let snapshot = self.nodes[node].db.snapshot();
                LedgerSchema::new(&*snapshot).request_tip(DelegateId(node as u8))
            };
            if !tip.is_empty() && tip.sequence == sequence {
                return tip;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request tip of delegate {} never reached sequence {}", node, sequence);
    }

    async fn wait_for_block(&self, hash: &Hash) {
        for _ in 0..200 {
            let stored = self.nodes.iter().all(|node| {
                let snapshot = node.db.snapshot();
                LedgerSchema::new(&*snapshot).contains_block(hash)
            });
            if stored {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("block {} never reached every store", hash);
    }
}

#[tokio::test]
async fn full_round_commits_on_every_delegate() {
    let mut committee = Committee::new(21);
    let request = committee.signed_send(Hash::zero(), 5);
    let primary = target_delegate(&request).index();

    // Admission on the target delegate kicks off the proposal.
    committee.nodes[primary]
        .manager
        .handle_event(EngineEvent::Submit {
            request: request.clone(),
            reply: None,
        })
        .await;
    assert_eq!(
        committee.nodes[primary].manager.primary_state(),
        ConsensusState::PrePrepare
    );

    // PrePrepare -> Prepares -> PostPrepare -> Commits -> PostCommit.
    committee.settle().await;
    assert_eq!(
        committee.nodes[primary].manager.primary_state(),
        ConsensusState::Idle
    );

    // The writer applied the block on every delegate.
    let block_tip = committee.wait_for_tip(primary, 0).await;
    committee.wait_for_block(&block_tip.digest).await;

    for node in &committee.nodes {
        let snapshot = node.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let user = schema
            .account(&AccountAddress(committee.user.address()))
            .unwrap();
        assert_eq!(user.balance, Amount(USER_BALANCE - 5 - MIN_TRANSACTION_FEE));
        assert_eq!(user.head, request.object_hash());
        let paid = schema.account(&AccountAddress([200; 32])).unwrap();
        assert_eq!(paid.balance, Amount(5));
    }
}

#[tokio::test]
async fn rejected_requests_are_stripped_and_reproposed() {
    let mut committee = Committee::new(22);
    let good = committee.signed_send(Hash::zero(), 7);
    // Unsigned request: every backup rejects it as invalid.
    let bad = Request::send(
        AccountAddress([42; 32]),
        Hash::zero(),
        Amount(MIN_TRANSACTION_FEE),
        vec![Transaction::new(AccountAddress([1; 32]), Amount(1))],
    );

    let primary = 3;
    let block = RequestBlock::new(
        Hash::zero(),
        1,
        0,
        chrono::Utc::now().timestamp_millis() as u64,
        DelegateId(primary as u8),
        vec![good.clone(), bad.clone()],
    );
    committee.nodes[primary]
        .manager
        .propose(Block::Request(block))
        .await;

    // Deliver the proposal; backups answer with rejections naming request 1.
    committee.pump_from(primary).await;
    let mut rejections = 0;
    for index in 0..committee.nodes.len() {
        for (to, message) in committee.nodes[index].sink.drain() {
            if let PeerMessage::Rejection(rejection) = &message {
                assert_eq!(rejection.rejection_map.get(0), Some(false));
                assert_eq!(rejection.rejection_map.get(1), Some(true));
                rejections += 1;
            }
            // Feed everything back to the primary.
            if to == Some(DelegateId(primary as u8)) {
                committee.nodes[primary]
                    .manager
                    .handle_event(EngineEvent::Peer {
                        from: DelegateId(index as u8),
                        message,
                    })
                    .await;
            }
        }
    }
    assert_eq!(rejections, NUM_DELEGATES - 1);

    // The primary re-proposed with the offender stripped.
    let reproposed = committee.nodes[primary]
        .sink
        .drain()
        .into_iter()
        .find_map(|(_, message)| match message {
            PeerMessage::PrePrepare {
                block: Block::Request(block),
            } => Some(block),
            _ => None,
        })
        .expect("a stripped re-proposal");
    assert_eq!(reproposed.requests, vec![good]);
    assert_eq!(
        committee.nodes[primary].manager.primary_state(),
        ConsensusState::PrePrepare
    );
}

#[tokio::test]
async fn waiting_request_is_promoted_after_primary_silence() {
    let mut committee = Committee::new(23);
    let request = committee.signed_send(Hash::zero(), 3);
    let target = target_delegate(&request).index();
    let stand_in = (target + 1) % NUM_DELEGATES;

    // A delegate that is not the target parks the request.
    committee.nodes[stand_in]
        .manager
        .handle_event(EngineEvent::Submit {
            request: request.clone(),
            reply: None,
        })
        .await;
    assert_eq!(
        committee.nodes[stand_in].manager.primary_state(),
        ConsensusState::Idle
    );

    // The expiration timer was armed within the secondary window.
    let armed = committee.nodes[stand_in]
        .timers
        .try_recv()
        .expect("a secondary expiration timer");
    assert!(armed.delay >= Duration::from_secs(20));
    assert!(armed.delay <= Duration::from_secs(60));

    // Firing it promotes the stand-in to proposer.
    committee.nodes[stand_in]
        .manager
        .handle_event(EngineEvent::SecondaryTimeout {
            hash: request.object_hash(),
        })
        .await;
    assert_eq!(
        committee.nodes[stand_in].manager.primary_state(),
        ConsensusState::PrePrepare
    );
    let proposal = committee.nodes[stand_in].sink.drain();
    assert!(matches!(
        proposal.first(),
        Some((None, PeerMessage::PrePrepare { .. }))
    ));
}

#[tokio::test]
async fn second_round_chains_onto_the_first() {
    let mut committee = Committee::new(24);
    let first = committee.signed_send(Hash::zero(), 5);
    let primary = target_delegate(&first).index();

    committee.nodes[primary]
        .manager
        .handle_event(EngineEvent::Submit {
            request: first.clone(),
            reply: None,
        })
        .await;
    committee.settle().await;
    let tip_after_first = committee.wait_for_tip(primary, 0).await;
    committee.wait_for_block(&tip_after_first.digest).await;

    // The second send chains onto the first and lands at sequence 1.
    let second = committee.signed_send(first.object_hash(), 9);
    committee.nodes[primary]
        .manager
        .handle_event(EngineEvent::Submit {
            request: second,
            reply: None,
        })
        .await;
    committee.settle().await;

    let tip = committee.wait_for_tip(primary, 1).await;
    committee.wait_for_block(&tip.digest).await;

    for node in &committee.nodes {
        let snapshot = node.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let paid = schema.account(&AccountAddress([200; 32])).unwrap();
        assert_eq!(paid.balance, Amount(14));
        assert_eq!(paid.receive_count, 2);
    }
}
