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

//! The three-phase consensus engine.
//!
//! One [`ConsensusManager`] instance exists per `(chain kind, epoch)`. The
//! instance is single-threaded by convention: all of its inputs arrive as
//! [`EngineEvent`]s through one mailbox, so state transitions observe
//! program order without locks.
//!
//! As **primary** the manager broadcasts a PrePrepare, collects Prepare
//! partials until their stake reaches the quorum, aggregates them into a
//! PostPrepare, collects Commits the same way and finishes with a
//! PostCommit, handing the approved block to the writer. Rejections are
//! tallied; once enough stake rejects that the quorum is unreachable the
//! primary re-proposes with the offending requests stripped (for
//! `ContainsInvalidRequest`) or abandons the batch, up to `PROPOSAL_RETRY`
//! attempts. Each phase is guarded by a timeout that doubles per attempt.
//!
//! As **backup** the manager validates a PrePrepare against persistence and
//! answers with a Prepare partial or a Rejection, verifies the aggregates of
//! PostPrepare/PostCommit against the epoch key table, and applies the block
//! through the writer on PostCommit.

use log::{info, trace, warn};
use tokio::sync::mpsc;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    cache::CacheHandle,
    keys::DelegateKeyStore,
    messages::{commit_digest, prepare_digest, PeerMessage, RejectionMessage},
    pipeline::{RequestPipeline, WaitingList},
    quorum::QuorumSet,
    timeouts::{phase_timeout, secondary_delay},
};
use trilith::{
    blocks::{AggSignature, Block, ParticipationMap, RequestBlock},
    constants::{CLOCK_DRIFT, NUM_DELEGATES, PROPOSAL_RETRY, SECONDARY_TIMEOUT_CAP},
    persistence::{
        epoch as epoch_persistence, micro as micro_persistence, request as request_persistence,
        reservations::Reservations, AdmissionOutcome, RejectionReason, ValidationRejection,
    },
    requests::Request,
    schema::LedgerSchema,
    types::{Amount, ChainKind, DelegateId, Epoch, Sequence},
};
use trilith_crypto::{bls, bls::BlsKeyPair, bls::BlsSignature, Hash, ObjectHash};
use trilith_storage::Database;

/// States of the consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusState {
    /// No proposal in flight.
    Idle,
    /// Primary: PrePrepare broadcast, collecting Prepares.
    PrePrepare,
    /// Backup: Prepare sent, awaiting PostPrepare.
    Prepare,
    /// Primary: PostPrepare broadcast, collecting Commits.
    /// Backup: Commit sent, awaiting PostCommit.
    PostPrepare,
    /// Transitional: Commit round complete.
    Commit,
    /// Transitional: PostCommit delivered.
    PostCommit,
    /// Primary: re-proposal attempts exhausted.
    Rejected,
    /// Governance recall: the in-flight epoch proposal is void.
    Recall,
}

/// Inputs of a consensus manager, delivered through its mailbox.
#[derive(Debug)]
pub enum EngineEvent {
    /// A message from another delegate.
    Peer {
        /// The sending delegate.
        from: DelegateId,
        /// The message.
        message: PeerMessage,
    },
    /// A request entering through admission. The outcome is reported back
    /// through the reply channel when the submitter is waiting for it.
    Submit {
        /// The submitted request.
        request: Request,
        /// Where to report the admission outcome.
        reply: Option<tokio::sync::oneshot::Sender<AdmissionOutcome>>,
    },
    /// Batch-ready nudge for request consensus.
    ProposeBatch,
    /// An assembled micro/epoch proposal from the event proposer.
    Propose(Block),
    /// A phase timeout fired.
    PhaseTimeout {
        /// Digest the timer was armed for.
        digest: Hash,
        /// State the timer was armed in.
        state: ConsensusState,
        /// Attempt the timer was armed for.
        attempt: u32,
    },
    /// A secondary waiting-list entry expired.
    SecondaryTimeout {
        /// The waiting request.
        hash: Hash,
    },
    /// A backup waited too long in `PostPrepare`.
    BackupTimeout {
        /// Digest of the stuck proposal.
        digest: Hash,
    },
    /// Governance recall of the in-flight proposal.
    Recall,
    /// Stop the engine.
    Shutdown,
}

/// A timer the engine asks its runtime to arm. When the delay elapses the
/// event is posted back into the engine's mailbox.
#[derive(Debug)]
pub struct TimerRequest {
    /// How long to wait.
    pub delay: Duration,
    /// The event to deliver.
    pub event: EngineEvent,
}

/// Outgoing message channel of an engine.
pub trait MessageSink: Send + Sync {
    /// Broadcasts a message to every delegate of the epoch.
    fn broadcast(&self, epoch: Epoch, message: PeerMessage);
    /// Sends a message to one delegate of the epoch.
    fn send_to(&self, epoch: Epoch, to: DelegateId, message: PeerMessage);
}

/// Everything a consensus manager is wired to.
pub struct EngineConfig {
    /// Chain kind this engine drives.
    pub kind: ChainKind,
    /// Epoch this engine serves in.
    pub epoch: Epoch,
    /// The local delegate's id within the epoch.
    pub local_id: DelegateId,
    /// The local delegate's BLS keys.
    pub keys: Arc<BlsKeyPair>,
    /// Key table of the epoch's committee.
    pub key_store: Arc<DelegateKeyStore>,
    /// The ledger store (snapshot reads only; writes go through the cache).
    pub db: Arc<dyn Database>,
    /// Shared reservation cache.
    pub reservations: Arc<Mutex<Reservations>>,
    /// The request pipeline; `None` for micro/epoch engines.
    pub pipeline: Option<Arc<Mutex<RequestPipeline>>>,
    /// Writer-domain handle.
    pub cache: CacheHandle,
    /// Outgoing messages.
    pub sink: Arc<dyn MessageSink>,
    /// Timer requests.
    pub timers: mpsc::UnboundedSender<TimerRequest>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("kind", &self.kind)
            .field("epoch", &self.epoch)
            .field("local_id", &self.local_id)
            .finish()
    }
}

/// The designated proposer of a micro/epoch round. Request chains have no
/// rotation: every delegate proposes its own chain.
pub fn expected_primary(kind: ChainKind, epoch: Epoch, sequence: Sequence) -> Option<DelegateId> {
    match kind {
        ChainKind::Request => None,
        ChainKind::Micro | ChainKind::Epoch => {
            Some(DelegateId(((epoch + sequence) % NUM_DELEGATES as u32) as u8))
        }
    }
}

/// The delegate a request is routed to for proposing, derived from its
/// origin. Other delegates hold the request on the secondary waiting list.
pub fn target_delegate(request: &Request) -> DelegateId {
    DelegateId(request.origin().as_bytes()[0] % NUM_DELEGATES as u8)
}

#[derive(Debug)]
struct Tally {
    map: ParticipationMap,
    partials: Vec<BlsSignature>,
    weight: Amount,
}

impl Tally {
    fn new() -> Self {
        Self {
            map: ParticipationMap::new(),
            partials: Vec::new(),
            weight: Amount::ZERO,
        }
    }

    fn add(&mut self, id: DelegateId, signature: BlsSignature, weight: Amount) -> bool {
        if self.map.contains(id) {
            return false;
        }
        self.map.set(id);
        self.partials.push(signature);
        self.weight = self.weight + weight;
        true
    }

    fn aggregate(&self) -> Result<AggSignature, trilith_crypto::CryptoError> {
        Ok(AggSignature {
            map: self.map.clone(),
            signature: bls::aggregate(&self.partials)?,
        })
    }
}

#[derive(Debug)]
struct PrimaryRound {
    state: ConsensusState,
    proposal: Option<Block>,
    digest: Hash,
    attempt: u32,
    prepares: Tally,
    commits: Tally,
    rejected: ParticipationMap,
    rejected_weight: Amount,
    invalid_union: bit_vec::BitVec,
    only_invalid_requests: bool,
}

impl PrimaryRound {
    fn idle() -> Self {
        Self {
            state: ConsensusState::Idle,
            proposal: None,
            digest: Hash::zero(),
            attempt: 0,
            prepares: Tally::new(),
            commits: Tally::new(),
            rejected: ParticipationMap::new(),
            rejected_weight: Amount::ZERO,
            invalid_union: bit_vec::BitVec::new(),
            only_invalid_requests: true,
        }
    }
}

#[derive(Debug)]
struct BackupRound {
    state: ConsensusState,
    block: Option<Block>,
    digest: Hash,
}

impl BackupRound {
    fn idle() -> Self {
        Self {
            state: ConsensusState::Idle,
            block: None,
            digest: Hash::zero(),
        }
    }
}

/// The consensus engine of one `(chain kind, epoch)`.
pub struct ConsensusManager {
    kind: ChainKind,
    epoch: Epoch,
    local_id: DelegateId,
    keys: Arc<BlsKeyPair>,
    key_store: Arc<DelegateKeyStore>,
    quorum: QuorumSet,
    db: Arc<dyn Database>,
    reservations: Arc<Mutex<Reservations>>,
    pipeline: Option<Arc<Mutex<RequestPipeline>>>,
    waiting: WaitingList,
    cache: CacheHandle,
    sink: Arc<dyn MessageSink>,
    timers: mpsc::UnboundedSender<TimerRequest>,
    primary: PrimaryRound,
    backup: BackupRound,
    near_epoch_boundary: bool,
}

impl std::fmt::Debug for ConsensusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusManager")
            .field("kind", &self.kind)
            .field("epoch", &self.epoch)
            .field("local_id", &self.local_id)
            .field("primary_state", &self.primary.state)
            .field("backup_state", &self.backup.state)
            .finish()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn drift_envelope(kind: ChainKind) -> Duration {
    match kind {
        ChainKind::Request => CLOCK_DRIFT,
        // Micro/epoch proposals tolerate accumulated secondary-list drift.
        ChainKind::Micro | ChainKind::Epoch => SECONDARY_TIMEOUT_CAP + CLOCK_DRIFT,
    }
}

impl ConsensusManager {
    /// Creates an engine.
    pub fn new(config: EngineConfig) -> Self {
        let quorum = QuorumSet::new(config.key_store.weights().to_vec());
        Self {
            kind: config.kind,
            epoch: config.epoch,
            local_id: config.local_id,
            keys: config.keys,
            key_store: config.key_store,
            quorum,
            db: config.db,
            reservations: config.reservations,
            pipeline: config.pipeline,
            waiting: WaitingList::new(),
            cache: config.cache,
            sink: config.sink,
            timers: config.timers,
            primary: PrimaryRound::idle(),
            backup: BackupRound::idle(),
            near_epoch_boundary: false,
        }
    }

    /// The engine's chain kind.
    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    /// State of the primary state machine.
    pub fn primary_state(&self) -> ConsensusState {
        self.primary.state
    }

    /// State of the backup state machine.
    pub fn backup_state(&self) -> ConsensusState {
        self.backup.state
    }

    /// Marks the engine as running inside an epoch boundary window, which
    /// narrows secondary delays.
    pub fn set_near_epoch_boundary(&mut self, near: bool) {
        self.near_epoch_boundary = near;
    }

    /// Runs the engine over its mailbox until shutdown.
    pub async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = mailbox.recv().await {
            if matches!(event, EngineEvent::Shutdown) {
                break;
            }
            self.handle_event(event).await;
        }
        trace!("{} engine of epoch {} stopped", self.kind, self.epoch);
    }

    /// Dispatches one mailbox event.
    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Peer { from, message } => self.handle_peer(from, message).await,
            EngineEvent::Submit { request, reply } => {
                let outcome = if self.kind == ChainKind::Request {
                    self.submit_request(request).await
                } else {
                    AdmissionOutcome::Reserved
                };
                if let Some(reply) = reply {
                    reply.send(outcome).ok();
                }
            }
            EngineEvent::ProposeBatch => self.propose_batch().await,
            EngineEvent::Propose(block) => self.propose(block).await,
            EngineEvent::PhaseTimeout {
                digest,
                state,
                attempt,
            } => self.handle_phase_timeout(digest, state, attempt).await,
            EngineEvent::SecondaryTimeout { hash } => self.handle_secondary_timeout(hash).await,
            EngineEvent::BackupTimeout { digest } => self.handle_backup_timeout(digest),
            EngineEvent::Recall => self.handle_recall(),
            EngineEvent::Shutdown => {}
        }
    }

    async fn handle_peer(&mut self, from: DelegateId, message: PeerMessage) {
        match message {
            PeerMessage::PrePrepare { block } => self.handle_pre_prepare(from, block).await,
            PeerMessage::Prepare {
                kind,
                preprepare,
                delegate,
                signature,
            } => {
                if kind == self.kind && delegate == from {
                    self.handle_prepare(delegate, preprepare, signature).await;
                }
            }
            PeerMessage::PostPrepare {
                kind,
                preprepare,
                aggregate,
            } => {
                if kind == self.kind {
                    self.handle_post_prepare(from, preprepare, aggregate);
                }
            }
            PeerMessage::Commit {
                kind,
                preprepare,
                delegate,
                signature,
            } => {
                if kind == self.kind && delegate == from {
                    self.handle_commit(delegate, preprepare, signature).await;
                }
            }
            PeerMessage::PostCommit {
                kind,
                preprepare,
                aggregate,
            } => {
                if kind == self.kind {
                    self.handle_post_commit(from, preprepare, aggregate).await;
                }
            }
            PeerMessage::Rejection(rejection) => {
                if rejection.kind == self.kind && rejection.delegate == from {
                    self.handle_rejection(rejection).await;
                }
            }
            other => trace!("engine ignores {}", other),
        }
    }

    // ------------------------------------------------------------------
    // Admission and proposing
    // ------------------------------------------------------------------

    /// Handles a request submitted to this delegate. Requests routed to
    /// this delegate enter the pipeline; foreign requests go to the
    /// secondary waiting list with a sampled expiration.
    pub async fn submit_request(&mut self, request: Request) -> AdmissionOutcome {
        let pipeline = match &self.pipeline {
            Some(pipeline) => Arc::clone(pipeline),
            None => return AdmissionOutcome::Reserved,
        };

        if target_delegate(&request) == self.local_id {
            let outcome = {
                let snapshot = self.db.snapshot();
                let schema = LedgerSchema::new(&*snapshot);
                let mut reservations = self.reservations.lock().expect("reservations lock");
                pipeline.lock().expect("pipeline lock").submit(
                    &schema,
                    &mut reservations,
                    request,
                    self.epoch,
                )
            };
            if outcome == AdmissionOutcome::Progress {
                self.propose_batch().await;
            }
            outcome
        } else {
            // Hold the request as a stand-in; if no proposal includes it
            // before the timer fires, this delegate proposes it itself.
            let hash = request.object_hash();
            let outcome = {
                let snapshot = self.db.snapshot();
                let schema = LedgerSchema::new(&*snapshot);
                let mut reservations = self.reservations.lock().expect("reservations lock");
                request_persistence::validate_and_reserve(
                    &schema,
                    &mut reservations,
                    &request,
                    self.epoch,
                )
            };
            if outcome != AdmissionOutcome::Progress {
                return outcome;
            }
            if self.waiting.insert(request) {
                let delay =
                    secondary_delay(&mut rand::thread_rng(), self.near_epoch_boundary);
                self.arm_timer(delay, EngineEvent::SecondaryTimeout { hash });
            }
            AdmissionOutcome::Progress
        }
    }

    async fn handle_secondary_timeout(&mut self, hash: Hash) {
        let request = match self.waiting.take(&hash) {
            Some(request) => request,
            None => return,
        };
        info!("promoting waiting request {} after primary silence", hash);
        if let Some(pipeline) = &self.pipeline {
            pipeline.lock().expect("pipeline lock").insert_front(&[request]);
        }
        self.propose_batch().await;
    }

    fn handle_backup_timeout(&mut self, digest: Hash) {
        if self.backup.state != ConsensusState::PostPrepare || self.backup.digest != digest {
            return;
        }
        warn!("backup stuck in PostPrepare for {}; recovering requests", digest);
        if let (Some(pipeline), Some(Block::Request(block))) = (&self.pipeline, &self.backup.block)
        {
            pipeline.lock().expect("pipeline lock").acquire(block);
        }
        self.backup = BackupRound::idle();
    }

    /// Drains the pipeline into a batch and proposes it, if the engine is
    /// free to propose.
    pub async fn propose_batch(&mut self) {
        if self.kind != ChainKind::Request {
            return;
        }
        if !matches!(
            self.primary.state,
            ConsensusState::Idle | ConsensusState::Rejected
        ) {
            return;
        }
        let pipeline = match &self.pipeline {
            Some(pipeline) => Arc::clone(pipeline),
            None => return,
        };

        let (batch, previous, sequence) = {
            let snapshot = self.db.snapshot();
            let schema = LedgerSchema::new(&*snapshot);
            let mut reservations = self.reservations.lock().expect("reservations lock");
            let batch = pipeline.lock().expect("pipeline lock").prepare_next_batch(
                &schema,
                &mut reservations,
                self.epoch,
            );
            let tip = schema.request_tip(self.local_id);
            let (previous, sequence) = if tip.is_empty() || tip.epoch < self.epoch {
                (Hash::zero(), 0)
            } else {
                (tip.digest, tip.sequence + 1)
            };
            (batch, previous, sequence)
        };
        if batch.is_empty() {
            return;
        }

        let block = RequestBlock::new(
            previous,
            self.epoch,
            sequence,
            now_ms(),
            self.local_id,
            batch,
        );
        self.propose(Block::Request(block)).await;
    }

    /// Broadcasts a proposal and enters the Prepare collection phase.
    pub async fn propose(&mut self, block: Block) {
        if !matches!(
            self.primary.state,
            ConsensusState::Idle | ConsensusState::Rejected | ConsensusState::Recall
        ) {
            trace!("proposal deferred; engine busy in {:?}", self.primary.state);
            return;
        }

        let digest = block.object_hash();
        let attempt = if self.primary.digest == digest {
            self.primary.attempt + 1
        } else {
            1
        };
        self.primary = PrimaryRound::idle();
        self.primary.state = ConsensusState::PrePrepare;
        self.primary.digest = digest;
        self.primary.attempt = attempt;
        self.primary.proposal = Some(block.clone());

        // The primary's own partial counts toward the quorum.
        let own = self
            .keys
            .sign(prepare_digest(self.kind, &digest).as_ref());
        self.primary
            .prepares
            .add(self.local_id, own, self.quorum.weight(self.local_id));

        info!(
            "proposing {} block {} (attempt {})",
            self.kind, digest, attempt
        );
        self.sink
            .broadcast(self.epoch, PeerMessage::PrePrepare { block });
        self.arm_phase_timer(ConsensusState::PrePrepare);

        if self.quorum.reached(self.primary.prepares.weight) {
            self.advance_to_post_prepare().await;
        }
    }

    async fn handle_prepare(
        &mut self,
        delegate: DelegateId,
        preprepare: Hash,
        signature: BlsSignature,
    ) {
        if self.primary.state != ConsensusState::PrePrepare || self.primary.digest != preprepare {
            trace!("dropping Prepare outside the PrePrepare phase");
            return;
        }
        let key = match self.key_store.key(delegate) {
            Some(key) => *key,
            None => return,
        };
        let msg = prepare_digest(self.kind, &preprepare);
        if key.verify(msg.as_ref(), &signature).is_err() {
            warn!("invalid Prepare partial from {}", delegate);
            return;
        }
        if !self
            .primary
            .prepares
            .add(delegate, signature, self.quorum.weight(delegate))
        {
            return;
        }
        trace!(
            "Prepare weight {}/{}",
            self.primary.prepares.weight,
            self.quorum.quorum()
        );
        if self.quorum.reached(self.primary.prepares.weight) {
            self.advance_to_post_prepare().await;
        }
    }

    async fn advance_to_post_prepare(&mut self) {
        let aggregate = match self.primary.prepares.aggregate() {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!("cannot aggregate Prepare partials: {}", e);
                return;
            }
        };
        if let Some(block) = &mut self.primary.proposal {
            set_post_prepare(block, aggregate.clone());
        }
        self.primary.state = ConsensusState::PostPrepare;
        self.primary.commits = Tally::new();
        let own = self
            .keys
            .sign(commit_digest(self.kind, &self.primary.digest).as_ref());
        self.primary
            .commits
            .add(self.local_id, own, self.quorum.weight(self.local_id));

        self.sink.broadcast(
            self.epoch,
            PeerMessage::PostPrepare {
                kind: self.kind,
                preprepare: self.primary.digest,
                aggregate,
            },
        );
        self.arm_phase_timer(ConsensusState::PostPrepare);

        if self.quorum.reached(self.primary.commits.weight) {
            self.finish_round().await;
        }
    }

    async fn handle_commit(
        &mut self,
        delegate: DelegateId,
        preprepare: Hash,
        signature: BlsSignature,
    ) {
        if self.primary.state != ConsensusState::PostPrepare || self.primary.digest != preprepare {
            trace!("dropping Commit outside the PostPrepare phase");
            return;
        }
        let key = match self.key_store.key(delegate) {
            Some(key) => *key,
            None => return,
        };
        let msg = commit_digest(self.kind, &preprepare);
        if key.verify(msg.as_ref(), &signature).is_err() {
            warn!("invalid Commit partial from {}", delegate);
            return;
        }
        if !self
            .primary
            .commits
            .add(delegate, signature, self.quorum.weight(delegate))
        {
            return;
        }
        if self.quorum.reached(self.primary.commits.weight) {
            self.finish_round().await;
        }
    }

    async fn finish_round(&mut self) {
        let aggregate = match self.primary.commits.aggregate() {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!("cannot aggregate Commit partials: {}", e);
                return;
            }
        };
        let mut block = match self.primary.proposal.take() {
            Some(block) => block,
            None => return,
        };
        set_post_commit(&mut block, aggregate.clone());

        self.sink.broadcast(
            self.epoch,
            PeerMessage::PostCommit {
                kind: self.kind,
                preprepare: self.primary.digest,
                aggregate,
            },
        );
        info!("{} block {} reached post-commit", self.kind, self.primary.digest);

        self.deliver(block).await;
        self.primary = PrimaryRound::idle();

        // More admitted requests may be waiting for a slot.
        if self.kind == ChainKind::Request {
            let backlog = self
                .pipeline
                .as_ref()
                .map(|pipeline| !pipeline.lock().expect("pipeline lock").is_empty())
                .unwrap_or(false);
            if backlog {
                self.arm_timer(Duration::from_millis(0), EngineEvent::ProposeBatch);
            }
        }
    }

    async fn handle_rejection(&mut self, rejection: RejectionMessage) {
        if !matches!(
            self.primary.state,
            ConsensusState::PrePrepare | ConsensusState::PostPrepare
        ) || self.primary.digest != rejection.preprepare
        {
            return;
        }
        let key = match self.key_store.key(rejection.delegate) {
            Some(key) => *key,
            None => return,
        };
        if key
            .verify(rejection.signing_digest().as_ref(), &rejection.signature)
            .is_err()
        {
            warn!("invalid Rejection signature from {}", rejection.delegate);
            return;
        }
        if self.primary.rejected.contains(rejection.delegate) {
            return;
        }
        self.primary.rejected.set(rejection.delegate);
        self.primary.rejected_weight =
            self.primary.rejected_weight + self.quorum.weight(rejection.delegate);

        if rejection.reason == RejectionReason::ContainsInvalidRequest {
            union_bitmap(&mut self.primary.invalid_union, &rejection.rejection_map);
        } else {
            self.primary.only_invalid_requests = false;
        }
        warn!(
            "{} rejected proposal {}: {:?} (weight {})",
            rejection.delegate, rejection.preprepare, rejection.reason, self.primary.rejected_weight
        );

        if self.quorum.unreachable(self.primary.rejected_weight) {
            self.handle_blocked_proposal().await;
        }
    }

    /// Enough stake rejected that the quorum cannot be assembled any more.
    async fn handle_blocked_proposal(&mut self) {
        let attempt = self.primary.attempt;
        let proposal = self.primary.proposal.take();
        let strip = self.primary.only_invalid_requests;
        let invalid = std::mem::replace(&mut self.primary.invalid_union, bit_vec::BitVec::new());
        self.primary = PrimaryRound::idle();

        let block = match proposal {
            Some(Block::Request(block)) => block,
            Some(_) | None => {
                // Micro/epoch proposals are simply abandoned; the event
                // proposer will re-propose at the next interval.
                self.primary.state = ConsensusState::Rejected;
                return;
            }
        };

        if strip && attempt < PROPOSAL_RETRY {
            // Drop the offending requests and re-propose the remainder.
            let survivors: Vec<Request> = block
                .requests
                .iter()
                .enumerate()
                .filter(|(i, _)| !invalid.get(*i).unwrap_or(false))
                .map(|(_, request)| request.clone())
                .collect();
            if let Some(pipeline) = &self.pipeline {
                let mut pipeline = pipeline.lock().expect("pipeline lock");
                for (i, request) in block.requests.iter().enumerate() {
                    if invalid.get(i).unwrap_or(false) {
                        pipeline.discard(&request.object_hash());
                    }
                }
            }
            if survivors.is_empty() {
                info!("every request of the batch was rejected; abandoning");
                self.primary.state = ConsensusState::Rejected;
                return;
            }
            let replacement = RequestBlock::new(
                block.previous,
                block.epoch,
                block.sequence,
                now_ms(),
                block.primary,
                survivors,
            );
            // Carry the attempt count across the re-proposal.
            self.primary.digest = replacement.object_hash();
            self.primary.attempt = attempt;
            self.propose(Block::Request(replacement)).await;
        } else {
            info!("abandoning proposal after {} attempts", attempt);
            if let Some(pipeline) = &self.pipeline {
                pipeline
                    .lock()
                    .expect("pipeline lock")
                    .insert_front(&block.requests);
            }
            self.primary.state = ConsensusState::Rejected;
        }
    }

    async fn handle_phase_timeout(&mut self, digest: Hash, state: ConsensusState, attempt: u32) {
        if self.primary.state != state
            || self.primary.digest != digest
            || self.primary.attempt != attempt
        {
            return;
        }
        warn!(
            "{} phase {:?} timed out for {} (attempt {})",
            self.kind, state, digest, attempt
        );
        if attempt >= PROPOSAL_RETRY {
            self.handle_blocked_proposal().await;
            return;
        }

        // Re-propose with a fresh timestamp; the attempt count doubles the
        // next timeout.
        let proposal = self.primary.proposal.take();
        self.primary = PrimaryRound::idle();
        match proposal {
            Some(Block::Request(mut block)) => {
                block.timestamp = now_ms();
                block.post_prepare = AggSignature::placeholder();
                block.post_commit = AggSignature::placeholder();
                self.primary.digest = block.object_hash();
                self.primary.attempt = attempt;
                self.propose(Block::Request(block)).await;
            }
            Some(Block::Micro(mut block)) => {
                block.timestamp = now_ms();
                block.post_prepare = AggSignature::placeholder();
                block.post_commit = AggSignature::placeholder();
                self.primary.digest = block.object_hash();
                self.primary.attempt = attempt;
                self.propose(Block::Micro(block)).await;
            }
            Some(Block::Epoch(mut block)) => {
                block.timestamp = now_ms();
                block.post_prepare = AggSignature::placeholder();
                block.post_commit = AggSignature::placeholder();
                self.primary.digest = block.object_hash();
                self.primary.attempt = attempt;
                self.propose(Block::Epoch(block)).await;
            }
            None => {}
        }
    }

    /// Governance recall: the in-flight epoch proposal is void. The
    /// replacement proposed in the next window is handled like any other
    /// proposal.
    fn handle_recall(&mut self) {
        if self.kind == ChainKind::Epoch {
            warn!("recall: voiding in-flight epoch proposal");
            self.primary = PrimaryRound::idle();
            self.primary.state = ConsensusState::Recall;
            self.backup = BackupRound::idle();
        }
    }

    // ------------------------------------------------------------------
    // Backup side
    // ------------------------------------------------------------------

    async fn handle_pre_prepare(&mut self, from: DelegateId, block: Block) {
        if block.kind() != self.kind {
            return;
        }
        let digest = block.object_hash();
        let primary = proposer_of(&block);
        if primary != from {
            warn!("PrePrepare from {} names primary {}; dropping", from, primary);
            return;
        }
        if primary == self.local_id {
            return;
        }
        if let Some(expected) = expected_primary(self.kind, block.epoch(), sequence_of(&block)) {
            if expected != primary {
                warn!(
                    "PrePrepare from {} but rotation expects {}; dropping",
                    primary, expected
                );
                return;
            }
        }
        let verdict = self.validate_proposal(&block);
        match verdict {
            Ok(()) => {
                trace!("voting Prepare for {} block {}", self.kind, digest);
                if let Block::Request(rb) = &block {
                    self.waiting.prune_proposal(rb);
                }
                self.backup.state = ConsensusState::Prepare;
                self.backup.digest = digest;
                self.backup.block = Some(block);
                let signature = self
                    .keys
                    .sign(prepare_digest(self.kind, &digest).as_ref());
                self.sink.send_to(
                    self.epoch,
                    primary,
                    PeerMessage::Prepare {
                        kind: self.kind,
                        preprepare: digest,
                        delegate: self.local_id,
                        signature,
                    },
                );
            }
            Err(rejection) => {
                warn!(
                    "rejecting {} proposal {}: {:?}",
                    self.kind, digest, rejection.reason
                );
                let mut message =
                    RejectionMessage::from_rejection(self.kind, digest, self.local_id, rejection);
                message.signature = self.keys.sign(message.signing_digest().as_ref());
                self.sink
                    .send_to(self.epoch, primary, PeerMessage::Rejection(message));
            }
        }
    }

    fn validate_proposal(&self, block: &Block) -> Result<(), ValidationRejection> {
        let snapshot = self.db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let now = now_ms();
        let drift = drift_envelope(self.kind);
        match block {
            Block::Request(rb) => {
                let mut reservations = self.reservations.lock().expect("reservations lock");
                request_persistence::validate_block(
                    &schema,
                    &mut reservations,
                    rb,
                    now,
                    self.epoch,
                    drift,
                )
            }
            Block::Micro(mb) => {
                micro_persistence::validate_block(&schema, mb, now, self.epoch, drift)
            }
            Block::Epoch(eb) => {
                epoch_persistence::validate_block(&schema, eb, now, self.epoch, drift)
            }
        }
    }

    fn handle_post_prepare(&mut self, from: DelegateId, preprepare: Hash, aggregate: AggSignature) {
        if self.backup.state != ConsensusState::Prepare || self.backup.digest != preprepare {
            trace!("dropping PostPrepare outside the Prepare phase");
            return;
        }
        if !self
            .quorum
            .reached(self.key_store.aggregate_weight(&aggregate))
        {
            warn!("PostPrepare aggregate below quorum; dropping");
            return;
        }
        let msg = prepare_digest(self.kind, &preprepare);
        if self.key_store.verify_aggregate(&msg, &aggregate).is_err() {
            warn!("PostPrepare aggregate does not verify; dropping");
            return;
        }

        if let Some(block) = &mut self.backup.block {
            set_post_prepare(block, aggregate);
        }
        self.backup.state = ConsensusState::PostPrepare;
        let signature = self
            .keys
            .sign(commit_digest(self.kind, &preprepare).as_ref());
        self.sink.send_to(
            self.epoch,
            from,
            PeerMessage::Commit {
                kind: self.kind,
                preprepare,
                delegate: self.local_id,
                signature,
            },
        );

        // If the PostCommit never arrives the batch is recovered onto the
        // secondary path.
        let delay = secondary_delay(&mut rand::thread_rng(), self.near_epoch_boundary);
        self.arm_timer(delay, EngineEvent::BackupTimeout { digest: preprepare });
    }

    async fn handle_post_commit(&mut self, _from: DelegateId, preprepare: Hash, aggregate: AggSignature) {
        if !matches!(
            self.backup.state,
            ConsensusState::Prepare | ConsensusState::PostPrepare
        ) || self.backup.digest != preprepare
        {
            trace!("dropping PostCommit without a matching proposal");
            return;
        }
        if !self
            .quorum
            .reached(self.key_store.aggregate_weight(&aggregate))
        {
            warn!("PostCommit aggregate below quorum; dropping");
            return;
        }
        let msg = commit_digest(self.kind, &preprepare);
        if self.key_store.verify_aggregate(&msg, &aggregate).is_err() {
            warn!("PostCommit aggregate does not verify; dropping");
            return;
        }

        let mut block = match self.backup.block.take() {
            Some(block) => block,
            None => return,
        };
        set_post_commit(&mut block, aggregate);
        info!("{} block {} post-committed (backup)", self.kind, preprepare);
        self.deliver(block).await;
        self.backup = BackupRound::idle();
    }

    /// Hands a post-committed block to the writer and cleans local queues.
    async fn deliver(&mut self, block: Block) {
        if let Block::Request(rb) = &block {
            if let Some(pipeline) = &self.pipeline {
                pipeline.lock().expect("pipeline lock").on_post_commit(rb);
            }
            self.waiting.prune_proposal(rb);
        }
        self.cache.submit(block).await;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn arm_phase_timer(&self, state: ConsensusState) {
        let delay = phase_timeout(self.kind, self.primary.attempt);
        self.arm_timer(
            delay,
            EngineEvent::PhaseTimeout {
                digest: self.primary.digest,
                state,
                attempt: self.primary.attempt,
            },
        );
    }

    fn arm_timer(&self, delay: Duration, event: EngineEvent) {
        if self.timers.send(TimerRequest { delay, event }).is_err() {
            warn!("timer channel closed; {} engine cannot arm timers", self.kind);
        }
    }
}

fn proposer_of(block: &Block) -> DelegateId {
    match block {
        Block::Request(b) => b.primary,
        Block::Micro(b) => b.primary,
        Block::Epoch(b) => b.primary,
    }
}

fn sequence_of(block: &Block) -> Sequence {
    match block {
        Block::Request(b) => b.sequence,
        Block::Micro(b) => b.sequence,
        Block::Epoch(b) => b.epoch,
    }
}

fn set_post_prepare(block: &mut Block, aggregate: AggSignature) {
    match block {
        Block::Request(b) => b.post_prepare = aggregate,
        Block::Micro(b) => b.post_prepare = aggregate,
        Block::Epoch(b) => b.post_prepare = aggregate,
    }
}

fn set_post_commit(block: &mut Block, aggregate: AggSignature) {
    match block {
        Block::Request(b) => b.post_commit = aggregate,
        Block::Micro(b) => b.post_commit = aggregate,
        Block::Epoch(b) => b.post_commit = aggregate,
    }
}

fn union_bitmap(into: &mut bit_vec::BitVec, from: &bit_vec::BitVec) {
    if into.len() < from.len() {
        let grow = from.len() - into.len();
        into.grow(grow, false);
    }
    for (i, bit) in from.iter().enumerate() {
        if bit {
            into.set(i, true);
        }
    }
}
