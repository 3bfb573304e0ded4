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

//! Epoch transition.
//!
//! The delegate set rotates at fixed epoch boundaries. Around each boundary
//! the node walks through a fixed timeline anchored on the epoch clock:
//!
//! | window | time | action |
//! |---|---|---|
//! | Connecting | T−5 min → T−20 s | the incoming set opens channels |
//! | TransitionStart | T−20 s → T | both engine sets accept messages |
//! | EpochStart | T → T+20 s | the new set assumes responsibility |
//! | (end) | T+20 s → T+5 min | retiring delegates drain and close |
//!
//! One [`EpochManager`] bundles the three consensus engines of one epoch;
//! the [`EpochSupervisor`] owns the current and (during transitions) the
//! incoming manager and demultiplexes messages by their epoch number.

use log::{info, trace, warn};
use tokio::sync::mpsc;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    cache::CacheHandle,
    consensus::{ConsensusManager, EngineConfig, EngineEvent, MessageSink, TimerRequest},
    keys::DelegateKeyStore,
    messages::PeerMessage,
    pipeline::RequestPipeline,
};
use trilith::{
    blocks::DelegateInfo,
    constants::{
        EPOCH_DELEGATES_CONNECT, EPOCH_INTERVAL, EPOCH_START, EPOCH_TRANSITION_START,
        INVALID_EPOCH_GAP, MICROBLOCK_INTERVAL,
    },
    persistence::reservations::Reservations,
    types::{AccountAddress, ChainKind, DelegateId, Epoch},
};
use trilith_crypto::bls::BlsKeyPair;
use trilith_storage::Database;

/// Where the node stands relative to the nearest epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochTransitionState {
    /// The incoming delegate set is opening channels.
    Connecting,
    /// Both delegate sets accept messages; the boundary is imminent.
    EpochTransitionStart,
    /// Just past the boundary; the new set assumes responsibility.
    EpochStart,
    /// No transition in progress.
    None,
}

/// The local delegate's role across one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRole {
    /// In the incoming set only; silent until the epoch starts.
    New,
    /// In both sets; continues seamlessly.
    Persistent,
    /// In both sets, but must not vote for proposals of the outgoing epoch
    /// any more.
    PersistentRejecting,
    /// In the outgoing set only; forwards pending requests, may not propose.
    Retiring,
    /// Retiring, restricted to forwarding only.
    RetiringForwardOnly,
    /// In neither set.
    None,
}

/// Kind of a delegate connection, part of the connection map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// A connection of the running epoch.
    Current,
    /// A connection opened ahead of the incoming epoch.
    Transitioning,
    /// A connection waiting to be torn down after the transition.
    WaitingDisconnect,
}

impl ConnectionKind {
    /// Wire code used in the handshake.
    pub fn code(self) -> u8 {
        match self {
            Self::Current => 0,
            Self::Transitioning => 1,
            Self::WaitingDisconnect => 2,
        }
    }

    /// Parses a kind from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Current,
            1 => Self::Transitioning,
            2 => Self::WaitingDisconnect,
            _ => return None,
        })
    }
}

/// Computes the local delegate's role for a boundary between two committees.
pub fn transition_role(
    outgoing: &[DelegateInfo],
    incoming: &[DelegateInfo],
    account: &AccountAddress,
) -> TransitionRole {
    let in_outgoing = outgoing.iter().any(|d| d.account == *account);
    let in_incoming = incoming.iter().any(|d| d.account == *account);
    match (in_outgoing, in_incoming) {
        (true, true) => TransitionRole::Persistent,
        (true, false) => TransitionRole::Retiring,
        (false, true) => TransitionRole::New,
        (false, false) => TransitionRole::None,
    }
}

/// The delegate id of an account within a committee.
pub fn delegate_id_of(delegates: &[DelegateInfo], account: &AccountAddress) -> Option<DelegateId> {
    delegates
        .iter()
        .position(|d| d.account == *account)
        .map(|i| DelegateId(i as u8))
}

/// The epoch clock, anchored on the genesis timestamp.
///
/// Epoch 1 spans `[genesis, genesis + EPOCH_INTERVAL)`; the boundary into
/// epoch `N + 1` sits at `genesis + N × EPOCH_INTERVAL`.
#[derive(Debug, Clone, Copy)]
pub struct EpochSchedule {
    genesis_ms: u64,
}

impl EpochSchedule {
    /// Creates a schedule anchored at the genesis timestamp.
    pub fn new(genesis_ms: u64) -> Self {
        Self { genesis_ms }
    }

    /// The epoch running at `now_ms`.
    pub fn epoch_of(&self, now_ms: u64) -> Epoch {
        if now_ms < self.genesis_ms {
            return 1;
        }
        1 + ((now_ms - self.genesis_ms) / EPOCH_INTERVAL.as_millis() as u64) as Epoch
    }

    /// When `epoch` starts (milliseconds since the Unix epoch).
    pub fn epoch_start_ms(&self, epoch: Epoch) -> u64 {
        self.genesis_ms + u64::from(epoch - 1) * EPOCH_INTERVAL.as_millis() as u64
    }

    /// The next epoch boundary at or after `now_ms`.
    pub fn next_boundary_ms(&self, now_ms: u64) -> u64 {
        self.epoch_start_ms(self.epoch_of(now_ms) + 1)
    }

    /// Transition window at `now_ms`.
    pub fn transition_state(&self, now_ms: u64) -> EpochTransitionState {
        let boundary = self.next_boundary_ms(now_ms);
        let since_start = now_ms.saturating_sub(self.epoch_start_ms(self.epoch_of(now_ms)));

        if since_start < EPOCH_START.as_millis() as u64 {
            EpochTransitionState::EpochStart
        } else if boundary - now_ms <= EPOCH_TRANSITION_START.as_millis() as u64 {
            EpochTransitionState::EpochTransitionStart
        } else if boundary - now_ms <= EPOCH_DELEGATES_CONNECT.as_millis() as u64 {
            EpochTransitionState::Connecting
        } else {
            EpochTransitionState::None
        }
    }

    /// Returns `true` inside any boundary window (used to narrow secondary
    /// delays).
    pub fn near_boundary(&self, now_ms: u64) -> bool {
        self.transition_state(now_ms) != EpochTransitionState::None
    }

    /// The next micro-block cut at or after `now_ms`, and whether that cut
    /// closes the epoch.
    pub fn next_micro_cut(&self, now_ms: u64) -> (u64, bool) {
        let interval = MICROBLOCK_INTERVAL.as_millis() as u64;
        let elapsed = now_ms.saturating_sub(self.genesis_ms);
        let cut = self.genesis_ms + (elapsed / interval + 1) * interval;
        let boundary = self.next_boundary_ms(now_ms);
        (cut.min(boundary), cut >= boundary)
    }
}

/// The governance recall flag. While raised, the in-flight epoch proposal
/// is void and a replacement is expected in the next proposal window.
#[derive(Debug, Default)]
pub struct RecallHandler {
    raised: AtomicBool,
}

impl RecallHandler {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Lowers the flag (after the replacement committed).
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while a recall is in force.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Handles to the three consensus engines of one epoch.
#[derive(Debug)]
pub struct EpochManager {
    epoch: Epoch,
    role: TransitionRole,
    engines: HashMap<ChainKind, mpsc::UnboundedSender<EngineEvent>>,
}

/// Everything the engines of one epoch share.
pub struct EpochManagerConfig {
    /// The served epoch.
    pub epoch: Epoch,
    /// The local delegate's id within the epoch's committee.
    pub local_id: DelegateId,
    /// The local delegate's role in the surrounding transition.
    pub role: TransitionRole,
    /// The local BLS keys.
    pub keys: Arc<BlsKeyPair>,
    /// Key table of the committee.
    pub key_store: Arc<DelegateKeyStore>,
    /// The ledger store.
    pub db: Arc<dyn Database>,
    /// Shared reservation cache.
    pub reservations: Arc<Mutex<Reservations>>,
    /// Shared request pipeline.
    pub pipeline: Arc<Mutex<RequestPipeline>>,
    /// Writer-domain handle.
    pub cache: CacheHandle,
    /// Outgoing messages.
    pub sink: Arc<dyn MessageSink>,
}

impl std::fmt::Debug for EpochManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochManagerConfig")
            .field("epoch", &self.epoch)
            .field("local_id", &self.local_id)
            .field("role", &self.role)
            .finish()
    }
}

impl EpochManager {
    /// Spawns the three engines of an epoch onto the runtime, each with its
    /// own mailbox strand and timer pump.
    pub fn spawn(config: EpochManagerConfig) -> Self {
        let mut engines = HashMap::new();
        for kind in ChainKind::ALL.iter().copied() {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<TimerRequest>();

            // Timer pump: sleeps, then posts back into the mailbox.
            let pump_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(TimerRequest { delay, event }) = timer_rx.recv().await {
                    let pump_tx = pump_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        pump_tx.send(event).ok();
                    });
                }
            });

            let engine = ConsensusManager::new(EngineConfig {
                kind,
                epoch: config.epoch,
                local_id: config.local_id,
                keys: Arc::clone(&config.keys),
                key_store: Arc::clone(&config.key_store),
                db: Arc::clone(&config.db),
                reservations: Arc::clone(&config.reservations),
                pipeline: if kind == ChainKind::Request {
                    Some(Arc::clone(&config.pipeline))
                } else {
                    None
                },
                cache: config.cache.clone(),
                sink: Arc::clone(&config.sink),
                timers: timer_tx,
            });
            tokio::spawn(engine.run(event_rx));
            engines.insert(kind, event_tx);
        }

        info!(
            "epoch {} engines started (role {:?})",
            config.epoch, config.role
        );
        Self {
            epoch: config.epoch,
            role: config.role,
            engines,
        }
    }

    /// The epoch these engines serve.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The local role in the surrounding transition.
    pub fn role(&self) -> TransitionRole {
        self.role
    }

    /// Marks the manager's role.
    pub fn set_role(&mut self, role: TransitionRole) {
        self.role = role;
    }

    /// Posts an event to one engine's mailbox.
    pub fn post(&self, kind: ChainKind, event: EngineEvent) {
        if let Some(engine) = self.engines.get(&kind) {
            engine.send(event).ok();
        }
    }

    /// Sender for one engine's mailbox.
    pub fn mailbox(&self, kind: ChainKind) -> Option<mpsc::UnboundedSender<EngineEvent>> {
        self.engines.get(&kind).cloned()
    }

    /// Stops every engine of the epoch.
    pub fn shutdown(&self) {
        for engine in self.engines.values() {
            engine.send(EngineEvent::Shutdown).ok();
        }
    }
}

/// Routing decision for an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Deliver to the engines of the current epoch.
    Current,
    /// Deliver to the engines of the incoming epoch.
    Transitioning,
    /// Drop: no engine set serves this epoch.
    Unroutable,
    /// Drop: the epoch number is implausibly far ahead.
    Bogus,
}

/// Owns the engine sets across epoch transitions and demultiplexes
/// incoming messages by epoch number.
#[derive(Debug)]
pub struct EpochSupervisor {
    current: EpochManager,
    transitioning: Option<EpochManager>,
    recall: Arc<RecallHandler>,
}

impl EpochSupervisor {
    /// Creates a supervisor over the first engine set.
    pub fn new(current: EpochManager, recall: Arc<RecallHandler>) -> Self {
        Self {
            current,
            transitioning: None,
            recall,
        }
    }

    /// The running epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.current.epoch()
    }

    /// The current engine set.
    pub fn current(&self) -> &EpochManager {
        &self.current
    }

    /// Registers the engine set of the incoming epoch (Connecting window).
    pub fn begin_transition(&mut self, incoming: EpochManager) {
        info!("transition to epoch {} begins", incoming.epoch());
        self.transitioning = Some(incoming);
    }

    /// Classifies an epoch number against the engine sets.
    pub fn route(&self, epoch: Epoch) -> RouteDecision {
        if epoch > self.current.epoch() + INVALID_EPOCH_GAP {
            return RouteDecision::Bogus;
        }
        if epoch == self.current.epoch() {
            return RouteDecision::Current;
        }
        match &self.transitioning {
            Some(manager) if manager.epoch() == epoch => RouteDecision::Transitioning,
            _ => RouteDecision::Unroutable,
        }
    }

    /// Delivers a peer message to the engine set serving its epoch.
    pub fn deliver(&self, epoch: Epoch, from: DelegateId, message: PeerMessage) {
        let kind = match message.consensus_kind() {
            Some(kind) => kind,
            None => return,
        };
        let manager = match self.route(epoch) {
            RouteDecision::Current => &self.current,
            RouteDecision::Transitioning => match &self.transitioning {
                Some(manager) => manager,
                None => return,
            },
            RouteDecision::Unroutable => {
                trace!("no engine set serves epoch {}; dropping {}", epoch, message);
                return;
            }
            RouteDecision::Bogus => {
                warn!(
                    "message {} claims epoch {} (> current + {}); dropping as bogus",
                    message, epoch, INVALID_EPOCH_GAP
                );
                return;
            }
        };
        if manager.role() == TransitionRole::PersistentRejecting
            && matches!(message, PeerMessage::PrePrepare { .. })
        {
            trace!("rejecting role ignores proposals of epoch {}", epoch);
            return;
        }
        manager.post(kind, EngineEvent::Peer { from, message });
    }

    /// The boundary passed: the incoming set assumes responsibility, the
    /// outgoing one drains. Returns the retired manager so the caller can
    /// drain its PostCommits before shutdown.
    pub fn epoch_start(&mut self) -> Option<EpochManager> {
        let incoming = self.transitioning.take()?;
        info!(
            "epoch start: epoch {} engines assume responsibility",
            incoming.epoch()
        );
        let mut retired = std::mem::replace(&mut self.current, incoming);
        retired.set_role(TransitionRole::RetiringForwardOnly);
        Some(retired)
    }

    /// Raises the recall flag and voids the in-flight epoch proposal.
    pub fn recall(&self) {
        self.recall.raise();
        self.current.post(ChainKind::Epoch, EngineEvent::Recall);
        if let Some(manager) = &self.transitioning {
            manager.post(ChainKind::Epoch, EngineEvent::Recall);
        }
    }
}

/// Drives the epoch and micro-block clocks: fires micro-block proposals on
/// the cut interval and the epoch proposal at each boundary, and promotes
/// the engine sets through the transition windows.
pub async fn run_event_proposer(
    schedule: EpochSchedule,
    db: Arc<dyn Database>,
    supervisor: Arc<Mutex<EpochSupervisor>>,
    local_account: AccountAddress,
    skip_first: bool,
) {
    use trilith::persistence::{epoch as epoch_persistence, micro as micro_persistence};
    use trilith::schema::LedgerSchema;

    let mut skip = skip_first;
    loop {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        let (cut_ms, closes_epoch) = schedule.next_micro_cut(now);
        let delay = Duration::from_millis(cut_ms.saturating_sub(now));
        tokio::time::sleep(delay).await;

        if skip {
            // After a recall the nearest cut is skipped to let the
            // replacement election settle.
            skip = false;
            continue;
        }

        let now = chrono::Utc::now().timestamp_millis() as u64;
        let epoch = schedule.epoch_of(cut_ms.saturating_sub(1));
        let snapshot = db.snapshot();
        let schema = LedgerSchema::new(&*snapshot);
        let delegates = match schema.delegates(epoch) {
            Some(delegates) => delegates,
            None => {
                warn!("no committee known for epoch {}; skipping cut", epoch);
                continue;
            }
        };
        let local_id = match delegate_id_of(&delegates, &local_account) {
            Some(id) => id,
            // Observers do not propose.
            None => continue,
        };

        let supervisor = supervisor.lock().expect("supervisor lock");
        let micro = micro_persistence::build(&schema, epoch, now, local_id, closes_epoch);
        if crate::consensus::expected_primary(ChainKind::Micro, epoch, micro.sequence)
            == Some(local_id)
        {
            supervisor.current().post(
                ChainKind::Micro,
                EngineEvent::Propose(trilith::blocks::Block::Micro(micro)),
            );
        }

        if closes_epoch {
            // The epoch block carries the next committee; without elections
            // in the core, the sitting committee is carried over.
            let block =
                epoch_persistence::build(&schema, epoch, now, local_id, delegates.clone());
            if crate::consensus::expected_primary(ChainKind::Epoch, epoch, block.epoch)
                == Some(local_id)
            {
                supervisor.current().post(
                    ChainKind::Epoch,
                    EngineEvent::Propose(trilith::blocks::Block::Epoch(block)),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith::types::Amount;

    fn committee(accounts: &[u8]) -> Vec<DelegateInfo> {
        accounts
            .iter()
            .map(|&a| DelegateInfo {
                account: AccountAddress([a; 32]),
                bls_key: trilith_crypto::bls::BlsPublicKey::from_bytes_unchecked([a; 48]),
                vote_weight: Amount(1),
                stake: Amount(1),
            })
            .collect()
    }

    #[test]
    fn roles_across_a_boundary() {
        let outgoing = committee(&[1, 2, 3]);
        let incoming = committee(&[2, 3, 4]);

        let role = |a: u8| transition_role(&outgoing, &incoming, &AccountAddress([a; 32]));
        assert_eq!(role(1), TransitionRole::Retiring);
        assert_eq!(role(2), TransitionRole::Persistent);
        assert_eq!(role(4), TransitionRole::New);
        assert_eq!(role(9), TransitionRole::None);
    }

    #[test]
    fn schedule_windows() {
        let interval = EPOCH_INTERVAL.as_millis() as u64;
        let schedule = EpochSchedule::new(0);

        assert_eq!(schedule.epoch_of(0), 1);
        assert_eq!(schedule.epoch_of(interval - 1), 1);
        assert_eq!(schedule.epoch_of(interval), 2);
        assert_eq!(schedule.epoch_start_ms(2), interval);

        // Windows around the first boundary.
        let boundary = interval;
        let connect = EPOCH_DELEGATES_CONNECT.as_millis() as u64;
        let start = EPOCH_TRANSITION_START.as_millis() as u64;
        let epoch_start = EPOCH_START.as_millis() as u64;

        assert_eq!(
            schedule.transition_state(boundary - connect + 1),
            EpochTransitionState::Connecting
        );
        assert_eq!(
            schedule.transition_state(boundary - start + 1),
            EpochTransitionState::EpochTransitionStart
        );
        assert_eq!(
            schedule.transition_state(boundary + epoch_start - 1),
            EpochTransitionState::EpochStart
        );
        assert_eq!(
            schedule.transition_state(boundary / 2),
            EpochTransitionState::None
        );
        assert!(schedule.near_boundary(boundary - 1));
        assert!(!schedule.near_boundary(boundary / 2));
    }

    #[test]
    fn micro_cuts_align_to_the_interval_and_stop_at_the_boundary() {
        let interval = MICROBLOCK_INTERVAL.as_millis() as u64;
        let schedule = EpochSchedule::new(0);

        let (cut, closes) = schedule.next_micro_cut(1);
        assert_eq!(cut, interval);
        assert!(!closes);

        // The cut that would land on the boundary closes the epoch.
        let boundary = EPOCH_INTERVAL.as_millis() as u64;
        let (cut, closes) = schedule.next_micro_cut(boundary - interval + 1);
        assert_eq!(cut, boundary);
        assert!(closes);
    }
}
