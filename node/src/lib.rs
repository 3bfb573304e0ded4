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

//! Trilith node: delegated BFT consensus over the Trilith ledger.
//!
//! The node assembles the core subsystems around three ownership domains:
//!
//! - **engine domain** — one single-threaded consensus engine per
//!   `(chain kind, epoch)`, each serialized by its own mailbox;
//! - **writer domain** — exactly one task owns the store's write path,
//!   draining the pending-block cache in dependency order;
//! - **network I/O domain** — socket tasks that only parse framing and
//!   dispatch into engine mailboxes.
//!
//! [`Node`] wires them together from a [`NodeConfig`].

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]

pub mod cache;
pub mod callback;
pub mod config;
pub mod consensus;
pub mod epoch;
pub mod events;
pub mod keys;
pub mod messages;
pub mod pipeline;
pub mod quorum;
pub mod timeouts;
pub mod tx_acceptor;

pub use crate::config::NodeConfig;

use anyhow::Context;
use log::{info, warn};
use tokio::sync::mpsc;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    cache::spawn_writer,
    consensus::MessageSink,
    epoch::{
        delegate_id_of, transition_role, ConnectionKind, EpochManager, EpochManagerConfig,
        EpochSchedule, EpochSupervisor, RecallHandler, TransitionRole,
    },
    events::{ConnectionKey, DelegateNetwork, NetworkConfiguration, NetworkEvent},
    keys::ValidatorBuilder,
    messages::{ConnectedClientIds, PeerMessage},
    pipeline::RequestPipeline,
    tx_acceptor::AdmissionHandle,
};
use trilith::{
    blocks::Block,
    constants::{EPOCH_DELEGATES_CONNECT, EPOCH_TRANSITION_END},
    genesis,
    persistence::reservations::Reservations,
    schema::LedgerSchema,
    types::{ChainKind, DelegateId, Epoch},
};
use trilith_crypto::bls::BlsKeyPair;
use trilith_storage::Database;

/// A fully wired Trilith node.
pub struct Node {
    db: Arc<dyn Database>,
    config: NodeConfig,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("delegate_id", &self.config.delegate_id)
            .finish()
    }
}

impl Node {
    /// Creates a node over an opened store.
    pub fn new(db: Arc<dyn Database>, config: NodeConfig) -> Self {
        Self { db, config }
    }

    /// Runs the node until interrupted.
    pub async fn run(self) -> anyhow::Result<()> {
        let Node { db, config } = self;

        genesis::initialize(&*db, &config.genesis).context("genesis initialization failed")?;
        let schedule = EpochSchedule::new(config.genesis.timestamp);
        let now = chrono::Utc::now().timestamp_millis() as u64;
        let epoch = schedule.epoch_of(now);
        let local_id = config.local_delegate_id();

        let secret = hex::decode(&config.bls_secret).context("bls_secret is not hex")?;
        let keys = Arc::new(BlsKeyPair::from_secret_bytes(&secret).map_err(|e| {
            anyhow::format_err!("bls_secret does not decode to a key: {}", e)
        })?);

        let reservations = Arc::new(Mutex::new(Reservations::new()));
        let pipeline = Arc::new(Mutex::new(RequestPipeline::new()));
        let (cache_handle, mut committed_rx) = spawn_writer(Arc::clone(&db), Arc::clone(&reservations));

        let validators = Arc::new(ValidatorBuilder::new(Arc::clone(&db)));
        let key_store = validators
            .key_store(epoch)
            .context("no delegate committee for the current epoch")?;
        let local_account = {
            let snapshot = db.snapshot();
            let schema = LedgerSchema::new(&*snapshot);
            schema
                .delegates(epoch)
                .and_then(|set| set.get(local_id.index()).map(|delegate| delegate.account))
        }
        .context("local delegate id outside the committee")?;

        // Network part.
        let listen_address: SocketAddr =
            format!("{}:{}", config.local_address, config.peer_port).parse()?;
        let local_ids = ConnectedClientIds {
            epoch,
            delegate_id: local_id,
            connection_kind: ConnectionKind::Current.code(),
            ip: listen_address.to_string(),
        };
        let network_config = NetworkConfiguration {
            max_message_len: config.network.max_message_len,
            tcp_connect_retry_timeout: config.network.tcp_connect_retry_timeout,
            tcp_connect_max_retries: config.network.tcp_connect_max_retries,
            heartbeat_interval: Duration::from_secs(config.network.heartbeat_interval_secs),
            inactivity_timeout: Duration::from_secs(config.network.inactivity_timeout_secs),
        };
        let (network, network_events) = DelegateNetwork::new(local_ids, network_config);
        tokio::spawn({
            let network = network.clone();
            async move {
                if let Err(e) = network.listen(listen_address).await {
                    warn!("delegate listener failed: {}", e);
                }
            }
        });
        connect_to_peers(&network, &config, epoch, local_id, ConnectionKind::Current);

        // Engine domain of the current epoch.
        let sink: Arc<dyn MessageSink> = Arc::new(network.clone());
        let manager = EpochManager::spawn(EpochManagerConfig {
            epoch,
            local_id,
            role: TransitionRole::Persistent,
            keys: Arc::clone(&keys),
            key_store,
            db: Arc::clone(&db),
            reservations: Arc::clone(&reservations),
            pipeline: Arc::clone(&pipeline),
            cache: cache_handle.clone(),
            sink: Arc::clone(&sink),
        });
        let recall = Arc::new(RecallHandler::new());
        let supervisor = Arc::new(Mutex::new(EpochSupervisor::new(manager, recall)));

        // Network I/O domain: parse-and-dispatch only.
        tokio::spawn(route_network_events(
            Arc::clone(&db),
            Arc::clone(&supervisor),
            network.clone(),
            network_events,
        ));

        // Committed-block fan-out: pipeline cleanup plus the webhook.
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        if let Some(url) = config.callback_url() {
            tokio::spawn(callback::run_callback(url, callback_rx));
        }
        tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                while let Some(block) = committed_rx.recv().await {
                    if let Block::Request(request_block) = &block {
                        pipeline
                            .lock()
                            .expect("pipeline lock")
                            .on_post_commit(request_block);
                    }
                    callback_tx.send(block).ok();
                }
            }
        });

        // Admission channels.
        let admission = AdmissionHandle::with_resolver({
            let supervisor = Arc::clone(&supervisor);
            move || {
                supervisor
                    .lock()
                    .expect("supervisor lock")
                    .current()
                    .mailbox(ChainKind::Request)
            }
        });
        let json_address: SocketAddr = format!(
            "{}:{}",
            config.local_address, config.tx_acceptor_config.json_port
        )
        .parse()?;
        let bin_address: SocketAddr = format!(
            "{}:{}",
            config.local_address, config.tx_acceptor_config.bin_port
        )
        .parse()?;
        tokio::spawn({
            let admission = admission.clone();
            async move {
                if let Err(e) = tx_acceptor::run_json_acceptor(json_address, admission).await {
                    warn!("JSON admission channel failed: {}", e);
                }
            }
        });
        tokio::spawn(async move {
            if let Err(e) = tx_acceptor::run_bin_acceptor(bin_address, admission).await {
                warn!("binary admission channel failed: {}", e);
            }
        });

        // Epoch clock: micro cuts, epoch proposals and set rotation.
        tokio::spawn(epoch::run_event_proposer(
            schedule,
            Arc::clone(&db),
            Arc::clone(&supervisor),
            local_account,
            false,
        ));
        tokio::spawn(run_transition_driver(
            schedule,
            Arc::clone(&db),
            Arc::clone(&supervisor),
            Arc::clone(&validators),
            network.clone(),
            config.clone(),
            Arc::clone(&keys),
            Arc::clone(&reservations),
            Arc::clone(&pipeline),
            cache_handle.clone(),
            sink,
            local_account,
        ));

        info!(
            "node up: delegate {} in epoch {}, listening on {}",
            local_id, epoch, listen_address
        );
        tokio::signal::ctrl_c().await?;
        info!("shutting down: engines first, writer drains, sockets close");
        supervisor.lock().expect("supervisor lock").current().shutdown();
        Ok(())
    }
}

fn connect_to_peers(
    network: &DelegateNetwork,
    config: &NodeConfig,
    epoch: Epoch,
    local_id: DelegateId,
    kind: ConnectionKind,
) {
    for peer in &config.delegates {
        // Lower ids dial higher ids; the reverse direction arrives through
        // the listener, so each pair holds exactly one channel.
        if peer.id <= local_id.0 {
            continue;
        }
        let address = match config.peer_address(DelegateId(peer.id)) {
            Some(address) => address,
            None => continue,
        };
        let key = ConnectionKey {
            epoch,
            delegate: DelegateId(peer.id),
            kind,
        };
        let network = network.clone();
        tokio::spawn(async move {
            if let Err(e) = network.connect(address, key).await {
                warn!("cannot reach delegate {}: {}", key.delegate, e);
            }
        });
    }
}

/// Routes network events: answers tip/pull service queries locally, hands
/// consensus messages to the engine set serving their epoch.
async fn route_network_events(
    db: Arc<dyn Database>,
    supervisor: Arc<Mutex<EpochSupervisor>>,
    network: DelegateNetwork,
    mut events: mpsc::UnboundedReceiver<NetworkEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::MessageReceived {
                epoch,
                from,
                message,
            } => match message {
                PeerMessage::TipRequest => {
                    let snapshot = db.snapshot();
                    let schema = LedgerSchema::new(&*snapshot);
                    let response = PeerMessage::TipResponse {
                        request_tips: schema.request_tips(),
                        micro_tip: schema.micro_tip(),
                        epoch_tip: schema.epoch_tip(),
                    };
                    network.send_to(epoch, from, response);
                }
                PeerMessage::PullRequest { hash } => {
                    let snapshot = db.snapshot();
                    let schema = LedgerSchema::new(&*snapshot);
                    let block = schema
                        .request_block(&hash)
                        .map(Block::Request)
                        .or_else(|| schema.micro_block(&hash).map(Block::Micro))
                        .or_else(|| schema.epoch_block(&hash).map(Block::Epoch));
                    network.send_to(epoch, from, PeerMessage::PullResponse { block });
                }
                PeerMessage::KeyAdvert {
                    epoch: advertised,
                    delegate,
                    ..
                } => {
                    // Keys are installed from epoch blocks; advertisements
                    // only corroborate them.
                    log::trace!("delegate {} advertised a key for epoch {}", delegate, advertised);
                }
                message => {
                    supervisor
                        .lock()
                        .expect("supervisor lock")
                        .deliver(epoch, from, message);
                }
            },
            NetworkEvent::PeerConnected(key) => {
                log::trace!("channel {:?} up", key);
            }
            NetworkEvent::PeerDisconnected(key) => {
                log::trace!("channel {:?} down", key);
            }
        }
    }
}

/// Walks the epoch-transition timeline: spawns the incoming engine set in
/// the Connecting window, promotes it at the boundary and retires the
/// outgoing set after the grace period.
#[allow(clippy::too_many_arguments)]
async fn run_transition_driver(
    schedule: EpochSchedule,
    db: Arc<dyn Database>,
    supervisor: Arc<Mutex<EpochSupervisor>>,
    validators: Arc<ValidatorBuilder>,
    network: DelegateNetwork,
    config: NodeConfig,
    keys: Arc<BlsKeyPair>,
    reservations: Arc<Mutex<Reservations>>,
    pipeline: Arc<Mutex<RequestPipeline>>,
    cache: cache::CacheHandle,
    sink: Arc<dyn MessageSink>,
    local_account: trilith::types::AccountAddress,
) {
    loop {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        let boundary = schedule.next_boundary_ms(now);
        let connect_at = boundary.saturating_sub(EPOCH_DELEGATES_CONNECT.as_millis() as u64);

        if connect_at > now {
            tokio::time::sleep(Duration::from_millis(connect_at - now)).await;
        }

        let outgoing_epoch = schedule.epoch_of(boundary.saturating_sub(1));
        let incoming_epoch = outgoing_epoch + 1;
        let incoming_store = match validators.key_store(incoming_epoch) {
            Some(store) => store,
            None => {
                warn!(
                    "no committee for epoch {}; transition deferred",
                    incoming_epoch
                );
                tokio::time::sleep(Duration::from_millis(
                    boundary.saturating_sub(chrono::Utc::now().timestamp_millis() as u64) + 1_000,
                ))
                .await;
                continue;
            }
        };

        let role = {
            let snapshot = db.snapshot();
            let schema = LedgerSchema::new(&*snapshot);
            match (
                schema.delegates(outgoing_epoch),
                schema.delegates(incoming_epoch),
            ) {
                (Some(outgoing), Some(incoming)) => {
                    transition_role(&outgoing, &incoming, &local_account)
                }
                _ => TransitionRole::Persistent,
            }
        };
        info!(
            "epoch transition {} -> {}: local role {:?}",
            outgoing_epoch, incoming_epoch, role
        );

        if role != TransitionRole::Retiring && role != TransitionRole::None {
            let local_id = {
                let snapshot = db.snapshot();
                let schema = LedgerSchema::new(&*snapshot);
                schema
                    .delegates(incoming_epoch)
                    .and_then(|set| delegate_id_of(&set, &local_account))
            };
            if let Some(local_id) = local_id {
                let incoming = EpochManager::spawn(EpochManagerConfig {
                    epoch: incoming_epoch,
                    local_id,
                    role,
                    keys: Arc::clone(&keys),
                    key_store: incoming_store,
                    db: Arc::clone(&db),
                    reservations: Arc::clone(&reservations),
                    pipeline: Arc::clone(&pipeline),
                    cache: cache.clone(),
                    sink: Arc::clone(&sink),
                });
                supervisor
                    .lock()
                    .expect("supervisor lock")
                    .begin_transition(incoming);
                connect_to_peers(
                    &network,
                    &config,
                    incoming_epoch,
                    config.local_delegate_id(),
                    ConnectionKind::Transitioning,
                );
            }
        }

        // Wait out TransitionStart and cross the boundary.
        let now = chrono::Utc::now().timestamp_millis() as u64;
        if boundary > now {
            tokio::time::sleep(Duration::from_millis(boundary - now)).await;
        }
        let retired = supervisor.lock().expect("supervisor lock").epoch_start();

        // Retiring delegates drain PostCommits through the grace period,
        // then their channels close.
        if let Some(retired) = retired {
            let network = network.clone();
            tokio::spawn(async move {
                tokio::time::sleep(EPOCH_TRANSITION_END).await;
                retired.shutdown();
                network.disconnect_epoch(retired.epoch());
                info!("epoch {} engines retired", retired.epoch());
            });
        }
    }
}
