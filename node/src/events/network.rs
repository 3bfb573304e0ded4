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

//! Authenticated TCP channels between delegates.
//!
//! Connections are keyed `(epoch, remote delegate id, connection kind)`:
//! a delegate may hold one map of channels for the running epoch and a
//! second one for the incoming epoch during transitions. On connect each
//! side sends a `ConnectedClientIds` handshake; the receiver binds the
//! socket to the matching key.
//!
//! Sends are buffered per socket in a bounded FIFO drained by a single
//! writer task, so serialized writes on one socket never interleave.
//! An idle channel emits heart-beats; a channel idle past the inactivity
//! timeout is closed.

use anyhow::{bail, format_err};
use futures::{SinkExt, StreamExt};
use log::{info, trace, warn};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use std::{
    collections::HashMap,
    net::SocketAddr,
    ops,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use crate::{
    consensus::MessageSink,
    epoch::ConnectionKind,
    events::codec::MessagesCodec,
    messages::{ConnectedClientIds, PeerMessage},
};
use trilith::types::{DelegateId, Epoch};

/// Capacity of a per-socket send queue.
const OUTGOING_CHANNEL_SIZE: usize = 64;

/// Network tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfiguration {
    /// Maximum accepted payload length.
    pub max_message_len: u32,
    /// Delay between connect retries, in milliseconds.
    pub tcp_connect_retry_timeout: u64,
    /// Number of connect attempts before giving up.
    pub tcp_connect_max_retries: usize,
    /// An idle channel emits a heart-beat this often.
    pub heartbeat_interval: Duration,
    /// A channel idle past this duration is closed.
    pub inactivity_timeout: Duration,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            max_message_len: 64 * 1024 * 1024,
            tcp_connect_retry_timeout: 1_000,
            tcp_connect_max_retries: 10,
            heartbeat_interval: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

/// Key of one delegate channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Epoch the channel belongs to.
    pub epoch: Epoch,
    /// The remote delegate.
    pub delegate: DelegateId,
    /// Current / transitioning / waiting-disconnect.
    pub kind: ConnectionKind,
}

/// Events surfaced by the network part.
#[derive(Debug)]
pub enum NetworkEvent {
    /// A message arrived on a bound channel.
    MessageReceived {
        /// Epoch of the channel the message arrived on.
        epoch: Epoch,
        /// The sending delegate.
        from: DelegateId,
        /// The message.
        message: PeerMessage,
    },
    /// A channel completed its handshake.
    PeerConnected(ConnectionKey),
    /// A channel was closed or lost.
    PeerDisconnected(ConnectionKey),
}

#[derive(Debug, Clone)]
struct ConnectionPoolEntry {
    sender: mpsc::Sender<PeerMessage>,
    id: u64,
}

#[derive(Debug)]
struct ConnectionPool {
    peers: HashMap<ConnectionKey, ConnectionPoolEntry>,
    next_connection_id: u64,
}

impl ConnectionPool {
    fn new() -> Self {
        Self {
            peers: HashMap::new(),
            next_connection_id: 0,
        }
    }

    fn add(&mut self, key: ConnectionKey) -> (mpsc::Receiver<PeerMessage>, u64) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        let (sender, receiver) = mpsc::channel(OUTGOING_CHANNEL_SIZE);
        self.peers.insert(key, ConnectionPoolEntry { sender, id });
        (receiver, id)
    }

    fn remove(&mut self, key: &ConnectionKey, connection_id: Option<u64>) -> bool {
        if let Some(entry) = self.peers.get(key) {
            if connection_id.map_or(true, |id| id == entry.id) {
                self.peers.remove(key);
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone)]
struct SharedConnectionPool {
    inner: Arc<RwLock<ConnectionPool>>,
}

impl SharedConnectionPool {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConnectionPool::new())),
        }
    }

    fn read(&self) -> impl ops::Deref<Target = ConnectionPool> + '_ {
        self.inner.read().unwrap()
    }

    fn write(&self) -> impl ops::DerefMut<Target = ConnectionPool> + '_ {
        self.inner.write().unwrap()
    }

    /// Queues a message onto the socket's FIFO. Never blocks: an engine
    /// must not stall on a slow peer, so a full queue drops the message and
    /// relies on the consensus retry machinery.
    fn queue_message(&self, key: &ConnectionKey, message: PeerMessage) {
        let entry = self.read().peers.get(key).cloned();
        if let Some(entry) = entry {
            if entry.sender.try_send(message).is_err() {
                warn!("send queue to {:?} is full; dropping message", key);
            }
        }
    }
}

/// The network part: listener, connector and the connection pool.
#[derive(Clone)]
pub struct DelegateNetwork {
    local: ConnectedClientIds,
    config: NetworkConfiguration,
    pool: SharedConnectionPool,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl std::fmt::Debug for DelegateNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateNetwork")
            .field("local", &self.local)
            .finish()
    }
}

impl DelegateNetwork {
    /// Creates the network part. Events are surfaced on the returned
    /// receiver.
    pub fn new(
        local: ConnectedClientIds,
        config: NetworkConfiguration,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                config,
                pool: SharedConnectionPool::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Accepts incoming delegate connections forever.
    pub async fn listen(self, listen_address: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&listen_address).await?;
        info!("listening for delegate connections on {}", listen_address);
        loop {
            let (socket, peer_address) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_incoming(socket).await {
                    warn!("incoming connection from {} failed: {}", peer_address, e);
                }
            });
        }
    }

    async fn handle_incoming(&self, socket: TcpStream) -> anyhow::Result<()> {
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, MessagesCodec::new(self.config.max_message_len));

        // The remote speaks first; we answer with our own identity.
        let remote = match framed.next().await {
            Some(Ok(PeerMessage::ConnectedClientIds(ids))) => ids,
            Some(Ok(other)) => bail!("first message from peer is {}, not a handshake", other),
            Some(Err(e)) => return Err(e),
            None => bail!("peer closed before the handshake"),
        };
        framed
            .send(PeerMessage::ConnectedClientIds(self.local.clone()))
            .await?;
        self.bind_connection(remote, framed).await
    }

    /// Opens a channel to a delegate and binds it into the pool.
    pub async fn connect(
        &self,
        address: SocketAddr,
        key: ConnectionKey,
    ) -> anyhow::Result<()> {
        let mut attempt = 0;
        let socket = loop {
            match TcpStream::connect(&address).await {
                Ok(socket) => break socket,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.tcp_connect_max_retries {
                        return Err(format_err!(
                            "connecting to {} failed after {} attempts: {}",
                            address,
                            attempt,
                            e
                        ));
                    }
                    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.0);
                    let delay = Duration::from_millis(
                        (self.config.tcp_connect_retry_timeout as f64 * jitter) as u64,
                    );
                    trace!("retrying connect to {} in {:?}", address, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        };
        socket.set_nodelay(true)?;

        let mut framed = Framed::new(socket, MessagesCodec::new(self.config.max_message_len));
        let mut local = self.local.clone();
        local.epoch = key.epoch;
        local.connection_kind = key.kind.code();
        framed.send(PeerMessage::ConnectedClientIds(local)).await?;
        let remote = match framed.next().await {
            Some(Ok(PeerMessage::ConnectedClientIds(ids))) => ids,
            Some(Ok(other)) => bail!("handshake answer is {}, not ConnectedClientIds", other),
            Some(Err(e)) => return Err(e),
            None => bail!("peer closed during the handshake"),
        };
        if remote.delegate_id != key.delegate {
            bail!(
                "connected to delegate {} but expected {}",
                remote.delegate_id,
                key.delegate
            );
        }
        self.bind_connection(remote, framed).await
    }

    async fn bind_connection(
        &self,
        remote: ConnectedClientIds,
        framed: Framed<TcpStream, MessagesCodec>,
    ) -> anyhow::Result<()> {
        let kind = ConnectionKind::from_code(remote.connection_kind)
            .ok_or_else(|| format_err!("unknown connection kind {}", remote.connection_kind))?;
        let key = ConnectionKey {
            epoch: remote.epoch,
            delegate: remote.delegate_id,
            kind,
        };
        let (receiver, connection_id) = self.pool.write().add(key);
        self.events_tx.send(NetworkEvent::PeerConnected(key)).ok();
        trace!("channel {:?} established", key);

        let result = self.process_messages(key, framed, receiver).await;
        if self.pool.write().remove(&key, Some(connection_id)) {
            self.events_tx
                .send(NetworkEvent::PeerDisconnected(key))
                .ok();
        }
        result
    }

    /// Drives one channel: a single writer drains the send FIFO (framing
    /// never interleaves), reads dispatch upward, heart-beats cover idle
    /// gaps and the inactivity timeout reaps dead peers.
    async fn process_messages(
        &self,
        key: ConnectionKey,
        framed: Framed<TcpStream, MessagesCodec>,
        mut outgoing: mpsc::Receiver<PeerMessage>,
    ) -> anyhow::Result<()> {
        let (mut sink, mut stream) = framed.split();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                queued = outgoing.recv() => match queued {
                    Some(message) => sink.send(message).await?,
                    None => break,
                },
                received = stream.next() => match received {
                    Some(Ok(PeerMessage::HeartBeat)) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(message)) => {
                        last_activity = Instant::now();
                        self.events_tx
                            .send(NetworkEvent::MessageReceived {
                                epoch: key.epoch,
                                from: key.delegate,
                                message,
                            })
                            .ok();
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() >= self.config.inactivity_timeout {
                        bail!("channel {:?} idle past the inactivity timeout", key);
                    }
                    sink.send(PeerMessage::HeartBeat).await?;
                }
            }
        }
        Ok(())
    }

    /// Closes every channel of the given epoch (Transition End).
    pub fn disconnect_epoch(&self, epoch: Epoch) {
        let keys: Vec<ConnectionKey> = self
            .pool
            .read()
            .peers
            .keys()
            .filter(|key| key.epoch == epoch)
            .copied()
            .collect();
        let mut pool = self.pool.write();
        for key in keys {
            pool.remove(&key, None);
        }
    }
}

impl MessageSink for DelegateNetwork {
    fn broadcast(&self, epoch: Epoch, message: PeerMessage) {
        let keys: Vec<ConnectionKey> = self
            .pool
            .read()
            .peers
            .keys()
            .filter(|key| key.epoch == epoch && key.kind != ConnectionKind::WaitingDisconnect)
            .copied()
            .collect();
        for key in keys {
            self.pool.queue_message(&key, message.clone());
        }
    }

    fn send_to(&self, epoch: Epoch, to: DelegateId, message: PeerMessage) {
        let keys: Vec<ConnectionKey> = self
            .pool
            .read()
            .peers
            .keys()
            .filter(|key| key.epoch == epoch && key.delegate == to)
            .copied()
            .collect();
        match keys.first() {
            Some(key) => self.pool.queue_message(key, message),
            None => trace!("no channel to delegate {} in epoch {}", to, epoch),
        }
    }
}
