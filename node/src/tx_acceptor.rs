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

//! The admission channels.
//!
//! External callers submit requests over two TCP intakes: a JSON channel
//! (newline-delimited request objects) and a binary channel (the admission
//! framing: `{ version, type = TxAcceptor, reserved, payload_size }` plus
//! the request's canonical encoding). Either channel answers each
//! submission with a JSON line `{ "result": <code>, "hash": <digest> }`.

use log::{info, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};

use std::net::SocketAddr;

use crate::{
    consensus::EngineEvent,
    messages::{MessageHeader, MessageType, HEADER_SIZE},
};
use trilith::{
    persistence::AdmissionOutcome,
    requests::Request,
    wire::{WireDecode, WireEncode},
};
use trilith_crypto::{Hash, ObjectHash};

type EngineResolver =
    dyn Fn() -> Option<mpsc::UnboundedSender<EngineEvent>> + Send + Sync + 'static;

/// Handle through which admission channels reach the request engine of the
/// running epoch. The engine is resolved per submission so the handle stays
/// valid across epoch transitions.
#[derive(Clone)]
pub struct AdmissionHandle {
    resolve: std::sync::Arc<EngineResolver>,
}

impl std::fmt::Debug for AdmissionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdmissionHandle(..)")
    }
}

impl AdmissionHandle {
    /// Creates a handle over a fixed engine mailbox.
    pub fn new(engine: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            resolve: std::sync::Arc::new(move || Some(engine.clone())),
        }
    }

    /// Creates a handle that resolves the engine mailbox per submission.
    pub fn with_resolver<F>(resolve: F) -> Self
    where
        F: Fn() -> Option<mpsc::UnboundedSender<EngineEvent>> + Send + Sync + 'static,
    {
        Self {
            resolve: std::sync::Arc::new(resolve),
        }
    }

    /// Submits a request and waits for its admission outcome.
    pub async fn submit(&self, request: Request) -> (AdmissionOutcome, Hash) {
        let hash = request.object_hash();
        let engine = match (self.resolve)() {
            Some(engine) => engine,
            None => return (AdmissionOutcome::Reserved, hash),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = EngineEvent::Submit {
            request,
            reply: Some(reply_tx),
        };
        if engine.send(event).is_err() {
            return (AdmissionOutcome::Reserved, hash);
        }
        match reply_rx.await {
            Ok(outcome) => (outcome, hash),
            Err(_) => (AdmissionOutcome::Reserved, hash),
        }
    }
}

fn response_line(outcome: AdmissionOutcome, hash: Hash) -> String {
    let body = serde_json::json!({
        "result": outcome.code(),
        "hash": hash.to_hex(),
    });
    format!("{}\n", body)
}

/// Serves the JSON admission channel.
pub async fn run_json_acceptor(
    address: SocketAddr,
    handle: AdmissionHandle,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&address).await?;
    info!("JSON admission channel on {}", address);
    loop {
        let (socket, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_json(socket, handle).await {
                trace!("JSON admission connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_json(socket: TcpStream, handle: AdmissionHandle) -> anyhow::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let (outcome, hash) = handle.submit(request).await;
                response_line(outcome, hash)
            }
            Err(e) => {
                warn!("unparsable JSON submission: {}", e);
                format!("{}\n", serde_json::json!({ "result": "invalid_json" }))
            }
        };
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

/// Serves the binary admission channel.
pub async fn run_bin_acceptor(
    address: SocketAddr,
    handle: AdmissionHandle,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&address).await?;
    info!("binary admission channel on {}", address);
    loop {
        let (socket, peer) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_bin(socket, handle).await {
                trace!("binary admission connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_bin(mut socket: TcpStream, handle: AdmissionHandle) -> anyhow::Result<()> {
    loop {
        let mut header_bytes = [0_u8; HEADER_SIZE];
        if socket.read_exact(&mut header_bytes).await.is_err() {
            return Ok(());
        }
        let header = MessageHeader::from_wire(&header_bytes)?;
        if header.message_type != MessageType::TxAcceptor as u8 {
            anyhow::bail!("admission channel got message type {}", header.message_type);
        }
        let mut payload = vec![0_u8; header.payload_size as usize];
        socket.read_exact(&mut payload).await?;

        let reply = match Request::from_wire(&payload) {
            Ok(request) => {
                let (outcome, hash) = handle.submit(request).await;
                response_line(outcome, hash)
            }
            Err(e) => {
                warn!("unparsable binary submission: {}", e);
                format!("{}\n", serde_json::json!({ "result": "invalid_encoding" }))
            }
        };
        socket.write_all(reply.as_bytes()).await?;
    }
}

/// Frames a request for the binary admission channel (client side; used by
/// tests and by acceptor forwarding).
pub fn frame_submission(request: &Request) -> Vec<u8> {
    let payload = request.to_wire();
    let header = MessageHeader::new(
        MessageType::TxAcceptor,
        crate::messages::NO_CONSENSUS,
        payload.len() as u32,
    );
    let mut frame = header.to_wire();
    frame.extend_from_slice(&payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trilith::types::{AccountAddress, Amount};

    #[tokio::test]
    async fn bin_channel_answers_with_the_outcome() {
        // An engine stub that accepts everything.
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                if let EngineEvent::Submit { reply, .. } = event {
                    if let Some(reply) = reply {
                        reply.send(AdmissionOutcome::Progress).ok();
                    }
                }
            }
        });
        let handle = AdmissionHandle::new(engine_tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve_bin(socket, handle).await.ok();
        });

        let request = Request::send(
            AccountAddress([1; 32]),
            Hash::zero(),
            Amount(1),
            vec![trilith::requests::Transaction::new(
                AccountAddress([2; 32]),
                Amount(5),
            )],
        );
        let expected_hash = request.object_hash();

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(&frame_submission(&request))
            .await
            .unwrap();
        let mut reply = String::new();
        BufReader::new(&mut client)
            .read_line(&mut reply)
            .await
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["result"], "progress");
        assert_eq!(parsed["hash"], expected_hash.to_hex());
    }
}
