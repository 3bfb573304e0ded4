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

//! Node configuration.
//!
//! The on-disk format is a JSON object; see `NodeConfig` for the schema.

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};

use std::{net::SocketAddr, path::Path};

use trilith::genesis::GenesisConfig;
use trilith::types::DelegateId;

/// One delegate peer of the committee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatePeerConfig {
    /// The peer's delegate id.
    pub id: u8,
    /// The peer's IP address.
    pub ip: String,
    /// The peer's delegate-channel port.
    pub peer_port: u16,
}

/// One transaction acceptor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAcceptorEndpoint {
    /// Address the acceptor binds or is reached at.
    pub ip: String,
    /// Port of the acceptor.
    pub port: u16,
}

/// Admission (TxAcceptor) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAcceptorConfig {
    /// Standalone acceptors forwarding to this delegate, if any.
    #[serde(default)]
    pub tx_acceptors: Vec<TxAcceptorEndpoint>,
    /// Port of the JSON admission channel.
    pub json_port: u16,
    /// Port of the binary admission channel.
    pub bin_port: u16,
    /// Whether the acceptor verifies request signatures itself.
    #[serde(default = "default_true")]
    pub validate_sig: bool,
    /// BLS public key acceptors authenticate the delegate with.
    #[serde(default)]
    pub bls_pub: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Network tuning knobs, all optional in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Maximum accepted payload length in bytes.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: u32,
    /// Delay between connect retries, in milliseconds.
    #[serde(default = "default_retry_timeout")]
    pub tcp_connect_retry_timeout: u64,
    /// Number of connect attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub tcp_connect_max_retries: usize,
    /// Seconds of idleness before a heart-beat is sent.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    /// Seconds of idleness before a channel is closed.
    #[serde(default = "default_inactivity")]
    pub inactivity_timeout_secs: u64,
}

fn default_max_message_len() -> u32 {
    64 * 1024 * 1024
}

fn default_retry_timeout() -> u64 {
    1_000
}

fn default_max_retries() -> usize {
    10
}

fn default_heartbeat() -> u64 {
    10
}

fn default_inactivity() -> u64 {
    60
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            tcp_connect_retry_timeout: default_retry_timeout(),
            tcp_connect_max_retries: default_max_retries(),
            heartbeat_interval_secs: default_heartbeat(),
            inactivity_timeout_secs: default_inactivity(),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's delegate id within the genesis committee.
    pub delegate_id: u8,
    /// The delegate committee's peers.
    pub delegates: Vec<DelegatePeerConfig>,
    /// Address this node binds its delegate channel listener to.
    pub local_address: String,
    /// Port of the delegate channel listener.
    pub peer_port: u16,
    /// Admission settings.
    pub tx_acceptor_config: TxAcceptorConfig,
    /// Micro-block interval override in seconds; the protocol default
    /// applies when absent.
    #[serde(default)]
    pub microblock_generation_interval: Option<u64>,
    /// Host the post-commit webhook posts to, if any.
    #[serde(default)]
    pub callback_address: Option<String>,
    /// Port of the webhook.
    #[serde(default)]
    pub callback_port: Option<u16>,
    /// Path of the webhook.
    #[serde(default)]
    pub callback_target: Option<String>,
    /// Where the ledger store lives.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Hex-encoded BLS secret key of this delegate.
    pub bls_secret: String,
    /// Genesis state written into an empty store on first start.
    pub genesis: GenesisConfig,
    /// Network tuning.
    #[serde(default)]
    pub network: NetworkSettings,
}

fn default_database_path() -> String {
    "trilith-db".to_owned()
}

impl NodeConfig {
    /// Loads a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("cannot read config {}", path.as_ref().display()))?;
        serde_json::from_str(&raw).context("cannot parse config")
    }

    /// This node's delegate id.
    pub fn local_delegate_id(&self) -> DelegateId {
        DelegateId(self.delegate_id)
    }

    /// Resolved socket address of a peer's delegate channel.
    pub fn peer_address(&self, id: DelegateId) -> Option<SocketAddr> {
        self.delegates
            .iter()
            .find(|peer| peer.id == id.0)
            .and_then(|peer| format!("{}:{}", peer.ip, peer.peer_port).parse().ok())
    }

    /// The configured webhook endpoint, if complete.
    pub fn callback_url(&self) -> Option<String> {
        let address = self.callback_address.as_ref()?;
        let port = self.callback_port?;
        let target = self.callback_target.as_deref().unwrap_or("/");
        let target = target.strip_prefix('/').unwrap_or(target);
        Some(format!("http://{}:{}/{}", address, port, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_minimal_config() {
        let raw = r#"{
            "delegate_id": 3,
            "delegates": [
                { "id": 0, "ip": "10.0.0.1", "peer_port": 9500 },
                { "id": 3, "ip": "10.0.0.4", "peer_port": 9500 }
            ],
            "local_address": "0.0.0.0",
            "peer_port": 9500,
            "tx_acceptor_config": { "json_port": 9510, "bin_port": 9511 },
            "callback_address": "10.1.0.9",
            "callback_port": 8080,
            "callback_target": "/blocks",
            "bls_secret": "00",
            "genesis": { "accounts": [], "delegates": [], "timestamp": 0 }
        }"#;
        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.delegate_id, 3);
        assert!(config.tx_acceptor_config.validate_sig);
        assert_eq!(
            config.peer_address(DelegateId(0)),
            Some("10.0.0.1:9500".parse().unwrap())
        );
        assert_eq!(config.peer_address(DelegateId(7)), None);
        assert_eq!(
            config.callback_url(),
            Some("http://10.1.0.9:8080/blocks".to_owned())
        );
        assert_eq!(config.network.heartbeat_interval_secs, 10);
    }
}
