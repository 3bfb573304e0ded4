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

use anyhow::Context;

use std::sync::Arc;

use trilith_node::{Node, NodeConfig};
use trilith_storage::RocksDB;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: trilith-node <config.json>")?;
    let config = NodeConfig::load(&config_path)?;

    let db = Arc::new(RocksDB::open(&config.database_path)?);
    Node::new(db, config).run().await
}
