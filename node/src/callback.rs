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

//! The post-commit webhook.
//!
//! Every committed request block is POSTed as JSON to the configured URL.
//! Delivery is fire-and-forget: failures are logged and dropped, retrying
//! is the receiving infrastructure's concern.

use log::{info, warn};
use tokio::sync::mpsc;

use trilith::blocks::Block;

/// Posts committed request blocks to `url` until the channel closes.
pub async fn run_callback(url: String, mut committed: mpsc::UnboundedReceiver<Block>) {
    info!("posting committed request blocks to {}", url);
    let client = reqwest::Client::new();

    while let Some(block) = committed.recv().await {
        let request_block = match &block {
            Block::Request(request_block) => request_block,
            _ => continue,
        };
        match client.post(&url).json(request_block).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("webhook answered {} for block post", response.status());
            }
            Ok(_) => {}
            Err(e) => warn!("webhook post failed: {}", e),
        }
    }
}
