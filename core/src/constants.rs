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

//! Protocol constants shared by the core and the node.

use std::time::Duration;

/// Number of delegates in every epoch's committee.
pub const NUM_DELEGATES: usize = 32;

/// Maximum number of requests packed into one request block.
pub const BATCH_SIZE: usize = 1500;

/// Maximum number of transactions inside a single `Send` request.
pub const MAX_SEND_TRANSACTIONS: usize = 8;

/// Tolerated difference between a block timestamp and local time for
/// request consensus.
pub const CLOCK_DRIFT: Duration = Duration::from_secs(20);

/// Number of epochs an account reservation stays in force before expiring.
pub const RESERVATION_PERIOD: u32 = 2;

/// Minimum fee of any request, in base units.
pub const MIN_TRANSACTION_FEE: u128 = 10_000_000_000_000_000_000_000;

/// Lower bound of the secondary waiting-list expiration timer.
pub const SECONDARY_TIMEOUT_MIN: Duration = Duration::from_secs(20);

/// Width of the secondary waiting-list expiration window; expirations are
/// sampled uniformly from `[MIN, MIN + RANGE]`.
pub const SECONDARY_TIMEOUT_RANGE: Duration = Duration::from_secs(40);

/// Width of the expiration window while an epoch boundary is near.
pub const SECONDARY_TIMEOUT_RANGE_BOUNDARY: Duration = Duration::from_secs(10);

/// Upper bound on accumulated secondary-list drift; micro and epoch
/// proposals tolerate `SECONDARY_TIMEOUT_CAP + CLOCK_DRIFT` of clock skew.
pub const SECONDARY_TIMEOUT_CAP: Duration = Duration::from_secs(8 * 60);

/// Messages more than this many epochs ahead of the local epoch are bogus.
pub const INVALID_EPOCH_GAP: u32 = 10;

/// Maximum number of times a primary re-proposes a batch before giving up.
pub const PROPOSAL_RETRY: u32 = 7;

/// Base value of the per-phase consensus timeout; it doubles on every
/// attempt.
pub const PHASE_TIMEOUT_BASE: Duration = Duration::from_secs(60);

/// Cap of the per-phase timeout for request consensus.
pub const PHASE_TIMEOUT_CAP_REQUEST: Duration = Duration::from_secs(600);

/// Cap of the per-phase timeout for micro- and epoch-block consensus.
pub const PHASE_TIMEOUT_CAP_ARCHIVAL: Duration = Duration::from_secs(19_200);

/// Interval between micro-block cuts.
pub const MICROBLOCK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Length of an epoch.
pub const EPOCH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// How long before the epoch boundary the incoming delegate set starts
/// opening channels.
pub const EPOCH_DELEGATES_CONNECT: Duration = Duration::from_secs(5 * 60);

/// How long before the epoch boundary both delegate sets accept messages.
pub const EPOCH_TRANSITION_START: Duration = Duration::from_secs(20);

/// How long after the boundary the new set fully assumes responsibility.
pub const EPOCH_START: Duration = Duration::from_secs(20);

/// Grace period after which retiring delegates close their channels.
pub const EPOCH_TRANSITION_END: Duration = Duration::from_secs(5 * 60);

/// Wire-format version carried in every message header.
pub const WIRE_VERSION: u8 = 1;
