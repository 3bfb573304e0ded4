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

//! Core of the Trilith ledger.
//!
//! The ledger consists of three interleaved block chains:
//!
//! - **request blocks** — one chain per delegate, packing user requests into
//!   batches ordered by sequence number within an epoch;
//! - **micro blocks** — a single chain pinning the request chains into a
//!   totally-ordered history by recording every delegate's request tip;
//! - **epoch blocks** — a single chain closing each epoch and carrying the
//!   delegate set elected for a future epoch.
//!
//! This crate defines the data model of those chains and of user requests,
//! their canonical little-endian wire encoding, the ledger schema over the
//! storage backend, and the persistence layer that validates and applies
//! blocks while enforcing the account invariants (non-negative balances,
//! chain linkage, tip monotonicity, at most one in-flight reservation per
//! account).
//!
//! Consensus, networking and node assembly live in the `trilith-node` crate.

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]

pub mod account;
pub mod blocks;
pub mod constants;
pub mod genesis;
pub mod persistence;
pub mod requests;
pub mod schema;
pub mod tip;
pub mod token;
pub mod types;
pub mod wire;

pub use trilith_crypto as crypto;
pub use trilith_storage as storage;

pub use crate::{
    tip::Tip,
    types::{AccountAddress, Amount, ChainKind, DelegateId, Epoch, Sequence},
};
