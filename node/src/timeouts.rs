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

//! Consensus phase timeouts and secondary-list delays.

use rand::Rng;

use std::time::Duration;

use trilith::{
    constants::{
        PHASE_TIMEOUT_BASE, PHASE_TIMEOUT_CAP_ARCHIVAL, PHASE_TIMEOUT_CAP_REQUEST,
        SECONDARY_TIMEOUT_MIN, SECONDARY_TIMEOUT_RANGE, SECONDARY_TIMEOUT_RANGE_BOUNDARY,
    },
    types::ChainKind,
};

/// The phase timeout of the given attempt: the base doubles with every
/// retry, capped per chain kind.
pub fn phase_timeout(kind: ChainKind, attempt: u32) -> Duration {
    debug_assert!(attempt >= 1);
    let cap = match kind {
        ChainKind::Request => PHASE_TIMEOUT_CAP_REQUEST,
        ChainKind::Micro | ChainKind::Epoch => PHASE_TIMEOUT_CAP_ARCHIVAL,
    };
    let doubled = PHASE_TIMEOUT_BASE
        .checked_mul(1_u32.checked_shl(attempt - 1).unwrap_or(u32::max_value()))
        .unwrap_or(cap);
    doubled.min(cap)
}

/// Samples the expiration delay of a secondary waiting-list entry,
/// uniformly from the configured window. The window narrows near epoch
/// boundaries so stand-ins come forward before the transition completes.
pub fn secondary_delay<R: Rng>(rng: &mut R, near_epoch_boundary: bool) -> Duration {
    let range = if near_epoch_boundary {
        SECONDARY_TIMEOUT_RANGE_BOUNDARY
    } else {
        SECONDARY_TIMEOUT_RANGE
    };
    SECONDARY_TIMEOUT_MIN + Duration::from_millis(rng.gen_range(0..=range.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_timeouts_double_and_cap_at_ten_minutes() {
        let seconds: Vec<u64> = (1..=5)
            .map(|attempt| phase_timeout(ChainKind::Request, attempt).as_secs())
            .collect();
        assert_eq!(seconds, vec![60, 120, 240, 480, 600]);
        assert_eq!(phase_timeout(ChainKind::Request, 9).as_secs(), 600);
    }

    #[test]
    fn archival_timeouts_cap_at_19200_seconds() {
        assert_eq!(phase_timeout(ChainKind::Micro, 1).as_secs(), 60);
        assert_eq!(phase_timeout(ChainKind::Micro, 9).as_secs(), 15_360);
        assert_eq!(phase_timeout(ChainKind::Micro, 10).as_secs(), 19_200);
        assert_eq!(phase_timeout(ChainKind::Epoch, 40).as_secs(), 19_200);
    }

    #[test]
    fn secondary_delays_stay_in_their_window() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let delay = secondary_delay(&mut rng, false);
            assert!(delay >= SECONDARY_TIMEOUT_MIN);
            assert!(delay <= SECONDARY_TIMEOUT_MIN + SECONDARY_TIMEOUT_RANGE);

            let boundary = secondary_delay(&mut rng, true);
            assert!(boundary >= SECONDARY_TIMEOUT_MIN);
            assert!(boundary <= SECONDARY_TIMEOUT_MIN + SECONDARY_TIMEOUT_RANGE_BOUNDARY);
        }
    }
}
