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

//! The quorum rule.
//!
//! Voting weight may be stake-weighted and non-uniform. With total weight
//! `T`, up to `f = (T - 1) / 3` weight may be faulty and a phase advances at
//! `2f + 1` weight. The `strict-consensus` feature raises the quorum to the
//! whole committee's weight.

use trilith::types::{Amount, DelegateId};

/// Quorum arithmetic over one epoch's voting weights.
#[derive(Debug, Clone)]
pub struct QuorumSet {
    weights: Vec<Amount>,
    total: Amount,
    max_fault: Amount,
    quorum: Amount,
}

impl QuorumSet {
    /// Builds the quorum rule for a committee's weights.
    pub fn new(weights: Vec<Amount>) -> Self {
        let total = weights.iter().fold(Amount::ZERO, |acc, w| acc + *w);
        let max_fault = Amount(total.0.saturating_sub(1) / 3);
        let quorum = if cfg!(feature = "strict-consensus") {
            total
        } else {
            Amount(2 * max_fault.0 + 1)
        };
        Self {
            weights,
            total,
            max_fault,
            quorum,
        }
    }

    /// The weight of one delegate.
    pub fn weight(&self, id: DelegateId) -> Amount {
        self.weights.get(id.index()).copied().unwrap_or_default()
    }

    /// Total weight of the committee.
    pub fn total(&self) -> Amount {
        self.total
    }

    /// Maximum faulty weight the committee tolerates.
    pub fn max_fault(&self) -> Amount {
        self.max_fault
    }

    /// The weight a phase needs to advance.
    pub fn quorum(&self) -> Amount {
        self.quorum
    }

    /// Returns `true` once the collected weight reaches the quorum.
    pub fn reached(&self, collected: Amount) -> bool {
        collected >= self.quorum
    }

    /// Returns `true` if, with the given weight already rejecting, the
    /// quorum can no longer be assembled from the remaining delegates.
    pub fn unreachable(&self, rejected: Amount) -> bool {
        match self.total.checked_sub(rejected) {
            Some(best_case) => best_case < self.quorum,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn uniform(n: usize) -> QuorumSet {
        QuorumSet::new(vec![Amount(1); n])
    }

    #[cfg(not(feature = "strict-consensus"))]
    #[test]
    fn small_committees() {
        let set = uniform(1);
        assert_eq!(set.max_fault(), Amount(0));
        assert_eq!(set.quorum(), Amount(1));

        for n in 10..=12 {
            let set = uniform(n);
            assert_eq!(set.max_fault(), Amount(3), "n = {}", n);
            assert_eq!(set.quorum(), Amount(7), "n = {}", n);
        }
    }

    #[cfg(not(feature = "strict-consensus"))]
    #[test]
    fn stake_weighted_committee() {
        // 100 billion total stake, spread unevenly.
        let mut weights = vec![Amount(2_000_000_000); 32];
        weights[0] = Amount(100_000_000_000 - 31 * 2_000_000_000);
        let set = QuorumSet::new(weights);
        assert_eq!(set.total(), Amount(100_000_000_000));
        assert_eq!(set.max_fault(), Amount(33_333_333_333));
        assert_eq!(set.quorum(), Amount(66_666_666_667));
    }

    #[cfg(feature = "strict-consensus")]
    #[test]
    fn strict_consensus_requires_everyone() {
        let set = uniform(12);
        assert_eq!(set.quorum(), set.total());
    }

    #[cfg(not(feature = "strict-consensus"))]
    #[test]
    fn rejections_make_the_quorum_unreachable() {
        let set = uniform(10);
        // Quorum 7: with 3 rejecting the quorum is still reachable, with 4
        // it is not.
        assert!(!set.unreachable(Amount(3)));
        assert!(set.unreachable(Amount(4)));
    }
}
