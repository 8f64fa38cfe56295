// Copyright (c) 2026 Rumora
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Uniform random peer selection over roster indices.

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

/// Peer selection errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    /// More targets requested than peers available.
    #[error("not enough peers in the roster")]
    NotEnoughPeers,
}

/// Pick `count` distinct peers from `0..roster_len`, excluding `self_index`,
/// by shuffling the candidate range. An out-of-range `self_index` excludes
/// nothing and selection falls back to the full range.
pub fn random_peers<R: Rng>(
    self_index: u32,
    roster_len: usize,
    count: usize,
    rng: &mut R,
) -> Result<Vec<u32>, PeerError> {
    let mut candidates: Vec<u32> = (0..roster_len as u32)
        .filter(|i| *i != self_index)
        .collect();
    if count > candidates.len() {
        return Err(PeerError::NotEnoughPeers);
    }
    candidates.shuffle(rng);
    candidates.truncate(count);
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    #[test]
    fn never_selects_self_and_yields_distinct_peers() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let peers = random_peers(3, 10, 5, &mut rng).unwrap();
            assert_eq!(peers.len(), 5);
            let distinct: BTreeSet<u32> = peers.iter().copied().collect();
            assert_eq!(distinct.len(), 5);
            assert!(!peers.contains(&3));
            assert!(peers.iter().all(|p| *p < 10));
        }
    }

    #[test]
    fn shortage_is_an_error() {
        let mut rng = StdRng::seed_from_u64(8);
        assert_eq!(
            random_peers(0, 3, 3, &mut rng),
            Err(PeerError::NotEnoughPeers)
        );
        assert!(random_peers(0, 3, 2, &mut rng).is_ok());
        assert_eq!(
            random_peers(0, 1, 1, &mut rng),
            Err(PeerError::NotEnoughPeers)
        );
    }

    #[test]
    fn out_of_range_self_falls_back_to_full_range() {
        let mut rng = StdRng::seed_from_u64(9);
        let peers = random_peers(99, 4, 4, &mut rng).unwrap();
        let distinct: BTreeSet<u32> = peers.iter().copied().collect();
        assert_eq!(distinct, (0..4).collect());
    }

    #[test]
    fn zero_targets_is_fine() {
        let mut rng = StdRng::seed_from_u64(10);
        assert_eq!(random_peers(0, 1, 0, &mut rng).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn every_peer_is_eventually_selected() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = BTreeSet::new();
        for _ in 0..200 {
            for p in random_peers(0, 8, 2, &mut rng).unwrap() {
                seen.insert(p);
            }
        }
        assert_eq!(seen, (1..8).collect());
    }
}
