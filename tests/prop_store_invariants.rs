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

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rumora::core::crypto::bls::{self, Keypair, Roster};
use rumora::core::crypto::mask::Mask;
use rumora::core::protocol::store::ResponseStore;
use rumora::core::types::Response;
use std::sync::Arc;

fn make_roster(n: usize, seed: u64) -> (Vec<Keypair>, Arc<Roster>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let pairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate(&mut rng)).collect();
    let roster = Arc::new(Roster::new(pairs.iter().map(|kp| kp.public).collect()));
    (pairs, roster)
}

fn own_response(pairs: &[Keypair], n: usize, i: usize, msg: &[u8]) -> Response {
    Response {
        signature: bls::sign(&pairs[i].secret, msg),
        mask: Mask::with_enabled(n, i).unwrap().to_vec(),
    }
}

proptest! {
    // Pairing operations are slow; a few well-shuffled cases buy the coverage.
    #![proptest_config(ProptestConfig::with_cases(10))]

    /// Any interleaving of single-signer adds leaves the flat and tree
    /// stores with the same aggregate point and coverage mask.
    #[test]
    fn prop_flat_and_tree_stores_agree(
        n in 1usize..9,
        seed in any::<u64>(),
        raw_order in proptest::collection::vec(any::<u16>(), 1..14),
    ) {
        let (pairs, roster) = make_roster(n, seed);
        let msg = b"equivalence";
        let mut flat = ResponseStore::new(roster.clone(), false);
        let mut tree = ResponseStore::new(roster.clone(), true);

        // Duplicates in the order exercise idempotent re-adds.
        for raw in &raw_order {
            let i = (*raw as usize) % n;
            let r = own_response(&pairs, n, i, msg);
            flat.add(i as u32, r.clone()).unwrap();
            tree.add(i as u32, r).unwrap();
        }

        prop_assert_eq!(flat.count(), tree.count());
        let (flat_sig, flat_mask) = flat.aggregate().unwrap();
        let (tree_sig, tree_mask) = tree.aggregate().unwrap();
        prop_assert_eq!(flat_sig, tree_sig);
        prop_assert_eq!(flat_mask.as_bytes(), tree_mask.as_bytes());

        // Signature-mask correspondence: the aggregate verifies under the
        // roster subset the mask names.
        let (sig, mask) = tree.aggregate().unwrap();
        let mut final_sig = sig.0;
        final_sig.extend_from_slice(mask.as_bytes());
        prop_assert!(bls::verify_aggregate(&final_sig, msg, roster.publics()).is_ok());
    }

    /// Coverage never shrinks, whatever the add order.
    #[test]
    fn prop_coverage_is_monotone(
        n in 1usize..9,
        seed in any::<u64>(),
        raw_order in proptest::collection::vec(any::<u16>(), 1..14),
    ) {
        let (pairs, roster) = make_roster(n, seed);
        let msg = b"monotone";
        let mut tree = ResponseStore::new(roster, true);
        let mut previous = Mask::new(n);

        for raw in &raw_order {
            let i = (*raw as usize) % n;
            tree.add(i as u32, own_response(&pairs, n, i, msg)).unwrap();
            let (_, mask) = tree.aggregate().unwrap();
            for bit in 0..n {
                prop_assert!(!previous.is_enabled(bit) || mask.is_enabled(bit));
            }
            previous = mask;
        }
    }

    /// Merging the same rumor map twice is a no-op.
    #[test]
    fn prop_update_is_idempotent(
        n in 2usize..9,
        seed in any::<u64>(),
        picks in proptest::collection::vec(any::<u16>(), 1..8),
        tree_mode in any::<bool>(),
    ) {
        let (pairs, roster) = make_roster(n, seed);
        let msg = b"idempotent";

        // Build a donor store and gossip its map.
        let mut donor = ResponseStore::new(roster.clone(), tree_mode);
        for raw in &picks {
            let i = (*raw as usize) % n;
            donor.add(i as u32, own_response(&pairs, n, i, msg)).unwrap();
        }
        let map = donor.response_map().clone();

        let mut store = ResponseStore::new(roster, tree_mode);
        store.update(&map).unwrap();
        let count = store.count();
        let (sig, mask) = store.aggregate().unwrap();

        store.update(&map).unwrap();
        prop_assert_eq!(store.count(), count);
        let (sig2, mask2) = store.aggregate().unwrap();
        prop_assert_eq!(sig, sig2);
        prop_assert_eq!(mask.as_bytes(), mask2.as_bytes());
    }
}
