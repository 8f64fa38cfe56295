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

//! Containers accumulating partial aggregate signatures during gossip.
//!
//! The flat store keys responses by roster index and defers all coefficient
//! weighting to the final aggregation call. The tree store applies
//! coefficients at ingress and keeps a sparse cover of the roster: disjoint
//! sub-ranges that are coalesced bottom-up through an implicit binary tree,
//! so merging a rumor costs proportionally to the newly covered ranges
//! rather than the roster size.

use crate::core::crypto::bls::{self, BlsError, Roster};
use crate::core::crypto::mask::{Mask, MaskError};
use crate::core::types::{Response, ResponseMap, Signature};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A merged mask had the wrong width.
    #[error(transparent)]
    Mask(#[from] MaskError),
    /// The BLS library rejected an operation.
    #[error(transparent)]
    Bls(#[from] BlsError),
    /// A slot id is not part of the coalescing tree.
    #[error("slot is not part of the coalescing tree")]
    NodeNotInTree,
}

/// Pluggable response container; the tree variant is strictly richer state,
/// so a tagged enum with a dispatch wrapper is all the abstraction needed.
pub enum ResponseStore {
    /// Roster-index keyed map, merge by replacement.
    Flat(FlatResponses),
    /// Sparse cover over the coalescing tree.
    Tree(TreeResponses),
}

impl ResponseStore {
    /// Build the store variant selected by `tree_mode`.
    pub fn new(roster: Arc<Roster>, tree_mode: bool) -> Self {
        if tree_mode {
            Self::Tree(TreeResponses::new(roster))
        } else {
            Self::Flat(FlatResponses::new(roster))
        }
    }

    /// Insert one participant's own single-signer response.
    pub fn add(&mut self, idx: u32, response: Response) -> Result<(), StoreError> {
        match self {
            Self::Flat(s) => s.add(idx, response),
            Self::Tree(s) => s.add(idx, &response),
        }
    }

    /// Merge a gossiped response map.
    pub fn update(&mut self, map: &ResponseMap) -> Result<(), StoreError> {
        match self {
            Self::Flat(s) => s.update(map),
            Self::Tree(s) => s.update(map),
        }
    }

    /// Number of distinct contributing signers.
    pub fn count(&self) -> usize {
        match self {
            Self::Flat(s) => s.count(),
            Self::Tree(s) => s.count(),
        }
    }

    /// Final aggregation: returns the aggregate signature and its coverage mask.
    pub fn aggregate(&self) -> Result<(Signature, Mask), StoreError> {
        match self {
            Self::Flat(s) => s.aggregate(),
            Self::Tree(s) => s.aggregate(),
        }
    }

    /// The current slot-id keyed map, as gossiped in rumors.
    pub fn response_map(&self) -> &ResponseMap {
        match self {
            Self::Flat(s) => &s.map,
            Self::Tree(s) => &s.entries,
        }
    }
}

/// Roster-index keyed store. Entries are single-signer responses produced by
/// the signers themselves, so weighting is deferred to the one final call.
pub struct FlatResponses {
    map: ResponseMap,
    roster: Arc<Roster>,
}

impl FlatResponses {
    fn new(roster: Arc<Roster>) -> Self {
        Self {
            map: ResponseMap::new(),
            roster,
        }
    }

    fn add(&mut self, idx: u32, response: Response) -> Result<(), StoreError> {
        // Overwrites silently; the protocol never re-submits a distinct
        // response for the same index.
        self.map.insert(idx, response);
        Ok(())
    }

    fn update(&mut self, map: &ResponseMap) -> Result<(), StoreError> {
        for (idx, response) in map {
            self.map.insert(*idx, response.clone());
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.map.len()
    }

    fn aggregate(&self) -> Result<(Signature, Mask), StoreError> {
        let mut mask = Mask::new(self.roster.len());
        let mut sigs = Vec::with_capacity(self.map.len());
        // BTreeMap iteration is key-ascending, which lines the signatures up
        // with the mask's enabled bits.
        for response in self.map.values() {
            sigs.push(response.signature.clone());
            mask.merge(&response.mask)?;
        }
        let agg = bls::aggregate_weighted(&sigs, &mask, self.roster.publics())?;
        Ok((agg, mask))
    }
}

/// Sparse cover over the implicit coalescing tree. Every entry's signature is
/// already coefficient-weighted, so entries combine with plain addition.
pub struct TreeResponses {
    entries: ResponseMap,
    coverage: Mask,
    tree: CoalesceTree,
    roster: Arc<Roster>,
}

impl TreeResponses {
    fn new(roster: Arc<Roster>) -> Self {
        let n = roster.len();
        Self {
            entries: ResponseMap::new(),
            coverage: Mask::new(n),
            tree: CoalesceTree::new(n),
            roster,
        }
    }

    fn add(&mut self, idx: u32, response: &Response) -> Result<(), StoreError> {
        // Apply the aggregation coefficient immediately; everything stored in
        // this container combines with plain addition afterwards.
        let mut mask = Mask::new(self.roster.len());
        mask.merge(&response.mask)?;
        let weighted = bls::aggregate_weighted(
            std::slice::from_ref(&response.signature),
            &mask,
            self.roster.publics(),
        )?;
        self.add_aggregated(idx, weighted, mask)
    }

    fn update(&mut self, map: &ResponseMap) -> Result<(), StoreError> {
        for (slot, response) in map {
            let mut mask = Mask::new(self.roster.len());
            mask.merge(&response.mask)?;
            self.add_aggregated(*slot, response.signature.clone(), mask)?;
        }
        Ok(())
    }

    fn add_aggregated(
        &mut self,
        slot: u32,
        sig: Signature,
        mut mask: Mask,
    ) -> Result<(), StoreError> {
        if !self.tree.contains(slot) {
            return Err(StoreError::NodeNotInTree);
        }

        // Dominance: an ancestor already covering this slot makes the
        // contribution redundant (this also makes re-adds idempotent).
        let mut current = slot;
        loop {
            if self.entries.contains_key(&current) {
                return Ok(());
            }
            match self.tree.parent(current) {
                Some(p) => current = p,
                None => break,
            }
        }

        let parent = self.tree.parent(slot);
        let (siblings, mut coalesce) = match parent {
            None => (vec![slot], false), // tree root: nothing above to build
            Some(p) => {
                let (left, right) = self.tree.children(p).ok_or(StoreError::NodeNotInTree)?;
                let mut v = vec![left];
                if let Some(right) = right {
                    v.push(right);
                }
                (v, true)
            }
        };

        let mut sibling_sigs: Vec<Signature> = Vec::new();
        for child in &siblings {
            if let Some(r) = self.entries.get(child) {
                sibling_sigs.push(r.signature.clone());
            } else if *child != slot {
                coalesce = false;
                break;
            }
        }

        if coalesce {
            sibling_sigs.push(sig);
            let merged = bls::aggregate_plain(&sibling_sigs)?;
            for child in &siblings {
                if let Some(r) = self.entries.get(child) {
                    mask.merge(&r.mask)?;
                }
            }
            for child in &siblings {
                self.entries.remove(child);
            }
            // parent is Some here, coalesce only starts with it present
            let target = parent.ok_or(StoreError::NodeNotInTree)?;
            return self.add_aggregated(target, merged, mask);
        }

        self.coverage.merge(mask.as_bytes())?;
        self.entries.insert(
            slot,
            Response {
                signature: sig,
                mask: mask.to_vec(),
            },
        );

        // Drop finer-grained entries below the installed slot; their leaves
        // are subsumed by the wider aggregate and keeping them would break
        // the disjoint-cover invariant.
        let mut stack: Vec<u32> = Vec::new();
        self.tree.push_children(slot, &mut stack);
        while let Some(descendant) = stack.pop() {
            if self.entries.remove(&descendant).is_some() {
                trace!(slot = descendant, within = slot, "subsumed finer-grained response");
            }
            self.tree.push_children(descendant, &mut stack);
        }

        Ok(())
    }

    fn count(&self) -> usize {
        self.coverage.count_enabled()
    }

    fn aggregate(&self) -> Result<(Signature, Mask), StoreError> {
        let sigs: Vec<Signature> = self
            .entries
            .values()
            .map(|r| r.signature.clone())
            .collect();
        // Coefficients were applied at ingress; plain aggregation suffices.
        let agg = bls::aggregate_plain(&sigs)?;
        Ok((agg, self.coverage.clone()))
    }
}

/// Implicit binary-coalescing tree over leaves `0..n`, stored as parent and
/// children arrays keyed by slot id. Leaves occupy `0..n`; each level above
/// pairs consecutive slots of the level below (the rightmost slot may be a
/// lone child), starting at the smallest power of two >= n.
#[derive(Clone, Debug)]
pub(crate) struct CoalesceTree {
    children: Vec<Option<(u32, Option<u32>)>>,
    parent: Vec<Option<u32>>,
    leaves: usize,
}

impl CoalesceTree {
    pub(crate) fn new(n: usize) -> Self {
        let mut children: Vec<Option<(u32, Option<u32>)>> = vec![None; n];
        let mut parent: Vec<Option<u32>> = vec![None; n];

        let mut start: u32 = 1;
        while (start as usize) < n {
            start *= 2;
        }

        let mut start_below = 0u32;
        let mut end_below = n as u32;
        let mut size = start / 2;
        let mut next = start;
        while size > 0 {
            let mut slot = next;
            let mut left = start_below;
            while left < end_below {
                let needed = slot as usize + 1;
                if children.len() < needed {
                    children.resize(needed, None);
                    parent.resize(needed, None);
                }
                let right = left + 1;
                if right < end_below {
                    children[slot as usize] = Some((left, Some(right)));
                    parent[right as usize] = Some(slot);
                } else {
                    children[slot as usize] = Some((left, None));
                }
                parent[left as usize] = Some(slot);
                slot += 1;
                left += 2;
            }
            start_below = next;
            end_below = slot;
            next += size;
            size /= 2;
        }

        Self {
            children,
            parent,
            leaves: n,
        }
    }

    /// Whether `slot` names a leaf or a populated internal node.
    pub(crate) fn contains(&self, slot: u32) -> bool {
        (slot as usize) < self.leaves
            || self
                .children
                .get(slot as usize)
                .is_some_and(|c| c.is_some())
    }

    pub(crate) fn parent(&self, slot: u32) -> Option<u32> {
        self.parent.get(slot as usize).copied().flatten()
    }

    pub(crate) fn children(&self, slot: u32) -> Option<(u32, Option<u32>)> {
        self.children.get(slot as usize).copied().flatten()
    }

    fn push_children(&self, slot: u32, stack: &mut Vec<u32>) {
        if let Some((left, right)) = self.children(slot) {
            stack.push(left);
            if let Some(right) = right {
                stack.push(right);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::bls::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn roster(n: usize, seed: u64) -> (Vec<Keypair>, Arc<Roster>) {
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

    #[test]
    fn tree_shape_for_four_leaves() {
        let tree = CoalesceTree::new(4);
        assert_eq!(tree.children(4), Some((0, Some(1))));
        assert_eq!(tree.children(5), Some((2, Some(3))));
        assert_eq!(tree.children(6), Some((4, Some(5))));
        assert_eq!(tree.parent(6), None);
        assert_eq!(tree.parent(0), Some(4));
        assert_eq!(tree.parent(3), Some(5));
        assert!(!tree.contains(7));
    }

    #[test]
    fn tree_shape_for_odd_width() {
        // N = 5: leaves 0..5, level one at 8..11 with slot 10 a lone child.
        let tree = CoalesceTree::new(5);
        assert_eq!(tree.children(8), Some((0, Some(1))));
        assert_eq!(tree.children(9), Some((2, Some(3))));
        assert_eq!(tree.children(10), Some((4, None)));
        assert_eq!(tree.children(12), Some((8, Some(9))));
        assert_eq!(tree.children(13), Some((10, None)));
        assert_eq!(tree.children(14), Some((12, Some(13))));
        assert_eq!(tree.parent(14), None);
        assert!(!tree.contains(5));
        assert!(!tree.contains(6));
        assert!(!tree.contains(7));
    }

    #[test]
    fn single_leaf_tree_is_its_own_root() {
        let tree = CoalesceTree::new(1);
        assert!(tree.contains(0));
        assert_eq!(tree.parent(0), None);
        assert_eq!(tree.children(0), None);
    }

    #[test]
    fn coalescing_trace_for_four_nodes() {
        // Adds in order 0, 2, 1, 3 walk the cover through
        // {0, 2} -> {4, 2} -> {6}.
        let (pairs, roster) = roster(4, 11);
        let msg = b"trace";
        let mut store = ResponseStore::new(roster.clone(), true);

        store.add(0, own_response(&pairs, 4, 0, msg)).unwrap();
        store.add(2, own_response(&pairs, 4, 2, msg)).unwrap();
        let slots: Vec<u32> = store.response_map().keys().copied().collect();
        assert_eq!(slots, vec![0, 2]);

        store.add(1, own_response(&pairs, 4, 1, msg)).unwrap();
        let slots: Vec<u32> = store.response_map().keys().copied().collect();
        assert_eq!(slots, vec![2, 4]);

        store.add(3, own_response(&pairs, 4, 3, msg)).unwrap();
        let slots: Vec<u32> = store.response_map().keys().copied().collect();
        assert_eq!(slots, vec![6]);
        assert_eq!(store.count(), 4);

        let (sig, mask) = store.aggregate().unwrap();
        assert_eq!(mask.count_enabled(), 4);
        let mut final_sig = sig.0.clone();
        final_sig.extend_from_slice(mask.as_bytes());
        assert!(bls::verify_aggregate(&final_sig, msg, roster.publics()).is_ok());
    }

    #[test]
    fn lone_child_coalesces_upward() {
        // N = 3: leaves 0..3, slot 4 = (0,1), slot 5 = (2), root 6 = (4,5).
        let (pairs, roster) = roster(3, 12);
        let msg = b"odd";
        let mut store = ResponseStore::new(roster.clone(), true);

        store.add(2, own_response(&pairs, 3, 2, msg)).unwrap();
        // Leaf 2 has no sibling, so it climbs to slot 5 immediately.
        let slots: Vec<u32> = store.response_map().keys().copied().collect();
        assert_eq!(slots, vec![5]);

        store.add(0, own_response(&pairs, 3, 0, msg)).unwrap();
        store.add(1, own_response(&pairs, 3, 1, msg)).unwrap();
        let slots: Vec<u32> = store.response_map().keys().copied().collect();
        assert_eq!(slots, vec![6]);
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn readd_is_idempotent_in_both_stores() {
        for tree_mode in [false, true] {
            let (pairs, roster) = roster(4, 13);
            let msg = b"again";
            let mut store = ResponseStore::new(roster, tree_mode);
            let r = own_response(&pairs, 4, 1, msg);
            store.add(1, r.clone()).unwrap();
            let count = store.count();
            let (sig, mask) = store.aggregate().unwrap();
            store.add(1, r).unwrap();
            assert_eq!(store.count(), count);
            let (sig2, mask2) = store.aggregate().unwrap();
            assert_eq!(sig, sig2);
            assert_eq!(mask, mask2);
        }
    }

    #[test]
    fn tree_entries_form_an_antichain() {
        let (pairs, roster) = roster(7, 14);
        let msg = b"cover";
        let mut store = TreeResponses::new(roster);
        for i in [3u32, 0, 5, 1, 6] {
            let r = own_response(&pairs, 7, i as usize, msg);
            store.add(i, &r).unwrap();
        }
        let slots: Vec<u32> = store.entries.keys().copied().collect();
        for a in &slots {
            for b in &slots {
                if a == b {
                    continue;
                }
                // b must not be an ancestor of a
                let mut cur = *a;
                while let Some(p) = store.tree.parent(cur) {
                    assert_ne!(p, *b, "{b} is an ancestor of {a}");
                    cur = p;
                }
            }
        }
        assert_eq!(store.count(), 5);
    }

    #[test]
    fn coarser_gossip_entry_subsumes_finer_local_one() {
        let (pairs, roster) = roster(4, 15);
        let msg = b"subsume";

        // A peer that already coalesced leaves 0 and 1 gossips slot 4.
        let mut peer = TreeResponses::new(roster.clone());
        peer.add(0, &own_response(&pairs, 4, 0, msg)).unwrap();
        peer.add(1, &own_response(&pairs, 4, 1, msg)).unwrap();
        let peer_map = peer.entries.clone();
        assert!(peer_map.contains_key(&4));

        // We only hold leaf 0 so far.
        let mut local = TreeResponses::new(roster);
        local.add(0, &own_response(&pairs, 4, 0, msg)).unwrap();
        local.update(&peer_map).unwrap();

        let slots: Vec<u32> = local.entries.keys().copied().collect();
        assert_eq!(slots, vec![4]);
        assert_eq!(local.count(), 2);
    }

    #[test]
    fn unknown_slot_is_fatal() {
        let (pairs, roster) = roster(4, 16);
        let mut store = TreeResponses::new(roster);
        let r = own_response(&pairs, 4, 0, b"m");
        let mask = {
            let mut m = Mask::new(4);
            m.merge(&r.mask).unwrap();
            m
        };
        let err = store.add_aggregated(42, r.signature, mask).unwrap_err();
        assert!(matches!(err, StoreError::NodeNotInTree));
    }

    #[test]
    fn flat_and_tree_aggregate_identically() {
        let (pairs, flat_roster) = roster(6, 17);
        let msg = b"equiv";
        let mut flat = ResponseStore::new(flat_roster.clone(), false);
        let mut tree = ResponseStore::new(flat_roster.clone(), true);
        for i in [4u32, 1, 5, 0] {
            let r = own_response(&pairs, 6, i as usize, msg);
            flat.add(i, r.clone()).unwrap();
            tree.add(i, r).unwrap();
        }
        let (flat_sig, flat_mask) = flat.aggregate().unwrap();
        let (tree_sig, tree_mask) = tree.aggregate().unwrap();
        assert_eq!(flat_sig, tree_sig);
        assert_eq!(flat_mask.as_bytes(), tree_mask.as_bytes());
        assert_eq!(flat.count(), tree.count());
    }
}
