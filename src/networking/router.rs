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

//! In-process transport between protocol instances.
//!
//! The protocol only needs point-to-point delivery of two message kinds and
//! tolerates loss, reordering, and arbitrary latency; `Conduit` is that seam.
//! `LocalRouter` implements it over per-node unbounded channels and can drop
//! a configured fraction of messages for fault-injection runs.

use crate::core::types::{Rumor, Shutdown};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Point-to-point sender used by protocol instances. Sends never block and
/// may be silently dropped (by the network or a departed receiver).
pub trait Conduit: Send + Sync {
    /// Deliver a rumor from `from` to `to`.
    fn send_rumor(&self, from: u32, to: u32, rumor: Rumor);
    /// Deliver a shutdown certificate from `from` to `to`.
    fn send_shutdown(&self, from: u32, to: u32, shutdown: Shutdown);
}

/// Receiving half of one node's mailboxes.
pub struct NodeInbox {
    /// Inbound rumors, tagged with the sender index.
    pub rumors: mpsc::UnboundedReceiver<(u32, Rumor)>,
    /// Inbound shutdown certificates, tagged with the sender index.
    pub shutdowns: mpsc::UnboundedReceiver<(u32, Shutdown)>,
}

/// Channel-backed router connecting all instances of one run.
pub struct LocalRouter {
    rumor_txs: Vec<mpsc::UnboundedSender<(u32, Rumor)>>,
    shutdown_txs: Vec<mpsc::UnboundedSender<(u32, Shutdown)>>,
    loss_rate: f64,
    rng: Mutex<StdRng>,
}

impl LocalRouter {
    /// Lossless router for `n` nodes, returning one inbox per node.
    pub fn new(n: usize) -> (Arc<Self>, Vec<NodeInbox>) {
        Self::with_loss(n, 0.0, 0)
    }

    /// Router dropping each message independently with probability
    /// `loss_rate`, deterministically from `seed`.
    pub fn with_loss(n: usize, loss_rate: f64, seed: u64) -> (Arc<Self>, Vec<NodeInbox>) {
        let mut rumor_txs = Vec::with_capacity(n);
        let mut shutdown_txs = Vec::with_capacity(n);
        let mut inboxes = Vec::with_capacity(n);
        for _ in 0..n {
            let (rtx, rrx) = mpsc::unbounded_channel();
            let (stx, srx) = mpsc::unbounded_channel();
            rumor_txs.push(rtx);
            shutdown_txs.push(stx);
            inboxes.push(NodeInbox {
                rumors: rrx,
                shutdowns: srx,
            });
        }
        let router = Arc::new(Self {
            rumor_txs,
            shutdown_txs,
            loss_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        });
        (router, inboxes)
    }

    fn dropped(&self) -> bool {
        if self.loss_rate <= 0.0 {
            return false;
        }
        self.rng
            .lock()
            .map(|mut rng| rng.gen::<f64>() < self.loss_rate)
            .unwrap_or(false)
    }
}

impl Conduit for LocalRouter {
    fn send_rumor(&self, from: u32, to: u32, rumor: Rumor) {
        if self.dropped() {
            trace!(from, to, "dropping rumor");
            return;
        }
        if let Some(tx) = self.rumor_txs.get(to as usize) {
            // A closed mailbox means the peer already finished; that is fine.
            let _ = tx.send((from, rumor));
        }
    }

    fn send_shutdown(&self, from: u32, to: u32, shutdown: Shutdown) {
        if self.dropped() {
            trace!(from, to, "dropping shutdown");
            return;
        }
        if let Some(tx) = self.shutdown_txs.get(to as usize) {
            let _ = tx.send((from, shutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Parameters;

    fn rumor() -> Rumor {
        Rumor {
            params: Parameters::default(),
            response_map: Default::default(),
            msg: vec![1],
        }
    }

    #[tokio::test]
    async fn delivers_point_to_point_with_sender_tag() {
        let (router, mut inboxes) = LocalRouter::new(3);
        router.send_rumor(0, 2, rumor());
        let (from, received) = inboxes[2].rumors.recv().await.unwrap();
        assert_eq!(from, 0);
        assert_eq!(received.msg, vec![1]);
        assert!(inboxes[1].rumors.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_delivery_works() {
        let (router, mut inboxes) = LocalRouter::new(2);
        router.send_rumor(1, 1, rumor());
        let (from, _) = inboxes[1].rumors.recv().await.unwrap();
        assert_eq!(from, 1);
    }

    #[tokio::test]
    async fn full_loss_drops_everything() {
        let (router, mut inboxes) = LocalRouter::with_loss(2, 1.0, 42);
        for _ in 0..20 {
            router.send_rumor(0, 1, rumor());
        }
        assert!(inboxes[1].rumors.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_target_is_ignored() {
        let (router, _inboxes) = LocalRouter::new(1);
        router.send_rumor(0, 9, rumor());
    }
}
