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

//! Per-node protocol instance.
//!
//! Every participant runs the same event loop: bootstrap (the root waits for
//! its start signal, everyone else for the first inbound message), gossip
//! until the root sees the threshold or a verified shutdown arrives, then
//! finalize (root only) and echo the shutdown certificate until the hard
//! deadline. The loop owns its response store outright; nothing else mutates
//! it.

use crate::core::crypto::bls::{self, BlsError, Keypair, Roster};
use crate::core::crypto::mask::Mask;
use crate::core::protocol::store::{ResponseStore, StoreError};
use crate::core::types::{InstanceConfig, Parameters, Response, Rumor, Shutdown};
use crate::networking::peers::random_peers;
use crate::networking::router::{Conduit, NodeInbox};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Application-level predicate deciding whether this node signs `(msg, data)`.
pub type VerificationFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Fatal instance errors. Everything here aborts the run; recoverable
/// conditions (peer shortage, spoofed shutdowns, refusal to sign) are
/// handled in place and never surface.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A start precondition does not hold.
    #[error("integrity violation: {0}")]
    IntegrityViolation(&'static str),
    /// The root's start signal never arrived.
    #[error("start was never signalled")]
    StartNotCalled,
    /// The response store rejected a merge.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The BLS library rejected an operation.
    #[error(transparent)]
    Bls(#[from] BlsError),
}

/// Reasons a shutdown message is rejected as spoofed.
#[derive(Debug, Error)]
pub enum SpoofedShutdown {
    /// The embedded aggregate does not verify over the message.
    #[error("aggregate does not verify: {0}")]
    Aggregate(#[source] BlsError),
    /// The root's signature over the aggregate does not verify.
    #[error("root signature does not verify: {0}")]
    RootSig(#[source] BlsError),
    /// The configured root index is outside the roster.
    #[error("root index outside the roster")]
    RootIndex,
}

/// A node's position in a run: roster, own index, root index, keys.
pub struct Seat {
    /// Shared roster of all participant public keys.
    pub roster: Arc<Roster>,
    /// This node's roster index.
    pub index: u32,
    /// The index whose key authenticates shutdown certificates.
    pub root_index: u32,
    /// This node's key pair.
    pub keypair: Keypair,
}

impl Seat {
    fn is_root(&self) -> bool {
        self.index == self.root_index
    }
}

/// Caller-side handle: triggers the root and receives the final signature.
pub struct CosiHandle {
    start_tx: Option<oneshot::Sender<()>>,
    /// Single-shot finalization channel. Closure without a value means the
    /// instance aborted.
    pub final_rx: oneshot::Receiver<Vec<u8>>,
}

impl CosiHandle {
    /// Signal the root to start. Returns false if the instance is gone or
    /// start was already signalled.
    pub fn start(&mut self) -> bool {
        match self.start_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// One protocol instance; created, run to completion once, destroyed.
pub struct CosiInstance {
    seat: Seat,
    params: Parameters,
    config: InstanceConfig,
    msg: Option<Vec<u8>>,
    data: Vec<u8>,
    verification: VerificationFn,
    conduit: Arc<dyn Conduit>,
    inbox: NodeInbox,
    start_rx: oneshot::Receiver<()>,
    final_tx: Option<oneshot::Sender<Vec<u8>>>,
    spoof_logged: bool,
}

impl CosiInstance {
    /// Build an instance and its caller-side handle.
    pub fn new(
        seat: Seat,
        params: Parameters,
        config: InstanceConfig,
        verification: VerificationFn,
        conduit: Arc<dyn Conduit>,
        inbox: NodeInbox,
    ) -> (Self, CosiHandle) {
        let (start_tx, start_rx) = oneshot::channel();
        let (final_tx, final_rx) = oneshot::channel();
        let instance = Self {
            seat,
            params,
            config,
            msg: None,
            data: Vec::new(),
            verification,
            conduit,
            inbox,
            start_rx,
            final_tx: Some(final_tx),
            spoof_logged: false,
        };
        let handle = CosiHandle {
            start_tx: Some(start_tx),
            final_rx,
        };
        (instance, handle)
    }

    /// Set the message to be collectively signed (root; non-roots adopt it
    /// from their first rumor).
    pub fn set_message(&mut self, msg: Vec<u8>) {
        self.msg = Some(msg);
    }

    /// Set auxiliary data handed to the verification predicate.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    fn is_root(&self) -> bool {
        self.seat.is_root()
    }

    /// Drive the instance to completion.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let hard = time::sleep(self.config.hard_shutdown());
        tokio::pin!(hard);

        let mut shutdown_pending = false;
        let mut done = false;
        let mut threshold_reached = false;
        let mut shutdown_cert: Option<Shutdown> = None;
        let mut first_rumor: Option<Rumor> = None;

        // Phase 0: bootstrap.
        if self.is_root() {
            self.check_integrity()?;
            match time::timeout(Duration::from_secs(1), &mut self.start_rx).await {
                Ok(Ok(())) => {}
                _ => return Err(ProtocolError::StartNotCalled),
            }
            debug!(node = self.seat.index, "collective signing started");
        } else {
            loop {
                tokio::select! {
                    inbound = self.inbox.rumors.recv() => match inbound {
                        Some((_, rumor)) => {
                            self.adopt_params(rumor.params);
                            self.msg = Some(rumor.msg.clone());
                            first_rumor = Some(rumor);
                            break;
                        }
                        None => {
                            shutdown_pending = true;
                            done = true;
                            break;
                        }
                    },
                    inbound = self.inbox.shutdowns.recv() => match inbound {
                        Some((_, shutdown)) => {
                            match self.verify_shutdown(&shutdown, &shutdown.msg) {
                                Ok(()) => {
                                    self.adopt_params(shutdown.params);
                                    self.msg = Some(shutdown.msg.clone());
                                    shutdown_cert = Some(shutdown);
                                    shutdown_pending = true;
                                    break;
                                }
                                // Keep waiting; a spoofed certificate must not
                                // stall or kill the node.
                                Err(err) => self.note_spoofed(&err),
                            }
                        }
                        None => {
                            shutdown_pending = true;
                            done = true;
                            break;
                        }
                    },
                    () = &mut hard => {
                        shutdown_pending = true;
                        done = true;
                        break;
                    }
                }
            }
        }

        let mut responses = ResponseStore::new(self.seat.roster.clone(), self.params.tree_mode);

        if self.msg.is_some() {
            self.try_sign(&mut responses)?;
        }
        if let Some(rumor) = first_rumor.take() {
            responses.update(&rumor.response_map)?;
            debug!(
                node = self.seat.index,
                known = responses.count(),
                needed = self.config.threshold,
                "first rumor merged"
            );
        }
        if self.is_root() && responses.count() >= self.config.threshold {
            // Possible right away for a threshold of one (or a roster of one).
            threshold_reached = true;
            shutdown_pending = true;
        }

        // Phase 1: gossip.
        let tick = self.params.gossip_tick();
        let mut ticker = time::interval_at(time::Instant::now() + tick, tick);
        while !shutdown_pending {
            tokio::select! {
                inbound = self.inbox.rumors.recv() => match inbound {
                    Some((_, rumor)) => {
                        responses.update(&rumor.response_map)?;
                        trace!(
                            node = self.seat.index,
                            known = responses.count(),
                            needed = self.config.threshold,
                            root = self.is_root(),
                            "rumor merged"
                        );
                        if self.is_root() && responses.count() >= self.config.threshold {
                            threshold_reached = true;
                            shutdown_pending = true;
                        }
                    }
                    None => {
                        shutdown_pending = true;
                        done = true;
                    }
                },
                inbound = self.inbox.shutdowns.recv() => match inbound {
                    Some((_, shutdown)) => {
                        let msg = self.msg.clone().unwrap_or_else(|| shutdown.msg.clone());
                        match self.verify_shutdown(&shutdown, &msg) {
                            Ok(()) => {
                                shutdown_cert = Some(shutdown);
                                shutdown_pending = true;
                            }
                            Err(err) => self.note_spoofed(&err),
                        }
                    }
                    None => {
                        shutdown_pending = true;
                        done = true;
                    }
                },
                _ = ticker.tick() => self.send_rumors(&responses),
                () = &mut hard => {
                    shutdown_pending = true;
                    done = true;
                }
            }
        }

        // Phase 2: finalize. Only the root, and only when the threshold (not
        // a timeout or a received certificate) ended the gossip phase.
        if threshold_reached {
            debug!(node = self.seat.index, "aggregating collected responses");
            let (sig, final_mask) = responses.aggregate()?;
            let mut final_sig = sig.0;
            final_sig.extend_from_slice(final_mask.as_bytes());
            info!(
                node = self.seat.index,
                signers = final_mask.count_enabled(),
                "final signature assembled"
            );
            if let Some(tx) = self.final_tx.take() {
                let _ = tx.send(final_sig.clone());
            }
            let root_sig = bls::sign(&self.seat.keypair.secret, &final_sig);
            shutdown_cert = Some(Shutdown {
                params: self.params,
                final_cosig: final_sig,
                root_sig,
                msg: self.msg.clone().unwrap_or_default(),
            });
        }

        // Phase 3: propagate shutdown, then echo it at anyone still gossiping
        // so stragglers learn of termination within one round-trip.
        if let Some(cert) = shutdown_cert.as_ref() {
            self.send_shutdowns(cert);
        }
        while !done {
            tokio::select! {
                inbound = self.inbox.rumors.recv() => match inbound {
                    Some((from, _)) => {
                        if let Some(cert) = shutdown_cert.as_ref() {
                            trace!(node = self.seat.index, to = from, "answering rumor with shutdown");
                            self.conduit.send_shutdown(self.seat.index, from, cert.clone());
                        }
                    }
                    None => done = true,
                },
                inbound = self.inbox.shutdowns.recv() => {
                    // Already shutting down.
                    if inbound.is_none() {
                        done = true;
                    }
                },
                () = &mut hard => done = true,
            }
        }
        debug!(node = self.seat.index, "protocol instance finished");
        Ok(())
    }

    /// Verify start preconditions (root side).
    fn check_integrity(&self) -> Result<(), ProtocolError> {
        if self.msg.as_deref().map_or(true, |m| m.is_empty()) {
            return Err(ProtocolError::IntegrityViolation("no proposal message"));
        }
        if self.seat.roster.is_empty() {
            return Err(ProtocolError::IntegrityViolation("empty roster"));
        }
        if self.seat.roster.get(self.seat.index).is_none() {
            return Err(ProtocolError::IntegrityViolation(
                "own index outside the roster",
            ));
        }
        if self.seat.roster.get(self.seat.root_index).is_none() {
            return Err(ProtocolError::IntegrityViolation(
                "root index outside the roster",
            ));
        }
        if self.config.response_timeout_ms < 1 {
            return Err(ProtocolError::IntegrityViolation(
                "unrealistic response timeout",
            ));
        }
        if self.config.threshold < 1 {
            return Err(ProtocolError::IntegrityViolation(
                "threshold smaller than one node",
            ));
        }
        if self.config.threshold > self.seat.roster.len() {
            return Err(ProtocolError::IntegrityViolation(
                "threshold bigger than the roster",
            ));
        }
        if self.params.gossip_tick_ns == 0 {
            return Err(ProtocolError::IntegrityViolation("zero gossip tick"));
        }
        Ok(())
    }

    /// Adopt gossiped parameters, clamping values the timer cannot take.
    fn adopt_params(&mut self, params: Parameters) {
        self.params = params;
        if self.params.gossip_tick_ns == 0 {
            self.params.gossip_tick_ns = Parameters::default().gossip_tick_ns;
        }
    }

    /// Add the own signature if the application predicate accepts. Refusal
    /// leaves this node unrepresented and is not an error.
    fn try_sign(&self, responses: &mut ResponseStore) -> Result<(), ProtocolError> {
        let Some(msg) = self.msg.as_deref() else {
            return Ok(());
        };
        if !(self.verification)(msg, &self.data) {
            debug!(node = self.seat.index, "refused to sign");
            return Ok(());
        }
        let mask = Mask::with_enabled(self.seat.roster.len(), self.seat.index as usize)
            .map_err(|_| ProtocolError::IntegrityViolation("own index outside the roster"))?;
        let response = Response {
            signature: bls::sign(&self.seat.keypair.secret, msg),
            mask: mask.to_vec(),
        };
        responses.add(self.seat.index, response)?;
        trace!(node = self.seat.index, "own signature recorded");
        Ok(())
    }

    /// Gossip the current response map to a few random peers.
    fn send_rumors(&self, responses: &ResponseStore) {
        let targets = match random_peers(
            self.seat.index,
            self.seat.roster.len(),
            self.params.rumor_peers as usize,
            &mut rand::thread_rng(),
        ) {
            Ok(targets) => targets,
            Err(err) => {
                warn!(node = self.seat.index, %err, "skipping rumor tick");
                return;
            }
        };
        let Some(msg) = self.msg.clone() else {
            return;
        };
        let rumor = Rumor {
            params: self.params,
            response_map: responses.response_map().clone(),
            msg,
        };
        trace!(node = self.seat.index, peers = targets.len(), "sending rumors");
        for target in targets {
            self.conduit.send_rumor(self.seat.index, target, rumor.clone());
        }
    }

    /// Broadcast the shutdown certificate to a few random peers.
    fn send_shutdowns(&self, cert: &Shutdown) {
        let targets = match random_peers(
            self.seat.index,
            self.seat.roster.len(),
            self.params.shutdown_peers as usize,
            &mut rand::thread_rng(),
        ) {
            Ok(targets) => targets,
            Err(err) => {
                warn!(node = self.seat.index, %err, "skipping shutdown broadcast");
                return;
            }
        };
        trace!(node = self.seat.index, peers = targets.len(), "sending shutdowns");
        for target in targets {
            self.conduit.send_shutdown(self.seat.index, target, cert.clone());
        }
    }

    /// Authenticate a shutdown certificate: the aggregate must verify over
    /// `msg` under the mask-named roster subset, and the root must have
    /// signed the aggregate bytes.
    fn verify_shutdown(&self, shutdown: &Shutdown, msg: &[u8]) -> Result<(), SpoofedShutdown> {
        let root = self
            .seat
            .roster
            .get(self.seat.root_index)
            .ok_or(SpoofedShutdown::RootIndex)?;
        bls::verify_aggregate(&shutdown.final_cosig, msg, self.seat.roster.publics())
            .map_err(SpoofedShutdown::Aggregate)?;
        bls::verify(root, &shutdown.final_cosig, &shutdown.root_sig)
            .map_err(SpoofedShutdown::RootSig)?;
        Ok(())
    }

    /// Log the first spoofed shutdown loudly, later ones quietly.
    fn note_spoofed(&mut self, err: &SpoofedShutdown) {
        if self.spoof_logged {
            trace!(node = self.seat.index, %err, "ignoring spoofed shutdown");
        } else {
            warn!(node = self.seat.index, %err, "got first spoofed shutdown");
            self.spoof_logged = true;
        }
    }
}
