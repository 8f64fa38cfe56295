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

//! Service layer: signature requests answered by a local cluster of
//! protocol instances.
//!
//! The cluster runner doubles as the simulation harness: it can drop a
//! fraction of protocol messages and force chosen nodes to refuse signing,
//! which is how the end-to-end tests exercise faulty runs.

use crate::core::crypto::bls::{Keypair, Roster};
use crate::core::protocol::gossip::{
    CosiHandle, CosiInstance, ProtocolError, Seat, VerificationFn,
};
use crate::core::types::{InstanceConfig, Parameters};
use crate::networking::router::LocalRouter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A cluster needs at least one node.
    #[error("empty cluster")]
    EmptyCluster,
    /// The run terminated without producing a signature.
    #[error("protocol aborted without a signature")]
    Aborted,
    /// The root could not be started.
    #[error("root instance unreachable")]
    RootGone,
    /// An instance failed fatally.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What a client asks the service to sign.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// Message to be collectively signed.
    pub message: Vec<u8>,
    /// Protocol parameters; defaults are filled in when absent.
    pub params: Option<Parameters>,
    /// Threshold override; the fault-budget default applies when absent.
    pub threshold: Option<usize>,
}

/// What the service replies with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureResponse {
    /// SHA-256 of the signed message.
    pub hash: Vec<u8>,
    /// Final signature: compressed aggregate point followed by the mask.
    pub signature: Vec<u8>,
}

/// SHA-256 of the message, as echoed in every response.
pub fn message_hash(msg: &[u8]) -> Vec<u8> {
    Sha256::digest(msg).to_vec()
}

/// Cluster shape and fault plan for a local run.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Number of participants.
    pub nodes: usize,
    /// Gossip parameters shared by the run.
    pub params: Parameters,
    /// Threshold override.
    pub threshold: Option<usize>,
    /// Per-instance timing.
    pub instance: Option<InstanceConfig>,
    /// Roster indices whose verification predicate refuses to sign.
    pub refusing: BTreeSet<u32>,
    /// Fraction of protocol messages dropped in flight.
    pub loss_rate: f64,
    /// Seed for the loss coin flips.
    pub loss_seed: u64,
}

impl ClusterConfig {
    /// Fault-free cluster of `nodes` participants with default parameters.
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            params: Parameters::default(),
            threshold: None,
            instance: None,
            refusing: BTreeSet::new(),
            loss_rate: 0.0,
            loss_seed: 0,
        }
    }
}

/// A full roster of protocol instances running in-process.
pub struct LocalCluster {
    /// The generated roster, for verifying the returned aggregate.
    pub roster: Arc<Roster>,
    /// The transport connecting the instances (exposed for fault injection).
    pub router: Arc<LocalRouter>,
    root: CosiHandle,
    tasks: Vec<JoinHandle<Result<(), ProtocolError>>>,
}

impl LocalCluster {
    /// Generate keys, wire up the router, and spawn one instance per seat.
    /// The root sits at index 0 and holds the message.
    pub fn spawn(cfg: &ClusterConfig, message: Vec<u8>) -> Result<Self, ServiceError> {
        if cfg.nodes == 0 {
            return Err(ServiceError::EmptyCluster);
        }
        let mut rng = rand::thread_rng();
        let keypairs: Vec<Keypair> = (0..cfg.nodes).map(|_| Keypair::generate(&mut rng)).collect();
        let roster = Arc::new(Roster::new(keypairs.iter().map(|kp| kp.public).collect()));
        let (router, inboxes) = LocalRouter::with_loss(cfg.nodes, cfg.loss_rate, cfg.loss_seed);

        let mut instance_cfg = cfg
            .instance
            .unwrap_or_else(|| InstanceConfig::for_roster(cfg.nodes));
        if let Some(threshold) = cfg.threshold {
            instance_cfg.threshold = threshold;
        }

        let mut tasks = Vec::with_capacity(cfg.nodes);
        let mut root = None;
        for (i, (keypair, inbox)) in keypairs.into_iter().zip(inboxes).enumerate() {
            let index = i as u32;
            let refuses = cfg.refusing.contains(&index);
            let verification: VerificationFn = Arc::new(move |_msg, _data| !refuses);
            let seat = Seat {
                roster: roster.clone(),
                index,
                root_index: 0,
                keypair,
            };
            let (mut instance, handle) = CosiInstance::new(
                seat,
                cfg.params,
                instance_cfg,
                verification,
                router.clone(),
                inbox,
            );
            if index == 0 {
                instance.set_message(message.clone());
                root = Some(handle);
            }
            tasks.push(tokio::spawn(instance.run()));
        }

        Ok(Self {
            roster,
            router,
            root: root.ok_or(ServiceError::EmptyCluster)?,
            tasks,
        })
    }

    /// Trigger the root.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if self.root.start() {
            Ok(())
        } else {
            Err(ServiceError::RootGone)
        }
    }

    /// Await the final signature. Channel closure means the run aborted.
    pub async fn wait_signature(&mut self) -> Result<Vec<u8>, ServiceError> {
        (&mut self.root.final_rx)
            .await
            .map_err(|_| ServiceError::Aborted)
    }

    /// Await every instance; surfaces the first fatal instance error.
    pub async fn finish(self) -> Result<(), ServiceError> {
        let results = futures::future::join_all(self.tasks).await;
        for joined in results {
            if let Ok(run) = joined {
                run?;
            }
        }
        Ok(())
    }
}

/// Serve one signature request on a freshly generated roster of `nodes`
/// in-process participants. Returns the response and the roster so callers
/// can verify the aggregate.
pub async fn collective_sign(
    nodes: usize,
    request: SignatureRequest,
) -> Result<(SignatureResponse, Arc<Roster>), ServiceError> {
    let mut cfg = ClusterConfig::new(nodes);
    cfg.params = request.params.unwrap_or_default();
    cfg.threshold = request.threshold;

    let mut cluster = LocalCluster::spawn(&cfg, request.message.clone())?;
    cluster.start()?;
    info!(nodes, "collective signing request dispatched");
    let signature = cluster.wait_signature().await?;
    let roster = cluster.roster.clone();
    Ok((
        SignatureResponse {
            hash: message_hash(&request.message),
            signature,
        },
        roster,
    ))
}

/// Configuration for the demo entrypoint, loadable from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of in-process participants.
    pub nodes: usize,
    /// Hex-encoded message to sign.
    pub message_hex: String,
    /// Use the tree-coalescing store.
    #[serde(default)]
    pub tree_mode: bool,
    /// Gossip tick override in milliseconds.
    #[serde(default)]
    pub gossip_tick_ms: Option<u64>,
    /// Threshold override.
    #[serde(default)]
    pub threshold: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            message_hex: "ff".to_string(),
            tree_mode: false,
            gossip_tick_ms: None,
            threshold: None,
        }
    }
}

impl RunConfig {
    /// Materialize the gossip parameters this config describes.
    pub fn parameters(&self) -> Parameters {
        let mut params = Parameters {
            tree_mode: self.tree_mode,
            ..Parameters::default()
        };
        if let Some(ms) = self.gossip_tick_ms {
            params.gossip_tick_ns = ms.saturating_mul(1_000_000);
        }
        params
    }
}
