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

//! Rumora demo entrypoint.
//! Runs one collective-signing round on an in-process cluster and prints
//! the resulting aggregate signature.

use anyhow::{bail, Context, Result};
use rumora::core::crypto::bls;
use rumora::service::{collective_sign, RunConfig, SignatureRequest};
use tracing::info;

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn load_config() -> Result<RunConfig> {
    // A TOML file wins over individual env overrides.
    if let Ok(path) = std::env::var("RUMORA_CONFIG") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {path}"))?;
        return toml::from_str(&raw).with_context(|| format!("parsing config {path}"));
    }

    let mut cfg = RunConfig::default();
    cfg.nodes = env("RUMORA_NODES", "5").parse().context("RUMORA_NODES")?;
    cfg.message_hex = env("RUMORA_MESSAGE", "ff");
    cfg.tree_mode = env("RUMORA_TREE_MODE", "false")
        .parse()
        .context("RUMORA_TREE_MODE")?;
    if let Ok(ms) = std::env::var("RUMORA_TICK_MS") {
        cfg.gossip_tick_ms = Some(ms.parse().context("RUMORA_TICK_MS")?);
    }
    if let Ok(t) = std::env::var("RUMORA_THRESHOLD") {
        cfg.threshold = Some(t.parse().context("RUMORA_THRESHOLD")?);
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let cfg = load_config()?;
    let message = hex::decode(cfg.message_hex.trim()).context("RUMORA_MESSAGE")?;
    if message.is_empty() {
        bail!("refusing to sign an empty message");
    }

    info!(
        nodes = cfg.nodes,
        tree_mode = cfg.tree_mode,
        "starting local collective signing round"
    );

    let request = SignatureRequest {
        message: message.clone(),
        params: Some(cfg.parameters()),
        threshold: cfg.threshold,
    };
    let (response, roster) = collective_sign(cfg.nodes, request).await?;

    let mask = bls::verify_aggregate(&response.signature, &message, roster.publics())
        .context("final signature does not verify")?;
    info!(
        signers = mask.count_enabled(),
        hash = %hex::encode(&response.hash),
        "signature verified"
    );
    println!("{}", hex::encode(&response.signature));
    Ok(())
}
