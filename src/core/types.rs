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

//! Deterministic wire types and canonical encoding helpers.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Hard cap on any single decoded wire message.
pub const MAX_WIRE_MSG_BYTES: usize = 1 << 22;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be serialized.
    #[error("serialization")]
    Serialize,
    /// Bytes could not be deserialized.
    #[error("deserialization")]
    Deserialize,
    /// Payload exceeds the wire size cap.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use BTreeMap).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    // Fast-path cap on the raw wire payload.
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Defensive cap inside the deserializer to prevent memory/CPU bombs via large container lengths.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// BLS signature bytes (48 bytes compressed G1 for single and aggregate signatures).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// Canonical map type alias.
pub type CanonicalMap<K, V> = BTreeMap<K, V>;

/// Partial aggregate: a signature together with the mask of roster indices it covers.
///
/// A single-bit mask marks one participant's own contribution; wider masks
/// carry already-aggregated sub-ranges produced by the tree store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Aggregate (or single) signature over the common message.
    pub signature: Signature,
    /// Coverage mask naming the contributing roster indices.
    pub mask: Vec<u8>,
}

/// Slot-id keyed map of responses, as carried by every rumor.
pub type ResponseMap = CanonicalMap<u32, Response>;

/// Gossiped protocol parameters (field order is wire-fixed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Interval between rumor emissions on a quiescent loop, in nanoseconds.
    pub gossip_tick_ns: u64,
    /// Number of peers addressed by each rumor emission.
    pub rumor_peers: u32,
    /// Number of peers addressed by the shutdown broadcast.
    pub shutdown_peers: u32,
    /// Selects the tree-coalescing response store over the flat one.
    pub tree_mode: bool,
}

impl Parameters {
    /// Gossip tick as a duration.
    pub fn gossip_tick(&self) -> Duration {
        Duration::from_nanos(self.gossip_tick_ns)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            gossip_tick_ns: 100_000_000, // 100ms
            rumor_peers: 3,
            shutdown_peers: 3,
            tree_mode: false,
        }
    }
}

/// Rumor message: the sender's current view of the collected responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    /// Run parameters, adopted by nodes that bootstrap from this rumor.
    pub params: Parameters,
    /// The sender's response map.
    pub response_map: ResponseMap,
    /// The message being collectively signed.
    pub msg: Vec<u8>,
}

/// Shutdown certificate: binds the final aggregate to the root's own signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shutdown {
    /// Run parameters.
    pub params: Parameters,
    /// Final signature bytes: compressed aggregate point followed by the coverage mask.
    pub final_cosig: Vec<u8>,
    /// Root's single-signer signature over `final_cosig`.
    pub root_sig: Signature,
    /// The message being collectively signed.
    pub msg: Vec<u8>,
}

/// Per-instance configuration (never gossiped).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Minimum enabled coverage bits before the root finalizes.
    pub threshold: usize,
    /// Deadline for waiting on responses; must be at least a millisecond.
    pub response_timeout_ms: u64,
    /// Absolute deadline after which the instance exits unconditionally.
    pub hard_shutdown_ms: u64,
}

impl InstanceConfig {
    /// Defaults for a roster of `n` nodes.
    pub fn for_roster(n: usize) -> Self {
        Self {
            threshold: default_threshold(n),
            response_timeout_ms: 10_000,
            hard_shutdown_ms: 11_000,
        }
    }

    /// Hard shutdown deadline as a duration.
    pub fn hard_shutdown(&self) -> Duration {
        Duration::from_millis(self.hard_shutdown_ms)
    }
}

/// Minimal threshold tolerating `f = (n - 1) / 3` missing signers.
pub fn default_threshold(n: usize) -> usize {
    n - (n - 1) / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rumor() -> Rumor {
        let mut map = ResponseMap::new();
        map.insert(
            2,
            Response {
                signature: Signature(vec![7u8; 48]),
                mask: vec![0b100],
            },
        );
        map.insert(
            0,
            Response {
                signature: Signature(vec![9u8; 48]),
                mask: vec![0b001],
            },
        );
        Rumor {
            params: Parameters::default(),
            response_map: map,
            msg: vec![0xFF],
        }
    }

    #[test]
    fn rumor_roundtrip_bitwise() {
        let rumor = sample_rumor();
        let bytes = encode_canonical(&rumor).unwrap();
        let back: Rumor = decode_canonical_limited(&bytes, MAX_WIRE_MSG_BYTES).unwrap();
        assert_eq!(back, rumor);
        let bytes2 = encode_canonical(&back).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn shutdown_roundtrip_bitwise() {
        let sd = Shutdown {
            params: Parameters {
                gossip_tick_ns: 20_000_000,
                rumor_peers: 2,
                shutdown_peers: 2,
                tree_mode: true,
            },
            final_cosig: vec![3u8; 49],
            root_sig: Signature(vec![4u8; 48]),
            msg: b"proposal".to_vec(),
        };
        let bytes = encode_canonical(&sd).unwrap();
        let back: Shutdown = decode_canonical_limited(&bytes, MAX_WIRE_MSG_BYTES).unwrap();
        assert_eq!(back, sd);
        assert_eq!(encode_canonical(&back).unwrap(), bytes);
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let bytes = vec![0u8; 64];
        let err = decode_canonical_limited::<Rumor>(&bytes, 16).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let rumor = sample_rumor();
        let mut bytes = encode_canonical(&rumor).unwrap();
        bytes.push(0);
        assert!(decode_canonical_limited::<Rumor>(&bytes, MAX_WIRE_MSG_BYTES).is_err());
    }

    #[test]
    fn default_threshold_matches_fault_budget() {
        assert_eq!(default_threshold(1), 1);
        assert_eq!(default_threshold(4), 3);
        assert_eq!(default_threshold(7), 5);
        assert_eq!(default_threshold(10), 7);
    }
}
