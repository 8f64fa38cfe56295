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

//! Rumora - gossip-based BLS collective signing.
//!
//! This repository provides:
//! - A BLS12-381 signing suite with rogue-key-resistant weighted aggregation
//! - Flat and tree-coalescing containers for partial aggregate signatures
//! - A per-node gossip protocol instance (rumor dissemination, threshold
//!   detection, authenticated shutdown propagation)
//! - An in-process transport with fault injection for multi-node runs
//! - File-backed key storage with optional at-rest encryption

/// Core protocol primitives (types, crypto, protocol state machine, security).
pub mod core;
/// Networking seams (peer selection, in-process message routing).
pub mod networking;
/// Service layer: signature requests served by a local cluster of instances.
pub mod service;
