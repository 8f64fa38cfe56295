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

//! BLS12-381 suite: signatures in G1 (48-byte compressed), public keys in G2
//! (96-byte compressed).
//!
//! Aggregation comes in two flavors. *Weighted* aggregation multiplies each
//! signature by a 128-bit coefficient derived from the full roster before
//! summing, which defeats rogue-key attacks. Once weighted, partial
//! aggregates combine with *plain* point addition, so intermediate merges
//! during gossip never touch coefficients again.

use crate::core::crypto::mask::Mask;
use crate::core::types::Signature;
use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Compressed G1 signature length.
pub const SIG_LEN: usize = 48;
/// Compressed G2 public key length.
pub const PK_LEN: usize = 96;

const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";
const COEFF_DOMAIN: &[u8] = b"RUMORA-BDN-COEFF-V1";

/// BLS suite errors.
#[derive(Debug, Error)]
pub enum BlsError {
    /// Bytes do not decode to a curve point.
    #[error("malformed curve point")]
    BadPoint,
    /// Bytes do not decode to a secret scalar.
    #[error("malformed secret scalar")]
    BadScalar,
    /// Byte string has the wrong length.
    #[error("wrong encoding length")]
    BadLength,
    /// Hex string does not decode.
    #[error("bad key encoding")]
    BadEncoding,
    /// Pairing check failed.
    #[error("signature does not verify")]
    BadSignature,
    /// Signature list does not line up with the mask's enabled bits.
    #[error("mask does not match signature set")]
    MaskMismatch,
    /// Nothing to aggregate or verify against.
    #[error("empty signer set")]
    EmptySigners,
}

/// Secret key (scalar in Fr).
pub struct SecretKey(Scalar);

impl SecretKey {
    /// Generate a fresh random key.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        Self(Scalar::random(&mut *rng))
    }

    /// Decode from 32 big-endian bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, BlsError> {
        Option::from(Scalar::from_bytes_be(bytes))
            .map(Self)
            .ok_or(BlsError::BadScalar)
    }

    /// Encode as 32 big-endian bytes. Callers holding the result are
    /// responsible for zeroizing it.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes_be()
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(G2Projective::generator() * self.0)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(***)")
    }
}

/// Public key (point in G2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(G2Projective);

impl PublicKey {
    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; PK_LEN] {
        self.0.to_affine().to_compressed()
    }

    /// Decode from a compressed encoding.
    pub fn from_bytes(bytes: &[u8; PK_LEN]) -> Result<Self, BlsError> {
        Option::<G2Affine>::from(G2Affine::from_compressed(bytes))
            .map(|a| Self(a.into()))
            .ok_or(BlsError::BadPoint)
    }

    /// Hex encoding for display and config files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse a hex-encoded compressed key.
    pub fn from_hex(s: &str) -> Result<Self, BlsError> {
        let raw = hex::decode(s.trim()).map_err(|_| BlsError::BadEncoding)?;
        let arr: [u8; PK_LEN] = raw.try_into().map_err(|_| BlsError::BadLength)?;
        Self::from_bytes(&arr)
    }
}

/// Signing key pair.
pub struct Keypair {
    /// Secret scalar.
    pub secret: SecretKey,
    /// Matching public key.
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a fresh pair.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let secret = SecretKey::generate(rng);
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// Ordered roster of participant public keys. Indices are stable identities.
#[derive(Clone, Debug)]
pub struct Roster {
    publics: Vec<PublicKey>,
}

impl Roster {
    /// Build from an ordered key list.
    pub fn new(publics: Vec<PublicKey>) -> Self {
        Self { publics }
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.publics.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.publics.is_empty()
    }

    /// All public keys in roster order.
    pub fn publics(&self) -> &[PublicKey] {
        &self.publics
    }

    /// Key at roster index `i`.
    pub fn get(&self, i: u32) -> Option<&PublicKey> {
        self.publics.get(i as usize)
    }
}

/// Sign `msg` with a plain BLS signature.
pub fn sign(sk: &SecretKey, msg: &[u8]) -> Signature {
    let h = G1Projective::hash_to_curve(msg, DST, &[]);
    let sig = h * sk.0;
    Signature(sig.to_affine().to_compressed().to_vec())
}

/// Verify a single-signer BLS signature.
pub fn verify(pk: &PublicKey, msg: &[u8], sig: &Signature) -> Result<(), BlsError> {
    if msg.is_empty() || sig.0.is_empty() {
        return Err(BlsError::BadLength);
    }
    let s = decompress_g1(&sig.0)?;
    let h = G1Projective::hash_to_curve(msg, DST, &[]);
    let gen = G2Projective::generator().to_affine();
    if pairing(&s.to_affine(), &gen) == pairing(&h.to_affine(), &pk.0.to_affine()) {
        Ok(())
    } else {
        Err(BlsError::BadSignature)
    }
}

/// Weighted aggregation: the i-th signature belongs to the i-th enabled mask
/// bit and is multiplied by that roster index's coefficient before summing.
pub fn aggregate_weighted(
    sigs: &[Signature],
    mask: &Mask,
    publics: &[PublicKey],
) -> Result<Signature, BlsError> {
    if sigs.is_empty() {
        return Err(BlsError::EmptySigners);
    }
    if sigs.len() != mask.count_enabled() {
        return Err(BlsError::MaskMismatch);
    }
    let coeffs = coefficients(publics);
    let mut acc = G1Projective::identity();
    for (i, sig) in sigs.iter().enumerate() {
        let index = mask.index_of_nth_enabled(i).ok_or(BlsError::MaskMismatch)?;
        let coeff = coeffs.get(index).ok_or(BlsError::MaskMismatch)?;
        acc += decompress_g1(&sig.0)? * coeff;
    }
    Ok(Signature(acc.to_affine().to_compressed().to_vec()))
}

/// Plain aggregation of already-weighted signatures.
pub fn aggregate_plain(sigs: &[Signature]) -> Result<Signature, BlsError> {
    if sigs.is_empty() {
        return Err(BlsError::EmptySigners);
    }
    let mut acc = G1Projective::identity();
    for sig in sigs {
        acc += decompress_g1(&sig.0)?;
    }
    Ok(Signature(acc.to_affine().to_compressed().to_vec()))
}

/// Verify a final signature (`compressed point || mask bytes`) over `msg`
/// under the roster subset named by its trailing mask. Returns the mask.
pub fn verify_aggregate(
    final_sig: &[u8],
    msg: &[u8],
    publics: &[PublicKey],
) -> Result<Mask, BlsError> {
    if publics.is_empty() {
        return Err(BlsError::EmptySigners);
    }
    let width = publics.len();
    if final_sig.len() != SIG_LEN + Mask::byte_len(width) {
        return Err(BlsError::BadLength);
    }
    let point = decompress_g1(&final_sig[..SIG_LEN])?;
    let mut mask = Mask::new(width);
    mask.merge(&final_sig[SIG_LEN..])
        .map_err(|_| BlsError::BadLength)?;
    if mask.count_enabled() == 0 {
        return Err(BlsError::EmptySigners);
    }

    let coeffs = coefficients(publics);
    let mut apk = G2Projective::identity();
    for (i, pk) in publics.iter().enumerate() {
        if mask.is_enabled(i) {
            apk += pk.0 * coeffs[i];
        }
    }

    let h = G1Projective::hash_to_curve(msg, DST, &[]);
    let gen = G2Projective::generator().to_affine();
    if pairing(&point.to_affine(), &gen) == pairing(&h.to_affine(), &apk.to_affine()) {
        Ok(mask)
    } else {
        Err(BlsError::BadSignature)
    }
}

/// Per-index 128-bit aggregation coefficients derived from the whole roster.
fn coefficients(publics: &[PublicKey]) -> Vec<Scalar> {
    let mut roster_bytes = Vec::with_capacity(publics.len() * PK_LEN);
    for pk in publics {
        roster_bytes.extend_from_slice(&pk.to_bytes());
    }
    // 2^64 as a field element, to stitch two u64 limbs together.
    let shift = Scalar::from(u64::MAX) + Scalar::from(1u64);
    (0..publics.len() as u32)
        .map(|i| {
            let mut hasher = Sha256::new();
            hasher.update(COEFF_DOMAIN);
            hasher.update(i.to_le_bytes());
            hasher.update(&roster_bytes);
            let digest = hasher.finalize();
            let mut lo = [0u8; 8];
            let mut hi = [0u8; 8];
            lo.copy_from_slice(&digest[0..8]);
            hi.copy_from_slice(&digest[8..16]);
            Scalar::from(u64::from_le_bytes(hi)) * shift + Scalar::from(u64::from_le_bytes(lo))
        })
        .collect()
}

fn decompress_g1(bytes: &[u8]) -> Result<G1Projective, BlsError> {
    let arr: [u8; SIG_LEN] = bytes.try_into().map_err(|_| BlsError::BadLength)?;
    Option::<G1Affine>::from(G1Affine::from_compressed(&arr))
        .map(G1Projective::from)
        .ok_or(BlsError::BadPoint)
}
