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

//! File-backed BLS key storage.
//!
//! - **Atomic writes** for private key material.
//! - **Key-at-rest encryption** (optional) via `RUMORA_KEY_PASSPHRASE`.
//! - **Best-effort zeroization** of sensitive buffers.
//!
//! ### Key encryption format
//! If `RUMORA_KEY_PASSPHRASE` is set, the key file is stored as
//! `MAGIC(8) || SALT(16) || NONCE(12) || CIPHERTEXT+TAG(..)`
//! where the ciphertext is AES-256-GCM over the 32-byte secret scalar.
//! Without a passphrase the file holds the raw 32 bytes.

use crate::core::crypto::bls::{Keypair, SecretKey};
use ring::{
    aead, pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use std::{
    fs,
    io::Write,
    num::NonZeroU32,
    path::Path,
};
use thiserror::Error;
use zeroize::Zeroize;

const KEY_FILE_MAGIC: &[u8] = b"RUMKEY01"; // 8 bytes
const KEY_SALT_LEN: usize = 16;
const KEY_NONCE_LEN: usize = 12;
const SECRET_LEN: usize = 32;

// PBKDF2 baseline for server-side passphrases.
const PBKDF2_ITERS: u32 = 100_000;

/// Keystore errors.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Filesystem operation failed.
    #[error("io")]
    Io,
    /// Key file bytes do not decode to a key.
    #[error("invalid key encoding")]
    InvalidKey,
    /// Encrypted key file but no passphrase (set RUMORA_KEY_PASSPHRASE).
    #[error("missing passphrase (set RUMORA_KEY_PASSPHRASE)")]
    MissingPassphrase,
    /// Cipher or randomness failure.
    #[error("crypto")]
    Crypto,
}

fn passphrase_from_env() -> Option<String> {
    match std::env::var("RUMORA_KEY_PASSPHRASE") {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), KeystoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| KeystoreError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| KeystoreError::Io)?;
        f.write_all(bytes).map_err(|_| KeystoreError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| KeystoreError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

fn derive_aes256gcm_key(
    passphrase: &[u8],
    salt: &[u8; KEY_SALT_LEN],
) -> Result<[u8; 32], KeystoreError> {
    let iters = NonZeroU32::new(PBKDF2_ITERS).ok_or(KeystoreError::Crypto)?;
    let mut out = [0u8; 32];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iters, salt, passphrase, &mut out);
    Ok(out)
}

fn encrypt_secret(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; KEY_SALT_LEN];
    rng.fill(&mut salt).map_err(|_| KeystoreError::Crypto)?;

    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| KeystoreError::Crypto)?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_aes256gcm_key(passphrase, &salt)?;
    let unbound =
        aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| KeystoreError::Crypto)?;
    let less_safe = aead::LessSafeKey::new(unbound);

    // ciphertext buffer = plaintext + tag
    let mut in_out = plaintext.to_vec();
    less_safe
        .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| KeystoreError::Crypto)?;

    key.zeroize();

    let mut out =
        Vec::with_capacity(KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + in_out.len());
    out.extend_from_slice(KEY_FILE_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    Ok(out)
}

fn decrypt_secret(passphrase: &[u8], bytes: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    if bytes.len() < KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN + 16 {
        return Err(KeystoreError::InvalidKey);
    }

    let mut salt = [0u8; KEY_SALT_LEN];
    salt.copy_from_slice(&bytes[KEY_FILE_MAGIC.len()..KEY_FILE_MAGIC.len() + KEY_SALT_LEN]);
    let mut nonce_bytes = [0u8; KEY_NONCE_LEN];
    nonce_bytes.copy_from_slice(
        &bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN
            ..KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN],
    );
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut key = derive_aes256gcm_key(passphrase, &salt)?;
    let unbound =
        aead::UnboundKey::new(&aead::AES_256_GCM, &key).map_err(|_| KeystoreError::Crypto)?;
    let less_safe = aead::LessSafeKey::new(unbound);

    let mut in_out = bytes[KEY_FILE_MAGIC.len() + KEY_SALT_LEN + KEY_NONCE_LEN..].to_vec();
    let plain = less_safe
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| KeystoreError::Crypto)?
        .to_vec();

    key.zeroize();
    in_out.zeroize();
    Ok(plain)
}

fn keypair_from_secret_bytes(bytes: &[u8]) -> Result<Keypair, KeystoreError> {
    let mut arr = [0u8; SECRET_LEN];
    if bytes.len() != SECRET_LEN {
        return Err(KeystoreError::InvalidKey);
    }
    arr.copy_from_slice(bytes);
    let secret = SecretKey::from_bytes(&arr).map_err(|_| KeystoreError::InvalidKey);
    arr.zeroize();
    let secret = secret?;
    let public = secret.public_key();
    Ok(Keypair { secret, public })
}

/// Load the key pair from `path`, creating a fresh one if the file does not
/// exist. With `RUMORA_KEY_PASSPHRASE` set, new files are encrypted at rest
/// and encrypted files require the passphrase to open.
pub fn load_or_create(path: &Path) -> Result<Keypair, KeystoreError> {
    let pass = passphrase_from_env();

    if path.exists() {
        let bytes = fs::read(path).map_err(|_| KeystoreError::Io)?;
        let mut secret_bytes = if bytes.starts_with(KEY_FILE_MAGIC) {
            let Some(p) = pass.as_deref() else {
                return Err(KeystoreError::MissingPassphrase);
            };
            decrypt_secret(p.as_bytes(), &bytes)?
        } else {
            bytes
        };
        let kp = keypair_from_secret_bytes(&secret_bytes);
        secret_bytes.zeroize();
        return kp;
    }

    let secret = SecretKey::generate(&mut rand::thread_rng());
    let mut raw = secret.to_bytes().to_vec();
    let on_disk = if let Some(p) = pass.as_deref() {
        let enc = encrypt_secret(p.as_bytes(), &raw)?;
        raw.zeroize();
        enc
    } else {
        raw.clone()
    };
    atomic_write_private(path, &on_disk)?;
    raw.zeroize();

    let public = secret.public_key();
    Ok(Keypair { secret, public })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reload_yields_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosigner.key");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first.public, second.public);
    }

    #[test]
    fn rejects_truncated_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cosigner.key");
        fs::write(&path, [1u8; 7]).unwrap();
        assert!(matches!(
            load_or_create(&path),
            Err(KeystoreError::InvalidKey)
        ));
    }

    #[test]
    fn encrypted_roundtrip_with_passphrase() {
        let secret = [42u8; SECRET_LEN];
        let enc = encrypt_secret(b"open sesame", &secret).unwrap();
        assert!(enc.starts_with(KEY_FILE_MAGIC));
        let dec = decrypt_secret(b"open sesame", &enc).unwrap();
        assert_eq!(dec, secret);
        assert!(decrypt_secret(b"wrong", &enc).is_err());
    }
}
