//! Iamages Lock - Argon2id key derivation
//!
//! Passphrase + 16-byte salt -> 16-byte AES-128 key. The cost parameters are
//! part of lock version 1 and must not change for existing data.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{LockError, LockResult};

/// Derived key length (AES-128)
pub const KEY_LEN: usize = 16;

/// Salt length
pub const SALT_LEN: usize = 16;

/// Minimum passphrase length accepted by the lock-setting API
pub const MIN_PASSPHRASE_LEN: usize = 3;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Iterations (time cost)
    pub time_cost: u32,
    /// Memory in KiB
    pub memory_cost_kib: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// Version 1 parameters (RFC 9106 second recommendation, 16-byte output)
    fn default() -> Self {
        Self {
            time_cost: 3,
            memory_cost_kib: 64 * 1024, // 64 MiB
            parallelism: 4,
        }
    }
}

/// A derived AES-128 key, zeroized on drop
#[derive(Clone)]
pub struct DerivedKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Parse a client-derived key sent as base64. Must decode to exactly 16 bytes.
    pub fn from_base64(encoded: &str) -> LockResult<Self> {
        let decoded = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| LockError::MalformedKey(e.to_string()))?,
        );

        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            LockError::MalformedKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;

        Ok(Self::from_bytes(bytes))
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 16-byte salt
pub fn new_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Reject passphrases below the minimum length before any key derivation runs.
pub fn validate_passphrase(passphrase: &SecretString, min_len: usize) -> LockResult<()> {
    let actual = passphrase.expose_secret().chars().count();
    if actual < min_len {
        return Err(LockError::WeakInput {
            min: min_len,
            actual,
        });
    }
    Ok(())
}

/// Derive a key from a passphrase and salt with Argon2id.
///
/// Deterministic for a given `(passphrase, salt, params)`. Blocks for the full
/// memory-hard cost; run it off any async executor thread.
pub fn derive(
    passphrase: &SecretString,
    salt: &[u8; SALT_LEN],
    params: &KdfParams,
) -> LockResult<DerivedKey> {
    let argon2_params = Params::new(
        params.memory_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| LockError::Precondition(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut *key)
        .map_err(|e| LockError::Precondition(format!("Argon2id derivation failed: {e}")))?;

    Ok(DerivedKey { bytes: key })
}
