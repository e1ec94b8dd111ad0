//! Iamages Lock - AEAD Encryption
//!
//! AES-128-GCM with a detached 16-byte tag, 96-bit random nonces.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Key, Nonce, Tag,
};
use rand::RngCore;

use super::kdf::DerivedKey;
use crate::error::{LockError, LockResult};

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Generate a random nonce. Every encryption draws a fresh one.
pub fn new_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext`, returning the ciphertext and its detached tag.
pub fn encrypt(
    key: &DerivedKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> LockResult<(Vec<u8>, [u8; TAG_LEN])> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.expose()));

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer)
        .map_err(|_| LockError::Precondition("AES-GCM encryption failed".into()))?;

    Ok((buffer, tag.into()))
}

/// Decrypt and verify. Any tag mismatch (wrong key, corruption, tampering)
/// is reported as [`LockError::Authentication`] and no plaintext escapes.
pub fn decrypt(
    key: &DerivedKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> LockResult<Vec<u8>> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.expose()));

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| LockError::Authentication)?;

    Ok(buffer)
}
