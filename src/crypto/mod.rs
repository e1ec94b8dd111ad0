//! Iamages Lock - Cryptographic Core
//!
//! Argon2id key derivation, AES-128-GCM sealing, and the at-rest container.

pub mod kdf;
pub mod aead;
pub mod container;

pub use kdf::{derive, new_salt, validate_passphrase, DerivedKey, KdfParams, KEY_LEN, SALT_LEN};
pub use aead::{decrypt, encrypt, new_nonce, NONCE_LEN, TAG_LEN};
pub use container::{open, reseal, seal, KeyPair, LockedContainer, UnlockKey};
