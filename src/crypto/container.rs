//! Iamages Lock - Sealed blob container
//!
//! Wire shape (version 1, base64 per field when serialized to text):
//! ```text
//! { "salt": 16B, "nonce": 12B, "data": ciphertext, "tag": 16B }
//! ```
//!
//! Metadata and file content are sealed independently: every `seal` draws
//! its own salt and nonce, so one passphrase yields unrelated keys per blob.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::aead::{self, NONCE_LEN, TAG_LEN};
use super::kdf::{self, DerivedKey, SALT_LEN};
use crate::config::CryptoContext;
use crate::error::LockResult;

/// One protected blob at rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedContainer {
    #[serde(with = "crate::wire::b64")]
    pub salt: [u8; SALT_LEN],
    #[serde(with = "crate::wire::b64")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "crate::wire::b64")]
    pub data: Vec<u8>,
    #[serde(with = "crate::wire::b64")]
    pub tag: [u8; TAG_LEN],
}

/// Key material presented to open a container
pub enum UnlockKey {
    /// Derived against the container's own salt
    Passphrase(SecretString),
    /// Already derived by the client (browser-side Argon2id)
    Derived(DerivedKey),
}

impl UnlockKey {
    pub fn passphrase(passphrase: &str) -> Self {
        UnlockKey::Passphrase(SecretString::from(passphrase))
    }

    /// Resolve to the AES key for a container salted with `salt`
    fn resolve(&self, salt: &[u8; SALT_LEN], ctx: &CryptoContext) -> LockResult<DerivedKey> {
        match self {
            UnlockKey::Passphrase(passphrase) => kdf::derive(passphrase, salt, &ctx.kdf),
            UnlockKey::Derived(key) => Ok(key.clone()),
        }
    }
}

impl std::fmt::Debug for UnlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnlockKey::Passphrase(_) => f.write_str("UnlockKey::Passphrase([REDACTED])"),
            UnlockKey::Derived(_) => f.write_str("UnlockKey::Derived([REDACTED])"),
        }
    }
}

/// The two per-blob keys an image is opened with
#[derive(Debug)]
pub struct KeyPair {
    pub metadata: UnlockKey,
    pub file: UnlockKey,
}

impl KeyPair {
    pub fn new(metadata: UnlockKey, file: UnlockKey) -> Self {
        Self { metadata, file }
    }

    /// Same passphrase for both blobs (each still derives against its own salt)
    pub fn from_passphrase(passphrase: &SecretString) -> Self {
        let text = passphrase.expose_secret();
        Self {
            metadata: UnlockKey::passphrase(text),
            file: UnlockKey::passphrase(text),
        }
    }
}

/// Seal `plaintext` under a fresh salt, a freshly derived key and a fresh nonce.
pub fn seal(
    plaintext: &[u8],
    passphrase: &SecretString,
    ctx: &CryptoContext,
) -> LockResult<LockedContainer> {
    let salt = kdf::new_salt();
    let key = kdf::derive(passphrase, &salt, &ctx.kdf)?;
    seal_with_key(plaintext, salt, &key)
}

/// Open a container. A wrong key surfaces as `LockError::Authentication`.
pub fn open(
    container: &LockedContainer,
    key: &UnlockKey,
    ctx: &CryptoContext,
) -> LockResult<Vec<u8>> {
    let derived = key.resolve(&container.salt, ctx)?;
    aead::decrypt(&derived, &container.nonce, &container.data, &container.tag)
}

/// Open, transform and re-seal under the same key and salt with a new nonce.
///
/// Used for edits on a locked image that must not change its passphrase.
pub fn reseal<F>(
    container: &LockedContainer,
    key: &UnlockKey,
    ctx: &CryptoContext,
    edit: F,
) -> LockResult<LockedContainer>
where
    F: FnOnce(Vec<u8>) -> LockResult<Vec<u8>>,
{
    let derived = key.resolve(&container.salt, ctx)?;
    let plaintext = aead::decrypt(&derived, &container.nonce, &container.data, &container.tag)?;
    let edited = edit(plaintext)?;
    seal_with_key(&edited, container.salt, &derived)
}

fn seal_with_key(
    plaintext: &[u8],
    salt: [u8; SALT_LEN],
    key: &DerivedKey,
) -> LockResult<LockedContainer> {
    let nonce = aead::new_nonce();
    let (data, tag) = aead::encrypt(key, &nonce, plaintext)?;
    Ok(LockedContainer {
        salt,
        nonce,
        data,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn ctx() -> CryptoContext {
        CryptoContext::insecure_fast()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let passphrase = SecretString::from("hunter2");
        let sealed = seal(b"image bytes", &passphrase, &ctx()).unwrap();

        let opened = open(&sealed, &UnlockKey::passphrase("hunter2"), &ctx()).unwrap();
        assert_eq!(opened, b"image bytes");
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let sealed = seal(b"image bytes", &SecretString::from("hunter2"), &ctx()).unwrap();

        let result = open(&sealed, &UnlockKey::passphrase("wrong"), &ctx());
        assert!(matches!(result, Err(LockError::Authentication)));
    }

    #[test]
    fn test_independent_salts_per_seal() {
        let passphrase = SecretString::from("hunter2");
        let a = seal(b"same", &passphrase, &ctx()).unwrap();
        let b = seal(b"same", &passphrase, &ctx()).unwrap();

        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_nonces_never_repeat_across_seals() {
        // Same key and salt every time, as with repeated edits of one image
        let key = DerivedKey::from_bytes([7; 16]);
        let salt = kdf::new_salt();

        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let sealed = seal_with_key(b"same plaintext", salt, &key).unwrap();
            assert!(seen.insert(sealed.nonce), "nonce collision");
        }
    }

    #[test]
    fn test_open_with_client_derived_key() {
        let passphrase = SecretString::from("hunter2");
        let sealed = seal(b"meta", &passphrase, &ctx()).unwrap();

        let derived = kdf::derive(&passphrase, &sealed.salt, &ctx().kdf).unwrap();
        let encoded = crate::wire::encode(derived.expose());
        let key = UnlockKey::Derived(DerivedKey::from_base64(&encoded).unwrap());

        assert_eq!(open(&sealed, &key, &ctx()).unwrap(), b"meta");
    }

    #[test]
    fn test_reseal_keeps_salt_and_rotates_nonce() {
        let passphrase = SecretString::from("hunter2");
        let sealed = seal(b"old", &passphrase, &ctx()).unwrap();
        let key = UnlockKey::passphrase("hunter2");

        let resealed = reseal(&sealed, &key, &ctx(), |_| Ok(b"new".to_vec())).unwrap();

        assert_eq!(resealed.salt, sealed.salt);
        assert_ne!(resealed.nonce, sealed.nonce);
        assert_eq!(open(&resealed, &key, &ctx()).unwrap(), b"new");
    }

    #[test]
    fn test_wire_shape() {
        let sealed = seal(b"x", &SecretString::from("hunter2"), &ctx()).unwrap();
        let value = serde_json::to_value(&sealed).unwrap();

        for field in ["salt", "nonce", "data", "tag"] {
            assert!(value[field].is_string(), "{field} must be base64 text");
        }

        let parsed: LockedContainer = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, sealed);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_any_plaintext(plaintext in proptest::collection::vec(any::<u8>(), 0..512)) {
            let passphrase = SecretString::from("correct horse");
            let sealed = seal(&plaintext, &passphrase, &ctx()).unwrap();
            let opened = open(&sealed, &UnlockKey::passphrase("correct horse"), &ctx()).unwrap();
            prop_assert_eq!(opened, plaintext);
        }

        #[test]
        fn any_bit_flip_is_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
            flip_tag in any::<bool>(),
        ) {
            let sealed = seal(&plaintext, &SecretString::from("correct horse"), &ctx()).unwrap();
            let mut tampered = sealed.clone();
            if flip_tag {
                tampered.tag[position.index(TAG_LEN)] ^= 1 << bit;
            } else {
                let i = position.index(tampered.data.len());
                tampered.data[i] ^= 1 << bit;
            }

            let result = open(&tampered, &UnlockKey::passphrase("correct horse"), &ctx());
            prop_assert!(matches!(result, Err(LockError::Authentication)));
        }

        #[test]
        fn different_passphrase_never_opens(a in "[a-z]{3,12}", b in "[a-z]{3,12}") {
            prop_assume!(a != b);
            let sealed = seal(b"payload", &SecretString::from(a.as_str()), &ctx()).unwrap();
            let result = open(&sealed, &UnlockKey::passphrase(&b), &ctx());
            prop_assert!(matches!(result, Err(LockError::Authentication)));
        }
    }
}
