//! Iamages Lock - Ownerless capability
//!
//! A random 128-bit bearer token issued once for an anonymous upload. It is
//! the only way to delete that image; there is no recovery if it is lost.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::LockError;

/// Token length in bytes
pub const CAPABILITY_LEN: usize = 16;

/// Ownerless capability token, rendered as a hyphenated UUID
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OwnerlessKey([u8; CAPABILITY_LEN]);

impl OwnerlessKey {
    /// Draw a fresh token
    pub fn issue() -> Self {
        let mut bytes = [0u8; CAPABILITY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; CAPABILITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CAPABILITY_LEN] {
        &self.0
    }

    /// Constant-time comparison against a presented token
    pub fn verify(&self, presented: &OwnerlessKey) -> bool {
        verify(self, presented)
    }
}

/// Constant-time comparison of the stored and presented tokens. Both are
/// fixed-width, so no length branch exists.
pub fn verify(stored: &OwnerlessKey, presented: &OwnerlessKey) -> bool {
    stored.0.ct_eq(&presented.0).into()
}

/// Verify a token in its text form. Unparseable input is still compared
/// (against an all-zero token) so the rejection path does the same work.
pub fn verify_str(stored: &OwnerlessKey, presented: &str) -> bool {
    let (candidate, parsed) = match presented.parse::<OwnerlessKey>() {
        Ok(key) => (key, true),
        Err(_) => (OwnerlessKey([0u8; CAPABILITY_LEN]), false),
    };
    verify(stored, &candidate) & parsed
}

impl PartialEq for OwnerlessKey {
    fn eq(&self, other: &Self) -> bool {
        verify(self, other)
    }
}

impl Eq for OwnerlessKey {}

impl fmt::Display for OwnerlessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

impl fmt::Debug for OwnerlessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OwnerlessKey([REDACTED])")
    }
}

impl FromStr for OwnerlessKey {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(|uuid| Self(uuid.into_bytes()))
            .map_err(|_| LockError::MalformedKey("ownerless key is not a UUID".into()))
    }
}

impl Serialize for OwnerlessKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OwnerlessKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_issue_is_random() {
        assert_ne!(OwnerlessKey::issue(), OwnerlessKey::issue());
    }

    #[test]
    fn test_verify() {
        let stored = OwnerlessKey::issue();
        assert!(stored.verify(&stored.clone()));
        assert!(!stored.verify(&OwnerlessKey::issue()));
    }

    #[test]
    fn test_equality_is_constant_time_verify() {
        let stored = OwnerlessKey::from_bytes([0x11; CAPABILITY_LEN]);
        let mut last_byte_differs = [0x11; CAPABILITY_LEN];
        last_byte_differs[CAPABILITY_LEN - 1] = 0x12;

        assert_eq!(stored, OwnerlessKey::from_bytes([0x11; CAPABILITY_LEN]));
        assert_ne!(stored, OwnerlessKey::from_bytes(last_byte_differs));
        assert_eq!(
            stored == OwnerlessKey::from_bytes(last_byte_differs),
            verify(&stored, &OwnerlessKey::from_bytes(last_byte_differs))
        );
    }

    #[test]
    fn test_text_roundtrip() {
        let stored = OwnerlessKey::issue();
        let text = stored.to_string();
        assert_eq!(text.len(), 36);

        assert!(verify_str(&stored, &text));
        assert!(verify_str(&stored, &text.to_uppercase()));
        assert!(!verify_str(&stored, "garbage"));
        assert!(!verify_str(&stored, ""));
    }

    #[test]
    fn test_serde_as_uuid_string() {
        let stored = OwnerlessKey::from_bytes([0xab; CAPABILITY_LEN]);
        let json = serde_json::to_string(&stored).unwrap();
        assert_eq!(json, "\"abababab-abab-abab-abab-abababababab\"");
        assert_eq!(serde_json::from_str::<OwnerlessKey>(&json).unwrap(), stored);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = OwnerlessKey::issue();
        assert!(!format!("{key:?}").contains(&key.to_string()));
    }

    fn time_verify(stored: &OwnerlessKey, presented: &OwnerlessKey, rounds: u32) -> Duration {
        let start = Instant::now();
        for _ in 0..rounds {
            std::hint::black_box(verify(
                std::hint::black_box(stored),
                std::hint::black_box(presented),
            ));
        }
        start.elapsed()
    }

    #[test]
    #[ignore = "timing measurement; run on an idle machine"]
    fn test_verify_timing_independent_of_prefix() {
        let stored = OwnerlessKey::from_bytes([0x5a; CAPABILITY_LEN]);
        let mut prefix = [0x5a; CAPABILITY_LEN];
        prefix[CAPABILITY_LEN - 1] = 0x00;
        let near_miss = OwnerlessKey::from_bytes(prefix);
        let far_miss = OwnerlessKey::from_bytes([0xa5; CAPABILITY_LEN]);

        const ROUNDS: u32 = 200_000;
        // Warm up caches and branch predictors
        time_verify(&stored, &far_miss, ROUNDS);

        let mut ratios = Vec::new();
        for _ in 0..15 {
            let near = time_verify(&stored, &near_miss, ROUNDS).as_secs_f64();
            let far = time_verify(&stored, &far_miss, ROUNDS).as_secs_f64();
            ratios.push(near / far);
        }
        ratios.sort_by(|a, b| a.total_cmp(b));
        let median = ratios[ratios.len() / 2];

        assert!(
            (0.8..1.25).contains(&median),
            "median near/far timing ratio {median:.3}"
        );
    }
}
