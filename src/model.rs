//! Iamages Lock - Image record model
//!
//! Persisted shapes for an image record: the lock flag, the thumbnail flags
//! and the metadata container. Enum states are converted to and from the
//! flag-style wire objects at the serde boundary, so an inconsistent
//! combination is rejected on load instead of surfacing later.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::OwnerlessKey;
use crate::crypto::{KeyPair, LockedContainer, UnlockKey};
use crate::error::{LockError, LockResult};

/// Content type shown for every locked image
pub const OPAQUE_CONTENT_TYPE: &str = "application/octet-stream";

/// Description length limits, in characters
pub const DESCRIPTION_MIN: usize = 1;
pub const DESCRIPTION_MAX: usize = 255;

// ═══════════════════════════════════════════════════════════════════════════
// IDENTIFIER
// ═══════════════════════════════════════════════════════════════════════════

/// Time-ordered image identifier (UUID v7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Creation time embedded in the identifier
    pub fn created_on(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ImageId {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| LockError::NotFound(format!("image {s}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LOCK
// ═══════════════════════════════════════════════════════════════════════════

/// At-rest protection scheme. Numbered for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LockVersion {
    /// Argon2id (t=3, m=64 MiB, p=4) -> AES-128-GCM, per-blob salt
    Aes128GcmArgon2 = 1,
}

impl LockVersion {
    pub const CURRENT: LockVersion = LockVersion::Aes128GcmArgon2;
}

impl From<LockVersion> for u8 {
    fn from(v: LockVersion) -> u8 {
        v as u8
    }
}

impl TryFrom<u8> for LockVersion {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(LockVersion::Aes128GcmArgon2),
            other => Err(format!("unsupported lock version {other}")),
        }
    }
}

/// Lock state of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "LockWire", into = "LockWire")]
pub enum Lock {
    #[default]
    Unlocked,
    Locked(LockVersion),
}

impl Lock {
    pub fn current() -> Self {
        Lock::Locked(LockVersion::CURRENT)
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Lock::Locked(_))
    }

    pub fn version(&self) -> Option<LockVersion> {
        match self {
            Lock::Locked(v) => Some(*v),
            Lock::Unlocked => None,
        }
    }

    /// Locked under a scheme older than the current one
    pub fn upgradable(&self) -> bool {
        matches!(self, Lock::Locked(v) if *v < LockVersion::CURRENT)
    }
}

#[derive(Serialize, Deserialize)]
struct LockWire {
    is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<LockVersion>,
    // Derived on output, ignored on input.
    #[serde(default)]
    upgradable: bool,
}

impl From<Lock> for LockWire {
    fn from(lock: Lock) -> Self {
        Self {
            is_locked: lock.is_locked(),
            version: lock.version(),
            upgradable: lock.upgradable(),
        }
    }
}

impl TryFrom<LockWire> for Lock {
    type Error = String;

    fn try_from(wire: LockWire) -> Result<Self, Self::Error> {
        match (wire.is_locked, wire.version) {
            (true, Some(v)) => Ok(Lock::Locked(v)),
            (false, None) => Ok(Lock::Unlocked),
            (true, None) => Err("locked image without a lock version".into()),
            (false, Some(_)) => Err("unlocked image with a lock version".into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// THUMBNAIL
// ═══════════════════════════════════════════════════════════════════════════

/// Thumbnail availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ThumbnailWire", into = "ThumbnailWire")]
pub enum ThumbnailState {
    #[default]
    NoThumbnail,
    Computing,
    Ready,
    PermanentlyUnavailable,
}

impl ThumbnailState {
    /// State for a freshly created image
    pub fn initial(locked: bool) -> Self {
        if locked {
            ThumbnailState::PermanentlyUnavailable
        } else {
            ThumbnailState::NoThumbnail
        }
    }

    /// Locking discards whatever was there
    pub fn on_lock(self) -> Self {
        ThumbnailState::PermanentlyUnavailable
    }

    /// Unlocking makes the image eligible again
    pub fn on_unlock(self) -> Self {
        ThumbnailState::NoThumbnail
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThumbnailState::Ready | ThumbnailState::PermanentlyUnavailable
        )
    }
}

#[derive(Serialize, Deserialize)]
struct ThumbnailWire {
    is_computing: bool,
    is_unavailable: bool,
    #[serde(default)]
    is_ready: bool,
}

impl From<ThumbnailState> for ThumbnailWire {
    fn from(state: ThumbnailState) -> Self {
        Self {
            is_computing: state == ThumbnailState::Computing,
            is_unavailable: state == ThumbnailState::PermanentlyUnavailable,
            is_ready: state == ThumbnailState::Ready,
        }
    }
}

impl TryFrom<ThumbnailWire> for ThumbnailState {
    type Error = String;

    fn try_from(wire: ThumbnailWire) -> Result<Self, Self::Error> {
        match (wire.is_computing, wire.is_unavailable, wire.is_ready) {
            (false, false, false) => Ok(ThumbnailState::NoThumbnail),
            (true, false, false) => Ok(ThumbnailState::Computing),
            (false, false, true) => Ok(ThumbnailState::Ready),
            (false, true, false) => Ok(ThumbnailState::PermanentlyUnavailable),
            _ => Err("conflicting thumbnail flags".into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// METADATA
// ═══════════════════════════════════════════════════════════════════════════

/// Descriptive metadata, sealed as one JSON document while locked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaintextMetadata {
    pub description: String,
    pub width: u32,
    pub height: u32,
    /// True MIME type hidden behind the opaque one; set only while locked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_content_type: Option<String>,
}

impl PlaintextMetadata {
    pub fn new(description: impl Into<String>, width: u32, height: u32) -> LockResult<Self> {
        let description = description.into();
        validate_description(&description)?;
        Ok(Self {
            description,
            width,
            height,
            real_content_type: None,
        })
    }

    pub fn to_bytes(&self) -> LockResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> LockResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn validate_description(description: &str) -> LockResult<()> {
    let len = description.chars().count();
    if !(DESCRIPTION_MIN..=DESCRIPTION_MAX).contains(&len) {
        return Err(LockError::Precondition(format!(
            "description must be {DESCRIPTION_MIN}..={DESCRIPTION_MAX} characters, got {len}"
        )));
    }
    Ok(())
}

/// Metadata as stored on the record: sealed (`{salt, nonce, data, tag}`)
/// or plaintext (`{data: {...}}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataContainer {
    Sealed(LockedContainer),
    Plain { data: PlaintextMetadata },
}

impl MetadataContainer {
    pub fn plain(data: PlaintextMetadata) -> Self {
        MetadataContainer::Plain { data }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, MetadataContainer::Sealed(_))
    }

    pub fn plaintext(&self) -> Option<&PlaintextMetadata> {
        match self {
            MetadataContainer::Plain { data } => Some(data),
            MetadataContainer::Sealed(_) => None,
        }
    }

    pub fn sealed(&self) -> Option<&LockedContainer> {
        match self {
            MetadataContainer::Sealed(container) => Some(container),
            MetadataContainer::Plain { .. } => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RECORD
// ═══════════════════════════════════════════════════════════════════════════

/// One image as kept by the record store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub owner: Option<String>,
    pub is_private: bool,
    pub content_type: String,
    pub lock: Lock,
    pub thumbnail: ThumbnailState,
    pub metadata: MetadataContainer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownerless_key: Option<OwnerlessKey>,
    /// Bumped by every change to the lock, the metadata or the transition
    /// marker; lock transitions commit conditionally on it
    #[serde(default)]
    pub revision: u64,
    /// Set while a lock transition owns the file blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_since: Option<DateTime<Utc>>,
}

impl ImageRecord {
    /// Cross-field invariants: lock flag matches the metadata container,
    /// locked images never have a thumbnail, and only ownerless images
    /// carry a capability.
    pub fn check_consistency(&self) -> LockResult<()> {
        if self.lock.is_locked() != self.metadata.is_sealed() {
            return Err(LockError::Precondition(format!(
                "image {} lock flag disagrees with its metadata container",
                self.id
            )));
        }
        if self.lock.is_locked() && self.thumbnail != ThumbnailState::PermanentlyUnavailable {
            return Err(LockError::Precondition(format!(
                "locked image {} has thumbnail state {:?}",
                self.id, self.thumbnail
            )));
        }
        if self.owner.is_some() && self.ownerless_key.is_some() {
            return Err(LockError::Precondition(format!(
                "owned image {} carries an ownerless key",
                self.id
            )));
        }
        Ok(())
    }

    /// A transition marker younger than `lease` blocks other transitions.
    /// An older one is left over from a crashed writer and may be taken over.
    pub fn transition_in_progress(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.transition_since.is_some_and(|since| now - since < lease)
    }

    pub fn view(&self) -> ImageView {
        ImageView {
            id: self.id,
            created_on: self.id.created_on(),
            owner: self.owner.clone(),
            is_private: self.is_private,
            content_type: self.content_type.clone(),
            lock: self.lock,
            thumbnail: self.thumbnail,
            metadata: self.metadata.clone(),
        }
    }
}

/// What callers get back: the record minus the ownerless capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageView {
    pub id: ImageId,
    pub created_on: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub is_private: bool,
    pub content_type: String,
    pub lock: Lock,
    pub thumbnail: ThumbnailState,
    pub metadata: MetadataContainer,
}

// ═══════════════════════════════════════════════════════════════════════════
// EDITS
// ═══════════════════════════════════════════════════════════════════════════

/// A single typed edit on an image
#[derive(Debug)]
pub enum EditOp {
    SetPrivacy(bool),
    /// `metadata_key` is required when the image is locked
    SetDescription {
        description: String,
        metadata_key: Option<UnlockKey>,
    },
    /// Locks an unlocked image, or rekeys a locked one (`current` required)
    SetLock {
        passphrase: SecretString,
        current: Option<KeyPair>,
    },
    RemoveLock(KeyPair),
}

/// Result of an edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub lock_version: Option<LockVersion>,
}
