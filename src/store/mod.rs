//! Iamages Lock - Storage collaborators
//!
//! The core sees the host through three seams: a blob store for file and
//! thumbnail bytes, a record store for image records, and an identity check.

pub mod memory;
pub mod fs;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::crypto::{LockedContainer, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::{LockError, LockResult};
use crate::model::{ImageId, ImageRecord, Lock, MetadataContainer, ThumbnailState};
use crate::wire;

pub use fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryRecordStore};
pub use sqlite::SqliteRecordStore;

const CONTENT_TYPE: &str = "content_type";
const SALT: &str = "salt";
const NONCE: &str = "nonce";
const TAG: &str = "tag";

// ═══════════════════════════════════════════════════════════════════════════
// BLOBS
// ═══════════════════════════════════════════════════════════════════════════

/// Out-of-band metadata stored next to a blob: `content_type`, plus
/// base64 `salt`/`nonce`/`tag` while the blob is sealed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobMetadata(BTreeMap<String, String>);

impl BlobMetadata {
    pub fn for_plain(content_type: &str) -> Self {
        let mut map = BTreeMap::new();
        map.insert(CONTENT_TYPE.to_string(), content_type.to_string());
        Self(map)
    }

    pub fn for_sealed(content_type: &str, container: &LockedContainer) -> Self {
        let mut meta = Self::for_plain(content_type);
        meta.0.insert(SALT.to_string(), wire::encode(&container.salt));
        meta.0.insert(NONCE.to_string(), wire::encode(&container.nonce));
        meta.0.insert(TAG.to_string(), wire::encode(&container.tag));
        meta
    }

    pub fn content_type(&self) -> Option<&str> {
        self.0.get(CONTENT_TYPE).map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Any of the sealing fields present
    pub fn is_sealed(&self) -> bool {
        [SALT, NONCE, TAG].iter().any(|k| self.0.contains_key(*k))
    }

    /// Reassemble the file-side container from the blob's bytes.
    ///
    /// `Ok(None)` for a plaintext blob; a partial set of sealing fields is
    /// treated as corruption.
    pub fn container(&self, data: Vec<u8>) -> LockResult<Option<LockedContainer>> {
        match (self.0.get(SALT), self.0.get(NONCE), self.0.get(TAG)) {
            (None, None, None) => Ok(None),
            (Some(salt), Some(nonce), Some(tag)) => Ok(Some(LockedContainer {
                salt: decode_field::<SALT_LEN>(SALT, salt)?,
                nonce: decode_field::<NONCE_LEN>(NONCE, nonce)?,
                data,
                tag: decode_field::<TAG_LEN>(TAG, tag)?,
            })),
            _ => Err(LockError::Storage(
                "blob metadata carries a partial set of sealing fields".into(),
            )),
        }
    }
}

fn decode_field<const N: usize>(name: &str, text: &str) -> LockResult<[u8; N]> {
    wire::decode(text)
        .ok()
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or_else(|| LockError::Storage(format!("blob metadata field {name} is malformed")))
}

/// Blob bytes together with their metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub metadata: BlobMetadata,
}

/// Byte storage keyed by image identifier
pub trait BlobStore: Send + Sync {
    /// `LockError::NotFound` when absent
    fn get(&self, id: &ImageId) -> LockResult<Blob>;

    /// Replace bytes and metadata together
    fn put(&self, id: &ImageId, bytes: &[u8], metadata: &BlobMetadata) -> LockResult<()>;

    /// Removing a missing blob is not an error
    fn delete(&self, id: &ImageId) -> LockResult<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════

/// A conditional partial update.
///
/// `expect_*` fields are compared against the stored record first; any
/// mismatch fails the whole update with `LockError::Conflict` and nothing
/// is written. Setting the lock, the metadata or the transition marker
/// bumps the record's revision.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub expect_lock: Option<Lock>,
    pub expect_thumbnail: Option<ThumbnailState>,
    pub expect_revision: Option<u64>,
    /// `Some(Some(t))` marks a transition started at `t`, `Some(None)` clears it
    pub transition: Option<Option<DateTime<Utc>>>,
    pub content_type: Option<String>,
    pub is_private: Option<bool>,
    pub lock: Option<Lock>,
    pub thumbnail: Option<ThumbnailState>,
    pub metadata: Option<MetadataContainer>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_lock(mut self, lock: Lock) -> Self {
        self.expect_lock = Some(lock);
        self
    }

    pub fn expect_thumbnail(mut self, state: ThumbnailState) -> Self {
        self.expect_thumbnail = Some(state);
        self
    }

    pub fn expect_revision(mut self, revision: u64) -> Self {
        self.expect_revision = Some(revision);
        self
    }

    pub fn begin_transition(mut self, at: DateTime<Utc>) -> Self {
        self.transition = Some(Some(at));
        self
    }

    pub fn end_transition(mut self) -> Self {
        self.transition = Some(None);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_private(mut self, is_private: bool) -> Self {
        self.is_private = Some(is_private);
        self
    }

    pub fn lock(mut self, lock: Lock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn thumbnail(mut self, state: ThumbnailState) -> Self {
        self.thumbnail = Some(state);
        self
    }

    pub fn metadata(mut self, metadata: MetadataContainer) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Check expectations, then apply every set field. The record is left
    /// untouched on error.
    pub fn apply(&self, record: &mut ImageRecord) -> LockResult<()> {
        if self.expect_lock.is_some_and(|l| l != record.lock)
            || self.expect_thumbnail.is_some_and(|t| t != record.thumbnail)
            || self.expect_revision.is_some_and(|r| r != record.revision)
        {
            return Err(LockError::Conflict(record.id));
        }

        let mut next = record.clone();
        if let Some(content_type) = &self.content_type {
            next.content_type = content_type.clone();
        }
        if let Some(is_private) = self.is_private {
            next.is_private = is_private;
        }
        if let Some(lock) = self.lock {
            next.lock = lock;
        }
        if let Some(thumbnail) = self.thumbnail {
            next.thumbnail = thumbnail;
        }
        if let Some(metadata) = &self.metadata {
            next.metadata = metadata.clone();
        }
        if let Some(transition) = self.transition {
            next.transition_since = transition;
        }
        if self.lock.is_some() || self.metadata.is_some() || self.transition.is_some() {
            next.revision = record.revision.wrapping_add(1);
        }
        next.check_consistency()?;

        *record = next;
        Ok(())
    }
}

/// Image record storage
pub trait RecordStore: Send + Sync {
    fn get(&self, id: &ImageId) -> LockResult<ImageRecord>;

    /// Fails if the identifier already exists
    fn insert(&self, record: &ImageRecord) -> LockResult<()>;

    /// Apply `update` atomically (read, check, write as one unit) and return
    /// the record as stored.
    fn update(&self, id: &ImageId, update: &RecordUpdate) -> LockResult<ImageRecord>;

    fn delete(&self, id: &ImageId) -> LockResult<()>;
}

/// The storage collaborators one image touches
#[derive(Clone)]
pub struct Stores {
    /// Full-resolution file blobs
    pub images: Arc<dyn BlobStore>,
    /// Generated thumbnails, keyed by the same identifier
    pub thumbnails: Arc<dyn BlobStore>,
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            images: Arc::new(MemoryBlobStore::new()),
            thumbnails: Arc::new(MemoryBlobStore::new()),
            records: Arc::new(MemoryRecordStore::new()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IDENTITY
// ═══════════════════════════════════════════════════════════════════════════

/// Who is making a request, as established by the host's authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    User(String),
}

impl Caller {
    pub fn user(name: impl Into<String>) -> Self {
        Caller::User(name.into())
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Caller::User(name) => Some(name),
            Caller::Anonymous => None,
        }
    }
}

/// Ownership check supplied by the host
pub trait Identity: Send + Sync {
    fn is_owner(&self, image: &ImageRecord, caller: &Caller) -> bool;
}

/// Owner string equality, compared in constant time for equal lengths
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerMatch;

impl Identity for OwnerMatch {
    fn is_owner(&self, image: &ImageRecord, caller: &Caller) -> bool {
        match (&image.owner, caller) {
            (Some(owner), Caller::User(name)) => owner.as_bytes().ct_eq(name.as_bytes()).into(),
            _ => false,
        }
    }
}
