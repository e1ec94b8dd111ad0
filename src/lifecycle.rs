//! Iamages Lock - Lock lifecycle
//!
//! ```text
//!            lock(k_meta, k_file)
//!   Unlocked ───────────────────────▶ Locked(v)
//!      ▲                                │  │
//!      │        unlock(k_meta, k_file)  │  │ rekey(old, new)
//!      └────────────────────────────────┘  └──▶ Locked(current)
//! ```
//!
//! Every transition on one image follows the same order:
//! 1. per-image guard, fresh record read, owner check (before any KDF)
//! 2. all sealing/opening in memory
//! 3. transition marker set on the record, conditional on the revision
//!    read in step 1; other services sharing the stores back off while it
//!    is set
//! 4. file blob written
//! 5. record updated conditionally on the marked revision (metadata, lock,
//!    content type and thumbnail in one update, marker cleared)
//! 6. if step 5 fails, the previous file blob is written back and the
//!    marker cleared
//!
//! So the record and the file blob never disagree about being sealed,
//! short of a crash between steps 4 and 5. A marker left by a crash
//! expires after [`TRANSITION_LEASE_SECS`].
//!
//! All methods block (Argon2id runs for the full memory-hard cost); async
//! hosts should call them from `spawn_blocking`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use secrecy::SecretString;

use crate::capability::{self, OwnerlessKey};
use crate::config::{CoreConfig, CryptoContext};
use crate::crypto::{self, KeyPair, LockedContainer, UnlockKey};
use crate::error::{LockError, LockResult};
use crate::model::{
    validate_description, EditOp, EditOutcome, ImageId, ImageRecord, ImageView, Lock,
    MetadataContainer, PlaintextMetadata, ThumbnailState, OPAQUE_CONTENT_TYPE,
};
use crate::store::{Blob, BlobMetadata, Caller, Identity, OwnerMatch, RecordUpdate, Stores};
use crate::thumbnail::{ImageCodec, ResizeCodec, SUPPORTED_CONTENT_TYPES};

/// How long a transition marker keeps other writers away
pub const TRANSITION_LEASE_SECS: i64 = 300;

fn transition_lease() -> chrono::Duration {
    chrono::Duration::seconds(TRANSITION_LEASE_SECS)
}

/// A new image as handed over by the host
pub struct Upload {
    pub bytes: Vec<u8>,
    /// Declared MIME type; must match what the bytes decode as
    pub content_type: String,
    pub description: String,
    pub is_private: bool,
    /// Lock on upload with this passphrase
    pub lock: Option<SecretString>,
}

/// Result of an upload
#[derive(Debug)]
pub struct Uploaded {
    pub image: ImageView,
    /// Issued only for anonymous uploads; shown to the uploader once
    pub ownerless_key: Option<OwnerlessKey>,
}

/// Per-image mutual exclusion for transitions inside this process
#[derive(Default)]
struct TransitionLocks {
    slots: Mutex<HashMap<ImageId, Arc<Mutex<()>>>>,
}

impl TransitionLocks {
    fn acquire(&self, id: &ImageId) -> ArcMutexGuard<RawMutex, ()> {
        let slot = {
            let mut slots = self.slots.lock();
            // Only the map holds idle slots
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(*id).or_default())
        };
        slot.lock_arc()
    }
}

/// Orchestrates uploads, edits and lock transitions over the host's stores
pub struct LockService {
    ctx: CryptoContext,
    config: CoreConfig,
    stores: Stores,
    identity: Arc<dyn Identity>,
    codec: Arc<dyn ImageCodec>,
    transitions: TransitionLocks,
}

impl LockService {
    pub fn new(ctx: CryptoContext, config: CoreConfig, stores: Stores) -> Self {
        Self {
            ctx,
            config,
            stores,
            identity: Arc::new(OwnerMatch),
            codec: Arc::new(ResizeCodec),
            transitions: TransitionLocks::default(),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UPLOAD / DELETE
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a new image, optionally locked from the start.
    pub fn upload(&self, caller: &Caller, upload: Upload) -> LockResult<Uploaded> {
        let size = upload.bytes.len() as u64;
        if size > self.config.max_upload_bytes {
            return Err(LockError::Precondition(format!(
                "file is {size} bytes, limit is {}",
                self.config.max_upload_bytes
            )));
        }
        if upload.is_private && *caller == Caller::Anonymous {
            return Err(LockError::Precondition(
                "anonymous uploads cannot be private".into(),
            ));
        }
        if let Some(passphrase) = &upload.lock {
            crypto::validate_passphrase(passphrase, self.config.min_passphrase_len)?;
        }
        validate_description(&upload.description)?;

        let probe = self.codec.probe(&upload.bytes)?;
        if !SUPPORTED_CONTENT_TYPES.contains(&probe.content_type.as_str()) {
            return Err(LockError::Codec(format!(
                "unsupported image type {}",
                probe.content_type
            )));
        }
        if probe.content_type != upload.content_type {
            return Err(LockError::Codec(format!(
                "declared {} but file is {}",
                upload.content_type, probe.content_type
            )));
        }

        let id = ImageId::new();
        let mut metadata = PlaintextMetadata::new(upload.description, probe.width, probe.height)?;

        let (record_content_type, file_bytes, blob_metadata, metadata, lock) = match &upload.lock
        {
            Some(passphrase) => {
                metadata.real_content_type = Some(probe.content_type.clone());
                let sealed_meta = crypto::seal(&metadata.to_bytes()?, passphrase, &self.ctx)?;
                let sealed_file = crypto::seal(&upload.bytes, passphrase, &self.ctx)?;
                let blob_metadata = BlobMetadata::for_sealed(OPAQUE_CONTENT_TYPE, &sealed_file);
                (
                    OPAQUE_CONTENT_TYPE.to_string(),
                    sealed_file.data,
                    blob_metadata,
                    MetadataContainer::Sealed(sealed_meta),
                    Lock::current(),
                )
            }
            None => (
                probe.content_type.clone(),
                upload.bytes,
                BlobMetadata::for_plain(&probe.content_type),
                MetadataContainer::plain(metadata),
                Lock::Unlocked,
            ),
        };

        let ownerless_key = match caller {
            Caller::Anonymous => Some(OwnerlessKey::issue()),
            Caller::User(_) => None,
        };

        let record = ImageRecord {
            id,
            owner: caller.username().map(str::to_string),
            is_private: upload.is_private,
            content_type: record_content_type,
            lock,
            thumbnail: ThumbnailState::initial(lock.is_locked()),
            metadata,
            ownerless_key: ownerless_key.clone(),
            revision: 0,
            transition_since: None,
        };

        self.stores.images.put(&id, &file_bytes, &blob_metadata)?;
        if let Err(e) = self.stores.records.insert(&record) {
            if let Err(cleanup) = self.stores.images.delete(&id) {
                tracing::warn!(image = %id, error = %cleanup, "orphaned file blob after failed insert");
            }
            return Err(e);
        }

        tracing::info!(image = %id, locked = lock.is_locked(), size, "image uploaded");
        Ok(Uploaded {
            image: record.view(),
            ownerless_key,
        })
    }

    /// Delete an image with its file and thumbnail.
    ///
    /// Owned images need their owner. Ownerless images need the capability
    /// and cannot be deleted by a signed-in user.
    pub fn delete(
        &self,
        id: &ImageId,
        caller: &Caller,
        capability: Option<&str>,
    ) -> LockResult<()> {
        let _guard = self.transitions.acquire(id);
        let record = self.stores.records.get(id)?;
        if record.transition_in_progress(Utc::now(), transition_lease()) {
            return Err(LockError::Conflict(*id));
        }

        let allowed = match (&record.owner, caller) {
            (Some(_), _) => capability.is_none() && self.identity.is_owner(&record, caller),
            (None, Caller::User(_)) => false,
            (None, Caller::Anonymous) => match (&record.ownerless_key, capability) {
                (Some(stored), Some(presented)) => capability::verify_str(stored, presented),
                _ => false,
            },
        };
        if !allowed {
            return Err(LockError::NotOwner);
        }

        self.stores.records.delete(id)?;
        for (name, store) in [
            ("file", &self.stores.images),
            ("thumbnail", &self.stores.thumbnails),
        ] {
            if let Err(e) = store.delete(id) {
                tracing::warn!(image = %id, blob = name, error = %e, "blob left behind after delete");
            }
        }

        tracing::info!(image = %id, "image deleted");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READ PATHS
    // ═══════════════════════════════════════════════════════════════════════

    /// Record as visible to `caller`. Private images look absent to others.
    pub fn record(&self, id: &ImageId, caller: &Caller) -> LockResult<ImageView> {
        Ok(self.visible_record(id, caller)?.view())
    }

    /// File bytes with their blob metadata; sealed fields are included while
    /// locked so clients can decrypt locally.
    pub fn download(&self, id: &ImageId, caller: &Caller) -> LockResult<Blob> {
        self.visible_record(id, caller)?;
        self.stores.images.get(id)
    }

    fn visible_record(&self, id: &ImageId, caller: &Caller) -> LockResult<ImageRecord> {
        let record = self.stores.records.get(id)?;
        if record.is_private && !self.identity.is_owner(&record, caller) {
            return Err(LockError::NotFound(format!("image {id}")));
        }
        Ok(record)
    }

    fn owned_record(&self, id: &ImageId, caller: &Caller) -> LockResult<ImageRecord> {
        let record = self.stores.records.get(id)?;
        if !self.identity.is_owner(&record, caller) {
            return Err(LockError::NotOwner);
        }
        Ok(record)
    }

    /// Owned record with no live transition on it
    fn transition_record(&self, id: &ImageId, caller: &Caller) -> LockResult<ImageRecord> {
        let record = self.owned_record(id, caller)?;
        if record.transition_in_progress(Utc::now(), transition_lease()) {
            tracing::debug!(image = %id, "transition already in progress");
            return Err(LockError::Conflict(*id));
        }
        Ok(record)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOCK TRANSITIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Unlocked -> Locked(current). Metadata and file are sealed under
    /// independently salted keys.
    pub fn lock(
        &self,
        id: &ImageId,
        caller: &Caller,
        metadata_passphrase: &SecretString,
        file_passphrase: &SecretString,
    ) -> LockResult<ImageRecord> {
        let _guard = self.transitions.acquire(id);
        let record = self.transition_record(id, caller)?;

        crypto::validate_passphrase(metadata_passphrase, self.config.min_passphrase_len)?;
        crypto::validate_passphrase(file_passphrase, self.config.min_passphrase_len)?;

        let plaintext = match (&record.lock, record.metadata.plaintext()) {
            (Lock::Unlocked, Some(plaintext)) => plaintext,
            _ => return Err(LockError::Precondition(format!("image {id} is already locked"))),
        };

        let file = self.stores.images.get(id)?;
        if file.metadata.is_sealed() {
            return Err(LockError::Storage(format!(
                "file blob of unlocked image {id} is sealed"
            )));
        }

        let mut metadata = plaintext.clone();
        metadata.real_content_type = Some(record.content_type.clone());

        let sealed_meta = crypto::seal(&metadata.to_bytes()?, metadata_passphrase, &self.ctx)?;
        let sealed_file = crypto::seal(&file.bytes, file_passphrase, &self.ctx)?;

        let revision = self.begin_transition(&record)?;
        if let Err(e) = self.stores.thumbnails.delete(id) {
            self.abandon_transition(id, revision);
            return Err(e);
        }

        let update = RecordUpdate::new()
            .expect_lock(Lock::Unlocked)
            .content_type(OPAQUE_CONTENT_TYPE)
            .lock(Lock::current())
            .thumbnail(record.thumbnail.on_lock())
            .metadata(MetadataContainer::Sealed(sealed_meta));

        let locked = self.commit(id, revision, &file, &sealed_file, OPAQUE_CONTENT_TYPE, update)?;

        // A job that finished between the delete and the commit
        if let Err(e) = self.stores.thumbnails.delete(id) {
            tracing::warn!(image = %id, error = %e, "stale thumbnail left after lock");
        }

        tracing::info!(image = %id, version = ?locked.lock.version(), "image locked");
        Ok(locked)
    }

    /// Locked(v) -> Locked(current) under a new passphrase. Both blobs are
    /// opened with the current keys first; a wrong key changes nothing.
    pub fn rekey(
        &self,
        id: &ImageId,
        caller: &Caller,
        current: &KeyPair,
        new_passphrase: &SecretString,
    ) -> LockResult<ImageRecord> {
        let _guard = self.transitions.acquire(id);
        let record = self.transition_record(id, caller)?;

        crypto::validate_passphrase(new_passphrase, self.config.min_passphrase_len)?;

        let (sealed_meta, file, file_container) = self.sealed_parts(&record)?;

        let metadata = crypto::open(sealed_meta, &current.metadata, &self.ctx)?;
        let content = crypto::open(&file_container, &current.file, &self.ctx)?;

        let resealed_meta = crypto::seal(&metadata, new_passphrase, &self.ctx)?;
        let resealed_file = crypto::seal(&content, new_passphrase, &self.ctx)?;

        let revision = self.begin_transition(&record)?;

        let update = RecordUpdate::new()
            .expect_lock(record.lock)
            .lock(Lock::current())
            .metadata(MetadataContainer::Sealed(resealed_meta));

        let content_type = file.metadata.content_type().unwrap_or(OPAQUE_CONTENT_TYPE).to_string();
        let rekeyed = self.commit(id, revision, &file, &resealed_file, &content_type, update)?;

        tracing::info!(
            image = %id,
            from = ?record.lock.version(),
            to = ?rekeyed.lock.version(),
            "image rekeyed"
        );
        Ok(rekeyed)
    }

    /// Locked(v) -> Unlocked. Restores the true content type and makes the
    /// image eligible for a fresh thumbnail.
    pub fn unlock(&self, id: &ImageId, caller: &Caller, keys: &KeyPair) -> LockResult<ImageRecord> {
        let _guard = self.transitions.acquire(id);
        let record = self.transition_record(id, caller)?;

        let (sealed_meta, file, file_container) = self.sealed_parts(&record)?;

        let metadata = crypto::open(sealed_meta, &keys.metadata, &self.ctx)?;
        let content = crypto::open(&file_container, &keys.file, &self.ctx)?;

        let mut metadata = PlaintextMetadata::from_bytes(&metadata)?;
        let content_type = metadata.real_content_type.take().ok_or_else(|| {
            LockError::Serialization(format!("sealed metadata of {id} has no real content type"))
        })?;

        let revision = self.begin_transition(&record)?;

        // Anything still in the thumbnail store predates the lock.
        if let Err(e) = self.stores.thumbnails.delete(id) {
            self.abandon_transition(id, revision);
            return Err(e);
        }

        let update = RecordUpdate::new()
            .expect_lock(record.lock)
            .content_type(content_type.clone())
            .lock(Lock::Unlocked)
            .thumbnail(record.thumbnail.on_unlock())
            .metadata(MetadataContainer::plain(metadata));

        let unlocked = self.commit_plain(id, revision, &file, &content, &content_type, update)?;

        tracing::info!(image = %id, "image unlocked");
        Ok(unlocked)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // EDITS
    // ═══════════════════════════════════════════════════════════════════════

    /// Dispatch a typed edit
    pub fn apply(&self, id: &ImageId, caller: &Caller, op: EditOp) -> LockResult<EditOutcome> {
        let record = match op {
            EditOp::SetPrivacy(is_private) => self.set_privacy(id, caller, is_private)?,
            EditOp::SetDescription {
                description,
                metadata_key,
            } => self.set_description(id, caller, &description, metadata_key.as_ref())?,
            EditOp::SetLock {
                passphrase,
                current,
            } => {
                let state = self.owned_record(id, caller)?.lock;
                match (state, current) {
                    (Lock::Unlocked, _) => self.lock(id, caller, &passphrase, &passphrase)?,
                    (Lock::Locked(_), Some(current)) => {
                        self.rekey(id, caller, &current, &passphrase)?
                    }
                    (Lock::Locked(_), None) => {
                        return Err(LockError::Precondition(
                            "current keys are required to change the lock".into(),
                        ))
                    }
                }
            }
            EditOp::RemoveLock(keys) => self.unlock(id, caller, &keys)?,
        };

        Ok(EditOutcome {
            lock_version: record.lock.version(),
        })
    }

    pub fn set_privacy(
        &self,
        id: &ImageId,
        caller: &Caller,
        is_private: bool,
    ) -> LockResult<ImageRecord> {
        let _guard = self.transitions.acquire(id);
        self.owned_record(id, caller)?;
        self.stores
            .records
            .update(id, &RecordUpdate::new().is_private(is_private))
    }

    /// Replace the description. A locked image is re-sealed under its
    /// existing key and salt with a fresh nonce, so `metadata_key` is
    /// required and the passphrase does not change.
    pub fn set_description(
        &self,
        id: &ImageId,
        caller: &Caller,
        description: &str,
        metadata_key: Option<&UnlockKey>,
    ) -> LockResult<ImageRecord> {
        validate_description(description)?;

        let _guard = self.transitions.acquire(id);
        let record = self.transition_record(id, caller)?;

        let metadata = match &record.metadata {
            MetadataContainer::Plain { data } => {
                let mut data = data.clone();
                data.description = description.to_string();
                MetadataContainer::plain(data)
            }
            MetadataContainer::Sealed(sealed) => {
                let key = metadata_key.ok_or_else(|| {
                    LockError::Precondition("metadata key required for a locked image".into())
                })?;
                let resealed = crypto::reseal(sealed, key, &self.ctx, |bytes| {
                    let mut data = PlaintextMetadata::from_bytes(&bytes)?;
                    data.description = description.to_string();
                    data.to_bytes()
                })?;
                MetadataContainer::Sealed(resealed)
            }
        };

        self.stores.records.update(
            id,
            &RecordUpdate::new()
                .expect_revision(record.revision)
                .metadata(metadata),
        )
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    /// Both sealed halves of a locked image
    fn sealed_parts<'r>(
        &self,
        record: &'r ImageRecord,
    ) -> LockResult<(&'r LockedContainer, Blob, LockedContainer)> {
        let sealed_meta = match (&record.lock, record.metadata.sealed()) {
            (Lock::Locked(_), Some(sealed)) => sealed,
            _ => {
                return Err(LockError::Precondition(format!(
                    "image {} is not locked",
                    record.id
                )))
            }
        };

        let file = self.stores.images.get(&record.id)?;
        let container = file.metadata.container(file.bytes.clone())?.ok_or_else(|| {
            LockError::Storage(format!("file blob of locked image {} is plaintext", record.id))
        })?;

        Ok((sealed_meta, file, container))
    }

    /// Mark the record as owned by a transition, conditional on the
    /// revision it was read at. Returns the marked revision.
    fn begin_transition(&self, record: &ImageRecord) -> LockResult<u64> {
        let marked = self.stores.records.update(
            &record.id,
            &RecordUpdate::new()
                .expect_revision(record.revision)
                .begin_transition(Utc::now()),
        )?;
        Ok(marked.revision)
    }

    fn abandon_transition(&self, id: &ImageId, revision: u64) {
        let clear = RecordUpdate::new().expect_revision(revision).end_transition();
        if let Err(e) = self.stores.records.update(id, &clear) {
            tracing::warn!(image = %id, error = %e, "transition marker left until its lease expires");
        }
    }

    fn commit(
        &self,
        id: &ImageId,
        revision: u64,
        previous: &Blob,
        sealed: &LockedContainer,
        content_type: &str,
        update: RecordUpdate,
    ) -> LockResult<ImageRecord> {
        let metadata = BlobMetadata::for_sealed(content_type, sealed);
        self.write_then_commit(id, revision, previous, &sealed.data, &metadata, update)
    }

    fn commit_plain(
        &self,
        id: &ImageId,
        revision: u64,
        previous: &Blob,
        bytes: &[u8],
        content_type: &str,
        update: RecordUpdate,
    ) -> LockResult<ImageRecord> {
        let metadata = BlobMetadata::for_plain(content_type);
        self.write_then_commit(id, revision, previous, bytes, &metadata, update)
    }

    /// File blob first, record second. The record update only lands on the
    /// marked revision; if it fails the blob is restored.
    fn write_then_commit(
        &self,
        id: &ImageId,
        revision: u64,
        previous: &Blob,
        bytes: &[u8],
        metadata: &BlobMetadata,
        update: RecordUpdate,
    ) -> LockResult<ImageRecord> {
        if let Err(e) = self.stores.images.put(id, bytes, metadata) {
            self.abandon_transition(id, revision);
            return Err(e);
        }

        let update = update.expect_revision(revision).end_transition();
        match self.stores.records.update(id, &update) {
            Ok(record) => Ok(record),
            Err(LockError::Conflict(_)) => {
                // The marker expired and another writer took the blob over.
                tracing::error!(image = %id, "transition lease lost before commit");
                Err(LockError::Conflict(*id))
            }
            Err(e) => {
                tracing::warn!(image = %id, error = %e, "record update failed, restoring file blob");
                if let Err(restore) =
                    self.stores
                        .images
                        .put(id, &previous.bytes, &previous.metadata)
                {
                    tracing::error!(
                        image = %id,
                        error = %restore,
                        "file blob restore failed; record and file disagree"
                    );
                }
                self.abandon_transition(id, revision);
                Err(e)
            }
        }
    }
}

/// Parse a pair of client-derived base64 keys
pub fn derived_key_pair(metadata_key: &str, file_key: &str) -> LockResult<KeyPair> {
    Ok(KeyPair::new(
        UnlockKey::Derived(crypto::DerivedKey::from_base64(metadata_key)?),
        UnlockKey::Derived(crypto::DerivedKey::from_base64(file_key)?),
    ))
}

/// Same passphrase for both halves
pub fn passphrase_pair(passphrase: &str) -> KeyPair {
    KeyPair::from_passphrase(&SecretString::from(passphrase))
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
