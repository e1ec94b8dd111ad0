#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use iamages_lock::error::{LockError, LockResult};
use iamages_lock::model::ImageRecord;
use iamages_lock::store::{
    Blob, BlobMetadata, BlobStore, MemoryBlobStore, MemoryRecordStore, RecordStore, RecordUpdate,
    Stores,
};
use iamages_lock::thumbnail::{ImageCodec, Probe};
use iamages_lock::{Caller, CoreConfig, CryptoContext, ImageId, LockService, Upload};

pub const PIXELS: &[u8] = b"\x89PNG pretend pixels for a tiny image";

/// Blob store whose puts and deletes can be made to fail
#[derive(Default)]
pub struct FlakyBlobStore {
    inner: MemoryBlobStore,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FlakyBlobStore {
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.inner.contains(id)
    }
}

impl BlobStore for FlakyBlobStore {
    fn get(&self, id: &ImageId) -> LockResult<Blob> {
        self.inner.get(id)
    }

    fn put(&self, id: &ImageId, bytes: &[u8], metadata: &BlobMetadata) -> LockResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(LockError::Storage("injected blob failure".into()));
        }
        self.inner.put(id, bytes, metadata)
    }

    fn delete(&self, id: &ImageId) -> LockResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(LockError::Storage("injected delete failure".into()));
        }
        self.inner.delete(id)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Record store whose updates can be made to fail, or interleaved with
/// another writer
#[derive(Default)]
pub struct FlakyRecordStore {
    inner: MemoryRecordStore,
    failing_updates: AtomicUsize,
    fail_commits: AtomicBool,
    before_update: Mutex<Option<(usize, Hook)>>,
}

impl FlakyRecordStore {
    /// Fail every update until switched off
    pub fn fail_updates(&self, fail: bool) {
        let count = if fail { usize::MAX } else { 0 };
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Fail only the next `count` updates
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Fail updates that write metadata, letting transition markers through
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` just before the update after the next `skip` ones
    pub fn before_update(&self, skip: usize, hook: impl FnOnce() + Send + 'static) {
        *self.before_update.lock() = Some((skip, Box::new(hook)));
    }

    fn take_hook(&self) -> Option<Hook> {
        let mut slot = self.before_update.lock();
        match slot.take() {
            Some((0, hook)) => Some(hook),
            Some((skip, hook)) => {
                *slot = Some((skip - 1, hook));
                None
            }
            None => None,
        }
    }

    fn should_fail(&self, update: &RecordUpdate) -> bool {
        if self.fail_commits.load(Ordering::SeqCst) && update.metadata.is_some() {
            return true;
        }
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl RecordStore for FlakyRecordStore {
    fn get(&self, id: &ImageId) -> LockResult<ImageRecord> {
        self.inner.get(id)
    }

    fn insert(&self, record: &ImageRecord) -> LockResult<()> {
        self.inner.insert(record)
    }

    fn update(&self, id: &ImageId, update: &RecordUpdate) -> LockResult<ImageRecord> {
        if let Some(hook) = self.take_hook() {
            hook();
        }
        if self.should_fail(update) {
            return Err(LockError::Storage("injected record failure".into()));
        }
        self.inner.update(id, update)
    }

    fn delete(&self, id: &ImageId) -> LockResult<()> {
        self.inner.delete(id)
    }
}

/// Codec that accepts anything as PNG and returns a thumbnail of fixed size
pub struct FixedCodec {
    pub output_len: usize,
}

impl ImageCodec for FixedCodec {
    fn probe(&self, bytes: &[u8]) -> LockResult<Probe> {
        Ok(Probe {
            content_type: "image/png".into(),
            width: bytes.len() as u32,
            height: 1,
        })
    }

    fn thumbnail(&self, _bytes: &[u8], _bound: u32) -> LockResult<Vec<u8>> {
        Ok(vec![7u8; self.output_len])
    }
}

pub struct PanickingCodec;

impl ImageCodec for PanickingCodec {
    fn probe(&self, _bytes: &[u8]) -> LockResult<Probe> {
        Ok(Probe {
            content_type: "image/png".into(),
            width: 1,
            height: 1,
        })
    }

    fn thumbnail(&self, _bytes: &[u8], _bound: u32) -> LockResult<Vec<u8>> {
        panic!("decoder blew up");
    }
}

pub struct Harness {
    pub service: Arc<LockService>,
    pub images: Arc<FlakyBlobStore>,
    pub thumbnails: Arc<FlakyBlobStore>,
    pub records: Arc<FlakyRecordStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(FixedCodec { output_len: 4 }))
    }

    pub fn with_codec(codec: Arc<dyn ImageCodec>) -> Self {
        let images = Arc::new(FlakyBlobStore::default());
        let thumbnails = Arc::new(FlakyBlobStore::default());
        let records = Arc::new(FlakyRecordStore::default());

        let service = LockService::new(
            CryptoContext::insecure_fast(),
            CoreConfig::default(),
            Harness::stores_of(&images, &thumbnails, &records),
        )
        .with_codec(codec);

        Self {
            service: Arc::new(service),
            images,
            thumbnails,
            records,
        }
    }

    fn stores_of(
        images: &Arc<FlakyBlobStore>,
        thumbnails: &Arc<FlakyBlobStore>,
        records: &Arc<FlakyRecordStore>,
    ) -> Stores {
        Stores {
            images: images.clone(),
            thumbnails: thumbnails.clone(),
            records: records.clone(),
        }
    }

    pub fn stores(&self) -> Stores {
        Harness::stores_of(&self.images, &self.thumbnails, &self.records)
    }

    /// Another service over the same stores, as a second process would be
    pub fn second_service(&self) -> Arc<LockService> {
        let service = LockService::new(
            CryptoContext::insecure_fast(),
            CoreConfig::default(),
            self.stores(),
        )
        .with_codec(Arc::new(FixedCodec { output_len: 4 }));
        Arc::new(service)
    }

    pub fn upload(&self, caller: &Caller) -> ImageId {
        self.service
            .upload(
                caller,
                Upload {
                    bytes: PIXELS.to_vec(),
                    content_type: "image/png".into(),
                    description: "a tiny image".into(),
                    is_private: false,
                    lock: None,
                },
            )
            .unwrap()
            .image
            .id
    }

    /// Record lock flag and file blob sealing agree
    pub fn assert_consistent(&self, id: &ImageId) {
        let record = self.records.get(id).unwrap();
        let file = self.images.get(id).unwrap();
        assert_eq!(
            record.lock.is_locked(),
            file.metadata.is_sealed(),
            "record and file blob disagree on lock state"
        );
        record.check_consistency().unwrap();
        assert_eq!(record.transition_since, None, "transition marker left behind");
    }
}
