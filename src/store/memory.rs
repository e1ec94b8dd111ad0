//! In-memory stores, for tests and embedding.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Blob, BlobMetadata, BlobStore, RecordStore, RecordUpdate};
use crate::error::{LockError, LockResult};
use crate::model::{ImageId, ImageRecord};

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<ImageId, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.blobs.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, id: &ImageId) -> LockResult<Blob> {
        self.blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LockError::NotFound(format!("blob {id}")))
    }

    fn put(&self, id: &ImageId, bytes: &[u8], metadata: &BlobMetadata) -> LockResult<()> {
        self.blobs.write().insert(
            *id,
            Blob {
                bytes: bytes.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    fn delete(&self, id: &ImageId) -> LockResult<()> {
        self.blobs.write().remove(id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<ImageId, ImageRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, id: &ImageId) -> LockResult<ImageRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LockError::NotFound(format!("image {id}")))
    }

    fn insert(&self, record: &ImageRecord) -> LockResult<()> {
        record.check_consistency()?;
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(LockError::Storage(format!("image {} already exists", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, id: &ImageId, update: &RecordUpdate) -> LockResult<ImageRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(id)
            .ok_or_else(|| LockError::NotFound(format!("image {id}")))?;
        update.apply(record)?;
        Ok(record.clone())
    }

    fn delete(&self, id: &ImageId) -> LockResult<()> {
        self.records.write().remove(id);
        Ok(())
    }
}
