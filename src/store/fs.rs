//! Iamages Lock - Filesystem blob store
//!
//! One file per blob: `<root>/<id>.blob`, laid out as
//! ```text
//! [meta_len: u32 BE][metadata JSON][bytes]
//! ```
//! Bytes and metadata live in the same file so a single rename replaces
//! both.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use rand::Rng;

use super::{Blob, BlobMetadata, BlobStore};
use crate::error::{LockError, LockResult};
use crate::model::ImageId;

const HEADER_LEN: usize = 4;

/// Blob store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create the root directory if needed
    pub fn open(root: &Path) -> LockResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, id: &ImageId) -> PathBuf {
        self.root.join(format!("{id}.blob"))
    }

    fn encode(bytes: &[u8], metadata: &BlobMetadata) -> LockResult<Vec<u8>> {
        let meta = serde_json::to_vec(metadata)?;
        let meta_len = u32::try_from(meta.len())
            .map_err(|_| LockError::Storage("blob metadata too large".into()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + meta.len() + bytes.len());
        out.extend_from_slice(&meta_len.to_be_bytes());
        out.extend_from_slice(&meta);
        out.extend_from_slice(bytes);
        Ok(out)
    }

    fn decode(raw: Vec<u8>) -> LockResult<Blob> {
        let truncated = || LockError::Storage("blob file truncated".into());

        let header: [u8; HEADER_LEN] = raw
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(truncated)?;
        let meta_end = HEADER_LEN + u32::from_be_bytes(header) as usize;
        let meta = raw.get(HEADER_LEN..meta_end).ok_or_else(truncated)?;
        let metadata: BlobMetadata = serde_json::from_slice(meta)
            .map_err(|e| LockError::Storage(format!("blob metadata unreadable: {e}")))?;

        Ok(Blob {
            bytes: raw[meta_end..].to_vec(),
            metadata,
        })
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, id: &ImageId) -> LockResult<Blob> {
        let mut file = match File::open(self.path(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LockError::NotFound(format!("blob {id}")))
            }
            Err(e) => return Err(e.into()),
        };
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        Self::decode(raw)
    }

    /// Write to a temp file, fsync, then rename over the target
    fn put(&self, id: &ImageId, bytes: &[u8], metadata: &BlobMetadata) -> LockResult<()> {
        let path = self.path(id);
        let temp_path = self
            .root
            .join(format!("{id}.{:016x}.tmp", rand::thread_rng().gen::<u64>()));

        let encoded = Self::encode(bytes, metadata)?;
        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Overwrite with zeros before unlinking
    fn delete(&self, id: &ImageId) -> LockResult<()> {
        let path = self.path(id);

        let size = match fs::metadata(&path) {
            Ok(m) => m.len() as usize,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if size > 0 {
            if let Ok(mut file) = OpenOptions::new().write(true).open(&path) {
                let zeros = vec![0u8; size.min(1024 * 1024)];
                let mut remaining = size;
                while remaining > 0 {
                    let chunk = remaining.min(zeros.len());
                    if file.write_all(&zeros[..chunk]).is_err() {
                        break;
                    }
                    remaining -= chunk;
                }
                let _ = file.sync_all();
            }
        }

        match fs::remove_file(&path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
