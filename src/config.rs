//! Iamages Lock - Configuration
//!
//! `CoreConfig` is loaded once at process start (JSON file, then `IAMAGES_*`
//! environment overrides). `CryptoContext` is built from it and passed by
//! reference into every transition.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::kdf::{KdfParams, MIN_PASSPHRASE_LEN};
use crate::error::{LockError, LockResult};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "IAMAGES_";

/// Host-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root for blobs and the record database
    pub storage_dir: PathBuf,
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// Thumbnails fit inside a square of this many pixels
    pub thumbnail_bound: u32,
    /// Shortest passphrase the lock API accepts
    pub min_passphrase_len: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data"),
            max_upload_bytes: 10 * 1024 * 1024,
            thumbnail_bound: 600,
            min_passphrase_len: MIN_PASSPHRASE_LEN,
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn load(path: &Path) -> LockResult<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Defaults (or `path` when given) with environment overrides applied.
    pub fn from_env(path: Option<&Path>) -> LockResult<Self> {
        let base = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> LockResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(dir) = var("STORAGE_DIR") {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(size) = var("MAX_SIZE") {
            self.max_upload_bytes = parse_var("MAX_SIZE", &size)?;
        }
        if let Some(bound) = var("THUMBNAIL_BOUND") {
            self.thumbnail_bound = parse_var("THUMBNAIL_BOUND", &bound)?;
        }
        Ok(self)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.storage_dir.join("files")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.storage_dir.join("thumbnails")
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("records.db")
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> LockResult<T> {
    value.trim().parse().map_err(|_| {
        LockError::Precondition(format!("{ENV_PREFIX}{name} is not a valid number: {value:?}"))
    })
}

/// Cryptographic cost parameters, constructed once and shared by reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CryptoContext {
    pub kdf: KdfParams,
}

impl CryptoContext {
    pub fn new(kdf: KdfParams) -> Self {
        Self { kdf }
    }

    /// Minimal Argon2id cost. Never use outside tests and local tooling.
    pub fn insecure_fast() -> Self {
        Self {
            kdf: KdfParams {
                time_cost: 1,
                memory_cost_kib: 64,
                parallelism: 1,
            },
        }
    }
}
