//! # Iamages Lock
//!
//! At-rest protection for an image host: passphrase locks over image
//! metadata and file content, and the thumbnail availability that follows
//! from them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      IAMAGES LOCK                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │ LockService  │  │  Thumbnail   │  │   Ownerless    │  │
//! │  │ lock/rekey/  │  │  Service +   │  │   capability   │  │
//! │  │ unlock/edit  │  │  Worker      │  │   (128-bit)    │  │
//! │  └──────┬───────┘  └──────┬───────┘  └────────────────┘  │
//! │         │                 │                              │
//! │  ┌──────┴─────────────────┴───────────────────────────┐  │
//! │  │   LockedContainer: Argon2id -> AES-128-GCM          │  │
//! │  │   per-blob salt + nonce, detached tag              │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │                                                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  BlobStore   │  │ RecordStore  │  │   Identity     │  │
//! │  │  (fs / mem)  │  │ (sqlite/mem) │  │  (owner match) │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Metadata and file content sealed separately, each under its own salt
//! - Wrong key and tampered data fail identically (`Not authorized`)
//! - Derived keys zeroized on drop; passphrases never persisted
//! - Owner checked before any key derivation runs
//! - No thumbnail exists for a locked image

pub mod capability;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod store;
pub mod thumbnail;
pub mod wire;

pub use capability::OwnerlessKey;
pub use config::{CoreConfig, CryptoContext};
pub use crypto::{KeyPair, LockedContainer, UnlockKey};
pub use error::{LockError, LockResult};
pub use lifecycle::{LockService, Upload, Uploaded};
pub use model::{
    EditOp, EditOutcome, ImageId, ImageRecord, ImageView, Lock, LockVersion, MetadataContainer,
    PlaintextMetadata, ThumbnailState,
};
pub use store::{BlobStore, Caller, Identity, RecordStore, Stores};
pub use thumbnail::{ImageCodec, ThumbnailResponse, ThumbnailService, ThumbnailWorker};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
