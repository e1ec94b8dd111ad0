//! Iamages Lock - Thumbnail availability
//!
//! ```text
//!               read                 job: smaller
//!  NoThumbnail ──────▶ Computing ─────────────────▶ Ready
//!       ▲                  │ job: not smaller / error / panic
//!       │                  ▼
//!       │ unlock   PermanentlyUnavailable ◀── lock (from any state)
//!       └──────────────────┘
//! ```
//!
//! The `NoThumbnail -> Computing` claim is a conditional record update, so
//! only one reader enqueues a job. Jobs re-read the record and do nothing
//! unless it is still `Computing` and unlocked. A job that fails ends in
//! `PermanentlyUnavailable`; if even that write fails, the next read finds
//! `Computing` with no job in flight here and claims it again.

use std::collections::HashSet;
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use image::{imageops::FilterType, DynamicImage, ImageFormat, ImageReader};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{LockError, LockResult};
use crate::model::{ImageId, Lock, ThumbnailState};
use crate::store::{Blob, BlobMetadata, Caller, Identity, OwnerMatch, RecordUpdate, Stores};

/// Accepted upload types
pub const SUPPORTED_CONTENT_TYPES: [&str; 4] =
    ["image/jpeg", "image/png", "image/gif", "image/webp"];

// ═══════════════════════════════════════════════════════════════════════════
// CODEC
// ═══════════════════════════════════════════════════════════════════════════

/// What an upload decodes as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

/// Image decoding and downscaling, supplied by the host
pub trait ImageCodec: Send + Sync {
    fn probe(&self, bytes: &[u8]) -> LockResult<Probe>;

    /// Encode a version of `bytes` that fits inside `bound`×`bound`
    fn thumbnail(&self, bytes: &[u8], bound: u32) -> LockResult<Vec<u8>>;
}

/// `image`-crate codec: Lanczos3 downscale, aspect ratio and source format kept
#[derive(Debug, Clone, Copy, Default)]
pub struct ResizeCodec;

impl ResizeCodec {
    fn format_of(bytes: &[u8]) -> LockResult<ImageFormat> {
        match image::guess_format(bytes)? {
            f @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif | ImageFormat::WebP) => {
                Ok(f)
            }
            other => Err(LockError::Codec(format!("unsupported format {other:?}"))),
        }
    }
}

impl ImageCodec for ResizeCodec {
    fn probe(&self, bytes: &[u8]) -> LockResult<Probe> {
        let format = Self::format_of(bytes)?;
        let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()?;

        Ok(Probe {
            content_type: format.to_mime_type().to_string(),
            width,
            height,
        })
    }

    fn thumbnail(&self, bytes: &[u8], bound: u32) -> LockResult<Vec<u8>> {
        let format = Self::format_of(bytes)?;
        let img = image::load_from_memory_with_format(bytes, format)?;

        let img = if img.width() > bound || img.height() > bound {
            img.resize(bound, bound, FilterType::Lanczos3)
        } else {
            img
        };

        // JPEG has no alpha channel
        let img = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => DynamicImage::ImageRgba8(img.to_rgba8()),
        };

        let mut output = Vec::new();
        img.write_to(&mut Cursor::new(&mut output), format)?;
        Ok(output)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════

/// Answer to a thumbnail read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailResponse {
    Thumbnail(Blob),
    /// Serve (or redirect to) the full-resolution image instead
    Original,
    /// Locked: neither thumbnail nor original may be shown
    Unavailable,
}

/// Sender half of the background job queue
#[derive(Debug, Clone)]
pub struct ThumbnailQueue {
    tx: mpsc::UnboundedSender<ImageId>,
}

impl ThumbnailQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ImageId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn enqueue(&self, id: ImageId) -> LockResult<()> {
        self.tx
            .send(id)
            .map_err(|_| LockError::Storage("thumbnail queue is closed".into()))
    }
}

pub struct ThumbnailService {
    stores: Stores,
    identity: Arc<dyn Identity>,
    codec: Arc<dyn ImageCodec>,
    bound: u32,
    queue: ThumbnailQueue,
    /// Claimed by this service and not yet finished
    in_flight: Mutex<HashSet<ImageId>>,
}

impl ThumbnailService {
    pub fn new(stores: Stores, bound: u32, queue: ThumbnailQueue) -> Self {
        Self {
            stores,
            identity: Arc::new(OwnerMatch),
            codec: Arc::new(ResizeCodec),
            bound,
            queue,
            in_flight: Mutex::new(HashSet::new()),
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

    /// Serve a thumbnail, or claim its generation and fall back to the
    /// original.
    pub fn get_thumbnail(&self, id: &ImageId, caller: &Caller) -> LockResult<ThumbnailResponse> {
        let record = self.stores.records.get(id)?;
        if record.is_private && !self.identity.is_owner(&record, caller) {
            return Err(LockError::NotFound(format!("image {id}")));
        }
        if record.lock.is_locked() {
            return Ok(ThumbnailResponse::Unavailable);
        }

        match record.thumbnail {
            ThumbnailState::Ready => match self.stores.thumbnails.get(id) {
                Ok(blob) => Ok(ThumbnailResponse::Thumbnail(blob)),
                Err(LockError::NotFound(_)) => {
                    tracing::warn!(image = %id, "thumbnail marked ready but missing, regenerating");
                    self.claim(id, ThumbnailState::Ready)?;
                    Ok(ThumbnailResponse::Original)
                }
                Err(e) => Err(e),
            },
            ThumbnailState::NoThumbnail => {
                self.claim(id, ThumbnailState::NoThumbnail)?;
                Ok(ThumbnailResponse::Original)
            }
            ThumbnailState::Computing => {
                // A job that failed to settle, or one lost with its process
                self.claim(id, ThumbnailState::Computing)?;
                Ok(ThumbnailResponse::Original)
            }
            ThumbnailState::PermanentlyUnavailable => Ok(ThumbnailResponse::Original),
        }
    }

    /// Move `from -> Computing` and enqueue; losing the race is not an error.
    fn claim(&self, id: &ImageId, from: ThumbnailState) -> LockResult<()> {
        if !self.in_flight.lock().insert(*id) {
            tracing::debug!(image = %id, "thumbnail job already queued");
            return Ok(());
        }

        let claim = RecordUpdate::new()
            .expect_lock(Lock::Unlocked)
            .expect_thumbnail(from)
            .thumbnail(ThumbnailState::Computing);

        match self.stores.records.update(id, &claim) {
            Ok(_) => {}
            Err(LockError::Conflict(_)) => {
                self.in_flight.lock().remove(id);
                tracing::debug!(image = %id, "thumbnail already claimed");
                return Ok(());
            }
            Err(e) => {
                self.in_flight.lock().remove(id);
                return Err(e);
            }
        }

        if let Err(e) = self.queue.enqueue(*id) {
            self.in_flight.lock().remove(id);
            tracing::warn!(image = %id, error = %e, "could not enqueue thumbnail job");
            let revert = RecordUpdate::new()
                .expect_thumbnail(ThumbnailState::Computing)
                .thumbnail(ThumbnailState::NoThumbnail);
            self.stores.records.update(id, &revert)?;
            return Err(e);
        }

        tracing::debug!(image = %id, "thumbnail job enqueued");
        Ok(())
    }

    /// The background job. Safe to run more than once for the same image;
    /// returns the state the record ends in. Any failure settles the record
    /// as `PermanentlyUnavailable`; the error is returned only when that
    /// write fails too.
    pub fn generate(&self, id: &ImageId) -> LockResult<ThumbnailState> {
        let outcome = match self.run_job(id) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(image = %id, error = %e, "thumbnail job failed");
                self.settle(id, ThumbnailState::PermanentlyUnavailable)
                    .map_err(|settle| {
                        tracing::error!(
                            image = %id,
                            error = %settle,
                            "thumbnail left computing until the next read reclaims it"
                        );
                        e
                    })
            }
        };
        self.in_flight.lock().remove(id);
        outcome
    }

    fn run_job(&self, id: &ImageId) -> LockResult<ThumbnailState> {
        let record = self.stores.records.get(id)?;
        if record.thumbnail != ThumbnailState::Computing || record.lock.is_locked() {
            tracing::debug!(image = %id, state = ?record.thumbnail, "thumbnail job skipped");
            return Ok(record.thumbnail);
        }

        let rendered = panic::catch_unwind(AssertUnwindSafe(|| self.render(id)));
        let thumbnail = match rendered {
            Ok(Ok(Some(thumbnail))) => thumbnail,
            Ok(Ok(None)) => {
                tracing::info!(image = %id, "thumbnail not smaller than original");
                return self.settle(id, ThumbnailState::PermanentlyUnavailable);
            }
            Ok(Err(e)) => {
                tracing::warn!(image = %id, error = %e, "thumbnail generation failed");
                return self.settle(id, ThumbnailState::PermanentlyUnavailable);
            }
            Err(_) => {
                tracing::warn!(image = %id, "thumbnail codec panicked");
                return self.settle(id, ThumbnailState::PermanentlyUnavailable);
            }
        };

        if let Err(e) = self
            .stores
            .thumbnails
            .put(id, &thumbnail.bytes, &thumbnail.metadata)
        {
            tracing::warn!(image = %id, error = %e, "thumbnail could not be stored");
            return self.settle(id, ThumbnailState::PermanentlyUnavailable);
        }

        let ready = RecordUpdate::new()
            .expect_lock(Lock::Unlocked)
            .expect_thumbnail(ThumbnailState::Computing)
            .thumbnail(ThumbnailState::Ready);

        match self.stores.records.update(id, &ready) {
            Ok(record) => {
                tracing::info!(image = %id, size = thumbnail.bytes.len(), "thumbnail ready");
                Ok(record.thumbnail)
            }
            Err(LockError::Conflict(_)) => {
                let current = self.stores.records.get(id)?;
                // Another job got there first with the same bytes
                if current.thumbnail == ThumbnailState::Ready && !current.lock.is_locked() {
                    return Ok(current.thumbnail);
                }
                // Locked (or otherwise moved on) while rendering
                self.stores.thumbnails.delete(id)?;
                Ok(current.thumbnail)
            }
            Err(e) => {
                self.stores.thumbnails.delete(id)?;
                Err(e)
            }
        }
    }

    /// `Ok(None)` when the result would not be smaller than the source
    fn render(&self, id: &ImageId) -> LockResult<Option<Blob>> {
        let original = self.stores.images.get(id)?;
        if original.metadata.is_sealed() {
            return Err(LockError::Precondition(format!("image {id} was sealed")));
        }

        let bytes = self.codec.thumbnail(&original.bytes, self.bound)?;
        if bytes.len() >= original.bytes.len() {
            return Ok(None);
        }

        let content_type = original.metadata.content_type().unwrap_or("image/jpeg");
        Ok(Some(Blob {
            bytes,
            metadata: BlobMetadata::for_plain(content_type),
        }))
    }

    /// Leave `Computing` for a terminal state, unless something else already did
    pub fn settle(&self, id: &ImageId, state: ThumbnailState) -> LockResult<ThumbnailState> {
        let update = RecordUpdate::new()
            .expect_thumbnail(ThumbnailState::Computing)
            .thumbnail(state);

        match self.stores.records.update(id, &update) {
            Ok(record) => Ok(record.thumbnail),
            Err(LockError::Conflict(_)) => Ok(self.stores.records.get(id)?.thumbnail),
            Err(e) => Err(e),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKER
// ═══════════════════════════════════════════════════════════════════════════

/// Drains the job queue, one blocking job at a time
pub struct ThumbnailWorker {
    service: Arc<ThumbnailService>,
    jobs: mpsc::UnboundedReceiver<ImageId>,
}

impl ThumbnailWorker {
    pub fn new(service: Arc<ThumbnailService>, jobs: mpsc::UnboundedReceiver<ImageId>) -> Self {
        Self { service, jobs }
    }

    /// Run until every queue sender is dropped
    pub async fn run(mut self) {
        while let Some(id) = self.jobs.recv().await {
            let service = Arc::clone(&self.service);
            let job = tokio::task::spawn_blocking(move || service.generate(&id)).await;

            match job {
                Ok(Ok(state)) => tracing::debug!(image = %id, ?state, "thumbnail job done"),
                Ok(Err(e)) => tracing::warn!(image = %id, error = %e, "thumbnail job failed"),
                Err(e) => {
                    tracing::warn!(image = %id, error = %e, "thumbnail job aborted");
                    if let Err(e) = self
                        .service
                        .settle(&id, ThumbnailState::PermanentlyUnavailable)
                    {
                        tracing::warn!(image = %id, error = %e, "thumbnail left computing");
                    }
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run queued jobs on the current thread without waiting for new ones.
    /// Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(id) = self.jobs.try_recv() {
            if let Err(e) = self.service.generate(&id) {
                tracing::warn!(image = %id, error = %e, "thumbnail job failed");
            }
            ran += 1;
        }
        ran
    }
}
