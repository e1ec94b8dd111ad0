mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use secrecy::SecretString;
use tokio::sync::mpsc::UnboundedReceiver;

use common::{FixedCodec, Harness, PanickingCodec, PIXELS};
use iamages_lock::lifecycle::passphrase_pair;
use iamages_lock::store::BlobMetadata;
use iamages_lock::thumbnail::{ResizeCodec, ThumbnailQueue};
use iamages_lock::{
    BlobStore, Caller, ImageCodec, ImageId, Lock, LockError, RecordStore, ThumbnailResponse,
    ThumbnailService, ThumbnailState, ThumbnailWorker, Upload,
};

fn secret(s: &str) -> SecretString {
    SecretString::from(s)
}

fn alice() -> Caller {
    Caller::user("alice")
}

fn thumbnails_for(
    h: &Harness,
    codec: Arc<dyn ImageCodec>,
) -> (ThumbnailService, UnboundedReceiver<ImageId>) {
    let (queue, jobs) = ThumbnailQueue::channel();
    (ThumbnailService::new(h.stores(), 600, queue).with_codec(codec), jobs)
}

#[test]
fn test_lock_discards_ready_thumbnail_and_unlock_resets() {
    let h = Harness::new();
    let id = h.upload(&alice());
    let (thumbs, mut jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));

    assert_eq!(
        thumbs.get_thumbnail(&id, &alice()).unwrap(),
        ThumbnailResponse::Original
    );
    assert_eq!(jobs.try_recv().unwrap(), id);
    assert_eq!(thumbs.generate(&id).unwrap(), ThumbnailState::Ready);
    assert!(h.thumbnails.contains(&id));

    h.service
        .lock(&id, &alice(), &secret("hunter2"), &secret("hunter2"))
        .unwrap();
    assert_eq!(
        h.records.get(&id).unwrap().thumbnail,
        ThumbnailState::PermanentlyUnavailable
    );
    assert!(!h.thumbnails.contains(&id));
    assert_eq!(
        thumbs.get_thumbnail(&id, &alice()).unwrap(),
        ThumbnailResponse::Unavailable
    );

    h.service
        .unlock(&id, &alice(), &passphrase_pair("hunter2"))
        .unwrap();
    assert_eq!(
        h.records.get(&id).unwrap().thumbnail,
        ThumbnailState::NoThumbnail
    );

    // Eligible again: next read claims a fresh job
    thumbs.get_thumbnail(&id, &alice()).unwrap();
    assert_eq!(jobs.try_recv().unwrap(), id);
}

#[test]
fn test_lock_fails_when_thumbnail_cannot_be_deleted() {
    let h = Harness::new();
    let id = h.upload(&alice());
    h.thumbnails
        .put(&id, b"thumb", &BlobMetadata::for_plain("image/png"))
        .unwrap();

    h.thumbnails.fail_deletes(true);
    assert!(matches!(
        h.service
            .lock(&id, &alice(), &secret("hunter2"), &secret("hunter2")),
        Err(LockError::Storage(_))
    ));
    h.thumbnails.fail_deletes(false);

    // Nothing sealed, marker released
    assert_eq!(h.records.get(&id).unwrap().lock, Lock::Unlocked);
    h.assert_consistent(&id);

    h.service
        .lock(&id, &alice(), &secret("hunter2"), &secret("hunter2"))
        .unwrap();
    assert!(!h.thumbnails.contains(&id));
}

#[test]
fn test_unlock_deletes_surviving_thumbnail_bytes() {
    let h = Harness::new();
    let id = h.upload(&alice());
    h.service
        .lock(&id, &alice(), &secret("hunter2"), &secret("hunter2"))
        .unwrap();

    // Left behind by some earlier crash
    h.thumbnails
        .put(&id, b"stale", &BlobMetadata::for_plain("image/png"))
        .unwrap();

    h.service
        .unlock(&id, &alice(), &passphrase_pair("hunter2"))
        .unwrap();
    assert!(!h.thumbnails.contains(&id));
}

#[test]
fn test_size_guard() {
    for output_len in [PIXELS.len(), PIXELS.len() + 100] {
        let h = Harness::new();
        let id = h.upload(&alice());
        let (thumbs, _jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len }));

        thumbs.get_thumbnail(&id, &alice()).unwrap();
        assert_eq!(
            thumbs.generate(&id).unwrap(),
            ThumbnailState::PermanentlyUnavailable
        );
        assert!(!h.thumbnails.contains(&id));
        assert_eq!(
            thumbs.get_thumbnail(&id, &alice()).unwrap(),
            ThumbnailResponse::Original
        );
    }
}

#[test]
fn test_failed_ready_write_still_settles() {
    let h = Harness::new();
    let id = h.upload(&alice());
    let (thumbs, mut jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));

    thumbs.get_thumbnail(&id, &alice()).unwrap();
    assert_eq!(jobs.try_recv().unwrap(), id);

    // Ready write fails once; the settle after it goes through
    h.records.fail_next_updates(1);
    assert_eq!(
        thumbs.generate(&id).unwrap(),
        ThumbnailState::PermanentlyUnavailable
    );
    assert!(!h.thumbnails.contains(&id));
}

#[test]
fn test_job_stranded_by_store_outage_is_reclaimed() {
    let h = Harness::new();
    let id = h.upload(&alice());
    let (thumbs, mut jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));

    thumbs.get_thumbnail(&id, &alice()).unwrap();
    assert_eq!(jobs.try_recv().unwrap(), id);

    h.records.fail_updates(true);
    assert!(thumbs.generate(&id).is_err());
    h.records.fail_updates(false);
    assert_eq!(
        h.records.get(&id).unwrap().thumbnail,
        ThumbnailState::Computing
    );
    assert!(!h.thumbnails.contains(&id));

    // Store is back: the next read claims a fresh job, and only one
    for _ in 0..3 {
        assert_eq!(
            thumbs.get_thumbnail(&id, &alice()).unwrap(),
            ThumbnailResponse::Original
        );
    }
    assert_eq!(jobs.try_recv().unwrap(), id);
    assert!(jobs.try_recv().is_err());

    assert_eq!(thumbs.generate(&id).unwrap(), ThumbnailState::Ready);
    assert!(h.thumbnails.contains(&id));
}

#[test]
fn test_jobs_lost_with_process_are_reclaimed() {
    let h = Harness::new();
    let id = h.upload(&alice());

    let (thumbs, jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));
    thumbs.get_thumbnail(&id, &alice()).unwrap();
    drop((thumbs, jobs));

    let (thumbs, mut jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));
    thumbs.get_thumbnail(&id, &alice()).unwrap();
    assert_eq!(jobs.try_recv().unwrap(), id);
    assert_eq!(thumbs.generate(&id).unwrap(), ThumbnailState::Ready);
}

#[test]
fn test_codec_panic_is_fail_safe() {
    let h = Harness::new();
    let id = h.upload(&alice());
    let (thumbs, _jobs) = thumbnails_for(&h, Arc::new(PanickingCodec));

    thumbs.get_thumbnail(&id, &alice()).unwrap();
    assert_eq!(
        thumbs.generate(&id).unwrap(),
        ThumbnailState::PermanentlyUnavailable
    );
    assert!(!h.thumbnails.contains(&id));
}

#[test]
fn test_undecodable_image_is_fail_safe() {
    let h = Harness::new();
    let id = h.upload(&alice());
    let (thumbs, _jobs) = thumbnails_for(&h, Arc::new(ResizeCodec));

    thumbs.get_thumbnail(&id, &alice()).unwrap();
    assert_eq!(
        thumbs.generate(&id).unwrap(),
        ThumbnailState::PermanentlyUnavailable
    );
}

#[test]
fn test_job_for_locked_image_does_nothing() {
    let h = Harness::new();
    let id = h.upload(&alice());
    let (thumbs, _jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));

    thumbs.get_thumbnail(&id, &alice()).unwrap();
    h.service
        .lock(&id, &alice(), &secret("hunter2"), &secret("hunter2"))
        .unwrap();

    assert_eq!(
        thumbs.generate(&id).unwrap(),
        ThumbnailState::PermanentlyUnavailable
    );
    assert!(!h.thumbnails.contains(&id));
}

#[test]
fn test_private_thumbnail_hidden_from_others() {
    let h = Harness::new();
    let id = h
        .service
        .upload(
            &alice(),
            Upload {
                bytes: PIXELS.to_vec(),
                content_type: "image/png".into(),
                description: "private".into(),
                is_private: true,
                lock: None,
            },
        )
        .unwrap()
        .image
        .id;
    let (thumbs, _jobs) = thumbnails_for(&h, Arc::new(FixedCodec { output_len: 4 }));

    assert!(thumbs.get_thumbnail(&id, &Caller::user("bob")).is_err());
    assert!(thumbs.get_thumbnail(&id, &alice()).is_ok());
}

fn noise_png(width: u32, height: u32) -> Vec<u8> {
    let mut seed = 0x9e37_79b9_u32;
    let img = RgbImage::from_fn(width, height, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let [r, g, b, _] = seed.to_le_bytes();
        Rgb([r, g, b])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

#[tokio::test]
async fn test_background_worker_produces_thumbnail() {
    let h = Harness::with_codec(Arc::new(ResizeCodec));
    let id = h
        .service
        .upload(
            &alice(),
            Upload {
                bytes: noise_png(1200, 900),
                content_type: "image/png".into(),
                description: "noise".into(),
                is_private: false,
                lock: None,
            },
        )
        .unwrap()
        .image
        .id;

    let (thumbs, jobs) = thumbnails_for(&h, Arc::new(ResizeCodec));
    let thumbs = Arc::new(thumbs);
    let worker = ThumbnailWorker::new(Arc::clone(&thumbs), jobs).spawn();

    assert_eq!(
        thumbs.get_thumbnail(&id, &alice()).unwrap(),
        ThumbnailResponse::Original
    );

    let mut state = ThumbnailState::Computing;
    for _ in 0..600 {
        state = h.records.get(&id).unwrap().thumbnail;
        if state != ThumbnailState::Computing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state, ThumbnailState::Ready);

    match thumbs.get_thumbnail(&id, &alice()).unwrap() {
        ThumbnailResponse::Thumbnail(blob) => {
            let decoded = image::load_from_memory(&blob.bytes).unwrap();
            assert_eq!(decoded.dimensions(), (600, 450));
        }
        other => panic!("expected a thumbnail, got {other:?}"),
    }

    worker.abort();
}
