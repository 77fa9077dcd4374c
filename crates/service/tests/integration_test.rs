//! End-to-end orchestrator behavior over synthetic sources: caching,
//! request coalescing, failure propagation, and cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use video_thumb_common::{
    Position, RawFrame, Result, SourceDescriptor, SyntheticSpec, ThumbError, ThumbFormat,
    ThumbnailRequest,
};
use video_thumb_decoder::{FrameDecoder, SyntheticDecoder};
use video_thumb_service::{ServiceConfig, ThumbnailService};
use video_thumb_source::VideoSource;

/// Delegates to the synthetic backend while counting decode calls. The small
/// sleep widens the race window so coalescing tests actually overlap.
struct CountingDecoder {
    decodes: Arc<AtomicU64>,
    delay: Duration,
}

impl FrameDecoder for CountingDecoder {
    fn id(&self) -> &'static str {
        "counting"
    }

    fn supports(&self, source: &VideoSource) -> bool {
        SyntheticDecoder.supports(source)
    }

    fn decode_at(&self, source: &mut VideoSource, target_ms: u64) -> Result<RawFrame> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        SyntheticDecoder.decode_at(source, target_ms)
    }
}

/// Fails the first decode with a structural error, then recovers
struct FailOnceDecoder {
    failed: AtomicU64,
    delay: Duration,
}

impl FrameDecoder for FailOnceDecoder {
    fn id(&self) -> &'static str {
        "fail-once"
    }

    fn supports(&self, source: &VideoSource) -> bool {
        SyntheticDecoder.supports(source)
    }

    fn decode_at(&self, source: &mut VideoSource, target_ms: u64) -> Result<RawFrame> {
        std::thread::sleep(self.delay);
        if self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ThumbError::CorruptStream("truncated stream".to_string()));
        }
        SyntheticDecoder.decode_at(source, target_ms)
    }
}

fn counting_service(
    cache_capacity: usize,
    delay_ms: u64,
) -> (ThumbnailService, Arc<AtomicU64>) {
    let decodes = Arc::new(AtomicU64::new(0));
    let service = ThumbnailService::with_backends(
        ServiceConfig {
            cache_capacity,
            max_decode_retries: 2,
        },
        vec![Arc::new(CountingDecoder {
            decodes: Arc::clone(&decodes),
            delay: Duration::from_millis(delay_ms),
        })],
    );
    (service, decodes)
}

fn synthetic_request(time_ms: u64) -> ThumbnailRequest {
    let mut req = ThumbnailRequest::new(
        SourceDescriptor::Synthetic(SyntheticSpec {
            duration_ms: 10_000,
            width: 640,
            height: 360,
            keyframe_interval_ms: 1_000,
        }),
        Position::TimeMs(time_ms),
    );
    req.max_width = 200;
    req.max_height = 200;
    req
}

#[tokio::test]
async fn test_basic_extraction() {
    let service = ThumbnailService::new(ServiceConfig::default());
    let thumb = service.extract(&synthetic_request(5_000)).await.unwrap();

    assert!(thumb.width <= 200 && thumb.height <= 200);
    assert_eq!((thumb.width, thumb.height), (200, 112));
    assert_eq!(thumb.actual_time_ms, 5_000);
    assert_eq!(thumb.format, ThumbFormat::Jpeg);
    assert_eq!(&thumb.bytes()[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn test_keyframe_before_target_reported() {
    let service = ThumbnailService::new(ServiceConfig::default());
    let thumb = service.extract(&synthetic_request(4_500)).await.unwrap();
    assert_eq!(thumb.actual_time_ms, 4_000);
}

#[tokio::test]
async fn test_cache_hit_skips_decode() {
    let (service, decodes) = counting_service(16, 0);
    let req = synthetic_request(3_000);

    let first = service.extract(&req).await.unwrap();
    let second = service.extract(&req).await.unwrap();

    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert_eq!(first.bytes(), second.bytes());

    let stats = service.cache_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_equivalent_positions_share_entry() {
    let (service, decodes) = counting_service(16, 0);

    let by_time = synthetic_request(5_000);
    let mut by_percent = synthetic_request(0);
    by_percent.position = Position::Percent(50.0);

    service.extract(&by_time).await.unwrap();
    service.extract(&by_percent).await.unwrap();

    // 50% of 10s normalizes to the same key as 5000ms.
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert_eq!(service.cache_stats().entries, 1);
}

#[tokio::test]
async fn test_concurrent_identical_requests_coalesce() {
    let (service, decodes) = counting_service(16, 50);
    let req = synthetic_request(2_000);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let req = req.clone();
        handles.push(tokio::spawn(async move { service.extract(&req).await }));
    }

    let mut thumbs = Vec::new();
    for handle in handles {
        thumbs.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    for thumb in &thumbs[1..] {
        assert_eq!(thumb.bytes(), thumbs[0].bytes());
    }
}

#[tokio::test]
async fn test_waiter_retries_after_leader_failure() {
    let service = ThumbnailService::with_backends(
        ServiceConfig {
            cache_capacity: 16,
            max_decode_retries: 0,
        },
        vec![Arc::new(FailOnceDecoder {
            failed: AtomicU64::new(0),
            delay: Duration::from_millis(50),
        })],
    );
    let req = synthetic_request(1_000);

    let leader = {
        let service = service.clone();
        let req = req.clone();
        tokio::spawn(async move { service.extract(&req).await })
    };
    // Let the leader reach the decoder before the waiter joins.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let waiter = {
        let service = service.clone();
        let req = req.clone();
        tokio::spawn(async move { service.extract(&req).await })
    };

    let leader_result = leader.await.unwrap();
    let waiter_result = waiter.await.unwrap();

    assert!(matches!(leader_result, Err(ThumbError::CorruptStream(_))));
    assert!(waiter_result.is_ok(), "waiter should retry once and succeed");
}

#[tokio::test]
async fn test_no_cache_bypasses_storage() {
    let (service, decodes) = counting_service(16, 0);
    let mut req = synthetic_request(6_000);
    req.use_cache = false;

    service.extract(&req).await.unwrap();
    service.extract(&req).await.unwrap();

    assert_eq!(decodes.load(Ordering::SeqCst), 2);
    assert_eq!(service.cache_stats().entries, 0);
}

#[tokio::test]
async fn test_lru_eviction_forces_redecode() {
    let (service, decodes) = counting_service(2, 0);

    service.extract(&synthetic_request(1_000)).await.unwrap();
    service.extract(&synthetic_request(2_000)).await.unwrap();
    // Inserting a third entry evicts the 1s thumbnail.
    service.extract(&synthetic_request(3_000)).await.unwrap();
    service.extract(&synthetic_request(1_000)).await.unwrap();

    assert_eq!(decodes.load(Ordering::SeqCst), 4);
    assert_eq!(service.cache_stats().entries, 2);
}

#[tokio::test]
async fn test_quality_above_range_clamps_instead_of_failing() {
    let (service, decodes) = counting_service(16, 0);

    let mut overdriven = synthetic_request(4_000);
    overdriven.quality = 150;
    let thumb = service.extract(&overdriven).await.unwrap();
    assert_eq!(&thumb.bytes()[..2], &[0xFF, 0xD8]);

    // Clamping happens before key formation, so quality 150 and 100 share
    // one cache entry.
    let mut max = synthetic_request(4_000);
    max.quality = 100;
    service.extract(&max).await.unwrap();

    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert_eq!(service.cache_stats().entries, 1);
}

#[tokio::test]
async fn test_clear_cache_forces_redecode() {
    let (service, decodes) = counting_service(16, 0);
    let req = synthetic_request(9_000);

    service.extract(&req).await.unwrap();
    service.clear_cache();
    assert_eq!(service.cache_stats().entries, 0);

    service.extract(&req).await.unwrap();
    assert_eq!(decodes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_percent_rejected() {
    let service = ThumbnailService::new(ServiceConfig::default());
    let mut req = synthetic_request(0);
    req.position = Position::Percent(150.0);

    let err = service.extract(&req).await.unwrap_err();
    assert!(matches!(err, ThumbError::InvalidPosition(_)));
    assert_eq!(err.kind(), "InvalidPosition");
}

#[tokio::test]
async fn test_missing_file_not_cached() {
    let service = ThumbnailService::new(ServiceConfig::default());
    let req = ThumbnailRequest::new(
        SourceDescriptor::Path("/nonexistent/clip.mp4".into()),
        Position::TimeMs(0),
    );

    let err = service.extract(&req).await.unwrap_err();
    assert!(matches!(err, ThumbError::SourceNotFound(_)));
    assert_eq!(service.cache_stats().entries, 0);
}

#[tokio::test]
async fn test_cancellation() {
    let (service, _decodes) = counting_service(16, 200);
    let req = synthetic_request(7_000);

    let token = CancellationToken::new();
    let task = {
        let service = service.clone();
        let req = req.clone();
        let token = token.clone();
        tokio::spawn(async move { service.extract_with_cancellation(&req, token).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    assert!(matches!(task.await.unwrap(), Err(ThumbError::Cancelled)));
}

#[tokio::test]
async fn test_cancelled_leader_still_fills_cache() {
    let (service, decodes) = counting_service(16, 100);
    let req = synthetic_request(8_000);

    let token = CancellationToken::new();
    let leader = {
        let service = service.clone();
        let req = req.clone();
        let token = token.clone();
        tokio::spawn(async move { service.extract_with_cancellation(&req, token).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    assert!(matches!(leader.await.unwrap(), Err(ThumbError::Cancelled)));

    // The detached pipeline keeps running; wait for it to land in the cache.
    tokio::time::sleep(Duration::from_millis(200)).await;
    service.extract(&req).await.unwrap();
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_extract_to_file() {
    let service = ThumbnailService::new(ServiceConfig::default());
    let dir = tempfile::tempdir().unwrap();

    let mut req = synthetic_request(5_000);
    req.format = ThumbFormat::Png;
    let out = dir.path().join("thumb.png");

    let written = service.extract_to_file(&req, Some(&out)).await.unwrap();
    assert_eq!(written, out);
    let bytes = std::fs::read(&written).unwrap();
    assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
}

#[tokio::test]
async fn test_extract_to_file_requires_output_for_synthetic() {
    let service = ThumbnailService::new(ServiceConfig::default());
    let req = synthetic_request(0);
    let err = service.extract_to_file(&req, None).await.unwrap_err();
    assert!(matches!(err, ThumbError::Internal(_)));
}
