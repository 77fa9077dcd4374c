//! Common types for the video thumbnail extraction pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub mod error;

pub use error::{Result, ThumbError};

/// Still-image output format for encoded thumbnails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbFormat {
    #[default]
    Jpeg,
    Png,
    Webp,
}

impl ThumbFormat {
    /// File extension for this format (no leading dot)
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ThumbFormat::Jpeg => "jpg",
            ThumbFormat::Png => "png",
            ThumbFormat::Webp => "webp",
        }
    }

    /// MIME type for this format
    #[must_use]
    pub fn mime_type(&self) -> &'static str {
        match self {
            ThumbFormat::Jpeg => "image/jpeg",
            ThumbFormat::Png => "image/png",
            ThumbFormat::Webp => "image/webp",
        }
    }
}

impl std::fmt::Display for ThumbFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ThumbFormat::Jpeg => "JPEG",
            ThumbFormat::Png => "PNG",
            ThumbFormat::Webp => "WEBP",
        };
        f.write_str(name)
    }
}

impl FromStr for ThumbFormat {
    type Err = ThumbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(ThumbFormat::Jpeg),
            "png" => Ok(ThumbFormat::Png),
            "webp" => Ok(ThumbFormat::Webp),
            other => Err(ThumbError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Requested frame position within the video.
///
/// The two forms are mutually exclusive by construction; a fractional
/// position is resolved against the source duration during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    /// Absolute offset in milliseconds
    TimeMs(u64),
    /// Fraction of the duration, 0.0..=100.0
    Percent(f64),
}

/// Parameters for the deterministic synthetic source used by tests and
/// benchmarks. Frames are generated in-process, no demuxer involved.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSpec {
    pub duration_ms: u64,
    pub width: u32,
    pub height: u32,
    /// Distance between synthetic keyframes; decode snaps down to a multiple
    pub keyframe_interval_ms: u64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            width: 1280,
            height: 720,
            keyframe_interval_ms: 1_000,
        }
    }
}

/// Where the video comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDescriptor {
    /// Local filesystem path
    Path(PathBuf),
    /// Remote URI (anything the demuxer's protocol layer understands)
    Uri {
        url: String,
        /// HTTP headers forwarded to the demuxer's protocol layer, e.g. for
        /// auth-protected sources. Sorted map so ordering never changes the
        /// identity.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// Raw in-memory container bytes
    Bytes(Vec<u8>),
    /// Deterministic generated source
    Synthetic(SyntheticSpec),
}

impl SourceDescriptor {
    /// URI source with no extra headers
    #[must_use]
    pub fn uri(url: impl Into<String>) -> Self {
        SourceDescriptor::Uri {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    /// URI source with HTTP headers attached
    #[must_use]
    pub fn uri_with_headers(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        SourceDescriptor::Uri {
            url: url.into(),
            headers,
        }
    }

    /// Stable identity string used as the source component of cache keys.
    ///
    /// Byte buffers are identified by content digest so that two requests
    /// carrying equal payloads share cache entries. URI headers are folded in
    /// as a digest: the same URL fetched with different credentials must not
    /// share a cache entry with an unauthenticated fetch.
    #[must_use]
    pub fn identity(&self) -> String {
        match self {
            SourceDescriptor::Path(p) => format!("file:{}", p.display()),
            SourceDescriptor::Uri { url, headers } => {
                if headers.is_empty() {
                    url.clone()
                } else {
                    let mut hasher = blake3::Hasher::new();
                    for (name, value) in headers {
                        hasher.update(name.as_bytes());
                        hasher.update(b":");
                        hasher.update(value.as_bytes());
                        hasher.update(b"\n");
                    }
                    format!("{url}#hdr:{}", hasher.finalize().to_hex())
                }
            }
            SourceDescriptor::Bytes(b) => {
                format!("bytes:{}", blake3::hash(b).to_hex())
            }
            SourceDescriptor::Synthetic(s) => format!(
                "synthetic:{}x{}:{}ms:kf{}",
                s.width, s.height, s.duration_ms, s.keyframe_interval_ms
            ),
        }
    }
}

/// Container-level metadata probed when a source is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub container: String,
    pub duration_ms: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// One decoded frame in RGB24 layout.
///
/// Ephemeral: lives only between decode and encode within a single
/// extraction. `actual_time_ms` is the timestamp that was really decoded,
/// which may precede the requested position by up to one keyframe interval.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, row-major, no stride padding
    pub data: Vec<u8>,
    pub actual_time_ms: u64,
    pub is_keyframe: bool,
}

impl RawFrame {
    /// Expected buffer length for the frame dimensions
    #[must_use]
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// An encoded thumbnail, safe to share across callers.
///
/// Bytes sit behind an `Arc` so cache hits and coalesced waiters clone
/// cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub bytes: Arc<Vec<u8>>,
    pub format: ThumbFormat,
    pub width: u32,
    pub height: u32,
    pub actual_time_ms: u64,
}

impl Thumbnail {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One extraction request. Immutable once constructed; the orchestrator
/// derives the cache key from its normalized fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailRequest {
    pub source: SourceDescriptor,
    pub position: Position,
    /// Maximum output width; 0 means unbounded on this axis
    pub max_width: u32,
    /// Maximum output height; 0 means unbounded on this axis
    pub max_height: u32,
    pub preserve_aspect: bool,
    pub format: ThumbFormat,
    /// 0-100, mapped to codec-specific quality internally; values above 100
    /// are clamped during normalization
    pub quality: u8,
    pub use_cache: bool,
}

impl ThumbnailRequest {
    /// Create a request with default output settings (JPEG, quality 80,
    /// unbounded dimensions, caching enabled).
    #[must_use]
    pub fn new(source: SourceDescriptor, position: Position) -> Self {
        Self {
            source,
            position,
            max_width: 0,
            max_height: 0,
            preserve_aspect: true,
            format: ThumbFormat::Jpeg,
            quality: 80,
            use_cache: true,
        }
    }

    /// Validate caller-supplied fields that can be rejected without opening
    /// the source. Quality is not validated here: out-of-range values are
    /// clamped during normalization rather than rejected.
    pub fn validate(&self) -> Result<()> {
        if let Position::Percent(p) = self.position {
            if !p.is_finite() || !(0.0..=100.0).contains(&p) {
                return Err(ThumbError::InvalidPosition(format!(
                    "percent must be within [0, 100], got {p}"
                )));
            }
        }
        Ok(())
    }
}

/// Boundary-layer response envelope: either the encoded thumbnail or a
/// `{errorKind, message}` failure, never both, never partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ThumbnailResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        bytes: Vec<u8>,
        format: ThumbFormat,
        width: u32,
        height: u32,
        actual_time_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Failure { error_kind: String, message: String },
}

impl ThumbnailResponse {
    #[must_use]
    pub fn from_result(result: Result<Thumbnail>) -> Self {
        match result {
            Ok(thumb) => ThumbnailResponse::Success {
                bytes: thumb.bytes().to_vec(),
                format: thumb.format,
                width: thumb.width,
                height: thumb.height,
                actual_time_ms: thumb.actual_time_ms,
            },
            Err(e) => ThumbnailResponse::Failure {
                error_kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_roundtrip() {
        assert_eq!("jpeg".parse::<ThumbFormat>().unwrap(), ThumbFormat::Jpeg);
        assert_eq!("jpg".parse::<ThumbFormat>().unwrap(), ThumbFormat::Jpeg);
        assert_eq!("PNG".parse::<ThumbFormat>().unwrap(), ThumbFormat::Png);
        assert_eq!(ThumbFormat::Webp.extension(), "webp");
        assert_eq!(ThumbFormat::Jpeg.to_string(), "JPEG");
        assert!(matches!(
            "gif".parse::<ThumbFormat>(),
            Err(ThumbError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_uri_identity_folds_headers() {
        let plain = SourceDescriptor::uri("https://example.com/a.mp4");
        let auth_headers = BTreeMap::from([(
            "Authorization".to_string(),
            "Bearer t0k3n".to_string(),
        )]);
        let authed =
            SourceDescriptor::uri_with_headers("https://example.com/a.mp4", auth_headers.clone());
        let authed_again =
            SourceDescriptor::uri_with_headers("https://example.com/a.mp4", auth_headers);

        assert_eq!(plain.identity(), "https://example.com/a.mp4");
        assert_ne!(plain.identity(), authed.identity());
        assert_eq!(authed.identity(), authed_again.identity());
        assert!(authed
            .identity()
            .starts_with("https://example.com/a.mp4#hdr:"));
    }

    #[test]
    fn test_bytes_identity_is_content_addressed() {
        let a = SourceDescriptor::Bytes(vec![1, 2, 3]);
        let b = SourceDescriptor::Bytes(vec![1, 2, 3]);
        let c = SourceDescriptor::Bytes(vec![1, 2, 4]);
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert!(a.identity().starts_with("bytes:"));
    }

    #[test]
    fn test_request_validation() {
        let spec = SyntheticSpec::default();
        let mut req = ThumbnailRequest::new(
            SourceDescriptor::Synthetic(spec),
            Position::Percent(150.0),
        );
        assert!(matches!(
            req.validate(),
            Err(ThumbError::InvalidPosition(_))
        ));

        req.position = Position::Percent(50.0);
        assert!(req.validate().is_ok());

        // Out-of-range quality is clamped downstream, never rejected.
        req.quality = 150;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_response_failure_shape() {
        let resp =
            ThumbnailResponse::from_result(Err(ThumbError::SourceNotFound("/no/file".into())));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["errorKind"], "SourceNotFound");
    }

    #[test]
    fn test_response_success_shape() {
        let thumb = Thumbnail {
            bytes: Arc::new(vec![0xFF, 0xD8]),
            format: ThumbFormat::Jpeg,
            width: 120,
            height: 90,
            actual_time_ms: 4000,
        };
        let resp = ThumbnailResponse::from_result(Ok(thumb));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["actualTimeMs"], 4000);
        assert_eq!(json["format"], "jpeg");
    }
}
