//! Source resolution: validates a descriptor, opens a demuxer handle and
//! probes container metadata.
//!
//! A [`VideoSource`] is owned by exactly one extraction request and releases
//! its OS-level handles on drop, on every exit path. Byte-buffer sources are
//! spooled to a guarded temp file so the demuxer can probe them; the guard
//! removes the file when the source is dropped.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use ffmpeg_next as ffmpeg;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use video_thumb_common::{
    Result, SourceDescriptor, SourceMetadata, SyntheticSpec, ThumbError,
};

/// Initialize the `FFmpeg` library (idempotent)
fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialize FFmpeg");
    });
}

/// An open demuxer plus the values decode needs without re-probing
pub struct DemuxerHandle {
    pub input: ffmpeg::format::context::Input,
    pub stream_index: usize,
    pub time_base: ffmpeg::Rational,
    /// Keeps spooled byte-buffer sources alive until the handle drops
    _spool: Option<NamedTempFile>,
}

/// Concrete decode handle behind a [`VideoSource`]
pub enum SourceHandle {
    /// Container opened through the demuxer (path, URI or spooled buffer)
    Demuxer(DemuxerHandle),
    /// Deterministic generated source, no demuxer involved
    Synthetic(SyntheticSpec),
}

/// A validated, opened video input with probed metadata
pub struct VideoSource {
    identity: String,
    metadata: SourceMetadata,
    pub handle: SourceHandle,
}

impl VideoSource {
    /// Open a source descriptor and probe duration/dimensions/frame-rate.
    ///
    /// # Errors
    ///
    /// - [`ThumbError::SourceNotFound`] if a local path does not exist
    /// - [`ThumbError::SourceUnreadable`] for empty buffers, malformed URIs
    ///   or I/O failures
    /// - [`ThumbError::UnsupportedContainer`] if the demuxer rejects the
    ///   container or it has no video stream
    pub fn open(descriptor: &SourceDescriptor) -> Result<Self> {
        let identity = descriptor.identity();
        debug!("opening source {identity}");

        match descriptor {
            SourceDescriptor::Path(path) => {
                if !path.exists() {
                    return Err(ThumbError::SourceNotFound(path.display().to_string()));
                }
                open_demuxed(path, None, identity, None)
            }
            SourceDescriptor::Uri { url, headers } => {
                validate_uri(url)?;
                open_demuxed(Path::new(url), None, identity, Some(headers))
            }
            SourceDescriptor::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(ThumbError::SourceUnreadable(
                        "empty byte buffer".to_string(),
                    ));
                }
                let spool = spool_buffer(bytes)?;
                let path = spool.path().to_path_buf();
                open_demuxed(&path, Some(spool), identity, None)
            }
            SourceDescriptor::Synthetic(spec) => open_synthetic(*spec, identity),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        debug!("released source {}", self.identity);
    }
}

/// Reject URIs the demuxer would choke on before handing them over
fn validate_uri(uri: &str) -> Result<()> {
    let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
        ThumbError::SourceUnreadable(format!("malformed URI (missing scheme): {uri}"))
    })?;
    let scheme_ok = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok || rest.is_empty() {
        return Err(ThumbError::SourceUnreadable(format!("malformed URI: {uri}")));
    }
    Ok(())
}

/// Write an in-memory container to a guarded temp file for demuxing
fn spool_buffer(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut spool = tempfile::Builder::new()
        .prefix("vthumb-src-")
        .tempfile()
        .map_err(|e| ThumbError::SourceUnreadable(format!("failed to spool buffer: {e}")))?;
    spool
        .write_all(bytes)
        .and_then(|()| spool.flush())
        .map_err(|e| ThumbError::SourceUnreadable(format!("failed to spool buffer: {e}")))?;
    Ok(spool)
}

fn open_synthetic(spec: SyntheticSpec, identity: String) -> Result<VideoSource> {
    if spec.width == 0 || spec.height == 0 || spec.keyframe_interval_ms == 0 {
        return Err(ThumbError::SourceUnreadable(format!(
            "degenerate synthetic spec: {spec:?}"
        )));
    }
    let metadata = SourceMetadata {
        container: "synthetic".to_string(),
        duration_ms: spec.duration_ms,
        width: spec.width,
        height: spec.height,
        fps: 1000.0 / spec.keyframe_interval_ms as f64,
    };
    Ok(VideoSource {
        identity,
        metadata,
        handle: SourceHandle::Synthetic(spec),
    })
}

fn open_demuxed(
    path: &Path,
    spool: Option<NamedTempFile>,
    identity: String,
    headers: Option<&BTreeMap<String, String>>,
) -> Result<VideoSource> {
    init_ffmpeg();

    // Headers go to the protocol layer through the demuxer's option
    // dictionary, one CRLF-terminated line per header.
    let input = match headers.filter(|h| !h.is_empty()) {
        Some(headers) => {
            let mut options = ffmpeg::Dictionary::new();
            let joined: String = headers
                .iter()
                .map(|(name, value)| format!("{name}: {value}\r\n"))
                .collect();
            options.set("headers", &joined);
            ffmpeg::format::input_with_dictionary(&path, options)
        }
        None => ffmpeg::format::input(&path),
    }
    .map_err(|e| map_open_error(&identity, e))?;

    let container = input
        .format()
        .name()
        .split(',')
        .next()
        .unwrap_or("unknown")
        .to_string();

    let (stream_index, time_base, width, height, fps, duration_ms) = {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| {
                ThumbError::UnsupportedContainer(format!("no video stream in {identity}"))
            })?;

        let stream_index = stream.index();
        let time_base = stream.time_base();
        let params = stream.parameters();
        let (width, height) = unsafe {
            (
                (*params.as_ptr()).width as u32,
                (*params.as_ptr()).height as u32,
            )
        };

        let rate = stream.avg_frame_rate();
        let fps = if rate.1 > 0 {
            f64::from(rate.0) / f64::from(rate.1)
        } else {
            0.0
        };

        // Container duration when the format declares one, otherwise the
        // video stream's own duration in its time base.
        let duration_ms = if input.duration() > 0 {
            (input.duration() as f64 * 1000.0 / f64::from(ffmpeg::ffi::AV_TIME_BASE)) as u64
        } else if stream.duration() > 0 && time_base.1 > 0 {
            (stream.duration() as f64 * 1000.0 * f64::from(time_base.0)
                / f64::from(time_base.1)) as u64
        } else {
            0
        };

        (stream_index, time_base, width, height, fps, duration_ms)
    };

    let metadata = SourceMetadata {
        container,
        duration_ms,
        width,
        height,
        fps,
    };

    info!(
        "opened {identity}: container={}, duration={}ms, {}x{} @ {:.2}fps",
        metadata.container, metadata.duration_ms, metadata.width, metadata.height, metadata.fps
    );

    Ok(VideoSource {
        identity,
        metadata,
        handle: SourceHandle::Demuxer(DemuxerHandle {
            input,
            stream_index,
            time_base,
            _spool: spool,
        }),
    })
}

fn map_open_error(identity: &str, e: ffmpeg::Error) -> ThumbError {
    match e {
        ffmpeg::Error::InvalidData | ffmpeg::Error::DemuxerNotFound => {
            ThumbError::UnsupportedContainer(format!("{identity}: {e}"))
        }
        ffmpeg::Error::DecoderNotFound => {
            ThumbError::CodecUnsupported(format!("{identity}: {e}"))
        }
        ffmpeg::Error::HttpNotFound => ThumbError::SourceNotFound(format!("{identity}: {e}")),
        other => ThumbError::SourceUnreadable(format!("{identity}: {other}")),
    }
}
