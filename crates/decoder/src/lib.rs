//! Frame location and decoding.
//!
//! [`locate`](locator::locate) resolves a logical position to a target
//! timestamp; a [`FrameDecoder`] backend then seeks and decodes exactly one
//! frame. Backends are polymorphic over the source's capability set: the
//! software backend handles anything the demuxer opened, the synthetic
//! backend handles generated sources. The seek policy is backward-to-keyframe
//! so decode cost is bounded at one frame; the decoded timestamp (which may
//! precede the request by up to one keyframe interval) is reported in the
//! frame.

pub mod locator;
pub mod synthetic;

use std::sync::Arc;

use ffmpeg_next as ffmpeg;
use tracing::{debug, warn};
use video_thumb_common::{RawFrame, Result, ThumbError};
use video_thumb_source::{DemuxerHandle, SourceHandle, VideoSource};

pub use locator::locate;
pub use synthetic::SyntheticDecoder;

/// A decode backend: given an open source and a target timestamp, seek and
/// decode one frame into RGB24.
pub trait FrameDecoder: Send + Sync {
    /// Short backend identifier for logs
    fn id(&self) -> &'static str;

    /// Whether this backend can decode the given source
    fn supports(&self, source: &VideoSource) -> bool;

    /// Seek to the keyframe at or before `target_ms` and decode it.
    ///
    /// # Errors
    ///
    /// - [`ThumbError::CodecUnsupported`] when the stream's codec cannot be
    ///   decoded (structural, never retried)
    /// - [`ThumbError::CorruptStream`] when no decodable frame exists
    /// - [`ThumbError::DecodeError`] for transient decode failures
    fn decode_at(&self, source: &mut VideoSource, target_ms: u64) -> Result<RawFrame>;
}

/// In-process multi-threaded software decode via libavcodec
pub struct SoftwareDecoder;

impl SoftwareDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for SoftwareDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for SoftwareDecoder {
    fn id(&self) -> &'static str {
        "software"
    }

    fn supports(&self, source: &VideoSource) -> bool {
        matches!(source.handle, SourceHandle::Demuxer(_))
    }

    fn decode_at(&self, source: &mut VideoSource, target_ms: u64) -> Result<RawFrame> {
        let SourceHandle::Demuxer(handle) = &mut source.handle else {
            return Err(ThumbError::CodecUnsupported(
                "software backend requires a demuxed source".to_string(),
            ));
        };
        decode_demuxed(handle, target_ms)
    }
}

/// The default backend set, in selection order
#[must_use]
pub fn default_backends() -> Vec<Arc<dyn FrameDecoder>> {
    vec![Arc::new(SoftwareDecoder::new()), Arc::new(SyntheticDecoder)]
}

/// Decode with bounded retries on transient failures.
///
/// Structural failures (`CodecUnsupported`, `CorruptStream`) surface
/// immediately; only [`ThumbError::is_transient`] errors are retried, up to
/// `max_retries` additional attempts.
pub fn decode_with_retry(
    backend: &dyn FrameDecoder,
    source: &mut VideoSource,
    target_ms: u64,
    max_retries: u32,
) -> Result<RawFrame> {
    let mut attempt = 0;
    loop {
        match backend.decode_at(source, target_ms) {
            Ok(frame) => {
                if attempt > 0 {
                    debug!(
                        "decode of {} at {target_ms}ms succeeded on retry {attempt}",
                        source.identity()
                    );
                }
                return Ok(frame);
            }
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    "transient decode failure for {} at {target_ms}ms (attempt {attempt}/{max_retries}): {e}",
                    source.identity()
                );
            }
            Err(e) => return Err(e),
        }
    }
}

fn decode_demuxed(handle: &mut DemuxerHandle, target_ms: u64) -> Result<RawFrame> {
    let stream_index = handle.stream_index;
    let time_base = handle.time_base;

    // Backward seek lands on the keyframe at or before the target, so the
    // first frame out of the decoder is the one we want.
    let seek_ts = target_ms as i64 * i64::from(ffmpeg::ffi::AV_TIME_BASE) / 1000;
    handle
        .input
        .seek(seek_ts, ..seek_ts)
        .map_err(|e| ThumbError::DecodeError(format!("seek to {target_ms}ms failed: {e}")))?;

    let params = {
        let stream = handle
            .input
            .streams()
            .find(|s| s.index() == stream_index)
            .ok_or_else(|| {
                ThumbError::CorruptStream("video stream disappeared after seek".to_string())
            })?;
        stream.parameters()
    };

    let mut decoder = ffmpeg::codec::context::Context::from_parameters(params)
        .map_err(|e| ThumbError::CodecUnsupported(format!("failed to create context: {e}")))?
        .decoder()
        .video()
        .map_err(|e| ThumbError::CodecUnsupported(format!("failed to create decoder: {e}")))?;

    let mut scaler = ffmpeg::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .map_err(|e| ThumbError::DecodeError(format!("failed to create scaler: {e}")))?;

    let mut decoded = ffmpeg::util::frame::video::Video::empty();
    let mut converted = ffmpeg::util::frame::video::Video::empty();

    for (stream, packet) in handle.input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        // Damaged packets are skipped; the retry wrapper deals with streams
        // that never yield a frame.
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        if decoder.receive_frame(&mut decoded).is_ok() {
            return finish_frame(&mut scaler, &decoded, &mut converted, time_base);
        }
    }

    decoder.send_eof().ok();
    if decoder.receive_frame(&mut decoded).is_ok() {
        return finish_frame(&mut scaler, &decoded, &mut converted, time_base);
    }

    Err(ThumbError::CorruptStream(format!(
        "no decodable frame at or after {target_ms}ms"
    )))
}

fn finish_frame(
    scaler: &mut ffmpeg::software::scaling::Context,
    decoded: &ffmpeg::util::frame::video::Video,
    converted: &mut ffmpeg::util::frame::video::Video,
    time_base: ffmpeg::Rational,
) -> Result<RawFrame> {
    scaler
        .run(decoded, converted)
        .map_err(|e| ThumbError::DecodeError(format!("pixel conversion failed: {e}")))?;

    let pts = decoded.timestamp().unwrap_or(0).max(0);
    let actual_time_ms = if time_base.1 > 0 {
        (pts as f64 * 1000.0 * f64::from(time_base.0) / f64::from(time_base.1)) as u64
    } else {
        0
    };

    Ok(RawFrame {
        width: converted.width(),
        height: converted.height(),
        data: copy_rgb24(converted),
        actual_time_ms,
        is_keyframe: decoded.is_key(),
    })
}

/// Copy RGB24 plane data into a contiguous buffer, dropping stride padding
fn copy_rgb24(frame: &ffmpeg::util::frame::video::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let plane = frame.data(0);

    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row_start = y * stride;
        data.extend_from_slice(&plane[row_start..row_start + width * 3]);
    }
    data
}
