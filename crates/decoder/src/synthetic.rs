//! Deterministic decode backend for synthetic sources.
//!
//! Used by tests and benchmarks: frames are generated in-process, the
//! "keyframe" at or before the target is the nearest multiple of the spec's
//! keyframe interval, and the pixel content is a pure function of that
//! snapped timestamp. Identical requests therefore produce byte-identical
//! frames, which the cache determinism tests rely on.

use video_thumb_common::{RawFrame, Result, SyntheticSpec, ThumbError};
use video_thumb_source::{SourceHandle, VideoSource};

use crate::FrameDecoder;

pub struct SyntheticDecoder;

impl FrameDecoder for SyntheticDecoder {
    fn id(&self) -> &'static str {
        "synthetic"
    }

    fn supports(&self, source: &VideoSource) -> bool {
        matches!(source.handle, SourceHandle::Synthetic(_))
    }

    fn decode_at(&self, source: &mut VideoSource, target_ms: u64) -> Result<RawFrame> {
        let SourceHandle::Synthetic(spec) = &source.handle else {
            return Err(ThumbError::CodecUnsupported(
                "synthetic backend requires a synthetic source".to_string(),
            ));
        };
        Ok(synth_frame(spec, target_ms))
    }
}

/// Generate the frame for the keyframe at or before `target_ms`
#[must_use]
pub fn synth_frame(spec: &SyntheticSpec, target_ms: u64) -> RawFrame {
    let snapped = target_ms - target_ms % spec.keyframe_interval_ms;
    let idx = snapped / spec.keyframe_interval_ms;

    let r = (idx * 37 % 256) as u8;
    let g = (idx * 73 % 256) as u8;
    let b = (idx * 151 % 256) as u8;

    let pixels = spec.width as usize * spec.height as usize;
    let mut data = Vec::with_capacity(pixels * 3);
    for _ in 0..pixels {
        data.extend_from_slice(&[r, g, b]);
    }

    RawFrame {
        width: spec.width,
        height: spec.height,
        data,
        actual_time_ms: snapped,
        is_keyframe: true,
    }
}
