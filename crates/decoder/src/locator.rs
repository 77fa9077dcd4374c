//! Maps a requested logical position to a concrete target timestamp.

use video_thumb_common::{Position, Result, SourceMetadata, ThumbError};

/// Resolve a position against the source duration.
///
/// Fractional positions are resolved to `percent/100 * duration`; both forms
/// are clamped to `[0, duration)`. The returned value is the *requested*
/// target; decoding may land on an earlier keyframe, and the actually decoded
/// timestamp is what ends up in the result.
///
/// # Errors
///
/// - [`ThumbError::InvalidPosition`] for a percent outside `[0, 100]` or a
///   source with no known duration
pub fn locate(meta: &SourceMetadata, position: Position) -> Result<u64> {
    if meta.duration_ms == 0 {
        return Err(ThumbError::InvalidPosition(
            "source reports no duration".to_string(),
        ));
    }

    let target = match position {
        Position::TimeMs(t) => t,
        Position::Percent(p) => {
            if !p.is_finite() || !(0.0..=100.0).contains(&p) {
                return Err(ThumbError::InvalidPosition(format!(
                    "percent must be within [0, 100], got {p}"
                )));
            }
            (meta.duration_ms as f64 * p / 100.0).round() as u64
        }
    };

    // Half-open interval: the last valid timestamp is duration - 1.
    Ok(target.min(meta.duration_ms - 1))
}
