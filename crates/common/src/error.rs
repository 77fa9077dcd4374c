//! Error taxonomy shared across the extraction pipeline

use thiserror::Error;

/// Failures a thumbnail extraction can surface to the caller.
///
/// Every variant carries a human-readable message. The boundary layer only
/// sees the stable [`kind`](ThumbError::kind) string plus that message, so
/// variants are deliberately `Clone` (string payloads only) to allow results
/// to fan out to coalesced waiters.
#[derive(Debug, Clone, Error)]
pub enum ThumbError {
    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("unsupported container: {0}")]
    UnsupportedContainer(String),

    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("codec unsupported: {0}")]
    CodecUnsupported(String),

    #[error("decode failed: {0}")]
    DecodeError(String),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("encode failed: {0}")]
    EncodeError(String),

    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ThumbError {
    /// Stable kind identifier exposed through the boundary contract.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ThumbError::SourceNotFound(_) => "SourceNotFound",
            ThumbError::SourceUnreadable(_) => "SourceUnreadable",
            ThumbError::UnsupportedContainer(_) => "UnsupportedContainer",
            ThumbError::InvalidPosition(_) => "InvalidPosition",
            ThumbError::CodecUnsupported(_) => "CodecUnsupported",
            ThumbError::DecodeError(_) => "DecodeError",
            ThumbError::CorruptStream(_) => "CorruptStream",
            ThumbError::EncodeError(_) => "EncodeError",
            ThumbError::UnsupportedFormat(_) => "UnsupportedFormat",
            ThumbError::Cancelled => "Cancelled",
            ThumbError::Internal(_) => "InternalError",
        }
    }

    /// Whether a decode-stage failure is worth retrying.
    ///
    /// Only plain decode failures are transient; codec and container problems
    /// are structural and retrying cannot fix them.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ThumbError::DecodeError(_))
    }
}

/// Result type for thumbnail operations
pub type Result<T> = std::result::Result<T, ThumbError>;
