use thiserror::Error;

/// Failure taxonomy shared by every codec and the buffer pool.
///
/// A premature end of stream is deliberately absent: dangling partial
/// frames are dropped and reported through the end-of-stream return.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Structural corruption: bad chunk tag, unknown subtype, invalid packet length.
    #[error("format error: {0}")]
    Format(String),

    /// Malformed codec parameter string.
    #[error("invalid codec params \"{params}\": {reason}")]
    Param { params: String, reason: String },

    /// Well-formed input describing something this build cannot handle.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The codec was driven outside its lifecycle.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("opus error: {0}")]
    Opus(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    pub fn invalid_usage(msg: impl Into<String>) -> Self {
        Self::InvalidUsage(msg.into())
    }

    pub fn param(params: &str, reason: impl Into<String>) -> Self {
        Self::Param {
            params: params.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by the bytes on the wire rather than the caller.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format(_) | Self::Param { .. })
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
