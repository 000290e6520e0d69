use thiserror::Error;

/// Rejections raised before anything touches storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("upload is empty")]
    Empty,
    #[error("upload is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("content looks like {detected}, not an accepted image type")]
    ContentMismatch { detected: String },
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid upload: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("could not read image dimensions: {0}")]
    Media(String),

    #[error("catch-all category '{0}' is missing from the store")]
    Configuration(String),

    // anyhow::Error is not a std error, so the chain is rendered instead of exposed as source.
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl IngestError {
    /// Validation problems are the caller's fault; everything else is ours.
    pub fn is_server_failure(&self) -> bool {
        !matches!(self, IngestError::Validation(_))
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Persistence(err)
    }
}
