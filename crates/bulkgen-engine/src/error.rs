use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal outcomes of a generation run. None of them are retried.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no API key supplied; enter a credential before generating")]
    MissingCredential,

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("image generation failed on unit {unit}/{total} (\"{prompt}\"): {message}")]
    Generation {
        unit: u64,
        total: u64,
        prompt: String,
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("generation cancelled after {completed} of {total} units")]
    Cancelled { completed: u64, total: u64 },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl BatchError {
    /// Short tag used in logs and the event stream.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::MissingCredential => "missing_credential",
            BatchError::InvalidBatch(_) => "invalid_batch",
            BatchError::Generation { .. } => "generation_error",
            BatchError::Cancelled { .. } => "cancelled",
            BatchError::Archive(_) => "archive_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to fetch image {index} ({reference}): {message}")]
    Fetch {
        index: usize,
        reference: String,
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to package archive: {0}")]
    Packaging(#[from] zip::result::ZipError),

    #[error("failed to write archive: {0}")]
    Io(#[from] std::io::Error),
}
