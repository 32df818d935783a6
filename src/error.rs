use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced to callers. Missing keys, duplicate inserts and empty
/// ranges are ordinary results, not errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// the file contents do not decode; the handle should be discarded
    #[error("corrupted store: {0}")]
    Corruption(&'static str),
    #[error("iterator is exhausted")]
    ExhaustedIterator,
}
