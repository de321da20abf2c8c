use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no leaf long enough to split (minimum segment length not met)")]
    SegmentTooSmall,
    #[error("segment tree invariant violated: {0}")]
    TreeInvariant(String),
    #[error("source cannot be downloaded: {0}")]
    UnsupportedSource(String),
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("assembled file length {actual} does not match content length {expected}")]
    AssembleLengthMismatch { expected: u64, actual: u64 },
}
