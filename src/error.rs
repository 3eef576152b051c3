//! Error types for vidarena

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for vidarena operations
pub type Result<T> = std::result::Result<T, Error>;

/// vidarena error type
#[derive(Error, Debug)]
pub enum Error {
    // Source errors
    #[error("Video could not be opened: {0}")]
    Open(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Video yielded no usable frames: {0}")]
    EmptyVideo(String),

    #[error("URL resolution failed: {0}")]
    Resolve(String),

    // Processing errors
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // Synchronization errors
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // Lifecycle errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Arena memory already released")]
    AlreadyReleased,

    // Arena errors
    #[error("Failed to create arena segment at {path}: {cause}")]
    ArenaCreate { path: PathBuf, cause: String },

    #[error("Arena capacity exceeded: requested {requested} rows, capacity {capacity}")]
    ArenaCapacity { requested: usize, capacity: usize },

    // FFmpeg errors
    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    // General errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Per-video failures that a worker logs and skips
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Open(_)
                | Error::Decode(_)
                | Error::EmptyVideo(_)
                | Error::Resolve(_)
                | Error::InvalidFrame(_)
                | Error::FFmpeg(_)
        )
    }

    /// Caller misuse of the reader lifecycle
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::InvalidState(_) | Error::AlreadyReleased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Open("a.mp4".into()).is_recoverable());
        assert!(Error::EmptyVideo("a.mp4".into()).is_recoverable());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!Error::AlreadyReleased.is_recoverable());
    }

    #[test]
    fn test_misuse_classification() {
        assert!(Error::AlreadyReleased.is_misuse());
        assert!(Error::InvalidState("reading".into()).is_misuse());
        assert!(!Error::Decode("x".into()).is_misuse());
    }
}
