//! Frame sources and URL resolution
//!
//! Decoding and network retrieval sit behind two traits:
//! - [`FrameSource`] opens a handle and yields frames in order
//! - [`UrlResolver`] turns a remote URL into a handle a source can open
//!
//! Implementations:
//! - [`SyntheticSource`] deterministic in-memory frames (tests, benchmarks)
//! - [`FfmpegSource`] local files and URLs via FFmpeg (feature: ffmpeg)
//! - [`DirectUrlResolver`] passes URLs straight through

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
mod resolver;
mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegSource;
pub use resolver::DirectUrlResolver;
pub use synthetic::{SyntheticSource, SyntheticVideo};

use crate::error::Result;
use crate::types::Frame;

/// An open video yielding RGB24 frames in source order
pub trait FrameStream {
    /// Next frame, or `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Opens video handles; shared by every worker
pub trait FrameSource: Send + Sync {
    /// Open a local path or resolved URL
    fn open(&self, handle: &str) -> Result<Box<dyn FrameStream>>;

    /// Short name for logs
    fn name(&self) -> &str {
        "source"
    }
}

/// A remote video made loadable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVideo {
    /// What to pass to [`FrameSource::open`]
    pub handle: String,
    /// Stable identifier used for the destination name
    pub name: String,
}

/// Resolves remote URLs
pub trait UrlResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<ResolvedVideo>;
}
