//! vidarena — parallel video-to-frame-batch reader
//!
//! Turns a collection of videos (local files or URLs) into batches of decoded,
//! resized frames. A pool of worker threads decodes in parallel and writes
//! straight into a fixed-size memory-mapped arena; a single reader drains it.
//! Memory use is bounded by the arena no matter how large the corpus is.
//!
//! # Features
//!
//! - **Arena**: first-fit allocation, compaction and lossy backpressure
//! - **Fair locking**: ticketed FIFO semaphore with timeouts and retry policies
//! - **Normalization**: aspect-preserving bicubic resize plus center crop
//! - **Sources**: FFmpeg decoding (feature `ffmpeg`) or deterministic synthetic
//!   frames
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vidarena::source::{SyntheticSource, SyntheticVideo};
//! use vidarena::{BatchCapacity, FrameReader, ReaderConfig, VideoReference};
//!
//! fn main() -> vidarena::Result<()> {
//!     let source = SyntheticSource::new().with_video("clip.mp4", SyntheticVideo::new(60, 640, 360));
//!     let config = ReaderConfig::default()
//!         .with_take_every_nth(2)
//!         .with_resize_size(112)
//!         .with_batch_capacity(BatchCapacity::Frames(8));
//!
//!     let reader = FrameReader::new(
//!         vec![VideoReference::new("clip.mp4")],
//!         config,
//!         Arc::new(source),
//!     )?;
//!     for batch in reader {
//!         let batch = batch?;
//!         println!("{} {:?} pad={}", batch.info.destination, batch.array.shape(), batch.info.pad_count);
//!     }
//!     Ok(())
//! }
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod processing;
pub mod producer;
pub mod reader;
pub mod source;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use arena::{ArenaConfig, ArenaHandle, ArenaState};
pub use config::ReaderConfig;
pub use error::{Error, Result};
pub use processing::{normalize, Normalizer};
pub use reader::{FrameReader, ReaderBuilder, ReaderState};
pub use sync::{FifoSemaphore, RetryPolicy};
pub use types::{
    Batch, BatchArray, BatchCapacity, BatchInfo, Frame, ReaderStats, Resolution, VideoLocation,
    VideoReference,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
