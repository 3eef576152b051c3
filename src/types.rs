//! Common types used throughout vidarena

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Bytes per RGB24 pixel
pub const CHANNELS: usize = 3;

/// Extension appended to destination names
pub const DESTINATION_EXT: &str = "npy";

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded RGB24 video frame, row-major, tightly packed (H×W×3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
}

impl Frame {
    /// Create a black frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * CHANNELS],
            width,
            height,
        }
    }

    /// Create a frame from existing data, checking the buffer length
    pub fn from_data(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if width == 0 || height == 0 {
            return Err(Error::InvalidFrame(format!("empty frame {width}x{height}")));
        }
        if data.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "{width}x{height} frame needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Get resolution
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// RGB value at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Where a video lives, decided once when the reference is created
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoLocation {
    /// File on the local filesystem
    LocalPath(PathBuf),
    /// Network-hosted video that goes through a URL resolver
    RemoteUrl(String),
}

impl VideoLocation {
    /// Classify a raw path-or-URL string
    pub fn parse(raw: &str) -> Self {
        match url::Url::parse(raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                VideoLocation::RemoteUrl(raw.to_string())
            }
            _ => VideoLocation::LocalPath(PathBuf::from(raw)),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, VideoLocation::RemoteUrl(_))
    }
}

impl std::fmt::Display for VideoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoLocation::LocalPath(path) => write!(f, "{}", path.display()),
            VideoLocation::RemoteUrl(url) => write!(f, "{url}"),
        }
    }
}

/// A caller-supplied video plus optional correlation token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoReference {
    pub location: VideoLocation,
    pub token: Option<String>,
}

impl VideoReference {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self {
            location: VideoLocation::parse(raw.as_ref()),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Correlation token, falling back to the reference itself
    pub fn correlation(&self) -> String {
        self.token
            .clone()
            .unwrap_or_else(|| self.location.to_string())
    }
}

impl std::fmt::Display for VideoReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.location)
    }
}

/// Destination name for a local video: `dir/clip.mp4` -> `clip.npy`
pub fn destination_for_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    format!("{stem}.{DESTINATION_EXT}")
}

/// How many frames make up one arena row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchCapacity {
    /// Whole video as one (frames, S, S, 3) item
    #[default]
    Unbounded,
    /// Zero-padded groups of B frames, (groups, B, S, S, 3)
    Frames(usize),
}

impl BatchCapacity {
    /// Frames per arena row
    pub fn frames_per_row(&self) -> usize {
        match self {
            BatchCapacity::Unbounded => 1,
            BatchCapacity::Frames(b) => (*b).max(1),
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, BatchCapacity::Frames(_))
    }
}

/// A decoded batch array: a flat byte buffer plus its shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchArray {
    data: Vec<u8>,
    dims: Vec<usize>,
}

impl BatchArray {
    /// Build an array, checking that `dims` describes `data`
    pub fn from_shape(dims: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(Error::Internal(format!(
                "shape {dims:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { data, dims })
    }

    /// Shape, e.g. `[frames, S, S, 3]` or `[groups, B, S, S, 3]`
    pub fn shape(&self) -> &[usize] {
        &self.dims
    }

    /// Size of the leading dimension
    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Bytes per leading-dimension row
    pub fn row_bytes(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Total frames including padding
    pub fn frame_count(&self) -> usize {
        let frame_bytes: usize = self.dims.iter().rev().take(3).product();
        if frame_bytes == 0 {
            0
        } else {
            self.data.len() / frame_bytes
        }
    }

    /// Bytes of the `index`-th frame, counting across groups
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        let frame_bytes: usize = self.dims.iter().rev().take(3).product();
        let start = index.checked_mul(frame_bytes)?;
        self.data.get(start..start + frame_bytes)
    }

    /// Rows `range` as a new array with the same trailing shape
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.rows() {
            return Err(Error::Internal(format!(
                "row range {range:?} out of bounds for {} rows",
                self.rows()
            )));
        }
        let row_bytes = self.row_bytes();
        let mut dims = self.dims.clone();
        dims[0] = range.len();
        Ok(Self {
            data: self.data[range.start * row_bytes..range.end * row_bytes].to_vec(),
            dims,
        })
    }

    /// Split a block of rows into per-video arrays by named row ranges
    pub fn split(&self, ranges: &BTreeMap<String, Range<usize>>) -> Result<BTreeMap<String, Self>> {
        ranges
            .iter()
            .map(|(name, range)| Ok((name.clone(), self.slice_rows(range.clone())?)))
            .collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Metadata that travels with every batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Caller correlation token (or the reference when none was given)
    pub token: String,
    /// Destination name derived from the reference
    pub destination: String,
    /// Synthetic zero frames at the end of this item
    pub pad_count: usize,
    /// Part index when an oversized item was split
    pub part: usize,
    /// Total parts for the item
    pub parts: usize,
}

impl BatchInfo {
    pub fn new(token: impl Into<String>, destination: impl Into<String>, pad_count: usize) -> Self {
        Self {
            token: token.into(),
            destination: destination.into(),
            pad_count,
            part: 0,
            parts: 1,
        }
    }

    pub fn is_last_part(&self) -> bool {
        self.part + 1 == self.parts
    }
}

/// One item popped from the arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub array: BatchArray,
    pub info: BatchInfo,
}

impl Batch {
    pub fn into_parts(self) -> (BatchArray, BatchInfo) {
        (self.array, self.info)
    }

    /// Real (non-padding) frames in this item
    pub fn real_frames(&self) -> usize {
        self.array.frame_count().saturating_sub(self.info.pad_count)
    }
}

/// Counters reported by one worker when it exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub videos_processed: u64,
    pub videos_failed: u64,
    pub frames_kept: u64,
    pub batches_written: u64,
    pub batches_dropped: u64,
}

/// Statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Videos that produced output
    pub videos_processed: u64,
    /// Videos skipped after an open/decode failure
    pub videos_failed: u64,
    /// Frames kept after stride subsampling
    pub frames_kept: u64,
    /// Arena writes that succeeded
    pub batches_written: u64,
    /// Arena writes dropped after exhausting retries
    pub batches_dropped: u64,
    /// Items handed to the caller
    pub batches_read: u64,
}

impl ReaderStats {
    pub fn absorb(&mut self, report: &WorkerReport) {
        self.videos_processed += report.videos_processed;
        self.videos_failed += report.videos_failed;
        self.frames_kept += report.frames_kept;
        self.batches_written += report.batches_written;
        self.batches_dropped += report.batches_dropped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_classification() {
        assert_eq!(
            VideoLocation::parse("tests/videos/vid1.mp4"),
            VideoLocation::LocalPath(PathBuf::from("tests/videos/vid1.mp4"))
        );
        assert!(VideoLocation::parse("https://www.youtube.com/watch?v=EKtBQbK4IX0").is_remote());
        assert!(!VideoLocation::parse("/abs/clip.webm").is_remote());
        assert!(!VideoLocation::parse("file:///abs/clip.mp4").is_remote());
    }

    #[test]
    fn test_destination_name() {
        assert_eq!(destination_for_path(Path::new("a/b/vid1.mp4")), "vid1.npy");
        assert_eq!(destination_for_path(Path::new("clip")), "clip.npy");
    }

    #[test]
    fn test_frame_validation() {
        assert!(Frame::from_data(vec![0; 12], 2, 2).is_ok());
        assert!(Frame::from_data(vec![0; 11], 2, 2).is_err());
        assert!(Frame::from_data(vec![], 0, 2).is_err());
    }

    #[test]
    fn test_batch_array_geometry() {
        let array = BatchArray::from_shape(vec![3, 2, 4, 4, 3], vec![7; 3 * 2 * 4 * 4 * 3]).unwrap();
        assert_eq!(array.rows(), 3);
        assert_eq!(array.row_bytes(), 2 * 4 * 4 * 3);
        assert_eq!(array.frame_count(), 6);
        assert_eq!(array.frame(5).map(|f| f.len()), Some(48));
        assert!(array.frame(6).is_none());
        assert!(BatchArray::from_shape(vec![2, 2], vec![0; 3]).is_err());
    }

    #[test]
    fn test_split_by_ranges() {
        let data: Vec<u8> = (0..5u8).flat_map(|i| vec![i; 12]).collect();
        let block = BatchArray::from_shape(vec![5, 2, 2, 3], data).unwrap();

        let mut ranges = BTreeMap::new();
        ranges.insert("a.npy".to_string(), 0..2);
        ranges.insert("b.npy".to_string(), 2..5);
        let parts = block.split(&ranges).unwrap();

        assert_eq!(parts["a.npy"].shape(), &[2, 2, 2, 3]);
        assert_eq!(parts["b.npy"].shape(), &[3, 2, 2, 3]);
        assert_eq!(parts["b.npy"].frame(0).unwrap()[0], 2);

        ranges.insert("c.npy".to_string(), 4..6);
        assert!(block.split(&ranges).is_err());
    }

    #[test]
    fn test_real_frames_excludes_padding() {
        let array = BatchArray::from_shape(vec![6, 5, 1, 1, 3], vec![0; 90]).unwrap();
        let batch = Batch {
            array,
            info: BatchInfo::new("t", "vid1.npy", 2),
        };
        assert_eq!(batch.real_frames(), 28);
    }
}
