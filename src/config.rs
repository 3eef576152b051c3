//! Configuration types for vidarena

use crate::error::{Error, Result};
use crate::types::{BatchCapacity, VideoReference, CHANNELS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default shared memory budget: 4 GiB
pub const DEFAULT_MEMORY_BUDGET: u64 = 4 * 1024 * 1024 * 1024;

/// Default output frame side
pub const DEFAULT_RESIZE_SIZE: u32 = 224;

/// Reader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Keep frames whose index is a multiple of this stride
    pub take_every_nth: usize,
    /// Output frame side in pixels
    pub resize_size: u32,
    /// Frames per emitted group
    pub batch_capacity: BatchCapacity,
    /// Worker count (None = usable CPUs)
    pub workers: Option<usize>,
    /// Arena size in bytes
    pub memory_budget: u64,
    /// Seed for the reference shuffle (None = random)
    pub shuffle_seed: Option<u64>,
    /// Finish and release automatically when iteration ends
    pub auto_release: bool,
    /// Iterator timeout in milliseconds (None = block)
    pub read_timeout_ms: Option<u64>,
    /// Arena put attempts before a batch is dropped
    pub put_retries: u32,
    /// Wait between arena put attempts in milliseconds
    pub put_backoff_ms: u64,
    /// Coverage fraction that triggers defragmentation
    pub defrag_high_water: f64,
    /// Directory for the arena segment (None = /dev/shm or temp dir)
    pub segment_dir: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            take_every_nth: 1,
            resize_size: DEFAULT_RESIZE_SIZE,
            batch_capacity: BatchCapacity::Unbounded,
            workers: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            shuffle_seed: None,
            auto_release: true,
            read_timeout_ms: None,
            put_retries: 12,
            put_backoff_ms: 5_000,
            defrag_high_water: 0.75,
            segment_dir: None,
        }
    }
}

impl ReaderConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn with_take_every_nth(mut self, nth: usize) -> Self {
        self.take_every_nth = nth;
        self
    }

    pub fn with_resize_size(mut self, size: u32) -> Self {
        self.resize_size = size;
        self
    }

    pub fn with_batch_capacity(mut self, capacity: BatchCapacity) -> Self {
        self.batch_capacity = capacity;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn with_auto_release(mut self, auto_release: bool) -> Self {
        self.auto_release = auto_release;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_put_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.put_retries = retries;
        self.put_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_defrag_high_water(mut self, fraction: f64) -> Self {
        self.defrag_high_water = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_segment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.segment_dir = Some(dir.into());
        self
    }

    /// Check values that would make the reader unusable
    pub fn validate(&self) -> Result<()> {
        if self.take_every_nth == 0 {
            return Err(Error::Config("take_every_nth must be at least 1".into()));
        }
        if self.resize_size == 0 {
            return Err(Error::Config("resize_size must be at least 1".into()));
        }
        if self.batch_capacity == BatchCapacity::Frames(0) {
            return Err(Error::Config("batch capacity must be at least 1 frame".into()));
        }
        if self.workers == Some(0) {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.defrag_high_water) {
            return Err(Error::Config("defrag_high_water must be within 0..=1".into()));
        }
        if self.arena_rows() == 0 {
            return Err(Error::Config(format!(
                "memory budget of {} bytes holds no {} byte row",
                self.memory_budget,
                self.row_bytes()
            )));
        }
        Ok(())
    }

    /// Bytes of one normalized frame
    pub fn frame_bytes(&self) -> usize {
        self.resize_size as usize * self.resize_size as usize * CHANNELS
    }

    /// Bytes of one arena row (a frame, or a group of frames)
    pub fn row_bytes(&self) -> usize {
        self.frame_bytes() * self.batch_capacity.frames_per_row()
    }

    /// Arena capacity in rows for the memory budget
    pub fn arena_rows(&self) -> usize {
        (self.memory_budget / self.row_bytes() as u64) as usize
    }

    /// Worker count after applying the CPU default
    pub fn resolved_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn put_backoff(&self) -> Duration {
        Duration::from_millis(self.put_backoff_ms)
    }
}

/// Read newline-separated paths or URLs, skipping blank lines
pub fn references_from_list_file(path: impl AsRef<Path>) -> Result<Vec<VideoReference>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(VideoReference::new)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_bytes(), 224 * 224 * 3);
        assert_eq!(config.put_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_arena_geometry() {
        let config = ReaderConfig::default()
            .with_resize_size(100)
            .with_batch_capacity(BatchCapacity::Frames(5))
            .with_memory_budget(100 * 100 * 3 * 5 * 10 + 17);
        assert_eq!(config.row_bytes(), 150_000);
        assert_eq!(config.arena_rows(), 10);
    }

    #[test]
    fn test_rejects_unusable_values() {
        assert!(ReaderConfig::default().with_take_every_nth(0).validate().is_err());
        assert!(ReaderConfig::default().with_workers(0).validate().is_err());
        assert!(ReaderConfig::default()
            .with_batch_capacity(BatchCapacity::Frames(0))
            .validate()
            .is_err());
        assert!(ReaderConfig::default().with_memory_budget(10).validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = ReaderConfig::from_toml_str(
            r#"
            take_every_nth = 2
            resize_size = 100
            workers = 3
            memory_budget = 134217728
            batch_capacity = { frames = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(config.take_every_nth, 2);
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.batch_capacity, BatchCapacity::Frames(5));
        assert!(config.auto_release);

        let unbounded = ReaderConfig::from_toml_str("batch_capacity = \"unbounded\"").unwrap();
        assert_eq!(unbounded.batch_capacity, BatchCapacity::Unbounded);

        assert!(ReaderConfig::from_toml_str("take_every_nth = 0").is_err());
    }

    #[test]
    fn test_list_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "videos/vid1.mp4").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "https://www.youtube.com/watch?v=EKtBQbK4IX0").unwrap();

        let refs = references_from_list_file(file.path()).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(!refs[0].location.is_remote());
        assert!(refs[1].location.is_remote());
    }
}
