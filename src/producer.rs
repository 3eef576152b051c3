//! Batch producer
//!
//! One producer runs per worker thread. For each reference in its shard it
//! decodes, subsamples, normalizes and frames the video into a batch, then
//! pushes the batch into the arena. A failing video is logged and skipped.

use crate::arena::ArenaHandle;
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::processing::Normalizer;
use crate::source::{FrameSource, UrlResolver};
use crate::types::{
    destination_for_path, BatchArray, BatchCapacity, BatchInfo, VideoLocation, VideoReference,
    WorkerReport, CHANNELS, DESTINATION_EXT,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

/// Frames of one video after subsampling and normalization
#[derive(Debug, Clone)]
pub struct DecodedVideo {
    /// `frames` packed S×S×3 frames
    pub data: Vec<u8>,
    pub frames: usize,
    /// Raw frames pulled from the source
    pub raw_frames: usize,
}

/// Pack `frames` normalized frames into a batch array
///
/// Unbounded capacity yields `(frames, S, S, 3)`. A capacity of B zero-pads to
/// a multiple of B and yields `(groups, B, S, S, 3)`; the second value is the
/// number of padding frames.
pub fn frame_batch(
    mut data: Vec<u8>,
    frames: usize,
    size: u32,
    capacity: BatchCapacity,
) -> Result<(BatchArray, usize)> {
    let side = size as usize;
    match capacity {
        BatchCapacity::Unbounded => {
            let array = BatchArray::from_shape(vec![frames, side, side, CHANNELS], data)?;
            Ok((array, 0))
        }
        BatchCapacity::Frames(group) => {
            let group = group.max(1);
            let groups = frames.div_ceil(group);
            let pad = groups * group - frames;
            data.resize(groups * group * side * side * CHANNELS, 0);
            let array = BatchArray::from_shape(vec![groups, group, side, side, CHANNELS], data)?;
            Ok((array, pad))
        }
    }
}

/// Shuffle a worker's shard with a seed derived from its id
pub fn shuffle_shard(shard: &mut [VideoReference], worker_id: usize) {
    let mut rng = StdRng::seed_from_u64(worker_id as u64);
    shard.shuffle(&mut rng);
}

/// Turns references into arena batches for one worker
pub struct BatchProducer {
    worker_id: usize,
    take_every_nth: usize,
    resize_size: u32,
    batch_capacity: BatchCapacity,
    source: Arc<dyn FrameSource>,
    resolver: Arc<dyn UrlResolver>,
    arena: ArenaHandle,
    report: WorkerReport,
}

impl BatchProducer {
    pub fn new(
        worker_id: usize,
        config: &ReaderConfig,
        source: Arc<dyn FrameSource>,
        resolver: Arc<dyn UrlResolver>,
        arena: ArenaHandle,
    ) -> Self {
        Self {
            worker_id,
            take_every_nth: config.take_every_nth.max(1),
            resize_size: config.resize_size,
            batch_capacity: config.batch_capacity,
            source,
            resolver,
            arena,
            report: WorkerReport {
                worker_id,
                ..Default::default()
            },
        }
    }

    /// Process a whole shard, returning the worker's counters
    pub fn run(mut self, mut shard: Vec<VideoReference>) -> WorkerReport {
        shuffle_shard(&mut shard, self.worker_id);
        tracing::info!(
            worker = self.worker_id,
            videos = shard.len(),
            source = self.source.name(),
            "worker started"
        );

        for reference in &shard {
            if self.arena.is_cancelled() {
                tracing::debug!(worker = self.worker_id, "worker cancelled");
                break;
            }

            match self.process(reference) {
                Ok(()) => self.report.videos_processed += 1,
                Err(Error::AlreadyReleased) => {
                    tracing::error!(worker = self.worker_id, "arena released under a running worker");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    self.report.videos_failed += 1;
                    tracing::warn!(worker = self.worker_id, video = %reference, "skipping video: {}", e);
                }
                Err(e) => {
                    self.report.videos_failed += 1;
                    tracing::error!(worker = self.worker_id, video = %reference, "failed to store video: {}", e);
                }
            }
        }

        tracing::debug!(
            worker = self.worker_id,
            processed = self.report.videos_processed,
            failed = self.report.videos_failed,
            "worker finished"
        );
        self.report
    }

    /// Decode one reference and push its batch
    pub fn process(&mut self, reference: &VideoReference) -> Result<()> {
        let (handle, destination) = self.locate(reference)?;
        let decoded = self.decode(&handle)?;
        if decoded.frames == 0 {
            return Err(Error::EmptyVideo(format!(
                "{reference} ({} raw frames)",
                decoded.raw_frames
            )));
        }
        self.report.frames_kept += decoded.frames as u64;

        let (array, pad_count) = frame_batch(
            decoded.data,
            decoded.frames,
            self.resize_size,
            self.batch_capacity,
        )?;
        let info = BatchInfo::new(reference.correlation(), destination, pad_count);

        let outcome = self.arena.put(&array, &info)?;
        self.report.batches_written += outcome.written as u64;
        self.report.batches_dropped += outcome.dropped as u64;

        tracing::debug!(
            worker = self.worker_id,
            video = %reference,
            frames = decoded.frames,
            shape = ?array.shape(),
            pad_count,
            "video stored"
        );
        Ok(())
    }

    /// Source handle and destination name for a reference
    fn locate(&self, reference: &VideoReference) -> Result<(String, String)> {
        match &reference.location {
            VideoLocation::LocalPath(path) => Ok((
                path.to_string_lossy().into_owned(),
                destination_for_path(path),
            )),
            VideoLocation::RemoteUrl(url) => {
                let resolved = self.resolver.resolve(url)?;
                let destination = format!("{}.{DESTINATION_EXT}", resolved.name);
                Ok((resolved.handle, destination))
            }
        }
    }

    /// Pull every frame, keep each `take_every_nth`, normalize the kept ones
    fn decode(&self, handle: &str) -> Result<DecodedVideo> {
        let mut stream = self.source.open(handle)?;
        let mut normalizer = Normalizer::new(self.resize_size);
        let frame_bytes = self.resize_size as usize * self.resize_size as usize * CHANNELS;

        let mut data = Vec::new();
        let mut frames = 0;
        let mut raw_frames = 0;
        while let Some(frame) = stream.next_frame()? {
            if raw_frames % self.take_every_nth == 0 {
                let normalized = normalizer.normalize(&frame)?;
                debug_assert_eq!(normalized.data.len(), frame_bytes);
                data.extend_from_slice(&normalized.data);
                frames += 1;
            }
            raw_frames += 1;
        }

        Ok(DecodedVideo {
            data,
            frames,
            raw_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaConfig;
    use crate::source::{DirectUrlResolver, SyntheticSource, SyntheticVideo};
    use std::time::Duration;

    fn setup(
        dir: &tempfile::TempDir,
        config: &ReaderConfig,
        source: SyntheticSource,
    ) -> (ArenaHandle, BatchProducer) {
        let arena_config = ArenaConfig::from(config)
            .with_segment_dir(dir.path())
            .with_put_retries(2, Duration::from_millis(10));
        let reader = ArenaHandle::create(arena_config).unwrap();
        let producer = BatchProducer::new(
            0,
            config,
            Arc::new(source),
            Arc::new(DirectUrlResolver),
            reader.attach().unwrap(),
        );
        (reader, producer)
    }

    #[test]
    fn test_frame_batch_pads_last_group() {
        let frame = 2 * 2 * 3;
        let (array, pad) =
            frame_batch(vec![1; 28 * frame], 28, 2, BatchCapacity::Frames(5)).unwrap();
        assert_eq!(array.shape(), &[6, 5, 2, 2, 3]);
        assert_eq!(pad, 2);
        assert!(array.frame(27).unwrap().iter().all(|b| *b == 1));
        assert!(array.frame(28).unwrap().iter().all(|b| *b == 0));
        assert!(array.frame(29).unwrap().iter().all(|b| *b == 0));

        let (exact, pad) = frame_batch(vec![1; 10 * frame], 10, 2, BatchCapacity::Frames(5)).unwrap();
        assert_eq!(exact.shape(), &[2, 5, 2, 2, 3]);
        assert_eq!(pad, 0);
    }

    #[test]
    fn test_frame_batch_unbounded() {
        let (array, pad) = frame_batch(vec![0; 7 * 12], 7, 2, BatchCapacity::Unbounded).unwrap();
        assert_eq!(array.shape(), &[7, 2, 2, 3]);
        assert_eq!(pad, 0);
    }

    #[test]
    fn test_shard_shuffle_is_seeded_by_worker() {
        let shard: Vec<_> = (0..20).map(|i| VideoReference::new(format!("v{i}.mp4"))).collect();
        let mut a = shard.clone();
        let mut b = shard.clone();
        let mut c = shard.clone();
        shuffle_shard(&mut a, 3);
        shuffle_shard(&mut b, 3);
        shuffle_shard(&mut c, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut sorted = a.clone();
        sorted.sort_by_key(|r| r.to_string());
        let mut expected = shard;
        expected.sort_by_key(|r| r.to_string());
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_stride_and_shape() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReaderConfig::default()
            .with_take_every_nth(2)
            .with_resize_size(8)
            .with_memory_budget(8 * 8 * 3 * 400);
        let source = SyntheticSource::new().with_video("clips/a.mp4", SyntheticVideo::new(7, 16, 12));
        let (mut reader, mut producer) = setup(&dir, &config, source);

        producer
            .process(&VideoReference::new("clips/a.mp4").with_token("id-a"))
            .unwrap();
        let batch = reader.try_get().unwrap().unwrap();
        // Frames 0, 2, 4 and 6 survive the stride
        assert_eq!(batch.array.shape(), &[4, 8, 8, 3]);
        assert_eq!(batch.info.token, "id-a");
        assert_eq!(batch.info.destination, "a.npy");
        assert_eq!(batch.info.pad_count, 0);
    }

    #[test]
    fn test_remote_reference_uses_resolved_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReaderConfig::default()
            .with_resize_size(4)
            .with_memory_budget(4 * 4 * 3 * 100);
        let url = "https://www.youtube.com/watch?v=abc123";
        let source = SyntheticSource::new().with_video(url, SyntheticVideo::new(3, 8, 8));
        let (mut reader, mut producer) = setup(&dir, &config, source);

        producer.process(&VideoReference::new(url)).unwrap();
        let batch = reader.try_get().unwrap().unwrap();
        assert_eq!(batch.info.destination, "abc123.npy");
        assert_eq!(batch.info.token, url);
    }

    #[test]
    fn test_failures_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReaderConfig::default()
            .with_resize_size(4)
            .with_memory_budget(4 * 4 * 3 * 100);
        let source = SyntheticSource::new()
            .with_video("good.mp4", SyntheticVideo::new(3, 8, 8))
            .with_video("empty.mp4", SyntheticVideo::new(0, 8, 8))
            .with_video("corrupt.mp4", SyntheticVideo::new(9, 8, 8).with_fail_at(4));
        let (mut reader, producer) = setup(&dir, &config, source);

        let shard = ["good.mp4", "missing.mp4", "empty.mp4", "corrupt.mp4"]
            .into_iter()
            .map(VideoReference::new)
            .collect();
        let report = producer.run(shard);
        assert_eq!(report.videos_processed, 1);
        assert_eq!(report.videos_failed, 3);
        assert_eq!(report.batches_written, 1);
        assert_eq!(report.frames_kept, 3);

        let batch = reader.try_get().unwrap().unwrap();
        assert_eq!(batch.info.destination, "good.npy");
        assert!(reader.try_get().unwrap().is_none());
    }
}
