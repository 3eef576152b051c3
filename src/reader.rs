//! Worker pool orchestrator
//!
//! [`FrameReader`] shuffles and shards the references, runs one
//! [`BatchProducer`] per shard on its own thread and hands batches to the
//! caller through a blocking iterator over the shared arena.

use crate::arena::{ArenaConfig, ArenaHandle, ArenaSignal};
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::producer::BatchProducer;
use crate::source::{DirectUrlResolver, FrameSource, UrlResolver};
use crate::types::{Batch, ReaderStats, VideoReference, WorkerReport};
use crossbeam_channel::{Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Reader lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Arena allocated, no workers yet
    Created,
    /// Workers running
    Reading,
    /// Workers exited, arena still holds batches
    Draining,
    /// Arena empty and workers joined
    Done,
    /// Arena memory reclaimed
    Released,
}

impl std::fmt::Display for ReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReaderState::Created => "created",
            ReaderState::Reading => "reading",
            ReaderState::Draining => "draining",
            ReaderState::Done => "done",
            ReaderState::Released => "released",
        };
        f.write_str(name)
    }
}

/// Shuffle references, seeded when `seed` is set
pub fn shuffle_references(references: &mut [VideoReference], seed: Option<u64>) {
    match seed {
        Some(seed) => references.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => references.shuffle(&mut rand::thread_rng()),
    }
}

/// Split `items` into `workers` contiguous shards of near-equal size
pub fn partition<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let len = items.len();
    let mut iter = items.into_iter();
    (0..workers)
        .map(|i| {
            let take = len * (i + 1) / workers - len * i / workers;
            iter.by_ref().take(take).collect()
        })
        .collect()
}

/// Decrements the live-worker count and wakes the reader, even on panic
struct WorkerExit {
    alive: Arc<AtomicUsize>,
    signal: ArenaSignal,
}

impl WorkerExit {
    fn new(alive: Arc<AtomicUsize>, signal: ArenaSignal) -> Self {
        alive.fetch_add(1, Ordering::SeqCst);
        Self { alive, signal }
    }
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
        self.signal.notify();
    }
}

/// Builder for [`FrameReader`]
#[derive(Default)]
pub struct ReaderBuilder {
    references: Vec<VideoReference>,
    config: ReaderConfig,
    source: Option<Arc<dyn FrameSource>>,
    resolver: Option<Arc<dyn UrlResolver>>,
}

impl ReaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn references(mut self, references: impl IntoIterator<Item = VideoReference>) -> Self {
        self.references.extend(references);
        self
    }

    /// Add plain paths or URLs
    pub fn paths<S: AsRef<str>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.references
            .extend(paths.into_iter().map(VideoReference::new));
        self
    }

    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(mut self, source: Arc<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn UrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validate, shuffle, shard and allocate the arena
    pub fn build(self) -> Result<FrameReader> {
        self.config.validate()?;
        let source = match self.source {
            Some(source) => source,
            None => default_source()?,
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(DirectUrlResolver));

        let mut references = self.references;
        let total = references.len();
        shuffle_references(&mut references, self.config.shuffle_seed);
        let workers = self.config.resolved_workers().min(total.max(1));
        let shards = partition(references, workers);

        let arena = ArenaHandle::create(ArenaConfig::from(&self.config))?;

        tracing::debug!(
            videos = total,
            workers,
            arena_rows = arena.capacity(),
            "reader created"
        );

        Ok(FrameReader {
            config: self.config,
            shards,
            source,
            resolver,
            arena,
            state: ReaderState::Created,
            workers: Vec::new(),
            alive: Arc::new(AtomicUsize::new(0)),
            reports: None,
            stats: ReaderStats::default(),
        })
    }
}

#[cfg(feature = "ffmpeg")]
fn default_source() -> Result<Arc<dyn FrameSource>> {
    Ok(Arc::new(crate::source::FfmpegSource::new()?))
}

#[cfg(not(feature = "ffmpeg"))]
fn default_source() -> Result<Arc<dyn FrameSource>> {
    Err(Error::Config(
        "no frame source given and the `ffmpeg` feature is disabled".into(),
    ))
}

/// Parallel video reader yielding batches from the shared arena
///
/// Iteration starts the workers on first use. It blocks while the arena is
/// empty and a worker is alive, and ends once every worker has exited and the
/// arena is drained. With `auto_release` the arena is unlinked at that point.
pub struct FrameReader {
    config: ReaderConfig,
    shards: Vec<Vec<VideoReference>>,
    source: Arc<dyn FrameSource>,
    resolver: Arc<dyn UrlResolver>,
    arena: ArenaHandle,
    state: ReaderState,
    workers: Vec<JoinHandle<()>>,
    alive: Arc<AtomicUsize>,
    reports: Option<(Sender<WorkerReport>, Receiver<WorkerReport>)>,
    stats: ReaderStats,
}

impl FrameReader {
    /// Reader over `references` with the default URL resolver
    pub fn new(
        references: impl IntoIterator<Item = VideoReference>,
        config: ReaderConfig,
        source: Arc<dyn FrameSource>,
    ) -> Result<Self> {
        ReaderBuilder::new()
            .references(references)
            .config(config)
            .source(source)
            .build()
    }

    pub fn builder() -> ReaderBuilder {
        ReaderBuilder::new()
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn arena(&self) -> &ArenaHandle {
        &self.arena
    }

    /// Shards not yet handed to workers
    pub fn shards(&self) -> &[Vec<VideoReference>] {
        &self.shards
    }

    pub fn worker_count(&self) -> usize {
        self.shards.len().max(self.workers.len())
    }

    /// Counters so far; worker totals arrive with [`FrameReader::finish`]
    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    fn transition(&mut self, to: ReaderState) {
        tracing::debug!(from = %self.state, to = %to, "reader state");
        self.state = to;
    }

    /// Spawn one worker per shard
    pub fn start(&mut self) -> Result<()> {
        if self.state != ReaderState::Created {
            return Err(Error::InvalidState(format!(
                "start requires a created reader, reader is {}",
                self.state
            )));
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let shards = std::mem::take(&mut self.shards);
        let videos: usize = shards.iter().map(Vec::len).sum();

        for (worker_id, shard) in shards.into_iter().enumerate() {
            let producer = BatchProducer::new(
                worker_id,
                &self.config,
                Arc::clone(&self.source),
                Arc::clone(&self.resolver),
                self.arena.attach()?,
            );
            let exit = WorkerExit::new(Arc::clone(&self.alive), self.arena.signal());
            let tx = tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("vidarena-worker-{worker_id}"))
                .spawn(move || {
                    let _exit = exit;
                    let report = producer.run(shard);
                    if tx.send(report).is_err() {
                        tracing::warn!(worker_id, "reader gone, worker report lost");
                    }
                })?;
            self.workers.push(handle);
        }

        self.reports = Some((tx, rx));
        tracing::info!(
            workers = self.workers.len(),
            videos,
            segment = %self.arena.descriptor().name,
            "reader started"
        );
        self.transition(ReaderState::Reading);
        Ok(())
    }

    /// Join every worker and fold their reports into the stats
    pub fn finish(&mut self) -> Result<ReaderStats> {
        match self.state {
            ReaderState::Released => return Err(Error::AlreadyReleased),
            ReaderState::Done => return Ok(self.stats.clone()),
            ReaderState::Created => self.shards.clear(),
            ReaderState::Reading | ReaderState::Draining => {}
        }

        for handle in self.workers.drain(..) {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                tracing::error!(worker = ?name, "worker panicked");
            }
        }
        if let Some((tx, rx)) = self.reports.take() {
            drop(tx);
            for report in rx.try_iter() {
                self.stats.absorb(&report);
            }
        }

        if self.arena.is_empty() {
            self.transition(ReaderState::Done);
        } else {
            self.transition(ReaderState::Draining);
        }
        Ok(self.stats.clone())
    }

    /// Unlink the arena; valid once, from the done state
    pub fn release(&mut self) -> Result<()> {
        match self.state {
            ReaderState::Released => Err(Error::AlreadyReleased),
            ReaderState::Done => {
                self.arena.release()?;
                self.transition(ReaderState::Released);
                tracing::info!(
                    batches = self.stats.batches_read,
                    videos = self.stats.videos_processed,
                    failed = self.stats.videos_failed,
                    "reader released"
                );
                Ok(())
            }
            other => Err(Error::InvalidState(format!(
                "release requires a finished reader, reader is {other}"
            ))),
        }
    }

    /// Next batch, `None` at end of sequence
    pub fn next_batch(&mut self) -> Option<Result<Batch>> {
        match self.state {
            ReaderState::Released => {
                tracing::error!("iteration after the reader was released");
                return None;
            }
            ReaderState::Done => return None,
            ReaderState::Created => {
                if let Err(e) = self.start() {
                    return Some(Err(e));
                }
            }
            ReaderState::Reading | ReaderState::Draining => {}
        }

        let started = Instant::now();
        let deadline = self.config.read_timeout().map(|t| started + t);

        loop {
            let seen = self.arena.generation();
            let exited = self.alive.load(Ordering::SeqCst) == 0;
            match self.arena.try_get() {
                Ok(Some(batch)) => return Some(Ok(self.deliver(batch, exited))),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            if self.alive.load(Ordering::SeqCst) == 0 {
                // A final put may have landed between the pop and the check
                match self.arena.try_get() {
                    Ok(Some(batch)) => return Some(Ok(self.deliver(batch, true))),
                    Ok(None) => return self.end_of_sequence(),
                    Err(e) => return Some(Err(e)),
                }
            }

            if !self.arena.wait_for_change(seen, deadline) {
                return Some(Err(Error::Timeout(started.elapsed())));
            }
        }
    }

    fn deliver(&mut self, batch: Batch, workers_exited: bool) -> Batch {
        self.stats.batches_read += 1;
        if workers_exited && self.state == ReaderState::Reading {
            self.transition(ReaderState::Draining);
        }
        batch
    }

    fn end_of_sequence(&mut self) -> Option<Result<Batch>> {
        if let Err(e) = self.finish() {
            return Some(Err(e));
        }
        if self.config.auto_release && self.state == ReaderState::Done {
            if let Err(e) = self.release() {
                return Some(Err(e));
            }
        }
        None
    }
}

impl Iterator for FrameReader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        tracing::debug!(workers = self.workers.len(), "cancelling workers");
        self.arena.cancel();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().map(str::to_string);
            if handle.join().is_err() {
                tracing::error!(worker = ?name, "worker panicked during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("state", &self.state)
            .field("workers", &self.worker_count())
            .field("arena", &self.arena)
            .finish()
    }
}
