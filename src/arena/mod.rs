//! Shared batch arena
//!
//! A fixed-capacity, memory-mapped ring of batch payloads with one reader and
//! many writers. The arena is measured in rows: one frame for unbounded
//! batches, one group of B frames otherwise. Every participant holds its own
//! [`ArenaHandle`] with a private mapping of the same segment; the index, the
//! FIFO lock and the change notification are shared.
//!
//! Writes go allocate, copy, insert and reads go copy, free. Both run inside
//! the FIFO critical section, so a reader never sees a partially written
//! batch.

mod index;
mod segment;

pub use index::{ArenaIndex, ArenaSlot, ArenaState, Reservation, SlotMove};
pub use segment::{default_segment_dir, ArenaSegment, SegmentDescriptor, SEGMENT_PREFIX};

use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::sync::{FifoSemaphore, RetryPolicy};
use crate::types::{Batch, BatchArray, BatchInfo};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Arena tunables
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Capacity in rows
    pub rows: usize,
    /// Bytes per row
    pub row_bytes: usize,
    /// Backoff windows a blocked write waits before it is dropped
    pub put_retries: u32,
    /// Length of one backoff window
    pub put_backoff: Duration,
    /// Coverage fraction above which a blocked write compacts the arena
    pub high_water: f64,
    /// Wait limit for the FIFO lock; `None` waits forever
    pub lock_timeout: Option<Duration>,
    /// Where the segment file is created
    pub segment_dir: Option<PathBuf>,
}

impl ArenaConfig {
    pub fn new(rows: usize, row_bytes: usize) -> Self {
        Self {
            rows,
            row_bytes,
            put_retries: 12,
            put_backoff: Duration::from_secs(5),
            high_water: 0.75,
            lock_timeout: None,
            segment_dir: None,
        }
    }

    pub fn with_put_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.put_retries = retries;
        self.put_backoff = backoff;
        self
    }

    pub fn with_high_water(mut self, fraction: f64) -> Self {
        self.high_water = fraction;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_segment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.segment_dir = Some(dir.into());
        self
    }

    /// Largest item written in one piece
    pub fn max_item_rows(&self) -> usize {
        (self.rows / 4).max(1)
    }
}

impl From<&ReaderConfig> for ArenaConfig {
    fn from(config: &ReaderConfig) -> Self {
        let mut arena = Self::new(config.arena_rows(), config.row_bytes())
            .with_put_retries(config.put_retries, config.put_backoff())
            .with_high_water(config.defrag_high_water);
        arena.segment_dir = config.segment_dir.clone();
        arena
    }
}

/// How a [`ArenaHandle::put`] went
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOutcome {
    /// Parts stored in the arena
    pub written: usize,
    /// Parts dropped after exhausting retries or on cancellation
    pub dropped: usize,
}

impl PutOutcome {
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }

    fn record(&mut self, stored: bool) {
        if stored {
            self.written += 1;
        } else {
            self.dropped += 1;
        }
    }
}

/// State shared by every handle of one arena
struct ArenaShared {
    descriptor: SegmentDescriptor,
    config: ArenaConfig,
    lock: FifoSemaphore,
    index: Mutex<ArenaIndex>,
    generation: Mutex<u64>,
    changed: Condvar,
    cancelled: AtomicBool,
    released: AtomicBool,
}

impl ArenaShared {
    fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.changed.notify_all();
    }
}

/// Wakes arena waiters without mapping the segment
#[derive(Clone)]
pub struct ArenaSignal {
    shared: Arc<ArenaShared>,
}

impl ArenaSignal {
    pub fn notify(&self) {
        self.shared.notify();
    }
}

/// One participant's view of the arena
pub struct ArenaHandle {
    shared: Arc<ArenaShared>,
    segment: ArenaSegment,
    owner: bool,
}

impl ArenaHandle {
    /// Create a new arena; the returned handle owns the segment
    pub fn create(config: ArenaConfig) -> Result<Self> {
        if config.rows == 0 {
            return Err(Error::ArenaCapacity {
                requested: 1,
                capacity: 0,
            });
        }
        let segment = ArenaSegment::create(
            config.segment_dir.as_deref(),
            config.rows,
            config.row_bytes,
        )?;
        let descriptor = segment.descriptor().clone();

        tracing::info!(
            segment = %descriptor.name,
            rows = descriptor.rows,
            row_bytes = descriptor.row_bytes,
            "arena created"
        );

        let shared = Arc::new(ArenaShared {
            index: Mutex::new(ArenaIndex::new(config.rows, config.high_water)),
            lock: FifoSemaphore::mutex(),
            generation: Mutex::new(0),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            released: AtomicBool::new(false),
            descriptor,
            config,
        });

        Ok(Self {
            shared,
            segment,
            owner: true,
        })
    }

    /// Another participant's handle, mapping the same segment
    ///
    /// The index and locks are shared through this handle, not stored in the
    /// segment, so peers must live in the same process.
    pub fn attach(&self) -> Result<Self> {
        if self.is_released() {
            return Err(Error::AlreadyReleased);
        }
        let segment = ArenaSegment::attach(&self.shared.descriptor)?;
        Ok(Self {
            shared: Arc::clone(&self.shared),
            segment,
            owner: false,
        })
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.shared.descriptor
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.shared.config
    }

    /// Capacity in rows
    pub fn capacity(&self) -> usize {
        self.shared.descriptor.rows
    }

    /// Items currently stored
    pub fn len(&self) -> usize {
        self.shared.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.lock().is_empty()
    }

    pub fn state(&self) -> ArenaState {
        self.shared.index.lock().state()
    }

    /// Copy of the index, for inspection
    pub fn snapshot(&self) -> ArenaIndex {
        self.shared.index.lock().clone()
    }

    /// Counter bumped on every put, get, cancel and explicit notify
    pub fn generation(&self) -> u64 {
        *self.shared.generation.lock()
    }

    /// Wake everyone waiting on a change
    pub fn notify(&self) {
        self.shared.notify();
    }

    pub fn signal(&self) -> ArenaSignal {
        ArenaSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block until the generation moves past `seen` or `deadline` passes
    ///
    /// Returns `true` if a change was observed.
    pub fn wait_for_change(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut generation = self.shared.generation.lock();
        while *generation == seen {
            match deadline {
                None => self.shared.changed.wait(&mut generation),
                Some(at) => {
                    if self.shared.changed.wait_until(&mut generation, at).timed_out() {
                        return *generation != seen;
                    }
                }
            }
        }
        true
    }

    /// Tell blocked writers to give up
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Store a batch, splitting it if it exceeds a quarter of the arena
    ///
    /// Each part waits up to `put_retries` backoff windows for space. Parts
    /// that never fit are dropped with a warning; only the final part carries
    /// the pad count.
    pub fn put(&mut self, array: &BatchArray, info: &BatchInfo) -> Result<PutOutcome> {
        if self.is_released() {
            return Err(Error::AlreadyReleased);
        }
        if array.rows() == 0 {
            return Err(Error::InvalidFrame(format!(
                "empty batch for {}",
                info.destination
            )));
        }
        if array.row_bytes() != self.shared.descriptor.row_bytes {
            return Err(Error::InvalidFrame(format!(
                "batch rows are {} bytes, arena rows are {}",
                array.row_bytes(),
                self.shared.descriptor.row_bytes
            )));
        }

        let max_rows = self.shared.config.max_item_rows();
        let rows = array.rows();
        let mut outcome = PutOutcome::default();

        if rows <= max_rows {
            outcome.record(self.put_part(array, info.clone())?);
            return Ok(outcome);
        }

        let parts = rows.div_ceil(max_rows);
        tracing::debug!(
            destination = %info.destination,
            rows,
            parts,
            "splitting oversized batch"
        );
        for part in 0..parts {
            let range = part * max_rows..((part + 1) * max_rows).min(rows);
            let chunk = array.slice_rows(range)?;
            let chunk_info = BatchInfo {
                pad_count: if part + 1 == parts { info.pad_count } else { 0 },
                part,
                parts,
                ..info.clone()
            };
            outcome.record(self.put_part(&chunk, chunk_info)?);
        }
        Ok(outcome)
    }

    fn put_part(&mut self, array: &BatchArray, info: BatchInfo) -> Result<bool> {
        let retries = self.shared.config.put_retries;
        let backoff = self.shared.config.put_backoff;
        let mut attempts = 0u32;
        let mut window_end = Instant::now() + backoff;
        let mut info = Some(info);

        loop {
            let seen = self.generation();
            if self.is_cancelled() {
                return Ok(false);
            }
            if let Some(pending) = info.take() {
                match self.try_put(array, pending)? {
                    None => return Ok(true),
                    Some(returned) => info = Some(returned),
                }
            }

            if attempts >= retries {
                if let Some(info) = &info {
                    tracing::warn!(
                        destination = %info.destination,
                        token = %info.token,
                        part = info.part,
                        rows = array.rows(),
                        timestamp = ?std::time::SystemTime::now(),
                        "no arena space after {} retries, dropping batch; increase the memory budget",
                        retries
                    );
                }
                return Ok(false);
            }

            let changed = self.wait_for_change(seen, Some(window_end));
            if !changed || Instant::now() >= window_end {
                attempts += 1;
                window_end = Instant::now() + backoff;
            }
        }
    }

    /// One allocation attempt; gives `info` back when the arena is blocked
    fn try_put(&mut self, array: &BatchArray, info: BatchInfo) -> Result<Option<BatchInfo>> {
        let permit =
            self.shared
                .lock
                .acquire(1, self.shared.config.lock_timeout, RetryPolicy::None)?;
        let mut index = self.shared.index.lock();

        let reservation = index.allocate(array.rows())?;
        for mv in &reservation.moves {
            self.segment.move_rows(mv.from, mv.to, mv.rows);
        }
        let Some(grant) = reservation.grant else {
            return Ok(Some(info));
        };

        self.segment.write_rows(grant.start, array.as_bytes());
        index.insert(grant, info, array.shape().to_vec())?;
        drop(index);
        permit.release();

        self.shared.notify();
        Ok(None)
    }

    /// Pop the oldest batch without waiting
    pub fn try_get(&mut self) -> Result<Option<Batch>> {
        self.try_get_within(self.shared.config.lock_timeout)
    }

    fn try_get_within(&mut self, lock_timeout: Option<Duration>) -> Result<Option<Batch>> {
        if self.is_released() {
            return Err(Error::AlreadyReleased);
        }
        let permit = self
            .shared
            .lock
            .acquire(1, lock_timeout, RetryPolicy::None)?;
        let mut index = self.shared.index.lock();

        let Some(oldest) = index.oldest() else {
            return Ok(None);
        };
        // Private copy first, then free the slot
        let bytes = self.segment.read_rows(oldest.start, oldest.end);
        let Some(slot) = index.pop_oldest() else {
            return Ok(None);
        };
        drop(index);
        permit.release();
        self.shared.notify();

        let array = BatchArray::from_shape(slot.dims, bytes)?;
        Ok(Some(Batch {
            array,
            info: slot.info,
        }))
    }

    /// Pop the oldest batch, waiting up to `timeout` for one to arrive
    pub fn get(&mut self, timeout: Option<Duration>) -> Result<Batch> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            let seen = self.generation();
            let lock_timeout = deadline.map(|at| at.saturating_duration_since(Instant::now()));
            if let Some(batch) = self.try_get_within(lock_timeout)? {
                return Ok(batch);
            }
            if !self.wait_for_change(seen, deadline) {
                return Err(Error::Timeout(started.elapsed()));
            }
        }
    }

    /// Unlink the segment; valid once per arena
    pub fn release(&self) -> Result<()> {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyReleased);
        }
        let leftover = self.len();
        if leftover > 0 {
            tracing::warn!(leftover, "releasing arena with unread batches");
        }
        self.segment.unlink()?;
        self.shared.notify();
        tracing::debug!(segment = %self.shared.descriptor.name, "arena released");
        Ok(())
    }
}

impl Drop for ArenaHandle {
    fn drop(&mut self) {
        if self.owner && !self.shared.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.segment.unlink() {
                tracing::warn!(error = %e, "failed to unlink arena segment");
            }
        }
    }
}

impl std::fmt::Debug for ArenaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaHandle")
            .field("segment", &self.shared.descriptor.name)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const ROW: usize = 12;

    fn config(dir: &tempfile::TempDir, rows: usize) -> ArenaConfig {
        ArenaConfig::new(rows, ROW)
            .with_segment_dir(dir.path())
            .with_put_retries(3, Duration::from_millis(20))
    }

    fn batch(rows: usize, fill: u8) -> BatchArray {
        BatchArray::from_shape(vec![rows, 2, 2, 3], vec![fill; rows * ROW]).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaHandle::create(config(&dir, 16)).unwrap();
        let data: Vec<u8> = (0..3 * ROW).map(|i| i as u8).collect();
        let array = BatchArray::from_shape(vec![3, 2, 2, 3], data).unwrap();
        let info = BatchInfo::new("tok", "clip.npy", 1);

        let outcome = arena.put(&array, &info).unwrap();
        assert_eq!(outcome, PutOutcome { written: 1, dropped: 0 });
        assert_eq!(arena.len(), 1);

        let out = arena.get(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(out.array, array);
        assert_eq!(out.info, info);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_peer_handle_sees_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = ArenaHandle::create(config(&dir, 8)).unwrap();
        let mut writer = reader.attach().unwrap();

        writer.put(&batch(2, 9), &BatchInfo::new("a", "a.npy", 0)).unwrap();
        let out = reader.try_get().unwrap().unwrap();
        assert!(out.array.as_bytes().iter().all(|b| *b == 9));
        assert!(reader.try_get().unwrap().is_none());
    }

    #[test]
    fn test_compaction_keeps_payloads_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaHandle::create(config(&dir, 16).with_high_water(0.5)).unwrap();
        let put = |arena: &mut ArenaHandle, rows: usize, fill: u8| {
            let name = format!("{fill}.npy");
            let outcome = arena.put(&batch(rows, fill), &BatchInfo::new(name.clone(), name, 0));
            assert!(outcome.unwrap().is_complete());
        };
        let pop = |arena: &mut ArenaHandle, fill: u8, rows: usize| {
            let out = arena.try_get().unwrap().unwrap();
            assert_eq!(out.array.rows(), rows);
            assert!(
                out.array.as_bytes().iter().all(|b| *b == fill),
                "payload {fill} corrupted"
            );
        };

        for fill in 1..=4 {
            put(&mut arena, 4, fill);
        }
        pop(&mut arena, 1, 4);
        put(&mut arena, 2, 5);
        put(&mut arena, 1, 6);
        pop(&mut arena, 2, 4);
        put(&mut arena, 4, 7);
        pop(&mut arena, 3, 4);
        put(&mut arena, 3, 8);
        pop(&mut arena, 4, 4);
        pop(&mut arena, 5, 2);
        put(&mut arena, 4, 9);

        // Two 2-row holes: 3 rows only fit after compaction
        let starts = |arena: &ArenaHandle| -> Vec<usize> {
            arena.snapshot().slots().iter().map(|s| s.start).collect()
        };
        assert_eq!(starts(&arena), vec![2, 3, 7, 10]);
        put(&mut arena, 3, 10);
        assert_eq!(starts(&arena), vec![0, 1, 5, 8, 12]);

        pop(&mut arena, 6, 1);
        pop(&mut arena, 7, 4);
        pop(&mut arena, 8, 3);
        pop(&mut arena, 9, 4);
        pop(&mut arena, 10, 3);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_oversized_item_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaHandle::create(config(&dir, 8)).unwrap();
        let info = BatchInfo::new("big", "big.npy", 2);

        // max item is 2 rows, so 5 rows become parts of 2, 2, 1
        let outcome = arena.put(&batch(5, 1), &info).unwrap();
        assert_eq!(outcome.written, 3);

        let parts: Vec<_> = (0..3).map(|_| arena.try_get().unwrap().unwrap()).collect();
        let rows: Vec<_> = parts.iter().map(|b| b.array.rows()).collect();
        assert_eq!(rows, vec![2, 2, 1]);
        assert_eq!(parts.iter().map(|b| b.info.part).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(parts.iter().all(|b| b.info.parts == 3));
        assert_eq!(parts.iter().map(|b| b.info.pad_count).sum::<usize>(), 2);
        assert_eq!(parts[2].info.pad_count, 2);
    }

    #[test]
    fn test_full_arena_drops_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaHandle::create(config(&dir, 1)).unwrap();
        arena.put(&batch(1, 1), &BatchInfo::new("a", "a.npy", 0)).unwrap();

        let started = Instant::now();
        let outcome = arena.put(&batch(1, 2), &BatchInfo::new("b", "b.npy", 0)).unwrap();
        assert_eq!(outcome, PutOutcome { written: 0, dropped: 1 });
        assert!(started.elapsed() >= Duration::from_millis(60));

        let out = arena.try_get().unwrap().unwrap();
        assert_eq!(out.info.token, "a");
    }

    #[test]
    fn test_blocked_writers_proceed_as_reader_drains() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 1).with_put_retries(500, Duration::from_millis(20));
        let mut reader = ArenaHandle::create(cfg).unwrap();

        let writers: Vec<_> = (0..2u8)
            .map(|i| {
                let mut handle = reader.attach().unwrap();
                thread::spawn(move || {
                    let info = BatchInfo::new(format!("w{i}"), format!("w{i}.npy"), 0);
                    handle.put(&batch(1, i + 1), &info).unwrap()
                })
            })
            .collect();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let batch = reader.get(Some(Duration::from_secs(10))).unwrap();
            seen.push(batch.info.token);
        }
        for w in writers {
            assert!(w.join().unwrap().is_complete());
        }
        seen.sort();
        assert_eq!(seen, vec!["w0".to_string(), "w1".to_string()]);
    }

    #[test]
    fn test_get_times_out_on_empty_arena() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaHandle::create(config(&dir, 4)).unwrap();
        let err = arena.get(Some(Duration::from_millis(30))).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_release_once() {
        let dir = tempfile::tempdir().unwrap();
        let arena = ArenaHandle::create(config(&dir, 4)).unwrap();
        let path = arena.descriptor().path.clone();
        let peer = arena.attach().unwrap();

        arena.release().unwrap();
        assert!(!path.exists());
        assert!(matches!(arena.release(), Err(Error::AlreadyReleased)));
        assert!(matches!(peer.release(), Err(Error::AlreadyReleased)));
        assert!(arena.attach().is_err());
    }

    #[test]
    fn test_owner_drop_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let arena = ArenaHandle::create(config(&dir, 4)).unwrap();
        let path = arena.descriptor().path.clone();
        drop(arena);
        assert!(!path.exists());
    }

    #[test]
    fn test_cancel_stops_blocked_writer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir, 1).with_put_retries(10_000, Duration::from_secs(1));
        let mut arena = ArenaHandle::create(cfg).unwrap();
        arena.put(&batch(1, 1), &BatchInfo::new("a", "a.npy", 0)).unwrap();

        let mut writer = arena.attach().unwrap();
        let blocked = thread::spawn(move || {
            writer.put(&batch(1, 2), &BatchInfo::new("b", "b.npy", 0)).unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        arena.cancel();
        assert_eq!(blocked.join().unwrap().dropped, 1);
    }

    #[test]
    fn test_rejects_mismatched_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ArenaHandle::create(config(&dir, 4)).unwrap();
        let wrong = BatchArray::from_shape(vec![1, 5], vec![0; 5]).unwrap();
        assert!(arena.put(&wrong, &BatchInfo::new("x", "x.npy", 0)).is_err());
    }
}
