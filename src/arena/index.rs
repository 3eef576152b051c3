//! Occupancy index and first-fit allocator for the arena

use crate::error::{Error, Result};
use crate::types::BatchInfo;
use std::ops::Range;

/// Whether writers may allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArenaState {
    #[default]
    Normal,
    /// Compaction could not make room; writes wait until the arena drains
    Defragmenting,
}

/// One occupied row range and the batch it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaSlot {
    pub start: usize,
    pub end: usize,
    /// Insertion order, used for FIFO reads
    pub seq: u64,
    pub info: BatchInfo,
    /// Full array shape; `dims[0] == end - start`
    pub dims: Vec<usize>,
}

impl ArenaSlot {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Rows relocated by compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMove {
    pub from: usize,
    pub to: usize,
    pub rows: usize,
}

/// Result of an allocation attempt
///
/// `moves` must be applied to the arena bytes, in order, before anything is
/// written to `grant`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    pub moves: Vec<SlotMove>,
    pub grant: Option<Range<usize>>,
}

impl Reservation {
    pub fn is_blocked(&self) -> bool {
        self.grant.is_none()
    }
}

/// Start-sorted list of occupied slots
#[derive(Debug, Clone)]
pub struct ArenaIndex {
    capacity: usize,
    high_water: f64,
    slots: Vec<ArenaSlot>,
    state: ArenaState,
    next_seq: u64,
}

impl ArenaIndex {
    pub fn new(capacity: usize, high_water: f64) -> Self {
        Self {
            capacity,
            high_water,
            slots: Vec::new(),
            state: ArenaState::Normal,
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self) -> ArenaState {
        self.state
    }

    pub fn slots(&self) -> &[ArenaSlot] {
        &self.slots
    }

    /// Rows currently occupied
    pub fn used(&self) -> usize {
        self.slots.iter().map(ArenaSlot::len).sum()
    }

    /// Span from the first slot's start to the last slot's end
    pub fn coverage(&self) -> usize {
        match (self.slots.first(), self.slots.last()) {
            (Some(first), Some(last)) => last.end - first.start,
            _ => 0,
        }
    }

    pub fn should_defragment(&self) -> bool {
        self.coverage() as f64 > self.high_water * self.capacity as f64
    }

    /// First gap, scanning left to right, that holds `size` rows
    pub fn first_fit(&self, size: usize) -> Option<Range<usize>> {
        let mut prev_end = 0;
        for slot in &self.slots {
            if slot.start - prev_end >= size {
                return Some(prev_end..prev_end + size);
            }
            prev_end = slot.end;
        }
        if self.capacity - prev_end >= size {
            Some(prev_end..prev_end + size)
        } else {
            None
        }
    }

    /// Find room for `size` rows, compacting if the index is spread too wide
    pub fn allocate(&mut self, size: usize) -> Result<Reservation> {
        if size == 0 || size > self.capacity {
            return Err(Error::ArenaCapacity {
                requested: size,
                capacity: self.capacity,
            });
        }
        if self.slots.is_empty() {
            self.state = ArenaState::Normal;
        }
        if self.state == ArenaState::Defragmenting {
            return Ok(Reservation::default());
        }

        if let Some(grant) = self.first_fit(size) {
            return Ok(Reservation {
                moves: Vec::new(),
                grant: Some(grant),
            });
        }

        if !self.should_defragment() {
            return Ok(Reservation::default());
        }

        let moves = self.defragment();
        let grant = self.first_fit(size);
        if grant.is_none() {
            self.state = ArenaState::Defragmenting;
            tracing::debug!(
                requested = size,
                used = self.used(),
                capacity = self.capacity,
                "arena writes suspended until drained"
            );
        }
        Ok(Reservation { moves, grant })
    }

    /// Record a written slot; returns its sequence number
    pub fn insert(&mut self, range: Range<usize>, info: BatchInfo, dims: Vec<usize>) -> Result<u64> {
        let pos = self.slots.partition_point(|s| s.start < range.start);
        let overlaps_prev = pos > 0 && self.slots[pos - 1].end > range.start;
        let overlaps_next = self.slots.get(pos).is_some_and(|s| s.start < range.end);
        if range.end > self.capacity || range.is_empty() || overlaps_prev || overlaps_next {
            return Err(Error::Internal(format!(
                "slot {range:?} does not fit the arena index"
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            pos,
            ArenaSlot {
                start: range.start,
                end: range.end,
                seq,
                info,
                dims,
            },
        );
        Ok(seq)
    }

    /// Slot written earliest
    pub fn oldest(&self) -> Option<&ArenaSlot> {
        self.slots.iter().min_by_key(|s| s.seq)
    }

    /// Remove the earliest-written slot
    pub fn pop_oldest(&mut self) -> Option<ArenaSlot> {
        let pos = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.seq)
            .map(|(i, _)| i)?;
        let slot = self.slots.remove(pos);
        if self.slots.is_empty() && self.state == ArenaState::Defragmenting {
            self.state = ArenaState::Normal;
            tracing::debug!("arena drained, writes resumed");
        }
        Some(slot)
    }

    /// Compact every slot toward row 0, preserving order
    pub fn defragment(&mut self) -> Vec<SlotMove> {
        let mut cursor = 0;
        let mut moves = Vec::new();
        for slot in &mut self.slots {
            let rows = slot.len();
            if slot.start != cursor {
                moves.push(SlotMove {
                    from: slot.start,
                    to: cursor,
                    rows,
                });
                slot.start = cursor;
                slot.end = cursor + rows;
            }
            cursor = slot.end;
        }
        if !moves.is_empty() {
            tracing::debug!(moved = moves.len(), used = cursor, "arena defragmented");
        }
        moves
    }

    /// Disjoint, start-sorted and within capacity
    pub fn is_consistent(&self) -> bool {
        let sorted = self.slots.windows(2).all(|w| w[0].end <= w[1].start);
        let bounded = self.slots.last().map_or(true, |s| s.end <= self.capacity);
        let nonempty = self.slots.iter().all(|s| s.start < s.end);
        sorted && bounded && nonempty && self.used() <= self.capacity
    }
}
