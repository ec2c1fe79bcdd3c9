//! Per-file byte-range locks.
//!
//! Readers share overlapping ranges; writers exclude every overlapping holder.
//! Appenders resolve their offset to the file size observed under the lock.
//! A writer whose end may force the file's block size to grow locks the whole
//! file instead, and narrows the lock with [`RangeLockEntry::reduce`] once the
//! block size has been settled inside its transaction.
//!
//! Requests never fail; they block until the range is free.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;

/// Length sentinel meaning "to the end of the file and beyond".
pub const RANGE_UNBOUNDED: u64 = u64::MAX;

/// How a range is held.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RangeLockMode {
    /// Shared with other readers.
    Reader,
    /// Exclusive over the requested range.
    Writer,
    /// Writer at the current end of file; the requested offset is ignored.
    Append,
}

/// Size and block size of a file as seen while the range-lock table is held.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileGeometry {
    pub size: u64,
    pub block_size: u64,
    pub max_block_size: u64,
}

impl FileGeometry {
    /// Whether writing up to `end` could grow the block size.
    pub fn needs_block_growth(&self, end: u64) -> bool {
        let end_size = self.size.max(end);
        end_size > self.block_size
            && (!self.block_size.is_power_of_two() || self.block_size < self.max_block_size)
    }
}

#[derive(Copy, Clone, Debug)]
struct HeldRange {
    offset: u64,
    len: u64,
    exclusive: bool,
}

impl HeldRange {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    fn overlaps(&self, offset: u64, len: u64) -> bool {
        let end = offset.saturating_add(len);
        self.offset < end && offset < self.end()
    }
}

#[derive(Default)]
struct RangeTable {
    next_id: u64,
    held: BTreeMap<u64, HeldRange>,
}

impl RangeTable {
    fn conflicts(&self, offset: u64, len: u64, exclusive: bool) -> bool {
        self.held
            .values()
            .any(|h| (exclusive || h.exclusive) && h.overlaps(offset, len))
    }
}

/// Range lock table for one file.
#[derive(Default)]
pub struct RangeLock {
    table: Mutex<RangeTable>,
    released: Condvar,
}

impl RangeLock {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks `[offset, offset + len)` in `mode`, blocking until no conflicting
    /// holder remains. `geometry` is sampled under the table lock on every
    /// attempt so appenders always see the current end of file.
    pub fn lock<F>(&self, offset: u64, len: u64, mode: RangeLockMode, geometry: F) -> RangeLockEntry<'_>
    where
        F: Fn() -> FileGeometry,
    {
        let mut table = self.table.lock();
        let mut waits = 0u32;
        loop {
            let (start, span, exclusive) = match mode {
                RangeLockMode::Reader => (offset, len, false),
                RangeLockMode::Writer | RangeLockMode::Append => {
                    let geo = geometry();
                    let start = if mode == RangeLockMode::Append {
                        geo.size
                    } else {
                        offset
                    };
                    // An unbounded range writes nothing past its start.
                    let end = if len == RANGE_UNBOUNDED {
                        start
                    } else {
                        start.saturating_add(len)
                    };
                    if geo.needs_block_growth(end) {
                        (0, RANGE_UNBOUNDED, true)
                    } else {
                        (start, len, true)
                    }
                }
            };

            if !table.conflicts(start, span, exclusive) {
                let id = table.next_id;
                table.next_id += 1;
                table.held.insert(
                    id,
                    HeldRange {
                        offset: start,
                        len: span,
                        exclusive,
                    },
                );
                if waits > 0 {
                    tracing::trace!(start, span, waits, "range lock granted after waiting");
                }
                return RangeLockEntry {
                    lock: self,
                    id,
                    offset: start,
                    len: span,
                    mode,
                };
            }

            waits += 1;
            self.released.wait(&mut table);
        }
    }

    /// Number of currently held ranges.
    pub fn held_count(&self) -> usize {
        self.table.lock().held.len()
    }

    fn release(&self, id: u64) {
        let mut table = self.table.lock();
        table.held.remove(&id);
        self.released.notify_all();
    }

    fn narrow(&self, id: u64, offset: u64, len: u64) {
        let mut table = self.table.lock();
        if let Some(held) = table.held.get_mut(&id) {
            held.offset = offset;
            held.len = len;
        }
        self.released.notify_all();
    }
}

/// A granted range. Released on drop.
pub struct RangeLockEntry<'a> {
    lock: &'a RangeLock,
    id: u64,
    offset: u64,
    len: u64,
    mode: RangeLockMode,
}

impl RangeLockEntry<'_> {
    /// Start of the held range.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the held range.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for a zero-length range.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mode the range was requested in.
    pub fn mode(&self) -> RangeLockMode {
        self.mode
    }

    /// True while the entry covers the whole file because of pending block growth.
    pub fn is_whole_file(&self) -> bool {
        self.offset == 0 && self.len == RANGE_UNBOUNDED
    }

    /// Shrinks the held range. A no-op if the range is unchanged.
    pub fn reduce(&mut self, offset: u64, len: u64) {
        if self.offset == offset && self.len == len {
            return;
        }
        self.lock.narrow(self.id, offset, len);
        self.offset = offset;
        self.len = len;
    }

    /// Releases the range explicitly.
    pub fn unlock(self) {}
}

impl Drop for RangeLockEntry<'_> {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}
