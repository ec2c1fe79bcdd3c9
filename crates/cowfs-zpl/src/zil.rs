//! Intent log.
//!
//! Every committed namespace or data change appends one record tagged with the
//! transaction group it committed in. Records become durable on `flush`; after
//! a crash, records newer than the last synced transaction group are replayed.
//! Records are stored bincode-encoded with a CRC32 so a torn or corrupted
//! record stops replay instead of being applied.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LogError;
use crate::types::{NewNodeAttrs, ObjectId, SetAttrs, Txg};

/// A logged operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Create {
        parent: ObjectId,
        name: Vec<u8>,
        object: ObjectId,
        attrs: NewNodeAttrs,
    },
    Mkdir {
        parent: ObjectId,
        name: Vec<u8>,
        object: ObjectId,
        attrs: NewNodeAttrs,
    },
    Symlink {
        parent: ObjectId,
        name: Vec<u8>,
        object: ObjectId,
        attrs: NewNodeAttrs,
        target: Vec<u8>,
    },
    /// Creation of a node's hidden extended-attribute directory.
    MkXattr {
        owner: ObjectId,
        object: ObjectId,
        attrs: NewNodeAttrs,
    },
    Remove {
        parent: ObjectId,
        name: Vec<u8>,
        object: ObjectId,
    },
    Rmdir {
        parent: ObjectId,
        name: Vec<u8>,
        object: ObjectId,
    },
    Link {
        parent: ObjectId,
        name: Vec<u8>,
        object: ObjectId,
    },
    Rename {
        src_parent: ObjectId,
        src_name: Vec<u8>,
        dst_parent: ObjectId,
        dst_name: Vec<u8>,
        object: ObjectId,
    },
    Write {
        object: ObjectId,
        offset: u64,
        data: Vec<u8>,
        /// File size after the write; replay forces it as the new EOF.
        end_size: u64,
    },
    Truncate {
        object: ObjectId,
        size: u64,
    },
    Setattr {
        object: ObjectId,
        attrs: SetAttrs,
    },
}

impl LogOp {
    pub fn name(&self) -> &'static str {
        match self {
            LogOp::Create { .. } => "create",
            LogOp::Mkdir { .. } => "mkdir",
            LogOp::Symlink { .. } => "symlink",
            LogOp::MkXattr { .. } => "mkxattr",
            LogOp::Remove { .. } => "remove",
            LogOp::Rmdir { .. } => "rmdir",
            LogOp::Link { .. } => "link",
            LogOp::Rename { .. } => "rename",
            LogOp::Write { .. } => "write",
            LogOp::Truncate { .. } => "truncate",
            LogOp::Setattr { .. } => "setattr",
        }
    }

    /// The object the record is about.
    pub fn object(&self) -> ObjectId {
        match self {
            LogOp::Create { object, .. }
            | LogOp::Mkdir { object, .. }
            | LogOp::Symlink { object, .. }
            | LogOp::MkXattr { object, .. }
            | LogOp::Remove { object, .. }
            | LogOp::Rmdir { object, .. }
            | LogOp::Link { object, .. }
            | LogOp::Rename { object, .. }
            | LogOp::Write { object, .. }
            | LogOp::Truncate { object, .. }
            | LogOp::Setattr { object, .. } => *object,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub txg: Txg,
    pub op: LogOp,
}

/// The intent log collaborator.
pub trait IntentLog: Send + Sync {
    /// Appends a record for a change committed in `txg`. Returns its sequence number.
    fn append(&self, txg: Txg, op: LogOp) -> Result<u64, LogError>;

    /// Makes every record appended so far durable. `object` names the file the
    /// caller needs durable; `None` flushes everything.
    fn flush(&self, object: Option<ObjectId>) -> Result<(), LogError>;

    /// Durable records belonging to transaction groups after `txg`, in order.
    /// A record failing verification ends the log; records before it are
    /// still returned.
    fn records_after(&self, txg: Txg) -> Result<Vec<LogRecord>, LogError>;

    /// Discards records whose transaction group is at or below `synced`.
    fn clean(&self, synced: Txg);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub appended: u64,
    pub flushes: u64,
    pub records_flushed: u64,
    pub cleaned: u64,
}

#[derive(Clone)]
struct StoredRecord {
    seq: u64,
    txg: Txg,
    object: ObjectId,
    encoded: Vec<u8>,
    crc: u32,
    durable: bool,
}

struct LogState {
    records: Vec<StoredRecord>,
    next_seq: u64,
    stats: LogStats,
    closed: bool,
}

/// Intent log kept in memory. [`MemoryIntentLog::crash_image`] keeps only
/// flushed records.
pub struct MemoryIntentLog {
    state: Mutex<LogState>,
}

impl Default for MemoryIntentLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIntentLog {
    pub fn new() -> Self {
        Self::with_records(Vec::new(), 1)
    }

    fn with_records(records: Vec<StoredRecord>, next_seq: u64) -> Self {
        Self {
            state: Mutex::new(LogState {
                records,
                next_seq,
                stats: LogStats::default(),
                closed: false,
            }),
        }
    }

    /// The log as found after power loss.
    pub fn crash_image(&self) -> MemoryIntentLog {
        let st = self.state.lock();
        let durable = st.records.iter().filter(|r| r.durable).cloned().collect();
        Self::with_records(durable, st.next_seq)
    }

    /// Rejects further appends.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records not yet flushed.
    pub fn unflushed(&self) -> usize {
        self.state.lock().records.iter().filter(|r| !r.durable).count()
    }

    /// Number of records held for `object`.
    pub fn records_for(&self, object: ObjectId) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.object == object)
            .count()
    }

    /// Flips a byte of the stored record so its checksum no longer matches.
    pub fn corrupt(&self, seq: u64) {
        let mut st = self.state.lock();
        if let Some(rec) = st.records.iter_mut().find(|r| r.seq == seq) {
            if let Some(byte) = rec.encoded.last_mut() {
                *byte ^= 0xff;
            }
        }
    }
}

impl IntentLog for MemoryIntentLog {
    fn append(&self, txg: Txg, op: LogOp) -> Result<u64, LogError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(LogError::Closed);
        }
        let seq = st.next_seq;
        let object = op.object();
        let kind = op.name();
        let record = LogRecord { seq, txg, op };
        let encoded = bincode::serialize(&record).map_err(|e| LogError::Encode(e.to_string()))?;
        let crc = crc32fast::hash(&encoded);
        st.next_seq += 1;
        st.records.push(StoredRecord {
            seq,
            txg,
            object,
            encoded,
            crc,
            durable: false,
        });
        st.stats.appended += 1;
        debug!(seq, txg, %object, op = kind, "intent log record appended");
        Ok(seq)
    }

    fn flush(&self, object: Option<ObjectId>) -> Result<(), LogError> {
        let mut st = self.state.lock();
        let mut flushed = 0u64;
        for rec in st.records.iter_mut().filter(|r| !r.durable) {
            rec.durable = true;
            flushed += 1;
        }
        st.stats.flushes += 1;
        st.stats.records_flushed += flushed;
        if flushed > 0 {
            debug!(?object, flushed, "intent log flushed");
        }
        Ok(())
    }

    fn records_after(&self, txg: Txg) -> Result<Vec<LogRecord>, LogError> {
        let st = self.state.lock();
        let mut out = Vec::new();
        for rec in st.records.iter().filter(|r| r.durable && r.txg > txg) {
            if crc32fast::hash(&rec.encoded) != rec.crc {
                warn!(seq = rec.seq, kept = out.len(), "intent log record failed checksum, log ends here");
                break;
            }
            let decoded: LogRecord =
                bincode::deserialize(&rec.encoded).map_err(|e| LogError::Encode(e.to_string()))?;
            out.push(decoded);
        }
        Ok(out)
    }

    fn clean(&self, synced: Txg) {
        let mut st = self.state.lock();
        let before = st.records.len();
        st.records.retain(|r| r.txg > synced);
        let cleaned = (before - st.records.len()) as u64;
        st.stats.cleaned += cleaned;
    }
}
