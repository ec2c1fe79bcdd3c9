//! Per-mount operation statistics.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Externally invoked vnode operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VnodeOp {
    Open,
    Close,
    Read,
    Write,
    Fsync,
    Lookup,
    Getattr,
    Setattr,
    Access,
    Create,
    Mkdir,
    Symlink,
    Readlink,
    Link,
    Remove,
    Rmdir,
    Rename,
    Readdir,
    XattrDir,
}

impl VnodeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            VnodeOp::Open => "open",
            VnodeOp::Close => "close",
            VnodeOp::Read => "read",
            VnodeOp::Write => "write",
            VnodeOp::Fsync => "fsync",
            VnodeOp::Lookup => "lookup",
            VnodeOp::Getattr => "getattr",
            VnodeOp::Setattr => "setattr",
            VnodeOp::Access => "access",
            VnodeOp::Create => "create",
            VnodeOp::Mkdir => "mkdir",
            VnodeOp::Symlink => "symlink",
            VnodeOp::Readlink => "readlink",
            VnodeOp::Link => "link",
            VnodeOp::Remove => "remove",
            VnodeOp::Rmdir => "rmdir",
            VnodeOp::Rename => "rename",
            VnodeOp::Readdir => "readdir",
            VnodeOp::XattrDir => "xattr_dir",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpMetrics {
    pub count: u64,
    pub errors: u64,
    pub total_duration_us: u64,
    pub max_duration_us: u64,
}

impl OpMetrics {
    pub fn avg_duration_us(&self) -> u64 {
        if self.count > 0 {
            self.total_duration_us / self.count
        } else {
            0
        }
    }
}

/// Point-in-time copy of a mount's counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ZplStatsSnapshot {
    pub ops: HashMap<VnodeOp, OpMetrics>,
    /// Assignments that came back with a restart.
    pub tx_restarts: u64,
    pub log_records: u64,
    pub log_flushes: u64,
    pub short_writes: u64,
    pub rename_relocks: u64,
    pub rename_rollbacks: u64,
    pub nodes_destroyed: u64,
    pub deferred_releases: u64,
    pub records_replayed: u64,
}

#[derive(Default)]
pub struct ZplStats {
    ops: RwLock<HashMap<VnodeOp, OpMetrics>>,
    pub(crate) tx_restarts: AtomicU64,
    pub(crate) log_records: AtomicU64,
    pub(crate) log_flushes: AtomicU64,
    pub(crate) short_writes: AtomicU64,
    pub(crate) rename_relocks: AtomicU64,
    pub(crate) rename_rollbacks: AtomicU64,
    pub(crate) nodes_destroyed: AtomicU64,
    pub(crate) records_replayed: AtomicU64,
}

impl ZplStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_op(&self, op: VnodeOp, duration_us: u64, success: bool) {
        let mut ops = self.ops.write();
        let entry = ops.entry(op).or_default();
        entry.count += 1;
        if !success {
            entry.errors += 1;
        }
        entry.total_duration_us += duration_us;
        entry.max_duration_us = entry.max_duration_us.max(duration_us);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn op(&self, op: VnodeOp) -> OpMetrics {
        self.ops.read().get(&op).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self, deferred_releases: u64) -> ZplStatsSnapshot {
        ZplStatsSnapshot {
            ops: self.ops.read().clone(),
            tx_restarts: self.tx_restarts.load(Ordering::Relaxed),
            log_records: self.log_records.load(Ordering::Relaxed),
            log_flushes: self.log_flushes.load(Ordering::Relaxed),
            short_writes: self.short_writes.load(Ordering::Relaxed),
            rename_relocks: self.rename_relocks.load(Ordering::Relaxed),
            rename_rollbacks: self.rename_rollbacks.load(Ordering::Relaxed),
            nodes_destroyed: self.nodes_destroyed.load(Ordering::Relaxed),
            deferred_releases,
            records_replayed: self.records_replayed.load(Ordering::Relaxed),
        }
    }
}
