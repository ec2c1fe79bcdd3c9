//! Intent log replay.
//!
//! At mount, durable records newer than the last synced transaction group are
//! re-executed in log order through the regular operations with the replay
//! flag set. Replayed operations are not logged again, creations claim the
//! object id they were logged with, and writes force the logged end of file.
//! Once every record has been applied the store is synced and the log trimmed.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::create::EntryRequest;
use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::NodeRef;
use crate::stats::ZplStats;
use crate::types::{Cred, IoFlags, ObjectId};
use crate::zil::{LogOp, LogRecord};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub replayed: u64,
    /// Records already reflected in the store or about objects gone since.
    pub skipped: u64,
    pub last_seq: Option<u64>,
}

/// Clears the replay flag and end-of-file override on every exit path.
struct ReplayMode<'a> {
    inner: &'a MountInner,
}

impl<'a> ReplayMode<'a> {
    fn enter(inner: &'a MountInner) -> Self {
        inner.set_replaying(true);
        Self { inner }
    }
}

impl Drop for ReplayMode<'_> {
    fn drop(&mut self) {
        *self.inner.replay_eof.lock() = None;
        self.inner.set_replaying(false);
    }
}

enum Applied {
    Done,
    Skipped,
}

impl MountInner {
    fn replay_record(self: &Arc<Self>, record: &LogRecord) -> Result<Applied> {
        let cred = Cred::root();
        match &record.op {
            LogOp::Create {
                parent,
                name,
                object,
                attrs,
            }
            | LogOp::Mkdir {
                parent,
                name,
                object,
                attrs,
            } => {
                if self.store.object_exists(*object) {
                    return Ok(Applied::Skipped);
                }
                let dir = self.get_node(*parent)?;
                let req = EntryRequest {
                    name,
                    attrs: attrs.clone(),
                    target: None,
                    claim: Some(*object),
                };
                self.create_entry(&dir, req, &cred)?;
            }
            LogOp::Symlink {
                parent,
                name,
                object,
                attrs,
                target,
            } => {
                if self.store.object_exists(*object) {
                    return Ok(Applied::Skipped);
                }
                let dir = self.get_node(*parent)?;
                let req = EntryRequest {
                    name,
                    attrs: attrs.clone(),
                    target: Some(target.as_slice()),
                    claim: Some(*object),
                };
                self.create_entry(&dir, req, &cred)?;
            }
            LogOp::MkXattr { owner, object, attrs } => {
                if self.store.object_exists(*object) {
                    return Ok(Applied::Skipped);
                }
                let owner = self.get_node(*owner)?;
                self.make_xattr_dir(&owner, attrs, Some(*object))?;
            }
            LogOp::Remove { parent, name, .. } | LogOp::Rmdir { parent, name, .. } => {
                let rmdir = matches!(record.op, LogOp::Rmdir { .. });
                let dir = self.get_node(*parent)?;
                self.remove_entry(&dir, name, &cred, rmdir)?;
            }
            LogOp::Link { parent, name, object } => {
                let dir = self.get_node(*parent)?;
                let src = self.get_node(*object)?;
                self.link(&dir, &src, name, &cred)?;
            }
            LogOp::Rename {
                src_parent,
                src_name,
                dst_parent,
                dst_name,
                ..
            } => {
                let sdir = self.get_node(*src_parent)?;
                let tdir = self.get_node(*dst_parent)?;
                self.rename(&sdir, src_name, &tdir, dst_name, &cred)?;
            }
            LogOp::Write {
                object,
                offset,
                data,
                end_size,
            } => {
                let Some(node) = self.replay_target(*object)? else {
                    return Ok(Applied::Skipped);
                };
                *self.replay_eof.lock() = Some(*end_size);
                let res = self.write(&node, *offset as i64, data, IoFlags::WRITE, &cred);
                *self.replay_eof.lock() = None;
                res?;
            }
            LogOp::Truncate { object, size } => {
                let Some(node) = self.replay_target(*object)? else {
                    return Ok(Applied::Skipped);
                };
                let _guard = self.enter()?;
                self.truncate(&node, *size)?;
            }
            LogOp::Setattr { object, attrs } => {
                let Some(node) = self.replay_target(*object)? else {
                    return Ok(Applied::Skipped);
                };
                self.setattr(&node, attrs, &cred)?;
            }
        }
        Ok(Applied::Done)
    }

    /// Loads the node a data record is about; `None` if it no longer exists.
    fn replay_target(self: &Arc<Self>, object: ObjectId) -> Result<Option<NodeRef>> {
        match self.get_node(object) {
            Ok(node) => Ok(Some(node)),
            Err(ZplError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Mount {
    /// Replays durable intent log records the store has not synced yet.
    pub fn replay(&self) -> Result<ReplayStats> {
        let inner = &self.inner;
        inner.check_writable()?;
        let started = Instant::now();
        let synced = inner.store.synced_txg();
        let records = inner.log.records_after(synced)?;
        let mut stats = ReplayStats::default();
        if records.is_empty() {
            return Ok(stats);
        }

        {
            let _mode = ReplayMode::enter(inner);
            for record in &records {
                match inner.replay_record(record) {
                    Ok(Applied::Done) => {
                        stats.replayed += 1;
                        ZplStats::bump(&inner.stats.records_replayed);
                        debug!(seq = record.seq, op = record.op.name(), object = %record.op.object(), "replayed");
                    }
                    Ok(Applied::Skipped) => {
                        stats.skipped += 1;
                        debug!(seq = record.seq, op = record.op.name(), object = %record.op.object(), "replay skipped");
                    }
                    Err(e) => {
                        return Err(ZplError::Internal(format!(
                            "replay of {} record {} failed: {}",
                            record.op.name(),
                            record.seq,
                            e
                        )));
                    }
                }
                stats.last_seq = Some(record.seq);
            }
        }

        inner.releaser.drain();
        let txg = inner.store.sync()?;
        inner.log.clean(txg);
        info!(
            mount = inner.id,
            replayed = stats.replayed,
            skipped = stats.skipped,
            from_txg = synced,
            txg,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "intent log replayed"
        );
        Ok(stats)
    }
}
