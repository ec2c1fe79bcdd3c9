//! Write.
//!
//! A write locks its byte range first, then loops over chunks of at most one
//! record, each in its own transaction. The range lock stays held across
//! assignment restarts. When the lock covers the whole file because the block
//! size may grow, the new block size is settled inside the first assigned
//! transaction and the lock is narrowed to the written range.
//!
//! A failure after some chunks were committed turns into a short write.

use std::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::NodeRef;
use crate::policy::mandatory_locking;
use crate::range_lock::{RangeLockEntry, RangeLockMode};
use crate::stats::{VnodeOp, ZplStats};
use crate::store::Transaction;
use crate::types::{mode, Attr, Cred, IoFlags, NodeFlags, Timestamp};
use crate::zil::LogOp;

/// Outcome of a write. `written` may be short of the request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub offset: u64,
    pub written: usize,
}

/// Block size for a file whose lock covers it while growing to `end_size`.
pub(crate) fn grown_block_size(block_size: u64, max_block_size: u64, end_size: u64) -> u64 {
    if block_size > max_block_size {
        end_size.min(block_size.next_power_of_two())
    } else {
        end_size.min(max_block_size)
    }
}

impl MountInner {
    pub(crate) fn write(
        &self,
        node: &NodeRef,
        offset: i64,
        data: &[u8],
        flags: IoFlags,
        cred: &Cred,
    ) -> Result<WriteResult> {
        if data.is_empty() {
            return Ok(WriteResult {
                offset: offset.max(0) as u64,
                written: 0,
            });
        }
        let _guard = self.enter()?;
        self.verify(node)?;
        self.check_writable()?;

        let append = flags.contains(IoFlags::APPEND);
        let node_flags = node.flags();
        if node_flags.intersects(NodeFlags::IMMUTABLE | NodeFlags::READONLY)
            || (node_flags.contains(NodeFlags::APPENDONLY) && !append && offset < node.size() as i64)
        {
            return Err(ZplError::PermissionDenied("file is immutable or append-only"));
        }

        let woff = if append { node.size() as i64 } else { offset };
        if woff < 0 {
            return Err(ZplError::InvalidArgument("negative offset"));
        }
        if mandatory_locking(node.mode()) {
            self.collab.locks.check(node.id(), woff as u64, data.len() as u64, true)?;
        }

        let res = self.write_locked(node, woff as u64, data, append, cred);
        // Any synchronous opener makes every write synchronous.
        if res.is_ok() && (flags.wants_sync() || node.sync_opens() > 0 || self.sync_always()) {
            self.flush_log(Some(node.id()))?;
        }
        res
    }

    fn write_locked(
        &self,
        node: &NodeRef,
        offset: u64,
        data: &[u8],
        append: bool,
        cred: &Cred,
    ) -> Result<WriteResult> {
        let max_block_size = self.config.max_block_size;
        let lock_mode = if append {
            RangeLockMode::Append
        } else {
            RangeLockMode::Writer
        };
        let mut range = node
            .range_lock
            .lock(offset, data.len() as u64, lock_mode, || node.geometry(max_block_size));
        let start = if append {
            if range.is_whole_file() {
                node.size()
            } else {
                range.offset()
            }
        } else {
            offset
        };

        let limit = self.config.max_file_offset;
        if start >= limit {
            return Err(ZplError::FileTooLarge);
        }
        let total = (data.len() as u64).min(limit - start);
        let data = &data[..total as usize];
        let end_size = node.size().max(start + total);

        let mut woff = start;
        let mut done = 0usize;
        let mut failure = None;
        while done < data.len() {
            match self.write_chunk(node, &mut range, woff, &data[done..], end_size, cred) {
                Ok(0) => break,
                Ok(n) => {
                    done += n;
                    woff += n as u64;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(range);

        if let Some(err) = failure {
            if self.is_replaying() || done == 0 {
                return Err(err);
            }
            ZplStats::bump(&self.stats.short_writes);
            debug!(object = %node.id(), written = done, requested = data.len(), error = %err, "short write");
        }
        Ok(WriteResult {
            offset: start,
            written: done,
        })
    }

    /// Writes one chunk of `rest` at `woff` in its own transaction. Returns the
    /// number of bytes committed.
    fn write_chunk(
        &self,
        node: &NodeRef,
        range: &mut RangeLockEntry<'_>,
        woff: u64,
        rest: &[u8],
        end_size: u64,
        cred: &Cred,
    ) -> Result<usize> {
        let id = node.id();
        let max_block_size = self.config.max_block_size;
        if !self.is_replaying() && self.collab.quota.over_quota(node.uid(), node.gid()) {
            return Err(ZplError::QuotaExceeded);
        }

        let n = rest.len() as u64;
        let zero_copy = n >= max_block_size
            && woff >= node.size()
            && woff % max_block_size == 0
            && node.block_size() == max_block_size;

        let assigned = self.assign_with_retry("write", |_| {
            let mut tx = self.store.tx_create();
            tx.hold_attrs(id);
            tx.hold_write(Some(id), woff, n.min(max_block_size));
            Ok(((), tx))
        })?;
        let mut tx = assigned.tx;
        let txg = assigned.txg;

        if range.is_whole_file() {
            let block_size = node.block_size();
            let new_size = grown_block_size(block_size, max_block_size, end_size);
            if new_size > block_size && node.size() <= block_size {
                match self.store.set_block_size(&mut tx, id, new_size) {
                    Ok(()) => {
                        node.set_block_size(new_size);
                        trace!(object = %id, block_size = new_size, "block size grown");
                    }
                    Err(e) => debug!(object = %id, error = %e, "block size growth skipped"),
                }
            }
            range.reduce(woff, n);
        }

        let nbytes = if zero_copy {
            max_block_size
        } else {
            n.min(max_block_size - woff % max_block_size)
        };
        let chunk = &rest[..nbytes as usize];
        if woff + nbytes > node.size() {
            self.collab.pages.set_size(id, woff + nbytes);
        }

        let written = if zero_copy {
            let mut buf = self.store.request_buffer(chunk.len());
            buf.extend_from_slice(chunk);
            self.store.assign_buffer(&mut tx, id, woff, buf.freeze())
        } else {
            self.store.write(&mut tx, id, woff, chunk)
        };
        let tx_bytes = match written {
            Ok(()) => {
                self.collab.pages.write_through_cache(id, woff, chunk);
                nbytes
            }
            Err(e) => {
                let staged = node.adjust(self.store.as_ref(), &mut tx, |_, size| vec![Attr::Size(size)]);
                self.commit(tx)?;
                staged?;
                return Err(e.into());
            }
        };

        let res = self.stamp_write(node, &mut tx, woff + tx_bytes, cred);
        let logged = match &res {
            Ok(()) => self.log_op(
                txg,
                LogOp::Write {
                    object: id,
                    offset: woff,
                    data: chunk.to_vec(),
                    end_size: node.size(),
                },
            ),
            Err(_) => Ok(()),
        };
        self.commit(tx)?;
        res?;
        logged?;
        trace!(object = %id, offset = woff, len = tx_bytes, txg, "write chunk committed");
        Ok(tx_bytes as usize)
    }

    /// Clears set-id bits, stamps modification times and raises the size to
    /// `end` after a chunk was staged.
    fn stamp_write(
        &self,
        node: &NodeRef,
        tx: &mut Transaction,
        end: u64,
        cred: &Cred,
    ) -> Result<()> {
        let retain_setid = self.collab.access.may_retain_setid(cred, &node.attrs());
        let replay_eof = if self.is_replaying() {
            *self.replay_eof.lock()
        } else {
            None
        };
        let now = Timestamp::now();
        node.adjust(self.store.as_ref(), tx, |f, _| {
            let size = match replay_eof {
                Some(eof) => {
                    node.force_size(eof);
                    eof
                }
                None => node.extend_size(end),
            };
            let mut changes = Vec::with_capacity(5);
            if f.mode & mode::S_IXANY != 0 && f.mode & (mode::S_ISUID | mode::S_ISGID) != 0 && !retain_setid {
                changes.push(Attr::Mode(f.mode & !(mode::S_ISUID | mode::S_ISGID)));
            }
            let mut flags = f.flags;
            flags.insert(NodeFlags::ARCHIVE | NodeFlags::AV_MODIFIED);
            changes.extend([Attr::Mtime(now), Attr::Ctime(now), Attr::Flags(flags), Attr::Size(size)]);
            changes
        })
    }
}

impl Mount {
    /// Writes `data` at `offset`, or at end of file with [`IoFlags::APPEND`].
    pub fn write(&self, node: &NodeRef, offset: i64, data: &[u8], flags: IoFlags, cred: &Cred) -> Result<WriteResult> {
        let started = Instant::now();
        let res = self.inner.write(node, offset, data, flags, cred);
        self.inner.finish(VnodeOp::Write, started, res)
    }
}
