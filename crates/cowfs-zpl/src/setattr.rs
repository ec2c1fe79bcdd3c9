//! Attribute changes and truncation.
//!
//! A size change runs first, in a transaction of its own under a writer range
//! lock from the new size to the end of the file, and is logged as a
//! truncate. Every other change then commits in one transaction and one
//! setattr record. Owner and group changes are mirrored into the node's
//! attribute directory within that transaction.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, ZplError};
use crate::fuid::is_ephemeral;
use crate::mount::{Mount, MountInner};
use crate::node::NodeRef;
use crate::policy::mandatory_locking;
use crate::range_lock::{RangeLockMode, RANGE_UNBOUNDED};
use crate::stats::VnodeOp;
use crate::store::Transaction;
use crate::types::{mode, Attr, Cred, FileKind, NodeAttrs, NodeFlags, SetAttrs, Timestamp};
use crate::write::grown_block_size;
use crate::zil::LogOp;

impl MountInner {
    fn validate_setattr(&self, node: &NodeRef, req: &SetAttrs) -> Result<()> {
        if !self.config.use_fuids {
            let ephemeral = req.uid.is_some_and(is_ephemeral) || req.gid.is_some_and(is_ephemeral);
            if ephemeral || req.flags.is_some() {
                return Err(ZplError::InvalidArgument("mapped identities are disabled"));
            }
        }
        if let Some(size) = req.size {
            match node.kind() {
                FileKind::Directory => return Err(ZplError::IsDirectory),
                FileKind::Regular => {}
                _ => return Err(ZplError::InvalidArgument("size change on a special file")),
            }
            if size > self.config.max_file_offset {
                return Err(ZplError::FileTooLarge);
            }
        }
        let overflows = |t: Option<Timestamp>| t.is_some_and(|t| !t.fits_32bit());
        if overflows(req.atime) || overflows(req.mtime) {
            return Err(ZplError::Overflow);
        }
        let flags = node.flags();
        if flags.contains(NodeFlags::IMMUTABLE) && req.touches_beyond_atime_and_immutable() {
            return Err(ZplError::PermissionDenied("file is immutable"));
        }
        if flags.contains(NodeFlags::READONLY) && req.size.is_some() {
            return Err(ZplError::PermissionDenied("file is read-only"));
        }
        Ok(())
    }

    pub(crate) fn setattr(self: &Arc<Self>, node: &NodeRef, req: &SetAttrs, cred: &Cred) -> Result<()> {
        if req.is_empty() {
            return Ok(());
        }
        let _guard = self.enter()?;
        self.verify(node)?;
        self.check_writable()?;
        self.validate_setattr(node, req)?;
        let attrs = node.attrs();
        if !self.is_replaying() {
            self.collab.access.check_setattr(&attrs, cred, req)?;
            if let Some(change) = &req.flags {
                self.collab.access.check_flags(Some(&attrs), cred, change)?;
            }
        }

        if let Some(size) = req.size {
            self.truncate(node, size)?;
        }
        let rest = SetAttrs {
            size: None,
            ..req.clone()
        };
        if rest.is_empty() {
            return Ok(());
        }
        self.change_attrs(node, &rest, cred)
    }

    /// Frees or extends `node` to `size`.
    pub(crate) fn truncate(&self, node: &NodeRef, size: u64) -> Result<()> {
        let id = node.id();
        if mandatory_locking(node.mode()) {
            self.collab.locks.check(id, size, RANGE_UNBOUNDED, true)?;
        }
        let max_block_size = self.config.max_block_size;
        let _range = node
            .range_lock
            .lock(size, RANGE_UNBOUNDED, RangeLockMode::Writer, || node.geometry(max_block_size));
        let old = node.size();

        let assigned = self.assign_with_retry("truncate", |_| {
            let mut tx = self.store.tx_create();
            tx.hold_attrs(id);
            if size < old {
                tx.hold_free(id, size, old - size);
            }
            Ok(((), tx))
        })?;
        let (mut tx, txg) = (assigned.tx, assigned.txg);
        let res = self.truncate_in_tx(node, &mut tx, old, size);
        let logged = match &res {
            Ok(()) => self.log_op(txg, LogOp::Truncate { object: id, size }),
            Err(_) => Ok(()),
        };
        self.commit(tx)?;
        res?;
        logged?;
        self.collab.pages.set_size(id, size);
        debug!(object = %id, old, size, txg, "truncated");

        if self.sync_always() {
            self.flush_log(Some(id))?;
        }
        Ok(())
    }

    fn truncate_in_tx(&self, node: &NodeRef, tx: &mut Transaction, old: u64, size: u64) -> Result<()> {
        let id = node.id();
        if size < old {
            self.store.free_range(tx, id, size)?;
        } else if size > old {
            let max_block_size = self.config.max_block_size;
            let block_size = node.block_size();
            if size > block_size && (!block_size.is_power_of_two() || block_size < max_block_size) {
                let new_size = grown_block_size(block_size, max_block_size, size);
                if new_size > block_size && old <= block_size {
                    match self.store.set_block_size(tx, id, new_size) {
                        Ok(()) => node.set_block_size(new_size),
                        Err(e) => debug!(object = %id, error = %e, "block size growth skipped"),
                    }
                }
            }
        }
        let now = Timestamp::now();
        node.update(
            self.store.as_ref(),
            tx,
            &[Attr::Size(size), Attr::Mtime(now), Attr::Ctime(now)],
        )
    }

    fn change_attrs(self: &Arc<Self>, node: &NodeRef, req: &SetAttrs, cred: &Cred) -> Result<()> {
        let id = node.id();
        let attrs = node.attrs();
        let new_uid = req.uid.filter(|uid| *uid != attrs.uid);
        let new_gid = req.gid.filter(|gid| *gid != attrs.gid);
        let owner_change = new_uid.is_some() || new_gid.is_some();
        if owner_change
            && !self.is_replaying()
            && self
                .collab
                .quota
                .over_quota(new_uid.unwrap_or(attrs.uid), new_gid.unwrap_or(attrs.gid))
        {
            return Err(ZplError::QuotaExceeded);
        }
        if let Some(uid) = new_uid {
            self.fuids.register(uid);
        }
        if let Some(gid) = new_gid {
            self.fuids.register(gid);
        }
        let xattr = match attrs.xattr_dir {
            Some(xid) if owner_change => Some(self.get_node(xid)?),
            _ => None,
        };

        let assigned = self.assign_with_retry("setattr", |_| {
            let mut tx = self.store.tx_create();
            tx.hold_attrs(id);
            if self.fuids.is_dirty() {
                self.fuids.txhold(&mut tx);
            }
            if let Some(x) = &xattr {
                tx.hold_attrs(x.id());
            }
            Ok(((), tx))
        })?;
        let (mut tx, txg) = (assigned.tx, assigned.txg);
        let res = self.change_attrs_in_tx(node, xattr.as_ref(), &attrs, req, cred, &mut tx);
        let logged = match &res {
            Ok(applied) => self.log_op(
                txg,
                LogOp::Setattr {
                    object: id,
                    attrs: applied.clone(),
                },
            ),
            Err(_) => Ok(()),
        };
        self.commit(tx)?;
        drop(xattr);
        let applied = res?;
        logged?;
        trace!(object = %id, ?applied, txg, "attributes changed");

        if self.sync_always() {
            self.flush_log(Some(id))?;
        }
        Ok(())
    }

    /// Resolves the final mode after set-id and sticky rules.
    fn resolve_mode(&self, attrs: &NodeAttrs, current_mode: u32, req: &SetAttrs, cred: &Cred) -> u32 {
        let mut perm = req.mode.map_or(current_mode, |m| m & mode::PERM_MASK);
        if self.is_replaying() {
            return perm;
        }
        let access = &self.collab.access;
        if req.mode.is_some() {
            if attrs.kind != FileKind::Directory && perm & mode::S_ISVTX != 0 && !access.may_set_sticky(cred) {
                perm &= !mode::S_ISVTX;
            }
            let gid = req.gid.unwrap_or(attrs.gid);
            if perm & mode::S_ISGID != 0 && !access.may_retain_setgid(cred, gid) {
                perm &= !mode::S_ISGID;
            }
        }
        let owner_change = req.uid.is_some_and(|u| u != attrs.uid) || req.gid.is_some_and(|g| g != attrs.gid);
        if owner_change && !cred.privileged {
            perm &= !(mode::S_ISUID | mode::S_ISGID);
        }
        perm
    }

    /// Stages the changes and returns them as they were applied.
    fn change_attrs_in_tx(
        &self,
        node: &NodeRef,
        xattr: Option<&NodeRef>,
        attrs: &NodeAttrs,
        req: &SetAttrs,
        cred: &Cred,
        tx: &mut Transaction,
    ) -> Result<SetAttrs> {
        let mut applied = req.clone();
        let now = Timestamp::now();
        node.adjust(self.store.as_ref(), tx, |f, _| {
            let mut changes = Vec::with_capacity(8);
            let perm = self.resolve_mode(attrs, f.mode, req, cred);
            if perm != f.mode || req.mode.is_some() {
                changes.push(Attr::Mode(perm));
                applied.mode = Some(perm);
            }
            if let Some(uid) = req.uid {
                changes.push(Attr::Uid(uid));
            }
            if let Some(gid) = req.gid {
                changes.push(Attr::Gid(gid));
            }
            if let Some(t) = req.atime {
                changes.push(Attr::Atime(t));
            }
            if let Some(t) = req.mtime {
                changes.push(Attr::Mtime(t));
            }
            if let Some(t) = req.crtime {
                changes.push(Attr::Crtime(t));
            }
            if let Some(change) = req.flags {
                changes.push(Attr::Flags(change.apply(f.flags)));
            }
            changes.push(Attr::Ctime(now));
            changes
        })?;
        if self.fuids.is_dirty() {
            self.fuids.sync(self.store.as_ref(), tx)?;
        }

        if let Some(x) = xattr {
            let mut mirror = Vec::with_capacity(3);
            if let Some(uid) = req.uid {
                mirror.push(Attr::Uid(uid));
            }
            if let Some(gid) = req.gid {
                mirror.push(Attr::Gid(gid));
            }
            mirror.push(Attr::Ctime(now));
            x.update(self.store.as_ref(), tx, &mirror)?;
        }
        Ok(applied)
    }
}

impl Mount {
    /// Applies `req` to `node`. A size change is carried out as a truncate.
    pub fn setattr(&self, node: &NodeRef, req: &SetAttrs, cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.setattr(node, req, cred);
        self.inner.finish(VnodeOp::Setattr, started, res)
    }

    /// Sets the size of `node`, freeing or zero-extending its data.
    pub fn truncate(&self, node: &NodeRef, size: u64, cred: &Cred) -> Result<()> {
        let req = SetAttrs {
            size: Some(size),
            ..Default::default()
        };
        self.setattr(node, &req, cred)
    }
}
