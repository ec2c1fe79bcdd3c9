//! Remove and rmdir.

use std::sync::Arc;
use std::time::Instant;

use crate::dirent::{is_dot_or_dotdot, link_destroy, DirExpect, LinkMode};
use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::{FileNode, NodeRef};
use crate::stats::VnodeOp;
use crate::types::{Cred, NodeFlags};
use crate::zil::LogOp;

impl MountInner {
    /// Flag and permission checks for unlinking `child` from `dir`.
    pub(crate) fn check_delete(&self, dir: &FileNode, child: &FileNode, cred: &Cred) -> Result<()> {
        if child
            .flags()
            .intersects(NodeFlags::IMMUTABLE | NodeFlags::NOUNLINK | NodeFlags::APPENDONLY)
        {
            return Err(ZplError::PermissionDenied("entry is protected by its flags"));
        }
        if dir.flags().intersects(NodeFlags::IMMUTABLE | NodeFlags::APPENDONLY) {
            return Err(ZplError::PermissionDenied("directory is protected by its flags"));
        }
        self.collab
            .access
            .check_delete(&dir.attrs(), &child.attrs(), cred)
    }

    pub(crate) fn remove_entry(self: &Arc<Self>, dir: &NodeRef, name: &[u8], cred: &Cred, rmdir: bool) -> Result<()> {
        let _guard = self.enter()?;
        self.verify(dir)?;
        self.check_writable()?;
        if !dir.is_dir() {
            return Err(ZplError::NotDirectory);
        }
        if is_dot_or_dotdot(name) {
            return Err(match (rmdir, name) {
                (false, _) => ZplError::PermissionDenied("cannot unlink a directory"),
                (true, b".") => ZplError::InvalidArgument("cannot remove \".\""),
                (true, _) => ZplError::NotEmpty,
            });
        }

        let op = if rmdir { "rmdir" } else { "remove" };
        let assigned = self.assign_with_retry(op, |_| {
            let (entry, child) = self.dirent_lock(dir, name, DirExpect::Exists)?;
            let child = child.ok_or(ZplError::NotFound)?;
            self.verify(&child)?;
            self.check_delete(dir, &child, cred)?;
            if rmdir && !child.is_dir() {
                return Err(ZplError::NotDirectory);
            }
            if !rmdir && child.is_dir() {
                return Err(ZplError::PermissionDenied("cannot unlink a directory"));
            }
            // The attribute directory is held across the transaction so its
            // release happens after commit.
            let xattr = match child.xattr_dir() {
                Some(id) if !rmdir => Some(self.get_node(id)?),
                _ => None,
            };

            let mut tx = self.store.tx_create();
            tx.hold_map(Some(dir.id()), false, Some(name));
            tx.hold_attrs(child.id());
            tx.hold_attrs(dir.id());
            if let Some(x) = &xattr {
                tx.hold_attrs(x.id());
            }
            tx.hold_map(Some(self.unlinked_id), false, None);
            tx.mark_netfree();
            Ok(((entry, child, xattr), tx))
        })?;
        let ((entry, child, xattr), mut tx, txg) = (assigned.locks, assigned.tx, assigned.txg);

        let res = link_destroy(self.store.as_ref(), dir, name, &child, &mut tx, LinkMode::Normal).and_then(
            |unlinked| {
                if unlinked {
                    self.unlinked_add(&mut tx, child.id())?;
                }
                Ok(())
            },
        );
        let logged = match res {
            Ok(()) => {
                let (parent, name, object) = (dir.id(), name.to_vec(), child.id());
                let record = if rmdir {
                    LogOp::Rmdir { parent, name, object }
                } else {
                    LogOp::Remove { parent, name, object }
                };
                self.log_op(txg, record)
            }
            Err(_) => Ok(()),
        };
        self.commit(tx)?;
        drop(entry);
        drop(child);
        drop(xattr);
        res?;
        logged?;

        if self.sync_always() {
            self.flush_log(None)?;
        }
        Ok(())
    }
}

impl Mount {
    /// Unlinks a non-directory entry.
    pub fn remove(&self, dir: &NodeRef, name: &[u8], cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.remove_entry(dir, name, cred, false);
        self.inner.finish(VnodeOp::Remove, started, res)
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, dir: &NodeRef, name: &[u8], cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.remove_entry(dir, name, cred, true);
        self.inner.finish(VnodeOp::Rmdir, started, res)
    }
}
