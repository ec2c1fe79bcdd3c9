//! Rename.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::config::SameObjectRename;
use crate::dirent::{is_dot_or_dotdot, link_create, link_destroy, validate_name, LinkMode};
use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::{FileNode, NodeRef};
use crate::policy::AccessMode;
use crate::rename_lock::RenameLocks;
use crate::stats::{VnodeOp, ZplStats};
use crate::store::Transaction;
use crate::types::{Attr, Cred, NodeFlags};
use crate::zil::LogOp;

/// Result of the mutation step of a rename.
struct Renamed {
    /// The overwritten target lost its last link.
    target_unlinked: bool,
}

impl MountInner {
    /// Fails with EINVAL if `snode` is an ancestor of `tdir`, which would
    /// detach a subtree from the namespace.
    fn rename_check(self: &Arc<Self>, snode: &NodeRef, sdir: &NodeRef, tdir: &NodeRef) -> Result<()> {
        if tdir.same(snode) {
            return Err(ZplError::InvalidArgument("cannot move a directory into itself"));
        }
        if tdir.same(sdir) || tdir.id() == self.root_id {
            return Ok(());
        }
        let mut parent = tdir.parent();
        let mut walked: Option<NodeRef> = None;
        let res = loop {
            if parent == snode.id() {
                break Err(ZplError::InvalidArgument("cannot move a directory below itself"));
            }
            if parent == self.root_id || parent == sdir.id() {
                break Ok(());
            }
            let next = match self.get_node(parent) {
                Ok(next) => next,
                Err(e) => break Err(e),
            };
            if next.parent() == next.id() {
                break Ok(());
            }
            parent = next.parent();
            // Vnode locks are held here.
            if let Some(prev) = walked.replace(next) {
                prev.release_async();
            }
        };
        if let Some(last) = walked {
            last.release_async();
        }
        res
    }

    fn check_rename_access(&self, locks: &RenameLocks, same_object: bool, cred: &Cred) -> Result<()> {
        self.check_delete(&locks.sdir, &locks.snode, cred)?;
        self.collab
            .access
            .check_access(&locks.tdir.attrs(), cred, AccessMode::ADD_ENTRY)?;
        if let Some(t) = &locks.tnode {
            if !same_object {
                self.check_delete(&locks.tdir, t, cred)?;
            }
        }
        Ok(())
    }

    pub(crate) fn rename(
        self: &Arc<Self>,
        sdir: &NodeRef,
        sname: &[u8],
        tdir: &NodeRef,
        tname: &[u8],
        cred: &Cred,
    ) -> Result<()> {
        if !Arc::ptr_eq(sdir.mount(), self) || !Arc::ptr_eq(tdir.mount(), self) {
            return Err(ZplError::CrossDevice);
        }
        self.check_writable()?;
        if !sdir.is_dir() || !tdir.is_dir() {
            return Err(ZplError::NotDirectory);
        }
        if is_dot_or_dotdot(sname) || is_dot_or_dotdot(tname) {
            return Err(ZplError::InvalidArgument("cannot rename \".\" or \"..\""));
        }
        validate_name(sname, false)?;
        validate_name(tname, self.config.utf8_only)?;
        if sdir.same(tdir) && sname == tname {
            let _guard = self.enter()?;
            self.verify(sdir)?;
            return match self.dir_lookup(sdir.id(), sname)? {
                Some(_) => Ok(()),
                None => Err(ZplError::NotFound),
            };
        }

        let locks = self.rename_relock(sdir, sname, tdir, tname)?;
        let _guard = self.enter()?;
        for node in [&locks.sdir, &locks.tdir, &locks.snode] {
            self.verify(node)?;
        }
        if let Some(t) = &locks.tnode {
            self.verify(t)?;
        }

        let same_object = locks.tnode.as_ref().is_some_and(|t| t.same(&locks.snode));
        if same_object && self.config.same_object_rename == SameObjectRename::Noop {
            debug!(object = %locks.snode.id(), "rename onto the same object");
            return Ok(());
        }
        if locks.sdir.is_xattr() != locks.tdir.is_xattr() {
            return Err(ZplError::InvalidArgument("rename across attribute namespaces"));
        }

        self.check_rename_access(&locks, same_object, cred)?;

        let snode = &locks.snode;
        if snode.is_dir() {
            if snode.same(&locks.sdir) {
                return Err(ZplError::InvalidArgument("cannot rename a directory onto itself"));
            }
            self.rename_check(snode, &locks.sdir, &locks.tdir)?;
        }
        if let Some(t) = &locks.tnode {
            if !same_object {
                if snode.is_dir() && !t.is_dir() {
                    return Err(ZplError::NotDirectory);
                }
                if !snode.is_dir() && t.is_dir() {
                    return Err(ZplError::IsDirectory);
                }
            }
        }

        let assigned = self.assign_with_retry("rename", |_| {
            // Entry locks in a fixed order so two renames never wait on each other.
            let skey = (locks.sdir.id(), sname);
            let tkey = (locks.tdir.id(), tname);
            let (first, second) = if skey <= tkey { (skey, tkey) } else { (tkey, skey) };
            let first = self.dirlocks.lock(first.0, first.1);
            let second = self.dirlocks.lock(second.0, second.1);

            // Creates and removes take only entry locks; confirm the names still
            // resolve to what was locked.
            if self.dir_lookup(locks.sdir.id(), sname)?.map(|(_, id)| id) != Some(snode.id()) {
                return Err(ZplError::NotFound);
            }
            let target_now = self.dir_lookup(locks.tdir.id(), tname)?.map(|(_, id)| id);
            match (target_now, &locks.tnode) {
                (Some(now), Some(t)) if now == t.id() => {}
                (None, None) => {}
                (Some(_), None) => return Err(ZplError::Exists),
                _ => return Err(ZplError::NotFound),
            }

            let mut tx = self.store.tx_create();
            tx.hold_attrs(snode.id());
            tx.hold_attrs(locks.sdir.id());
            tx.hold_map(Some(locks.sdir.id()), false, Some(sname));
            tx.hold_map(Some(locks.tdir.id()), true, Some(tname));
            if !locks.sdir.same(&locks.tdir) {
                tx.hold_attrs(locks.tdir.id());
            }
            if let Some(t) = &locks.tnode {
                tx.hold_attrs(t.id());
            }
            tx.hold_map(Some(self.unlinked_id), true, None);
            Ok(((first, second), tx))
        })?;
        let ((first, second), mut tx, txg) = (assigned.locks, assigned.tx, assigned.txg);

        let res = self.rename_in_tx(&mut tx, &locks, sname, tname, same_object);
        let logged = match &res {
            Ok(_) => self.log_op(
                txg,
                LogOp::Rename {
                    src_parent: locks.sdir.id(),
                    src_name: sname.to_vec(),
                    dst_parent: locks.tdir.id(),
                    dst_name: tname.to_vec(),
                    object: snode.id(),
                },
            ),
            Err(_) => Ok(()),
        };
        self.commit(tx)?;
        drop(second);
        drop(first);
        drop(_guard);
        let renamed = res?;
        logged?;
        debug!(
            object = %locks.snode.id(),
            from = %locks.sdir.id(),
            to = %locks.tdir.id(),
            target_unlinked = renamed.target_unlinked,
            "renamed"
        );
        drop(locks);

        if self.sync_always() {
            self.flush_log(None)?;
        }
        Ok(())
    }

    fn rename_in_tx(
        &self,
        tx: &mut Transaction,
        locks: &RenameLocks,
        sname: &[u8],
        tname: &[u8],
        same_object: bool,
    ) -> Result<Renamed> {
        let store = self.store.as_ref();
        let (sdir, tdir, snode) = (&locks.sdir, &locks.tdir, &locks.snode);

        if same_object {
            // Only the source name goes; the target link stays.
            let unlinked = link_destroy(store, sdir, sname, snode, tx, LinkMode::Normal)?;
            if unlinked {
                self.unlinked_add(tx, snode.id())?;
            }
            return Ok(Renamed {
                target_unlinked: false,
            });
        }

        let mut target_unlinked = false;
        let mut displaced: Option<(&FileNode, u64)> = None;
        if let Some(t) = &locks.tnode {
            let links = t.links();
            target_unlinked = link_destroy(store, tdir, tname, t, tx, LinkMode::Normal)?;
            displaced = Some((t, links));
        }

        if let Err(e) = link_create(store, tdir, tname, snode, tx, LinkMode::Renaming) {
            if let Some((t, links)) = displaced {
                self.restore_target(tx, tdir, tname, t, links);
            }
            return Err(e);
        }

        let moved = snode
            .adjust(store, tx, |f, _| vec![Attr::Flags(f.flags | NodeFlags::AV_MODIFIED)])
            .and_then(|_| link_destroy(store, sdir, sname, snode, tx, LinkMode::Renaming));
        if let Err(e) = moved {
            ZplStats::bump(&self.stats.rename_rollbacks);
            warn!(object = %snode.id(), error = %e, "rename failed after linking the new name, rolling back");
            if let Err(undo) = link_destroy(store, tdir, tname, snode, tx, LinkMode::Renaming) {
                error!(object = %snode.id(), error = %undo, "rename rollback failed");
            } else {
                // The new link moved the parent pointer.
                if let Err(undo) = snode.update(store, tx, &[Attr::Parent(sdir.id())]) {
                    error!(object = %snode.id(), error = %undo, "restoring parent after rollback failed");
                }
            }
            if let Some((t, links)) = displaced {
                self.restore_target(tx, tdir, tname, t, links);
            }
            return Err(e);
        }

        if target_unlinked {
            if let Some((t, _)) = displaced {
                self.unlinked_add(tx, t.id())?;
            }
        }
        Ok(Renamed { target_unlinked })
    }

    /// Puts an overwritten target back under its name after a failed rename.
    fn restore_target(&self, tx: &mut Transaction, tdir: &FileNode, tname: &[u8], target: &FileNode, links: u64) {
        let store = self.store.as_ref();
        let res = link_create(store, tdir, tname, target, tx, LinkMode::Renaming)
            .and_then(|_| target.update(store, tx, &[Attr::Links(links)]));
        match res {
            Ok(()) => target.set_unlinked(false),
            Err(e) => error!(object = %target.id(), error = %e, "restoring rename target failed"),
        }
    }
}

impl Mount {
    /// Renames `sdir/sname` to `tdir/tname`, replacing a compatible target.
    pub fn rename(&self, sdir: &NodeRef, sname: &[u8], tdir: &NodeRef, tname: &[u8], cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.rename(sdir, sname, tdir, tname, cred);
        self.inner.finish(VnodeOp::Rename, started, res)
    }
}
