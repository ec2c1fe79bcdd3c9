//! Vnode lock acquisition for rename.
//!
//! A rename locks up to four nodes: source directory, source node, target
//! directory and target node. Only the source directory is locked blocking.
//! Every other lock is tried without waiting; on contention everything held
//! is dropped, the contended lock is taken and released once with a blocking
//! wait, and acquisition starts over. The two entries are re-resolved under
//! the mount guard on every pass, and the guard is left again before any
//! further lock is attempted. A resolved node reclaimed in the meantime is
//! resolved again; only a reclaimed source or target directory is an error.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::dirent::is_dot_or_dotdot;
use crate::error::{Result, ZplError};
use crate::mount::MountInner;
use crate::node::NodeRef;
use crate::stats::ZplStats;
use crate::vnode_lock::VnodeLockError;

/// Acquisition progress, reported in traces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RelockState {
    LockingSourceDir,
    LockingTargetDir,
    ResolvingIdentities,
    LockingSourceNode,
    LockingTargetNode,
    Done,
}

/// Vnode locks held in acquisition order, released in reverse on drop.
#[derive(Default)]
pub(crate) struct HeldLocks {
    nodes: Vec<NodeRef>,
}

impl HeldLocks {
    fn push(&mut self, node: &NodeRef) {
        self.nodes.push(node.clone());
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        for node in self.nodes.iter().rev() {
            node.vnode_lock.unlock();
        }
    }
}

/// All nodes of a rename, locked and resolved.
pub(crate) struct RenameLocks {
    pub sdir: NodeRef,
    pub tdir: NodeRef,
    pub snode: NodeRef,
    pub tnode: Option<NodeRef>,
    held: HeldLocks,
}

impl RenameLocks {
    pub(crate) fn held(&self) -> usize {
        self.held.len()
    }
}

enum Attempt {
    Locked(RenameLocks),
    /// Contended on this node; wait for it and start over.
    Contended(NodeRef),
    /// A resolved entry was reclaimed under us; resolve again.
    Stale(NodeRef),
}

fn map_lock_error(err: VnodeLockError) -> ZplError {
    match err {
        VnodeLockError::Busy => ZplError::Busy,
        VnodeLockError::Doomed => ZplError::Io,
    }
}

impl MountInner {
    /// Locks and resolves every node of a rename of `sdir/sname` to
    /// `tdir/tname`. On error nothing is left locked.
    pub(crate) fn rename_relock(
        self: &Arc<Self>,
        sdir: &NodeRef,
        sname: &[u8],
        tdir: &NodeRef,
        tname: &[u8],
    ) -> Result<RenameLocks> {
        let mut passes = 0u32;
        loop {
            passes += 1;
            match self.relock_pass(sdir, sname, tdir, tname)? {
                Attempt::Locked(locks) => {
                    trace!(state = ?RelockState::Done, passes, held = locks.held(), "rename locks acquired");
                    return Ok(locks);
                }
                Attempt::Contended(node) => {
                    ZplStats::bump(&self.stats.rename_relocks);
                    debug!(object = %node.id(), passes, "rename lock contended, relocking");
                    // A doomed wait falls through: the next pass fails on a
                    // dead directory and re-resolves anything else.
                    if node.vnode_lock.lock().is_ok() {
                        node.vnode_lock.unlock();
                    }
                }
                Attempt::Stale(node) => {
                    ZplStats::bump(&self.stats.rename_relocks);
                    debug!(object = %node.id(), passes, "rename entry reclaimed, relocking");
                }
            }
        }
    }

    fn relock_pass(
        self: &Arc<Self>,
        sdir: &NodeRef,
        sname: &[u8],
        tdir: &NodeRef,
        tname: &[u8],
    ) -> Result<Attempt> {
        let mut held = HeldLocks::default();

        trace!(state = ?RelockState::LockingSourceDir, object = %sdir.id());
        sdir.vnode_lock.lock().map_err(map_lock_error)?;
        held.push(sdir);

        trace!(state = ?RelockState::LockingTargetDir, object = %tdir.id());
        if !tdir.same(sdir) {
            match tdir.vnode_lock.try_lock() {
                Ok(()) => held.push(tdir),
                Err(VnodeLockError::Busy) => return Ok(Attempt::Contended(tdir.clone())),
                Err(e) => return Err(map_lock_error(e)),
            }
        }

        trace!(state = ?RelockState::ResolvingIdentities);
        let (snode, tnode) = {
            let _guard = self.enter()?;
            if !sdir.is_live() || !tdir.is_live() {
                return Err(ZplError::Io);
            }
            let snode = match self.resolve_entry(sdir, sname) {
                Ok(Some(node)) => node,
                Ok(None) if is_dot_or_dotdot(sname) => {
                    return Err(ZplError::InvalidArgument("cannot rename \".\" or \"..\""))
                }
                Ok(None) => return Err(ZplError::NotFound),
                Err(e) => return Err(e),
            };
            if tname == b".." {
                return Err(ZplError::InvalidArgument("cannot rename onto \"..\""));
            }
            let tnode = self.resolve_entry(tdir, tname)?;
            (snode, tnode)
        };

        trace!(state = ?RelockState::LockingSourceNode, object = %snode.id());
        if snode.same(tdir) {
            return Err(ZplError::InvalidArgument("source is the target directory"));
        }
        if !snode.same(sdir) {
            match snode.vnode_lock.try_lock() {
                Ok(()) => held.push(&snode),
                Err(VnodeLockError::Busy) => return Ok(Attempt::Contended(snode)),
                Err(VnodeLockError::Doomed) => return Ok(Attempt::Stale(snode)),
            }
        }

        if let Some(t) = &tnode {
            trace!(state = ?RelockState::LockingTargetNode, object = %t.id());
            if !t.same(&snode) && !t.same(sdir) && !t.same(tdir) {
                match t.vnode_lock.try_lock() {
                    Ok(()) => held.push(t),
                    Err(VnodeLockError::Busy) => return Ok(Attempt::Contended(t.clone())),
                    Err(VnodeLockError::Doomed) => return Ok(Attempt::Stale(t.clone())),
                }
            }
        }

        Ok(Attempt::Locked(RenameLocks {
            sdir: sdir.clone(),
            tdir: tdir.clone(),
            snode,
            tnode,
            held,
        }))
    }

    /// Looks `name` up in `dir` without taking its entry lock.
    pub(crate) fn resolve_entry(self: &Arc<Self>, dir: &NodeRef, name: &[u8]) -> Result<Option<NodeRef>> {
        if dir.is_unlinked() {
            return Err(ZplError::NotFound);
        }
        match self.dir_lookup(dir.id(), name)? {
            Some((_, id)) => Ok(Some(self.get_node(id)?)),
            None => Ok(None),
        }
    }
}
