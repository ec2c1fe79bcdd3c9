//! Deferred destruction of unlinked nodes.
//!
//! A node that loses its last link while still referenced is parked in the
//! mount's unlinked set. It is destroyed when its last in-memory hold drops,
//! or at the next mount if the system crashed first.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::dirent::{decode_entry, link_destroy, LinkMode};
use crate::error::{Result, ZplError};
use crate::mount::MountInner;
use crate::node::{FileNode, NodeRef};
use crate::stats::ZplStats;
use crate::store::Transaction;
use crate::types::{Attr, ObjectId};

fn unlinked_key(id: ObjectId) -> [u8; 8] {
    id.as_u64().to_be_bytes()
}

impl MountInner {
    pub(crate) fn unlinked_add(&self, tx: &mut Transaction, id: ObjectId) -> Result<()> {
        self.store
            .map_add(tx, self.unlinked_id, &unlinked_key(id), id.as_u64())?;
        debug!(object = %id, "added to unlinked set");
        Ok(())
    }

    pub(crate) fn unlinked_remove(&self, tx: &mut Transaction, id: ObjectId) -> Result<()> {
        self.store.map_remove(tx, self.unlinked_id, &unlinked_key(id))?;
        Ok(())
    }

    /// Destroys every object left in the unlinked set. Returns how many were
    /// processed.
    pub(crate) fn drain_unlinked(self: &Arc<Self>) -> Result<usize> {
        let entries = self.store.map_list(self.unlinked_id, 0, usize::MAX)?;
        let mut drained = 0;
        for entry in entries {
            let id = ObjectId::new(entry.value);
            match self.get_node(id) {
                Ok(node) => {
                    if !node.is_unlinked() {
                        warn!(object = %id, links = node.links(), "linked node found in unlinked set");
                        continue;
                    }
                    drop(node);
                    drained += 1;
                }
                Err(ZplError::NotFound) => {
                    self.forget_unlinked(id)?;
                    drained += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(drained)
    }

    /// Drops a stale unlinked-set entry whose object is already gone.
    fn forget_unlinked(&self, id: ObjectId) -> Result<()> {
        let assigned = self.assign_with_retry("unlinked", |_| {
            let mut tx = self.store.tx_create();
            tx.hold_map(Some(self.unlinked_id), false, None);
            tx.mark_netfree();
            Ok(((), tx))
        })?;
        let mut tx = assigned.tx;
        let res = self.unlinked_remove(&mut tx, id);
        self.commit(tx)?;
        res
    }

    /// Unlinks every entry of a directory being destroyed. Only attribute
    /// directories are destroyed with entries in them.
    fn purge_dir(self: &Arc<Self>, dir: &Arc<FileNode>) -> Result<usize> {
        let entries = self.store.map_list(dir.id(), 0, usize::MAX)?;
        let mut skipped = 0;
        for entry in entries {
            let (_, id) = decode_entry(entry.value)?;
            let child = self.get_node(id)?;
            let assigned = self.assign_with_retry("purge", |_| {
                let mut tx = self.store.tx_create();
                tx.hold_map(Some(dir.id()), false, Some(&entry.name));
                tx.hold_attrs(child.id());
                tx.hold_map(Some(self.unlinked_id), true, None);
                tx.mark_netfree();
                Ok(((), tx))
            })?;
            let mut tx = assigned.tx;
            let res = link_destroy(self.store.as_ref(), dir, &entry.name, &child, &mut tx, LinkMode::Normal)
                .and_then(|unlinked| {
                    if unlinked {
                        self.unlinked_add(&mut tx, child.id())?;
                    }
                    Ok(())
                });
            self.commit(tx)?;
            if let Err(e) = res {
                debug!(object = %child.id(), error = %e, "purge skipped entry");
                skipped += 1;
            }
            drop(child);
        }
        Ok(skipped)
    }

    /// Frees an unlinked node's object and removes it from the unlinked set.
    pub(crate) fn rmnode(self: &Arc<Self>, node: &Arc<FileNode>) -> Result<()> {
        if node.is_dir() && self.store.map_count(node.id())? > 0 && self.purge_dir(node)? > 0 {
            // Entries that could not be removed keep the directory around
            // until the next drain.
            return Ok(());
        }

        let xattr: Option<NodeRef> = match node.xattr_dir() {
            Some(xid) => match self.get_node(xid) {
                Ok(x) => Some(x),
                Err(ZplError::NotFound) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let assigned = self.assign_with_retry("rmnode", |_| {
            let mut tx = self.store.tx_create();
            tx.hold_free(node.id(), 0, u64::MAX);
            tx.hold_map(Some(self.unlinked_id), false, None);
            if let Some(x) = &xattr {
                tx.hold_attrs(x.id());
                tx.hold_map(Some(self.unlinked_id), true, None);
            }
            tx.mark_netfree();
            Ok(((), tx))
        })?;
        let mut tx = assigned.tx;
        let res = self.destroy_in_tx(&mut tx, node, xattr.as_deref());
        let txg = self.commit(tx)?;
        res?;

        self.nodes.remove_if(&node.id(), |_, cached| Arc::ptr_eq(cached, node));
        node.mark_dead();
        ZplStats::bump(&self.stats.nodes_destroyed);
        debug!(object = %node.id(), txg, "node destroyed");
        // The attribute directory is now unlinked too; dropping the last hold
        // destroys it in a transaction of its own.
        drop(xattr);
        Ok(())
    }

    fn destroy_in_tx(&self, tx: &mut Transaction, node: &FileNode, xattr: Option<&FileNode>) -> Result<()> {
        if let Some(x) = xattr {
            x.update(self.store.as_ref(), tx, &[Attr::Links(0)])?;
            x.set_unlinked(true);
            self.unlinked_add(tx, x.id())?;
        }
        self.store.object_free(tx, node.id())?;
        self.unlinked_remove(tx, node.id())
    }
}
