//! In-core file nodes and counted references to them.
//!
//! A [`FileNode`] caches one object's attributes. Size and block size are
//! atomics protected by the range lock during writes; the remaining mutable
//! fields sit behind a short-held field lock. [`NodeRef`] is a counted hold on
//! a cached node: dropping the last hold runs inactive processing inline,
//! which opens a transaction of its own, so holds that may be the last one
//! must not be dropped while the current thread has a transaction assigned.
//! Use [`NodeRef::release_async`] there instead.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, ZplError};
use crate::mount::MountInner;
use crate::range_lock::{FileGeometry, RangeLock};
use crate::store::{ObjectStore, Transaction};
use crate::types::{Attr, FileKind, NodeAttrs, NodeFlags, ObjectId, Timestamp};
use crate::vnode_lock::VnodeLock;

/// Mutable attributes guarded by the field lock.
#[derive(Clone, Debug)]
pub(crate) struct NodeFields {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub links: u64,
    pub flags: NodeFlags,
    pub parent: ObjectId,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
    pub gen: u64,
    pub rdev: u64,
    pub xattr_dir: Option<ObjectId>,
    pub symlink_target: Option<Vec<u8>>,
}

impl NodeFields {
    fn apply(&mut self, attr: &Attr) {
        match attr {
            Attr::Mode(v) => self.mode = *v,
            Attr::Uid(v) => self.uid = *v,
            Attr::Gid(v) => self.gid = *v,
            Attr::Links(v) => self.links = *v,
            Attr::Flags(v) => self.flags = *v,
            Attr::Parent(v) => self.parent = *v,
            Attr::Atime(v) => self.atime = *v,
            Attr::Mtime(v) => self.mtime = *v,
            Attr::Ctime(v) => self.ctime = *v,
            Attr::Crtime(v) => self.crtime = *v,
            Attr::Gen(v) => self.gen = *v,
            Attr::Rdev(v) => self.rdev = *v,
            Attr::XattrDir(v) => self.xattr_dir = Some(*v),
            Attr::SymlinkTarget(v) => self.symlink_target = Some(v.clone()),
            Attr::Kind(_) | Attr::Size(_) => {}
        }
    }
}

pub struct FileNode {
    id: ObjectId,
    kind: FileKind,
    fields: Mutex<NodeFields>,
    size: AtomicU64,
    block_size: AtomicU64,
    holds: AtomicU64,
    sync_opens: AtomicU32,
    atime_dirty: AtomicBool,
    unlinked: AtomicBool,
    live: AtomicBool,
    prefetch: AtomicBool,
    pub(crate) range_lock: RangeLock,
    pub(crate) vnode_lock: VnodeLock,
}

impl FileNode {
    pub(crate) fn new(id: ObjectId, kind: FileKind, fields: NodeFields, size: u64, block_size: u64) -> Self {
        Self {
            id,
            kind,
            fields: Mutex::new(fields),
            size: AtomicU64::new(size),
            block_size: AtomicU64::new(block_size),
            holds: AtomicU64::new(0),
            sync_opens: AtomicU32::new(0),
            atime_dirty: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
            live: AtomicBool::new(true),
            prefetch: AtomicBool::new(true),
            range_lock: RangeLock::new(),
            vnode_lock: VnodeLock::new(),
        }
    }

    /// Builds a node from its stored attributes.
    pub(crate) fn load(store: &dyn ObjectStore, id: ObjectId) -> Result<Self> {
        let attrs = store.attrs_lookup(id, None)?;
        let block_size = store.block_size(id)?;
        let mut kind = None;
        let mut size = 0;
        let t = Timestamp::default();
        let mut fields = NodeFields {
            mode: 0,
            uid: 0,
            gid: 0,
            links: 0,
            flags: NodeFlags::empty(),
            parent: id,
            atime: t,
            mtime: t,
            ctime: t,
            crtime: t,
            gen: 0,
            rdev: 0,
            xattr_dir: None,
            symlink_target: None,
        };
        for attr in &attrs {
            match attr {
                Attr::Kind(k) => kind = Some(*k),
                Attr::Size(s) => size = *s,
                other => fields.apply(other),
            }
        }
        let kind = kind.ok_or_else(|| ZplError::Internal(format!("object {} has no kind attribute", id)))?;
        // Only nodes left in the unlinked set are stored without links.
        let unlinked = fields.links == 0;
        let node = Self::new(id, kind, fields, size, block_size);
        node.set_unlinked(unlinked);
        Ok(node)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn links(&self) -> u64 {
        self.fields.lock().links
    }

    pub fn mode(&self) -> u32 {
        self.fields.lock().mode
    }

    pub fn uid(&self) -> u32 {
        self.fields.lock().uid
    }

    pub fn gid(&self) -> u32 {
        self.fields.lock().gid
    }

    pub fn flags(&self) -> NodeFlags {
        self.fields.lock().flags
    }

    pub fn parent(&self) -> ObjectId {
        self.fields.lock().parent
    }

    pub fn xattr_dir(&self) -> Option<ObjectId> {
        self.fields.lock().xattr_dir
    }

    /// Whether the node belongs to an extended-attribute namespace.
    pub fn is_xattr(&self) -> bool {
        self.flags().contains(NodeFlags::XATTR)
    }

    /// Last directory link removed; destroyed when the last hold drops.
    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    /// False once the node has been reclaimed or the mount torn down.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn holds(&self) -> u64 {
        self.holds.load(Ordering::Acquire)
    }

    /// Opens with a synchronous flag that have not been closed yet.
    pub fn sync_opens(&self) -> u32 {
        self.sync_opens.load(Ordering::Acquire)
    }

    /// Byte ranges currently locked on this file.
    pub fn ranges_held(&self) -> usize {
        self.range_lock.held_count()
    }

    pub fn is_vnode_locked(&self) -> bool {
        self.vnode_lock.is_locked()
    }

    pub fn atime_dirty(&self) -> bool {
        self.atime_dirty.load(Ordering::Acquire)
    }

    /// Snapshot of every attribute.
    pub fn attrs(&self) -> NodeAttrs {
        let f = self.fields.lock();
        NodeAttrs {
            id: self.id,
            kind: self.kind,
            mode: f.mode,
            uid: f.uid,
            gid: f.gid,
            size: self.size(),
            links: f.links,
            flags: f.flags,
            parent: f.parent,
            atime: f.atime,
            mtime: f.mtime,
            ctime: f.ctime,
            crtime: f.crtime,
            gen: f.gen,
            rdev: f.rdev,
            block_size: self.block_size(),
            xattr_dir: f.xattr_dir,
        }
    }

    pub(crate) fn symlink_target(&self) -> Option<Vec<u8>> {
        self.fields.lock().symlink_target.clone()
    }

    /// Takes the field lock.
    pub(crate) fn fields(&self) -> MutexGuard<'_, NodeFields> {
        self.fields.lock()
    }

    pub(crate) fn geometry(&self, max_block_size: u64) -> FileGeometry {
        FileGeometry {
            size: self.size(),
            block_size: self.block_size(),
            max_block_size,
        }
    }

    /// Raises the cached size to at least `end`. Tolerates concurrent extenders.
    pub(crate) fn extend_size(&self, end: u64) -> u64 {
        let mut current = self.size.load(Ordering::Acquire);
        while current < end {
            match self
                .size
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return end,
                Err(actual) => current = actual,
            }
        }
        current
    }

    pub(crate) fn force_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub(crate) fn set_block_size(&self, block_size: u64) {
        self.block_size.store(block_size, Ordering::Release);
    }

    pub(crate) fn set_unlinked(&self, unlinked: bool) {
        self.unlinked.store(unlinked, Ordering::Release);
    }

    pub(crate) fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
        self.vnode_lock.doom();
    }

    pub(crate) fn sync_open(&self) {
        self.sync_opens.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sync_close(&self) {
        let _ = self
            .sync_opens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Re-arms directory prefetch; returns whether it was armed before.
    pub(crate) fn take_prefetch(&self) -> bool {
        self.prefetch.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn arm_prefetch(&self) {
        self.prefetch.store(true, Ordering::Release);
    }

    /// Stamps the access time in core only; written back by the next
    /// attribute update or inactive processing.
    pub(crate) fn touch_atime(&self) {
        self.fields.lock().atime = Timestamp::now();
        self.atime_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_atime_dirty(&self) -> bool {
        self.atime_dirty.swap(false, Ordering::AcqRel)
    }

    /// Stages `attrs` in `tx` and applies them in core once staged. A dirty
    /// access time rides along.
    pub(crate) fn update(&self, store: &dyn ObjectStore, tx: &mut Transaction, attrs: &[Attr]) -> Result<()> {
        self.adjust(store, tx, |_, _| attrs.to_vec())
    }

    /// Like [`FileNode::update`], but `change` computes the attributes from
    /// the current fields and size. Computing, staging and applying all happen
    /// under one hold of the field lock, so concurrent read-modify-write
    /// updates (link counts, directory sizes, flag bits) never lose each
    /// other. `change` must not call back into this node's field accessors.
    pub(crate) fn adjust<F>(&self, store: &dyn ObjectStore, tx: &mut Transaction, change: F) -> Result<()>
    where
        F: FnOnce(&NodeFields, u64) -> Vec<Attr>,
    {
        let mut f = self.fields.lock();
        let mut all = change(&f, self.size());
        if self.atime_dirty() && !all.iter().any(|a| matches!(a, Attr::Atime(_))) {
            all.push(Attr::Atime(f.atime));
        }
        store.attrs_update(tx, self.id, &all)?;
        self.clear_atime_dirty();
        for attr in &all {
            match attr {
                Attr::Size(s) => self.size.store(*s, Ordering::Release),
                other => f.apply(other),
            }
        }
        Ok(())
    }

    fn hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this was the last hold.
    fn rele(&self) -> bool {
        self.holds.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl fmt::Debug for FileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("holds", &self.holds())
            .field("unlinked", &self.is_unlinked())
            .finish()
    }
}

/// A counted hold on a cached node.
pub struct NodeRef {
    node: Arc<FileNode>,
    mount: Arc<MountInner>,
}

impl NodeRef {
    pub(crate) fn new(mount: &Arc<MountInner>, node: Arc<FileNode>) -> Self {
        node.hold();
        Self {
            node,
            mount: Arc::clone(mount),
        }
    }

    pub(crate) fn mount(&self) -> &Arc<MountInner> {
        &self.mount
    }

    pub(crate) fn node(&self) -> &Arc<FileNode> {
        &self.node
    }

    /// Same in-core node.
    pub fn same(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Hands the hold to the release worker instead of dropping it here.
    pub fn release_async(self) {
        let releaser = Arc::clone(&self.mount);
        releaser.releaser.defer(self);
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        NodeRef::new(&self.mount, Arc::clone(&self.node))
    }
}

impl Deref for NodeRef {
    type Target = FileNode;

    fn deref(&self) -> &FileNode {
        &self.node
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        if self.node.rele() {
            self.mount.inactive(&self.node);
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.node.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_fields(links: u64) -> NodeFields {
        let t = Timestamp::new(1, 0);
        NodeFields {
            mode: 0o644,
            uid: 1,
            gid: 1,
            links,
            flags: NodeFlags::empty(),
            parent: ObjectId::new(4),
            atime: t,
            mtime: t,
            ctime: t,
            crtime: t,
            gen: 1,
            rdev: 0,
            xattr_dir: None,
            symlink_target: None,
        }
    }

    #[test]
    fn test_extend_size_is_monotonic() {
        let node = FileNode::new(ObjectId::new(9), FileKind::Regular, make_fields(1), 100, 512);
        assert_eq!(node.extend_size(50), 100);
        assert_eq!(node.size(), 100);
        assert_eq!(node.extend_size(150), 150);
        assert_eq!(node.size(), 150);
    }

    #[test]
    fn test_new_node_is_not_unlinked() {
        let node = FileNode::new(ObjectId::new(9), FileKind::Regular, make_fields(0), 0, 512);
        assert!(!node.is_unlinked());
        node.set_unlinked(true);
        assert!(node.is_unlinked());
    }

    #[test]
    fn test_sync_close_never_underflows() {
        let node = FileNode::new(ObjectId::new(9), FileKind::Regular, make_fields(1), 0, 512);
        node.sync_close();
        assert_eq!(node.sync_opens(), 0);
        node.sync_open();
        node.sync_close();
        assert_eq!(node.sync_opens(), 0);
    }

    #[test]
    fn test_mark_dead_dooms_vnode_lock() {
        let node = FileNode::new(ObjectId::new(9), FileKind::Regular, make_fields(1), 0, 512);
        node.mark_dead();
        assert!(!node.is_live());
        assert!(node.vnode_lock.is_doomed());
    }

    #[test]
    fn test_prefetch_rearm() {
        let node = FileNode::new(ObjectId::new(9), FileKind::Directory, make_fields(2), 2, 512);
        assert!(node.take_prefetch());
        assert!(!node.take_prefetch());
        node.arm_prefetch();
        assert!(node.take_prefetch());
    }
}
