//! Mounted file system instance.
//!
//! [`Mount`] is the handle callers use; it wraps a shared [`MountInner`] that
//! node references point back to. The master object maps well-known names to
//! the root directory, the unlinked set and the identity table.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SyncPolicy, ZplConfig};
use crate::create::{mknode, NodeOrigin, NodeSpec};
use crate::dirent::DirLocks;
use crate::error::{Result, ZplError};
use crate::fuid::FuidTable;
use crate::guard::{MountGuard, Teardown};
use crate::node::{FileNode, NodeRef};
use crate::pagecache::{NoPageCache, PageCache};
use crate::policy::{
    AccessPolicy, ContentScanner, LockChecker, NoMandatoryLocks, NoQuota, NoScanner, PosixAccessPolicy,
    QuotaPolicy,
};
use crate::release::Releaser;
use crate::stats::{VnodeOp, ZplStats, ZplStatsSnapshot};
use crate::store::{AssignOutcome, ObjectStore, ObjectType, Transaction, TxWait};
use crate::types::{Attr, FileKind, NewNodeAttrs, NodeFlags, ObjectId, Timestamp, Txg};
use crate::zil::{IntentLog, LogOp};

pub(crate) const MASTER_ROOT: &[u8] = b"ROOT";
pub(crate) const MASTER_UNLINKED: &[u8] = b"DELETE_QUEUE";
pub(crate) const MASTER_FUID: &[u8] = b"FUID";

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

/// Policy collaborators consulted by the vnode operations.
#[derive(Clone)]
pub struct Collaborators {
    pub access: Arc<dyn AccessPolicy>,
    pub quota: Arc<dyn QuotaPolicy>,
    pub scanner: Arc<dyn ContentScanner>,
    pub locks: Arc<dyn LockChecker>,
    pub pages: Arc<dyn PageCache>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            access: Arc::new(PosixAccessPolicy),
            quota: Arc::new(NoQuota),
            scanner: Arc::new(NoScanner),
            locks: Arc::new(NoMandatoryLocks),
            pages: Arc::new(NoPageCache),
        }
    }
}

pub(crate) struct MountInner {
    pub(crate) id: u64,
    pub(crate) config: ZplConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) log: Arc<dyn IntentLog>,
    pub(crate) collab: Collaborators,
    pub(crate) teardown: Teardown,
    pub(crate) nodes: DashMap<ObjectId, Arc<FileNode>>,
    pub(crate) dirlocks: DirLocks,
    pub(crate) root_id: ObjectId,
    pub(crate) unlinked_id: ObjectId,
    pub(crate) fuids: FuidTable,
    replaying: AtomicBool,
    /// End of file forced by the write record being replayed.
    pub(crate) replay_eof: Mutex<Option<u64>>,
    pub(crate) releaser: Releaser,
    pub(crate) stats: ZplStats,
}

impl MountInner {
    pub(crate) fn enter(&self) -> Result<MountGuard<'_>> {
        self.teardown.enter()
    }

    /// Fails with EIO for a node evicted or torn down since it was looked up.
    pub(crate) fn verify(&self, node: &FileNode) -> Result<()> {
        if node.is_live() {
            Ok(())
        } else {
            Err(ZplError::Io)
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            Err(ZplError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    pub(crate) fn set_replaying(&self, on: bool) {
        self.replaying.store(on, Ordering::Release);
    }

    /// Returns a hold on the cached node for `id`, loading it if needed.
    pub(crate) fn get_node(self: &Arc<Self>, id: ObjectId) -> Result<NodeRef> {
        if let Some(node) = self.nodes.get(&id) {
            if node.is_live() {
                return Ok(NodeRef::new(self, Arc::clone(&node)));
            }
        }
        let loaded = Arc::new(FileNode::load(self.store.as_ref(), id)?);
        let node = match self.nodes.entry(id) {
            Entry::Occupied(mut e) => {
                if !e.get().is_live() {
                    e.insert(Arc::clone(&loaded));
                }
                Arc::clone(e.get())
            }
            Entry::Vacant(e) => Arc::clone(e.insert(loaded).value()),
        };
        Ok(NodeRef::new(self, node))
    }

    /// Caches a node created by the current operation.
    pub(crate) fn cache_node(self: &Arc<Self>, node: FileNode) -> NodeRef {
        let node = Arc::new(node);
        self.nodes.insert(node.id(), Arc::clone(&node));
        NodeRef::new(self, node)
    }

    /// Appends `op` to the intent log unless it is being replayed.
    pub(crate) fn log_op(&self, txg: Txg, op: LogOp) -> Result<()> {
        if self.is_replaying() {
            return Ok(());
        }
        let name = op.name();
        let object = op.object();
        let seq = self.log.append(txg, op)?;
        ZplStats::bump(&self.stats.log_records);
        debug!(op = name, %object, txg, seq, "logged");
        Ok(())
    }

    pub(crate) fn commit(&self, tx: Transaction) -> Result<Txg> {
        Ok(self.store.tx_commit(tx)?)
    }

    /// Makes logged records for `object` (all objects if `None`) durable.
    pub(crate) fn flush_log(&self, object: Option<ObjectId>) -> Result<()> {
        if self.config.sync == SyncPolicy::Disabled || self.is_replaying() {
            return Ok(());
        }
        self.log.flush(object)?;
        ZplStats::bump(&self.stats.log_flushes);
        Ok(())
    }

    pub(crate) fn sync_always(&self) -> bool {
        self.config.sync == SyncPolicy::Always
    }

    pub(crate) fn finish<T>(&self, op: VnodeOp, started: Instant, res: Result<T>) -> Result<T> {
        self.stats
            .record_op(op, started.elapsed().as_micros() as u64, res.is_ok());
        if let Err(e) = &res {
            debug!(op = op.as_str(), error = %e, "operation failed");
        }
        res
    }

    /// Runs when the last hold on `node` is dropped.
    pub(crate) fn inactive(self: &Arc<Self>, node: &Arc<FileNode>) {
        let Ok(_guard) = self.teardown.enter() else {
            return;
        };
        if node.holds() != 0 || !node.is_live() || self.config.read_only {
            return;
        }
        if node.is_unlinked() {
            if let Err(e) = self.rmnode(node) {
                warn!(object = %node.id(), error = %e, "destroying unlinked node failed");
            }
        } else if node.atime_dirty() {
            if let Err(e) = self.write_atime(node) {
                warn!(object = %node.id(), error = %e, "writing back access time failed");
            }
        }
    }

    fn write_atime(&self, node: &FileNode) -> Result<()> {
        let assigned = self.assign_with_retry("atime", |_| {
            let mut tx = self.store.tx_create();
            tx.hold_attrs(node.id());
            Ok(((), tx))
        })?;
        let mut tx = assigned.tx;
        let atime = node.fields().atime;
        let res = node.update(self.store.as_ref(), &mut tx, &[Attr::Atime(atime)]);
        self.commit(tx)?;
        res
    }

    fn master_lookup(store: &dyn ObjectStore, name: &[u8]) -> Result<ObjectId> {
        store
            .map_lookup(ObjectId::MASTER, name, None)?
            .map(ObjectId::new)
            .ok_or_else(|| {
                ZplError::Internal(format!(
                    "store is not formatted: missing {}",
                    String::from_utf8_lossy(name)
                ))
            })
    }
}

/// Handle to a mounted file system.
#[derive(Clone)]
pub struct Mount {
    pub(crate) inner: Arc<MountInner>,
}

impl Mount {
    /// Lays out a new file system in an empty store and mounts it.
    pub fn format(
        store: Arc<dyn ObjectStore>,
        log: Arc<dyn IntentLog>,
        config: ZplConfig,
        collab: Collaborators,
    ) -> Result<Mount> {
        if store.map_lookup(ObjectId::MASTER, MASTER_ROOT, None)?.is_some() {
            return Err(ZplError::Exists);
        }
        let mut tx = store.tx_create();
        tx.hold_attrs_create(2048);
        tx.hold_map(None, true, None);
        tx.hold_map(None, true, None);
        tx.hold_map(Some(ObjectId::MASTER), true, None);
        let txg = match store.tx_assign(&mut tx, TxWait::Wait)? {
            AssignOutcome::Assigned(txg) => txg,
            AssignOutcome::Restart => {
                store.tx_abort(tx);
                return Err(ZplError::Busy);
            }
        };

        let attrs = NewNodeAttrs {
            kind: FileKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: NodeFlags::empty(),
            time: Timestamp::now(),
        };
        let spec = NodeSpec {
            attrs: &attrs,
            origin: NodeOrigin::Root,
            claim: None,
            target: None,
        };
        let root = mknode(store.as_ref(), &mut tx, None, &spec, txg)?;
        let unlinked = store.object_alloc(&mut tx, ObjectType::Map, 512)?;
        let fuid = store.object_alloc(&mut tx, ObjectType::PlainFile, 512)?;
        store.attrs_update(&mut tx, fuid, &[Attr::Size(0)])?;
        store.map_add(&mut tx, ObjectId::MASTER, MASTER_ROOT, root.id().as_u64())?;
        store.map_add(&mut tx, ObjectId::MASTER, MASTER_UNLINKED, unlinked.as_u64())?;
        store.map_add(&mut tx, ObjectId::MASTER, MASTER_FUID, fuid.as_u64())?;
        store.tx_commit(tx)?;
        let synced = store.sync()?;
        info!(root = %root.id(), txg = synced, "file system formatted");
        Mount::open(store, log, config, collab)
    }

    /// Mounts an existing file system: destroys objects left unlinked by a
    /// crash, then replays the intent log.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        log: Arc<dyn IntentLog>,
        config: ZplConfig,
        collab: Collaborators,
    ) -> Result<Mount> {
        config
            .validate()
            .map_err(|e| ZplError::Internal(format!("invalid configuration: {}", e)))?;
        let root_id = MountInner::master_lookup(store.as_ref(), MASTER_ROOT)?;
        let unlinked_id = MountInner::master_lookup(store.as_ref(), MASTER_UNLINKED)?;
        let fuid_id = MountInner::master_lookup(store.as_ref(), MASTER_FUID)?;
        let fuids = FuidTable::load(store.as_ref(), fuid_id)?;
        let read_only = config.read_only;

        let inner = Arc::new(MountInner {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            store,
            log,
            collab,
            teardown: Teardown::new(),
            nodes: DashMap::new(),
            dirlocks: DirLocks::default(),
            root_id,
            unlinked_id,
            fuids,
            replaying: AtomicBool::new(false),
            replay_eof: Mutex::new(None),
            releaser: Releaser::start()?,
            stats: ZplStats::new(),
        });
        let mount = Mount { inner };
        info!(mount = mount.inner.id, root = %root_id, read_only, "mounted");

        if !read_only {
            let drained = mount.inner.drain_unlinked()?;
            if drained > 0 {
                info!(mount = mount.inner.id, drained, "unlinked set drained");
            }
            mount.replay()?;
        }
        Ok(mount)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &ZplConfig {
        &self.inner.config
    }

    pub fn is_live(&self) -> bool {
        self.inner.teardown.is_live()
    }

    pub fn root(&self) -> Result<NodeRef> {
        let _guard = self.inner.enter()?;
        self.inner.get_node(self.inner.root_id)
    }

    /// Looks a node up by object id, as a file handle would.
    pub fn node(&self, id: ObjectId) -> Result<NodeRef> {
        let _guard = self.inner.enter()?;
        self.inner.get_node(id)
    }

    pub fn stats(&self) -> ZplStatsSnapshot {
        self.inner.stats.snapshot(self.inner.releaser.released())
    }

    /// Number of objects waiting in the unlinked set.
    pub fn unlinked_count(&self) -> Result<u64> {
        Ok(self.inner.store.map_count(self.inner.unlinked_id)?)
    }

    pub fn cached_nodes(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Directory entry locks currently held across the mount.
    pub fn dirent_locks_held(&self) -> usize {
        self.inner.dirlocks.held_count()
    }

    /// Forces the open transaction group to disk and trims the log.
    pub fn sync(&self) -> Result<Txg> {
        let txg = self.inner.store.sync()?;
        self.inner.log.clean(txg);
        debug!(mount = self.inner.id, txg, "synced");
        Ok(txg)
    }

    /// Blocks until every deferred release queued so far has run.
    pub fn drain_releases(&self) {
        self.inner.releaser.drain();
    }

    /// Evicts one cached node. Outstanding holds see it as dead and fail
    /// with EIO; the next lookup loads a fresh node.
    pub fn reclaim(&self, id: ObjectId) -> bool {
        match self.inner.nodes.remove(&id) {
            Some((_, node)) => {
                node.mark_dead();
                debug!(object = %id, "node reclaimed");
                true
            }
            None => false,
        }
    }

    /// Drains in-flight operations, then marks the mount and every cached
    /// node dead.
    pub fn unmount(&self) -> Result<()> {
        self.inner.releaser.drain();
        {
            let teardown = self.inner.teardown.begin_teardown();
            if !self.inner.teardown.is_live() {
                return Err(ZplError::Unmounted);
            }
            teardown.mark_dead();
            for node in self.inner.nodes.iter() {
                node.mark_dead();
            }
            self.inner.nodes.clear();
        }
        let txg = if self.inner.config.read_only {
            self.inner.store.synced_txg()
        } else {
            let txg = self.inner.store.sync()?;
            self.inner.log.clean(txg);
            txg
        };
        info!(mount = self.inner.id, txg, "unmounted");
        Ok(())
    }
}
