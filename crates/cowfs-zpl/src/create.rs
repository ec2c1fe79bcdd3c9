//! Node creation: create, mkdir, symlink and link.

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::dirent::{link_create, validate_name, DirExpect, LinkMode};
use crate::error::{Result, ZplError};
use crate::fuid::is_ephemeral;
use crate::mount::{Mount, MountInner};
use crate::node::{FileNode, NodeFields, NodeRef};
use crate::policy::AccessMode;
use crate::stats::VnodeOp;
use crate::store::{ObjectStore, ObjectType, Transaction};
use crate::types::{
    mode, Attr, Cred, FileKind, FlagChange, NewNodeAttrs, NodeFlags, ObjectId, Timestamp, Txg, MAXPATHLEN,
};
use crate::zil::LogOp;

/// Attribute space reserved for a new node.
pub(crate) const CREATE_ATTR_BYTES: u64 = 264;

/// Block size of a freshly created object.
pub(crate) const NEW_BLOCK_SIZE: u64 = 512;

/// Caller-supplied attributes of a node to create.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateAttrs {
    /// Permission bits, including set-id and sticky bits.
    pub mode: u32,
    pub rdev: u64,
    /// System flags requested at creation; subject to the flag policy.
    pub flags: Option<NodeFlags>,
}

impl CreateAttrs {
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeOrigin {
    Root,
    /// Hidden attribute directory of another node.
    Xattr,
    Child,
}

pub(crate) struct NodeSpec<'a> {
    pub attrs: &'a NewNodeAttrs,
    pub origin: NodeOrigin,
    /// Object id to claim instead of allocating (replay).
    pub claim: Option<ObjectId>,
    pub target: Option<&'a [u8]>,
}

/// Allocates and initializes a node within `tx`. The node is not linked
/// anywhere yet.
pub(crate) fn mknode(
    store: &dyn ObjectStore,
    tx: &mut Transaction,
    parent: Option<&FileNode>,
    spec: &NodeSpec<'_>,
    txg: Txg,
) -> Result<FileNode> {
    let attrs = spec.attrs;
    let is_dir = attrs.kind == FileKind::Directory;
    let object_type = if is_dir {
        ObjectType::Directory
    } else {
        ObjectType::PlainFile
    };
    let id = match spec.claim {
        Some(id) => {
            store.object_claim(tx, id, object_type, NEW_BLOCK_SIZE)?;
            id
        }
        None => store.object_alloc(tx, object_type, NEW_BLOCK_SIZE)?,
    };

    let (links, size) = if is_dir {
        let links = if spec.origin == NodeOrigin::Child { 1 } else { 2 };
        (links, 2)
    } else {
        (0, spec.target.map_or(0, |t| t.len() as u64))
    };
    let mut flags = attrs.flags;
    flags.remove(NodeFlags::XATTR);
    if spec.origin == NodeOrigin::Xattr || parent.map_or(false, |p| p.is_xattr()) {
        flags.insert(NodeFlags::XATTR);
    }
    let parent_id = parent.map_or(id, |p| p.id());
    let perm = attrs.mode & mode::PERM_MASK;
    let t = attrs.time;

    let mut stored = vec![
        Attr::Kind(attrs.kind),
        Attr::Mode(perm),
        Attr::Uid(attrs.uid),
        Attr::Gid(attrs.gid),
        Attr::Size(size),
        Attr::Links(links),
        Attr::Flags(flags),
        Attr::Parent(parent_id),
        Attr::Atime(t),
        Attr::Mtime(t),
        Attr::Ctime(t),
        Attr::Crtime(t),
        Attr::Gen(txg),
        Attr::Rdev(attrs.rdev),
    ];
    if let Some(target) = spec.target {
        stored.push(Attr::SymlinkTarget(target.to_vec()));
    }
    store.attrs_update(tx, id, &stored)?;

    let fields = NodeFields {
        mode: perm,
        uid: attrs.uid,
        gid: attrs.gid,
        links,
        flags,
        parent: parent_id,
        atime: t,
        mtime: t,
        ctime: t,
        crtime: t,
        gen: txg,
        rdev: attrs.rdev,
        xattr_dir: None,
        symlink_target: spec.target.map(<[u8]>::to_vec),
    };
    debug!(object = %id, kind = ?attrs.kind, txg, "node allocated");
    Ok(FileNode::new(id, attrs.kind, fields, size, NEW_BLOCK_SIZE))
}

/// A directory entry to create for a new node.
pub(crate) struct EntryRequest<'a> {
    pub name: &'a [u8],
    pub attrs: NewNodeAttrs,
    pub target: Option<&'a [u8]>,
    pub claim: Option<ObjectId>,
}

impl MountInner {
    /// Resolves owner, group and mode of a node created in `dir` by `cred`.
    pub(crate) fn new_node_attrs(
        &self,
        dir: &FileNode,
        kind: FileKind,
        req: &CreateAttrs,
        cred: &Cred,
    ) -> Result<NewNodeAttrs> {
        if !self.config.use_fuids && (is_ephemeral(cred.uid) || is_ephemeral(cred.gid) || req.flags.is_some()) {
            return Err(ZplError::InvalidArgument("mapped identities are disabled"));
        }
        if let Some(flags) = req.flags {
            let change = FlagChange {
                set: flags,
                clear: NodeFlags::empty(),
            };
            self.collab.access.check_flags(None, cred, &change)?;
        }

        let mut perm = req.mode & mode::PERM_MASK;
        if perm & mode::S_ISVTX != 0 && !self.collab.access.may_set_sticky(cred) {
            perm &= !mode::S_ISVTX;
        }
        let gid = if dir.mode() & mode::S_ISGID != 0 {
            if kind == FileKind::Directory {
                perm |= mode::S_ISGID;
            }
            dir.gid()
        } else {
            if perm & mode::S_ISGID != 0 && !self.collab.access.may_retain_setgid(cred, cred.gid) {
                perm &= !mode::S_ISGID;
            }
            cred.gid
        };
        self.fuids.register(cred.uid);
        self.fuids.register(gid);

        Ok(NewNodeAttrs {
            kind,
            mode: perm,
            uid: cred.uid,
            gid,
            rdev: req.rdev,
            flags: req.flags.unwrap_or_else(NodeFlags::empty),
            time: Timestamp::now(),
        })
    }

    /// Creates a node and links it into `dir` under `req.name`.
    pub(crate) fn create_entry(self: &Arc<Self>, dir: &NodeRef, req: EntryRequest<'_>, cred: &Cred) -> Result<NodeRef> {
        let _guard = self.enter()?;
        self.verify(dir)?;
        self.check_writable()?;
        if !dir.is_dir() {
            return Err(ZplError::NotDirectory);
        }
        validate_name(req.name, self.config.utf8_only)?;
        let kind = req.attrs.kind;
        if dir.is_xattr() && kind != FileKind::Regular {
            return Err(ZplError::InvalidArgument("only regular files live in attribute directories"));
        }
        if let Some(target) = req.target {
            if target.len() > MAXPATHLEN {
                return Err(ZplError::NameTooLong);
            }
        }

        self.collab.access.check_access(&dir.attrs(), cred, AccessMode::ADD_ENTRY)?;
        if !self.is_replaying() && self.collab.quota.over_quota(req.attrs.uid, req.attrs.gid) {
            return Err(ZplError::QuotaExceeded);
        }

        let target_len = req.target.map_or(0, |t| t.len() as u64);
        let assigned = self.assign_with_retry("create", |_| {
            let (entry, _) = self.dirent_lock(dir, req.name, DirExpect::New)?;
            let mut tx = self.store.tx_create();
            tx.hold_attrs_create(CREATE_ATTR_BYTES + target_len);
            if self.fuids.is_dirty() {
                self.fuids.txhold(&mut tx);
            }
            tx.hold_map(Some(dir.id()), true, Some(req.name));
            if kind == FileKind::Directory {
                tx.hold_map(None, false, None);
            }
            tx.hold_attrs(dir.id());
            Ok((entry, tx))
        })?;
        let (entry, mut tx, txg) = (assigned.locks, assigned.tx, assigned.txg);

        let spec = NodeSpec {
            attrs: &req.attrs,
            origin: NodeOrigin::Child,
            claim: req.claim,
            target: req.target,
        };
        let node = match self.populate_entry(&mut tx, dir, req.name, &spec, txg) {
            Ok(node) => node,
            Err(e) => {
                self.commit(tx)?;
                return Err(e);
            }
        };

        let op = match (kind, req.target) {
            (FileKind::Directory, _) => LogOp::Mkdir {
                parent: dir.id(),
                name: req.name.to_vec(),
                object: node.id(),
                attrs: req.attrs.clone(),
            },
            (_, Some(target)) => LogOp::Symlink {
                parent: dir.id(),
                name: req.name.to_vec(),
                object: node.id(),
                attrs: req.attrs.clone(),
                target: target.to_vec(),
            },
            _ => LogOp::Create {
                parent: dir.id(),
                name: req.name.to_vec(),
                object: node.id(),
                attrs: req.attrs.clone(),
            },
        };
        let logged = self.log_op(txg, op);
        self.commit(tx)?;
        drop(entry);
        let node = self.cache_node(node);
        logged?;

        if self.sync_always() {
            self.flush_log(None)?;
        }
        Ok(node)
    }

    /// Allocates the node and links it. A failure frees the half-built
    /// object within the same transaction.
    fn populate_entry(
        &self,
        tx: &mut Transaction,
        dir: &FileNode,
        name: &[u8],
        spec: &NodeSpec<'_>,
        txg: Txg,
    ) -> Result<FileNode> {
        let node = mknode(self.store.as_ref(), tx, Some(dir), spec, txg)?;
        if self.fuids.is_dirty() {
            self.fuids.sync(self.store.as_ref(), tx)?;
        }
        if let Err(e) = link_create(self.store.as_ref(), dir, name, &node, tx, LinkMode::New) {
            self.store.object_free(tx, node.id())?;
            return Err(e);
        }
        Ok(node)
    }

    pub(crate) fn link(self: &Arc<Self>, dir: &NodeRef, src: &NodeRef, name: &[u8], cred: &Cred) -> Result<()> {
        let _guard = self.enter()?;
        self.verify(dir)?;
        self.check_writable()?;
        if !Arc::ptr_eq(src.mount(), dir.mount()) {
            return Err(ZplError::CrossDevice);
        }
        if !dir.is_dir() {
            return Err(ZplError::NotDirectory);
        }
        if src.is_dir() {
            return Err(ZplError::PermissionDenied("hard link to a directory"));
        }
        self.verify(src)?;
        if src
            .flags()
            .intersects(NodeFlags::APPENDONLY | NodeFlags::IMMUTABLE | NodeFlags::READONLY)
        {
            return Err(ZplError::PermissionDenied("source is immutable"));
        }
        validate_name(name, self.config.utf8_only)?;
        if src.is_xattr() != dir.is_xattr() {
            return Err(ZplError::InvalidArgument("link across attribute namespaces"));
        }
        if !self.is_replaying() && src.uid() != cred.uid && !self.collab.access.may_link_any(cred) {
            return Err(ZplError::PermissionDenied("link to a file owned by another user"));
        }
        self.collab.access.check_access(&dir.attrs(), cred, AccessMode::ADD_ENTRY)?;

        let assigned = self.assign_with_retry("link", |_| {
            let (entry, _) = self.dirent_lock(dir, name, DirExpect::New)?;
            let mut tx = self.store.tx_create();
            tx.hold_attrs(src.id());
            tx.hold_map(Some(dir.id()), true, Some(name));
            tx.hold_attrs(dir.id());
            Ok((entry, tx))
        })?;
        let (entry, mut tx, txg) = (assigned.locks, assigned.tx, assigned.txg);

        let res = link_create(self.store.as_ref(), dir, name, src, &mut tx, LinkMode::Normal);
        let logged = match res {
            Ok(()) => self.log_op(
                txg,
                LogOp::Link {
                    parent: dir.id(),
                    name: name.to_vec(),
                    object: src.id(),
                },
            ),
            Err(_) => Ok(()),
        };
        self.commit(tx)?;
        drop(entry);
        res?;
        logged?;

        if self.sync_always() {
            self.flush_log(None)?;
        }
        Ok(())
    }
}

impl Mount {
    /// Creates a non-directory node (regular file, device, fifo or socket).
    pub fn create(
        &self,
        dir: &NodeRef,
        name: &[u8],
        kind: FileKind,
        attrs: &CreateAttrs,
        cred: &Cred,
    ) -> Result<NodeRef> {
        let started = Instant::now();
        let res = if kind == FileKind::Directory || kind == FileKind::Symlink {
            Err(ZplError::InvalidArgument("use mkdir or symlink"))
        } else {
            self.inner
                .new_node_attrs(dir, kind, attrs, cred)
                .and_then(|attrs| {
                    let req = EntryRequest {
                        name,
                        attrs,
                        target: None,
                        claim: None,
                    };
                    self.inner.create_entry(dir, req, cred)
                })
        };
        self.inner.finish(VnodeOp::Create, started, res)
    }

    pub fn mkdir(&self, dir: &NodeRef, name: &[u8], attrs: &CreateAttrs, cred: &Cred) -> Result<NodeRef> {
        let started = Instant::now();
        let res = self
            .inner
            .new_node_attrs(dir, FileKind::Directory, attrs, cred)
            .and_then(|attrs| {
                let req = EntryRequest {
                    name,
                    attrs,
                    target: None,
                    claim: None,
                };
                self.inner.create_entry(dir, req, cred)
            });
        self.inner.finish(VnodeOp::Mkdir, started, res)
    }

    pub fn symlink(&self, dir: &NodeRef, name: &[u8], target: &[u8], cred: &Cred) -> Result<NodeRef> {
        let started = Instant::now();
        let req = CreateAttrs::with_mode(0o777);
        let res = self
            .inner
            .new_node_attrs(dir, FileKind::Symlink, &req, cred)
            .and_then(|attrs| {
                let req = EntryRequest {
                    name,
                    attrs,
                    target: Some(target),
                    claim: None,
                };
                self.inner.create_entry(dir, req, cred)
            });
        self.inner.finish(VnodeOp::Symlink, started, res)
    }

    /// Adds `name` in `dir` as another link to `src`.
    pub fn link(&self, dir: &NodeRef, src: &NodeRef, name: &[u8], cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.link(dir, src, name, cred);
        self.inner.finish(VnodeOp::Link, started, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemoryObjectStore;
    use crate::store::TxWait;

    fn make_attrs(kind: FileKind) -> NewNodeAttrs {
        NewNodeAttrs {
            kind,
            mode: 0o4755,
            uid: 10,
            gid: 20,
            rdev: 0,
            flags: NodeFlags::XATTR | NodeFlags::NODUMP,
            time: Timestamp::new(100, 0),
        }
    }

    fn assigned(store: &MemoryObjectStore) -> (Transaction, Txg) {
        let mut tx = store.tx_create();
        tx.hold_attrs_create(CREATE_ATTR_BYTES);
        match store.tx_assign(&mut tx, TxWait::Wait).unwrap() {
            crate::store::AssignOutcome::Assigned(txg) => (tx, txg),
            crate::store::AssignOutcome::Restart => panic!("unexpected restart"),
        }
    }

    #[test]
    fn test_mknode_directory_links() {
        let store = MemoryObjectStore::default();
        let (mut tx, txg) = assigned(&store);
        let attrs = make_attrs(FileKind::Directory);
        let spec = NodeSpec {
            attrs: &attrs,
            origin: NodeOrigin::Root,
            claim: None,
            target: None,
        };
        let root = mknode(&store, &mut tx, None, &spec, txg).unwrap();
        assert_eq!(root.links(), 2);
        assert_eq!(root.size(), 2);
        assert_eq!(root.parent(), root.id());
        // A caller-supplied XATTR flag is not trusted.
        assert!(!root.is_xattr());
        assert!(root.flags().contains(NodeFlags::NODUMP));

        let child_spec = NodeSpec {
            origin: NodeOrigin::Child,
            ..spec
        };
        let child = mknode(&store, &mut tx, Some(&root), &child_spec, txg).unwrap();
        assert_eq!(child.links(), 1);
        assert_eq!(child.parent(), root.id());
        store.tx_commit(tx).unwrap();
    }

    #[test]
    fn test_mknode_symlink_and_claim() {
        let store = MemoryObjectStore::default();
        let (mut tx, txg) = assigned(&store);
        let attrs = make_attrs(FileKind::Symlink);
        let spec = NodeSpec {
            attrs: &attrs,
            origin: NodeOrigin::Child,
            claim: Some(ObjectId::new(500)),
            target: Some(b"/etc/passwd"),
        };
        let node = mknode(&store, &mut tx, None, &spec, txg).unwrap();
        assert_eq!(node.id(), ObjectId::new(500));
        assert_eq!(node.size(), 11);
        assert_eq!(node.links(), 0);
        assert_eq!(node.symlink_target().as_deref(), Some(&b"/etc/passwd"[..]));
        assert_eq!(node.mode(), 0o4755);
        store.tx_commit(tx).unwrap();
        assert!(store.object_exists(ObjectId::new(500)));
    }

    #[test]
    fn test_mknode_xattr_origin_sets_flag() {
        let store = MemoryObjectStore::default();
        let (mut tx, txg) = assigned(&store);
        let attrs = make_attrs(FileKind::Directory);
        let spec = NodeSpec {
            attrs: &attrs,
            origin: NodeOrigin::Xattr,
            claim: None,
            target: None,
        };
        let xdir = mknode(&store, &mut tx, None, &spec, txg).unwrap();
        assert!(xdir.is_xattr());
        assert_eq!(xdir.links(), 2);

        let file_attrs = make_attrs(FileKind::Regular);
        let file_spec = NodeSpec {
            attrs: &file_attrs,
            origin: NodeOrigin::Child,
            claim: None,
            target: None,
        };
        let file = mknode(&store, &mut tx, Some(&xdir), &file_spec, txg).unwrap();
        assert!(file.is_xattr());
        store.tx_commit(tx).unwrap();
    }
}
