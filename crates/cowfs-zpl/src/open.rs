//! Open, close, fsync, attribute queries, lookup, readlink and attribute
//! directories.

use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::SyncPolicy;
use crate::create::{mknode, NodeOrigin, NodeSpec, CREATE_ATTR_BYTES};
use crate::dirent::validate_name;
use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::NodeRef;
use crate::policy::AccessMode;
use crate::stats::VnodeOp;
use crate::types::{mode, Attr, Cred, FileKind, IoFlags, NewNodeAttrs, NodeAttrs, NodeFlags, ObjectId, Timestamp};
use crate::zil::LogOp;

/// Entry-lock name reserved for creating a node's attribute directory.
/// Real entry names are never empty.
const XATTR_ENTRY: &[u8] = b"";

impl MountInner {
    fn scans(&self, node: &NodeRef) -> bool {
        self.config.vscan
            && node.kind() == FileKind::Regular
            && !node.flags().contains(NodeFlags::AV_QUARANTINED)
            && node.size() > 0
    }

    pub(crate) fn open_file(&self, node: &NodeRef, flags: IoFlags, cred: &Cred) -> Result<()> {
        let _guard = self.enter()?;
        self.verify(node)?;
        if flags.contains(IoFlags::WRITE)
            && node.flags().contains(NodeFlags::APPENDONLY)
            && !flags.contains(IoFlags::APPEND)
        {
            return Err(ZplError::PermissionDenied("append-only file opened for writing"));
        }
        if self.scans(node) {
            self.collab.scanner.scan_open(&node.attrs(), cred)?;
        }
        if flags.wants_sync() {
            node.sync_open();
        }
        Ok(())
    }

    /// `last` is set for the final close of an open file description.
    pub(crate) fn close_file(&self, node: &NodeRef, flags: IoFlags, last: bool, cred: &Cred) -> Result<()> {
        let _guard = self.enter()?;
        self.verify(node)?;
        if last && flags.wants_sync() {
            node.sync_close();
        }
        if last && self.scans(node) {
            self.collab.scanner.scan_close(&node.attrs(), cred);
        }
        Ok(())
    }

    pub(crate) fn fsync(&self, node: &NodeRef) -> Result<()> {
        if self.config.sync == SyncPolicy::Disabled {
            return Ok(());
        }
        let _guard = self.enter()?;
        self.verify(node)?;
        self.flush_log(Some(node.id()))
    }

    pub(crate) fn getattr(&self, node: &NodeRef) -> Result<NodeAttrs> {
        let _guard = self.enter()?;
        self.verify(node)?;
        Ok(node.attrs())
    }

    pub(crate) fn access(&self, node: &NodeRef, want: AccessMode, cred: &Cred) -> Result<()> {
        let _guard = self.enter()?;
        self.verify(node)?;
        if want.has_write() {
            let on_disk = matches!(node.kind(), FileKind::Regular | FileKind::Directory | FileKind::Symlink);
            if self.config.read_only && on_disk {
                return Err(ZplError::ReadOnly);
            }
            if node.flags().contains(NodeFlags::IMMUTABLE) {
                return Err(ZplError::PermissionDenied("immutable"));
            }
        }
        self.collab.access.check_access(&node.attrs(), cred, want)
    }

    pub(crate) fn lookup(self: &Arc<Self>, dir: &NodeRef, name: &[u8], cred: &Cred) -> Result<NodeRef> {
        let _guard = self.enter()?;
        self.verify(dir)?;
        if !dir.is_dir() {
            return Err(ZplError::NotDirectory);
        }
        self.collab.access.check_access(&dir.attrs(), cred, AccessMode::SEARCH)?;
        match name {
            b"" | b"." => return Ok(dir.clone()),
            b".." => return self.get_node(dir.parent()),
            _ => {}
        }
        validate_name(name, self.config.utf8_only)?;
        if dir.is_unlinked() {
            return Err(ZplError::NotFound);
        }
        let (_, id) = self.dir_lookup(dir.id(), name)?.ok_or(ZplError::NotFound)?;
        dir.arm_prefetch();
        self.get_node(id)
    }

    pub(crate) fn readlink(&self, node: &NodeRef) -> Result<Vec<u8>> {
        let _guard = self.enter()?;
        self.verify(node)?;
        if node.kind() != FileKind::Symlink {
            return Err(ZplError::InvalidArgument("not a symbolic link"));
        }
        let target = node
            .symlink_target()
            .ok_or_else(|| ZplError::Internal(format!("symlink {} has no target", node.id())))?;
        if self.config.atime {
            node.touch_atime();
        }
        Ok(target)
    }

    /// Returns the attribute directory of `node`, creating it if asked.
    pub(crate) fn xattr_dir(self: &Arc<Self>, node: &NodeRef, create: bool, cred: &Cred) -> Result<NodeRef> {
        let _guard = self.enter()?;
        self.verify(node)?;
        if node.is_xattr() {
            return Err(ZplError::InvalidArgument("attribute nodes have no attributes"));
        }
        if let Some(id) = node.xattr_dir() {
            return self.get_node(id);
        }
        if !create {
            return Err(ZplError::NotFound);
        }
        self.check_writable()?;
        self.collab.access.check_access(&node.attrs(), cred, AccessMode::W_OK)?;
        if !self.is_replaying() && self.collab.quota.over_quota(node.uid(), node.gid()) {
            return Err(ZplError::QuotaExceeded);
        }
        let attrs = NewNodeAttrs {
            kind: FileKind::Directory,
            mode: mode::S_ISVTX | 0o777,
            uid: node.uid(),
            gid: node.gid(),
            rdev: 0,
            flags: NodeFlags::empty(),
            time: Timestamp::now(),
        };
        self.make_xattr_dir(node, &attrs, None)
    }

    /// Creates the attribute directory of `owner`. Returns the existing one
    /// if another thread got there first.
    pub(crate) fn make_xattr_dir(
        self: &Arc<Self>,
        owner: &NodeRef,
        attrs: &NewNodeAttrs,
        claim: Option<ObjectId>,
    ) -> Result<NodeRef> {
        let assigned = self.assign_with_retry("mkxattr", |_| {
            let entry = self.dirlocks.lock(owner.id(), XATTR_ENTRY);
            let mut tx = self.store.tx_create();
            tx.hold_attrs_create(CREATE_ATTR_BYTES);
            tx.hold_map(None, false, None);
            tx.hold_attrs(owner.id());
            Ok((entry, tx))
        })?;
        let (entry, mut tx, txg) = (assigned.locks, assigned.tx, assigned.txg);
        if let Some(id) = owner.xattr_dir() {
            self.store.tx_abort(tx);
            drop(entry);
            return self.get_node(id);
        }

        let spec = NodeSpec {
            attrs,
            origin: NodeOrigin::Xattr,
            claim,
            target: None,
        };
        let store = self.store.as_ref();
        let made = mknode(store, &mut tx, Some(owner), &spec, txg).and_then(|xdir| {
            owner.update(store, &mut tx, &[Attr::XattrDir(xdir.id())])?;
            Ok(xdir)
        });
        let xdir = match made {
            Ok(xdir) => xdir,
            Err(e) => {
                self.commit(tx)?;
                return Err(e);
            }
        };
        let logged = self.log_op(
            txg,
            LogOp::MkXattr {
                owner: owner.id(),
                object: xdir.id(),
                attrs: attrs.clone(),
            },
        );
        self.commit(tx)?;
        drop(entry);
        debug!(owner = %owner.id(), object = %xdir.id(), "attribute directory created");
        let xdir = self.cache_node(xdir);
        logged?;

        if self.sync_always() {
            self.flush_log(None)?;
        }
        Ok(xdir)
    }
}

impl Mount {
    /// Opens `node` with `flags`. No transaction is involved.
    pub fn open_file(&self, node: &NodeRef, flags: IoFlags, cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.open_file(node, flags, cred);
        self.inner.finish(VnodeOp::Open, started, res)
    }

    pub fn close_file(&self, node: &NodeRef, flags: IoFlags, last: bool, cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.close_file(node, flags, last, cred);
        self.inner.finish(VnodeOp::Close, started, res)
    }

    /// Makes every logged change to `node` durable.
    pub fn fsync(&self, node: &NodeRef) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.fsync(node);
        self.inner.finish(VnodeOp::Fsync, started, res)
    }

    pub fn getattr(&self, node: &NodeRef) -> Result<NodeAttrs> {
        let started = Instant::now();
        let res = self.inner.getattr(node);
        self.inner.finish(VnodeOp::Getattr, started, res)
    }

    pub fn access(&self, node: &NodeRef, want: AccessMode, cred: &Cred) -> Result<()> {
        let started = Instant::now();
        let res = self.inner.access(node, want, cred);
        self.inner.finish(VnodeOp::Access, started, res)
    }

    /// Resolves `name` in `dir`; `.` and `..` included.
    pub fn lookup(&self, dir: &NodeRef, name: &[u8], cred: &Cred) -> Result<NodeRef> {
        let started = Instant::now();
        let res = self.inner.lookup(dir, name, cred);
        self.inner.finish(VnodeOp::Lookup, started, res)
    }

    pub fn readlink(&self, node: &NodeRef) -> Result<Vec<u8>> {
        let started = Instant::now();
        let res = self.inner.readlink(node);
        self.inner.finish(VnodeOp::Readlink, started, res)
    }

    pub fn xattr_dir(&self, node: &NodeRef, create: bool, cred: &Cred) -> Result<NodeRef> {
        let started = Instant::now();
        let res = self.inner.xattr_dir(node, create, cred);
        self.inner.finish(VnodeOp::XattrDir, started, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZplConfig;
    use crate::create::CreateAttrs;
    use crate::memstore::MemoryObjectStore;
    use crate::mount::Collaborators;
    use crate::policy::ContentScanner;
    use crate::zil::MemoryIntentLog;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_mount_with(config: ZplConfig, collab: Collaborators) -> (Mount, Arc<MemoryIntentLog>) {
        let store = Arc::new(MemoryObjectStore::default());
        let log = Arc::new(MemoryIntentLog::new());
        let mount = Mount::format(store, log.clone(), config, collab).unwrap();
        (mount, log)
    }

    fn make_mount() -> (Mount, Arc<MemoryIntentLog>) {
        make_mount_with(ZplConfig::default(), Collaborators::default())
    }

    #[derive(Default)]
    struct CountingScanner {
        opens: AtomicU32,
        closes: AtomicU32,
    }

    impl ContentScanner for CountingScanner {
        fn scan_open(&self, _node: &NodeAttrs, _cred: &Cred) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn scan_close(&self, _node: &NodeAttrs, _cred: &Cred) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_open_append_only_for_write() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        let mut flags = f.flags();
        flags.insert(NodeFlags::APPENDONLY);
        f.fields().flags = flags;

        assert!(matches!(
            mount.open_file(&f, IoFlags::WRITE, &cred),
            Err(ZplError::PermissionDenied(_))
        ));
        assert!(mount.open_file(&f, IoFlags::WRITE | IoFlags::APPEND, &cred).is_ok());
        assert!(mount.open_file(&f, IoFlags::READ, &cred).is_ok());
    }

    #[test]
    fn test_sync_open_counter() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        mount.open_file(&f, IoFlags::WRITE | IoFlags::DSYNC, &cred).unwrap();
        assert_eq!(f.sync_opens(), 1);
        mount.close_file(&f, IoFlags::WRITE | IoFlags::DSYNC, false, &cred).unwrap();
        assert_eq!(f.sync_opens(), 1);
        mount.close_file(&f, IoFlags::WRITE | IoFlags::DSYNC, true, &cred).unwrap();
        assert_eq!(f.sync_opens(), 0);
    }

    #[test]
    fn test_sync_opener_flushes_plain_writes() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();

        let before = mount.stats().log_flushes;
        mount.write(&f, 0, b"a", IoFlags::WRITE, &cred).unwrap();
        assert_eq!(mount.stats().log_flushes, before);

        mount.open_file(&f, IoFlags::WRITE | IoFlags::DSYNC, &cred).unwrap();
        mount.write(&f, 1, b"b", IoFlags::WRITE, &cred).unwrap();
        assert_eq!(mount.stats().log_flushes, before + 1);

        mount.close_file(&f, IoFlags::WRITE | IoFlags::DSYNC, true, &cred).unwrap();
        mount.write(&f, 2, b"c", IoFlags::WRITE, &cred).unwrap();
        assert_eq!(mount.stats().log_flushes, before + 1);
    }

    #[test]
    fn test_scanner_skips_empty_files() {
        let scanner = Arc::new(CountingScanner::default());
        let collab = Collaborators {
            scanner: scanner.clone(),
            ..Default::default()
        };
        let config = ZplConfig {
            vscan: true,
            ..Default::default()
        };
        let (mount, _log) = make_mount_with(config, collab);
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        mount.open_file(&f, IoFlags::READ, &cred).unwrap();
        assert_eq!(scanner.opens.load(Ordering::SeqCst), 0);

        f.force_size(10);
        mount.open_file(&f, IoFlags::READ, &cred).unwrap();
        mount.close_file(&f, IoFlags::READ, true, &cred).unwrap();
        assert_eq!(scanner.opens.load(Ordering::SeqCst), 1);
        assert_eq!(scanner.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookup_dot_dotdot_and_names() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let d = mount.mkdir(&root, b"d", &CreateAttrs::with_mode(0o755), &cred).unwrap();
        let f = mount
            .create(&d, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();

        assert!(mount.lookup(&d, b".", &cred).unwrap().same(&d));
        assert!(mount.lookup(&d, b"..", &cred).unwrap().same(&root));
        assert!(mount.lookup(&root, b"..", &cred).unwrap().same(&root));
        assert!(mount.lookup(&d, b"f", &cred).unwrap().same(&f));
        assert!(matches!(mount.lookup(&d, b"missing", &cred), Err(ZplError::NotFound)));
        assert!(matches!(mount.lookup(&f, b"x", &cred), Err(ZplError::NotDirectory)));
        assert!(matches!(
            mount.lookup(&d, &[0xff], &cred),
            Err(ZplError::IllegalByteSequence)
        ));
    }

    #[test]
    fn test_lookup_needs_search_permission() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let d = mount
            .mkdir(&root, b"private", &CreateAttrs::with_mode(0o700), &Cred::root())
            .unwrap();
        let other = Cred::user(1000, 1000);
        assert!(matches!(mount.lookup(&d, b"x", &other), Err(ZplError::AccessDenied)));
    }

    #[test]
    fn test_readlink() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let link = mount.symlink(&root, b"l", b"target/path", &cred).unwrap();
        assert_eq!(mount.readlink(&link).unwrap(), b"target/path".to_vec());
        assert!(link.atime_dirty());
        assert!(matches!(mount.readlink(&root), Err(ZplError::InvalidArgument(_))));
    }

    #[test]
    fn test_access_checks() {
        let config = ZplConfig {
            read_only: false,
            ..Default::default()
        };
        let (mount, _log) = make_mount_with(config, Collaborators::default());
        let root = mount.root().unwrap();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o600), &Cred::root())
            .unwrap();
        let other = Cred::user(5, 5);
        assert!(matches!(
            mount.access(&f, AccessMode::R_OK, &other),
            Err(ZplError::AccessDenied)
        ));
        assert!(mount.access(&f, AccessMode::R_OK | AccessMode::W_OK, &Cred::root()).is_ok());
        let attrs = mount.getattr(&f).unwrap();
        assert_eq!(attrs.mode, 0o600);
        assert_eq!(attrs.links, 1);
    }

    #[test]
    fn test_xattr_dir_created_once_and_logged() {
        let (mount, log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        assert!(matches!(mount.xattr_dir(&f, false, &cred), Err(ZplError::NotFound)));

        let before = log.len();
        let x = mount.xattr_dir(&f, true, &cred).unwrap();
        assert!(x.is_xattr());
        assert!(x.is_dir());
        assert_eq!(x.parent(), f.id());
        assert_eq!(f.xattr_dir(), Some(x.id()));
        assert_eq!(log.len(), before + 1);

        let again = mount.xattr_dir(&f, true, &cred).unwrap();
        assert!(again.same(&x));
        assert_eq!(log.len(), before + 1);
        assert!(matches!(mount.xattr_dir(&x, true, &cred), Err(ZplError::InvalidArgument(_))));

        // Only regular files may be created inside.
        assert!(mount
            .mkdir(&x, b"sub", &CreateAttrs::with_mode(0o755), &cred)
            .is_err());
        let attr = mount
            .create(&x, b"user.a", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        assert!(attr.is_xattr());
    }

    #[test]
    fn test_removing_owner_destroys_xattr_dir() {
        let (mount, _log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        let x = mount.xattr_dir(&f, true, &cred).unwrap();
        let _a = mount
            .create(&x, b"user.a", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        let x_id = x.id();
        drop(_a);
        drop(x);

        mount.remove(&root, b"f", &cred).unwrap();
        drop(f);
        assert!(mount.node(x_id).is_err());
        assert_eq!(mount.unlinked_count().unwrap(), 0);
    }

    #[test]
    fn test_fsync_flushes_log() {
        let (mount, log) = make_mount();
        let root = mount.root().unwrap();
        let cred = Cred::root();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        assert!(log.unflushed() > 0);
        mount.fsync(&f).unwrap();
        assert_eq!(log.unflushed(), 0);

        let config = ZplConfig {
            sync: SyncPolicy::Disabled,
            ..Default::default()
        };
        let (mount, log) = make_mount_with(config, Collaborators::default());
        let root = mount.root().unwrap();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &cred)
            .unwrap();
        mount.fsync(&f).unwrap();
        assert!(log.unflushed() > 0);
    }
}
