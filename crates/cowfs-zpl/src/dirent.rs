//! Directory entries: name locks, lookup, and link maintenance.
//!
//! A directory is a map object from entry name to a packed value holding the
//! child's object id and its type tag. [`DirEntryLock`] serializes mutations
//! of one `(directory, name)` pair. [`link_create`] and [`link_destroy`] keep
//! link counts, parent pointers and directory sizes consistent with the map.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, ZplError};
use crate::mount::MountInner;
use crate::node::{FileNode, NodeRef};
use crate::store::{ObjectStore, Transaction};
use crate::types::{Attr, FileKind, ObjectId, Timestamp, MAXNAMELEN};

const TAG_SHIFT: u32 = 60;
const ID_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Packs a child's type and id into a directory-map value.
pub(crate) fn encode_entry(kind: FileKind, id: ObjectId) -> u64 {
    (kind.dirent_tag() << TAG_SHIFT) | (id.as_u64() & ID_MASK)
}

pub(crate) fn decode_entry(value: u64) -> Result<(FileKind, ObjectId)> {
    let kind = FileKind::from_dirent_tag(value >> TAG_SHIFT)
        .ok_or_else(|| ZplError::Internal(format!("corrupt directory entry value {:#x}", value)))?;
    Ok((kind, ObjectId::new(value & ID_MASK)))
}

/// What the caller expects to find under the name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirExpect {
    /// The name must be free (EEXIST otherwise).
    New,
    /// The name must exist (ENOENT otherwise).
    Exists,
    /// Either is fine.
    Any,
}

/// How a link change treats the child's link count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkMode {
    /// Regular link or unlink.
    Normal,
    /// First link of a just-created node.
    New,
    /// Half of a rename: the child's link count and ctime stay untouched.
    Renaming,
}

/// Validates one path component.
pub(crate) fn validate_name(name: &[u8], utf8_only: bool) -> Result<()> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(ZplError::InvalidArgument("bad entry name"));
    }
    if name.len() > MAXNAMELEN {
        return Err(ZplError::NameTooLong);
    }
    if utf8_only && std::str::from_utf8(name).is_err() {
        return Err(ZplError::IllegalByteSequence);
    }
    Ok(())
}

pub(crate) fn is_dot_or_dotdot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// Table of held `(directory, name)` locks for one mount.
#[derive(Default)]
pub(crate) struct DirLocks {
    held: Mutex<HashSet<(ObjectId, Vec<u8>)>>,
    released: Condvar,
}

impl DirLocks {
    pub(crate) fn lock(&self, dir: ObjectId, name: &[u8]) -> DirEntryLock<'_> {
        let key = (dir, name.to_vec());
        let mut held = self.held.lock();
        while held.contains(&key) {
            self.released.wait(&mut held);
        }
        held.insert(key.clone());
        DirEntryLock { locks: self, key }
    }

    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Lock on one directory entry name. Released on drop.
pub struct DirEntryLock<'a> {
    locks: &'a DirLocks,
    key: (ObjectId, Vec<u8>),
}

impl DirEntryLock<'_> {
    pub fn dir(&self) -> ObjectId {
        self.key.0
    }

    pub fn name(&self) -> &[u8] {
        &self.key.1
    }
}

impl Drop for DirEntryLock<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}

impl MountInner {
    /// Resolves `name` in `dir` to its entry, if any.
    pub(crate) fn dir_lookup(&self, dir: ObjectId, name: &[u8]) -> Result<Option<(FileKind, ObjectId)>> {
        match self.store.map_lookup(dir, name, None)? {
            Some(value) => Ok(Some(decode_entry(value)?)),
            None => Ok(None),
        }
    }

    /// Locks `(dir, name)` and resolves it, enforcing `expect`.
    pub(crate) fn dirent_lock(
        self: &Arc<Self>,
        dir: &NodeRef,
        name: &[u8],
        expect: DirExpect,
    ) -> Result<(DirEntryLock<'_>, Option<NodeRef>)> {
        let lock = self.dirlocks.lock(dir.id(), name);
        if dir.is_unlinked() {
            return Err(ZplError::NotFound);
        }
        let child = match self.dir_lookup(dir.id(), name)? {
            Some((_, id)) => Some(self.get_node(id)?),
            None => None,
        };
        match (expect, &child) {
            (DirExpect::New, Some(_)) => return Err(ZplError::Exists),
            (DirExpect::Exists, None) => return Err(ZplError::NotFound),
            _ => {}
        }
        trace!(dir = %dir.id(), found = child.is_some(), "directory entry locked");
        Ok((lock, child))
    }
}

/// Links `node` into `dir` under `name`.
pub(crate) fn link_create(
    store: &dyn ObjectStore,
    dir: &FileNode,
    name: &[u8],
    node: &FileNode,
    tx: &mut Transaction,
    mode: LinkMode,
) -> Result<()> {
    if mode != LinkMode::Renaming && node.is_unlinked() {
        return Err(ZplError::NotFound);
    }
    store.map_add(tx, dir.id(), name, encode_entry(node.kind(), node.id()))?;

    let now = Timestamp::now();
    node.adjust(store, tx, |f, _| {
        let mut attrs = vec![Attr::Parent(dir.id())];
        if mode != LinkMode::Renaming {
            attrs.push(Attr::Links(f.links + 1));
        }
        if mode != LinkMode::New {
            attrs.push(Attr::Ctime(now));
        }
        attrs
    })?;

    let child_is_dir = node.is_dir();
    dir.adjust(store, tx, |f, size| {
        let mut attrs = vec![Attr::Size(size + 1), Attr::Mtime(now), Attr::Ctime(now)];
        if child_is_dir {
            attrs.push(Attr::Links(f.links + 1));
        }
        attrs
    })
}

/// Removes `name` (referring to `node`) from `dir`. Returns whether the node
/// lost its last link.
pub(crate) fn link_destroy(
    store: &dyn ObjectStore,
    dir: &FileNode,
    name: &[u8],
    node: &FileNode,
    tx: &mut Transaction,
    mode: LinkMode,
) -> Result<bool> {
    if mode != LinkMode::Renaming && node.is_dir() && store.map_count(node.id())? > 0 {
        return Err(ZplError::NotEmpty);
    }
    store.map_remove(tx, dir.id(), name)?;

    let now = Timestamp::now();
    let child_is_dir = node.is_dir();
    let mut unlinked = false;
    if mode != LinkMode::Renaming {
        let drop_by = if child_is_dir { 2 } else { 1 };
        node.adjust(store, tx, |f, _| {
            let links = f.links.saturating_sub(drop_by);
            unlinked = links == 0;
            vec![Attr::Links(links), Attr::Ctime(now)]
        })?;
        if unlinked {
            node.set_unlinked(true);
        }
    }

    dir.adjust(store, tx, |f, size| {
        let mut attrs = vec![Attr::Size(size.saturating_sub(1)), Attr::Mtime(now), Attr::Ctime(now)];
        if child_is_dir {
            attrs.push(Attr::Links(f.links.saturating_sub(1)));
        }
        attrs
    })?;
    Ok(unlinked)
}
