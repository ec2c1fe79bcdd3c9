//! Read.

use std::time::Instant;
use tracing::trace;

use crate::config::SyncPolicy;
use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::NodeRef;
use crate::policy::mandatory_locking;
use crate::range_lock::RangeLockMode;
use crate::stats::VnodeOp;
use crate::types::{IoFlags, NodeFlags};

/// Length of the chunk starting at `offset`, bounded by `remaining` and by
/// the next multiple of `chunk`.
pub(crate) fn chunk_len(offset: u64, remaining: u64, chunk: u64) -> u64 {
    remaining.min(chunk - offset % chunk)
}

impl MountInner {
    pub(crate) fn read(&self, node: &NodeRef, offset: i64, len: usize, flags: IoFlags) -> Result<Vec<u8>> {
        let _guard = self.enter()?;
        self.verify(node)?;
        if node.flags().contains(NodeFlags::AV_QUARANTINED) {
            return Err(ZplError::AccessDenied);
        }
        if offset < 0 {
            return Err(ZplError::InvalidArgument("negative offset"));
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let offset = offset as u64;
        if mandatory_locking(node.mode()) {
            self.collab.locks.check(node.id(), offset, len as u64, false)?;
        }
        if flags.contains(IoFlags::RSYNC) || self.config.sync == SyncPolicy::Always {
            self.flush_log(Some(node.id()))?;
        }

        let res = self.read_locked(node, offset, len as u64);
        if self.config.atime {
            node.touch_atime();
        }
        res
    }

    fn read_locked(&self, node: &NodeRef, offset: u64, len: u64) -> Result<Vec<u8>> {
        let max_block_size = self.config.max_block_size;
        let _range = node
            .range_lock
            .lock(offset, len, RangeLockMode::Reader, || node.geometry(max_block_size));
        let size = node.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let total = len.min(size - offset);
        let mut out = Vec::with_capacity(total as usize);
        let mut pos = offset;
        let end = offset + total;
        let pages = &self.collab.pages;
        while pos < end {
            let nbytes = chunk_len(pos, end - pos, self.config.read_chunk_size);
            let chunk = if pages.is_mapped(node.id()) {
                let store = &self.store;
                let id = node.id();
                let mut fill = |off: u64, l: usize| -> Result<Vec<u8>> { Ok(store.read(id, off, l)?) };
                pages.read_through_cache(id, pos, nbytes as usize, &mut fill)?
            } else {
                self.store.read(node.id(), pos, nbytes as usize)?
            };
            trace!(object = %node.id(), offset = pos, len = nbytes, "read chunk");
            out.extend_from_slice(&chunk);
            pos += nbytes;
        }
        Ok(out)
    }
}

impl Mount {
    /// Reads up to `len` bytes at `offset`. Short at end of file.
    pub fn read(&self, node: &NodeRef, offset: i64, len: usize, flags: IoFlags) -> Result<Vec<u8>> {
        let started = Instant::now();
        let res = self.inner.read(node, offset, len, flags);
        self.inner.finish(VnodeOp::Read, started, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZplConfig;
    use crate::create::CreateAttrs;
    use crate::memstore::{FaultPoint, MemoryObjectStore};
    use crate::mount::Collaborators;
    use crate::pagecache::MemoryPageCache;
    use crate::types::{Cred, FileKind};
    use crate::zil::MemoryIntentLog;
    use std::sync::Arc;

    fn make_file(config: ZplConfig, collab: Collaborators) -> (Mount, Arc<MemoryObjectStore>, NodeRef) {
        let store = Arc::new(MemoryObjectStore::default());
        let log = Arc::new(MemoryIntentLog::new());
        let mount = Mount::format(store.clone(), log, config, collab).unwrap();
        let root = mount.root().unwrap();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &Cred::root())
            .unwrap();
        (mount, store, f)
    }

    #[test]
    fn test_chunk_len() {
        assert_eq!(chunk_len(0, 10, 4), 4);
        assert_eq!(chunk_len(3, 10, 4), 1);
        assert_eq!(chunk_len(4, 2, 4), 2);
    }

    #[test]
    fn test_read_clamps_to_eof() {
        let (mount, _store, f) = make_file(ZplConfig::default(), Collaborators::default());
        let cred = Cred::root();
        mount.write(&f, 0, b"hello world", IoFlags::WRITE, &cred).unwrap();
        assert_eq!(mount.read(&f, 6, 100, IoFlags::READ).unwrap(), b"world".to_vec());
        assert!(mount.read(&f, 11, 10, IoFlags::READ).unwrap().is_empty());
        assert!(mount.read(&f, 0, 0, IoFlags::READ).unwrap().is_empty());
        assert!(f.atime_dirty());
        assert_eq!(f.range_lock.held_count(), 0);
    }

    #[test]
    fn test_read_in_small_chunks() {
        let config = ZplConfig {
            read_chunk_size: 3,
            ..Default::default()
        };
        let (mount, _store, f) = make_file(config, Collaborators::default());
        let data: Vec<u8> = (0..50u8).collect();
        mount.write(&f, 0, &data, IoFlags::WRITE, &Cred::root()).unwrap();
        assert_eq!(mount.read(&f, 1, 40, IoFlags::READ).unwrap(), data[1..41].to_vec());
    }

    #[test]
    fn test_negative_offset() {
        let (mount, _store, f) = make_file(ZplConfig::default(), Collaborators::default());
        let err = mount.read(&f, -1, 4, IoFlags::READ).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_checksum_error_becomes_eio() {
        let (mount, store, f) = make_file(ZplConfig::default(), Collaborators::default());
        mount.write(&f, 0, b"abc", IoFlags::WRITE, &Cred::root()).unwrap();
        store.inject_fault(FaultPoint::Read, 0);
        let err = mount.read(&f, 0, 3, IoFlags::READ).unwrap_err();
        assert!(matches!(err, ZplError::Io));
        assert_eq!(f.range_lock.held_count(), 0);
    }

    #[test]
    fn test_quarantined_file_is_unreadable() {
        let (mount, _store, f) = make_file(ZplConfig::default(), Collaborators::default());
        f.fields().flags.insert(NodeFlags::AV_QUARANTINED);
        assert!(matches!(mount.read(&f, 0, 1, IoFlags::READ), Err(ZplError::AccessDenied)));
    }

    #[test]
    fn test_mapped_file_reads_through_cache() {
        let cache = Arc::new(MemoryPageCache::new());
        let collab = Collaborators {
            pages: cache.clone(),
            ..Default::default()
        };
        let (mount, _store, f) = make_file(ZplConfig::default(), collab);
        mount.write(&f, 0, b"mapped data", IoFlags::WRITE, &Cred::root()).unwrap();
        cache.map(f.id());
        assert_eq!(mount.read(&f, 0, 6, IoFlags::READ).unwrap(), b"mapped".to_vec());
        assert_eq!(cache.misses(), 1);
        assert_eq!(mount.read(&f, 7, 4, IoFlags::READ).unwrap(), b"data".to_vec());
        assert_eq!(cache.hits(), 1);
    }
}
