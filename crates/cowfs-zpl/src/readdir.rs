//! Directory listing.
//!
//! A listing position is either a small sentinel or a serialized map cursor.
//! Offsets 0 and 1 produce `.` and `..`, offset 2 produces the control
//! directory when it is shown, and any offset up to 3 otherwise starts the map
//! from its first entry. Map positions are stored as `cookie << 4`, so they
//! never collide with the sentinels.

use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

use crate::dirent::decode_entry;
use crate::error::{Result, ZplError};
use crate::mount::{Mount, MountInner};
use crate::node::NodeRef;
use crate::policy::AccessMode;
use crate::stats::VnodeOp;
use crate::types::{Cred, FileKind, ObjectId};

/// Name of the control directory pseudo-entry shown in the root.
pub const CTLDIR_NAME: &[u8] = b".zfs";

/// Object id reported for the control directory.
pub const CTLDIR_ID: ObjectId = ObjectId::new(0x0000_FFFF_FFFF_FFFF);

const CURSOR_SHIFT: u32 = 4;

/// One emitted directory record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub id: ObjectId,
    pub name: Vec<u8>,
    /// Entry type. Extended records do not carry one.
    pub kind: Option<FileKind>,
    /// Record length in the output buffer.
    pub reclen: u16,
    /// Position to resume from after this entry.
    pub next_offset: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaddirOutput {
    pub entries: Vec<DirEntry>,
    /// Position to pass to the next call.
    pub offset: u64,
    /// Bytes of the output buffer used.
    pub bytes: usize,
    pub eof: bool,
}

/// Record length of a standard directory record for a `namelen`-byte name.
pub fn dirent_reclen(namelen: usize) -> u16 {
    ((19 + namelen + 1 + 7) & !7) as u16
}

/// Record length of an extended directory record.
pub fn edirent_reclen(namelen: usize) -> u16 {
    ((20 + namelen + 1 + 7) & !7) as u16
}

struct Candidate {
    id: ObjectId,
    name: Vec<u8>,
    kind: FileKind,
    next_offset: u64,
}

impl MountInner {
    fn show_ctldir(&self, dir: &NodeRef) -> bool {
        self.config.show_ctldir && dir.id() == self.root_id
    }

    /// The entry at `offset`, or `None` once the map is exhausted.
    fn readdir_next(&self, dir: &NodeRef, offset: u64, show_ctl: bool) -> Result<Option<Candidate>> {
        let sentinel = |name: &[u8], id: ObjectId| Candidate {
            id,
            name: name.to_vec(),
            kind: FileKind::Directory,
            next_offset: offset + 1,
        };
        match offset {
            0 => return Ok(Some(sentinel(b".", dir.id()))),
            1 => return Ok(Some(sentinel(b"..", dir.parent()))),
            2 if show_ctl => return Ok(Some(sentinel(CTLDIR_NAME, CTLDIR_ID))),
            _ => {}
        }
        let cookie = if offset <= 3 { 0 } else { offset >> CURSOR_SHIFT };
        let Some(entry) = self.store.map_list(dir.id(), cookie, 1)?.into_iter().next() else {
            return Ok(None);
        };
        let (kind, id) = decode_entry(entry.value)?;
        Ok(Some(Candidate {
            id,
            name: entry.name,
            kind,
            next_offset: (entry.cookie + 1) << CURSOR_SHIFT,
        }))
    }

    fn readdir_visible(self: &Arc<Self>, id: ObjectId, cred: &Cred) -> bool {
        match self.get_node(id) {
            Ok(node) => self
                .collab
                .access
                .check_access(&node.attrs(), cred, AccessMode::R_OK)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub(crate) fn readdir(
        self: &Arc<Self>,
        dir: &NodeRef,
        offset: u64,
        buf_size: usize,
        filter: bool,
        cred: &Cred,
    ) -> Result<ReaddirOutput> {
        let _guard = self.enter()?;
        self.verify(dir)?;
        if !dir.is_dir() {
            return Err(ZplError::NotDirectory);
        }
        if buf_size == 0 {
            return Err(ZplError::InvalidArgument("empty readdir buffer"));
        }
        let mut out = ReaddirOutput {
            offset,
            ..Default::default()
        };
        if dir.is_unlinked() {
            out.eof = true;
            return Ok(out);
        }

        let show_ctl = self.show_ctldir(dir);
        let prefetch = dir.take_prefetch();
        let extended = self.config.extended_dirents;
        let res = loop {
            if out.bytes >= buf_size {
                break Ok(());
            }
            let candidate = match self.readdir_next(dir, out.offset, show_ctl) {
                Ok(Some(c)) => c,
                Ok(None) => {
                    out.eof = true;
                    break Ok(());
                }
                Err(e) => break Err(e),
            };
            if filter && !self.readdir_visible(candidate.id, cred) {
                trace!(dir = %dir.id(), object = %candidate.id, "entry filtered");
                out.offset = candidate.next_offset;
                continue;
            }

            let reclen = if extended {
                edirent_reclen(candidate.name.len())
            } else {
                dirent_reclen(candidate.name.len())
            };
            if out.bytes + reclen as usize > buf_size {
                if out.entries.is_empty() {
                    break Err(ZplError::InvalidArgument("readdir buffer too small"));
                }
                break Ok(());
            }
            if prefetch && candidate.id != CTLDIR_ID {
                self.store.prefetch(candidate.id);
            }
            out.bytes += reclen as usize;
            out.offset = candidate.next_offset;
            out.entries.push(DirEntry {
                id: candidate.id,
                name: candidate.name,
                kind: if extended { None } else { Some(candidate.kind) },
                reclen,
                next_offset: candidate.next_offset,
            });
        };

        if self.config.atime {
            dir.touch_atime();
        }
        res?;
        trace!(dir = %dir.id(), entries = out.entries.len(), offset = out.offset, eof = out.eof, "readdir");
        Ok(out)
    }
}

impl Mount {
    /// Lists `dir` from `offset`, emitting at most `buf_size` bytes of records.
    /// With `filter`, entries `cred` cannot read are skipped.
    pub fn readdir(
        &self,
        dir: &NodeRef,
        offset: u64,
        buf_size: usize,
        filter: bool,
        cred: &Cred,
    ) -> Result<ReaddirOutput> {
        let started = Instant::now();
        let res = self.inner.readdir(dir, offset, buf_size, filter, cred);
        self.inner.finish(VnodeOp::Readdir, started, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZplConfig;
    use crate::create::CreateAttrs;
    use crate::memstore::MemoryObjectStore;
    use crate::mount::Collaborators;
    use crate::zil::MemoryIntentLog;

    fn make_mount(config: ZplConfig) -> (Mount, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::default());
        let log = Arc::new(MemoryIntentLog::new());
        let mount = Mount::format(store.clone(), log, config, Collaborators::default()).unwrap();
        (mount, store)
    }

    fn populate(mount: &Mount, dir: &NodeRef, names: &[&[u8]]) {
        for name in names {
            mount
                .create(dir, name, FileKind::Regular, &CreateAttrs::with_mode(0o644), &Cred::root())
                .unwrap();
        }
    }

    fn names(out: &ReaddirOutput) -> Vec<Vec<u8>> {
        out.entries.iter().map(|e| e.name.clone()).collect()
    }

    #[test]
    fn test_reclen() {
        assert_eq!(dirent_reclen(1), 24);
        assert_eq!(dirent_reclen(4), 24);
        assert_eq!(dirent_reclen(5), 32);
        assert_eq!(edirent_reclen(3), 24);
        assert_eq!(edirent_reclen(4), 32);
    }

    #[test]
    fn test_full_listing() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        let d = mount.mkdir(&root, b"d", &CreateAttrs::with_mode(0o755), &Cred::root()).unwrap();
        populate(&mount, &d, &[b"a", b"b", b"c"]);

        let out = mount.readdir(&d, 0, 4096, false, &Cred::root()).unwrap();
        assert!(out.eof);
        assert_eq!(
            names(&out),
            vec![b".".to_vec(), b"..".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(out.entries[0].id, d.id());
        assert_eq!(out.entries[1].id, root.id());
        assert_eq!(out.entries[2].kind, Some(FileKind::Regular));
        assert_eq!(out.bytes, out.entries.iter().map(|e| e.reclen as usize).sum::<usize>());
        assert!(d.atime_dirty());
    }

    #[test]
    fn test_resume_from_offset() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        let names_in: Vec<Vec<u8>> = (0..10).map(|i| format!("file{}", i).into_bytes()).collect();
        let refs: Vec<&[u8]> = names_in.iter().map(|n| n.as_slice()).collect();
        populate(&mount, &root, &refs);

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let out = mount.readdir(&root, offset, 64, false, &Cred::root()).unwrap();
            assert!(out.entries.len() <= 2);
            seen.extend(names(&out));
            offset = out.offset;
            if out.eof {
                break;
            }
        }
        assert_eq!(seen.len(), 12);
        for name in &names_in {
            assert_eq!(seen.iter().filter(|n| *n == name).count(), 1);
        }
    }

    #[test]
    fn test_removed_entry_between_calls() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        populate(&mount, &root, &[b"a", b"b", b"c"]);
        let first = mount.readdir(&root, 0, 72, false, &Cred::root()).unwrap();
        assert_eq!(names(&first), vec![b".".to_vec(), b"..".to_vec(), b"a".to_vec()]);
        mount.remove(&root, b"b", &Cred::root()).unwrap();
        let rest = mount.readdir(&root, first.offset, 4096, false, &Cred::root()).unwrap();
        assert_eq!(names(&rest), vec![b"c".to_vec()]);
        assert!(rest.eof);
    }

    #[test]
    fn test_ctldir_only_in_root() {
        let (mount, _) = make_mount(ZplConfig {
            show_ctldir: true,
            ..Default::default()
        });
        let root = mount.root().unwrap();
        let d = mount.mkdir(&root, b"d", &CreateAttrs::with_mode(0o755), &Cred::root()).unwrap();
        let out = mount.readdir(&root, 0, 4096, false, &Cred::root()).unwrap();
        assert_eq!(out.entries[2].name, CTLDIR_NAME.to_vec());
        assert_eq!(out.entries[2].id, CTLDIR_ID);
        assert_eq!(out.entries[3].name, b"d".to_vec());

        let sub = mount.readdir(&d, 0, 4096, false, &Cred::root()).unwrap();
        assert_eq!(sub.entries.len(), 2);
    }

    #[test]
    fn test_buffer_too_small() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        let err = mount.readdir(&root, 0, 8, false, &Cred::root()).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        let err = mount.readdir(&root, 0, 0, false, &Cred::root()).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_access_filter_skips_unreadable() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        mount
            .create(&root, b"public", FileKind::Regular, &CreateAttrs::with_mode(0o644), &Cred::root())
            .unwrap();
        mount
            .create(&root, b"secret", FileKind::Regular, &CreateAttrs::with_mode(0o600), &Cred::root())
            .unwrap();
        let user = Cred::user(1000, 1000);
        let all = mount.readdir(&root, 0, 4096, false, &user).unwrap();
        assert_eq!(all.entries.len(), 4);
        let filtered = mount.readdir(&root, 0, 4096, true, &user).unwrap();
        assert_eq!(
            names(&filtered),
            vec![b".".to_vec(), b"..".to_vec(), b"public".to_vec()]
        );
        assert!(filtered.eof);
    }

    #[test]
    fn test_unlinked_directory_is_empty() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        let d = mount.mkdir(&root, b"gone", &CreateAttrs::with_mode(0o755), &Cred::root()).unwrap();
        mount.rmdir(&root, b"gone", &Cred::root()).unwrap();
        let out = mount.readdir(&d, 0, 4096, false, &Cred::root()).unwrap();
        assert!(out.eof);
        assert!(out.entries.is_empty());
    }

    #[test]
    fn test_prefetch_until_next_lookup() {
        let (mount, store) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        populate(&mount, &root, &[b"a", b"b"]);
        let before = store.stats().prefetches;
        mount.readdir(&root, 0, 4096, false, &Cred::root()).unwrap();
        let after_first = store.stats().prefetches;
        assert_eq!(after_first - before, 4);

        mount.readdir(&root, 0, 4096, false, &Cred::root()).unwrap();
        assert_eq!(store.stats().prefetches, after_first);

        mount.lookup(&root, b"a", &Cred::root()).unwrap();
        mount.readdir(&root, 0, 4096, false, &Cred::root()).unwrap();
        assert_eq!(store.stats().prefetches, after_first + 4);
    }

    #[test]
    fn test_extended_records() {
        let (mount, _) = make_mount(ZplConfig {
            extended_dirents: true,
            ..Default::default()
        });
        let root = mount.root().unwrap();
        populate(&mount, &root, &[b"abcd"]);
        let out = mount.readdir(&root, 0, 4096, false, &Cred::root()).unwrap();
        assert!(out.entries.iter().all(|e| e.kind.is_none()));
        assert_eq!(out.entries[2].reclen, 32);
    }

    #[test]
    fn test_not_a_directory() {
        let (mount, _) = make_mount(ZplConfig::default());
        let root = mount.root().unwrap();
        let f = mount
            .create(&root, b"f", FileKind::Regular, &CreateAttrs::with_mode(0o644), &Cred::root())
            .unwrap();
        assert!(matches!(
            mount.readdir(&f, 0, 4096, false, &Cred::root()),
            Err(ZplError::NotDirectory)
        ));
    }
}
