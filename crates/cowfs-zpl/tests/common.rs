//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use cowfs_zpl::memstore::MemoryObjectStore;
use cowfs_zpl::types::{Cred, FileKind, IoFlags};
use cowfs_zpl::zil::MemoryIntentLog;
use cowfs_zpl::{Collaborators, CreateAttrs, Mount, NodeRef, ZplConfig};

/// A freshly formatted mount over in-memory store and log.
pub struct TestFs {
    pub store: Arc<MemoryObjectStore>,
    pub log: Arc<MemoryIntentLog>,
    pub config: ZplConfig,
    pub mount: Mount,
}

impl TestFs {
    pub fn new() -> Self {
        Self::with_config(ZplConfig::default())
    }

    pub fn with_config(config: ZplConfig) -> Self {
        let store = Arc::new(MemoryObjectStore::default());
        let log = Arc::new(MemoryIntentLog::new());
        let mount = Mount::format(store.clone(), log.clone(), config.clone(), Collaborators::default())
            .expect("format");
        Self {
            store,
            log,
            config,
            mount,
        }
    }

    pub fn root(&self) -> NodeRef {
        self.mount.root().expect("root")
    }

    /// Drops everything not synced or flushed and mounts the surviving images.
    pub fn crash_and_remount(&self) -> TestFs {
        let store = Arc::new(self.store.crash_image());
        let log = Arc::new(self.log.crash_image());
        let mount = Mount::open(store.clone(), log.clone(), self.config.clone(), Collaborators::default())
            .expect("remount");
        TestFs {
            store,
            log,
            config: self.config.clone(),
            mount,
        }
    }

    pub fn create_file(&self, dir: &NodeRef, name: &str) -> NodeRef {
        self.mount
            .create(dir, name.as_bytes(), FileKind::Regular, &CreateAttrs::with_mode(0o644), &Cred::root())
            .expect("create")
    }

    pub fn mkdir(&self, dir: &NodeRef, name: &str) -> NodeRef {
        self.mount
            .mkdir(dir, name.as_bytes(), &CreateAttrs::with_mode(0o755), &Cred::root())
            .expect("mkdir")
    }

    pub fn write_at(&self, node: &NodeRef, offset: i64, data: &[u8]) {
        let res = self
            .mount
            .write(node, offset, data, IoFlags::WRITE, &Cred::root())
            .expect("write");
        assert_eq!(res.written, data.len());
    }

    pub fn read_all(&self, node: &NodeRef) -> Vec<u8> {
        self.mount
            .read(node, 0, node.size() as usize, IoFlags::READ)
            .expect("read")
    }

    /// Every name in `dir` except "." and "..", in cursor order.
    pub fn list(&self, dir: &NodeRef) -> Vec<String> {
        let mut names = Vec::new();
        let mut offset = 0;
        loop {
            let out = self
                .mount
                .readdir(dir, offset, 4096, false, &Cred::root())
                .expect("readdir");
            names.extend(
                out.entries
                    .iter()
                    .filter(|e| e.name != b"." && e.name != b"..")
                    .map(|e| String::from_utf8_lossy(&e.name).into_owned()),
            );
            if out.eof {
                return names;
            }
            offset = out.offset;
        }
    }
}
