//! Mount liveness guard.
//!
//! Every operation holds the read side of the teardown lock for its duration.
//! Unmount takes the write side, which drains in-flight operations before the
//! mount is marked dead.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, ZplError};

/// Liveness flag and teardown lock of one mount.
pub struct Teardown {
    lock: RwLock<()>,
    live: AtomicBool,
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

impl Teardown {
    /// A live mount with no operations in flight.
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            live: AtomicBool::new(true),
        }
    }

    /// Enters the mount. Fails with [`ZplError::Unmounted`] once teardown has begun.
    ///
    /// Re-entrant on the read side, so nested entry from the same thread does not
    /// deadlock behind a waiting teardown.
    pub fn enter(&self) -> Result<MountGuard<'_>> {
        let read = self.lock.read_recursive();
        if !self.live.load(Ordering::Acquire) {
            return Err(ZplError::Unmounted);
        }
        Ok(MountGuard { _read: read })
    }

    /// Drains all entered operations and excludes new ones until the returned
    /// guard drops.
    pub fn begin_teardown(&self) -> TeardownGuard<'_> {
        let write = self.lock.write();
        TeardownGuard {
            _write: write,
            live: &self.live,
        }
    }

    /// False once teardown has marked the mount dead.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// Held while an operation runs inside the mount. Exits on drop.
pub struct MountGuard<'a> {
    _read: RwLockReadGuard<'a, ()>,
}

impl MountGuard<'_> {
    /// Leaves the mount explicitly.
    pub fn exit(self) {}
}

/// Exclusive hold on the mount for teardown-style operations.
pub struct TeardownGuard<'a> {
    _write: RwLockWriteGuard<'a, ()>,
    live: &'a AtomicBool,
}

impl TeardownGuard<'_> {
    /// Marks the mount dead; later `enter` calls fail.
    pub fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }
}
