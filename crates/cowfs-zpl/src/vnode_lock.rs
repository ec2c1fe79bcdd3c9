//! Exclusive per-node lock taken by namespace operations.
//!
//! Supports blocking and non-blocking acquisition. A reclaimed node's lock is
//! doomed: waiters are woken and every later attempt fails.

use parking_lot::{Condvar, Mutex};

/// Why a vnode lock could not be taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VnodeLockError {
    /// Held by someone else (non-blocking attempt only).
    Busy,
    /// The node was reclaimed.
    Doomed,
}

#[derive(Default)]
struct VnodeLockState {
    locked: bool,
    doomed: bool,
}

/// Exclusive lock on one in-core node, doomed when the node is reclaimed.
#[derive(Default)]
pub struct VnodeLock {
    state: Mutex<VnodeLockState>,
    cv: Condvar,
}

impl VnodeLock {
    /// Creates an unlocked, live lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock is free and takes it. Fails with
    /// [`VnodeLockError::Doomed`] if the lock is doomed before or while waiting.
    pub fn lock(&self) -> Result<(), VnodeLockError> {
        let mut state = self.state.lock();
        loop {
            if state.doomed {
                return Err(VnodeLockError::Doomed);
            }
            if !state.locked {
                state.locked = true;
                return Ok(());
            }
            self.cv.wait(&mut state);
        }
    }

    /// Takes the lock if it is free, without waiting.
    pub fn try_lock(&self) -> Result<(), VnodeLockError> {
        let mut state = self.state.lock();
        if state.doomed {
            return Err(VnodeLockError::Doomed);
        }
        if state.locked {
            return Err(VnodeLockError::Busy);
        }
        state.locked = true;
        Ok(())
    }

    /// Releases the lock and wakes every waiter.
    pub fn unlock(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        self.cv.notify_all();
    }

    /// Marks the lock unusable and wakes all waiters.
    pub fn doom(&self) {
        let mut state = self.state.lock();
        state.doomed = true;
        self.cv.notify_all();
    }

    /// Whether someone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Whether the lock was doomed.
    pub fn is_doomed(&self) -> bool {
        self.state.lock().doomed
    }
}
