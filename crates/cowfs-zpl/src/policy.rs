//! Permission, quota, scanning and mandatory-lock collaborators.
//!
//! The vnode layer asks these questions but does not answer them itself. The
//! defaults implement plain POSIX mode-bit semantics with no quotas, no content
//! scanning and no mandatory locks.

use dashmap::DashSet;

use crate::error::{Result, ZplError};
use crate::types::{mode, Cred, FileKind, FlagChange, NodeAttrs, NodeFlags, ObjectId, SetAttrs};

/// POSIX access mode flags (matches libc values).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AccessMode(pub u32);

impl AccessMode {
    pub const F_OK: AccessMode = AccessMode(0);
    pub const R_OK: AccessMode = AccessMode(4);
    pub const W_OK: AccessMode = AccessMode(2);
    pub const X_OK: AccessMode = AccessMode(1);
    /// Add an entry to a directory.
    pub const ADD_ENTRY: AccessMode = AccessMode(2 | 1);
    /// Traverse a directory.
    pub const SEARCH: AccessMode = AccessMode(1);

    pub fn has_read(&self) -> bool {
        self.0 & Self::R_OK.0 != 0
    }

    pub fn has_write(&self) -> bool {
        self.0 & Self::W_OK.0 != 0
    }

    pub fn has_execute(&self) -> bool {
        self.0 & Self::X_OK.0 != 0
    }
}

impl std::ops::BitOr for AccessMode {
    type Output = AccessMode;
    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

/// Access-control decisions.
pub trait AccessPolicy: Send + Sync {
    /// Fails with [`ZplError::AccessDenied`] if `cred` lacks `mode` on `node`.
    fn check_access(&self, node: &NodeAttrs, cred: &Cred, mode: AccessMode) -> Result<()>;

    /// Whether `cred` may remove `child` from `dir`.
    fn check_delete(&self, dir: &NodeAttrs, child: &NodeAttrs, cred: &Cred) -> Result<()>;

    /// Whether `cred` may change the attributes in `req` on `node`.
    fn check_setattr(&self, node: &NodeAttrs, cred: &Cred, req: &SetAttrs) -> Result<()>;

    /// Whether `cred` may set or clear the requested persistent flags.
    /// `node` is `None` when the flags are requested at creation.
    fn check_flags(&self, node: Option<&NodeAttrs>, cred: &Cred, change: &FlagChange) -> Result<()>;

    /// Whether `cred` may hard-link a file it does not own.
    fn may_link_any(&self, cred: &Cred) -> bool;

    /// Whether `cred` may set the sticky bit on a non-directory.
    fn may_set_sticky(&self, cred: &Cred) -> bool;

    /// Whether a set-group-id bit survives a chmod by `cred` on a file owned by `gid`.
    fn may_retain_setgid(&self, cred: &Cred, gid: u32) -> bool;

    /// Whether set-id bits on an executable `node` survive a write by `cred`.
    fn may_retain_setid(&self, cred: &Cred, node: &NodeAttrs) -> bool;
}

/// Owner/group/other mode-bit checks with a privileged bypass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixAccessPolicy;

impl PosixAccessPolicy {
    fn is_owner(node: &NodeAttrs, cred: &Cred) -> bool {
        cred.privileged || node.uid == cred.uid
    }
}

impl AccessPolicy for PosixAccessPolicy {
    fn check_access(&self, node: &NodeAttrs, cred: &Cred, want: AccessMode) -> Result<()> {
        if cred.privileged {
            // Execute still needs at least one x bit on regular files.
            if want.has_execute() && node.kind == FileKind::Regular && node.mode & mode::S_IXANY == 0 {
                return Err(ZplError::AccessDenied);
            }
            return Ok(());
        }

        let bits = node.mode & 0o777;
        let shift = if node.uid == cred.uid {
            6
        } else if cred.is_member(node.gid) {
            3
        } else {
            0
        };
        let granted = (bits >> shift) & 0o7;
        if granted & want.0 != want.0 {
            return Err(ZplError::AccessDenied);
        }
        Ok(())
    }

    fn check_delete(&self, dir: &NodeAttrs, child: &NodeAttrs, cred: &Cred) -> Result<()> {
        self.check_access(dir, cred, AccessMode::ADD_ENTRY)?;
        if dir.mode & mode::S_ISVTX != 0
            && !cred.privileged
            && dir.uid != cred.uid
            && child.uid != cred.uid
        {
            return Err(ZplError::AccessDenied);
        }
        Ok(())
    }

    fn check_setattr(&self, node: &NodeAttrs, cred: &Cred, req: &SetAttrs) -> Result<()> {
        if cred.privileged {
            return Ok(());
        }
        if req.uid.is_some_and(|uid| uid != node.uid) {
            // Restricted chown: only privileged callers give files away.
            return Err(ZplError::PermissionDenied("chown restricted"));
        }
        if let Some(gid) = req.gid {
            if node.uid != cred.uid || (gid != node.gid && !cred.is_member(gid)) {
                return Err(ZplError::PermissionDenied("chgrp to a foreign group"));
            }
        }
        let owner_only = req.mode.is_some() || req.mtime.is_some() || req.crtime.is_some();
        if owner_only && node.uid != cred.uid {
            return Err(ZplError::PermissionDenied("not owner"));
        }
        if req.atime.is_some() && node.uid != cred.uid {
            self.check_access(node, cred, AccessMode::W_OK)
                .map_err(|_| ZplError::PermissionDenied("not owner"))?;
        }
        if req.size.is_some() {
            self.check_access(node, cred, AccessMode::W_OK)?;
        }
        Ok(())
    }

    fn check_flags(&self, node: Option<&NodeAttrs>, cred: &Cred, change: &FlagChange) -> Result<()> {
        if change.touched().is_empty() || cred.privileged {
            return Ok(());
        }
        if let Some(node) = node {
            if !Self::is_owner(node, cred) {
                return Err(ZplError::PermissionDenied("not owner"));
            }
        }
        let mut restricted = change.touched();
        restricted.remove(NodeFlags::OWNER_SETTABLE);
        if !restricted.is_empty() {
            return Err(ZplError::PermissionDenied("flag requires privilege"));
        }
        Ok(())
    }

    fn may_link_any(&self, cred: &Cred) -> bool {
        cred.privileged
    }

    fn may_set_sticky(&self, cred: &Cred) -> bool {
        cred.privileged
    }

    fn may_retain_setgid(&self, cred: &Cred, gid: u32) -> bool {
        cred.privileged || cred.is_member(gid)
    }

    fn may_retain_setid(&self, cred: &Cred, node: &NodeAttrs) -> bool {
        Self::is_owner(node, cred)
    }
}

/// Quota decisions for creations, ownership changes and writes.
pub trait QuotaPolicy: Send + Sync {
    /// Whether the owner `uid` or group `gid` is already over quota.
    fn over_quota(&self, uid: u32, gid: u32) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuota;

impl QuotaPolicy for NoQuota {
    fn over_quota(&self, _uid: u32, _gid: u32) -> bool {
        false
    }
}

/// Marks individual users and groups as over quota.
#[derive(Debug, Default)]
pub struct ExceededQuotas {
    users: DashSet<u32>,
    groups: DashSet<u32>,
}

impl ExceededQuotas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exceed_user(&self, uid: u32) {
        self.users.insert(uid);
    }

    pub fn exceed_group(&self, gid: u32) {
        self.groups.insert(gid);
    }

    pub fn clear(&self) {
        self.users.clear();
        self.groups.clear();
    }
}

impl QuotaPolicy for ExceededQuotas {
    fn over_quota(&self, uid: u32, gid: u32) -> bool {
        self.users.contains(&uid) || self.groups.contains(&gid)
    }
}

/// Content scanning hook run around opens and last closes of regular files.
pub trait ContentScanner: Send + Sync {
    fn scan_open(&self, node: &NodeAttrs, cred: &Cred) -> Result<()>;
    fn scan_close(&self, node: &NodeAttrs, cred: &Cred);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoScanner;

impl ContentScanner for NoScanner {
    fn scan_open(&self, _node: &NodeAttrs, _cred: &Cred) -> Result<()> {
        Ok(())
    }

    fn scan_close(&self, _node: &NodeAttrs, _cred: &Cred) {}
}

/// Mandatory record locks held outside the vnode layer.
pub trait LockChecker: Send + Sync {
    /// Fails with [`ZplError::Locked`] if a mandatory lock conflicts with the access.
    fn check(&self, object: ObjectId, offset: u64, len: u64, write: bool) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoMandatoryLocks;

impl LockChecker for NoMandatoryLocks {
    fn check(&self, _object: ObjectId, _offset: u64, _len: u64, _write: bool) -> Result<()> {
        Ok(())
    }
}

/// Mandatory locking applies when set-group-id is on and group execute is off.
pub fn mandatory_locking(node_mode: u32) -> bool {
    node_mode & mode::S_ISGID != 0 && node_mode & mode::S_IXGRP == 0
}
