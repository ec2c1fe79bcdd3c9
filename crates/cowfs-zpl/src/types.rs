//! Core identifiers, attribute types, and flag sets shared across the vnode layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Transaction group number.
pub type Txg = u64;

/// Maximum length of a single path component.
pub const MAXNAMELEN: usize = 255;

/// Maximum length of a symlink target.
pub const MAXPATHLEN: usize = 1024;

/// Largest id that is not an ephemeral (mapped) identity.
pub const MAXUID: u32 = i32::MAX as u32;

/// Identifier of an object in the object store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The master object holding the mount's well-known object ids.
    pub const MASTER: ObjectId = ObjectId(1);

    /// Creates an object id from a raw value.
    pub const fn new(id: u64) -> Self {
        ObjectId(id)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a filesystem object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Returns the `S_IFMT` bits for this kind.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileKind::Regular => mode::S_IFREG,
            FileKind::Directory => mode::S_IFDIR,
            FileKind::Symlink => mode::S_IFLNK,
            FileKind::CharDevice => mode::S_IFCHR,
            FileKind::BlockDevice => mode::S_IFBLK,
            FileKind::Fifo => mode::S_IFIFO,
            FileKind::Socket => mode::S_IFSOCK,
        }
    }

    /// Returns the `d_type` value emitted in directory records.
    pub fn dirent_type(&self) -> u8 {
        match self {
            FileKind::Fifo => 1,
            FileKind::CharDevice => 2,
            FileKind::Directory => 4,
            FileKind::BlockDevice => 6,
            FileKind::Regular => 8,
            FileKind::Symlink => 10,
            FileKind::Socket => 12,
        }
    }

    /// Packs the kind into the top bits of a directory-map value.
    pub(crate) fn dirent_tag(&self) -> u64 {
        u64::from(self.dirent_type())
    }

    pub(crate) fn from_dirent_tag(tag: u64) -> Option<FileKind> {
        match tag {
            1 => Some(FileKind::Fifo),
            2 => Some(FileKind::CharDevice),
            4 => Some(FileKind::Directory),
            6 => Some(FileKind::BlockDevice),
            8 => Some(FileKind::Regular),
            10 => Some(FileKind::Symlink),
            12 => Some(FileKind::Socket),
            _ => None,
        }
    }
}

/// POSIX mode bits.
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
    pub const S_ISUID: u32 = 0o4000;
    pub const S_ISGID: u32 = 0o2000;
    pub const S_ISVTX: u32 = 0o1000;
    pub const S_IXGRP: u32 = 0o0010;
    /// Any execute bit.
    pub const S_IXANY: u32 = 0o0111;
    /// Permission bits including the set-id and sticky bits.
    pub const PERM_MASK: u32 = 0o7777;
}

/// Wall-clock timestamp.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        }
    }

    pub fn new(secs: i64, nanos: u32) -> Self {
        Timestamp { secs, nanos }
    }

    /// Whether the value fits the 32-bit on-disk time encoding.
    pub fn fits_32bit(&self) -> bool {
        self.secs >= i64::from(i32::MIN) && self.secs <= i64::from(i32::MAX)
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident : $repr:ty { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn from_bits(bits: $repr) -> Self {
                $name(bits)
            }

            pub fn bits(&self) -> $repr {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn intersects(&self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: $name, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

flag_set! {
    /// Persistent per-object flags.
    NodeFlags: u64 {
        READONLY = 1 << 0;
        HIDDEN = 1 << 1;
        SYSTEM = 1 << 2;
        ARCHIVE = 1 << 3;
        IMMUTABLE = 1 << 4;
        NOUNLINK = 1 << 5;
        APPENDONLY = 1 << 6;
        NODUMP = 1 << 7;
        AV_QUARANTINED = 1 << 8;
        AV_MODIFIED = 1 << 9;
        REPARSE = 1 << 10;
        /// Object lives in an extended-attribute namespace.
        XATTR = 1 << 11;
    }
}

impl NodeFlags {
    /// Flags any owner may change without privilege.
    pub const OWNER_SETTABLE: NodeFlags =
        NodeFlags(Self::HIDDEN.0 | Self::ARCHIVE.0 | Self::READONLY.0 | Self::NODUMP.0);
}

flag_set! {
    /// Per-call I/O and open flags.
    IoFlags: u32 {
        READ = 1 << 0;
        WRITE = 1 << 1;
        APPEND = 1 << 2;
        /// Data and metadata must be durable on return.
        SYNC = 1 << 3;
        /// Data must be durable on return.
        DSYNC = 1 << 4;
        /// Reads must observe durably logged writes.
        RSYNC = 1 << 5;
    }
}

impl IoFlags {
    pub fn wants_sync(&self) -> bool {
        self.intersects(IoFlags::SYNC | IoFlags::DSYNC)
    }
}

/// Caller credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub privileged: bool,
}

impl Cred {
    pub fn root() -> Self {
        Cred {
            uid: 0,
            gid: 0,
            groups: Vec::new(),
            privileged: true,
        }
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Cred {
            uid,
            gid,
            groups: Vec::new(),
            privileged: false,
        }
    }

    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    pub fn is_member(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Ids of the per-object attributes kept in the attribute store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttrId {
    Kind,
    Mode,
    Uid,
    Gid,
    Size,
    Links,
    Flags,
    Parent,
    Atime,
    Mtime,
    Ctime,
    Crtime,
    Gen,
    Rdev,
    XattrDir,
    SymlinkTarget,
}

/// One attribute value, keyed by its [`AttrId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attr {
    Kind(FileKind),
    Mode(u32),
    Uid(u32),
    Gid(u32),
    Size(u64),
    Links(u64),
    Flags(NodeFlags),
    Parent(ObjectId),
    Atime(Timestamp),
    Mtime(Timestamp),
    Ctime(Timestamp),
    Crtime(Timestamp),
    Gen(u64),
    Rdev(u64),
    XattrDir(ObjectId),
    SymlinkTarget(Vec<u8>),
}

impl Attr {
    pub fn id(&self) -> AttrId {
        match self {
            Attr::Kind(_) => AttrId::Kind,
            Attr::Mode(_) => AttrId::Mode,
            Attr::Uid(_) => AttrId::Uid,
            Attr::Gid(_) => AttrId::Gid,
            Attr::Size(_) => AttrId::Size,
            Attr::Links(_) => AttrId::Links,
            Attr::Flags(_) => AttrId::Flags,
            Attr::Parent(_) => AttrId::Parent,
            Attr::Atime(_) => AttrId::Atime,
            Attr::Mtime(_) => AttrId::Mtime,
            Attr::Ctime(_) => AttrId::Ctime,
            Attr::Crtime(_) => AttrId::Crtime,
            Attr::Gen(_) => AttrId::Gen,
            Attr::Rdev(_) => AttrId::Rdev,
            Attr::XattrDir(_) => AttrId::XattrDir,
            Attr::SymlinkTarget(_) => AttrId::SymlinkTarget,
        }
    }
}

/// Snapshot of a node's attributes as returned by getattr.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub id: ObjectId,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links: u64,
    pub flags: NodeFlags,
    pub parent: ObjectId,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
    pub gen: u64,
    pub rdev: u64,
    pub block_size: u64,
    pub xattr_dir: Option<ObjectId>,
}

/// Fully resolved attributes of a node about to be created. Logged verbatim
/// so replay recreates the node identically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNodeAttrs {
    pub kind: FileKind,
    /// Permission bits, including set-id and sticky bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub flags: NodeFlags,
    pub time: Timestamp,
}

/// Flags to set and clear in one setattr.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagChange {
    pub set: NodeFlags,
    pub clear: NodeFlags,
}

impl FlagChange {
    pub fn touched(&self) -> NodeFlags {
        self.set | self.clear
    }

    pub fn apply(&self, mut flags: NodeFlags) -> NodeFlags {
        flags.insert(self.set);
        flags.remove(self.clear);
        flags
    }
}

/// Attribute changes requested by setattr. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
    pub crtime: Option<Timestamp>,
    pub flags: Option<FlagChange>,
}

impl SetAttrs {
    pub fn is_empty(&self) -> bool {
        self == &SetAttrs::default()
    }

    /// True if anything other than the access time or the immutable flag changes.
    pub fn touches_beyond_atime_and_immutable(&self) -> bool {
        let other_flags = self
            .flags
            .map(|f| {
                let mut touched = f.touched();
                touched.remove(NodeFlags::IMMUTABLE);
                !touched.is_empty()
            })
            .unwrap_or(false);
        self.mode.is_some()
            || self.uid.is_some()
            || self.gid.is_some()
            || self.size.is_some()
            || self.mtime.is_some()
            || self.crtime.is_some()
            || other_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        assert_eq!(ObjectId::new(42).to_string(), "42");
        assert_eq!(ObjectId::MASTER.as_u64(), 1);
    }

    #[test]
    fn test_node_flags_ops() {
        let mut flags = NodeFlags::empty();
        flags.insert(NodeFlags::IMMUTABLE | NodeFlags::NODUMP);
        assert!(flags.contains(NodeFlags::IMMUTABLE));
        assert!(flags.intersects(NodeFlags::NODUMP | NodeFlags::HIDDEN));
        assert!(!flags.contains(NodeFlags::NODUMP | NodeFlags::HIDDEN));
        flags.set(NodeFlags::IMMUTABLE, false);
        assert_eq!(flags, NodeFlags::NODUMP);
    }

    #[test]
    fn test_io_flags_sync() {
        assert!(IoFlags::DSYNC.wants_sync());
        assert!((IoFlags::WRITE | IoFlags::SYNC).wants_sync());
        assert!(!IoFlags::RSYNC.wants_sync());
    }

    #[test]
    fn test_dirent_tag_roundtrip_for_every_kind() {
        for kind in [
            FileKind::Regular,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::CharDevice,
            FileKind::BlockDevice,
            FileKind::Fifo,
            FileKind::Socket,
        ] {
            assert_eq!(FileKind::from_dirent_tag(kind.dirent_tag()), Some(kind));
        }
        assert_eq!(FileKind::from_dirent_tag(3), None);
    }

    #[test]
    fn test_timestamp_32bit_range() {
        assert!(Timestamp::new(0, 0).fits_32bit());
        assert!(Timestamp::new(i64::from(i32::MAX), 0).fits_32bit());
        assert!(!Timestamp::new(i64::from(i32::MAX) + 1, 0).fits_32bit());
    }

    #[test]
    fn test_cred_membership() {
        let cred = Cred::user(100, 10).with_groups(vec![20, 30]);
        assert!(cred.is_member(10));
        assert!(cred.is_member(30));
        assert!(!cred.is_member(40));
        assert!(Cred::root().privileged);
    }

    #[test]
    fn test_attr_id() {
        assert_eq!(Attr::Size(3).id(), AttrId::Size);
        assert_eq!(Attr::XattrDir(ObjectId::new(4)).id(), AttrId::XattrDir);
    }

    #[test]
    fn test_setattrs_immutable_scope() {
        let atime_only = SetAttrs {
            atime: Some(Timestamp::new(1, 0)),
            ..Default::default()
        };
        assert!(!atime_only.touches_beyond_atime_and_immutable());
        let clear_immutable = SetAttrs {
            flags: Some(FlagChange {
                set: NodeFlags::empty(),
                clear: NodeFlags::IMMUTABLE,
            }),
            ..Default::default()
        };
        assert!(!clear_immutable.touches_beyond_atime_and_immutable());
        let chmod = SetAttrs {
            mode: Some(0o600),
            ..Default::default()
        };
        assert!(chmod.touches_beyond_atime_and_immutable());
        assert!(SetAttrs::default().is_empty());
    }

    #[test]
    fn test_flag_change_apply() {
        let change = FlagChange {
            set: NodeFlags::HIDDEN,
            clear: NodeFlags::ARCHIVE,
        };
        let flags = change.apply(NodeFlags::ARCHIVE | NodeFlags::NODUMP);
        assert_eq!(flags, NodeFlags::HIDDEN | NodeFlags::NODUMP);
    }
}
