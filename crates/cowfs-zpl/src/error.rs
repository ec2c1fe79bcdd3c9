use thiserror::Error;

use crate::types::ObjectId;

/// Errors surfaced by the object store collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object {0} does not exist")]
    NoSuchObject(ObjectId),

    #[error("object {0} already exists")]
    ObjectExists(ObjectId),

    #[error("entry already exists in directory map {0}")]
    EntryExists(ObjectId),

    #[error("entry not found in directory map {0}")]
    EntryNotFound(ObjectId),

    #[error("pool is out of space")]
    NoSpace,

    #[error("checksum mismatch reading object {0}")]
    Checksum(ObjectId),

    #[error("transaction {0} is not assigned")]
    NotAssigned(u64),

    #[error("injected fault at {0}")]
    Injected(&'static str),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the intent log collaborator.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log record encoding failed: {0}")]
    Encode(String),

    #[error("intent log is closed")]
    Closed,
}

/// Errors returned by vnode operations.
#[derive(Debug, Error)]
pub enum ZplError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("operation not permitted: {0}")]
    PermissionDenied(&'static str),

    #[error("access denied")]
    AccessDenied,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("cross-device link")]
    CrossDevice,

    #[error("read-only file system")]
    ReadOnly,

    #[error("no space left on device")]
    NoSpace,

    #[error("disk quota exceeded")]
    QuotaExceeded,

    #[error("file too large")]
    FileTooLarge,

    #[error("file name too long")]
    NameTooLong,

    #[error("illegal byte sequence in name")]
    IllegalByteSequence,

    #[error("value too large for defined data type")]
    Overflow,

    #[error("resource busy")]
    Busy,

    #[error("resource temporarily unavailable: conflicting mandatory lock")]
    Locked,

    #[error("I/O error")]
    Io,

    #[error("file system is not mounted")]
    Unmounted,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ZplError>;

impl From<StoreError> for ZplError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoSpace => ZplError::NoSpace,
            StoreError::EntryExists(_) => ZplError::Exists,
            StoreError::EntryNotFound(_) | StoreError::NoSuchObject(_) => ZplError::NotFound,
            StoreError::Checksum(object) => {
                tracing::warn!(%object, "checksum failure reported as EIO");
                ZplError::Io
            }
            other => ZplError::Store(other),
        }
    }
}

impl ZplError {
    /// Maps the error onto the errno a syscall layer would return.
    pub fn errno(&self) -> i32 {
        use libc::*;
        match self {
            ZplError::NotFound => ENOENT,
            ZplError::Exists => EEXIST,
            ZplError::PermissionDenied(_) => EPERM,
            ZplError::AccessDenied => EACCES,
            ZplError::InvalidArgument(_) => EINVAL,
            ZplError::NotDirectory => ENOTDIR,
            ZplError::IsDirectory => EISDIR,
            ZplError::NotEmpty => ENOTEMPTY,
            ZplError::CrossDevice => EXDEV,
            ZplError::ReadOnly => EROFS,
            ZplError::NoSpace => ENOSPC,
            ZplError::QuotaExceeded => EDQUOT,
            ZplError::FileTooLarge => EFBIG,
            ZplError::NameTooLong => ENAMETOOLONG,
            ZplError::IllegalByteSequence => EILSEQ,
            ZplError::Overflow => EOVERFLOW,
            ZplError::Busy => EBUSY,
            ZplError::Locked => EAGAIN,
            ZplError::Io => EIO,
            ZplError::Unmounted => EIO,
            ZplError::Store(_) => EIO,
            ZplError::Log(_) => EIO,
            ZplError::Internal(_) => EIO,
        }
    }
}
