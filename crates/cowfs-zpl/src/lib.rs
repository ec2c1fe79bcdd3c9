//! CowFS POSIX layer: vnode operations over a transactional copy-on-write
//! object store, with an intent log for synchronous semantics and crash replay.

pub mod config;
pub mod error;
pub mod guard;
pub mod memstore;
pub mod node;
pub mod pagecache;
pub mod policy;
pub mod range_lock;
pub mod stats;
pub mod store;
pub mod types;
pub mod vnode_lock;
pub mod zil;

mod create;
mod dirent;
mod fuid;
mod mount;
mod open;
mod read;
mod readdir;
mod release;
mod remove;
mod rename;
mod rename_lock;
mod replay;
mod retry;
mod setattr;
mod unlinked;
mod write;

pub use config::{SameObjectRename, SyncPolicy, ZplConfig};
pub use create::CreateAttrs;
pub use error::{Result, ZplError};
pub use fuid::is_ephemeral;
pub use mount::{Collaborators, Mount};
pub use node::NodeRef;
pub use readdir::{dirent_reclen, edirent_reclen, DirEntry, ReaddirOutput, CTLDIR_ID, CTLDIR_NAME};
pub use replay::ReplayStats;
pub use write::WriteResult;
