//! Mount configuration.
//!
//! Loaded from TOML or JSON; every field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// When operations force the intent log to stable storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Flush only for explicit sync requests.
    #[default]
    Standard,
    /// Flush after every mutating operation.
    Always,
    /// Never flush, even on fsync.
    Disabled,
}

/// Behavior of a rename whose source and target name the same object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SameObjectRename {
    /// POSIX: succeed without changing anything.
    #[default]
    Noop,
    /// BSD: drop the source name, leaving the target link.
    UnlinkSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZplConfig {
    /// Upper bound on bytes copied per read chunk.
    pub read_chunk_size: u64,
    /// Record size. Bounds write chunks and block growth.
    pub max_block_size: u64,
    /// Writes may not start at or beyond this offset.
    pub max_file_offset: u64,
    pub sync: SyncPolicy,
    pub same_object_rename: SameObjectRename,
    pub utf8_only: bool,
    pub show_ctldir: bool,
    pub atime: bool,
    pub read_only: bool,
    pub use_fuids: bool,
    pub vscan: bool,
    pub extended_dirents: bool,
}

impl Default for ZplConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 1024 * 1024,
            max_block_size: 128 * 1024,
            max_file_offset: i64::MAX as u64,
            sync: SyncPolicy::Standard,
            same_object_rename: SameObjectRename::Noop,
            utf8_only: true,
            show_ctldir: false,
            atime: true,
            read_only: false,
            use_fuids: true,
            vscan: false,
            extended_dirents: false,
        }
    }
}

impl ZplConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ZplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the write and read paths cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.max_block_size.is_power_of_two() || self.max_block_size < 512 {
            anyhow::bail!(
                "max_block_size must be a power of two >= 512, got {}",
                self.max_block_size
            );
        }
        if self.read_chunk_size == 0 {
            anyhow::bail!("read_chunk_size must be non-zero");
        }
        Ok(())
    }
}
