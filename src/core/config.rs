//! Purpose: Queue-provided storage configuration and store file naming.
//! Exports: `StoreConfig`, `TaskManagerConfig`, `StorePaths`.
//! Role: The configuration record the owning queue/topic hands to the core.
//! Invariants: `validate` runs before any file is created or opened.
//! Invariants: Store names must not contain path separators.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const MIN_BLOCK_SIZE: u32 = 64;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub block_size: u32,
    pub initial_blocks: u32,
    pub max_blocks: u32,
    pub extend_blocks: u32,
    pub data_dir: PathBuf,
    pub journal_enabled: bool,
    /// Debug: keep the replayed journal as `<name>.jnl.replayed`.
    pub keep_journal: bool,
    pub checkpoint_bytes: u64,
    pub max_volatile_messages: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            initial_blocks: 128,
            max_blocks: 1 << 20,
            extend_blocks: 128,
            data_dir: PathBuf::from("data"),
            journal_enabled: true,
            keep_journal: false,
            checkpoint_bytes: 4 * 1024 * 1024,
            max_volatile_messages: 100_000,
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        let config: StoreConfig = serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid store config json")
                .with_path(path)
                .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("block_size must be at least {MIN_BLOCK_SIZE}")));
        }
        if self.initial_blocks == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("initial_blocks must be > 0"));
        }
        if self.max_blocks < self.initial_blocks {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("max_blocks must be >= initial_blocks"));
        }
        if self.max_blocks > i32::MAX as u32 {
            return Err(Error::new(ErrorKind::Usage).with_message("max_blocks exceeds i32 range"));
        }
        if self.max_volatile_messages > i32::MAX as u32 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("max_volatile_messages exceeds i32 range"));
        }
        Ok(())
    }

    pub fn paths(&self, name: &str) -> Result<StorePaths, Error> {
        StorePaths::resolve(&self.data_dir, name)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    pub min_threads: usize,
    pub max_idle: usize,
    pub max_threads: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_idle: 2,
            max_threads: 4,
        }
    }
}

impl TaskManagerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_threads == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("max_threads must be > 0"));
        }
        if self.min_threads > self.max_threads {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("min_threads must be <= max_threads"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorePaths {
    pub name: String,
    pub blocks: PathBuf,
    pub journal: PathBuf,
    pub checkpoint: PathBuf,
}

impl StorePaths {
    pub fn resolve(dir: &Path, name: &str) -> Result<Self, Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("store name is empty"));
        }
        if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("store name must not contain path separators"));
        }
        Ok(Self {
            name: name.to_string(),
            blocks: dir.join(format!("{name}.blk")),
            journal: dir.join(format!("{name}.jnl")),
            checkpoint: dir.join(format!("{name}.ckpt")),
        })
    }

    pub fn replayed_journal(&self) -> PathBuf {
        let mut name = self.journal.clone().into_os_string();
        name.push(".replayed");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{StoreConfig, StorePaths, TaskManagerConfig};
    use crate::core::error::ErrorKind;
    use std::path::Path;

    #[test]
    fn defaults_validate() {
        StoreConfig::default().validate().expect("valid");
        TaskManagerConfig::default().validate().expect("valid");
    }

    #[test]
    fn tiny_blocks_are_rejected() {
        let config = StoreConfig {
            block_size: 16,
            ..StoreConfig::default()
        };
        let err = config.validate().expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn max_below_initial_is_rejected() {
        let config = StoreConfig {
            initial_blocks: 10,
            max_blocks: 5,
            ..StoreConfig::default()
        };
        assert_eq!(config.validate().expect_err("bounds").kind(), ErrorKind::Usage);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"block_size": 128, "journal_enabled": false}"#).expect("write");
        let config = StoreConfig::from_json_path(&path).expect("load");
        assert_eq!(config.block_size, 128);
        assert!(!config.journal_enabled);
        assert_eq!(config.extend_blocks, StoreConfig::default().extend_blocks);
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let err = StorePaths::resolve(Path::new("/tmp"), "a/b").expect_err("separator");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let paths = StorePaths::resolve(Path::new("/tmp"), "orders").expect("paths");
        assert_eq!(paths.blocks, Path::new("/tmp/orders.blk"));
        assert_eq!(paths.replayed_journal(), Path::new("/tmp/orders.jnl.replayed"));
    }
}
