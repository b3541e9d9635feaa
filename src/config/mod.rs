//! Configuration Management Module
//!
//! Tunables for the bridge and their on-disk storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{VnetSshConfig, CONFIG_VERSION};
