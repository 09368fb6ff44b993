//! On-disk layout and key validation.
//!
//! ```text
//! <root>/
//!   .lock          store lock file
//!   .compression   name of the compressor the blocks were written with
//!   node/<key>     newline-delimited block hashes of one value
//!   block/<hash>   one chunk, named by its content hash
//! ```

use std::path::{is_separator, Path, PathBuf};

use crate::error::{Result, StoreError};

pub const NODE_DIR: &str = "node";
pub const BLOCK_DIR: &str = "block";
pub const LOCK_FILE: &str = ".lock";
pub const COMPRESSION_FILE: &str = ".compression";

/// Check that `key` names a single file inside the node directory.
///
/// Keys must be non-empty, must not contain a path separator or NUL byte,
/// and must not be `.` or `..`.
pub fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.chars().any(|c| is_separator(c) || c == '\0');
    if invalid {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Resolved paths of one store root.
#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
    node_dir: PathBuf,
    block_dir: PathBuf,
    lock_file: PathBuf,
    compression_file: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            node_dir: root.join(NODE_DIR),
            block_dir: root.join(BLOCK_DIR),
            lock_file: root.join(LOCK_FILE),
            compression_file: root.join(COMPRESSION_FILE),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_dir(&self) -> &Path {
        &self.node_dir
    }

    pub fn block_dir(&self) -> &Path {
        &self.block_dir
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn compression_file(&self) -> &Path {
        &self.compression_file
    }

    /// Node file path for `key`, rejecting keys that could escape the root.
    pub fn node_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.node_dir.join(key))
    }

    /// Block file path for an encoded hash.
    pub fn block_path(&self, hash: &str) -> PathBuf {
        self.block_dir.join(hash)
    }
}
