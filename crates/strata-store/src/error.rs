//! Error types for the block storage engine.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid key: {key:?}")]
    InvalidKey { key: String },

    #[error("Key already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Store is closed")]
    Closed,

    #[error("Corrupt node {key}: {detail}")]
    CorruptNode { key: String, detail: String },

    #[error("Corrupt nodes: {keys:?}")]
    CorruptNodes { keys: Vec<String> },

    #[error("No data written for key: {key}")]
    NoDataWritten { key: String },

    #[error("Store is locked by another handle: {}", .path.display())]
    Locked { path: PathBuf },

    #[error("Store path is a file: {}", .path.display())]
    PathIsFile { path: PathBuf },

    #[error(
        "Store at {} was written with {stored} compression, not {configured}",
        .path.display()
    )]
    CompressionMismatch {
        path: PathBuf,
        stored: String,
        configured: String,
    },

    #[error("Failed to build writer pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("I/O error at {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Recover an engine error that travelled through an `io::Error`, or wrap
    /// a genuine filesystem fault with the path it happened at.
    pub fn from_io(err: io::Error, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if !err.get_ref().is_some_and(|inner| inner.is::<StoreError>()) {
            return StoreError::Io { path, source: err };
        }
        match err.into_inner() {
            Some(inner) => match inner.downcast::<StoreError>() {
                Ok(store_err) => *store_err,
                Err(inner) => StoreError::Io {
                    path,
                    source: io::Error::other(inner),
                },
            },
            None => StoreError::Io {
                path,
                source: io::Error::other("engine error lost in transit"),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            StoreError::AlreadyExists { .. } => true,
            StoreError::Io { source, .. } => source.kind() == io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StoreError::Closed)
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptNode { .. } | StoreError::CorruptNodes { .. }
        )
    }
}

/// Engine errors surfaced through `io::Read` keep their identity so that
/// [`StoreError::from_io`] can unwrap them again.
impl From<StoreError> for io::Error {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::NotFound { .. } => io::ErrorKind::NotFound,
            StoreError::AlreadyExists { .. } => io::ErrorKind::AlreadyExists,
            StoreError::InvalidKey { .. } => io::ErrorKind::InvalidInput,
            StoreError::CorruptNode { .. } | StoreError::CorruptNodes { .. } => {
                io::ErrorKind::InvalidData
            }
            StoreError::Io { source, .. } => source.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Attach a path to raw filesystem errors.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| StoreError::from_io(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_survives_io_roundtrip() {
        let err: io::Error = StoreError::CorruptNode {
            key: "avatar".to_string(),
            detail: "missing block".to_string(),
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let back = StoreError::from_io(err, "/tmp/store");
        assert!(matches!(back, StoreError::CorruptNode { ref key, .. } if key == "avatar"));
    }

    #[test]
    fn test_plain_io_error_is_wrapped_with_path() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let wrapped = StoreError::from_io(err, "/tmp/store/node/a");
        assert!(wrapped.is_not_found());
        assert!(wrapped.to_string().contains("/tmp/store/node/a"));
    }

    #[test]
    fn test_classifiers() {
        assert!(StoreError::Closed.is_closed());
        assert!(StoreError::AlreadyExists { key: "k".into() }.is_already_exists());
        assert!(StoreError::CorruptNodes { keys: vec![] }.is_corrupt());
        assert!(!StoreError::Closed.is_not_found());
    }
}
