//! Crate-wide error type.

use derive_more::Display;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    /// Missing or malformed configuration, or a malformed shard layout
    /// detected before any compute begins.
    #[display(fmt = "configuration error: {}", _0)]
    Config(String),

    /// A file operation failed. Carries the affected filename and the
    /// logical offset of the operation.
    #[display(fmt = "i/o error on {:?} at offset {}: {}", path, offset, source)]
    Io {
        source: std::io::Error,
        path: PathBuf,
        offset: u64,
    },

    /// An on-disk invariant does not hold (adjacency/edge-data mismatch,
    /// missing intervals file, unexpected duplicate edges).
    #[display(fmt = "invariant violation: {}", _0)]
    Invariant(String),
}

impl Error {
    pub fn io(source: std::io::Error, path: &Path) -> Self {
        Error::Io {
            source,
            path: path.to_path_buf(),
            offset: 0,
        }
    }

    pub fn io_at(source: std::io::Error, path: &Path, offset: u64) -> Self {
        Error::Io {
            source,
            path: path.to_path_buf(),
            offset,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
