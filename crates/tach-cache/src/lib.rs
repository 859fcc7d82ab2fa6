//! Content-addressed task cache
//!
//! A cache artifact is a gzipped tar keyed by the task fingerprint.
//! Entries live under two top-level prefixes: `cache/` for user outputs
//! (files, directories, symlinks) and `metadata/` for internal payloads
//! such as the task log. Entry names are anchored unix paths; headers are
//! normalized (uid/gid zero, epoch timestamps) so identical outputs
//! produce identical artifacts.
//!
//! The [`CacheMultiplexer`] composes the required local filesystem tier
//! with an optional remote tier behind the [`RemoteClient`] trait, and
//! collapses concurrent operations on one key into a single flight.

mod archive;
mod facade;
mod fs;
mod remote;
mod restore;

use tach_path::{AbsoluteSystemPathBuf, PathError};
use thiserror::Error;

pub use archive::CacheWriter;
pub use facade::{CacheMultiplexer, CacheOpts, RemoteCacheMode};
pub use fs::FsCache;
pub use remote::RemoteClient;
pub use restore::CacheReader;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Archive(#[from] std::io::Error),

    #[error("malformed archive entry name: {0:?}")]
    MalformedName(String),

    #[error("unsupported file type in archive entry {0:?}")]
    UnsupportedFileType(String),

    #[error("archive entry {name:?} links to {target:?}, outside the restore root")]
    LinkTraversal { name: String, target: String },

    #[error("symlink cycle or dangling link among: {}", .0.join(", "))]
    LinkCycle(Vec<String>),

    #[error("corrupt cache metadata for {key}: {source}")]
    Metadata {
        key: String,
        source: serde_json::Error,
    },

    #[error("remote cache error: {0}")]
    Remote(String),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("task panicked during cache operation")]
    Join,
}

/// Which tier satisfied a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Local,
    Remote,
}

/// Hit information returned by `exists` and `fetch`.
#[derive(Debug, Clone, Copy)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    /// Wall-clock milliseconds the original execution took; what a hit
    /// saves.
    pub time_saved_ms: u64,
}
