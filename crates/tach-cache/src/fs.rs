//! Local filesystem cache tier
//!
//! Artifacts live flat under the cache directory as `<key>.tar.gz` with a
//! `<key>-meta.json` sidecar recording how long the original execution
//! took. The sidecar is written atomically (tempfile + rename) so a
//! concurrent reader never observes a torn file.

use serde::{Deserialize, Serialize};
use tach_path::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf, AnchoredUnixPathBuf};

use crate::{CacheError, CacheHitMetadata, CacheReader, CacheSource, CacheWriter};

#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    hash: String,
    duration_ms: u64,
}

#[derive(Clone)]
pub struct FsCache {
    cache_dir: AbsoluteSystemPathBuf,
}

impl FsCache {
    pub fn new(cache_dir: AbsoluteSystemPathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_dir.as_std_path()).map_err(|source| CacheError::Io {
            path: cache_dir.clone(),
            source,
        })?;
        Ok(Self { cache_dir })
    }

    pub fn artifact_path(&self, key: &str) -> AbsoluteSystemPathBuf {
        self.cache_dir.join_component(&format!("{key}.tar.gz"))
    }

    fn meta_path(&self, key: &str) -> AbsoluteSystemPathBuf {
        self.cache_dir.join_component(&format!("{key}-meta.json"))
    }

    /// Cheap presence check; reads only the sidecar.
    pub fn exists(&self, key: &str) -> Option<CacheHitMetadata> {
        if !self.artifact_path(key).as_std_path().exists() {
            return None;
        }
        Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved_ms: self.read_duration(key),
        })
    }

    /// Restore the artifact for `key` under `anchor`. `None` on miss; a
    /// corrupt artifact surfaces as an error for the caller to degrade.
    pub fn fetch(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredUnixPathBuf>)>, CacheError> {
        let artifact = self.artifact_path(key);
        if !artifact.as_std_path().exists() {
            return Ok(None);
        }
        let restored = CacheReader::open(&artifact)?.restore(anchor)?;
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved_ms: self.read_duration(key),
            },
            restored,
        )))
    }

    /// Write an artifact. An already-present key is left untouched:
    /// fingerprinted content is immutable, and `create_new` semantics
    /// keep two writers from clobbering each other.
    pub fn put(
        &self,
        key: &str,
        anchor: &AbsoluteSystemPathBuf,
        outputs: &[AnchoredSystemPathBuf],
        metadata: &[AnchoredSystemPathBuf],
        duration_ms: u64,
    ) -> Result<(), CacheError> {
        let artifact = self.artifact_path(key);
        let mut writer = match CacheWriter::create(&artifact) {
            Ok(writer) => writer,
            Err(CacheError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::AlreadyExists =>
            {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        for path in outputs {
            writer.add_file(anchor, path)?;
        }
        for path in metadata {
            writer.add_metadata(anchor, path)?;
        }
        writer.finish()?;

        self.write_metadata(key, duration_ms)?;
        Ok(())
    }

    /// Raw artifact bytes, for uploading to a remote tier.
    pub fn read_artifact(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.artifact_path(key);
        std::fs::read(path.as_std_path()).map_err(|source| CacheError::Io { path, source })
    }

    /// Store artifact bytes fetched from a remote tier. A concurrent
    /// writer winning the race is fine; the bytes are identical by key.
    pub fn write_artifact(&self, key: &str, bytes: &[u8], duration_ms: u64) -> Result<(), CacheError> {
        let artifact = self.artifact_path(key);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(artifact.as_std_path())
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(bytes).map_err(|source| CacheError::Io {
                    path: artifact.clone(),
                    source,
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
            Err(source) => {
                return Err(CacheError::Io {
                    path: artifact,
                    source,
                })
            }
        }
        self.write_metadata(key, duration_ms)
    }

    fn write_metadata(&self, key: &str, duration_ms: u64) -> Result<(), CacheError> {
        let meta = CacheMetadata {
            hash: key.to_string(),
            duration_ms,
        };
        let json = serde_json::to_vec_pretty(&meta).map_err(|source| CacheError::Metadata {
            key: key.to_string(),
            source,
        })?;
        atomic_write(&self.meta_path(key), &json)
    }

    fn read_duration(&self, key: &str) -> u64 {
        let Ok(contents) = std::fs::read(self.meta_path(key).as_std_path()) else {
            return 0;
        };
        serde_json::from_slice::<CacheMetadata>(&contents)
            .map(|meta| meta.duration_ms)
            .unwrap_or(0)
    }
}

/// Write via a tempfile in the destination directory, then rename into
/// place.
fn atomic_write(path: &AbsoluteSystemPathBuf, contents: &[u8]) -> Result<(), CacheError> {
    use std::io::Write;

    let parent = path
        .parent()
        .unwrap_or_else(|| path.clone());
    let temp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent.as_std_path())
        .map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;

    let (mut file, temp_path) = temp.into_parts();
    file.write_all(contents).map_err(|source| CacheError::Io {
        path: path.clone(),
        source,
    })?;
    drop(file);

    temp_path.persist(path.as_std_path()).map_err(|e| CacheError::Io {
        path: path.clone(),
        source: e.error,
    })?;
    Ok(())
}
