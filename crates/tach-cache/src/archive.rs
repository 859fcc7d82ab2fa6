//! Cache artifact creation
//!
//! Writer pipeline: `tar::Builder` → gzip → tee(file, blake3). The tee
//! keeps a rolling digest of the compressed stream so the finished
//! artifact can be tagged without a second read.

use std::fs::File;
use std::io::{self, Read, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use tach_path::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tar::{EntryType, Header};

use crate::CacheError;

/// File that hashes everything written through it.
struct TeeWriter {
    file: File,
    hasher: blake3::Hasher,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Writes one cache artifact. Entries are added relative to an anchor
/// directory; only regular files, directories, and symlinks are
/// permitted. Header fields that vary between machines (uid, gid,
/// timestamps) are normalized.
pub struct CacheWriter {
    builder: tar::Builder<GzEncoder<TeeWriter>>,
}

impl CacheWriter {
    /// Open a new artifact. Uses `create_new` so two writers can never
    /// clobber each other; the caller decides what an existing file
    /// means.
    pub fn create(path: &AbsoluteSystemPathBuf) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.as_std_path()).map_err(|source| CacheError::Io {
                path: parent.clone(),
                source,
            })?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
            .map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;

        let tee = TeeWriter {
            file,
            hasher: blake3::Hasher::new(),
        };
        let encoder = GzEncoder::new(tee, Compression::default());
        Ok(Self {
            builder: tar::Builder::new(encoder),
        })
    }

    /// Add a user output under the `cache/` prefix.
    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPathBuf,
        path: &AnchoredSystemPathBuf,
    ) -> Result<(), CacheError> {
        self.add(anchor, path, "cache")
    }

    /// Add an internal payload (the task log) under the `metadata/`
    /// prefix.
    pub fn add_metadata(
        &mut self,
        anchor: &AbsoluteSystemPathBuf,
        path: &AnchoredSystemPathBuf,
    ) -> Result<(), CacheError> {
        self.add(anchor, path, "metadata")
    }

    fn add(
        &mut self,
        anchor: &AbsoluteSystemPathBuf,
        path: &AnchoredSystemPathBuf,
        prefix: &str,
    ) -> Result<(), CacheError> {
        let file_path = anchor.join(path);
        let metadata =
            std::fs::symlink_metadata(file_path.as_std_path()).map_err(|source| CacheError::Io {
                path: file_path.clone(),
                source,
            })?;

        let entry_name = format!("{prefix}/{}", path.to_unix());

        let mut header = Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(metadata.permissions().mode() & 0o7777);
        }
        #[cfg(not(unix))]
        header.set_mode(0o644);

        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            let target =
                std::fs::read_link(file_path.as_std_path()).map_err(|source| CacheError::Io {
                    path: file_path.clone(),
                    source,
                })?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            // Targets are stored verbatim; restore re-validates them.
            self.builder
                .append_link(&mut header, entry_name, &target)?;
        } else if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            self.builder
                .append_data(&mut header, format!("{entry_name}/"), io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            let file =
                File::open(file_path.as_std_path()).map_err(|source| CacheError::Io {
                    path: file_path.clone(),
                    source,
                })?;
            self.builder
                .append_data(&mut header, entry_name, BoundedReader::new(file, metadata.len()))?;
        } else {
            return Err(CacheError::UnsupportedFileType(entry_name));
        }

        Ok(())
    }

    /// Flush the tar footer and gzip trailer, returning the hex blake3
    /// digest of the compressed artifact.
    pub fn finish(self) -> Result<String, CacheError> {
        let encoder = self.builder.into_inner()?;
        let mut tee = encoder.finish()?;
        tee.flush()?;
        Ok(tee.hasher.finalize().to_hex().to_string())
    }
}

/// Caps a reader at the size recorded in the header, so a file growing
/// mid-archive cannot corrupt the entry framing.
struct BoundedReader {
    inner: File,
    remaining: u64,
}

impl BoundedReader {
    fn new(inner: File, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl Read for BoundedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining as usize);
        let read = self.inner.read(&mut buf[..cap])?;
        self.remaining -= read as u64;
        Ok(read)
    }
}
