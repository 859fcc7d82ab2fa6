//! Cache artifact restore
//!
//! Restoring runs with an untrusted archive: entry names are validated
//! before any filesystem write, symlink targets are resolved lexically
//! within the anchor, and a deferred second pass bounds symlink chains so
//! cycles abort instead of spinning. A restore that fails after partially
//! materializing deletes what it wrote.

use std::fs::File;
use std::io::{self, Read};

use flate2::read::GzDecoder;
use tach_path::{resolve_unix, AbsoluteSystemPathBuf, AnchoredUnixPathBuf};
use tar::EntryType;

use crate::CacheError;

/// Reads one cache artifact from any byte source.
pub struct CacheReader<R: Read> {
    archive: tar::Archive<GzDecoder<R>>,
}

impl CacheReader<File> {
    pub fn open(path: &AbsoluteSystemPathBuf) -> Result<Self, CacheError> {
        let file = File::open(path.as_std_path()).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self::from_reader(file))
    }
}

impl CacheReader<io::Cursor<Vec<u8>>> {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_reader(io::Cursor::new(bytes))
    }
}

/// A symlink entry waiting for its target to materialize.
struct PendingLink {
    path: AnchoredUnixPathBuf,
    target: String,
}

impl<R: Read> CacheReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            archive: tar::Archive::new(GzDecoder::new(reader)),
        }
    }

    /// Restore every entry under `anchor`, returning the anchored paths
    /// that were materialized (both `cache/` and `metadata/` entries).
    ///
    /// A restore that fails partway rolls forward by deleting what it
    /// wrote: restored files and links first, then any directories it
    /// created, deepest first. `remove_dir` only deletes empty
    /// directories, so pre-existing content is never swept up.
    pub fn restore(
        self,
        anchor: &AbsoluteSystemPathBuf,
    ) -> Result<Vec<AnchoredUnixPathBuf>, CacheError> {
        let mut restored = Vec::new();
        let mut created_dirs = Vec::new();
        let result = self.restore_inner(anchor, &mut restored, &mut created_dirs);
        if let Err(error) = result {
            for path in restored.iter().rev() {
                let abs = anchor.join_unix(path);
                let _ = std::fs::remove_file(abs.as_std_path());
            }
            created_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.as_str().len()));
            for dir in &created_dirs {
                let _ = std::fs::remove_dir(dir.as_std_path());
            }
            return Err(error);
        }
        Ok(restored)
    }

    fn restore_inner(
        mut self,
        anchor: &AbsoluteSystemPathBuf,
        restored: &mut Vec<AnchoredUnixPathBuf>,
        created_dirs: &mut Vec<AbsoluteSystemPathBuf>,
    ) -> Result<(), CacheError> {
        let mut pending: Vec<PendingLink> = Vec::new();

        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let raw_name = String::from_utf8(entry.path_bytes().to_vec())
                .map_err(|_| CacheError::MalformedName("<non-utf8>".to_string()))?;
            let path = check_entry_name(&raw_name)?;

            match entry.header().entry_type() {
                EntryType::Directory => {
                    let abs = anchor.join_unix(&path);
                    ensure_dir(anchor, &abs, created_dirs)?;
                }
                EntryType::Regular => {
                    let abs = anchor.join_unix(&path);
                    if let Some(parent) = abs.parent() {
                        ensure_dir(anchor, &parent, created_dirs)?;
                    }
                    let mut file =
                        File::create(abs.as_std_path()).map_err(|source| CacheError::Io {
                            path: abs.clone(),
                            source,
                        })?;
                    io::copy(&mut entry, &mut file)?;
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        if let Ok(mode) = entry.header().mode() {
                            let _ = std::fs::set_permissions(
                                abs.as_std_path(),
                                std::fs::Permissions::from_mode(mode & 0o7777),
                            );
                        }
                    }
                    restored.push(path);
                }
                EntryType::Symlink => {
                    let target = entry
                        .link_name_bytes()
                        .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
                        .ok_or_else(|| CacheError::MalformedName(raw_name.clone()))?;
                    // Validate containment now, materialize when the
                    // target exists.
                    let resolved = resolve_unix(path.parent().as_ref(), &target).map_err(|_| {
                        CacheError::LinkTraversal {
                            name: raw_name.clone(),
                            target: target.clone(),
                        }
                    })?;
                    let target_abs = anchor.join_unix(&resolved);
                    if target_abs.as_std_path().exists() {
                        materialize_link(anchor, &path, &target, created_dirs)?;
                        restored.push(path);
                    } else {
                        pending.push(PendingLink { path, target });
                    }
                }
                _ => return Err(CacheError::UnsupportedFileType(raw_name)),
            }
        }

        // Deferred pass: links may chain to other links restored later in
        // the archive. Each full sweep must make progress; the sweep count
        // is bounded by the number of pending links, so a cycle exits the
        // loop with the survivors named.
        let mut attempts = pending.len();
        while !pending.is_empty() {
            let before = pending.len();
            let mut still_pending = Vec::new();
            for link in pending {
                let resolved = resolve_unix(link.path.parent().as_ref(), &link.target)
                    .expect("validated on first pass");
                let target_abs = anchor.join_unix(&resolved);
                if target_abs.as_std_path().exists() {
                    materialize_link(anchor, &link.path, &link.target, created_dirs)?;
                    restored.push(link.path);
                } else {
                    still_pending.push(link);
                }
            }
            pending = still_pending;
            if pending.len() == before || attempts == 0 {
                return Err(CacheError::LinkCycle(
                    pending.into_iter().map(|l| l.path.to_string()).collect(),
                ));
            }
            attempts -= 1;
        }

        Ok(())
    }
}

/// Validate an archive entry name and strip its `cache/` or `metadata/`
/// prefix. Rejects absolute names, backslashes, and any `.` / `..` /
/// empty segment before anything touches the filesystem.
fn check_entry_name(raw: &str) -> Result<AnchoredUnixPathBuf, CacheError> {
    if raw.is_empty() || raw.starts_with('/') || raw.contains('\\') {
        return Err(CacheError::MalformedName(raw.to_string()));
    }
    // Directory entries conventionally carry one trailing slash.
    let trimmed = raw.strip_suffix('/').unwrap_or(raw);
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(CacheError::MalformedName(raw.to_string()));
        }
    }
    let anchored = trimmed
        .strip_prefix("cache/")
        .or_else(|| trimmed.strip_prefix("metadata/"))
        .ok_or_else(|| CacheError::MalformedName(raw.to_string()))?;
    AnchoredUnixPathBuf::new(anchored).map_err(|_| CacheError::MalformedName(raw.to_string()))
}

/// Create `dir` and any missing ancestors below `anchor`, recording
/// every directory that did not already exist so a failed restore can
/// prune exactly what it created.
fn ensure_dir(
    anchor: &AbsoluteSystemPathBuf,
    dir: &AbsoluteSystemPathBuf,
    created: &mut Vec<AbsoluteSystemPathBuf>,
) -> Result<(), CacheError> {
    let mut missing = Vec::new();
    let mut current = dir.clone();
    while current != *anchor && !current.as_std_path().exists() {
        missing.push(current.clone());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    std::fs::create_dir_all(dir.as_std_path()).map_err(|source| CacheError::Io {
        path: dir.clone(),
        source,
    })?;
    created.extend(missing);
    Ok(())
}

fn materialize_link(
    anchor: &AbsoluteSystemPathBuf,
    path: &AnchoredUnixPathBuf,
    target: &str,
    created_dirs: &mut Vec<AbsoluteSystemPathBuf>,
) -> Result<(), CacheError> {
    let abs = anchor.join_unix(path);
    if let Some(parent) = abs.parent() {
        ensure_dir(anchor, &parent, created_dirs)?;
    }
    match std::fs::remove_file(abs.as_std_path()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(CacheError::Io {
                path: abs.clone(),
                source,
            })
        }
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, abs.as_std_path()).map_err(|source| CacheError::Io {
        path: abs.clone(),
        source,
    })?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_file(target, abs.as_std_path()).map_err(|source| {
        CacheError::Io {
            path: abs.clone(),
            source,
        }
    })?;
    Ok(())
}
