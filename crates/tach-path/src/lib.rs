//! Typed filesystem paths for tach
//!
//! Three nominal path kinds replace convention-based strings:
//!
//! - [`AbsoluteSystemPathBuf`]: rooted, host separators. The only kind
//!   accepted by code that touches the filesystem.
//! - [`AnchoredSystemPathBuf`]: relative to some anchor, host separators,
//!   never escapes upward.
//! - [`AnchoredUnixPathBuf`]: same semantics, `/` separators. The canonical
//!   form for archive entry names, hash keys, and JSON output.
//!
//! Conversion to the system form happens only at the OS boundary. All
//! three reject invalid shapes at construction, so downstream code never
//! re-validates.

use std::fmt;
use std::path::{Path, PathBuf};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when constructing or converting typed paths.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(Utf8PathBuf),

    #[error("path is not relative: {0}")]
    NotRelative(Utf8PathBuf),

    #[error("path escapes its anchor: {0}")]
    EscapesAnchor(String),

    #[error("path {path} is not under {anchor}")]
    NotUnderAnchor { path: Utf8PathBuf, anchor: Utf8PathBuf },

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8(PathBuf),

    #[error("malformed path component in {0:?}")]
    MalformedComponent(String),
}

// =============================================================================
// ABSOLUTE SYSTEM PATHS
// =============================================================================

/// An absolute path in host syntax. Invariant: `is_absolute` holds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_absolute() {
            Ok(Self(path))
        } else {
            Err(PathError::NotAbsolute(path))
        }
    }

    /// Convert from an untyped [`PathBuf`], rejecting non-UTF-8 input.
    pub fn from_std(path: PathBuf) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from_path_buf(path).map_err(PathError::NonUtf8)?;
        Self::new(path)
    }

    /// The current working directory as an absolute path.
    pub fn from_cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir().map_err(|_| PathError::NonUtf8(PathBuf::new()))?;
        Self::from_std(cwd)
    }

    /// Append an anchored tail. Cannot escape: the tail is validated at
    /// construction to contain no upward traversal.
    pub fn join(&self, tail: &AnchoredSystemPathBuf) -> AbsoluteSystemPathBuf {
        if tail.as_str().is_empty() {
            return self.clone();
        }
        AbsoluteSystemPathBuf(self.0.join(tail.as_path()))
    }

    /// Append a unix-form anchored tail, converting separators as needed.
    pub fn join_unix(&self, tail: &AnchoredUnixPathBuf) -> AbsoluteSystemPathBuf {
        self.join(&tail.to_system())
    }

    /// Append a single literal component.
    pub fn join_component(&self, component: &str) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(self.0.join(component))
    }

    /// Strip this path as a prefix of `path`, producing the anchored
    /// remainder.
    pub fn anchor(&self, path: &AbsoluteSystemPathBuf) -> Result<AnchoredSystemPathBuf, PathError> {
        let stripped = path
            .0
            .strip_prefix(&self.0)
            .map_err(|_| PathError::NotUnderAnchor {
                path: path.0.clone(),
                anchor: self.0.clone(),
            })?;
        AnchoredSystemPathBuf::new(stripped.to_path_buf())
    }

    pub fn parent(&self) -> Option<AbsoluteSystemPathBuf> {
        self.0.parent().map(|p| AbsoluteSystemPathBuf(p.to_path_buf()))
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

// =============================================================================
// ANCHORED SYSTEM PATHS
// =============================================================================

/// A relative path in host syntax that stays under its anchor.
/// Invariants: not absolute, no `..` components, no leading separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPathBuf {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_absolute() {
            return Err(PathError::NotRelative(path));
        }
        for component in path.components() {
            match component {
                Utf8Component::Normal(_) => {}
                _ => return Err(PathError::EscapesAnchor(path.to_string())),
            }
        }
        Ok(Self(path))
    }

    /// Canonicalize to `/` separators.
    pub fn to_unix(&self) -> AnchoredUnixPathBuf {
        #[cfg(windows)]
        let unix = self.0.as_str().replace('\\', "/");
        #[cfg(not(windows))]
        let unix = self.0.as_str().to_string();
        AnchoredUnixPathBuf(unix)
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// ANCHORED UNIX PATHS
// =============================================================================

/// A relative path with `/` separators. The canonical representation for
/// everything that leaves the process: archive entry names, fingerprint
/// inputs, summary JSON. Ordering is plain byte order, which makes sorted
/// collections platform-stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnchoredUnixPathBuf(String);

impl AnchoredUnixPathBuf {
    /// The anchor directory itself: the empty anchored path. Kept out of
    /// [`AnchoredUnixPathBuf::new`] so external surfaces (archive entry
    /// names, config values) still reject empty input.
    pub fn anchor() -> Self {
        Self(String::new())
    }

    /// Does this path name the anchor itself?
    pub fn is_anchor(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate and construct. Rejects absolute paths, backslashes, empty
    /// names, and any `.` / `..` / empty segment.
    pub fn new(path: impl Into<String>) -> Result<Self, PathError> {
        let path = path.into();
        if path.is_empty() {
            return Err(PathError::MalformedComponent(path));
        }
        if path.starts_with('/') {
            return Err(PathError::NotRelative(Utf8PathBuf::from(path)));
        }
        if path.contains('\\') {
            return Err(PathError::MalformedComponent(path));
        }
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(PathError::MalformedComponent(path));
            }
        }
        Ok(Self(path))
    }

    /// Convert to host separators for the OS boundary.
    pub fn to_system(&self) -> AnchoredSystemPathBuf {
        #[cfg(windows)]
        let system = self.0.replace('/', "\\");
        #[cfg(not(windows))]
        let system = self.0.clone();
        AnchoredSystemPathBuf(Utf8PathBuf::from(system))
    }

    /// Append a validated tail.
    pub fn join(&self, tail: &AnchoredUnixPathBuf) -> AnchoredUnixPathBuf {
        if self.0.is_empty() {
            return tail.clone();
        }
        if tail.0.is_empty() {
            return self.clone();
        }
        AnchoredUnixPathBuf(format!("{}/{}", self.0, tail.0))
    }

    /// The path up to the final segment, or `None` for a single segment.
    pub fn parent(&self) -> Option<AnchoredUnixPathBuf> {
        self.0
            .rsplit_once('/')
            .map(|(head, _)| AnchoredUnixPathBuf(head.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnchoredUnixPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for AnchoredUnixPathBuf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AnchoredUnixPathBuf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AnchoredUnixPathBuf::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Lexically resolve a unix-form path that may contain `.` and `..`
/// segments, relative to an anchored base. Fails if resolution escapes
/// the anchor. Used when resolving symlink targets out of archives, where
/// the target may not exist on disk yet.
pub fn resolve_unix(base: Option<&AnchoredUnixPathBuf>, target: &str) -> Result<AnchoredUnixPathBuf, PathError> {
    if target.starts_with('/') || target.contains('\\') {
        return Err(PathError::EscapesAnchor(target.to_string()));
    }
    let mut segments: Vec<&str> = match base {
        Some(base) => base.as_str().split('/').collect(),
        None => Vec::new(),
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(PathError::EscapesAnchor(target.to_string()));
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(PathError::EscapesAnchor(target.to_string()));
    }
    AnchoredUnixPathBuf::new(segments.join("/"))
}
