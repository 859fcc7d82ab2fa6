//! Package input discovery and content hashing
//!
//! Given a package directory and an include/exclude glob set, produces a
//! sorted list of `(path, hash)` pairs that feeds the task fingerprint.
//! Content hashes use the git blob format — SHA-1 over
//! `"blob " + length + "\0" + contents` — so an unchanged tree hashes
//! identically to what version control already computed for it,
//! regardless of mtimes or other filesystem metadata.
//!
//! Traversal is collect-then-sort on the unix form of each path, which
//! makes the output independent of directory iteration order.

use glob::{MatchOptions, Pattern};
use sha1::{Digest, Sha1};
use tach_path::{AbsoluteSystemPathBuf, AnchoredUnixPathBuf, PathError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },

    #[error("failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("symlink {path} resolves outside the package")]
    LinkOutsideRoot { path: AbsoluteSystemPathBuf },

    #[error("broken symlink: {path}")]
    BrokenLink { path: AbsoluteSystemPathBuf },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Directories never considered inputs: VCS state, installed
/// dependencies, and our own per-package state directory.
const PRUNED_DIRS: &[&str] = &[".git", "node_modules", ".tach"];

/// Hash bytes in the git blob object format.
pub fn git_blob_hash(contents: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"blob ");
    hasher.update(contents.len().to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

/// Hash a file on disk in the git blob object format.
pub fn hash_file(path: &AbsoluteSystemPathBuf) -> Result<String, ScanError> {
    let contents = std::fs::read(path.as_std_path()).map_err(|source| ScanError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(git_blob_hash(&contents))
}

/// Compiled include/exclude glob sets. Patterns prefixed with `!` are
/// exclusions. An empty inclusion set matches everything.
pub struct InputGlobs {
    inclusions: Vec<Pattern>,
    exclusions: Vec<Pattern>,
}

impl InputGlobs {
    pub fn parse(patterns: &[String]) -> Result<Self, ScanError> {
        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for raw in patterns {
            let (target, pattern) = match raw.strip_prefix('!') {
                Some(stripped) => (&mut exclusions, stripped),
                None => (&mut inclusions, raw.as_str()),
            };
            target.push(Pattern::new(pattern).map_err(|source| ScanError::InvalidPattern {
                pattern: raw.clone(),
                source,
            })?);
        }
        Ok(Self { inclusions, exclusions })
    }

    pub fn is_empty(&self) -> bool {
        self.inclusions.is_empty() && self.exclusions.is_empty()
    }

    /// Match a relative unix path. `*` and `?` do not cross separators;
    /// `**` does.
    pub fn matches(&self, path: &str) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::default()
        };
        let included = self.inclusions.is_empty()
            || self
                .inclusions
                .iter()
                .any(|p| p.matches_with(path, options));
        let excluded = self
            .exclusions
            .iter()
            .any(|p| p.matches_with(path, options));
        included && !excluded
    }
}

/// Scan a package directory for input files and hash them.
///
/// Returned paths are anchored at the package directory. Hidden files
/// are included. Symlinks to files inside the package are followed and
/// hashed; symlinks resolving outside the package fail the scan.
pub fn scan_package(
    repo_root: &AbsoluteSystemPathBuf,
    package_dir: &AnchoredUnixPathBuf,
    inputs: &[String],
) -> Result<Vec<(AnchoredUnixPathBuf, String)>, ScanError> {
    let package_root = repo_root.join_unix(package_dir);
    scan_dir(&package_root, inputs)
}

/// Expand globs against the repository root, hashing every match.
/// Returned paths are anchored at the root. Used for global file
/// dependencies.
pub fn scan_root(
    repo_root: &AbsoluteSystemPathBuf,
    globs: &[String],
) -> Result<Vec<(AnchoredUnixPathBuf, String)>, ScanError> {
    if globs.is_empty() {
        return Ok(Vec::new());
    }
    scan_dir(repo_root, globs)
}

/// Hash the named files, skipping ones that do not exist. Used for
/// explicit file lists (dotenv files) where absence is not an error.
pub fn hash_existing(
    repo_root: &AbsoluteSystemPathBuf,
    paths: &[AnchoredUnixPathBuf],
) -> Result<Vec<(AnchoredUnixPathBuf, String)>, ScanError> {
    let mut out = Vec::new();
    for path in paths {
        let abs = repo_root.join_unix(path);
        match std::fs::read(abs.as_std_path()) {
            Ok(contents) => out.push((path.clone(), git_blob_hash(&contents))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(ScanError::Io { path: abs, source }),
        }
    }
    out.sort();
    Ok(out)
}

/// List files and symlinks under a package directory matching an
/// output glob set, without hashing and without following links. An
/// empty inclusion set matches nothing: tasks declare their outputs
/// explicitly.
pub fn list_outputs(
    repo_root: &AbsoluteSystemPathBuf,
    package_dir: &AnchoredUnixPathBuf,
    inclusions: &[String],
    exclusions: &[String],
) -> Result<Vec<AnchoredUnixPathBuf>, ScanError> {
    if inclusions.is_empty() {
        return Ok(Vec::new());
    }
    let mut patterns: Vec<String> = inclusions.to_vec();
    patterns.extend(exclusions.iter().map(|e| format!("!{e}")));
    let globs = InputGlobs::parse(&patterns)?;

    let package_root = repo_root.join_unix(package_dir);
    let mut out = Vec::new();
    let walker = walkdir::WalkDir::new(package_root.as_std_path())
        .into_iter()
        .filter_entry(|entry| {
            let pruned = entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| PRUNED_DIRS.contains(&name));
            !pruned
        });
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let abs = AbsoluteSystemPathBuf::from_std(entry.path().to_path_buf())?;
        let rel = package_root.anchor(&abs)?.to_unix();
        if globs.matches(rel.as_str()) {
            out.push(rel);
        }
    }
    out.sort();
    Ok(out)
}

fn scan_dir(
    root: &AbsoluteSystemPathBuf,
    patterns: &[String],
) -> Result<Vec<(AnchoredUnixPathBuf, String)>, ScanError> {
    let globs = InputGlobs::parse(patterns)?;
    let canonical_root =
        std::fs::canonicalize(root.as_std_path()).map_err(|source| ScanError::Io {
            path: root.clone(),
            source,
        })?;

    let mut out = Vec::new();
    let walker = walkdir::WalkDir::new(root.as_std_path())
        .into_iter()
        .filter_entry(|entry| {
            let pruned = entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| PRUNED_DIRS.contains(&name));
            !pruned
        });

    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }

        let abs = AbsoluteSystemPathBuf::from_std(entry.path().to_path_buf())?;
        let rel = root.anchor(&abs)?.to_unix();
        if !globs.matches(rel.as_str()) {
            continue;
        }

        if entry.file_type().is_symlink() {
            // Follow the link, but only within the package anchor.
            let target = std::fs::canonicalize(abs.as_std_path()).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ScanError::BrokenLink { path: abs.clone() }
                } else {
                    ScanError::Io {
                        path: abs.clone(),
                        source: e,
                    }
                }
            })?;
            if !target.starts_with(&canonical_root) {
                return Err(ScanError::LinkOutsideRoot { path: abs });
            }
            if target.is_dir() {
                continue;
            }
            let target = AbsoluteSystemPathBuf::from_std(target)?;
            out.push((rel, hash_file(&target)?));
        } else {
            out.push((rel, hash_file(&abs)?));
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::from_std(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn write(root: &AbsoluteSystemPathBuf, rel: &str, contents: &str) {
        let path = root.join_unix(&AnchoredUnixPathBuf::new(rel).unwrap());
        std::fs::create_dir_all(path.as_std_path().parent().unwrap()).unwrap();
        std::fs::write(path.as_std_path(), contents).unwrap();
    }

    #[test]
    fn test_git_blob_hash_matches_git() {
        // `echo -n 'hello' | git hash-object --stdin`
        assert_eq!(
            git_blob_hash(b"hello"),
            "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0"
        );
        // `git hash-object` of the empty blob
        assert_eq!(
            git_blob_hash(b""),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
    }

    #[test]
    fn test_scan_is_sorted_and_complete() {
        let (_dir, root) = setup();
        write(&root, "pkg/src/b.js", "b");
        write(&root, "pkg/src/a.js", "a");
        write(&root, "pkg/package.json", "{}");

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let files = scan_package(&root, &pkg, &[]).unwrap();
        let names: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();

        assert_eq!(names, vec!["package.json", "src/a.js", "src/b.js"]);
    }

    #[test]
    fn test_scan_determinism() {
        let (_dir, root) = setup();
        write(&root, "pkg/one.txt", "1");
        write(&root, "pkg/two.txt", "2");

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let first = scan_package(&root, &pkg, &[]).unwrap();
        let second = scan_package(&root, &pkg, &[]).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_inclusion_and_exclusion_globs() {
        let (_dir, root) = setup();
        write(&root, "pkg/src/index.ts", "code");
        write(&root, "pkg/src/index.test.ts", "test");
        write(&root, "pkg/README.md", "docs");

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let files = scan_package(
            &root,
            &pkg,
            &["src/**".to_string(), "!src/**/*.test.ts".to_string()],
        )
        .unwrap();
        let names: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();

        assert_eq!(names, vec!["src/index.ts"]);
    }

    #[test]
    fn test_hidden_files_included_node_modules_pruned() {
        let (_dir, root) = setup();
        write(&root, "pkg/.env", "SECRET=1");
        write(&root, "pkg/node_modules/dep/index.js", "dep");

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let files = scan_package(&root, &pkg, &[]).unwrap();
        let names: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();

        assert_eq!(names, vec![".env"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_package_is_hashed() {
        let (_dir, root) = setup();
        write(&root, "pkg/real.txt", "contents");
        let pkg_root = root.join_unix(&AnchoredUnixPathBuf::new("pkg").unwrap());
        std::os::unix::fs::symlink(
            pkg_root.as_std_path().join("real.txt"),
            pkg_root.as_std_path().join("link.txt"),
        )
        .unwrap();

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let files = scan_package(&root, &pkg, &[]).unwrap();

        let link = files.iter().find(|(p, _)| p.as_str() == "link.txt").unwrap();
        let real = files.iter().find(|(p, _)| p.as_str() == "real.txt").unwrap();
        assert_eq!(link.1, real.1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_package_fails() {
        let (_dir, root) = setup();
        write(&root, "outside.txt", "outside");
        write(&root, "pkg/keep.txt", "keep");
        let pkg_root = root.join_unix(&AnchoredUnixPathBuf::new("pkg").unwrap());
        std::os::unix::fs::symlink(
            root.as_std_path().join("outside.txt"),
            pkg_root.as_std_path().join("escape.txt"),
        )
        .unwrap();

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let err = scan_package(&root, &pkg, &[]).unwrap_err();

        assert!(matches!(err, ScanError::LinkOutsideRoot { .. }));
    }

    #[test]
    fn test_hash_existing_skips_missing() {
        let (_dir, root) = setup();
        write(&root, ".env", "A=1");

        let paths = vec![
            AnchoredUnixPathBuf::new(".env").unwrap(),
            AnchoredUnixPathBuf::new(".env.local").unwrap(),
        ];
        let hashed = hash_existing(&root, &paths).unwrap();

        assert_eq!(hashed.len(), 1);
        assert_eq!(hashed[0].0.as_str(), ".env");
    }

    #[test]
    fn test_list_outputs_requires_inclusions() {
        let (_dir, root) = setup();
        write(&root, "pkg/dist/out.js", "x");
        write(&root, "pkg/dist/out.js.map", "map");

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        assert!(list_outputs(&root, &pkg, &[], &[]).unwrap().is_empty());

        let outputs = list_outputs(
            &root,
            &pkg,
            &["dist/**".to_string()],
            &["dist/**/*.map".to_string()],
        )
        .unwrap();
        let names: Vec<&str> = outputs.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["dist/out.js"]);
    }

    #[test]
    fn test_star_does_not_cross_separators() {
        let (_dir, root) = setup();
        write(&root, "pkg/a.js", "top");
        write(&root, "pkg/src/b.js", "nested");

        let pkg = AnchoredUnixPathBuf::new("pkg").unwrap();
        let files = scan_package(&root, &pkg, &["*.js".to_string()]).unwrap();
        let names: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();

        assert_eq!(names, vec!["a.js"]);
    }
}
