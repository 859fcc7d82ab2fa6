//! Workspace discovery and package manager detection
//!
//! Builds the immutable workspace snapshot a run operates on: every
//! package named by the root manifest's `workspaces` globs, its scripts,
//! which of its dependencies are internal to the repo, and a hash of its
//! external dependency declarations. Also picks the package manager
//! whose `run` convention the executor will invoke, based on which
//! lockfile is present.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use tach_path::{AbsoluteSystemPathBuf, AnchoredUnixPathBuf, PathError};
use thiserror::Error;
use tracing::debug;

/// Name of the synthetic workspace standing in for the repository root.
/// Root-level tasks are addressed as `//#task`; graph edges into them
/// survive `--parallel`, which is how a root task can gate every other
/// task even when topology is otherwise disabled.
pub const ROOT_WORKSPACE_NAME: &str = "//";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("no package.json found at {0}")]
    MissingPackageJson(AbsoluteSystemPathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: AbsoluteSystemPathBuf,
        source: serde_json::Error,
    },

    #[error("package at {0} has no \"name\" field")]
    MissingName(AbsoluteSystemPathBuf),

    #[error("two packages named {name:?}: {first} and {second}")]
    DuplicatePackage {
        name: String,
        first: AnchoredUnixPathBuf,
        second: AnchoredUnixPathBuf,
    },

    #[error("invalid workspace glob {pattern:?}: {source}")]
    InvalidWorkspaceGlob {
        pattern: String,
        source: glob::PatternError,
    },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// The subset of package.json the runner consumes. Unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub workspaces: Option<Workspaces>,
}

/// npm accepts either a bare glob list or an object wrapping one.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Workspaces {
    Globs(Vec<String>),
    Object {
        #[serde(default)]
        packages: Vec<String>,
    },
}

impl Workspaces {
    pub fn globs(&self) -> &[String] {
        match self {
            Workspaces::Globs(globs) => globs,
            Workspaces::Object { packages } => packages,
        }
    }
}

impl PackageJson {
    pub fn load(path: &AbsoluteSystemPathBuf) -> Result<Self, RepoError> {
        let contents = std::fs::read(path.as_std_path()).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RepoError::MissingPackageJson(path.clone())
            } else {
                RepoError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        serde_json::from_slice(&contents).map_err(|source| RepoError::Parse {
            path: path.clone(),
            source,
        })
    }

    /// All declared dependency ranges, `name@range`, across regular and
    /// dev dependencies.
    fn dependency_pairs(&self) -> Vec<(String, String)> {
        self.dependencies
            .iter()
            .chain(self.dev_dependencies.iter())
            .map(|(name, range)| (name.clone(), range.clone()))
            .collect()
    }
}

/// One workspace package, immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub name: String,
    /// Package directory relative to the repo root.
    pub dir: AnchoredUnixPathBuf,
    pub scripts: BTreeMap<String, String>,
    /// Direct dependencies that are themselves workspace packages.
    pub internal_deps: BTreeSet<String>,
    /// Fingerprint of the external dependency declarations.
    pub external_deps_hash: String,
}

/// The discovered repository: root manifest, member packages, and the
/// package manager in use.
#[derive(Debug)]
pub struct RepoSnapshot {
    pub root: AbsoluteSystemPathBuf,
    pub root_package: PackageJson,
    pub root_external_deps_hash: String,
    pub workspaces: BTreeMap<String, Workspace>,
    pub package_manager: PackageManager,
}

impl RepoSnapshot {
    /// Discover the workspace set under `root`.
    pub fn discover(root: &AbsoluteSystemPathBuf) -> Result<Self, RepoError> {
        let root_manifest_path = root.join_component("package.json");
        let root_package = PackageJson::load(&root_manifest_path)?;
        let package_manager = PackageManager::detect(root);

        let mut members: Vec<(AbsoluteSystemPathBuf, PackageJson)> = Vec::new();
        if let Some(workspaces) = &root_package.workspaces {
            for pattern in workspaces.globs() {
                let full_pattern = format!("{}/{}/package.json", root.as_str(), pattern);
                let paths = glob::glob(&full_pattern).map_err(|source| {
                    RepoError::InvalidWorkspaceGlob {
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
                for entry in paths.flatten() {
                    if entry
                        .components()
                        .any(|c| c.as_os_str() == "node_modules")
                    {
                        continue;
                    }
                    let manifest = AbsoluteSystemPathBuf::from_std(entry)?;
                    let package = PackageJson::load(&manifest)?;
                    members.push((manifest, package));
                }
            }
        }

        // First pass: collect names so internal deps can be told apart
        // from external ones. The root name is reserved up front so a
        // member claiming it trips the duplicate check.
        let mut names: BTreeMap<String, AnchoredUnixPathBuf> = BTreeMap::new();
        names.insert(ROOT_WORKSPACE_NAME.to_string(), AnchoredUnixPathBuf::anchor());
        let mut located: Vec<(String, AnchoredUnixPathBuf, PackageJson)> = Vec::new();
        for (manifest, package) in members {
            let name = package
                .name
                .clone()
                .ok_or_else(|| RepoError::MissingName(manifest.clone()))?;
            let package_dir = manifest
                .parent()
                .expect("manifest path has a parent directory");
            let dir = root.anchor(&package_dir)?.to_unix();
            if let Some(first) = names.get(&name) {
                return Err(RepoError::DuplicatePackage {
                    name,
                    first: first.clone(),
                    second: dir,
                });
            }
            names.insert(name.clone(), dir.clone());
            located.push((name, dir, package));
        }

        let mut workspaces_map = BTreeMap::new();
        for (name, dir, package) in located {
            let mut internal_deps = BTreeSet::new();
            let mut external_pairs = Vec::new();
            for (dep_name, range) in package.dependency_pairs() {
                if names.contains_key(&dep_name) {
                    internal_deps.insert(dep_name);
                } else {
                    external_pairs.push(format!("{dep_name}@{range}"));
                }
            }
            workspaces_map.insert(
                name.clone(),
                Workspace {
                    name,
                    dir,
                    scripts: package.scripts,
                    internal_deps,
                    external_deps_hash: tach_hash::hash_external_deps(external_pairs),
                },
            );
        }

        let root_external_deps_hash = tach_hash::hash_external_deps(
            root_package
                .dependency_pairs()
                .into_iter()
                .map(|(name, range)| format!("{name}@{range}"))
                .collect(),
        );

        // The repository root participates as a synthetic workspace so
        // `//#task` nodes resolve like any other. It sits at the anchor
        // and depends on nothing.
        workspaces_map.insert(
            ROOT_WORKSPACE_NAME.to_string(),
            Workspace {
                name: ROOT_WORKSPACE_NAME.to_string(),
                dir: AnchoredUnixPathBuf::anchor(),
                scripts: root_package.scripts.clone(),
                internal_deps: BTreeSet::new(),
                external_deps_hash: root_external_deps_hash.clone(),
            },
        );

        debug!(
            packages = workspaces_map.len(),
            package_manager = package_manager.binary(),
            "workspace discovery complete"
        );

        Ok(Self {
            root: root.clone(),
            root_package,
            root_external_deps_hash,
            workspaces: workspaces_map,
            package_manager,
        })
    }
}

/// The package manager whose `run` convention the executor invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Select by lockfile; npm when nothing else matches.
    pub fn detect(root: &AbsoluteSystemPathBuf) -> Self {
        if root
            .join_component("pnpm-lock.yaml")
            .as_std_path()
            .exists()
        {
            PackageManager::Pnpm
        } else if root.join_component("yarn.lock").as_std_path().exists() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
        }
    }

    /// Arguments for `<pm> run <task> [-- <pass_through>]`.
    pub fn run_args(self, task: &str, pass_through: &[String]) -> Vec<String> {
        let mut args = vec!["run".to_string(), task.to_string()];
        if !pass_through.is_empty() {
            args.push("--".to_string());
            args.extend(pass_through.iter().cloned());
        }
        args
    }
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
        let path = root.as_std_path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn basic_repo(root: &AbsoluteSystemPathBuf) {
        write(
            root,
            "package.json",
            r#"{ "name": "root", "workspaces": ["packages/*"], "dependencies": { "left-pad": "^1.0.0" } }"#,
        );
        write(
            root,
            "packages/lib/package.json",
            r#"{ "name": "lib", "scripts": { "build": "node build.js" } }"#,
        );
        write(
            root,
            "packages/app/package.json",
            r#"{ "name": "app", "scripts": { "build": "node build.js" }, "dependencies": { "lib": "*", "react": "^18.0.0" } }"#,
        );
    }

    #[test]
    fn test_discovers_workspace_members() {
        let (_dir, root) = setup();
        basic_repo(&root);

        let snapshot = RepoSnapshot::discover(&root).unwrap();

        // Two members plus the synthetic root workspace.
        assert_eq!(snapshot.workspaces.len(), 3);
        let app = &snapshot.workspaces["app"];
        assert_eq!(app.dir.as_str(), "packages/app");
        assert!(app.scripts.contains_key("build"));
    }

    #[test]
    fn test_root_workspace_is_synthesized() {
        let (_dir, root) = setup();
        write(
            &root,
            "package.json",
            r#"{ "name": "root", "workspaces": ["packages/*"], "scripts": { "prepare": "scripts/prepare.sh" } }"#,
        );
        write(&root, "packages/a/package.json", r#"{ "name": "a" }"#);

        let snapshot = RepoSnapshot::discover(&root).unwrap();
        let root_ws = &snapshot.workspaces[ROOT_WORKSPACE_NAME];

        assert!(root_ws.dir.is_anchor());
        assert!(root_ws.scripts.contains_key("prepare"));
        assert!(root_ws.internal_deps.is_empty());
        assert_eq!(root_ws.external_deps_hash, snapshot.root_external_deps_hash);
        // Members never list the root as an internal dependency.
        assert!(snapshot.workspaces["a"].internal_deps.is_empty());
    }

    #[test]
    fn test_internal_deps_separated_from_external() {
        let (_dir, root) = setup();
        basic_repo(&root);

        let snapshot = RepoSnapshot::discover(&root).unwrap();
        let app = &snapshot.workspaces["app"];
        let lib = &snapshot.workspaces["lib"];

        assert!(app.internal_deps.contains("lib"));
        assert!(!app.internal_deps.contains("react"));
        // Different external deps, different hash.
        assert_ne!(app.external_deps_hash, lib.external_deps_hash);
    }

    #[test]
    fn test_duplicate_package_names_rejected() {
        let (_dir, root) = setup();
        write(
            &root,
            "package.json",
            r#"{ "name": "root", "workspaces": ["packages/*"] }"#,
        );
        write(&root, "packages/a/package.json", r#"{ "name": "same" }"#);
        write(&root, "packages/b/package.json", r#"{ "name": "same" }"#);

        let err = RepoSnapshot::discover(&root).unwrap_err();
        assert!(matches!(err, RepoError::DuplicatePackage { .. }));
    }

    #[test]
    fn test_workspaces_object_form() {
        let (_dir, root) = setup();
        write(
            &root,
            "package.json",
            r#"{ "name": "root", "workspaces": { "packages": ["libs/*"] } }"#,
        );
        write(&root, "libs/one/package.json", r#"{ "name": "one" }"#);

        let snapshot = RepoSnapshot::discover(&root).unwrap();
        assert!(snapshot.workspaces.contains_key("one"));
    }

    #[test]
    fn test_package_manager_detection() {
        let (_dir, root) = setup();
        write(&root, "package.json", r#"{ "name": "root" }"#);
        assert_eq!(PackageManager::detect(&root), PackageManager::Npm);

        write(&root, "yarn.lock", "");
        assert_eq!(PackageManager::detect(&root), PackageManager::Yarn);

        write(&root, "pnpm-lock.yaml", "");
        assert_eq!(PackageManager::detect(&root), PackageManager::Pnpm);
    }

    #[test]
    fn test_run_args_pass_through() {
        let args = PackageManager::Npm.run_args("build", &["--watch".to_string()]);
        assert_eq!(args, vec!["run", "build", "--", "--watch"]);

        let bare = PackageManager::Npm.run_args("build", &[]);
        assert_eq!(bare, vec!["run", "build"]);
    }
}
