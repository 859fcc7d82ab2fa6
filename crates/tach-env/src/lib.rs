//! Environment variable policy for tach
//!
//! Tasks never see the host environment directly. The run captures it
//! once at startup into an [`EnvironmentVariableMap`], and every child
//! environment is derived from that snapshot according to the task's
//! [`EnvMode`]. The same maps feed the fingerprint engine, so the set of
//! variables a task can observe and the set that keys its cache entry
//! are the same by construction.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use tach_path::AbsoluteSystemPathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("the following environment variables are not set: {}", .missing.join(", "))]
    MissingVariables { missing: Vec<String> },

    #[error("failed to read env file {path}: {source}")]
    DotEnvRead {
        path: AbsoluteSystemPathBuf,
        source: std::io::Error,
    },
}

/// Which host environment variables a task process may observe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMode {
    /// Resolved to `Loose` or `Strict` before execution; never a runtime
    /// mode.
    #[default]
    Infer,
    /// Pass the full host environment through.
    Loose,
    /// Pass only declared and essential variables.
    Strict,
}

impl EnvMode {
    /// Resolve `Infer` against the declared pass-through configuration:
    /// declaring a pass-through list opts the task into strict mode.
    pub fn resolve(self, has_pass_through: bool) -> ResolvedEnvMode {
        match self {
            EnvMode::Loose => ResolvedEnvMode::Loose,
            EnvMode::Strict => ResolvedEnvMode::Strict,
            EnvMode::Infer if has_pass_through => ResolvedEnvMode::Strict,
            EnvMode::Infer => ResolvedEnvMode::Loose,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        }
    }

    /// Stable discriminant for the canonical hash encoding.
    pub fn code(self) -> u8 {
        match self {
            EnvMode::Infer => 0,
            EnvMode::Loose => 1,
            EnvMode::Strict => 2,
        }
    }
}

/// An [`EnvMode`] with `Infer` already resolved away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedEnvMode {
    Loose,
    Strict,
}

impl ResolvedEnvMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolvedEnvMode::Loose => "loose",
            ResolvedEnvMode::Strict => "strict",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ResolvedEnvMode::Loose => 1,
            ResolvedEnvMode::Strict => 2,
        }
    }
}

/// A deterministic map of environment variables. BTreeMap keeps
/// iteration sorted, so every derived list is stable without explicit
/// sorting at use sites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentVariableMap(BTreeMap<String, String>);

impl EnvironmentVariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the host environment. Variables with non-UTF-8 names or
    /// values are skipped; they cannot round-trip through the hash.
    pub fn from_host() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Later entries win, matching how a child process would see
    /// repeated assignments.
    pub fn merge(&mut self, other: &EnvironmentVariableMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Select exactly the named keys. Keys absent from the map are
    /// reported back so strict mode can fail the task.
    pub fn from_keys(&self, keys: &[String]) -> (EnvironmentVariableMap, Vec<String>) {
        let mut selected = EnvironmentVariableMap::new();
        let mut missing = Vec::new();
        for key in keys {
            match self.0.get(key) {
                Some(value) => selected.insert(key.clone(), value.clone()),
                None => missing.push(key.clone()),
            }
        }
        (selected, missing)
    }

    /// Sorted variable names.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Sorted `KEY=value` pairs, the form fed to the fingerprint.
    pub fn to_hashable(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Sorted `KEY=<sha256 of value>` pairs for summaries, where raw
    /// values must not appear.
    pub fn to_secret_hashable(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(k, v)| {
                let digest = Sha256::digest(v.as_bytes());
                format!("{k}={}", hex::encode(digest))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for EnvironmentVariableMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Variables a strict-mode child always receives. Without these,
/// virtually no package-manager invocation can run at all.
pub fn essential_keys() -> &'static [&'static str] {
    #[cfg(windows)]
    {
        &["PATH", "HOME", "USERPROFILE", "APPDATA", "SYSTEMROOT", "TMP", "TEMP"]
    }
    #[cfg(not(windows))]
    {
        &["PATH", "HOME", "SHELL", "PWD", "TMPDIR", "TERM", "USER"]
    }
}

/// Parse dotenv file contents. Supports comments, blank lines, an
/// optional `export ` prefix, and single or double quoted values. No
/// interpolation.
pub fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        pairs.push((key.to_string(), value.to_string()));
    }
    pairs
}

/// Load a sequence of dotenv files into one map. Files are applied in
/// the order given; a key set by a later file overrides an earlier one.
/// Missing files are skipped, matching the behavior of the tools that
/// consume these files.
pub fn load_dotenv_files(paths: &[AbsoluteSystemPathBuf]) -> Result<EnvironmentVariableMap, EnvError> {
    let mut map = EnvironmentVariableMap::new();
    for path in paths {
        let contents = match std::fs::read_to_string(path.as_std_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(EnvError::DotEnvRead {
                    path: path.clone(),
                    source,
                })
            }
        };
        for (key, value) in parse_dotenv(&contents) {
            map.insert(key, value);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(pairs: &[(&str, &str)]) -> EnvironmentVariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_hashable_pairs_are_sorted() {
        let map = map_of(&[("ZED", "1"), ("ALPHA", "2"), ("MID", "3")]);
        assert_eq!(map.to_hashable(), vec!["ALPHA=2", "MID=3", "ZED=1"]);
    }

    #[test]
    fn test_from_keys_reports_missing() {
        let map = map_of(&[("PRESENT", "yes")]);
        let (selected, missing) =
            map.from_keys(&["PRESENT".to_string(), "ABSENT".to_string()]);

        assert_eq!(selected.get("PRESENT"), Some("yes"));
        assert_eq!(missing, vec!["ABSENT"]);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base = map_of(&[("KEY", "old"), ("KEEP", "1")]);
        base.merge(&map_of(&[("KEY", "new")]));

        assert_eq!(base.get("KEY"), Some("new"));
        assert_eq!(base.get("KEEP"), Some("1"));
    }

    #[test]
    fn test_secret_hashable_hides_values() {
        let map = map_of(&[("SECRET", "hunter2")]);
        let rendered = map.to_secret_hashable();

        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].starts_with("SECRET="));
        assert!(!rendered[0].contains("hunter2"));
    }

    #[test]
    fn test_infer_resolution() {
        assert_eq!(EnvMode::Infer.resolve(true), ResolvedEnvMode::Strict);
        assert_eq!(EnvMode::Infer.resolve(false), ResolvedEnvMode::Loose);
        assert_eq!(EnvMode::Loose.resolve(true), ResolvedEnvMode::Loose);
        assert_eq!(EnvMode::Strict.resolve(false), ResolvedEnvMode::Strict);
    }

    #[test]
    fn test_parse_dotenv() {
        let parsed = parse_dotenv(
            "# comment\n\nPLAIN=value\nexport EXPORTED=1\nQUOTED=\"a b\"\nSINGLE='c'\nNOEQ\n",
        );

        assert_eq!(
            parsed,
            vec![
                ("PLAIN".to_string(), "value".to_string()),
                ("EXPORTED".to_string(), "1".to_string()),
                ("QUOTED".to_string(), "a b".to_string()),
                ("SINGLE".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_dotenv_later_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.env");
        let second = dir.path().join("second.env");
        std::fs::write(&first, "SHARED=first\nONLY_FIRST=1\n").unwrap();
        std::fs::write(&second, "SHARED=second\n").unwrap();

        let paths = vec![
            AbsoluteSystemPathBuf::from_std(first).unwrap(),
            AbsoluteSystemPathBuf::from_std(second).unwrap(),
        ];
        let map = load_dotenv_files(&paths).unwrap();

        assert_eq!(map.get("SHARED"), Some("second"));
        assert_eq!(map.get("ONLY_FIRST"), Some("1"));
    }
}
