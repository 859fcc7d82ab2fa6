//! Pipeline configuration (`tach.json`)
//!
//! The raw serde model mirrors the file; [`TaskDefinition`] is the
//! resolved form the rest of the system consumes, with output globs
//! split into inclusions/exclusions and defaults applied. A
//! `package#task` entry overrides a plain `task` entry wholesale.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tach_env::EnvMode;
use tach_path::{AbsoluteSystemPathBuf, AnchoredUnixPathBuf};
use tach_repo::ROOT_WORKSPACE_NAME;

use crate::GraphError;

pub const CONFIG_FILE_NAME: &str = "tach.json";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RootConfig {
    #[serde(rename = "$schema", default)]
    pub schema: Option<String>,
    /// Files outside any package that invalidate every task.
    #[serde(default)]
    pub global_dependencies: Vec<String>,
    /// Env variables that key every task's fingerprint.
    #[serde(default)]
    pub global_env: Vec<String>,
    /// Env variables visible to every task but not fingerprinted.
    #[serde(default)]
    pub global_pass_through_env: Option<Vec<String>>,
    /// Env files applied to every task, in order.
    #[serde(default)]
    pub global_dot_env: Vec<AnchoredUnixPathBuf>,
    #[serde(default)]
    pub tasks: BTreeMap<String, RawTaskDefinition>,
}

impl RootConfig {
    pub fn load(root: &AbsoluteSystemPathBuf) -> Result<Self, GraphError> {
        let path = root.join_component(CONFIG_FILE_NAME);
        let contents = std::fs::read(path.as_std_path()).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                GraphError::MissingConfig(path.clone())
            } else {
                GraphError::ConfigRead {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let config: RootConfig =
            serde_json::from_slice(&contents).map_err(|source| GraphError::ConfigParse {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GraphError> {
        for raw in self.tasks.values() {
            for dep in &raw.depends_on {
                if dep.starts_with('$') {
                    return Err(GraphError::DollarDependency(dep.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            tasks: self
                .tasks
                .iter()
                .map(|(key, raw)| (key.clone(), TaskDefinition::from_raw(raw)))
                .collect(),
        }
    }
}

/// A task definition as written in the file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTaskDefinition {
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub pass_through_env: Option<Vec<String>>,
    #[serde(default)]
    pub dot_env: Vec<AnchoredUnixPathBuf>,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub env_mode: EnvMode,
    #[serde(default)]
    pub persistent: bool,
}

fn default_true() -> bool {
    true
}

/// Output glob set with `!` exclusions already split out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

impl TaskOutputs {
    pub fn from_globs(globs: &[String]) -> Self {
        let mut inclusions = Vec::new();
        let mut exclusions = Vec::new();
        for raw in globs {
            match raw.strip_prefix('!') {
                Some(stripped) => exclusions.push(stripped.to_string()),
                None => inclusions.push(raw.to_string()),
            }
        }
        inclusions.sort();
        exclusions.sort();
        Self {
            inclusions,
            exclusions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inclusions.is_empty() && self.exclusions.is_empty()
    }
}

/// How task output reaches the terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Stream everything, prefixed.
    #[default]
    Full,
    /// Only the cache status line.
    HashOnly,
    /// Stream only when the task fails.
    ErrorsOnly,
    /// Nothing at all.
    None,
}

impl OutputMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::Full => "full",
            OutputMode::HashOnly => "hash-only",
            OutputMode::ErrorsOnly => "errors-only",
            OutputMode::None => "none",
        }
    }
}

/// A resolved task definition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,
    pub depends_on: Vec<String>,
    pub inputs: Vec<String>,
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub dot_env: Vec<AnchoredUnixPathBuf>,
    pub output_mode: OutputMode,
    pub env_mode: EnvMode,
    pub persistent: bool,
}

impl TaskDefinition {
    fn from_raw(raw: &RawTaskDefinition) -> Self {
        let mut env = raw.env.clone();
        env.sort();
        Self {
            outputs: TaskOutputs::from_globs(&raw.outputs),
            cache: raw.cache,
            depends_on: raw.depends_on.clone(),
            inputs: raw.inputs.clone(),
            env,
            pass_through_env: raw.pass_through_env.clone().map(|mut list| {
                list.sort();
                list
            }),
            dot_env: raw.dot_env.clone(),
            output_mode: raw.output_mode,
            env_mode: raw.env_mode,
            persistent: raw.persistent,
        }
    }

    pub fn dep_refs(&self) -> Vec<DepRef> {
        self.depends_on.iter().map(|raw| DepRef::parse(raw)).collect()
    }
}

/// The resolved task definition table.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    tasks: BTreeMap<String, TaskDefinition>,
}

impl Pipeline {
    #[cfg(test)]
    pub(crate) fn from_tasks(tasks: BTreeMap<String, TaskDefinition>) -> Self {
        Self { tasks }
    }

    /// Look up the definition for `package#task`. The specific
    /// `package#task` key wins over the plain `task` key; there is no
    /// field-level merging between the two. The root workspace only
    /// runs tasks declared explicitly as `//#task` — a plain entry never
    /// fans out to the root.
    pub fn definition(&self, package: &str, task: &str) -> Option<&TaskDefinition> {
        if package == ROOT_WORKSPACE_NAME {
            return self.tasks.get(&format!("{package}#{task}"));
        }
        self.tasks
            .get(&format!("{package}#{task}"))
            .or_else(|| self.tasks.get(task))
    }

    /// Is `task` mentioned anywhere in the pipeline, for any package?
    pub fn defines_task(&self, task: &str) -> bool {
        self.tasks.keys().any(|key| {
            key == task || key.rsplit_once('#').is_some_and(|(_, name)| name == task)
        })
    }
}

/// A parsed `dependsOn` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepRef {
    /// `name`: the same task family in this package.
    Task(String),
    /// `^name`: `name` in every (transitive) internal dependency.
    Topological(String),
    /// `package#task`: one exact node.
    Explicit { package: String, task: String },
}

impl DepRef {
    pub fn parse(raw: &str) -> DepRef {
        if let Some(name) = raw.strip_prefix('^') {
            return DepRef::Topological(name.to_string());
        }
        if let Some((package, task)) = raw.split_once('#') {
            return DepRef::Explicit {
                package: package.to_string(),
                task: task.to_string(),
            };
        }
        DepRef::Task(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_config(json: &str) -> Result<RootConfig, GraphError> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), json).unwrap();
        let root = AbsoluteSystemPathBuf::from_std(dir.path().to_path_buf()).unwrap();
        RootConfig::load(&root)
    }

    #[test]
    fn test_load_full_config() {
        let config = load_config(
            r#"{
                "$schema": "https://tach.build/schema.json",
                "globalDependencies": ["tsconfig.json"],
                "globalEnv": ["CI"],
                "globalDotEnv": [".env"],
                "tasks": {
                    "build": {
                        "outputs": ["dist/**", "!dist/**/*.map"],
                        "dependsOn": ["^build"],
                        "env": ["API_URL"],
                        "outputMode": "hash-only"
                    },
                    "dev": { "cache": false, "persistent": true }
                }
            }"#,
        )
        .unwrap();

        let pipeline = config.pipeline();
        let build = pipeline.definition("anything", "build").unwrap();
        assert_eq!(build.outputs.inclusions, vec!["dist/**"]);
        assert_eq!(build.outputs.exclusions, vec!["dist/**/*.map"]);
        assert_eq!(build.output_mode, OutputMode::HashOnly);
        assert!(build.cache);

        let dev = pipeline.definition("anything", "dev").unwrap();
        assert!(dev.persistent);
        assert!(!dev.cache);
    }

    #[test]
    fn test_dollar_env_dependency_rejected() {
        let err = load_config(
            r#"{ "tasks": { "build": { "dependsOn": ["$API_URL"] } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::DollarDependency(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = load_config(r#"{ "pipelines": {} }"#).unwrap_err();
        assert!(matches!(err, GraphError::ConfigParse { .. }));
    }

    #[test]
    fn test_package_specific_entry_wins() {
        let config = load_config(
            r#"{
                "tasks": {
                    "build": { "outputs": ["dist/**"] },
                    "web#build": { "outputs": ["out/**"] }
                }
            }"#,
        )
        .unwrap();
        let pipeline = config.pipeline();

        assert_eq!(
            pipeline.definition("web", "build").unwrap().outputs.inclusions,
            vec!["out/**"]
        );
        assert_eq!(
            pipeline.definition("docs", "build").unwrap().outputs.inclusions,
            vec!["dist/**"]
        );
    }

    #[test]
    fn test_dep_ref_parsing() {
        assert_eq!(DepRef::parse("build"), DepRef::Task("build".to_string()));
        assert_eq!(
            DepRef::parse("^build"),
            DepRef::Topological("build".to_string())
        );
        assert_eq!(
            DepRef::parse("web#build"),
            DepRef::Explicit {
                package: "web".to_string(),
                task: "build".to_string()
            }
        );
    }

    #[test]
    fn test_root_requires_explicit_entry() {
        let config = load_config(
            r#"{
                "tasks": {
                    "build": { "outputs": ["dist/**"] },
                    "//#prepare": { "outputs": [] }
                }
            }"#,
        )
        .unwrap();
        let pipeline = config.pipeline();

        // A plain entry never applies to the root workspace.
        assert!(pipeline.definition("//", "build").is_none());
        assert!(pipeline.definition("//", "prepare").is_some());
        assert!(pipeline.definition("web", "build").is_some());
    }

    #[test]
    fn test_defines_task_sees_scoped_entries() {
        let config = load_config(r#"{ "tasks": { "web#deploy": {} } }"#).unwrap();
        let pipeline = config.pipeline();

        assert!(pipeline.defines_task("deploy"));
        assert!(!pipeline.defines_task("build"));
    }
}
