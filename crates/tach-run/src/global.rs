//! Global hash assembly
//!
//! The run-wide fingerprint every task hash builds on: global file
//! dependencies (plus the global dotenv files), the root's external
//! dependency hash, and the globally declared environment.

use std::collections::BTreeMap;

use tach_env::{EnvMode, EnvironmentVariableMap};
use tach_hash::GlobalHashInputs;
use tach_path::AnchoredUnixPathBuf;
use tracing::{debug, warn};

use crate::{RunConfig, RunError};

/// The computed global hash and the inputs worth reporting.
#[derive(Debug, Clone)]
pub struct GlobalHash {
    pub hash: String,
    pub file_hashes: BTreeMap<AnchoredUnixPathBuf, String>,
    pub root_external_deps_hash: String,
    pub resolved_env: EnvironmentVariableMap,
}

/// Hash the run's global inputs. `env_snapshot` is the host environment
/// captured once at startup.
pub fn compute_global_hash(
    config: &RunConfig,
    root_external_deps_hash: &str,
    env_snapshot: &EnvironmentVariableMap,
) -> Result<GlobalHash, RunError> {
    let mut files: BTreeMap<AnchoredUnixPathBuf, String> = BTreeMap::new();
    for (path, hash) in tach_scan::scan_root(&config.repo_root, &config.global_dependencies)? {
        files.insert(path, hash);
    }
    // The root manifests shape every task; they are always global
    // inputs, declared or not.
    let implicit: Vec<AnchoredUnixPathBuf> = [tach_graph::CONFIG_FILE_NAME, "package.json"]
        .iter()
        .map(|name| AnchoredUnixPathBuf::new(*name).expect("static names are well-formed"))
        .collect();
    for (path, hash) in tach_scan::hash_existing(&config.repo_root, &implicit)? {
        files.insert(path, hash);
    }
    // Global dotenv files are content inputs too, whether or not the
    // globs covered them.
    for (path, hash) in tach_scan::hash_existing(&config.repo_root, &config.global_dot_env)? {
        files.insert(path, hash);
    }

    let (resolved_env, missing) = env_snapshot.from_keys(&config.global_env);
    debug!(env = ?resolved_env.names(), "global hash env vars");
    if !missing.is_empty() {
        warn!(
            missing = missing.join(", "),
            "globally declared env variables are not set; hashing them as absent"
        );
    }

    // Resolve the env-mode/pass-through interaction before hashing so
    // equivalent configurations collide.
    let mut env_mode = config.env_mode;
    let mut pass_through = config.global_pass_through_env.clone();
    match env_mode {
        EnvMode::Infer if pass_through.is_some() => env_mode = EnvMode::Strict,
        EnvMode::Loose => pass_through = None,
        EnvMode::Strict if pass_through.is_none() => pass_through = Some(Vec::new()),
        _ => {}
    }

    let inputs = GlobalHashInputs::new(
        files.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        root_external_deps_hash.to_string(),
        config.global_env.clone(),
        resolved_env.to_hashable(),
        pass_through.unwrap_or_default(),
        env_mode,
        config.framework_inference,
        config.global_dot_env.clone(),
    );

    let hash = inputs.hash();
    debug!(hash, files = files.len(), "global hash computed");

    Ok(GlobalHash {
        hash,
        file_hashes: files,
        root_external_deps_hash: root_external_deps_hash.to_string(),
        resolved_env,
    })
}
