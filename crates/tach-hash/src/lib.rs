//! Deterministic fingerprint engine
//!
//! Fingerprints key every cache entry, so they must be reproducible
//! byte-for-byte across hosts, platforms, and versions of this code that
//! share a schema. The input bundles below are serialized through
//! [`CanonicalEncoder`] — a schema with fixed field order, length-prefixed
//! strings, and explicit collection encodings — and the resulting buffer
//! is digested with XXH64. The hash is fast rather than secret: it runs
//! for every task on every invocation.
//!
//! Collections that are sets (env names, outputs, dependency hashes) are
//! sorted at construction. Collections where order is meaning (dotenv
//! files, pass-through args) are preserved verbatim.

use std::hash::Hasher;

use tach_env::{EnvMode, ResolvedEnvMode};
use tach_path::AnchoredUnixPathBuf;
use twox_hash::XxHash64;

/// Version-bound constant mixed into every global hash. Bump to invalidate
/// all existing cache entries on a schema or behavior change.
pub const GLOBAL_CACHE_KEY: &str = "tach cache schema v1";

/// Struct tags keep the two bundle encodings from ever colliding.
const TAG_GLOBAL: u8 = 1;
const TAG_TASK: u8 = 2;
const TAG_FILES: u8 = 3;
const TAG_DEPS: u8 = 4;

/// Append-only canonical byte encoding.
///
/// Encodings: `str` is a u32-LE byte length followed by UTF-8 bytes;
/// lists are a u32-LE element count followed by elements; pair lists
/// encode key then value per element; bools and enum discriminants are
/// single bytes. Fields carry no tags — the fixed field order of each
/// bundle is the schema.
#[derive(Default)]
pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_str(&mut self, value: &str) {
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_str_list(&mut self, values: &[String]) {
        self.buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            self.put_str(value);
        }
    }

    pub fn put_path(&mut self, value: &AnchoredUnixPathBuf) {
        self.put_str(value.as_str());
    }

    pub fn put_path_list(&mut self, values: &[AnchoredUnixPathBuf]) {
        self.buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            self.put_path(value);
        }
    }

    pub fn put_pair_list(&mut self, pairs: &[(AnchoredUnixPathBuf, String)]) {
        self.buf.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
        for (key, value) in pairs {
            self.put_path(key);
            self.put_str(value);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// XXH64 (seed 0) over a canonical buffer, rendered as 16 lowercase hex
/// digits.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    format!("{:016x}", hasher.finish())
}

/// Inputs to the run-wide global fingerprint.
///
/// The field order below is the encoding order. Do not reorder.
#[derive(Debug, Clone)]
pub struct GlobalHashInputs {
    pub global_cache_key: String,
    /// Sorted by path.
    pub global_file_hashes: Vec<(AnchoredUnixPathBuf, String)>,
    pub root_external_deps_hash: String,
    /// Sorted.
    pub env: Vec<String>,
    /// Sorted `KEY=value` pairs.
    pub resolved_env_vars: Vec<String>,
    /// Sorted.
    pub pass_through_env: Vec<String>,
    pub env_mode: EnvMode,
    pub framework_inference: bool,
    /// Explicitly ordered; never sorted.
    pub dot_env: Vec<AnchoredUnixPathBuf>,
}

impl GlobalHashInputs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut global_file_hashes: Vec<(AnchoredUnixPathBuf, String)>,
        root_external_deps_hash: String,
        mut env: Vec<String>,
        mut resolved_env_vars: Vec<String>,
        mut pass_through_env: Vec<String>,
        env_mode: EnvMode,
        framework_inference: bool,
        dot_env: Vec<AnchoredUnixPathBuf>,
    ) -> Self {
        global_file_hashes.sort();
        env.sort();
        resolved_env_vars.sort();
        pass_through_env.sort();
        Self {
            global_cache_key: GLOBAL_CACHE_KEY.to_string(),
            global_file_hashes,
            root_external_deps_hash,
            env,
            resolved_env_vars,
            pass_through_env,
            env_mode,
            framework_inference,
            dot_env,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = CanonicalEncoder::new();
        enc.put_u8(TAG_GLOBAL);
        enc.put_str(&self.global_cache_key);
        enc.put_pair_list(&self.global_file_hashes);
        enc.put_str(&self.root_external_deps_hash);
        enc.put_str_list(&self.env);
        enc.put_str_list(&self.resolved_env_vars);
        enc.put_str_list(&self.pass_through_env);
        enc.put_u8(self.env_mode.code());
        enc.put_bool(self.framework_inference);
        enc.put_path_list(&self.dot_env);
        enc.finish()
    }

    pub fn hash(&self) -> String {
        hash_bytes(&self.encode())
    }
}

/// Inputs to a single task's fingerprint.
///
/// The field order below is the encoding order. Do not reorder.
#[derive(Debug, Clone)]
pub struct TaskHashInputs {
    pub global_hash: String,
    pub package_dir: AnchoredUnixPathBuf,
    pub files_hash: String,
    pub external_deps_hash: String,
    pub task: String,
    pub env_mode: ResolvedEnvMode,
    /// Sorted.
    pub output_inclusions: Vec<String>,
    /// Sorted.
    pub output_exclusions: Vec<String>,
    /// Sorted.
    pub task_dependency_hashes: Vec<String>,
    /// Explicitly ordered; never sorted.
    pub pass_through_args: Vec<String>,
    /// Sorted.
    pub env: Vec<String>,
    /// Sorted.
    pub pass_through_env: Vec<String>,
    /// Explicitly ordered; never sorted.
    pub dot_env: Vec<AnchoredUnixPathBuf>,
    /// Sorted `KEY=value` pairs.
    pub resolved_env_vars: Vec<String>,
}

impl TaskHashInputs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        global_hash: String,
        package_dir: AnchoredUnixPathBuf,
        files_hash: String,
        external_deps_hash: String,
        task: String,
        env_mode: ResolvedEnvMode,
        mut output_inclusions: Vec<String>,
        mut output_exclusions: Vec<String>,
        mut task_dependency_hashes: Vec<String>,
        pass_through_args: Vec<String>,
        mut env: Vec<String>,
        mut pass_through_env: Vec<String>,
        dot_env: Vec<AnchoredUnixPathBuf>,
        mut resolved_env_vars: Vec<String>,
    ) -> Self {
        output_inclusions.sort();
        output_exclusions.sort();
        task_dependency_hashes.sort();
        env.sort();
        pass_through_env.sort();
        resolved_env_vars.sort();
        Self {
            global_hash,
            package_dir,
            files_hash,
            external_deps_hash,
            task,
            env_mode,
            output_inclusions,
            output_exclusions,
            task_dependency_hashes,
            pass_through_args,
            env,
            pass_through_env,
            dot_env,
            resolved_env_vars,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = CanonicalEncoder::new();
        enc.put_u8(TAG_TASK);
        enc.put_str(&self.global_hash);
        enc.put_path(&self.package_dir);
        enc.put_str(&self.files_hash);
        enc.put_str(&self.external_deps_hash);
        enc.put_str(&self.task);
        enc.put_u8(self.env_mode.code());
        enc.put_str_list(&self.output_inclusions);
        enc.put_str_list(&self.output_exclusions);
        enc.put_str_list(&self.task_dependency_hashes);
        enc.put_str_list(&self.pass_through_args);
        enc.put_str_list(&self.env);
        enc.put_str_list(&self.pass_through_env);
        enc.put_path_list(&self.dot_env);
        enc.put_str_list(&self.resolved_env_vars);
        enc.finish()
    }

    pub fn hash(&self) -> String {
        hash_bytes(&self.encode())
    }
}

/// Fold a scanned file set into the single files-hash fed to the task
/// fingerprint. Pairs are sorted by path before encoding.
pub fn hash_file_set(mut pairs: Vec<(AnchoredUnixPathBuf, String)>) -> String {
    pairs.sort();
    let mut enc = CanonicalEncoder::new();
    enc.put_u8(TAG_FILES);
    enc.put_pair_list(&pairs);
    hash_bytes(&enc.finish())
}

/// Hash a package's external dependency set (sorted `name@range`
/// strings).
pub fn hash_external_deps(mut deps: Vec<String>) -> String {
    deps.sort();
    let mut enc = CanonicalEncoder::new();
    enc.put_u8(TAG_DEPS);
    enc.put_str_list(&deps);
    hash_bytes(&enc.finish())
}
