//! Test harness for tach integration tests
//!
//! Builds isolated workspace fixtures in a temp directory and drives the
//! built `tach` binary against them. Tasks run through a scripted
//! stand-in package manager placed on the fixture's PATH as `npm`:
//! `npm run <task> [-- args...]` execs `./scripts/<task>.sh` in the
//! package directory, so fixtures control task behavior with plain shell.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// A fresh repo with the stand-in package manager installed.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create repo temp dir");
        let repo = Self { dir };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let bin_dir = repo.path().join("bin");
            std::fs::create_dir_all(&bin_dir).expect("create bin dir");
            let pm = bin_dir.join("npm");
            std::fs::write(
                &pm,
                "#!/bin/sh\nshift\ntask=\"$1\"\nshift\nif [ \"$1\" = \"--\" ]; then shift; fi\nexec sh \"./scripts/$task.sh\" \"$@\"\n",
            )
            .expect("write fake package manager");
            std::fs::set_permissions(&pm, std::fs::Permissions::from_mode(0o755))
                .expect("chmod fake package manager");
        }

        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, relative: &str, contents: &str) {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, contents).expect("write fixture file");
    }

    pub fn read_file(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path().join(relative)).expect("read fixture file")
    }

    pub fn read_bytes(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.path().join(relative)).expect("read fixture file")
    }

    pub fn file_exists(&self, relative: &str) -> bool {
        self.path().join(relative).exists()
    }

    pub fn remove(&self, relative: &str) {
        let path = self.path().join(relative);
        if path.is_dir() {
            std::fs::remove_dir_all(path).expect("remove fixture dir");
        } else {
            std::fs::remove_file(path).expect("remove fixture file");
        }
    }

    /// Root package.json declaring `packages/*` workspaces.
    pub fn root_manifest(&self) {
        self.write_file(
            "package.json",
            r#"{ "name": "fixture-root", "workspaces": ["packages/*"] }"#,
        );
    }

    /// Root package.json with shell-scripted tasks of its own, for
    /// exercising `//#task` entries.
    pub fn root_manifest_with_scripts(&self, scripts: &[(&str, &str)]) {
        let scripts_json: Vec<String> = scripts
            .iter()
            .map(|(task, _)| format!("\"{task}\": \"scripts/{task}.sh\""))
            .collect();
        self.write_file(
            "package.json",
            &format!(
                "{{ \"name\": \"fixture-root\", \"workspaces\": [\"packages/*\"], \"scripts\": {{ {} }} }}",
                scripts_json.join(", ")
            ),
        );
        for (task, body) in scripts {
            self.write_file(
                &format!("scripts/{task}.sh"),
                &format!("#!/bin/sh\n{body}\n"),
            );
        }
    }

    /// Root tach.json.
    pub fn config(&self, json: &str) {
        self.write_file("tach.json", json);
    }

    /// A workspace package with internal deps and shell-scripted tasks.
    pub fn package(&self, name: &str, deps: &[&str], scripts: &[(&str, &str)]) {
        let deps_json: Vec<String> = deps.iter().map(|d| format!("\"{d}\": \"*\"")).collect();
        let scripts_json: Vec<String> = scripts
            .iter()
            .map(|(task, _)| format!("\"{task}\": \"scripts/{task}.sh\""))
            .collect();
        self.write_file(
            &format!("packages/{name}/package.json"),
            &format!(
                "{{ \"name\": \"{name}\", \"scripts\": {{ {} }}, \"dependencies\": {{ {} }} }}",
                scripts_json.join(", "),
                deps_json.join(", ")
            ),
        );
        for (task, body) in scripts {
            self.write_file(
                &format!("packages/{name}/scripts/{task}.sh"),
                &format!("#!/bin/sh\n{body}\n"),
            );
        }
    }

    fn binary() -> PathBuf {
        PathBuf::from(env!("CARGO_BIN_EXE_tach"))
    }

    /// Run `tach <args...>` in the repo with the fixture PATH.
    pub fn run(&self, args: &[&str]) -> TachOutput {
        self.run_with_env(args, &[])
    }

    pub fn run_with_env(&self, args: &[&str], env: &[(&str, &str)]) -> TachOutput {
        let mut cmd = Command::new(Self::binary());
        cmd.current_dir(self.path());
        cmd.args(args);

        let host_path = std::env::var("PATH").unwrap_or_default();
        let bin_dir = self.path().join("bin");
        cmd.env(
            "PATH",
            format!("{}:{host_path}", bin_dir.to_str().expect("utf-8 path")),
        );
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd.output().expect("failed to run tach");
        TachOutput::from(output)
    }
}

#[derive(Debug)]
pub struct TachOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl TachOutput {
    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.stdout).unwrap_or_else(|e| {
            panic!("stdout is not JSON ({e}):\n{}", self.stdout);
        })
    }
}

impl From<Output> for TachOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}
