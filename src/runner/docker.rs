use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ExecutionError, Result};
use crate::runner::PAYLOAD_DIR_NAME;

/// In-container locations. The container contract rewrites host paths to
/// these before the base command is wrapped.
pub const WORKSPACE_DIR: &str = "/workspace";
pub const DEPS_LIST_DIR: &str = "/opt/runner/deps-lists";
pub const DEPS_CACHE_DIR: &str = "/opt/runner/deps-cache";
pub const ARTIFACT_CACHE_DIR: &str = "/opt/runner/artifacts";
pub const RUNNER_PATH: &str = "/opt/runner/runner.jar";
pub const JAVA_CMD: &str = "java";

/// The worker's payload directory inside the container.
pub fn workspace_payload_dir() -> PathBuf {
    Path::new(WORKSPACE_DIR).join(PAYLOAD_DIR_NAME)
}

/// Rewrite a host manifest path to its in-container location.
pub fn deps_manifest_path(host_manifest: &Path) -> PathBuf {
    let name = host_manifest.file_name().unwrap_or_default();
    Path::new(DEPS_LIST_DIR).join(name)
}

/// Wraps a base worker command into a `docker run` argv.
#[derive(Debug, Clone)]
pub struct DockerCommandBuilder {
    options: BTreeMap<String, serde_json::Value>,
    proc_dir: PathBuf,
    dependency_list_dir: PathBuf,
    dependency_cache_dir: PathBuf,
    artifact_cache_dir: PathBuf,
    runner_path: PathBuf,
    extra_env: BTreeMap<String, String>,
    args: Vec<String>,
}

impl DockerCommandBuilder {
    pub fn new(options: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            options,
            proc_dir: PathBuf::new(),
            dependency_list_dir: PathBuf::new(),
            dependency_cache_dir: PathBuf::new(),
            artifact_cache_dir: PathBuf::new(),
            runner_path: PathBuf::new(),
            extra_env: BTreeMap::new(),
            args: Vec::new(),
        }
    }

    pub fn proc_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.proc_dir = v.into();
        self
    }

    pub fn dependency_list_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.dependency_list_dir = v.into();
        self
    }

    pub fn dependency_cache_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.dependency_cache_dir = v.into();
        self
    }

    pub fn artifact_cache_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.artifact_cache_dir = v.into();
        self
    }

    pub fn runner_path(mut self, v: impl Into<PathBuf>) -> Self {
        self.runner_path = v.into();
        self
    }

    pub fn extra_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// The already-rewritten base worker command to run inside the
    /// container.
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn build(self) -> Result<Vec<String>> {
        let image = self
            .options
            .get("image")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ExecutionError::ContainerConfig("container options are missing 'image'".into())
            })?;

        let mut cmd = vec![
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
        ];

        for (host, guest, read_only) in [
            (&self.proc_dir, WORKSPACE_DIR, false),
            (&self.dependency_list_dir, DEPS_LIST_DIR, true),
            (&self.dependency_cache_dir, DEPS_CACHE_DIR, true),
            (&self.artifact_cache_dir, ARTIFACT_CACHE_DIR, true),
            (&self.runner_path, RUNNER_PATH, true),
        ] {
            let suffix = if read_only { ":ro" } else { "" };
            cmd.push("-v".to_string());
            cmd.push(format!("{}:{guest}{suffix}", host.display()));
        }

        cmd.push("-w".to_string());
        cmd.push(workspace_payload_dir().display().to_string());

        // Options env first, then the explicit entries so they win.
        let mut env = BTreeMap::new();
        if let Some(options_env) = self.options.get("env").and_then(|v| v.as_object()) {
            for (key, value) in options_env {
                if let Some(value) = value.as_str() {
                    env.insert(key.clone(), value.to_string());
                }
            }
        }
        env.extend(self.extra_env);

        for (key, value) in &env {
            cmd.push("-e".to_string());
            cmd.push(format!("{key}={value}"));
        }

        cmd.push(image.to_string());
        cmd.extend(self.args);
        Ok(cmd)
    }
}
