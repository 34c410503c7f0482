use std::path::PathBuf;

use crate::runner::PAYLOAD_DIR_NAME;

/// Builds the base worker command.
///
/// The argv is deterministic for equal inputs: per-job host paths never
/// appear in it. The final element is the payload marker, which the worker
/// resolves against its own working directory (the launcher sets the
/// worker's cwd to the process dir's payload subdirectory).
#[derive(Debug, Clone, Default)]
pub struct RunnerCommandBuilder {
    java_cmd: String,
    agent_id: String,
    server_api_base_url: String,
    security_manager_enabled: bool,
    debug: bool,
    deps_manifest: PathBuf,
    runner_path: PathBuf,
    payload_dir: Option<PathBuf>,
}

impl RunnerCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn java_cmd(mut self, v: impl Into<String>) -> Self {
        self.java_cmd = v.into();
        self
    }

    pub fn agent_id(mut self, v: impl Into<String>) -> Self {
        self.agent_id = v.into();
        self
    }

    pub fn server_api_base_url(mut self, v: impl Into<String>) -> Self {
        self.server_api_base_url = v.into();
        self
    }

    pub fn security_manager_enabled(mut self, v: bool) -> Self {
        self.security_manager_enabled = v;
        self
    }

    pub fn debug(mut self, v: bool) -> Self {
        self.debug = v;
        self
    }

    pub fn deps_manifest(mut self, v: impl Into<PathBuf>) -> Self {
        self.deps_manifest = v.into();
        self
    }

    pub fn runner_path(mut self, v: impl Into<PathBuf>) -> Self {
        self.runner_path = v.into();
        self
    }

    /// Override the payload argument for containerized runs.
    pub fn payload_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.payload_dir = Some(v.into());
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut cmd = vec![self.java_cmd.clone()];
        cmd.push(format!("-DagentId={}", self.agent_id));
        cmd.push(format!("-DapiBaseUrl={}", self.server_api_base_url));
        cmd.push(format!("-Ddebug={}", self.debug));
        if self.security_manager_enabled {
            cmd.push("-DsecurityManager.enabled=true".to_string());
        }
        cmd.push(format!("-Ddeps={}", self.deps_manifest.display()));
        cmd.push("-jar".to_string());
        cmd.push(self.runner_path.display().to_string());
        cmd.push(
            self.payload_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| PAYLOAD_DIR_NAME.to_string()),
        );
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> RunnerCommandBuilder {
        RunnerCommandBuilder::new()
            .java_cmd("java")
            .agent_id("agent-1")
            .server_api_base_url("http://localhost:8001")
            .deps_manifest("/lists/abc.deps")
            .runner_path("/opt/runner.jar")
    }

    #[test]
    fn argv_is_deterministic() {
        assert_eq!(builder().build(), builder().build());
    }

    #[test]
    fn argv_layout() {
        let cmd = builder().debug(true).build();
        assert_eq!(cmd[0], "java");
        assert!(cmd.contains(&"-DagentId=agent-1".to_string()));
        assert!(cmd.contains(&"-Ddebug=true".to_string()));
        assert!(cmd.contains(&"-Ddeps=/lists/abc.deps".to_string()));
        assert_eq!(cmd[cmd.len() - 3], "-jar");
        assert_eq!(cmd[cmd.len() - 2], "/opt/runner.jar");
        assert_eq!(cmd[cmd.len() - 1], PAYLOAD_DIR_NAME);
    }

    #[test]
    fn security_manager_flag_is_optional() {
        let without = builder().build();
        let with = builder().security_manager_enabled(true).build();
        assert!(!without.contains(&"-DsecurityManager.enabled=true".to_string()));
        assert!(with.contains(&"-DsecurityManager.enabled=true".to_string()));
    }

    #[test]
    fn payload_override_replaces_the_marker() {
        let cmd = builder().payload_dir("/workspace/payload").build();
        assert_eq!(cmd[cmd.len() - 1], "/workspace/payload");
    }
}
