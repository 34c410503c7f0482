use std::path::PathBuf;
use std::time::Duration;

/// Agent-wide configuration for the runner executor.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent identity reported to workers and the control plane.
    pub agent_id: String,
    /// Base URL of the control plane API, handed to every worker.
    pub server_api_base_url: String,
    /// Command used as argv[0] of the base worker command.
    pub java_cmd: String,
    /// Host path of the runner artifact the worker command loads.
    pub runner_path: PathBuf,
    /// Docker daemon address injected into containerized workers.
    pub docker_host: String,
    /// Directory holding content-addressed dependency manifests.
    pub dependency_list_dir: PathBuf,
    /// Dependency cache directory mounted into containerized workers.
    pub dependency_cache_dir: PathBuf,
    /// Directory for per-job process log files.
    pub log_dir: PathBuf,
    /// Root for per-worker process directories; exported as TMP_DIR.
    pub temp_dir: PathBuf,
    /// Enables the worker-side security manager flag.
    pub security_manager_enabled: bool,
    /// Maximum age of a pooled warm worker before it is evicted.
    pub max_prefork_age: Duration,
    /// Maximum number of pooled warm workers; 0 disables pre-forking.
    pub max_prefork_count: usize,
    /// Dependency URIs added to every job.
    pub default_dependencies: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let root = std::env::temp_dir().join("runner-agent");
        Self {
            agent_id: "agent-1".to_string(),
            server_api_base_url: "http://localhost:8001".to_string(),
            java_cmd: "java".to_string(),
            runner_path: root.join("runner.jar"),
            docker_host: "tcp://127.0.0.1:2375".to_string(),
            dependency_list_dir: root.join("deps-lists"),
            dependency_cache_dir: root.join("deps-cache"),
            log_dir: root.join("logs"),
            temp_dir: root.join("tmp"),
            security_manager_enabled: false,
            max_prefork_age: Duration::from_secs(60),
            max_prefork_count: 3,
            default_dependencies: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn with_prefork(mut self, max_age: Duration, max_count: usize) -> Self {
        self.max_prefork_age = max_age;
        self.max_prefork_count = max_count;
        self
    }

    pub fn with_default_dependency(mut self, uri: impl Into<String>) -> Self {
        self.default_dependencies.push(uri.into());
        self
    }
}
