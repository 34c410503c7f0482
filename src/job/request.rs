use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::log::ProcessLog;

/// Per-job configuration mapping supplied by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// Dependency URIs declared by the job, combined with the agent's
    /// default dependencies.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Container launch options; a non-empty mapping switches the job to a
    /// containerized one-shot run. Ordered so command construction stays
    /// deterministic.
    #[serde(default)]
    pub container: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub debug: bool,
}

/// One unit of work submitted to the executor. Immutable for the job's
/// lifetime.
#[derive(Clone)]
pub struct JobRequest {
    pub instance_id: Uuid,
    /// Prepared directory holding the job's inputs.
    pub payload_dir: PathBuf,
    pub cfg: JobConfig,
    /// Log sink for the job; also receives startup errors raised before
    /// the worker exists.
    pub log: Arc<dyn ProcessLog>,
}

/// Canonical view of a job used throughout the execution pipeline.
#[derive(Clone)]
pub struct RunnerJob {
    pub instance_id: Uuid,
    pub payload_dir: PathBuf,
    pub cfg: JobConfig,
    pub debug_mode: bool,
    pub log: Arc<dyn ProcessLog>,
}

impl RunnerJob {
    pub fn from_request(req: JobRequest) -> Self {
        let debug_mode = req.cfg.debug;
        Self {
            instance_id: req.instance_id,
            payload_dir: req.payload_dir,
            cfg: req.cfg,
            debug_mode,
            log: req.log,
        }
    }
}
