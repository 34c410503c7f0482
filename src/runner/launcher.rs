use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use tokio::process::{Child, Command};

use crate::error::{ExecutionError, Result};
use crate::hashing::CommandFingerprint;
use crate::runner::pool::ProcessEntry;
use crate::runner::{JOB_ATTACHMENTS_DIR_NAME, PAYLOAD_DIR_NAME};

/// Env var exporting the agent's temp root to the worker.
pub const TMP_DIR_KEY: &str = "TMP_DIR";
/// Env var telling the worker where to put job attachments.
pub const ATTACHMENTS_DIR_KEY: &str = "_CONCORD_ATTACHMENTS_DIR";
/// Pass-through marker for docker-in-docker local mode.
pub const DOCKER_LOCAL_MODE_KEY: &str = "CONCORD_DOCKER_LOCAL_MODE";

/// Starts worker processes in their process directories.
#[derive(Debug, Clone)]
pub struct Launcher {
    temp_dir: PathBuf,
}

impl Launcher {
    pub fn new(temp_dir: PathBuf) -> Self {
        Self { temp_dir }
    }

    /// Create the payload directory if missing and start the worker with
    /// its output piped and its environment wired up.
    pub async fn start(
        &self,
        proc_dir: &Path,
        cmd: &[String],
        fingerprint: CommandFingerprint,
    ) -> Result<ProcessEntry> {
        let (program, args) = cmd.split_first().ok_or_else(|| {
            ExecutionError::Launch(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty worker command",
            ))
        })?;

        let payload_dir = proc_dir.join(PAYLOAD_DIR_NAME);
        tokio::fs::create_dir_all(&payload_dir).await?;

        tracing::info!(
            payload_dir = %payload_dir.display(),
            command = %cmd.join(" "),
            "starting a worker process"
        );

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&payload_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env(TMP_DIR_KEY, self.temp_dir.as_os_str())
            .env(
                ATTACHMENTS_DIR_KEY,
                payload_dir.join(JOB_ATTACHMENTS_DIR_NAME).as_os_str(),
            );

        if let Ok(mode) = std::env::var(DOCKER_LOCAL_MODE_KEY) {
            tracing::debug!(mode, "passing through the docker local mode");
            command.env(DOCKER_LOCAL_MODE_KEY, mode);
        }

        let child = command.spawn().map_err(ExecutionError::Launch)?;
        Ok(ProcessEntry::new(
            child,
            proc_dir.to_path_buf(),
            fingerprint,
            Utc::now(),
        ))
    }
}

/// SIGTERM the worker, then make sure it is gone.
pub async fn kill_graceful(child: &mut Child) {
    #[cfg(unix)]
    if let Some(id) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(id as i32), Signal::SIGTERM);
    }
    let _ = child.kill().await;
}
