use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::deps::manifest;
use crate::deps::resolver::{ArtifactResolver, DependencyResolver};
use crate::error::{ExecutionError, Result};
use crate::hashing::CommandFingerprint;
use crate::job::handle::JobHandle;
use crate::job::log::ProcessLog;
use crate::job::request::{JobRequest, RunnerJob};
use crate::runner::command::RunnerCommandBuilder;
use crate::runner::docker::{self, DockerCommandBuilder};
use crate::runner::launcher::{self, Launcher};
use crate::runner::log_pump::LogPump;
use crate::runner::pool::{ProcessEntry, ProcessPool};
use crate::runner::{
    AGENT_PARAMS_FILE_NAME, INSTANCE_ID_FILE_NAME, LIBRARIES_DIR_NAME, PAYLOAD_DIR_NAME,
};

/// Bounded wait for the worker-output capture task after the process has
/// exited, so partial log tails are persisted before the pump stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Finalizer invoked against the payload after the worker exits, e.g. an
/// attachment uploader.
#[async_trait]
pub trait JobPostProcessor: Send + Sync {
    async fn process(&self, instance_id: Uuid, payload_dir: &Path) -> Result<()>;
}

/// Executes jobs by launching and supervising worker processes.
pub struct RunnerExecutor<R> {
    cfg: Arc<AgentConfig>,
    deps: DependencyResolver<R>,
    post_processors: Arc<Vec<Arc<dyn JobPostProcessor>>>,
    pool: Arc<ProcessPool>,
    launcher: Launcher,
}

impl<R: ArtifactResolver> RunnerExecutor<R> {
    pub fn new(
        cfg: AgentConfig,
        artifact_resolver: R,
        post_processors: Vec<Arc<dyn JobPostProcessor>>,
    ) -> Self {
        let pool = Arc::new(ProcessPool::new(
            cfg.max_prefork_age,
            cfg.max_prefork_count,
        ));
        let launcher = Launcher::new(cfg.temp_dir.clone());
        let deps = DependencyResolver::new(artifact_resolver, cfg.default_dependencies.clone());
        Self {
            cfg: Arc::new(cfg),
            deps,
            post_processors: Arc::new(post_processors),
            pool,
            launcher,
        }
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    /// Run one job end to end.
    ///
    /// Setup errors (dependency resolution, command construction, spawn)
    /// are returned here, before any handle exists; later errors surface
    /// through [`JobHandle::wait_for_completion`].
    pub async fn exec(&self, req: JobRequest) -> Result<JobHandle> {
        let request_log = req.log.clone();
        let job = RunnerJob::from_request(req);
        let instance_id = job.instance_id;

        let entry = match self.setup(&job).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(instance_id = %instance_id, error = %e, "worker startup failed");
                // The in-process log file streaming has not started yet.
                request_log.error(&format!("Process startup error: {e}"));
                return Err(e);
            }
        };

        let kill = CancellationToken::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let post_processors = self.post_processors.clone();
            let kill = kill.clone();
            let cancelled = cancelled.clone();
            let done = done.clone();
            async move {
                let result = run(job, entry, post_processors, kill, cancelled).await;
                done.store(true, Ordering::SeqCst);
                result
            }
        });

        Ok(JobHandle::new(instance_id, task, kill, cancelled, done))
    }

    /// Destroy pooled warm workers. Call on agent shutdown.
    pub async fn shutdown(&self) {
        self.pool.drain().await;
    }

    async fn setup(&self, job: &RunnerJob) -> Result<ProcessEntry> {
        let paths = self.deps.resolve(job).await?;

        if self.can_use_prefork(job) {
            let cmd = self.build_command(job, &paths, None)?;
            self.fork(job, cmd).await
        } else {
            tracing::info!(
                instance_id = %job.instance_id,
                "pre-forked workers not applicable, starting one-shot"
            );
            let proc_dir = create_proc_dir(&self.cfg.temp_dir, "onetime")?;
            let cmd = self.build_command(job, &paths, Some(&proc_dir))?;
            self.start_one_shot(job, cmd, proc_dir).await
        }
    }

    fn can_use_prefork(&self, job: &RunnerJob) -> bool {
        if self.cfg.max_prefork_count == 0 {
            return false;
        }
        if !job.cfg.container.is_empty() {
            // The worker runs in a separate container.
            return false;
        }
        if job.payload_dir.join(LIBRARIES_DIR_NAME).exists() {
            // The job supplies its own libraries.
            return false;
        }
        // The job supplies its own worker parameters.
        !job.payload_dir.join(AGENT_PARAMS_FILE_NAME).exists()
    }

    fn build_command(
        &self,
        job: &RunnerJob,
        paths: &[PathBuf],
        proc_dir: Option<&Path>,
    ) -> Result<Vec<String>> {
        let with_container = !job.cfg.container.is_empty();

        let manifest_path = manifest::store(&self.cfg.dependency_list_dir, paths)?;

        let builder = RunnerCommandBuilder::new()
            .agent_id(&self.cfg.agent_id)
            .server_api_base_url(&self.cfg.server_api_base_url)
            .security_manager_enabled(self.cfg.security_manager_enabled)
            .debug(job.debug_mode);

        if !with_container {
            return Ok(builder
                .java_cmd(&self.cfg.java_cmd)
                .deps_manifest(manifest_path)
                .runner_path(self.cfg.runner_path.clone())
                .build());
        }

        let base = builder
            .java_cmd(docker::JAVA_CMD)
            .deps_manifest(docker::deps_manifest_path(&manifest_path))
            .runner_path(docker::RUNNER_PATH)
            .payload_dir(docker::workspace_payload_dir())
            .build();

        let Some(proc_dir) = proc_dir else {
            return Err(ExecutionError::ContainerConfig(
                "containerized jobs need a dedicated process directory".into(),
            ));
        };

        DockerCommandBuilder::new(job.cfg.container.clone())
            .proc_dir(proc_dir)
            .dependency_list_dir(&self.cfg.dependency_list_dir)
            .dependency_cache_dir(&self.cfg.dependency_cache_dir)
            .artifact_cache_dir(self.deps.artifact_resolver().local_cache_dir())
            .runner_path(&self.cfg.runner_path)
            .extra_env(launcher::TMP_DIR_KEY, "/tmp")
            .extra_env("DOCKER_HOST", &self.cfg.docker_host)
            .args(base)
            .build()
    }

    /// Take a warm worker from the pool (or start one) and adopt the
    /// payload by copying it in; the warm process was started before the
    /// job existed, so the original payload stays where it is.
    async fn fork(&self, job: &RunnerJob, cmd: Vec<String>) -> Result<ProcessEntry> {
        let started = Instant::now();
        let fingerprint = CommandFingerprint::of(&cmd);

        let entry = {
            let launcher = self.launcher.clone();
            let temp_root = self.cfg.temp_dir.clone();
            let cmd = cmd.clone();
            self.pool
                .take(fingerprint, move || async move {
                    let proc_dir = create_proc_dir(&temp_root, "prefork")?;
                    launcher.start(&proc_dir, &cmd, fingerprint).await
                })
                .await?
        };

        copy_dir_all(&job.payload_dir, &entry.payload_dir()).await?;
        write_instance_id(job.instance_id, &entry.payload_dir()).await?;

        if job.debug_mode {
            job.log.info(&format!(
                "Forking a worker took {}ms",
                started.elapsed().as_millis()
            ));
        }

        self.prewarm_in_background(fingerprint, cmd);

        Ok(entry)
    }

    /// Warm a replacement worker so the next job with the same fingerprint
    /// finds one pooled.
    fn prewarm_in_background(&self, fingerprint: CommandFingerprint, cmd: Vec<String>) {
        if self.cfg.max_prefork_count == 0 {
            return;
        }
        let pool = self.pool.clone();
        let launcher = self.launcher.clone();
        let temp_root = self.cfg.temp_dir.clone();
        tokio::spawn(async move {
            let result = pool
                .prewarm(fingerprint, move || async move {
                    let proc_dir = create_proc_dir(&temp_root, "prefork")?;
                    launcher.start(&proc_dir, &cmd, fingerprint).await
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to prewarm a worker");
            }
        });
    }

    /// Move the payload into a fresh process directory and start the
    /// worker there.
    async fn start_one_shot(
        &self,
        job: &RunnerJob,
        cmd: Vec<String>,
        proc_dir: PathBuf,
    ) -> Result<ProcessEntry> {
        let payload_dst = proc_dir.join(PAYLOAD_DIR_NAME);
        move_dir(&job.payload_dir, &payload_dst).await?;
        write_instance_id(job.instance_id, &payload_dst).await?;
        self.launcher
            .start(&proc_dir, &cmd, CommandFingerprint::of(&cmd))
            .await
    }
}

/// The runner task for one job: pump and capture the log, wait on the
/// process (or a kill request), then clean up no matter what happened.
async fn run(
    job: RunnerJob,
    mut entry: ProcessEntry,
    post_processors: Arc<Vec<Arc<dyn JobPostProcessor>>>,
    kill: CancellationToken,
    cancelled: Arc<AtomicBool>,
) -> Result<()> {
    let instance_id = job.instance_id;
    let log = job.log.clone();
    let proc_dir = entry.proc_dir().to_path_buf();
    let payload_dir = entry.payload_dir();

    let pump = LogPump::start(log.clone(), kill.clone());

    let stdout = entry.child_mut().stdout.take();
    let stderr = entry.child_mut().stderr.take();
    let mut capture = spawn_capture(log.clone(), instance_id, stdout, stderr);

    let mut result = wait_for_worker(&job, &mut entry, &kill, &cancelled).await;

    if tokio::time::timeout(DRAIN_TIMEOUT, &mut capture).await.is_err() {
        tracing::warn!(instance_id = %instance_id, "timed out draining worker output");
        capture.abort();
    }

    pump.stop().await;

    for processor in post_processors.iter() {
        if let Err(e) = processor.process(instance_id, &payload_dir).await {
            tracing::warn!(instance_id = %instance_id, error = %e, "post-processing failed");
            handle_error(&job, &kill, &e.to_string());
            if result.is_ok() {
                result = Err(ExecutionError::PostProcessing(e.to_string()));
            }
        }
    }

    tracing::info!(
        instance_id = %instance_id,
        proc_dir = %proc_dir.display(),
        "removing the worker directory"
    );
    if let Err(e) = tokio::fs::remove_dir_all(&proc_dir).await {
        tracing::warn!(
            instance_id = %instance_id,
            error = %e,
            "failed to remove the worker directory"
        );
    }

    log.delete().await;

    result
}

async fn wait_for_worker(
    job: &RunnerJob,
    entry: &mut ProcessEntry,
    kill: &CancellationToken,
    cancelled: &AtomicBool,
) -> Result<()> {
    let instance_id = job.instance_id;

    let status = {
        let child = entry.child_mut();
        tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                tracing::info!(instance_id = %instance_id, "kill requested, terminating the worker");
                launcher::kill_graceful(child).await;
                child.wait().await
            }
        }
    };

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            launcher::kill_graceful(entry.child_mut()).await;
            job.log
                .error(&format!("Error while waiting for the process: {e}"));
            tracing::warn!(instance_id = %instance_id, error = %e, "worker wait failed, killed by the agent");
            return Err(ExecutionError::Interrupted(e.to_string()));
        }
    };

    let code = status.code().unwrap_or(-1);

    if code == 0 {
        tracing::info!(instance_id = %instance_id, code, "worker finished");
        job.log.info(&format!("Process finished with: {code}"));
        return Ok(());
    }

    if cancelled.load(Ordering::SeqCst) {
        tracing::info!(instance_id = %instance_id, code, "worker cancelled");
        job.log.info("Process cancelled");
        return Ok(());
    }

    tracing::warn!(instance_id = %instance_id, code, "worker finished with a non-zero code");
    handle_error(job, kill, &format!("Process exit code: {code}"));
    Err(ExecutionError::NonZeroExit(code))
}

fn handle_error(job: &RunnerJob, kill: &CancellationToken, message: &str) {
    job.log.error(message);
    if !kill.is_cancelled() {
        kill.cancel();
        tracing::warn!(instance_id = %job.instance_id, "worker killed by the agent");
    }
}

fn spawn_capture(
    log: Arc<dyn ProcessLog>,
    instance_id: Uuid,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let out_log = log.clone();
        let out = async move {
            if let Some(mut stdout) = stdout {
                if let Err(e) = out_log.capture(&mut stdout).await {
                    tracing::warn!(instance_id = %instance_id, error = %e, "failed to capture worker stdout");
                }
            }
        };
        let err = async move {
            if let Some(mut stderr) = stderr {
                if let Err(e) = log.capture(&mut stderr).await {
                    tracing::warn!(instance_id = %instance_id, error = %e, "failed to capture worker stderr");
                }
            }
        };
        tokio::join!(out, err);
    })
}

fn create_proc_dir(temp_root: &Path, prefix: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(temp_root)?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(temp_root)?;
    Ok(dir.keep())
}

async fn write_instance_id(instance_id: Uuid, payload_dir: &Path) -> Result<()> {
    let path = payload_dir.join(INSTANCE_ID_FILE_NAME);
    let mut file = tokio::fs::File::create(&path).await?;
    file.write_all(instance_id.to_string().as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

/// Recursively copy `src` into `dst`. Used for pre-fork adoption, where
/// the worker's directory already exists and keeps its own state.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                tokio::fs::create_dir_all(&target).await?;
                stack.push((entry.path(), target));
            } else if file_type.is_symlink() {
                #[cfg(unix)]
                {
                    let link = tokio::fs::read_link(entry.path()).await?;
                    tokio::fs::symlink(link, &target).await?;
                }
                #[cfg(not(unix))]
                {
                    tokio::fs::copy(entry.path(), &target).await?;
                }
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

/// Move `src` to `dst` atomically, falling back to copy+delete when the
/// rename crosses filesystems.
async fn move_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            copy_dir_all(src, dst).await?;
            tokio::fs::remove_dir_all(src).await
        }
        Err(e) => Err(e),
    }
}
