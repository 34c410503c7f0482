use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use runner_agent::config::AgentConfig;
use runner_agent::deps::HttpArtifactResolver;
use runner_agent::job::{ConsoleSink, FileProcessLog, JobConfig, JobRequest};
use runner_agent::runner::RunnerExecutor;
use runner_agent::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "runner-agent")]
#[command(about = "Executes a prepared job payload with a supervised worker process")]
struct Args {
    /// Directory with the job's prepared payload
    #[arg(long)]
    payload_dir: PathBuf,

    /// Host path of the runner artifact handed to the worker
    #[arg(long)]
    runner_path: PathBuf,

    /// Worker launch command (argv[0] of the base command)
    #[arg(long, default_value = "java")]
    java_cmd: String,

    /// Agent identity reported to the worker
    #[arg(long, default_value = "agent-local")]
    agent_id: String,

    /// Base URL of the control plane API
    #[arg(long, default_value = "http://localhost:8001")]
    server_api_base_url: String,

    /// Working root for logs, caches and process directories
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Dependency URI added to the job (repeatable)
    #[arg(long = "dep")]
    dependencies: Vec<String>,

    /// Verbose dependency resolution and timing in the process log
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let work_dir = args
        .work_dir
        .unwrap_or_else(|| std::env::temp_dir().join("runner-agent"));
    let cfg = AgentConfig {
        agent_id: args.agent_id,
        server_api_base_url: args.server_api_base_url,
        java_cmd: args.java_cmd,
        runner_path: args.runner_path,
        dependency_list_dir: work_dir.join("deps-lists"),
        dependency_cache_dir: work_dir.join("deps-cache"),
        log_dir: work_dir.join("logs"),
        temp_dir: work_dir.join("tmp"),
        ..AgentConfig::default()
    };

    let resolver = HttpArtifactResolver::new(cfg.dependency_cache_dir.clone());
    let executor = RunnerExecutor::new(cfg.clone(), resolver, Vec::new());

    let instance_id = Uuid::new_v4();
    let log = Arc::new(FileProcessLog::create(&cfg.log_dir, instance_id, Arc::new(ConsoleSink)).await?);

    let request = JobRequest {
        instance_id,
        payload_dir: args.payload_dir,
        cfg: JobConfig {
            dependencies: args.dependencies,
            container: Default::default(),
            debug: args.debug,
        },
        log,
    };

    tracing::info!(instance_id = %instance_id, "starting the job");
    let mut handle = executor.exec(request).await?;

    let shutdown = install_shutdown_handler();
    let result = tokio::select! {
        result = handle.wait_for_completion() => result,
        _ = shutdown.cancelled() => {
            tracing::info!("shutdown requested, cancelling the job");
            handle.cancel();
            handle.wait_for_completion().await
        }
    };

    executor.shutdown().await;

    match result {
        Ok(()) if handle.is_cancelled() => tracing::info!("job cancelled"),
        Ok(()) => tracing::info!("job finished"),
        Err(e) => {
            tracing::error!(error = %e, "job failed");
            return Err(e.into());
        }
    }
    Ok(())
}
