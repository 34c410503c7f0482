use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("invalid dependency URL, missing URL scheme: {0}")]
    BadDependencyUrl(String),

    #[error("found forbidden dependencies")]
    ForbiddenDependencies,

    #[error("dependency resolution error: {0}")]
    DependencyResolution(String),

    #[error("dependency probe error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed policy file: {0}")]
    Policy(#[from] serde_json::Error),

    #[error("invalid container configuration: {0}")]
    ContainerConfig(String),

    #[error("failed to start the worker process: {0}")]
    Launch(#[source] std::io::Error),

    #[error("worker process exited with code {0}")]
    NonZeroExit(i32),

    #[error("interrupted while waiting for the worker process: {0}")]
    Interrupted(String),

    #[error("post-processing error: {0}")]
    PostProcessing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
