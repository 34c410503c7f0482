use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ExecutionError, Result};

/// Handle to a running job: await completion, request cancellation, query
/// the cancellation flag.
pub struct JobHandle {
    instance_id: Uuid,
    task: Option<JoinHandle<Result<()>>>,
    kill: CancellationToken,
    cancelled: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl JobHandle {
    pub(crate) fn new(
        instance_id: Uuid,
        task: JoinHandle<Result<()>>,
        kill: CancellationToken,
        cancelled: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    ) -> Self {
        Self {
            instance_id,
            task: Some(task),
            kill,
            cancelled,
            done,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Wait for the runner task to finish, re-raising any error it
    /// produced. Later calls return `Ok(())` once the first has resolved.
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(ExecutionError::Interrupted(e.to_string())),
            },
            None => Ok(()),
        }
    }

    /// Request cancellation: mark the job cancelled and kill the worker.
    /// No-op when the job already finished or was already cancelled.
    pub fn cancel(&self) {
        if self.done.load(Ordering::SeqCst) || self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(instance_id = %self.instance_id, "cancelling the job");
        self.kill.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("instance_id", &self.instance_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
