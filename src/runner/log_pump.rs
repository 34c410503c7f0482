use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::log::ProcessLog;

/// How long `stop` waits for the pump task before abandoning it.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Background task that ships the process log upstream while the worker
/// runs. Stops cooperatively; a pump error kills the worker.
pub struct LogPump {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl LogPump {
    pub fn start(log: Arc<dyn ProcessLog>, kill: CancellationToken) -> Self {
        let stop = CancellationToken::new();
        let pump_stop = stop.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = log.run(pump_stop).await {
                log.error(&format!("Log streaming error: {e}"));
                tracing::warn!(error = %e, "log pump failed, killing the worker");
                kill.cancel();
            }
        });
        Self { task, stop }
    }

    /// Signal the pump to stop and wait for it to drain. After
    /// `STOP_TIMEOUT` the pump is abandoned with a warning and cleanup
    /// continues.
    pub async fn stop(self) {
        self.stop.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "log pump task failed"),
            Err(_) => tracing::warn!("timed out waiting for the log pump to stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncRead;

    struct StubLog {
        hang: bool,
        fail: bool,
        ran: AtomicBool,
    }

    impl StubLog {
        fn new(hang: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                hang,
                fail,
                ran: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ProcessLog for StubLog {
        fn info(&self, _message: &str) {}
        fn error(&self, _message: &str) {}

        async fn capture(
            &self,
            _stream: &mut (dyn AsyncRead + Send + Unpin),
        ) -> std::io::Result<u64> {
            Ok(0)
        }

        async fn run(&self, stop: CancellationToken) -> std::io::Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(std::io::Error::other("sink unreachable"));
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            stop.cancelled().await;
            Ok(())
        }

        async fn delete(&self) {}
    }

    #[tokio::test]
    async fn stop_returns_once_the_pump_honors_the_signal() {
        let log = StubLog::new(false, false);
        let pump = LogPump::start(log.clone(), CancellationToken::new());
        pump.stop().await;
        assert!(log.ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_a_hung_pump_after_the_timeout() {
        let log = StubLog::new(true, false);
        let pump = LogPump::start(log, CancellationToken::new());
        // With paused time the one-minute timeout elapses immediately; the
        // call must return rather than wait on the hung task.
        pump.stop().await;
    }

    #[tokio::test]
    async fn pump_error_kills_the_worker() {
        let kill = CancellationToken::new();
        let log = StubLog::new(false, true);
        let pump = LogPump::start(log, kill.clone());
        pump.stop().await;
        assert!(kill.is_cancelled());
    }
}
