use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How often the pump looks for new bytes to ship upstream.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

const READ_BUF_SIZE: usize = 8 * 1024;

/// Upstream transport for persisted log bytes. The wire protocol is the
/// server's concern; the agent only appends chunks in order.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, instance_id: Uuid, chunk: &[u8]) -> std::io::Result<()>;
}

/// Per-job log sink.
#[async_trait]
pub trait ProcessLog: Send + Sync {
    /// Append an informational line.
    fn info(&self, message: &str);

    /// Append an error line.
    fn error(&self, message: &str);

    /// Drain a byte stream (worker output) into local storage. Returns the
    /// number of bytes captured.
    async fn capture(&self, stream: &mut (dyn AsyncRead + Send + Unpin))
        -> std::io::Result<u64>;

    /// Ship persisted bytes upstream until `stop` fires, then ship whatever
    /// tail is left.
    async fn run(&self, stop: CancellationToken) -> std::io::Result<()>;

    /// Discard local storage. Called only after the pump has ended.
    async fn delete(&self);
}

/// File-backed process log: worker output and agent messages are appended
/// to one local file, which [`ProcessLog::run`] tails into a [`LogSink`].
pub struct FileProcessLog {
    instance_id: Uuid,
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
    sink: Arc<dyn LogSink>,
}

impl FileProcessLog {
    pub async fn create(
        log_dir: &Path,
        instance_id: Uuid,
        sink: Arc<dyn LogSink>,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;
        let path = log_dir.join(format!("{instance_id}.log"));
        let writer = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            instance_id,
            path,
            writer: Mutex::new(writer),
            sink,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // The file is opened O_APPEND by every writer, so lines from concurrent
    // writers stay whole.
    fn append_line(&self, level: &str, message: &str) {
        let line = format!("{level}: {message}\n");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(
                instance_id = %self.instance_id,
                error = %e,
                "failed to append to the process log"
            );
        }
    }

    async fn ship_from(&self, offset: u64) -> std::io::Result<u64> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut shipped = 0u64;
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.sink.append(self.instance_id, &buf[..n]).await?;
            shipped += n as u64;
        }
        Ok(shipped)
    }
}

#[async_trait]
impl ProcessLog for FileProcessLog {
    fn info(&self, message: &str) {
        self.append_line("INFO", message);
    }

    fn error(&self, message: &str) {
        self.append_line("ERROR", message);
    }

    async fn capture(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
    ) -> std::io::Result<u64> {
        let mut total = 0u64;
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let mut writer = self.writer.lock().await;
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            total += n as u64;
        }
        Ok(total)
    }

    async fn run(&self, stop: CancellationToken) -> std::io::Result<()> {
        let mut offset = 0u64;
        loop {
            // Observe the stop signal before shipping so the final pass
            // always carries the tail written up to that point.
            let stopping = stop.is_cancelled();
            offset += self.ship_from(offset).await?;
            if stopping {
                return Ok(());
            }
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn delete(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "failed to remove the process log file"
                );
            }
        }
    }
}

/// Sink that prints log chunks to stdout. Used by the local-run binary.
pub struct ConsoleSink;

#[async_trait]
impl LogSink for ConsoleSink {
    async fn append(&self, _instance_id: Uuid, chunk: &[u8]) -> std::io::Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(chunk).await?;
        stdout.flush().await
    }
}
