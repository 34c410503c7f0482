use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::process::Child;

use crate::error::Result;
use crate::hashing::CommandFingerprint;
use crate::runner::launcher;
use crate::runner::PAYLOAD_DIR_NAME;

/// A started worker process and the directory it runs in.
///
/// While an entry sits in the pool nobody else references it; once taken
/// it is owned exclusively by the taker.
pub struct ProcessEntry {
    child: Child,
    proc_dir: PathBuf,
    fingerprint: CommandFingerprint,
    created_at: DateTime<Utc>,
}

impl ProcessEntry {
    pub(crate) fn new(
        child: Child,
        proc_dir: PathBuf,
        fingerprint: CommandFingerprint,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            child,
            proc_dir,
            fingerprint,
            created_at,
        }
    }

    pub fn proc_dir(&self) -> &Path {
        &self.proc_dir
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.proc_dir.join(PAYLOAD_DIR_NAME)
    }

    pub fn fingerprint(&self) -> CommandFingerprint {
        self.fingerprint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn is_older_than(&self, max_age: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }

    /// Kill the process and remove its working directory.
    async fn destroy(mut self) {
        launcher::kill_graceful(&mut self.child).await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.proc_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    proc_dir = %self.proc_dir.display(),
                    error = %e,
                    "failed to remove an evicted worker directory"
                );
            }
        }
    }
}

#[derive(Default)]
struct PoolState {
    queues: HashMap<CommandFingerprint, VecDeque<ProcessEntry>>,
    count: usize,
}

impl PoolState {
    fn pop(&mut self, fingerprint: CommandFingerprint) -> Option<ProcessEntry> {
        let queue = self.queues.get_mut(&fingerprint)?;
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&fingerprint);
        }
        self.count -= 1;
        Some(entry)
    }

    fn pop_oldest(&mut self) -> Option<ProcessEntry> {
        let fingerprint = self
            .queues
            .iter()
            .filter_map(|(fp, queue)| queue.front().map(|e| (*fp, e.created_at)))
            .min_by_key(|(_, created_at)| *created_at)
            .map(|(fp, _)| fp)?;
        self.pop(fingerprint)
    }

    fn push(&mut self, entry: ProcessEntry) {
        self.queues
            .entry(entry.fingerprint)
            .or_default()
            .push_back(entry);
        self.count += 1;
    }
}

/// Keeps warm worker processes keyed by launch-command fingerprint.
///
/// Entries age out after `max_age` and the pool never holds more than
/// `max_count` across all fingerprints. The lock only guards queue
/// membership: spawning and destroying entries happen outside it.
pub struct ProcessPool {
    max_age: Duration,
    max_count: usize,
    state: Mutex<PoolState>,
}

impl ProcessPool {
    pub fn new(max_age: Duration, max_count: usize) -> Self {
        Self {
            max_age,
            max_count,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Take the oldest healthy warm entry for `fingerprint`, or spawn a
    /// fresh one. Spawned entries are handed to the caller without ever
    /// entering the pool. Stale and dead entries found along the way are
    /// destroyed.
    pub async fn take<F, Fut>(
        &self,
        fingerprint: CommandFingerprint,
        spawn: F,
    ) -> Result<ProcessEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProcessEntry>>,
    {
        loop {
            let candidate = self.state.lock().pop(fingerprint);
            let Some(mut entry) = candidate else { break };

            if entry.is_older_than(self.max_age) {
                tracing::debug!(fingerprint = %fingerprint, "evicting an expired warm worker");
                entry.destroy().await;
                continue;
            }
            if !entry.is_alive() {
                tracing::debug!(fingerprint = %fingerprint, "evicting a dead warm worker");
                entry.destroy().await;
                continue;
            }

            tracing::debug!(
                fingerprint = %fingerprint,
                proc_dir = %entry.proc_dir().display(),
                "reusing a warm worker"
            );
            return Ok(entry);
        }

        spawn().await
    }

    /// Insert a fresh warm entry for future reuse, evicting the globally
    /// oldest entry first when the pool is full. No-op when `max_count` is
    /// zero.
    pub async fn prewarm<F, Fut>(&self, fingerprint: CommandFingerprint, spawn: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProcessEntry>>,
    {
        if self.max_count == 0 {
            return Ok(());
        }

        let entry = spawn().await?;
        tracing::debug!(
            fingerprint = %fingerprint,
            proc_dir = %entry.proc_dir().display(),
            "pooling a warm worker"
        );

        let evicted = {
            let mut state = self.state.lock();
            let evicted = if state.count >= self.max_count {
                state.pop_oldest()
            } else {
                None
            };
            state.push(entry);
            evicted
        };
        if let Some(oldest) = evicted {
            tracing::debug!(
                proc_dir = %oldest.proc_dir().display(),
                "pool full, evicting the oldest warm worker"
            );
            oldest.destroy().await;
        }
        Ok(())
    }

    /// Number of warm entries currently pooled.
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every pooled entry. Used on agent shutdown.
    pub async fn drain(&self) {
        let entries: Vec<ProcessEntry> = {
            let mut state = self.state.lock();
            let drained = state
                .queues
                .drain()
                .flat_map(|(_, queue)| queue)
                .collect();
            state.count = 0;
            drained
        };
        for entry in entries {
            entry.destroy().await;
        }
    }
}
