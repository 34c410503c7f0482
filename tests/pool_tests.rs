use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runner_agent::error::Result;
use runner_agent::hashing::CommandFingerprint;
use runner_agent::runner::{Launcher, ProcessEntry, ProcessPool};

fn sleeper_cmd() -> Vec<String> {
    vec!["/bin/sleep".to_string(), "60".to_string()]
}

fn make_proc_dir(root: &Path) -> PathBuf {
    tempfile::Builder::new()
        .prefix("proc")
        .tempdir_in(root)
        .unwrap()
        .keep()
}

async fn spawn_entry(
    launcher: Launcher,
    proc_dir: PathBuf,
    cmd: Vec<String>,
    fingerprint: CommandFingerprint,
    spawned: Arc<AtomicBool>,
) -> Result<ProcessEntry> {
    spawned.store(true, Ordering::SeqCst);
    launcher.start(&proc_dir, &cmd, fingerprint).await
}

struct PoolFixture {
    root: tempfile::TempDir,
    launcher: Launcher,
}

impl PoolFixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(root.path().join("tmp"));
        Self { root, launcher }
    }

    /// A spawn closure for `take`/`prewarm` that records whether it ran.
    fn spawner(
        &self,
        proc_dir: PathBuf,
        cmd: Vec<String>,
        fingerprint: CommandFingerprint,
        spawned: Arc<AtomicBool>,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ProcessEntry>> + Send>>
    {
        let launcher = self.launcher.clone();
        move || Box::pin(spawn_entry(launcher, proc_dir, cmd, fingerprint, spawned))
    }
}

#[tokio::test]
async fn take_spawns_when_the_pool_is_empty() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);

    let spawned = Arc::new(AtomicBool::new(false));
    let entry = pool
        .take(
            fp,
            fx.spawner(make_proc_dir(fx.root.path()), cmd, fp, spawned.clone()),
        )
        .await
        .unwrap();

    assert!(spawned.load(Ordering::SeqCst));
    assert_eq!(entry.fingerprint(), fp);
    assert_eq!(pool.len(), 0, "spawned entries never enter the pool");
}

#[tokio::test]
async fn take_reuses_a_prewarmed_entry() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);

    let warm_dir = make_proc_dir(fx.root.path());
    pool.prewarm(
        fp,
        fx.spawner(warm_dir.clone(), cmd.clone(), fp, Arc::default()),
    )
    .await
    .unwrap();
    assert_eq!(pool.len(), 1);

    let spawned = Arc::new(AtomicBool::new(false));
    let entry = pool
        .take(
            fp,
            fx.spawner(make_proc_dir(fx.root.path()), cmd, fp, spawned.clone()),
        )
        .await
        .unwrap();

    assert!(!spawned.load(Ordering::SeqCst), "warm entry must be reused");
    assert_eq!(entry.proc_dir(), warm_dir.as_path());
    assert_eq!(pool.len(), 0);
}

#[tokio::test]
async fn entries_are_keyed_by_fingerprint() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);
    let other_cmd = vec!["/bin/sleep".to_string(), "61".to_string()];
    let other_fp = CommandFingerprint::of(&other_cmd);

    let warm_dir = make_proc_dir(fx.root.path());
    pool.prewarm(
        fp,
        fx.spawner(warm_dir.clone(), cmd, fp, Arc::default()),
    )
    .await
    .unwrap();

    let spawned = Arc::new(AtomicBool::new(false));
    let entry = pool
        .take(
            other_fp,
            fx.spawner(
                make_proc_dir(fx.root.path()),
                other_cmd,
                other_fp,
                spawned.clone(),
            ),
        )
        .await
        .unwrap();

    assert!(spawned.load(Ordering::SeqCst));
    assert_ne!(entry.proc_dir(), warm_dir.as_path());
    assert_eq!(pool.len(), 1, "the other fingerprint's entry stays pooled");
}

#[tokio::test]
async fn the_pool_never_exceeds_max_count() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);

    let mut dirs = Vec::new();
    for _ in 0..3 {
        let dir = make_proc_dir(fx.root.path());
        dirs.push(dir.clone());
        pool.prewarm(fp, fx.spawner(dir, cmd.clone(), fp, Arc::default()))
            .await
            .unwrap();
        // Entry ages are wall-clock timestamps; keep them distinct.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(pool.len(), 2);
    assert!(!dirs[0].exists(), "the oldest entry is evicted with its dir");
    assert!(dirs[1].exists());
    assert!(dirs[2].exists());
}

#[tokio::test]
async fn zero_max_count_disables_prewarming() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 0);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);

    let spawned = Arc::new(AtomicBool::new(false));
    pool.prewarm(
        fp,
        fx.spawner(make_proc_dir(fx.root.path()), cmd, fp, spawned.clone()),
    )
    .await
    .unwrap();

    assert!(!spawned.load(Ordering::SeqCst));
    assert_eq!(pool.len(), 0);
}

#[tokio::test]
async fn expired_entries_are_evicted_at_take() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::ZERO, 2);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);

    let warm_dir = make_proc_dir(fx.root.path());
    pool.prewarm(
        fp,
        fx.spawner(warm_dir.clone(), cmd.clone(), fp, Arc::default()),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let spawned = Arc::new(AtomicBool::new(false));
    let entry = pool
        .take(
            fp,
            fx.spawner(make_proc_dir(fx.root.path()), cmd, fp, spawned.clone()),
        )
        .await
        .unwrap();

    assert!(spawned.load(Ordering::SeqCst), "the stale entry is skipped");
    assert!(!warm_dir.exists(), "eviction removes the working directory");
    assert_ne!(entry.proc_dir(), warm_dir.as_path());
}

#[tokio::test]
async fn dead_entries_are_evicted_at_take() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let short_cmd = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 0".to_string()];
    let fp = CommandFingerprint::of(&short_cmd);

    let warm_dir = make_proc_dir(fx.root.path());
    pool.prewarm(
        fp,
        fx.spawner(warm_dir.clone(), short_cmd, fp, Arc::default()),
    )
    .await
    .unwrap();

    // Let the pooled process exit on its own.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let spawned = Arc::new(AtomicBool::new(false));
    let _entry = pool
        .take(
            fp,
            fx.spawner(
                make_proc_dir(fx.root.path()),
                sleeper_cmd(),
                fp,
                spawned.clone(),
            ),
        )
        .await
        .unwrap();

    assert!(spawned.load(Ordering::SeqCst), "dead entries are skipped");
    assert!(!warm_dir.exists());
}

#[tokio::test]
async fn no_entry_is_handed_out_twice() {
    let fx = PoolFixture::new();
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let cmd = sleeper_cmd();
    let fp = CommandFingerprint::of(&cmd);

    pool.prewarm(
        fp,
        fx.spawner(make_proc_dir(fx.root.path()), cmd.clone(), fp, Arc::default()),
    )
    .await
    .unwrap();

    let first = pool
        .take(
            fp,
            fx.spawner(make_proc_dir(fx.root.path()), cmd.clone(), fp, Arc::default()),
        )
        .await
        .unwrap();
    let second = pool
        .take(
            fp,
            fx.spawner(make_proc_dir(fx.root.path()), cmd, fp, Arc::default()),
        )
        .await
        .unwrap();

    assert_ne!(first.proc_dir(), second.proc_dir());
}

#[tokio::test]
async fn failing_spawn_surfaces_from_take() {
    let pool = ProcessPool::new(Duration::from_secs(60), 2);
    let fp = CommandFingerprint::of(&["na"]);

    let result = pool
        .take(fp, || async {
            Err(runner_agent::ExecutionError::Launch(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such worker binary",
            )))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(pool.len(), 0);
}
