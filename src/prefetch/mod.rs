//! Background cache warming.
//!
//! A fixed pool of tokio workers consumes a bounded queue of fetch requests.
//! Entering a new directory queues the first few files of that directory;
//! readdir and cold reads queue explicit paths. Every request resolves to an
//! explicit [`FetchOutcome`] that is logged and dropped — background work
//! never surfaces errors to the operation that triggered it, and a fetch
//! that loses a race to an already-populated inode is a no-op.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::AsyncReadExt;
use tokio::sync::{Notify, mpsc};

use crate::pool::CachePool;

#[derive(Clone, Copy, Debug)]
pub struct PrefetchConfig {
    /// Worker tasks draining the queue.
    pub workers: usize,
    /// Queue depth; a full queue drops new requests instead of blocking.
    pub queue_depth: usize,
    /// Files queued per directory-enter event.
    pub scan_width: usize,
    /// Upper bound on bytes read per file.
    pub max_fetch_bytes: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            scan_width: 5,
            max_fetch_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Terminal state of one background fetch. Observed (logged), never
/// propagated.
#[derive(Debug)]
enum FetchOutcome {
    Cached { bytes: usize },
    AlreadyCached,
    Skipped,
    Failed(std::io::Error),
}

/// Cloneable handle shared by enqueueing call sites and listing tasks.
#[derive(Clone)]
struct QueueHandle {
    tx: mpsc::Sender<PathBuf>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl QueueHandle {
    fn enqueue(&self, path: PathBuf) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.try_send(path) {
            log::debug!("prefetch: queue full, dropping request: {e}");
            self.finish_one();
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct PrefetchScheduler {
    handle: QueueHandle,
    last_dir: Mutex<Option<String>>,
    scan_width: usize,
}

impl PrefetchScheduler {
    /// Spawn the worker pool on the current tokio runtime.
    pub fn start(pool: Arc<CachePool>, cfg: PrefetchConfig) -> Self {
        let (tx, rx) = mpsc::channel::<PathBuf>(cfg.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handle = QueueHandle {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };

        for _ in 0..cfg.workers.max(1) {
            let rx = rx.clone();
            let pool = pool.clone();
            let handle = handle.clone();
            let max = cfg.max_fetch_bytes;
            tokio::spawn(async move {
                loop {
                    let req = { rx.lock().await.recv().await };
                    let Some(path) = req else { break };
                    match fetch_into_pool(&pool, &path, max).await {
                        FetchOutcome::Cached { bytes } => {
                            log::debug!("prefetch: cached {} ({bytes} bytes)", path.display())
                        }
                        FetchOutcome::AlreadyCached => {
                            log::debug!("prefetch: {} already pooled", path.display())
                        }
                        FetchOutcome::Skipped => {}
                        FetchOutcome::Failed(e) => {
                            log::warn!("prefetch: {} failed: {e}", path.display())
                        }
                    }
                    handle.finish_one();
                }
            });
        }

        Self {
            handle,
            last_dir: Mutex::new(None),
            scan_width: cfg.scan_width,
        }
    }

    /// Directory-enter hook: when `virtual_dir` differs from the last
    /// observed directory, list `physical_dir` in the background and queue
    /// its first `scan_width` regular files in name order. Returns without
    /// blocking on any I/O.
    pub fn on_directory_enter(&self, virtual_dir: &str, physical_dir: PathBuf) {
        {
            let mut last = self.last_dir.lock().unwrap();
            if last.as_deref() == Some(virtual_dir) {
                return;
            }
            *last = Some(virtual_dir.to_string());
        }

        let handle = self.handle.clone();
        let width = self.scan_width;
        // The listing itself counts as pending work so drain() covers it.
        handle.pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            match list_files_sorted(&physical_dir).await {
                Ok(files) => {
                    for path in files.into_iter().take(width) {
                        handle.enqueue(path);
                    }
                }
                Err(e) => log::debug!("prefetch: scan of {} failed: {e}", physical_dir.display()),
            }
            handle.finish_one();
        });
    }

    /// Queue explicit physical paths for warming.
    pub fn warm<I>(&self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            self.handle.enqueue(path);
        }
    }

    /// Wait until the queue is empty and all workers are idle. Test hook:
    /// lets callers drain deterministically instead of sleeping.
    pub async fn drain(&self) {
        loop {
            let notified = self.handle.idle.notified();
            if self.handle.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn list_files_sorted(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut rd = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// get-miss -> physical read -> put. Races with other fetches are resolved
/// by the pool's own put semantics; no de-duplication happens here.
async fn fetch_into_pool(pool: &CachePool, path: &Path, max_fetch_bytes: u64) -> FetchOutcome {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => return FetchOutcome::Failed(e),
    };
    if !meta.is_file() {
        return FetchOutcome::Skipped;
    }
    // Lookup doubles as a recency touch for warm entries.
    if pool.get(meta.ino()).is_some() {
        return FetchOutcome::AlreadyCached;
    }

    let take = meta.len().min(max_fetch_bytes);
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => return FetchOutcome::Failed(e),
    };
    let mut buf = Vec::with_capacity(take as usize);
    if let Err(e) = file.take(take).read_to_end(&mut buf).await {
        return FetchOutcome::Failed(e);
    }
    let bytes = buf.len();
    pool.put(meta.ino(), buf);
    FetchOutcome::Cached { bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::CompressionPolicy;
    use std::fs;

    fn test_pool() -> Arc<CachePool> {
        Arc::new(CachePool::new(
            64 * 1024 * 1024,
            CompressionPolicy {
                enabled: false,
                ..Default::default()
            },
        ))
    }

    fn ino_of(path: &Path) -> u64 {
        fs::metadata(path).unwrap().ino()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn warm_populates_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"bravo").unwrap();

        let pool = test_pool();
        let sched = PrefetchScheduler::start(pool.clone(), PrefetchConfig::default());
        sched.warm([a.clone(), b.clone()]);
        sched.drain().await;

        for (path, content) in [(&a, &b"alpha"[..]), (&b, &b"bravo"[..])] {
            let entry = pool.get(ino_of(path)).expect("warmed");
            assert_eq!(&pool.materialize(&entry).unwrap()[..], content);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn directory_enter_queues_first_files_once() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.bin", "a.bin", "b.bin", "d.bin"] {
            fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }

        let pool = test_pool();
        let cfg = PrefetchConfig {
            scan_width: 2,
            ..Default::default()
        };
        let sched = PrefetchScheduler::start(pool.clone(), cfg);
        sched.on_directory_enter("/", dir.path().to_path_buf());
        sched.drain().await;

        // Deterministic order: first two names sort ahead.
        assert!(pool.contains(ino_of(&dir.path().join("a.bin"))));
        assert!(pool.contains(ino_of(&dir.path().join("b.bin"))));
        assert!(!pool.contains(ino_of(&dir.path().join("c.bin"))));

        // Re-entering the same directory is a no-op.
        fs::write(dir.path().join("0.bin"), b"late").unwrap();
        sched.on_directory_enter("/", dir.path().to_path_buf());
        sched.drain().await;
        assert!(!pool.contains(ino_of(&dir.path().join("0.bin"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_are_swallowed() {
        let pool = test_pool();
        let sched = PrefetchScheduler::start(pool.clone(), PrefetchConfig::default());
        sched.warm([PathBuf::from("/definitely/not/here")]);
        sched.on_directory_enter("/missing", PathBuf::from("/also/not/here"));
        sched.drain().await;
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_fetches_leave_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("hot.bin");
        fs::write(&f, vec![7u8; 1024]).unwrap();

        let pool = test_pool();
        let sched = PrefetchScheduler::start(pool.clone(), PrefetchConfig::default());
        sched.warm(std::iter::repeat_n(f.clone(), 16));
        sched.drain().await;

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.checked_usage().unwrap(), 1024);
    }
}
