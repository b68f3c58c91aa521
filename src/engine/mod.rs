//! Filesystem operation dispatcher.
//!
//! `MirrorEngine` composes the overlay index, the cache pool, and the
//! prefetch scheduler into the operation set the transport invokes. There is
//! no per-path state machine: behavior falls out of the current overlay and
//! pool state. The engine owns two mutual-exclusion scopes (overlay and
//! pool) plus small maps for path->inode and open handles; physical I/O
//! always runs outside those locks.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::overlay::{OverlayIndex, OverlayStatus, join_path, norm_path, split_dir_file};
use crate::pool::{CachePool, CompressionPolicy};
use crate::prefetch::{PrefetchConfig, PrefetchScheduler};

/// Mount-time configuration. Everything else about the engine's behavior is
/// derived from overlay and pool state at run time.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// Physical source tree; never mutated by the engine.
    pub source: PathBuf,
    /// Cache pool byte budget.
    pub capacity: u64,
    pub compression: CompressionPolicy,
    pub prefetch: PrefetchConfig,
    /// Cap on names warmed per directory listing.
    pub readdir_warm_limit: usize,
}

impl MirrorConfig {
    pub fn new<P: Into<PathBuf>>(source: P) -> Self {
        Self {
            source: source.into(),
            capacity: 4 * 1024 * 1024 * 1024,
            compression: CompressionPolicy::default(),
            prefetch: PrefetchConfig::default(),
            readdir_warm_limit: 15,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata returned by `getattr`; `ino` is the physical inode (0 for
/// synthesized virtual directories).
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub ino: u64,
    pub size: u64,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

pub struct MirrorEngine {
    overlay: Mutex<OverlayIndex>,
    pool: Arc<CachePool>,
    prefetch: PrefetchScheduler,
    /// Virtual path -> physical inode, learned opportunistically on getattr.
    path_inodes: Mutex<HashMap<String, u64>>,
    handles: Mutex<HashMap<u64, Arc<std::fs::File>>>,
    next_fh: AtomicU64,
    readdir_warm_limit: usize,
}

impl MirrorEngine {
    /// Build the engine and spawn its prefetch workers. Must run inside a
    /// tokio runtime. All state lives for exactly the mount's lifetime.
    pub fn new(cfg: MirrorConfig) -> Self {
        let pool = Arc::new(CachePool::new(cfg.capacity, cfg.compression));
        let prefetch = PrefetchScheduler::start(pool.clone(), cfg.prefetch);
        Self {
            overlay: Mutex::new(OverlayIndex::new(&cfg.source)),
            pool,
            prefetch,
            path_inodes: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            readdir_warm_limit: cfg.readdir_warm_limit,
        }
    }

    pub fn pool(&self) -> &CachePool {
        &self.pool
    }

    /// Test hook: wait for background warming to settle.
    pub async fn drain_prefetch(&self) {
        self.prefetch.drain().await
    }

    /// Whether a virtual path currently exists: overlay verdict first, then
    /// a physical check on the resolved target.
    pub async fn exists(&self, path: &str) -> bool {
        let (status, physical) = {
            let ov = self.overlay.lock().unwrap();
            (ov.status(path), ov.resolve(path))
        };
        match status {
            OverlayStatus::Deleted => false,
            OverlayStatus::VirtualDir => true,
            OverlayStatus::Passthrough => tokio::fs::symlink_metadata(physical).await.is_ok(),
        }
    }

    pub async fn getattr(&self, path: &str) -> Result<FileStat> {
        let path = norm_path(path);
        let (parent, _) = split_dir_file(&path);
        let (status, physical, parent_physical) = {
            let ov = self.overlay.lock().unwrap();
            (ov.status(&path), ov.resolve(&path), ov.resolve(&parent))
        };
        match status {
            OverlayStatus::Deleted => Err(EngineError::NotFound),
            OverlayStatus::VirtualDir => Ok(synthesized_dir_stat()),
            OverlayStatus::Passthrough => {
                let meta = tokio::fs::symlink_metadata(&physical)
                    .await
                    .map_err(not_found_or_io)?;
                self.path_inodes.lock().unwrap().insert(path, meta.ino());
                // Metadata traffic doubles as the predictive warming signal.
                self.prefetch.on_directory_enter(&parent, parent_physical);
                Ok(stat_from_metadata(&meta))
            }
        }
    }

    /// List a directory: physical names (unless the directory is RAM-only),
    /// overlay-created children, minus virtually deleted names, plus "." and
    /// "..". Warms up to the first `readdir_warm_limit` entries.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = norm_path(path);
        let (status, ram_only, physical) = {
            let ov = self.overlay.lock().unwrap();
            (ov.status(&path), ov.is_virtual_dir(&path), ov.resolve(&path))
        };
        if status == OverlayStatus::Deleted {
            return Err(EngineError::NotFound);
        }

        let mut names: BTreeMap<String, FileKind> = BTreeMap::new();
        let mut physical_missing = false;
        if !ram_only {
            match tokio::fs::read_dir(&physical).await {
                Ok(mut rd) => {
                    while let Some(entry) = rd.next_entry().await.map_err(EngineError::Io)? {
                        let kind = entry.file_type().await.map(kind_from_file_type).unwrap_or(FileKind::Other);
                        names.insert(entry.file_name().to_string_lossy().into_owned(), kind);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => physical_missing = true,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }

        // Overlay pass: drop hidden names, collect overlay children and the
        // physical targets needed for kinds and warming.
        let (virtual_children, warm_targets) = {
            let ov = self.overlay.lock().unwrap();
            names.retain(|name, _| !ov.is_hidden(&join_path(&path, name)));
            let children: Vec<(String, bool, PathBuf)> = ov
                .virtual_children(&path)
                .into_iter()
                .map(|name| {
                    let full = join_path(&path, name.as_str());
                    (name.clone(), ov.is_virtual_dir(&full), ov.resolve(&full))
                })
                .collect();
            // Warm physical survivors first, then move destinations, up to
            // the per-listing cap.
            let mut targets: Vec<PathBuf> = names
                .keys()
                .map(|name| ov.resolve(&join_path(&path, name)))
                .collect();
            targets.extend(
                children
                    .iter()
                    .filter(|(_, is_vdir, _)| !is_vdir)
                    .map(|(_, _, target)| target.clone()),
            );
            targets.truncate(self.readdir_warm_limit);
            (children, targets)
        };
        // The directory only has to exist somewhere: physically, as a
        // RAM-only directory, or through overlay-created children.
        if physical_missing && !ram_only && virtual_children.is_empty() {
            return Err(EngineError::NotFound);
        }

        for (name, is_vdir, target) in virtual_children {
            let kind = if is_vdir {
                FileKind::Dir
            } else {
                match tokio::fs::symlink_metadata(&target).await {
                    Ok(m) => kind_from_file_type(m.file_type()),
                    Err(_) => FileKind::File,
                }
            };
            names.insert(name, kind);
        }

        self.prefetch.warm(warm_targets);

        let mut out = vec![
            DirEntry { name: ".".into(), kind: FileKind::Dir },
            DirEntry { name: "..".into(), kind: FileKind::Dir },
        ];
        out.extend(names.into_iter().map(|(name, kind)| DirEntry { name, kind }));
        Ok(out)
    }

    /// Record a RAM-only directory. Nothing physical is created; always
    /// succeeds.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.overlay.lock().unwrap().declare_virtual_dir(path);
        Ok(())
    }

    /// File creation is never allowed on the mirror.
    pub fn create(&self, _path: &str) -> Result<u64> {
        Err(EngineError::ReadOnly)
    }

    /// Overlay move; the physical tree is untouched. Always succeeds.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.overlay.lock().unwrap().mark_moved(old, new);
        let mut inodes = self.path_inodes.lock().unwrap();
        inodes.remove(&norm_path(old));
        inodes.remove(&norm_path(new));
        Ok(())
    }

    /// Virtual deletion; the physical file survives. Always succeeds.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.overlay.lock().unwrap().mark_deleted(path);
        self.path_inodes.lock().unwrap().remove(&norm_path(path));
        Ok(())
    }

    /// Virtual directory removal; same bookkeeping as unlink.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.unlink(path)
    }

    /// Open the resolved physical file read-only and hand out a handle id.
    /// Any write-ish intent is rejected before touching the disk.
    pub async fn open(&self, path: &str, flags: u32) -> Result<u64> {
        let write_bits = (libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_CREAT | libc::O_TRUNC) as u32;
        if flags & write_bits != 0 {
            return Err(EngineError::ReadOnly);
        }
        let (status, physical) = {
            let ov = self.overlay.lock().unwrap();
            (ov.status(path), ov.resolve(path))
        };
        match status {
            OverlayStatus::Deleted => return Err(EngineError::NotFound),
            OverlayStatus::VirtualDir => {
                return Err(EngineError::Io(std::io::Error::from_raw_os_error(libc::EISDIR)));
            }
            OverlayStatus::Passthrough => {}
        }
        let file = tokio::fs::File::open(&physical)
            .await
            .map_err(not_found_or_io)?
            .into_std()
            .await;
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().insert(fh, Arc::new(file));
        Ok(fh)
    }

    /// Read path decision tree: serve from the pool when the requested range
    /// lies fully inside the materialized entry; otherwise fall through to a
    /// positioned physical read on the handle. A cold read at offset 0 also
    /// queues background population, but the current call is still answered
    /// from physical storage.
    pub async fn read(&self, path: &str, len: usize, offset: u64, fh: u64) -> Result<Bytes> {
        let path = norm_path(path);
        let ino = self.path_inodes.lock().unwrap().get(&path).copied();
        if let Some(ino) = ino
            && let Some(entry) = self.pool.get(ino)
        {
            let buf = self.pool.materialize(&entry)?;
            let end = offset.saturating_add(len as u64);
            // A range that is not fully contained never yields a short or
            // zero-padded cache answer.
            if end <= buf.len() as u64 {
                return Ok(buf.slice(offset as usize..end as usize));
            }
        } else if offset == 0 {
            let physical = self.overlay.lock().unwrap().resolve(&path);
            self.prefetch.warm([physical]);
        }

        let file = self
            .handles
            .lock()
            .unwrap()
            .get(&fh)
            .cloned()
            .ok_or(EngineError::BadHandle)?;
        let data = tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;
        Ok(Bytes::from(data))
    }

    /// Drop a handle. Closing is the drop of the last `Arc` clone; a stale
    /// id is not an error.
    pub fn release(&self, fh: u64) -> Result<()> {
        self.handles.lock().unwrap().remove(&fh);
        Ok(())
    }
}

fn not_found_or_io(e: std::io::Error) -> EngineError {
    if e.kind() == std::io::ErrorKind::NotFound {
        EngineError::NotFound
    } else {
        EngineError::Io(e)
    }
}

fn kind_from_file_type(ft: std::fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Dir
    } else if ft.is_file() {
        FileKind::File
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Other
    }
}

/// RAM-only directories have no physical backing; fixed small metadata with
/// current timestamps, owned by the mounting user.
fn synthesized_dir_stat() -> FileStat {
    let now = SystemTime::now();
    FileStat {
        ino: 0,
        size: 4096,
        kind: FileKind::Dir,
        perm: 0o755,
        nlink: 2,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        atime: now,
        mtime: now,
        ctime: now,
    }
}

fn stat_from_metadata(meta: &std::fs::Metadata) -> FileStat {
    FileStat {
        ino: meta.ino(),
        size: meta.size(),
        kind: kind_from_file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        atime: unix_time(meta.atime(), meta.atime_nsec()),
        mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
        ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
