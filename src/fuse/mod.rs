//! FUSE adapter: translates rfuse3's inode-based protocol into the
//! path-based operations of [`MirrorEngine`].
//!
//! The adapter owns the only inode numbering the kernel ever sees: a table
//! mapping FUSE inode ids to virtual paths, allocated on lookup with the
//! root pinned at 1. Physical inode numbers stay internal to the engine's
//! cache keying and never leak into replies.

pub mod mount;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};

use crate::engine::{FileKind, FileStat, MirrorEngine};
use crate::error::EngineError;
use crate::overlay::{join_path, split_dir_file};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InodeTable {
    paths: HashMap<u64, String>,
    ids: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        let mut ids = HashMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        ids.insert("/".to_string(), ROOT_INO);
        Self {
            paths,
            ids,
            next: ROOT_INO + 1,
        }
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.ids.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.to_string());
        self.ids.insert(path.to_string(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn rekey(&mut self, old: &str, new: &str) {
        if let Some(ino) = self.ids.remove(old) {
            self.ids.insert(new.to_string(), ino);
            self.paths.insert(ino, new.to_string());
        }
    }
}

pub struct MirrorFs {
    engine: MirrorEngine,
    inodes: Mutex<InodeTable>,
}

impl MirrorFs {
    pub fn new(engine: MirrorEngine) -> Self {
        Self {
            engine,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    pub fn engine(&self) -> &MirrorEngine {
        &self.engine
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes
            .lock()
            .unwrap()
            .path_of(ino)
            .ok_or_else(|| libc::ENOENT.into())
    }

    fn ino_for(&self, path: &str) -> u64 {
        self.inodes.lock().unwrap().ino_for(path)
    }

    async fn attr_of(&self, path: &str, ino: u64) -> FuseResult<FileAttr> {
        let st = self.engine.getattr(path).await.map_err(to_errno)?;
        Ok(stat_to_attr(&st, ino))
    }
}

fn to_errno(e: EngineError) -> rfuse3::Errno {
    e.errno().into()
}

fn kind_to_fuse(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::Dir => FuseFileType::Directory,
        FileKind::File => FuseFileType::RegularFile,
        FileKind::Symlink => FuseFileType::Symlink,
        FileKind::Other => FuseFileType::RegularFile,
    }
}

fn stat_to_attr(st: &FileStat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.size,
        blocks: st.size.div_ceil(512),
        atime: Timestamp::from(st.atime),
        mtime: Timestamp::from(st.mtime),
        ctime: Timestamp::from(st.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(st.ctime),
        kind: kind_to_fuse(st.kind),
        perm: st.perm,
        nlink: st.nlink,
        uid: st.uid,
        gid: st.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

impl Filesystem for MirrorFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let parent_path = self.path_of(parent)?;
        let path = join_path(&parent_path, &name.to_string_lossy());
        let ino = self.ino_for(&path);
        let attr = self.attr_of(&path, ino).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let attr = self.attr_of(&path, ino).await?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    // The mirror never mutates metadata.
    async fn setattr(
        &self,
        _req: Request,
        _ino: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        Err(libc::EROFS.into())
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let parent_path = self.path_of(parent)?;
        let path = join_path(&parent_path, &name.to_string_lossy());
        self.engine.mkdir(&path).map_err(to_errno)?;
        let ino = self.ino_for(&path);
        let attr = self.attr_of(&path, ino).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<rfuse3::raw::reply::ReplyCreated> {
        let parent_path = self.path_of(parent)?;
        let path = join_path(&parent_path, &name.to_string_lossy());
        match self.engine.create(&path) {
            Err(e) => Err(to_errno(e)),
            Ok(_) => Err(libc::EROFS.into()),
        }
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent_path = self.path_of(parent)?;
        let path = join_path(&parent_path, &name.to_string_lossy());
        self.engine.unlink(&path).map_err(to_errno)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let parent_path = self.path_of(parent)?;
        let path = join_path(&parent_path, &name.to_string_lossy());
        self.engine.rmdir(&path).map_err(to_errno)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old_parent_path = self.path_of(parent)?;
        let new_parent_path = self.path_of(new_parent)?;
        let old = join_path(&old_parent_path, &name.to_string_lossy());
        let new = join_path(&new_parent_path, &new_name.to_string_lossy());
        self.engine.rename(&old, &new).map_err(to_errno)?;
        self.inodes.lock().unwrap().rekey(&old, &new);
        Ok(())
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let fh = self.engine.open(&path, flags).await.map_err(to_errno)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let data = self
            .engine
            .read(&path, size as usize, offset, fh)
            .await
            .map_err(to_errno)?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        _fh: u64,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<rfuse3::raw::reply::ReplyWrite> {
        Err(libc::EROFS.into())
    }

    async fn release(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.engine.release(fh).map_err(to_errno)
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let st = self.engine.getattr(&path).await.map_err(to_errno)?;
        if st.kind != FileKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path_of(ino)?;
        let entries = self.engine.readdir(&path).await.map_err(to_errno)?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len());
        for (i, e) in entries.iter().enumerate() {
            let entry_ino = match e.name.as_str() {
                "." => ino,
                ".." => self.ino_for(&split_dir_file(&path).0),
                name => self.ino_for(&join_path(&path, name)),
            };
            all.push(DirectoryEntry {
                inode: entry_ino,
                kind: kind_to_fuse(e.kind),
                name: OsString::from(e.name.clone()),
                offset: (i as i64) + 1,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let path = self.path_of(ino)?;
        let entries = self.engine.readdir(&path).await.map_err(to_errno)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len());
        let mut offset_cursor = 0i64;
        for e in &entries {
            let (entry_ino, entry_path) = match e.name.as_str() {
                "." => (ino, path.clone()),
                ".." => {
                    let parent = split_dir_file(&path).0;
                    (self.ino_for(&parent), parent)
                }
                name => {
                    let child = join_path(&path, name);
                    (self.ino_for(&child), child)
                }
            };
            // Entries that vanish between listing and stat are dropped.
            let Ok(attr) = self.attr_of(&entry_path, entry_ino).await else {
                continue;
            };
            offset_cursor += 1;
            all.push(DirectoryEntryPlus {
                inode: entry_ino,
                generation: 0,
                kind: kind_to_fuse(e.kind),
                name: OsString::from(e.name.clone()),
                offset: offset_cursor,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = offset as usize;
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Conservative constants; the mirror has no real block accounting.
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    // Stateless teardown paths: nothing to sync on a read-only mirror.
    async fn flush(&self, _req: Request, _ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(&self, _req: Request, _ino: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, _ino: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MirrorConfig;
    use futures_util::StreamExt;
    use std::fs;

    fn mirror_for(dir: &std::path::Path) -> MirrorFs {
        let mut cfg = MirrorConfig::new(dir);
        cfg.capacity = 16 * 1024 * 1024;
        MirrorFs::new(MirrorEngine::new(cfg))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lookup_read_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        let fs_ = mirror_for(dir.path());

        let entry = fs_
            .lookup(Request::default(), ROOT_INO, OsStr::new("hello.txt"))
            .await
            .unwrap();
        assert_eq!(entry.attr.kind, FuseFileType::RegularFile);
        assert_eq!(entry.attr.size, 8);

        let opened = fs_.open(Request::default(), entry.attr.ino, 0).await.unwrap();
        let data = fs_
            .read(Request::default(), entry.attr.ino, opened.fh, 0, 8)
            .await
            .unwrap();
        assert_eq!(&data.data[..], b"hi there");
        fs_.release(Request::default(), entry.attr.ino, opened.fh, 0, 0, false)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_paths_report_read_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        let fs_ = mirror_for(dir.path());

        let err = fs_
            .create(Request::default(), ROOT_INO, OsStr::new("new"), 0o644, 0)
            .await
            .unwrap_err();
        let ioerr: std::io::Error = err.into();
        assert_eq!(ioerr.raw_os_error(), Some(libc::EROFS));

        let entry = fs_
            .lookup(Request::default(), ROOT_INO, OsStr::new("f"))
            .await
            .unwrap();
        let err = fs_
            .open(Request::default(), entry.attr.ino, libc::O_RDWR as u32)
            .await
            .unwrap_err();
        let ioerr: std::io::Error = err.into();
        assert_eq!(ioerr.raw_os_error(), Some(libc::EROFS));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readdir_reflects_overlay_mutations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        let fs_ = mirror_for(dir.path());

        fs_.unlink(Request::default(), ROOT_INO, OsStr::new("a.txt"))
            .await
            .unwrap();
        fs_.mkdir(Request::default(), ROOT_INO, OsStr::new("ramdir"), 0o755, 0)
            .await
            .unwrap();
        fs_.rename(
            Request::default(),
            ROOT_INO,
            OsStr::new("b.txt"),
            ROOT_INO,
            OsStr::new("c.txt"),
        )
        .await
        .unwrap();

        let reply = fs_
            .readdir(Request::default(), ROOT_INO, 0, 0)
            .await
            .unwrap();
        let mut seen = Vec::new();
        let mut entries = reply.entries;
        while let Some(e) = entries.next().await {
            seen.push(e.unwrap().name.to_string_lossy().into_owned());
        }
        assert!(seen.contains(&"ramdir".to_string()));
        assert!(seen.contains(&"c.txt".to_string()));
        assert!(!seen.contains(&"a.txt".to_string()));
        assert!(!seen.contains(&"b.txt".to_string()));
        // Physical tree untouched.
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
        assert!(!dir.path().join("ramdir").exists());
    }
}
