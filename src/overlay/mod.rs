//! In-memory overlay in front of a read-only physical source tree.
//!
//! The overlay records three kinds of facts about virtual paths: paths the
//! client deleted, directories that exist only in RAM, and paths that were
//! renamed (the new name redirects to the physical target captured at move
//! time). Nothing here touches the disk; callers resolve physical existence
//! themselves, outside the overlay lock.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Pure in-memory classification of a virtual path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayStatus {
    /// Virtually deleted and not re-created by a move; the path is gone.
    Deleted,
    /// A RAM-only directory with no physical backing.
    VirtualDir,
    /// Unknown to the overlay; defer to a physical check on the resolved path.
    Passthrough,
}

pub struct OverlayIndex {
    root: PathBuf,
    deleted: HashSet<String>,
    virtual_dirs: HashSet<String>,
    /// Virtual destination -> physical source captured when the move happened.
    moved: HashMap<String, PathBuf>,
}

/// Collapse empty segments so `/a//b/` and `/a/b` index the same entry.
pub fn norm_path(p: &str) -> String {
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Split a normalized path into (parent, basename). The root splits to ("/", "").
pub fn split_dir_file(path: &str) -> (String, String) {
    let n = path.rfind('/').unwrap_or(0);
    if n == 0 {
        ("/".into(), path[1..].into())
    } else {
        (path[..n].into(), path[n + 1..].into())
    }
}

/// Join a normalized directory path with a child basename.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

impl OverlayIndex {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            deleted: HashSet::new(),
            virtual_dirs: HashSet::new(),
            moved: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path to its physical location: either the redirect
    /// target recorded by a move, or the source root joined with the path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = norm_path(path);
        if let Some(target) = self.moved.get(&path) {
            return target.clone();
        }
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn status(&self, path: &str) -> OverlayStatus {
        let path = norm_path(path);
        if self.deleted.contains(&path) && !self.moved.contains_key(&path) {
            return OverlayStatus::Deleted;
        }
        if self.virtual_dirs.contains(&path) {
            return OverlayStatus::VirtualDir;
        }
        OverlayStatus::Passthrough
    }

    /// Idempotent virtual deletion. A deleted virtual directory is gone,
    /// not merely hidden, so it also leaves the virtual-dir set.
    pub fn mark_deleted(&mut self, path: &str) {
        let path = norm_path(path);
        self.virtual_dirs.remove(&path);
        self.deleted.insert(path);
    }

    /// Record a move: the redirect target is resolved eagerly here, so later
    /// overlay changes to `old` cannot retarget `new`. The source becomes
    /// virtually deleted; deletion and redirection are tracked independently.
    pub fn mark_moved(&mut self, old: &str, new: &str) {
        let old = norm_path(old);
        let new = norm_path(new);
        let physical = self.resolve(&old);
        // A destination can be at most one of virtual dir / move target.
        self.virtual_dirs.remove(&new);
        self.moved.insert(new.clone(), physical);
        self.deleted.remove(&new);
        self.mark_deleted(&old);
    }

    /// Declare a RAM-only directory. Metadata for it is synthesized upstream.
    pub fn declare_virtual_dir(&mut self, path: &str) {
        let path = norm_path(path);
        self.moved.remove(&path);
        self.deleted.remove(&path);
        self.virtual_dirs.insert(path);
    }

    /// Basenames of overlay-created entries (virtual dirs and move
    /// destinations) that live directly under `dir`.
    pub fn virtual_children(&self, dir: &str) -> Vec<String> {
        let dir = norm_path(dir);
        let mut out = Vec::new();
        for vdir in &self.virtual_dirs {
            let (parent, name) = split_dir_file(vdir);
            if parent == dir && !name.is_empty() {
                out.push(name);
            }
        }
        for dest in self.moved.keys() {
            let (parent, name) = split_dir_file(dest);
            if parent == dir && !name.is_empty() {
                out.push(name);
            }
        }
        out
    }

    /// Whether a full virtual path must be filtered out of directory
    /// listings: deleted, unless the same path is also a move destination.
    pub fn is_hidden(&self, path: &str) -> bool {
        let path = norm_path(path);
        self.deleted.contains(&path) && !self.moved.contains_key(&path)
    }

    pub fn is_virtual_dir(&self, path: &str) -> bool {
        self.virtual_dirs.contains(&norm_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_joins_root_and_follows_moves() {
        let mut ov = OverlayIndex::new("/data");
        assert_eq!(ov.resolve("/a/b.txt"), PathBuf::from("/data/a/b.txt"));

        ov.mark_moved("/a/b.txt", "/c/renamed.txt");
        assert_eq!(ov.resolve("/c/renamed.txt"), PathBuf::from("/data/a/b.txt"));
        // The source is deleted but its physical location is unchanged.
        assert_eq!(ov.status("/a/b.txt"), OverlayStatus::Deleted);
        assert_eq!(ov.resolve("/a/b.txt"), PathBuf::from("/data/a/b.txt"));
    }

    #[test]
    fn move_target_is_captured_eagerly() {
        let mut ov = OverlayIndex::new("/data");
        ov.mark_moved("/x", "/y");
        ov.mark_moved("/y", "/z");
        // /z points at the physical target /y had at its own move time.
        assert_eq!(ov.resolve("/z"), PathBuf::from("/data/x"));
        // /y is marked deleted but stays a redirect key: deletion and
        // redirection are tracked independently, so it still resolves.
        assert_eq!(ov.status("/y"), OverlayStatus::Passthrough);
        assert_eq!(ov.resolve("/y"), PathBuf::from("/data/x"));
        assert_eq!(ov.status("/x"), OverlayStatus::Deleted);
    }

    #[test]
    fn deleted_virtual_dir_is_gone() {
        let mut ov = OverlayIndex::new("/data");
        ov.declare_virtual_dir("/sandbox");
        assert_eq!(ov.status("/sandbox"), OverlayStatus::VirtualDir);

        ov.mark_deleted("/sandbox");
        assert_eq!(ov.status("/sandbox"), OverlayStatus::Deleted);
        assert!(!ov.is_virtual_dir("/sandbox"));
        // Idempotent.
        ov.mark_deleted("/sandbox");
        assert_eq!(ov.status("/sandbox"), OverlayStatus::Deleted);
    }

    #[test]
    fn moving_onto_a_deleted_name_revives_it() {
        let mut ov = OverlayIndex::new("/data");
        ov.mark_deleted("/gone.txt");
        assert!(ov.is_hidden("/gone.txt"));

        ov.mark_moved("/keep.txt", "/gone.txt");
        assert!(!ov.is_hidden("/gone.txt"));
        assert_eq!(ov.status("/gone.txt"), OverlayStatus::Passthrough);
        assert_eq!(ov.resolve("/gone.txt"), PathBuf::from("/data/keep.txt"));
    }

    #[test]
    fn virtual_children_lists_dirs_and_move_destinations() {
        let mut ov = OverlayIndex::new("/data");
        ov.declare_virtual_dir("/top/ramdir");
        ov.declare_virtual_dir("/top/nested/deeper");
        ov.mark_moved("/old.bin", "/top/new.bin");

        let mut names = ov.virtual_children("/top");
        names.sort();
        assert_eq!(names, vec!["new.bin".to_string(), "ramdir".to_string()]);
        assert_eq!(ov.virtual_children("/elsewhere"), Vec::<String>::new());
    }

    #[test]
    fn path_normalization() {
        assert_eq!(norm_path("/a//b/"), "/a/b");
        assert_eq!(norm_path(""), "/");
        assert_eq!(split_dir_file("/a/b/c.txt"), ("/a/b".into(), "c.txt".into()));
        assert_eq!(split_dir_file("/c.txt"), ("/".into(), "c.txt".into()));
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }
}
