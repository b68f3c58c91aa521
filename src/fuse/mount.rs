//! Mount helpers for starting/stopping FUSE.
//!
//! Thin wrappers over rfuse3 raw Session APIs. On Linux the mount is
//! unprivileged via fusermount3; other targets get a stub error.

use std::path::Path;

use rfuse3::MountOptions;

use crate::fuse::MirrorFs;

fn default_mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mut mo = MountOptions::default();
    mo.fs_name("mirrorfs")
        .read_only(true)
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    mo
}

/// Mount a mirror instance on the given empty directory.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: MirrorFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: MirrorFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
