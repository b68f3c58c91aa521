//! Error taxonomy for the mirror engine.
//!
//! `NotFound` and `ReadOnly` are expected outcomes of normal operation and
//! are returned synchronously. `Io` wraps a physical stat/open/read failure
//! and is surfaced to the foreground caller without retry. `Invariant` marks
//! a defect in cache-pool accounting, not a recoverable runtime condition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such virtual path")]
    NotFound,

    #[error("mirror is read-only")]
    ReadOnly,

    #[error("stale or unknown file handle")]
    BadHandle,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cache pool invariant violated: {0}")]
    Invariant(&'static str),
}

impl EngineError {
    /// Map to the errno reported through the FUSE boundary.
    pub fn errno(&self) -> i32 {
        match self {
            EngineError::NotFound => libc::ENOENT,
            EngineError::ReadOnly => libc::EROFS,
            EngineError::BadHandle => libc::EBADF,
            EngineError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            EngineError::Invariant(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
