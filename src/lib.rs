//! mirrorfs: a read-only FUSE mirror of a physical directory tree with an
//! in-memory overlay sandbox (virtual create/rename/delete that never touch
//! the source), a bounded RAM cache with transparent compression, and
//! background prefetch of sibling files on directory scan.

pub mod engine;
pub mod error;
pub mod fuse;
pub mod overlay;
pub mod pool;
pub mod prefetch;
