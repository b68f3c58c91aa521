//! Bounded RAM pool of file content, keyed by physical inode.
//!
//! Entries are recency-ordered; inserting past the byte budget evicts from
//! the least-recently-used end. Payloads are stored gzip-compressed when a
//! sampled probe of the leading bytes says compression pays off, raw
//! otherwise. All bookkeeping (ordering, usage counter, entry contents)
//! mutates inside one mutex scope per pool; codec work runs on the caller's
//! own copy of the bytes before the lock is taken.

use std::io::{Read, Write};
use std::sync::Mutex;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lru::LruCache;

use crate::error::{EngineError, Result};

/// Compression heuristics. The sample length and ratio are tunables, not
/// correctness invariants; `materialize` honors whatever `put` decided.
#[derive(Clone, Copy, Debug)]
pub struct CompressionPolicy {
    pub enabled: bool,
    /// Leading bytes probed to decide whether the full payload compresses.
    pub sample_len: usize,
    /// Compress the full payload only when the probe shrinks below this
    /// fraction of the sample.
    pub max_sample_ratio: f64,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_len: 1024 * 1024,
            max_sample_ratio: 0.90,
        }
    }
}

/// One cached payload. `bytes` is the stored (possibly compressed) form;
/// cloning is cheap since `Bytes` is reference-counted.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub compressed: bool,
    pub original_len: usize,
}

impl CacheEntry {
    fn stored_len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

struct PoolInner {
    entries: LruCache<u64, CacheEntry>,
    usage: u64,
}

pub struct CachePool {
    capacity: u64,
    policy: CompressionPolicy,
    inner: Mutex<PoolInner>,
}

impl CachePool {
    pub fn new(capacity: u64, policy: CompressionPolicy) -> Self {
        Self {
            capacity,
            policy,
            inner: Mutex::new(PoolInner {
                entries: LruCache::unbounded(),
                usage: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Look up an entry. A hit promotes the inode to most-recently-used.
    pub fn get(&self, ino: u64) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.get(&ino).cloned()
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.inner.lock().unwrap().entries.peek(&ino).is_some()
    }

    /// Insert raw file content. The codec decision and the compression pass
    /// happen before the lock; eviction and the usage counter update happen
    /// under it. Replacing an existing entry for the same inode reclaims the
    /// old bytes first, so concurrent puts for one inode leave one entry.
    ///
    /// Capacity is a target, not a hard rejection: a single entry larger
    /// than the whole pool is admitted after everything else is evicted.
    pub fn put(&self, ino: u64, raw: Vec<u8>) {
        let entry = self.encode(raw);
        let new_size = entry.stored_len();

        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.entries.pop(&ino) {
            inner.usage -= old.stored_len();
        }
        while inner.usage + new_size > self.capacity && !inner.entries.is_empty() {
            if let Some((evicted_ino, evicted)) = inner.entries.pop_lru() {
                inner.usage -= evicted.stored_len();
                log::debug!("pool: evicted inode {evicted_ino} ({} bytes)", evicted.stored_len());
            }
        }
        inner.entries.put(ino, entry);
        inner.usage += new_size;
    }

    /// Recover the original bytes of an entry.
    pub fn materialize(&self, entry: &CacheEntry) -> Result<Bytes> {
        if !entry.compressed {
            return Ok(entry.bytes.clone());
        }
        let mut out = Vec::with_capacity(entry.original_len);
        GzDecoder::new(&entry.bytes[..]).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }

    /// Current stored-byte total.
    pub fn usage(&self) -> u64 {
        self.inner.lock().unwrap().usage
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usage counter cross-checked against the actual stored sizes. A
    /// mismatch is an accounting defect, never a runtime condition.
    pub fn checked_usage(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        let actual: u64 = inner.entries.iter().map(|(_, e)| e.stored_len()).sum();
        if actual != inner.usage {
            return Err(EngineError::Invariant("usage counter diverged from stored sizes"));
        }
        Ok(inner.usage)
    }

    fn encode(&self, raw: Vec<u8>) -> CacheEntry {
        let original_len = raw.len();
        if self.policy.enabled && original_len > 0 {
            let probe = &raw[..original_len.min(self.policy.sample_len)];
            match gzip(probe) {
                Ok(compressed_probe)
                    if (compressed_probe.len() as f64)
                        < probe.len() as f64 * self.policy.max_sample_ratio =>
                {
                    if let Ok(full) = gzip(&raw) {
                        return CacheEntry {
                            bytes: Bytes::from(full),
                            compressed: true,
                            original_len,
                        };
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("pool: compression probe failed, storing raw: {e}"),
            }
        }
        CacheEntry {
            bytes: Bytes::from(raw),
            compressed: false,
            original_len,
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::fast());
    enc.write_all(data)?;
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_policy() -> CompressionPolicy {
        CompressionPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    /// Deterministic bytes that gzip cannot shrink below the 0.90 threshold.
    fn incompressible(len: usize) -> Vec<u8> {
        let mut state = 0x9e3779b97f4a7c15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn lru_eviction_under_pressure() {
        let pool = CachePool::new(100, raw_policy());
        pool.put(1, vec![1u8; 40]);
        pool.put(2, vec![2u8; 40]);
        // Touch 1 so 2 becomes the eviction candidate.
        assert!(pool.get(1).is_some());
        pool.put(3, vec![3u8; 40]);

        assert!(pool.contains(1));
        assert!(!pool.contains(2));
        assert!(pool.contains(3));
        assert!(pool.usage() <= 100);
        assert_eq!(pool.checked_usage().unwrap(), 80);
    }

    #[test]
    fn replacing_an_inode_reclaims_its_bytes() {
        let pool = CachePool::new(100, raw_policy());
        pool.put(7, vec![0u8; 60]);
        pool.put(7, vec![0u8; 30]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.checked_usage().unwrap(), 30);
    }

    #[test]
    fn single_oversized_entry_is_admitted() {
        let pool = CachePool::new(64, raw_policy());
        pool.put(1, vec![0u8; 10]);
        pool.put(2, vec![0u8; 500]);
        assert!(!pool.contains(1));
        assert!(pool.contains(2));
        assert_eq!(pool.checked_usage().unwrap(), 500);
    }

    #[test]
    fn compressible_payload_round_trips_compressed() {
        let policy = CompressionPolicy {
            sample_len: 4096,
            ..Default::default()
        };
        let pool = CachePool::new(1 << 20, policy);
        let raw = vec![b'a'; 64 * 1024];
        pool.put(1, raw.clone());

        let entry = pool.get(1).unwrap();
        assert!(entry.compressed);
        assert!(entry.bytes.len() < raw.len());
        assert_eq!(entry.original_len, raw.len());
        assert_eq!(&pool.materialize(&entry).unwrap()[..], &raw[..]);
        // Usage accounts for the stored (compressed) size.
        assert_eq!(pool.checked_usage().unwrap(), entry.bytes.len() as u64);
    }

    #[test]
    fn incompressible_payload_is_stored_raw() {
        let policy = CompressionPolicy {
            sample_len: 4096,
            ..Default::default()
        };
        let pool = CachePool::new(1 << 20, policy);
        let raw = incompressible(64 * 1024);
        pool.put(1, raw.clone());

        let entry = pool.get(1).unwrap();
        assert!(!entry.compressed);
        assert_eq!(&pool.materialize(&entry).unwrap()[..], &raw[..]);
    }

    #[test]
    fn disabled_compression_always_stores_raw() {
        let pool = CachePool::new(1 << 20, raw_policy());
        pool.put(1, vec![b'a'; 64 * 1024]);
        assert!(!pool.get(1).unwrap().compressed);
    }

    #[test]
    fn concurrent_puts_leave_one_entry() {
        let pool = std::sync::Arc::new(CachePool::new(1 << 20, raw_policy()));
        std::thread::scope(|s| {
            for t in 0..8 {
                let pool = pool.clone();
                s.spawn(move || {
                    for _ in 0..50 {
                        pool.put(42, vec![t as u8; 128]);
                    }
                });
            }
        });
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.checked_usage().unwrap(), 128);
    }

    #[test]
    fn concurrent_readers_see_untorn_bytes() {
        let pool = std::sync::Arc::new(CachePool::new(1 << 20, raw_policy()));
        pool.put(1, vec![0xAB; 4096]);
        std::thread::scope(|s| {
            for _ in 0..8 {
                let pool = pool.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        let entry = pool.get(1).unwrap();
                        let bytes = pool.materialize(&entry).unwrap();
                        assert!(bytes.iter().all(|&b| b == 0xAB));
                    }
                });
            }
        });
    }
}
