//! Chunk-location memoization. A two-level hash (bucket by
//! `(inode, chunk_index)`, LRU within the bucket) amortizes
//! `READ_CHUNK`/`WRITE_CHUNK` master round-trips. Entries are invalidated,
//! never silently evicted, by writers and certain retryable errors.

use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cfs_api_types::{ChunkId, ChunkVersion, CsChain};

const BUCKET_COUNT: usize = 1024;
const CHAIN_CAPACITY: usize = 8;

type ChunkKey = (u64, u32);

struct CacheEntry {
    chunk_id: ChunkId,
    version: ChunkVersion,
    chain: CsChain,
    inserted_at: Instant,
}

fn bucket_of(key: ChunkKey) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % BUCKET_COUNT
}

pub struct ChunkLocCache {
    buckets: Vec<Mutex<cfs_tools::lru_cache::LruCache<ChunkKey, CacheEntry>>>,
    /// Per-inode index of cached chunk indices, so `clear_inode` doesn't
    /// need to scan every bucket.
    by_inode: Mutex<HashMap<u64, BTreeSet<u32>>>,
    retention: Duration,
}

impl ChunkLocCache {
    pub fn new(retention: Duration) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, || {
            Mutex::new(cfs_tools::lru_cache::LruCache::new(CHAIN_CAPACITY))
        });
        Self {
            buckets,
            by_inode: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn track(&self, inode: u64, chunk_index: u32) {
        self.by_inode.lock().entry(inode).or_default().insert(chunk_index);
    }

    fn untrack(&self, inode: u64, chunk_index: u32) {
        let mut by_inode = self.by_inode.lock();
        if let Some(set) = by_inode.get_mut(&inode) {
            set.remove(&chunk_index);
            if set.is_empty() {
                by_inode.remove(&inode);
            }
        }
    }

    /// Look up a chunk's cached location. Returns `None` on a miss or if
    /// the entry has aged past `retention`; a stale entry found this way is
    /// evicted immediately.
    pub fn find(&self, inode: u64, chunk_index: u32) -> Option<(ChunkId, ChunkVersion, CsChain)> {
        let key = (inode, chunk_index);
        let bucket_idx = bucket_of(key);
        let mut bucket = self.buckets[bucket_idx].lock();
        let entry = bucket.get_mut(key)?;
        if entry.inserted_at.elapsed() > self.retention {
            bucket.remove(key);
            drop(bucket);
            self.untrack(inode, chunk_index);
            return None;
        }
        Some((entry.chunk_id, entry.version, entry.chain.clone()))
    }

    pub fn insert(&self, inode: u64, chunk_index: u32, chunk_id: ChunkId, version: ChunkVersion, chain: CsChain) {
        let key = (inode, chunk_index);
        let bucket_idx = bucket_of(key);
        self.buckets[bucket_idx].lock().insert(
            key,
            CacheEntry {
                chunk_id,
                version,
                chain,
                inserted_at: Instant::now(),
            },
        );
        self.track(inode, chunk_index);
    }

    pub fn invalidate(&self, inode: u64, chunk_index: u32) {
        let key = (inode, chunk_index);
        let bucket_idx = bucket_of(key);
        self.buckets[bucket_idx].lock().remove(key);
        self.untrack(inode, chunk_index);
    }

    /// Evict every cached entry for `inode` at or past `from_chunk_index`,
    /// used after a truncate shortens the file.
    pub fn clear_inode(&self, inode: u64, from_chunk_index: u32) {
        let indices: Vec<u32> = {
            let by_inode = self.by_inode.lock();
            match by_inode.get(&inode) {
                Some(set) => set.range(from_chunk_index..).copied().collect(),
                None => return,
            }
        };
        for chunk_index in indices {
            self.invalidate(inode, chunk_index);
        }
    }

    /// Post-read sanity check: does the cached entry still match
    /// `(chunk_id, version)`? `false` on a miss, so callers re-resolve
    /// rather than assume a removed entry is still valid.
    pub fn check(&self, inode: u64, chunk_index: u32, chunk_id: ChunkId, version: ChunkVersion) -> bool {
        match self.find(inode, chunk_index) {
            Some((cached_id, cached_version, _)) => cached_id == chunk_id && cached_version == version,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> CsChain {
        CsChain::Plain(vec![])
    }

    #[test]
    fn insert_then_find_round_trips() {
        let cache = ChunkLocCache::new(Duration::from_secs(1));
        cache.insert(10, 0, ChunkId(1), ChunkVersion(1), chain());
        let (id, ver, _) = cache.find(10, 0).unwrap();
        assert_eq!(id, ChunkId(1));
        assert_eq!(ver, ChunkVersion(1));
    }

    #[test]
    fn stale_entries_miss_after_retention() {
        let cache = ChunkLocCache::new(Duration::from_millis(1));
        cache.insert(10, 0, ChunkId(1), ChunkVersion(1), chain());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.find(10, 0).is_none());
    }

    #[test]
    fn invalidate_forces_miss() {
        let cache = ChunkLocCache::new(Duration::from_secs(1));
        cache.insert(10, 0, ChunkId(1), ChunkVersion(1), chain());
        cache.invalidate(10, 0);
        assert!(cache.find(10, 0).is_none());
    }

    #[test]
    fn clear_inode_evicts_only_at_or_past_boundary() {
        let cache = ChunkLocCache::new(Duration::from_secs(1));
        cache.insert(10, 0, ChunkId(1), ChunkVersion(1), chain());
        cache.insert(10, 1, ChunkId(2), ChunkVersion(1), chain());
        cache.insert(10, 2, ChunkId(3), ChunkVersion(1), chain());
        cache.clear_inode(10, 1);
        assert!(cache.find(10, 0).is_some());
        assert!(cache.find(10, 1).is_none());
        assert!(cache.find(10, 2).is_none());
    }

    #[test]
    fn check_matches_cached_identity() {
        let cache = ChunkLocCache::new(Duration::from_secs(1));
        cache.insert(10, 0, ChunkId(1), ChunkVersion(1), chain());
        assert!(cache.check(10, 0, ChunkId(1), ChunkVersion(1)));
        assert!(!cache.check(10, 0, ChunkId(1), ChunkVersion(2)));
        assert!(!cache.check(10, 1, ChunkId(1), ChunkVersion(1)));
    }
}
