//! Per-(inode, chunk-index) reader/writer lock. Writer preference is
//! mandatory: a waiting writer blocks new readers from acquiring, so
//! read-ahead load cannot starve writers.
//!
//! Lock objects are created on demand and returned to a bounded free-list
//! once idle, mirroring the guard/`Arc<Mutex<_>>`/`Drop`-release shape of
//! `pbs-tools::process_locker::ProcessLocker`, generalized from a
//! file-backed inter-process lock to an in-memory per-chunk one.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

const BUCKET_COUNT: usize = 1024;
const FREE_LIST_CAPACITY: usize = 1024;

type ChunkKey = (u64, u32);

#[derive(Default)]
struct LockState {
    active_readers: u32,
    writer_active: bool,
    waiting_writers: u32,
}

struct ChunkLockEntry {
    state: Mutex<LockState>,
    notify: Notify,
}

impl ChunkLockEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            notify: Notify::new(),
        }
    }

    fn is_idle(&self) -> bool {
        let s = self.state.lock();
        s.active_readers == 0 && !s.writer_active && s.waiting_writers == 0
    }
}

fn bucket_of(key: ChunkKey) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % BUCKET_COUNT
}

/// Writer-preferred reader/writer lock keyed by `(inode, chunk_index)`.
pub struct ChunkLock {
    buckets: Vec<Mutex<HashMap<ChunkKey, Arc<ChunkLockEntry>>>>,
    free_list: Mutex<Vec<Arc<ChunkLockEntry>>>,
    live_entries: AtomicU64,
}

impl ChunkLock {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, || Mutex::new(HashMap::new()));
        Self {
            buckets,
            free_list: Mutex::new(Vec::with_capacity(FREE_LIST_CAPACITY)),
            live_entries: AtomicU64::new(0),
        }
    }

    /// Number of distinct `(inode, chunk_index)` entries currently tracked
    /// (held or idle-but-not-yet-recycled). Exposed for tests.
    pub fn live_entries(&self) -> u64 {
        self.live_entries.load(Ordering::Relaxed)
    }

    fn entry_for(&self, key: ChunkKey) -> Arc<ChunkLockEntry> {
        let bucket_idx = bucket_of(key);
        let mut bucket = self.buckets[bucket_idx].lock();
        if let Some(entry) = bucket.get(&key) {
            return entry.clone();
        }
        let entry = self
            .free_list
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(ChunkLockEntry::new()));
        bucket.insert(key, entry.clone());
        self.live_entries.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Drop an idle entry back to the free-list (or discard it once the
    /// free-list is full), unlinking it from its bucket. No-op if the
    /// entry stopped being idle between the caller's check and this call.
    fn release_if_idle(&self, key: ChunkKey, entry: &Arc<ChunkLockEntry>) {
        if !entry.is_idle() {
            return;
        }
        let bucket_idx = bucket_of(key);
        let mut bucket = self.buckets[bucket_idx].lock();
        // Re-check under the bucket lock: another acquirer may have looked
        // the entry up and is about to lock it.
        if !entry.is_idle() {
            return;
        }
        if let Some(removed) = bucket.remove(&key) {
            self.live_entries.fetch_sub(1, Ordering::Relaxed);
            let mut free_list = self.free_list.lock();
            if free_list.len() < FREE_LIST_CAPACITY {
                free_list.push(removed);
            }
        }
    }

    /// Acquire a read lock, blocking while any writer is active or waiting.
    pub async fn read_lock(self: &Arc<Self>, inode: u64, chunk_index: u32) -> ChunkReadGuard {
        let key = (inode, chunk_index);
        let entry = self.entry_for(key);
        loop {
            let notified = entry.notify.notified();
            {
                let mut s = entry.state.lock();
                if !s.writer_active && s.waiting_writers == 0 {
                    s.active_readers += 1;
                    return ChunkReadGuard {
                        lock: self.clone(),
                        key,
                        entry,
                    };
                }
            }
            notified.await;
        }
    }

    /// Acquire the write lock, blocking until no readers or writer are
    /// active. Registers as waiting immediately so later readers defer.
    pub async fn write_lock(self: &Arc<Self>, inode: u64, chunk_index: u32) -> ChunkWriteGuard {
        let key = (inode, chunk_index);
        let entry = self.entry_for(key);
        {
            entry.state.lock().waiting_writers += 1;
        }
        loop {
            let notified = entry.notify.notified();
            {
                let mut s = entry.state.lock();
                if !s.writer_active && s.active_readers == 0 {
                    s.writer_active = true;
                    s.waiting_writers -= 1;
                    return ChunkWriteGuard {
                        lock: self.clone(),
                        key,
                        entry,
                    };
                }
            }
            notified.await;
        }
    }
}

impl Default for ChunkLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while a reader is active; releases on drop.
pub struct ChunkReadGuard {
    lock: Arc<ChunkLock>,
    key: ChunkKey,
    entry: Arc<ChunkLockEntry>,
}

impl Drop for ChunkReadGuard {
    fn drop(&mut self) {
        let wake_writer = {
            let mut s = self.entry.state.lock();
            s.active_readers = s.active_readers.saturating_sub(1);
            s.active_readers == 0 && s.waiting_writers > 0
        };
        if wake_writer {
            self.entry.notify.notify_one();
        }
        self.lock.release_if_idle(self.key, &self.entry);
    }
}

/// Held while the writer is active; releases on drop.
pub struct ChunkWriteGuard {
    lock: Arc<ChunkLock>,
    key: ChunkKey,
    entry: Arc<ChunkLockEntry>,
}

impl Drop for ChunkWriteGuard {
    fn drop(&mut self) {
        {
            let mut s = self.entry.state.lock();
            s.writer_active = false;
        }
        // Prefer waking a waiting writer; otherwise wake every parked
        // reader so they can all re-check and proceed together.
        self.entry.notify.notify_waiters();
        self.lock.release_if_idle(self.key, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn readers_can_share_the_lock() {
        let lock = Arc::new(ChunkLock::new());
        let g1 = lock.read_lock(1, 0).await;
        let g2 = lock.read_lock(1, 0).await;
        drop(g1);
        drop(g2);
        assert_eq!(lock.live_entries(), 0);
    }

    #[tokio::test]
    async fn writer_excludes_readers_and_is_exclusive() {
        let lock = Arc::new(ChunkLock::new());
        let g = lock.write_lock(1, 0).await;
        drop(g);
        assert_eq!(lock.live_entries(), 0);
    }

    #[tokio::test]
    async fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(ChunkLock::new());
        let reader_guard = lock.read_lock(1, 0).await;

        let lock2 = lock.clone();
        let writer_acquired = Arc::new(AtomicBool::new(false));
        let writer_acquired2 = writer_acquired.clone();
        let writer_task = tokio::spawn(async move {
            let _g = lock2.write_lock(1, 0).await;
            writer_acquired2.store(true, Ordering::SeqCst);
        });

        // Give the writer task a chance to register as waiting.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lock3 = lock.clone();
        let second_reader_done = Arc::new(AtomicBool::new(false));
        let second_reader_done2 = second_reader_done.clone();
        let reader_task = tokio::spawn(async move {
            let _g = lock3.read_lock(1, 0).await;
            second_reader_done2.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer_acquired.load(Ordering::SeqCst));
        assert!(!second_reader_done.load(Ordering::SeqCst));

        drop(reader_guard);
        writer_task.await.unwrap();
        reader_task.await.unwrap();
        assert!(writer_acquired.load(Ordering::SeqCst));
        assert!(second_reader_done.load(Ordering::SeqCst));
    }
}
