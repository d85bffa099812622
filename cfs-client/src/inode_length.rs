//! Canonical per-inode file length, shared by the read and write engines.
//! Two update modes: `set_length_active` (truncate,
//! explicit set-length) waits for in-flight readers to drain before
//! publishing; `set_length_passive` (after a successful write) publishes
//! immediately. Both invalidate any buffered read range overlapping the
//! old/new length gap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Notified of a length change so it can drop/refresh buffers whose byte
/// range falls in `[offset, offset + leng)`. `ReadEngine` implements this.
pub trait LengthChangeObserver: Send + Sync {
    fn invalidate_range(&self, inode: u64, offset: u64, leng: u64);
}

struct InodeLengthEntry {
    fleng: u64,
    readers_cnt: u32,
    waiting_writers: u32,
    lcnt: u32,
}

struct InodeSlot {
    state: Mutex<InodeLengthEntry>,
    readers_drained: Notify,
}

/// Registry of canonical lengths, one slot per open inode.
pub struct InodeLengthRegistry {
    slots: Mutex<HashMap<u64, Arc<InodeSlot>>>,
}

impl InodeLengthRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `inode`, creating its slot with `fleng` if this
    /// is the first handle. Mirrors an `lcnt`-style reference count: the
    /// slot is retained until every handle has called [`Self::close`].
    pub fn open(&self, inode: u64, fleng: u64) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(inode).or_insert_with(|| {
            Arc::new(InodeSlot {
                state: Mutex::new(InodeLengthEntry {
                    fleng,
                    readers_cnt: 0,
                    waiting_writers: 0,
                    lcnt: 0,
                }),
                readers_drained: Notify::new(),
            })
        });
        slot.state.lock().lcnt += 1;
    }

    /// Release one handle's interest; the slot is dropped once the last
    /// handle closes and no reader is active.
    pub fn close(&self, inode: u64) {
        let mut slots = self.slots.lock();
        let remove = if let Some(slot) = slots.get(&inode) {
            let mut s = slot.state.lock();
            s.lcnt = s.lcnt.saturating_sub(1);
            s.lcnt == 0 && s.readers_cnt == 0
        } else {
            false
        };
        if remove {
            slots.remove(&inode);
        }
    }

    pub fn length(&self, inode: u64) -> Option<u64> {
        let slots = self.slots.lock();
        slots.get(&inode).map(|slot| slot.state.lock().fleng)
    }

    fn slot(&self, inode: u64) -> Option<Arc<InodeSlot>> {
        self.slots.lock().get(&inode).cloned()
    }

    /// Record one in-flight reader against `inode`'s length, so a
    /// concurrent `set_length_active` knows to wait. No-op if the inode
    /// isn't open.
    pub fn enter_reader(&self, inode: u64) {
        if let Some(slot) = self.slot(inode) {
            slot.state.lock().readers_cnt += 1;
        }
    }

    pub fn exit_reader(&self, inode: u64) {
        if let Some(slot) = self.slot(inode) {
            let wake = {
                let mut s = slot.state.lock();
                s.readers_cnt = s.readers_cnt.saturating_sub(1);
                s.readers_cnt == 0
            };
            if wake {
                slot.readers_drained.notify_waiters();
            }
        }
    }

    /// Truncate/explicit set-length: wait for readers to drain, then
    /// publish the new length and invalidate the old/new gap.
    pub async fn set_length_active(&self, inode: u64, new_len: u64, observer: &dyn LengthChangeObserver) {
        let Some(slot) = self.slot(inode) else {
            return;
        };
        {
            let mut s = slot.state.lock();
            s.waiting_writers += 1;
        }
        loop {
            let notified = slot.readers_drained.notified();
            {
                let s = slot.state.lock();
                if s.readers_cnt == 0 {
                    break;
                }
            }
            notified.await;
        }
        let old_len = {
            let mut s = slot.state.lock();
            let old = s.fleng;
            s.fleng = new_len;
            s.waiting_writers = s.waiting_writers.saturating_sub(1);
            old
        };
        invalidate_gap(inode, old_len, new_len, observer);
    }

    /// Write-path length bump: publish immediately, no wait.
    pub fn set_length_passive(&self, inode: u64, new_len: u64, observer: &dyn LengthChangeObserver) {
        let Some(slot) = self.slot(inode) else {
            return;
        };
        let old_len = {
            let mut s = slot.state.lock();
            let old = s.fleng;
            if new_len > s.fleng {
                s.fleng = new_len;
            }
            old
        };
        invalidate_gap(inode, old_len, new_len, observer);
    }
}

impl Default for InodeLengthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn invalidate_gap(inode: u64, old_len: u64, new_len: u64, observer: &dyn LengthChangeObserver) {
    let (from, to) = if old_len <= new_len {
        (old_len, new_len)
    } else {
        (new_len, old_len)
    };
    if to > from {
        observer.invalidate_range(inode, from, to - from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct RecordingObserver {
        calls: Mutex<Vec<(u64, u64, u64)>>,
    }

    impl RecordingObserver {
        fn new() -> Self {
            Self {
                calls: Mutex::new(vec![]),
            }
        }
    }

    impl LengthChangeObserver for RecordingObserver {
        fn invalidate_range(&self, inode: u64, offset: u64, leng: u64) {
            self.calls.lock().push((inode, offset, leng));
        }
    }

    #[tokio::test]
    async fn passive_update_publishes_immediately_and_invalidates_gap() {
        let registry = InodeLengthRegistry::new();
        registry.open(1, 100);
        let observer = RecordingObserver::new();
        registry.set_length_passive(1, 200, &observer);
        assert_eq!(registry.length(1), Some(200));
        assert_eq!(observer.calls.lock().as_slice(), &[(1, 100, 100)]);
    }

    #[tokio::test]
    async fn active_update_waits_for_readers_to_drain() {
        let registry = Arc::new(InodeLengthRegistry::new());
        registry.open(1, 1000);
        registry.enter_reader(1);

        static PUBLISHED: AtomicU64 = AtomicU64::new(0);
        PUBLISHED.store(0, Ordering::SeqCst);

        let registry2 = registry.clone();
        let observer = Arc::new(RecordingObserver::new());
        let observer2 = observer.clone();
        let task = tokio::spawn(async move {
            registry2.set_length_active(1, 4096, observer2.as_ref()).await;
            PUBLISHED.store(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(PUBLISHED.load(Ordering::SeqCst), 0);
        assert_eq!(registry.length(1), Some(1000));

        registry.exit_reader(1);
        task.await.unwrap();
        assert_eq!(PUBLISHED.load(Ordering::SeqCst), 1);
        assert_eq!(registry.length(1), Some(4096));
    }
}
