//! Least recently used (LRU) cache.
//!
//! A `HashMap` gives O(1) access by key; a doubly linked list tracks access
//! order so the least recently used entry can be evicted in O(1) once the
//! cache is over capacity.

use std::collections::{hash_map::Entry, HashMap};
use std::marker::PhantomData;

/// Interface for getting values on cache misses.
pub trait Cacher<K, V> {
    /// Fetch a value for key on cache miss. Returning `None` means no value
    /// exists; the cache is left unchanged in that case.
    fn fetch(&mut self, key: K) -> Result<Option<V>, anyhow::Error>;
}

struct CacheNode<K, V> {
    key: K,
    value: V,
    prev: *mut CacheNode<K, V>,
    next: *mut CacheNode<K, V>,
    _marker: PhantomData<Box<CacheNode<K, V>>>,
}

impl<K, V> CacheNode<K, V> {
    fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            _marker: PhantomData,
        }
    }
}

/// Bounded LRU cache keyed by `K`, holding at most `capacity` entries.
pub struct LruCache<K, V> {
    map: HashMap<K, *mut CacheNode<K, V>>,
    list: LinkedList<K, V>,
    capacity: usize,
    _marker: PhantomData<Box<CacheNode<K, V>>>,
}

impl<K, V> Drop for LruCache<K, V> {
    fn drop(&mut self) {
        self.clear();
    }
}

// Safe: ownership of K/V is exclusively held by this struct.
unsafe impl<K: Send, V: Send> Send for LruCache<K, V> {}

impl<K, V> LruCache<K, V> {
    pub fn clear(&mut self) {
        self.map.clear();
        self.list.clear();
    }
}

impl<K: std::cmp::Eq + std::hash::Hash + Copy, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            list: LinkedList::new(),
            capacity,
            _marker: PhantomData,
        }
    }

    /// Insert or update an entry, placing it as most-recently-used.
    pub fn insert(&mut self, key: K, value: V) {
        match self.map.entry(key) {
            Entry::Occupied(mut o) => {
                let node_ptr = *o.get_mut();
                self.list.bring_to_front(node_ptr);
                let mut node = unsafe { Box::from_raw(node_ptr) };
                node.value = value;
                let _node_ptr = Box::into_raw(node);
            }
            Entry::Vacant(v) => {
                let node = Box::new(CacheNode::new(key, value));
                let node_ptr = Box::into_raw(node);
                self.list.push_front(node_ptr);
                v.insert(node_ptr);
                if self.map.len() > self.capacity {
                    self.pop_tail();
                }
            }
        }
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let node_ptr = self.map.remove(&key)?;
        let node = self.list.remove(node_ptr);
        Some(node.value)
    }

    fn pop_tail(&mut self) {
        if let Some(old_tail) = self.list.pop_tail() {
            self.map.remove(&old_tail.key);
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let node_ptr = self.map.get(&key)?;
        self.list.bring_to_front(*node_ptr);
        Some(unsafe { &mut (*self.list.head).value })
    }

    pub fn contains(&self, key: K) -> bool {
        self.map.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Get a mutable reference to `key`'s value, fetching it via `cacher`
    /// on a miss and inserting it as most-recently-used.
    pub fn access<'a>(
        &'a mut self,
        key: K,
        cacher: &mut dyn Cacher<K, V>,
    ) -> Result<Option<&'a mut V>, anyhow::Error> {
        match self.map.entry(key) {
            Entry::Occupied(mut o) => {
                let node_ptr = *o.get_mut();
                self.list.bring_to_front(node_ptr);
            }
            Entry::Vacant(v) => match cacher.fetch(key)? {
                None => return Ok(None),
                Some(value) => {
                    let node = Box::new(CacheNode::new(key, value));
                    let node_ptr = Box::into_raw(node);
                    self.list.push_front(node_ptr);
                    v.insert(node_ptr);
                    if self.map.len() > self.capacity {
                        self.pop_tail();
                    }
                }
            },
        }

        Ok(Some(unsafe { &mut (*self.list.head).value }))
    }
}

struct LinkedList<K, V> {
    head: *mut CacheNode<K, V>,
    tail: *mut CacheNode<K, V>,
}

impl<K, V> LinkedList<K, V> {
    fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    fn bring_to_front(&mut self, node_ptr: *mut CacheNode<K, V>) {
        if node_ptr == self.head {
            return;
        }

        let mut node = unsafe { Box::from_raw(node_ptr) };
        unsafe { (*node.prev).next = node.next };

        if !node.next.is_null() {
            unsafe { (*node.next).prev = node.prev };
        } else {
            self.tail = node.prev;
        }

        node.prev = std::ptr::null_mut();
        node.next = self.head;
        let node_ptr = Box::into_raw(node);
        unsafe { (*self.head).prev = node_ptr };
        self.head = node_ptr;
    }

    fn push_front(&mut self, node_ptr: *mut CacheNode<K, V>) {
        let mut node = unsafe { Box::from_raw(node_ptr) };
        node.next = self.head;
        let node_ptr = Box::into_raw(node);

        if !self.head.is_null() {
            unsafe { (*self.head).prev = node_ptr };
        }
        self.head = node_ptr;
        if self.tail.is_null() {
            self.tail = node_ptr;
        }
    }

    fn remove(&mut self, node_ptr: *mut CacheNode<K, V>) -> Box<CacheNode<K, V>> {
        let node = unsafe { Box::from_raw(node_ptr) };

        if !node.prev.is_null() {
            unsafe { (*node.prev).next = node.next };
        } else {
            self.head = node.next;
        }

        if !node.next.is_null() {
            unsafe { (*node.next).prev = node.prev };
        } else {
            self.tail = node.prev;
        }
        node
    }

    fn pop_tail(&mut self) -> Option<Box<CacheNode<K, V>>> {
        if self.tail.is_null() {
            return None;
        }

        let old_tail = unsafe { Box::from_raw(self.tail) };
        self.tail = old_tail.prev;
        if !self.tail.is_null() {
            unsafe { (*self.tail).next = std::ptr::null_mut() };
        }
        Some(old_tail)
    }

    fn clear(&mut self) {
        let mut next = self.head;
        while !next.is_null() {
            let current = unsafe { Box::from_raw(next) };
            next = current.next;
        }
        self.head = std::ptr::null_mut();
        self.tail = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_order_is_least_recently_used() {
        let mut cache = LruCache::new(3);
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(3, "c");
        cache.insert(4, "d");
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get_mut(1), None);
        assert_eq!(cache.get_mut(2), Some(&mut "b"));

        // touching 2 should save it from the next eviction
        cache.insert(5, "e");
        assert_eq!(cache.get_mut(2), Some(&mut "b"));
        assert_eq!(cache.get_mut(3), None);
    }

    #[test]
    fn remove_and_clear() {
        let mut cache: LruCache<i32, i32> = LruCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        assert_eq!(cache.remove(1), Some(10));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
