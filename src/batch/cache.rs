//! Bounded LRU cache of fix memories, keyed by document id.
//!
//! The only state shared between batch workers. A worker takes the memory
//! for its document before the run and puts the updated memory back after;
//! inserting past capacity evicts the least recently used entry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::repair::fix_memory::FixMemory;

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, FixMemory>,
    /// Least recently used at the front.
    order: VecDeque<String>,
}

impl CacheInner {
    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id.to_string());
    }

    fn forget(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
    }
}

#[derive(Debug)]
pub struct FixMemoryCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl FixMemoryCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panicking worker must not disable the cache for the rest of the batch.
    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove and return the memory for `id`, rebased so that every entry
    /// predates the next run.
    pub fn take(&self, id: &str) -> Option<FixMemory> {
        let mut inner = self.lock();
        let mut memory = inner.entries.remove(id)?;
        inner.forget(id);
        memory.carry_over();
        Some(memory)
    }

    /// Store `memory` for `id` as the most recently used entry.
    /// Returns the id evicted to make room, if any.
    pub fn put(&self, id: &str, memory: FixMemory) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.lock();
        inner.entries.insert(id.to_string(), memory);
        inner.touch(id);

        let mut evicted = None;
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            tracing::debug!(document = %oldest, "evicted fix memory from cache");
            evicted = Some(oldest);
        }
        evicted
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
