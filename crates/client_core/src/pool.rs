//! Bounded free list of retired pagelets.

use std::collections::VecDeque;

use tracing::debug;

/// Objects that can be wiped back to their freshly constructed state.
pub trait Reusable: Default {
    fn reset(&mut self);
}

#[derive(Debug)]
pub struct ReusePool<T> {
    free: VecDeque<T>,
    limit: usize,
}

impl<T: Reusable> ReusePool<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            free: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    /// Oldest retired instance, or a new one when the pool is empty.
    pub fn acquire(&mut self) -> T {
        self.free.pop_front().unwrap_or_default()
    }

    /// Keeps `item` for reuse while the pool is below its limit. A rejected
    /// item is simply dropped by the caller.
    pub fn release(&mut self, mut item: T) -> bool {
        if self.free.len() >= self.limit {
            debug!(limit = self.limit, "pool: full, dropping retired instance");
            return false;
        }
        item.reset();
        self.free.push_back(item);
        true
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
#[path = "tests/pool_tests.rs"]
mod tests;
