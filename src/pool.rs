//! A small lock-free object pool, used by `ClientStore::find` to avoid
//! allocating a fresh snapshot buffer on every publish.
//!
//! Grounded on the teacher's `BsatnRowListBuilderPool` /
//! `spacetimedb_data_structures::object_pool::Pool` shape (`take(reset, new)` /
//! `put`), reimplemented over `crossbeam_queue::ArrayQueue` since the teacher's
//! own `Pool` lives in an internal crate not vendored into this workspace.

use crossbeam_queue::ArrayQueue;

/// A bounded pool of reusable `T`s.
///
/// `take` hands out a pooled value (resetting it first) or constructs a new
/// one if the pool is empty; `put` returns a value to the pool, or drops it if
/// the pool is already at capacity.
pub struct BufferPool<T> {
    free: ArrayQueue<T>,
}

impl<T> BufferPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn take(&self, reset: impl FnOnce(&mut T), new: impl FnOnce() -> T) -> T {
        match self.free.pop() {
            Some(mut item) => {
                reset(&mut item);
                item
            }
            None => new(),
        }
    }

    pub fn put(&self, item: T) {
        // Best-effort: if the pool is full, the buffer is simply dropped.
        let _ = self.free.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffer() {
        let pool: BufferPool<Vec<u32>> = BufferPool::new(2);
        let mut buf = pool.take(|v| v.clear(), Vec::new);
        buf.push(1);
        buf.push(2);
        pool.put(buf);

        let reused = pool.take(|v| v.clear(), || panic!("should have reused"));
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 2);
    }

    #[test]
    fn overflow_drops_silently() {
        let pool: BufferPool<Vec<u32>> = BufferPool::new(1);
        pool.put(vec![1]);
        pool.put(vec![2]); // dropped, pool already full
        assert_eq!(pool.free.len(), 1);
    }
}
