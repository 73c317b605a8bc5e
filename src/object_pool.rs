use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// A thread-safe object pool for reusing allocations.
///
/// Read loops acquire one chunk buffer per read and hand it back on drop, so
/// a busy reactor does not allocate a fresh chunk for every event. Objects
/// are created lazily when the pool is empty, and at most `capacity` objects
/// are kept around once returned.
#[derive(Clone)]
pub struct ObjectPool<T> {
    pool: Arc<Mutex<VecDeque<T>>>,
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    reset_fn: Option<Arc<dyn Fn(&mut T) + Send + Sync>>,
    capacity: usize,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Creates a pool pre-filled with `initial_size` objects built by `create_fn`.
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut pool = VecDeque::with_capacity(initial_size);
        for _ in 0..initial_size {
            pool.push_back(create_fn());
        }

        Self {
            pool: Arc::new(Mutex::new(pool)),
            create_fn: Arc::new(create_fn),
            reset_fn: None,
            capacity: initial_size.max(1),
        }
    }

    /// Runs `reset_fn` on every object handed out, recycled or new.
    pub fn with_reset<R>(mut self, reset_fn: R) -> Self
    where
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reset_fn = Some(Arc::new(reset_fn));
        self
    }

    /// Acquires an object from the pool, creating a new one if the pool is empty.
    #[inline]
    pub fn acquire(&self) -> PooledObject<T> {
        let object = self.pool.lock().pop_front();
        let mut object = object.unwrap_or_else(|| (self.create_fn)());

        if let Some(reset) = &self.reset_fn {
            reset(&mut object);
        }

        PooledObject {
            object: Some(object),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Returns the number of objects currently idle in the pool.
    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }
}

impl ObjectPool<Vec<u8>> {
    /// A pool of zeroed byte buffers that are always exactly `chunk_size` long.
    pub fn buffers(initial_size: usize, chunk_size: usize) -> Self {
        Self::new(initial_size, move || vec![0; chunk_size]).with_reset(move |buf| {
            buf.resize(chunk_size, 0);
        })
    }
}

/// A guard that returns the object to the pool when dropped.
pub struct PooledObject<T> {
    object: Option<T>,
    pool: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Only `drop` empties the slot.
        match &self.object {
            Some(object) => object,
            None => unreachable!("PooledObject used after release"),
        }
    }
}

impl<T> DerefMut for PooledObject<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.object {
            Some(object) => object,
            None => unreachable!("PooledObject used after release"),
        }
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            let mut pool = self.pool.lock();
            if pool.len() < self.capacity {
                pool.push_back(object);
            }
        }
    }
}
