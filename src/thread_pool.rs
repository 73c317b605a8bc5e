#[cfg(feature = "unstable-mpmc")]
use std::sync::mpmc as channel;
#[cfg(not(feature = "unstable-mpmc"))]
use std::sync::mpsc as channel;
use std::{
    sync::{Arc, Barrier},
    thread::{Builder, JoinHandle},
};

use tracing::trace;

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Fixed set of workers, each with its own FIFO queue.
///
/// Work is routed by key: every task submitted with the same key lands on the
/// same worker and runs in submission order. The reactor keys by socket id,
/// which is what gives each connection ordered, non-overlapping callbacks
/// while different connections spread over all workers.
pub struct ThreadPool {
    workers: Vec<Worker>,
    senders: Vec<channel::Sender<WorkerMessage>>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::channel::<WorkerMessage>();
            workers.push(Worker::new(id, receiver)?);
            senders.push(sender);
        }

        Ok(Self { workers, senders })
    }

    /// Runs `task` on the worker that owns `key`.
    pub fn exec_on<F>(&self, key: u64, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = (key % self.senders.len() as u64) as usize;
        self.senders[index]
            .send(WorkerMessage::Task(Box::new(task)))
            .map_err(|_| Error::PoolGone)
    }

    /// Blocks until every task queued before this call has run.
    ///
    /// Must not be called from a worker thread.
    pub fn quiesce(&self) -> Result<()> {
        let barrier = Arc::new(Barrier::new(self.senders.len() + 1));
        for sender in &self.senders {
            let barrier = barrier.clone();
            sender
                .send(WorkerMessage::Task(Box::new(move || {
                    barrier.wait();
                })))
                .map_err(|_| Error::PoolGone)?;
        }
        barrier.wait();
        Ok(())
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        let current = std::thread::current().id();
        for worker in &mut self.workers {
            if let Some(t) = worker.take_thread() {
                // The last reference can be dropped from inside a task.
                if t.thread().id() != current {
                    let _ = t.join();
                }
            }
        }
    }
}

struct Worker {
    #[allow(dead_code)]
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: channel::Receiver<WorkerMessage>) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("mill-raw-worker-{id}"))
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Task(task) => task(),
                        WorkerMessage::Terminate => break,
                    }
                }
                trace!(worker = id, "worker exiting");
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_thread_pool_creation() {
        let pool = ThreadPool::new(4).unwrap();
        assert_eq!(pool.workers_len(), 4);
    }

    #[test]
    fn test_zero_capacity_still_has_a_worker() {
        let pool = ThreadPool::new(0).unwrap();
        assert_eq!(pool.workers_len(), 1);
    }

    #[test]
    fn test_task_execution() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        pool.exec_on(0, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.quiesce().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_key_runs_in_order() {
        let pool = ThreadPool::new(4).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = order.clone();
            pool.exec_on(9, move || {
                if i % 10 == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                order.lock().unwrap().push(i);
            })
            .unwrap();
        }

        pool.quiesce().unwrap();
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_pool_cleanup() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2).unwrap();
            let counter_clone = counter.clone();

            pool.exec_on(1, move || {
                std::thread::sleep(Duration::from_millis(50));
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
