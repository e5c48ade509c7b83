// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Elastic worker pool for TCP executors and service dispatch.
//!
//! The pool grows on demand: `post` spawns a new worker only when no idle
//! worker is available and the configured maximum has not been reached
//! (`max_size == 0` means unbounded). Idle workers park on a condition
//! variable and are reused. `shutdown` lets workers drain the queue and
//! exit; `join` must only be called after `shutdown`.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    workers: Vec<JoinHandle<()>>,
    idle_count: usize,
    shutdown: bool,
}

/// Dynamic thread pool shared by the transports and the service plane.
pub struct DynamicThreadPool {
    state: Mutex<PoolState>,
    cv: Condvar,
    max_size: usize,
}

impl DynamicThreadPool {
    /// Unbounded pool.
    pub fn new() -> std::sync::Arc<Self> {
        Self::with_max_size(0)
    }

    /// Pool bounded to `max_size` workers (0 = unbounded).
    pub fn with_max_size(max_size: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                workers: Vec::new(),
                idle_count: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            max_size,
        })
    }

    /// Enqueue a task. Returns false after `shutdown`.
    pub fn post<F>(self: &std::sync::Arc<Self>, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }

        state.tasks.push_back(Box::new(task));

        if state.idle_count > 0 {
            self.cv.notify_one();
        } else if self.max_size == 0 || state.workers.len() < self.max_size {
            let pool = std::sync::Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name("hipc-pool".to_string())
                .spawn(move || pool.worker_loop());
            match handle {
                Ok(h) => state.workers.push(h),
                Err(e) => {
                    // Queue keeps the task; an existing worker will pick it up.
                    log::error!("[POOL] worker spawn failed: {}", e);
                }
            }
        }
        true
    }

    fn worker_loop(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if state.shutdown {
                        return;
                    }
                    state.idle_count += 1;
                    self.cv.wait(&mut state);
                    state.idle_count -= 1;
                }
            };
            // Run outside the lock
            task();
        }
    }

    /// Current worker count.
    pub fn size(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Configured maximum (0 = unbounded).
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Workers currently parked.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle_count
    }

    /// Stop accepting tasks; workers drain the queue and exit.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cv.notify_all();
    }

    /// Join all workers. Must be called after `shutdown`.
    pub fn join(&self) {
        let workers = {
            let mut state = self.state.lock();
            debug_assert!(state.shutdown, "shutdown must be called before join");
            std::mem::take(&mut state.workers)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for DynamicThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        // Workers hold an Arc to the pool, so by the time Drop runs every
        // worker has already exited; join any strays left in the list.
        let workers = std::mem::take(&mut self.state.lock().workers);
        for worker in workers {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn executes_posted_tasks() {
        let pool = DynamicThreadPool::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            assert!(pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 32 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);

        pool.shutdown();
        pool.join();
    }

    #[test]
    fn idle_workers_are_reused() {
        let pool = DynamicThreadPool::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // Sequential tasks with gaps: a single worker should serve them all.
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(pool.size() <= 2, "pool grew to {} workers", pool.size());

        pool.shutdown();
        pool.join();
    }

    #[test]
    fn respects_max_size() {
        let pool = DynamicThreadPool::with_max_size(2);
        let running = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            pool.post(move || {
                running.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
            });
        }

        std::thread::sleep(Duration::from_millis(25));
        assert!(pool.size() <= 2);

        pool.shutdown();
        pool.join();
        assert_eq!(running.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn post_after_shutdown_fails() {
        let pool = DynamicThreadPool::new();
        pool.shutdown();
        assert!(!pool.post(|| {}));
        pool.join();
    }
}
