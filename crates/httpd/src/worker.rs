//! Bounded pool of OS threads running submitted closures.
//!
//! The pool backs two things: the daemon-wide pool executing async steps of
//! request contexts, and the private sub-pool of each poll dispatcher serving
//! parsed connections. Closures return `true` on success; [`WorkerPool::sync`]
//! reports whether every closure completed since the previous sync succeeded.
//!
//! A closure that panics is logged and counted as a failure; its worker keeps
//! serving the queue and `sync` never waits on it forever.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::utils::{lock, wait, wait_timeout};

type Task = Box<dyn FnOnce() -> bool + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Task>,
    /// queued plus running tasks
    outstanding: usize,
    success: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    task_cv: Condvar,
    idle_cv: Condvar,
}

pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("name", &self.name).field("workers", &self.threads.len()).finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `workers` threads named `{name}-{index}`.
    pub fn new(name: &str, workers: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState { success: true, ..PoolState::default() }),
            task_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });

        let mut pool = Self { name: name.to_owned(), shared, threads: Vec::with_capacity(workers) };
        for idx in 0..workers.max(1) {
            let shared = Arc::clone(&pool.shared);
            let pool_name = name.to_owned();
            let handle = thread::Builder::new().name(format!("{name}-{idx}")).spawn(move || worker_main(&pool_name, &shared))?;
            pool.threads.push(handle);
        }

        debug!(pool = name, workers = pool.threads.len(), "worker pool started");
        Ok(pool)
    }

    /// Queues a closure. Never blocks.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        state.queue.push_back(Box::new(task));
        state.outstanding += 1;
        drop(state);

        self.shared.task_cv.notify_one();
    }

    /// Blocks until no task is queued or running, returns whether all of them succeeded.
    pub fn sync(&self) -> bool {
        let mut state = lock(&self.shared.state);
        while state.outstanding > 0 {
            state = wait(&self.shared.idle_cv, state);
        }
        std::mem::replace(&mut state.success, true)
    }

    /// Like [`sync`](Self::sync) but gives up after `timeout`, returning `false`
    /// when work is still outstanding.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut state = lock(&self.shared.state);
        while state.outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = wait_timeout(&self.shared.idle_cv, state, deadline - now);
        }
        std::mem::replace(&mut state.success, true)
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.threads.iter().any(|handle| handle.thread().id() == current)
    }

    /// Number of tasks queued or running.
    pub fn outstanding(&self) -> usize {
        lock(&self.shared.state).outstanding
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_worker_thread() {
            self.sync();
        }

        lock(&self.shared.state).shutdown = true;
        self.shared.task_cv.notify_all();

        // a worker may release the last owner of its own pool, it cannot join itself
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

fn worker_main(pool: &str, shared: &Shared) {
    loop {
        let task = {
            let mut state = lock(&shared.state);
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                if state.shutdown {
                    return;
                }
                state = wait(&shared.task_cv, state);
            }
        };

        let success = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(success) => success,
            Err(_) => {
                error!(pool, "worker task panicked");
                false
            }
        };

        let mut state = lock(&shared.state);
        state.outstanding -= 1;
        state.success &= success;
        if state.outstanding == 0 {
            shared.idle_cv.notify_all();
        }
    }
}
