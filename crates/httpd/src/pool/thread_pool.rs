use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use super::PoolError;
use crate::utils::{ensure, lock};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    task_ready: Condvar,
}

/// Fixed set of named worker threads draining one FIFO task queue.
///
/// Tasks run outside the queue lock. Dropping the pool closes the queue, lets the
/// workers finish what is already queued and joins them.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `thread_count` workers named `httpd-worker-<n>`.
    pub fn new(thread_count: usize) -> Result<Self, PoolError> {
        ensure!(thread_count > 0, PoolError::invalid_size("thread pool needs at least one worker"));

        let shared = Arc::new(Shared {
            state: Mutex::new(State { tasks: VecDeque::with_capacity(thread_count * 2), closed: false }),
            task_ready: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("httpd-worker-{i}"))
                .spawn(move || run_worker(&shared))
                .map_err(PoolError::spawn)?;
            workers.push(handle);
        }

        debug!(thread_count, "thread pool started");
        Ok(Self { shared, workers })
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        lock(&self.shared.state).tasks.len()
    }

    /// Queues `task` and wakes one idle worker.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.shared.state);
            ensure!(!state.closed, PoolError::Closed);
            state.tasks.push_back(Box::new(task));
        }
        self.shared.task_ready.notify_one();
        Ok(())
    }
}

fn run_worker(shared: &Shared) {
    loop {
        let task = {
            let mut state = lock(&shared.state);
            loop {
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                if state.closed {
                    return;
                }
                state = shared.task_ready.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(thread = thread::current().name().unwrap_or("worker"), "task panicked, worker keeps running");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        lock(&self.shared.state).closed = true;
        self.shared.task_ready.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
        debug!("thread pool stopped");
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool").field("thread_count", &self.workers.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(ThreadPool::new(0), Err(PoolError::InvalidSize { .. })));
    }

    #[test]
    fn runs_every_task_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(4).unwrap();
            assert_eq!(pool.thread_count(), 4);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn single_worker_keeps_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let pool = ThreadPool::new(1).unwrap();
        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        drop(pool);
        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let (tx, rx) = mpsc::channel();
        let pool = ThreadPool::new(1).unwrap();
        pool.execute(|| panic!("boom")).unwrap();
        pool.execute(move || tx.send("alive").unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "alive");
    }

    #[test]
    fn workers_are_named() {
        let (tx, rx) = mpsc::channel();
        let pool = ThreadPool::new(2).unwrap();
        pool.execute(move || tx.send(thread::current().name().map(str::to_owned)).unwrap()).unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("httpd-worker-"));
    }
}
