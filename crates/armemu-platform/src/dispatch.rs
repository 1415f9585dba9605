//! Asynchronous work dispatch for host-side completions.
//!
//! Peripherals hand work that must not run under their device lock (or that may block) to a
//! [`Dispatcher`]. [`WorkerPool`] is the native implementation: jobs run on a tokio runtime's
//! blocking pool, which adds a thread whenever a job is queued and every existing thread is busy,
//! and never exceeds the configured maximum.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{self, Runtime};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatcher: Send + Sync {
    /// Run `job` at some later point, possibly on another thread.
    fn schedule(&self, job: Job);
}

/// Runs every job synchronously on the scheduling thread.
///
/// Useful for deterministic tests. Callers must not hold locks the job takes.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn schedule(&self, job: Job) {
        job();
    }
}

/// Routes completions for one resource to a fixed callback via a [`Dispatcher`].
pub struct CompletionPort<T> {
    dispatcher: Arc<dyn Dispatcher>,
    callback: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T> Clone for CompletionPort<T> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<T: Send + 'static> CompletionPort<T> {
    /// Associate `callback` with a resource; every [`Self::post`] runs it on `dispatcher`.
    pub fn associate(
        dispatcher: Arc<dyn Dispatcher>,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            dispatcher,
            callback: Arc::new(callback),
        }
    }

    pub fn post(&self, completion: T) {
        let callback = self.callback.clone();
        self.dispatcher
            .schedule(Box::new(move || callback(completion)));
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }
}

/// Blocking-job pool backed by a tokio runtime's blocking threads.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    max_workers: usize,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> io::Result<Self> {
        let max_workers = max_workers.max(1);
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_workers)
            .thread_name("armemu-worker")
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            max_workers,
            busy: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of jobs currently running on a worker.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }
}

impl Dispatcher for WorkerPool {
    fn schedule(&self, job: Job) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let busy = self.busy.clone();
        // Dropping the JoinHandle detaches the job; panics are logged here instead.
        drop(runtime.spawn_blocking(move || {
            busy.fetch_add(1, Ordering::AcqRel);
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("dispatched job panicked");
            }
            busy.fetch_sub(1, Ordering::AcqRel);
        }));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // The last reference may go away on one of the pool's own threads, where a blocking
        // shutdown would panic.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn inline_dispatcher_runs_immediately() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        InlineDispatcher.schedule(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_grows_while_workers_are_busy_up_to_the_limit() {
        let pool = WorkerPool::new(3).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (started_tx, started_rx) = mpsc::channel::<()>();

        for _ in 0..5 {
            let rx = release_rx.clone();
            let started = started_tx.clone();
            pool.schedule(Box::new(move || {
                started.send(()).unwrap();
                let _ = rx.lock().unwrap().recv();
            }));
        }

        for _ in 0..3 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        // The other two stay queued until a worker frees up.
        assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pool.busy_workers(), 3);

        for _ in 0..5 {
            release_tx.send(()).unwrap();
        }
        for _ in 0..2 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn panicking_job_does_not_take_the_worker_down() {
        let pool = WorkerPool::new(1).unwrap();
        pool.schedule(Box::new(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        pool.schedule(Box::new(move || tx.send(7u32).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn pool_can_be_dropped_from_its_own_job() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let inner = pool.clone();
        pool.schedule(Box::new(move || {
            gate_rx.recv().unwrap();
            drop(inner);
            tx.send(()).unwrap();
        }));
        drop(pool);
        gate_tx.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn completion_port_delivers_to_the_associated_callback() {
        let pool: Arc<dyn Dispatcher> = Arc::new(WorkerPool::new(2).unwrap());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let port = CompletionPort::associate(pool, move |v: u32| {
            tx.lock().unwrap().send(v * 2).unwrap();
        });

        port.post(21);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
