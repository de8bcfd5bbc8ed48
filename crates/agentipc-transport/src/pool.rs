//! Fixed-size worker pool for connection work items.

use agentipc_core::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default pool size: two workers per available core.
#[must_use]
pub fn default_pool_size() -> usize {
    thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get) * 2
}

/// Threads pulling jobs from a shared queue.
///
/// A panicking job is logged and the worker keeps going. Shutdown closes the
/// queue; queued and running jobs still complete before the workers exit.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("agentipc-worker-{id}"))
                .spawn(move || worker_loop(id, &rx));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Let the already-spawned workers drain and exit
                    drop(tx);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(Error::Io(io::Error::new(
                        e.kind(),
                        format!("failed to spawn worker thread: {e}"),
                    )));
                }
            }
        }

        tracing::debug!(size, "worker pool started");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::ShutDown);
        };
        sender.send(Box::new(job)).map_err(|_| Error::ShutDown)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Close the queue and join every worker. Idempotent.
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) -> Result<()> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut panicked = 0usize;
        for handle in workers {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(Error::Io(io::Error::other(format!(
                "{panicked} worker thread(s) panicked"
            ))));
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn worker_loop(id: usize, jobs: &Receiver<Job>) {
    for job in jobs {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::warn!(
                worker = id,
                panic = panic_message(payload.as_ref()),
                "job panicked"
            );
        }
    }
    tracing::trace!(worker = id, "worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_runs_jobs_on_named_workers() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        for _ in 0..4 {
            let tx = tx.clone();
            pool.execute(move || {
                let name = thread::current().name().unwrap_or_default().to_string();
                tx.send(name).unwrap();
            })
            .unwrap();
        }

        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(name.starts_with("agentipc-worker-"), "{name}");
        }
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom")).unwrap();
        let counter = Arc::clone(&done);
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_work() {
        let pool = WorkerPool::new(1).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&done);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert!(pool.is_shut_down());
        assert!(matches!(pool.execute(|| {}), Err(Error::ShutDown)));
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_sizes() {
        assert!(default_pool_size() >= 2);
        assert_eq!(WorkerPool::new(0).unwrap().size(), 1);
    }
}
