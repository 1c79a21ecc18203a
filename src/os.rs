//! The host capabilities the core consumes: deferred-call scheduling and
//! blocking waits.
//!
//! Everything above this module reaches the platform only through
//! [`OsServices`], so tests can swap the threaded scheduler for
//! [`ManualOs`] and decide exactly when deferred work runs.

use crate::waiter::Waiter;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, io, sync::Arc, thread};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Abstract platform services.
pub trait OsServices: Send + Sync + 'static {
    /// Queues `job` to run soon.
    ///
    /// Implementations must never run `job` on the caller's stack, because
    /// callers schedule while holding their own locks.
    fn schedule(&self, job: Job);

    /// Allocates a waiter for a blocking call.
    fn alloc_waiter(&self) -> Waiter {
        Waiter::new()
    }
}

/// Runs deferred jobs on a fixed pool of worker threads.
pub struct ThreadedOs {
    tx: Sender<Job>,
    workers: usize,
}

impl ThreadedOs {
    /// Spawns `workers` scheduler threads (at least one).
    pub fn new(workers: usize) -> io::Result<Arc<Self>> {
        let workers = workers.max(1);
        let (tx, rx) = channel::unbounded::<Job>();
        for i in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            thread::Builder::new()
                .name(format!("stream runner {i}"))
                .spawn(move || {
                    // Exits once every sender is gone.
                    for job in rx.iter() {
                        job();
                    }
                })?;
        }
        Ok(Arc::new(Self { tx, workers }))
    }
}

impl OsServices for ThreadedOs {
    fn schedule(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::error!("scheduler workers are gone; dropping deferred job");
        }
    }
}

impl fmt::Debug for ThreadedOs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadedOs")
            .field("workers", &self.workers)
            .field("queued", &self.tx.len())
            .finish()
    }
}

/// A scheduler that only runs jobs when told to.
///
/// Jobs queue up until [`ManualOs::run_pending`] or
/// [`ManualOs::run_until_idle`] is called, on the calling thread.
#[derive(Default)]
pub struct ManualOs {
    queue: Mutex<VecDeque<Job>>,
}

impl ManualOs {
    /// Creates an empty manual scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the jobs queued at the time of the call. Jobs they schedule stay
    /// queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Job> = self.queue.lock().drain(..).collect();
        let n = batch.len();
        for job in batch {
            job();
        }
        n
    }

    /// Runs jobs until the queue is empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut n = 0;
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    n += 1;
                }
                None => return n,
            }
        }
    }
}

impl OsServices for ManualOs {
    fn schedule(&self, job: Job) {
        self.queue.lock().push_back(job);
    }
}

impl fmt::Debug for ManualOs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ManualOs")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::time::Duration;

    #[test]
    fn manual_defers_until_run() {
        let os = ManualOs::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        os.schedule(Box::new(move || {
            h.fetch_add(1, SeqCst);
        }));
        assert_eq!(hits.load(SeqCst), 0);
        assert_eq!(os.pending(), 1);
        assert_eq!(os.run_pending(), 1);
        assert_eq!(hits.load(SeqCst), 1);
        assert_eq!(os.pending(), 0);
    }

    #[test]
    fn threaded_runs_jobs() {
        let os = ThreadedOs::new(2).unwrap();
        let w = os.alloc_waiter();
        let w2 = w.clone();
        os.schedule(Box::new(move || w2.wake()));
        assert!(w.wait(1, Some(Duration::from_secs(5))).ready().is_some());
    }
}
