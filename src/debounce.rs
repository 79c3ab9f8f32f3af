//! Trailing-edge debounce for publishing derived views.
//!
//! A single worker thread owns the timer. Every `schedule` replaces the
//! pending job and restarts the quiet window; the job runs once the window
//! passes without another `schedule`.

use crate::error::{EngineError, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::ReentrantMutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default quiet window.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

type Job = Box<dyn FnOnce() + Send>;

enum Command {
    Schedule { job: Job, generation: u64 },
    Cancel,
    Shutdown,
}

struct Shared {
    /// Bumped by `cancel`; jobs from an older generation never run.
    generation: AtomicU64,
    /// Held while a job runs so `cancel` can wait it out. Reentrant so a job
    /// run by `run_now` may itself call `cancel`.
    firing: ReentrantMutex<()>,
    /// Schedule commands not yet seen by the worker.
    queued: AtomicUsize,
    /// Worker holds a pending job.
    armed: AtomicBool,
    fired: AtomicU64,
}

/// Coalesces bursts of `schedule` calls into one trailing publish.
pub struct DebounceScheduler {
    window: Duration,
    tx: Sender<Command>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl DebounceScheduler {
    /// Start a scheduler with the given quiet window.
    pub fn new(window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(EngineError::InvalidConfig(
                "debounce window must be non-zero".into(),
            ));
        }

        let (tx, rx) = unbounded::<Command>();
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            firing: ReentrantMutex::new(()),
            queued: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
            fired: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("livemerge-debounce".into())
            .spawn(move || {
                let mut pending: Option<(Instant, Job, u64)> = None;
                loop {
                    let command = match &pending {
                        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                        Some((deadline, _, _)) => rx.recv_deadline(*deadline),
                    };

                    match command {
                        Ok(Command::Schedule { job, generation }) => {
                            worker_shared.queued.fetch_sub(1, Ordering::SeqCst);
                            if generation == worker_shared.generation.load(Ordering::SeqCst) {
                                pending = Some((Instant::now() + window, job, generation));
                                worker_shared.armed.store(true, Ordering::SeqCst);
                            }
                        }
                        Ok(Command::Cancel) => {
                            pending = None;
                            worker_shared.armed.store(false, Ordering::SeqCst);
                        }
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            worker_shared.armed.store(false, Ordering::SeqCst);
                            if let Some((_, job, generation)) = pending.take() {
                                let _firing = worker_shared.firing.lock();
                                if generation == worker_shared.generation.load(Ordering::SeqCst) {
                                    worker_shared.fired.fetch_add(1, Ordering::SeqCst);
                                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                        warn!("debounced publish panicked");
                                    }
                                }
                            }
                        }
                    }
                }
                debug!("debounce worker stopped");
            })
            .map_err(|e| EngineError::Worker(e.to_string()))?;

        let worker_id = worker.thread().id();
        Ok(Self {
            window,
            tx,
            shared,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Record that a publish is due; restarts the quiet window.
    ///
    /// Only the job passed to the last call in a burst runs.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(Command::Schedule {
                job: Box::new(job),
                generation,
            })
            .is_err()
        {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Drop any pending job.
    ///
    /// When this returns, no job scheduled before the call will run, and a
    /// job that was already running has finished (unless `cancel` is called
    /// from that job itself).
    pub fn cancel(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.armed.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Command::Cancel);
        if thread::current().id() != self.worker_id {
            drop(self.shared.firing.lock());
        }
    }

    /// Drop any pending job and run `job` on the calling thread.
    ///
    /// Holds the same guard as debounced jobs, so a concurrent `cancel`
    /// returns only after `job` has finished.
    pub fn run_now<F>(&self, job: F)
    where
        F: FnOnce(),
    {
        self.cancel();
        let _firing = self.shared.firing.lock();
        self.shared.fired.fetch_add(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("immediate publish panicked");
        }
    }

    /// Best-effort check for a job waiting to run.
    pub fn is_pending(&self) -> bool {
        self.shared.queued.load(Ordering::SeqCst) > 0 || self.shared.armed.load(Ordering::SeqCst)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of jobs that have run.
    pub fn fired(&self) -> u64 {
        self.shared.fired.load(Ordering::SeqCst)
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.cancel();
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            // Dropped from inside a job: the worker exits on its own.
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_burst_publishes_once_with_last_job() {
        let scheduler = DebounceScheduler::new(Duration::from_millis(100)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));

        for i in 1..=5 {
            let count = Arc::clone(&count);
            let last = Arc::clone(&last);
            scheduler.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
                last.store(i, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(10));
        }

        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert_eq!(scheduler.fired(), 1);
        assert!(!scheduler.is_pending());
    }

    #[test]
    fn test_separate_quiet_periods_publish_separately() {
        let scheduler = DebounceScheduler::new(Duration::from_millis(50)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&count);
            scheduler.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            thread::sleep(Duration::from_millis(200));
        }

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_prevents_publish() {
        let scheduler = DebounceScheduler::new(Duration::from_millis(50)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        scheduler.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel();
        assert!(!scheduler.is_pending());

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Usable again after cancel.
        let c = Arc::clone(&count);
        scheduler.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_from_inside_job() {
        let scheduler = Arc::new(DebounceScheduler::new(Duration::from_millis(20)).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let inner = Arc::clone(&scheduler);
        let flag = Arc::clone(&done);
        scheduler.schedule(move || {
            inner.cancel();
            flag.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(200));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let scheduler = DebounceScheduler::new(Duration::from_millis(20)).unwrap();
        scheduler.schedule(|| panic!("listener failed"));
        thread::sleep(Duration::from_millis(100));

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        scheduler.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_waits_for_immediate_job() {
        let scheduler = Arc::new(DebounceScheduler::new(Duration::from_millis(50)).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                scheduler.run_now(|| {
                    thread::sleep(Duration::from_millis(150));
                    done.store(true, Ordering::SeqCst);
                });
            })
        };

        thread::sleep(Duration::from_millis(30));
        scheduler.cancel();
        assert!(done.load(Ordering::SeqCst));
        runner.join().unwrap();
    }

    #[test]
    fn test_run_now_drops_pending_and_allows_cancel_inside() {
        let scheduler = DebounceScheduler::new(Duration::from_millis(50)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        scheduler.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let ran = AtomicBool::new(false);
        scheduler.run_now(|| {
            scheduler.cancel();
            ran.store(true, Ordering::SeqCst);
        });
        assert!(ran.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(matches!(
            DebounceScheduler::new(Duration::ZERO),
            Err(EngineError::InvalidConfig(_))
        ));
    }
}
