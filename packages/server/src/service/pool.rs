//! Bounded OS-thread pools for blocking stage work.
//!
//! Stage functions are blocking by contract, so they must never run on the
//! async runtime. Each [`WorkerPool`] owns a fixed set of named threads
//! pulling jobs from a shared channel; the async side submits a closure and
//! awaits a oneshot for its result. [`PoolSet`] bundles the three stage
//! pools that back one service.

use std::any::Any;
use std::io;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::service::config::{ConfigError, ServiceConfig};
use crate::service::pipeline::Stage;

type Job = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Returned by [`WorkerPool::submit`] once the pool has been shut down.
#[derive(Debug, thiserror::Error)]
#[error("worker pool `{pool}` is shut down")]
pub struct PoolClosed {
    /// Name of the refusing pool.
    pub pool: String,
}

/// Returned by [`JobHandle::join`] when the job produced no result.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job panicked on the worker thread. The worker itself survives.
    #[error("job panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
    /// The result channel closed without a value. Queued jobs still run
    /// during shutdown drain, so this indicates the process is collapsing.
    #[error("worker pool dropped the job")]
    Lost,
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Awaitable result of one submitted job.
///
/// Dropping the handle discards the result: the job still runs to
/// completion on its worker, the value just goes nowhere.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<thread::Result<T>>,
}

impl<T> JobHandle<T> {
    /// Waits for the job to finish and returns its value.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Panicked`] if the job panicked, or
    /// [`JobError::Lost`] if the result channel closed without a value.
    pub async fn join(self) -> Result<T, JobError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(JobError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
            Err(_) => Err(JobError::Lost),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Fixed-size pool of named OS threads executing blocking jobs in FIFO
/// submission order.
///
/// Workers share one channel receiver; a free worker picks up the next
/// job, so at most `size` jobs run at once. Jobs are wrapped in
/// `catch_unwind`, so a panicking job surfaces through its [`JobHandle`]
/// without killing the worker.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    size: usize,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `size` worker threads named `<name>-<index>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn a thread.
    pub fn new(name: &str, size: NonZeroUsize) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let shared_rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size.get());
        for index in 0..size.get() {
            let rx = Arc::clone(&shared_rx);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&rx))?;
            handles.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            size: size.get(),
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        })
    }

    /// Pool name, as used for worker thread names.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads, fixed at construction.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueues a blocking closure and returns a handle to its result.
    ///
    /// Submission never blocks; the queue is unbounded and jobs wait for a
    /// free worker.
    ///
    /// # Errors
    ///
    /// Returns [`PoolClosed`] once [`shutdown`](Self::shutdown) has begun.
    pub fn submit<F, T>(&self, f: F) -> Result<JobHandle<T>, PoolClosed>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            // The receiver may be gone (caller cancelled); the value is
            // simply discarded then.
            let _ = result_tx.send(outcome);
        });

        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                // Send can only fail if every worker exited, which requires
                // the sender to have been dropped first.
                tx.send(job).map_err(|_| PoolClosed {
                    pool: self.name.clone(),
                })?;
                Ok(JobHandle { rx: result_rx })
            }
            None => Err(PoolClosed {
                pool: self.name.clone(),
            }),
        }
    }

    /// Shuts the pool down: refuses new jobs, lets queued jobs drain, then
    /// joins the worker threads off the async runtime.
    ///
    /// Idempotent; concurrent calls each wait for their share of the join.
    pub async fn shutdown(&self) {
        // Dropping the sender closes the channel; workers finish the queue
        // and exit their loop.
        let sender = self.tx.lock().take();
        drop(sender);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }

        tracing::debug!(pool = %self.name, workers = handles.len(), "joining worker threads");
        let join = tokio::task::spawn_blocking(move || {
            for handle in handles {
                // Workers wrap jobs in catch_unwind, so join failures are
                // theoretical.
                let _ = handle.join();
            }
        });
        let _ = join.await;
    }
}

fn worker_loop(rx: &Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        // Hold the receiver lock only while picking up a job, never while
        // running one.
        let job = {
            let guard = rx.lock();
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break, // Channel closed and drained.
        }
    }
}

// ---------------------------------------------------------------------------
// PoolSet
// ---------------------------------------------------------------------------

/// The three stage pools backing one service.
///
/// Created together at service construction, torn down together at
/// service teardown, never shared between services.
#[derive(Debug)]
pub struct PoolSet {
    preprocess: WorkerPool,
    inference: WorkerPool,
    postprocess: WorkerPool,
}

impl PoolSet {
    /// Builds one pool per stage from the validated worker counts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroWorkers`] for a zero-width stage, or the
    /// underlying error if a worker thread cannot be spawned.
    pub fn new(config: &ServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            preprocess: build_pool(Stage::Preprocess, config.preprocess_workers)?,
            inference: build_pool(Stage::Inference, config.inference_workers)?,
            postprocess: build_pool(Stage::Postprocess, config.postprocess_workers)?,
        })
    }

    /// The pool dedicated to one stage.
    #[must_use]
    pub fn pool(&self, stage: Stage) -> &WorkerPool {
        match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Inference => &self.inference,
            Stage::Postprocess => &self.postprocess,
        }
    }

    /// Shuts all three pools down, draining queued jobs first.
    pub async fn shutdown(&self) {
        self.preprocess.shutdown().await;
        self.inference.shutdown().await;
        self.postprocess.shutdown().await;
    }
}

fn build_pool(stage: Stage, workers: usize) -> anyhow::Result<WorkerPool> {
    let size = NonZeroUsize::new(workers).ok_or(ConfigError::ZeroWorkers { stage })?;
    Ok(WorkerPool::new(stage.as_str(), size)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn pool(size: usize) -> WorkerPool {
        WorkerPool::new("test", NonZeroUsize::new(size).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn executes_submitted_jobs() {
        let pool = pool(2);
        let handle = pool.submit(|| 2 + 5).unwrap();
        assert_eq!(handle.join().await.unwrap(), 7);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn jobs_run_on_named_pool_threads() {
        let pool = pool(1);
        let handle = pool
            .submit(|| thread::current().name().map(String::from))
            .unwrap();
        let name = handle.join().await.unwrap().expect("worker has a name");
        assert_eq!(name, "test-0");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn size_bounds_concurrent_jobs() {
        let pool = pool(1);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(
                pool.submit(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn wider_pool_runs_jobs_in_parallel() {
        let pool = pool(2);
        let barrier = Arc::new(std::sync::Barrier::new(2));

        // Each job blocks until the other arrives; with one worker this
        // would deadlock, with two it completes.
        let a = barrier.clone();
        let b = barrier.clone();
        let first = pool.submit(move || a.wait()).unwrap();
        let second = pool.submit(move || b.wait()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            first.join().await.unwrap();
            second.join().await.unwrap();
        })
        .await
        .expect("both jobs finished");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails_fast() {
        let pool = pool(1);
        pool.shutdown().await;
        let err = pool.submit(|| ()).expect_err("pool is closed");
        assert!(err.to_string().contains("test"));
    }

    #[tokio::test]
    async fn queued_jobs_drain_before_shutdown_returns() {
        let pool = pool(1);
        let done = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let done = done.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn panicking_job_reports_and_spares_the_worker() {
        let pool = pool(1);

        let boom = pool.submit(|| panic!("boom")).unwrap();
        match boom.join().await {
            Err(JobError::Panicked { message }) => assert_eq!(message, "boom"),
            other => panic!("expected panic report, got {other:?}"),
        }

        // The same single worker still serves new jobs.
        let after = pool.submit(|| 41 + 1).unwrap();
        assert_eq!(after.join().await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_handle_discards_result_without_harm() {
        let pool = pool(1);
        let ran = Arc::new(AtomicU32::new(0));

        let counter = ran.clone();
        let handle = pool
            .submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(handle);

        // The abandoned job still runs and the pool keeps working.
        let follow_up = pool.submit(|| "alive").unwrap();
        assert_eq!(follow_up.join().await.unwrap(), "alive");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let pool = pool(2);
        pool.shutdown().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pool_set_rejects_zero_workers() {
        let config = ServiceConfig {
            postprocess_workers: 0,
            ..ServiceConfig::default()
        };
        let err = PoolSet::new(&config).expect_err("must fail");
        assert!(err.downcast_ref::<ConfigError>().is_some());
        assert!(err.to_string().contains("postprocess"));
    }

    #[tokio::test]
    async fn pool_set_builds_and_shuts_down() {
        let pools = PoolSet::new(&ServiceConfig::default()).unwrap();
        let handle = pools.pool(Stage::Inference).submit(|| 1).unwrap();
        assert_eq!(handle.join().await.unwrap(), 1);
        pools.shutdown().await;
        assert!(pools.pool(Stage::Preprocess).submit(|| ()).is_err());
    }
}
