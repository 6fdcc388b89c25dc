//! Thread-backed pool of evaluation workers.
//!
//! Registered workers pull jobs from one shared queue and push their results
//! back to the pool; nothing but configurations and results crosses threads.
use crate::iteration::ConfigId;
use crate::space::Configuration;
use crate::worker::{EvaluationWorker, TargetAlgorithm, TrialResult};
use crate::{Error, ErrorKind, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use trackable::error::ErrorKindExt;
use tracing::{debug, error, warn};

/// How many jobs may wait for a free worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// At most `num_workers + extra` jobs are outstanding.
    Bounded {
        /// Jobs allowed on top of one per worker.
        extra: usize,
    },

    /// Submission never blocks.
    Unbounded,
}
impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Bounded { extra: 0 }
    }
}

/// A job handed to a worker thread.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Scheduler-level configuration identifier.
    pub id: ConfigId,

    /// Configuration to evaluate.
    pub config: Configuration,

    /// Budget to evaluate at.
    pub budget: f64,
}

/// A result coming back from a worker thread.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Scheduler-level configuration identifier.
    pub id: ConfigId,

    /// Index of the worker that ran the job.
    pub worker: usize,

    /// The trial result.
    pub result: TrialResult,
}

/// Pool of registered evaluation workers.
#[derive(Debug)]
pub struct WorkerPool<T> {
    policy: QueuePolicy,
    job_tx: Sender<Dispatch>,
    job_rx: Arc<Mutex<Receiver<Dispatch>>>,
    result_tx: Sender<Completion>,
    result_rx: Receiver<Completion>,
    handles: Vec<JoinHandle<EvaluationWorker<T>>>,
    outstanding: usize,
}
impl<T> WorkerPool<T>
where
    T: TargetAlgorithm + Send + 'static,
{
    /// Makes an empty pool.
    pub fn new(policy: QueuePolicy) -> Self {
        let (job_tx, job_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();
        Self {
            policy,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            result_tx,
            result_rx,
            handles: Vec::new(),
            outstanding: 0,
        }
    }

    /// Registers a worker and starts its thread.
    pub fn register(&mut self, mut worker: EvaluationWorker<T>) -> Result<()> {
        let index = self.handles.len();
        let jobs = Arc::clone(&self.job_rx);
        let results = self.result_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("hanbun-worker-{}", index))
            .spawn(move || {
                loop {
                    let job = match jobs.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let job = match job {
                        Ok(job) => job,
                        Err(_) => break,
                    };

                    let Dispatch { id, config, budget } = job;
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        worker.evaluate(Some(config), budget)
                    }));
                    let result = match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            error!("Worker {} panicked while evaluating {}", index, id);
                            worker.crashed_trial(budget, "trainer panicked")
                        }
                    };
                    let completion = Completion {
                        id,
                        worker: index,
                        result,
                    };
                    if results.send(completion).is_err() {
                        break;
                    }
                }
                debug!("Worker {} stopped", index);
                worker
            })
            .map_err(Error::from);
        self.handles.push(track!(handle)?);
        Ok(())
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Returns the number of submitted jobs whose results have not been received.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Returns `true` if another job may be submitted under the queue policy.
    pub fn can_submit(&self) -> bool {
        match self.policy {
            QueuePolicy::Bounded { extra } => self.outstanding < self.num_workers() + extra,
            QueuePolicy::Unbounded => true,
        }
    }

    /// Submits a job.
    ///
    /// # Errors
    ///
    /// If no worker is registered or the queue is full, an `ErrorKind::Other` error will be returned.
    pub fn submit(&mut self, job: Dispatch) -> Result<()> {
        track_assert!(self.num_workers() > 0, ErrorKind::Other, "no registered workers");
        track_assert!(self.can_submit(), ErrorKind::Other, "job queue is full");
        track!(self
            .job_tx
            .send(job)
            .map_err(|e| ErrorKind::Bug.cause(e.to_string())))?;
        self.outstanding += 1;
        Ok(())
    }

    /// Waits up to `timeout` for a result.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Completion>> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(c) => {
                self.outstanding -= 1;
                Ok(Some(c))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                track_panic!(ErrorKind::Bug, "result channel disconnected")
            }
        }
    }

    /// Stops every worker after its current job and returns them.
    ///
    /// Jobs still waiting in the queue are evaluated first; their results are dropped.
    pub fn shutdown(self) -> Vec<EvaluationWorker<T>> {
        let WorkerPool {
            job_tx, handles, ..
        } = self;
        drop(job_tx);
        handles
            .into_iter()
            .filter_map(|h| match h.join() {
                Ok(w) => Some(w),
                Err(_) => {
                    warn!("A worker thread could not be joined");
                    None
                }
            })
            .collect()
    }

    /// Detaches every worker thread without waiting for it.
    ///
    /// Results of in-flight jobs are discarded.
    pub fn abandon(self) {
        if self.outstanding > 0 {
            warn!(
                "Abandoning {} worker(s) with {} in-flight job(s)",
                self.handles.len(),
                self.outstanding
            );
        }
    }
}
