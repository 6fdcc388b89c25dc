//! Background services running next to the search (e.g. ensemble building).
use crate::{Error, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Life cycle of a background task.
pub trait BackgroundService {
    /// Starts the task.
    fn start(&mut self) -> Result<()>;

    /// Waits up to `timeout` for the task to finish; returns `true` if it did.
    fn join(&mut self, timeout: Duration) -> bool;

    /// Returns `true` if the task was started and has not finished.
    fn is_alive(&self) -> bool;

    /// Asks the task to stop and stops waiting for it.
    fn terminate(&mut self);
}

/// Cooperative cancellation flag shared between a service and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);
impl CancellationToken {
    /// Makes a new `CancellationToken` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a polling task wants after one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// Poll again after the interval.
    Continue,

    /// The task is done.
    Done,
}

/// Runs `task` on its own thread every `interval` until it is done, its time
/// limit passes or it is cancelled.
///
/// The token is checked between polls, so a single long poll delays termination.
pub struct PollingService<F> {
    name: String,
    interval: Duration,
    time_limit: Option<Duration>,
    task: Option<F>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    done: Option<Receiver<()>>,
    exited: Arc<AtomicBool>,
}
impl<F> PollingService<F>
where
    F: FnMut() -> Result<Poll> + Send + 'static,
{
    /// Makes a new `PollingService` instance.
    pub fn new<S: Into<String>>(name: S, interval: Duration, task: F) -> Self {
        Self {
            name: name.into(),
            interval,
            time_limit: None,
            task: Some(task),
            token: CancellationToken::new(),
            handle: None,
            done: None,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops polling once `limit` has elapsed since the start.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Returns the token the task thread honors.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
impl<F> BackgroundService for PollingService<F>
where
    F: FnMut() -> Result<Poll> + Send + 'static,
{
    fn start(&mut self) -> Result<()> {
        let mut task = track_assert_some!(
            self.task.take(),
            ErrorKind::InvalidInput,
            "{} has already been started",
            self.name
        );
        let (tx, rx) = mpsc::channel();
        let token = self.token.clone();
        let interval = self.interval;
        let deadline = self.time_limit.map(|l| Instant::now() + l);
        let name = self.name.clone();
        let exited = ExitFlag(Arc::clone(&self.exited));
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _exited = exited;
                while !token.is_cancelled() {
                    match task() {
                        Ok(Poll::Continue) => {}
                        Ok(Poll::Done) => break,
                        Err(e) => {
                            error!("{} failed: {}", name, e);
                            break;
                        }
                    }
                    let wake_up = Instant::now() + interval;
                    while !token.is_cancelled() && Instant::now() < wake_up {
                        thread::sleep(CANCELLATION_CHECK_INTERVAL);
                    }
                    if deadline.map_or(false, |d| Instant::now() >= d) {
                        debug!("{} reached its time limit", name);
                        break;
                    }
                }
                let _ = tx.send(());
            })
            .map_err(Error::from);
        self.handle = Some(track!(handle)?);
        self.done = Some(rx);
        Ok(())
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let finished = match &self.done {
            None => return self.handle.is_none(),
            Some(rx) => match rx.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
        };
        if finished {
            self.done = None;
            if let Some(h) = self.handle.take() {
                if h.join().is_err() {
                    warn!("{} panicked", self.name);
                }
            }
        }
        finished
    }

    fn is_alive(&self) -> bool {
        self.handle.is_some() && !self.exited.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.token.cancel();
        if self.handle.take().is_some() {
            warn!("Terminating {} without waiting for it", self.name);
        }
        self.done = None;
    }
}
// Set when the polling thread exits, including by panic.
struct ExitFlag(Arc<AtomicBool>);
impl Drop for ExitFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl<F> std::fmt::Debug for PollingService<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PollingService")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("time_limit", &self.time_limit)
            .field("started", &self.task.is_none())
            .field(
                "alive",
                &(self.handle.is_some() && !self.exited.load(Ordering::SeqCst)),
            )
            .finish()
    }
}
