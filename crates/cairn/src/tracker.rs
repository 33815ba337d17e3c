//! Background work with progress reporting.
//!
//! A [`ProgressTracker`] runs one work routine at a time on its own thread.
//! The routine receives a [`Progress`] handle and must call
//! [`Progress::set_goal`] near its start; until it does, [`start`] keeps the
//! caller waiting. A routine that returns (or panics) without setting a
//! goal makes `start` fail with [`TrackerError::ActionFailed`].
//!
//! Cancellation is cooperative: [`ProgressTracker::stop`] only raises a
//! flag that the routine polls through [`Progress::stopping`].
//!
//! [`start`]: ProgressTracker::start

use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error};

/// How long `start` sleeps between liveness checks on the worker.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Remaining-time estimate reported before any progress has been made.
pub const UNKNOWN_ETA: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("a worker is already running")]
    AlreadyStarted,

    #[error("no work routine configured")]
    NothingToDo,

    #[error("worker exited without setting a goal")]
    ActionFailed,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Worker spawned, goal not yet known.
    Starting,
    /// Goal known, progress flowing.
    Running,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    goal_set: bool,
    steps: u64,
    done: u64,
    since: Instant,
    updated: Instant,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    stopping: AtomicBool,
}

/// Worker-side handle passed to the work routine.
#[derive(Debug, Clone)]
pub struct Progress {
    shared: Arc<Shared>,
}

impl Progress {
    /// Establish the number of steps this run will take.
    pub fn set_goal(&self, steps: u64, done: u64) {
        let mut state = self.shared.state.lock();
        state.steps = steps;
        state.done = done.min(steps);
        state.updated = Instant::now();
        state.goal_set = true;
        if state.phase == Phase::Starting {
            state.phase = Phase::Running;
        }
        self.shared.changed.notify_all();
    }

    /// Add `delta` to the done count, clamped to `0..=steps`.
    pub fn update(&self, delta: i64) {
        let mut state = self.shared.state.lock();
        let done = (state.done as i128 + delta as i128).clamp(0, state.steps as i128);
        state.done = done as u64;
        state.updated = Instant::now();
    }

    pub fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }
}

/// A consistent view of a run's progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub done: u64,
    pub steps: u64,
    /// Whole percent complete.
    pub percent: u8,
    pub elapsed: Duration,
    /// Estimated time remaining.
    pub eta: Duration,
}

type Work<A, R> = dyn Fn(&Progress, A) -> R + Send + Sync;

/// Runs a work routine on a background thread and tracks its progress.
pub struct ProgressTracker<A, R> {
    name: Option<String>,
    work: Option<Arc<Work<A, R>>>,
    shared: Arc<Shared>,
    result: Arc<Mutex<Option<R>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl<A, R> std::fmt::Debug for ProgressTracker<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl<A, R> Default for ProgressTracker<A, R> {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            name: None,
            work: None,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    goal_set: false,
                    steps: 0,
                    done: 0,
                    since: now,
                    updated: now,
                }),
                changed: Condvar::new(),
                stopping: AtomicBool::new(false),
            }),
            result: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl<A, R> ProgressTracker<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    pub fn new(work: impl Fn(&Progress, A) -> R + Send + Sync + 'static) -> Self {
        Self {
            work: Some(Arc::new(work)),
            ..Self::default()
        }
    }

    /// Name given to the worker thread.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn the work routine and wait until it sets its goal.
    pub fn start(&self, args: A) -> Result<(), TrackerError> {
        let work = self.work.clone().ok_or(TrackerError::NothingToDo)?;

        {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::Idle {
                return Err(TrackerError::AlreadyStarted);
            }
            let now = Instant::now();
            state.phase = Phase::Starting;
            state.goal_set = false;
            state.steps = 0;
            state.done = 0;
            state.since = now;
            state.updated = now;
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        *self.result.lock() = None;

        // Reap a previous run's thread; it has already left the routine.
        if let Some(previous) = self.worker.lock().take() {
            let _ = previous.join();
        }

        let progress = Progress {
            shared: self.shared.clone(),
        };
        let result = self.result.clone();
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }

        let spawned = builder.spawn(move || {
            match catch_unwind(AssertUnwindSafe(|| work(&progress, args))) {
                Ok(value) => *result.lock() = Some(value),
                Err(_) => error!("Worker panicked"),
            }

            let mut state = progress.shared.state.lock();
            if state.goal_set {
                // Final zero-delta update.
                state.updated = Instant::now();
            }
            state.phase = Phase::Idle;
            progress.shared.changed.notify_all();
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.state.lock().phase = Phase::Idle;
                return Err(err.into());
            }
        };

        let mut state = self.shared.state.lock();
        loop {
            if state.goal_set {
                drop(state);
                *self.worker.lock() = Some(handle);
                debug!(name = ?self.name, "Worker started");
                return Ok(());
            }

            if state.phase == Phase::Idle || handle.is_finished() {
                // The bounded wait below catches a worker that died
                // without ever signalling.
                state.phase = Phase::Idle;
                drop(state);
                let _ = handle.join();
                return Err(TrackerError::ActionFailed);
            }

            let _ = self
                .shared
                .changed
                .wait_for(&mut state, self.poll_interval);
        }
    }

    /// Start, wait for completion, and return the routine's result.
    pub fn run(&self, args: A) -> Result<Option<R>, TrackerError> {
        self.start(args)?;
        self.wait(None);
        Ok(self.take_result())
    }

    /// Block until the worker exits or `timeout` elapses.
    ///
    /// Returns true if no worker is running any more.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut state = self.shared.state.lock();
            while state.phase != Phase::Idle {
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .changed
                            .wait_until(&mut state, deadline)
                            .timed_out()
                            && state.phase != Phase::Idle
                        {
                            return false;
                        }
                    }
                    None => self.shared.changed.wait(&mut state),
                }
            }
        }

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        true
    }

    /// The value returned by the last completed run, if not taken yet.
    pub fn take_result(&self) -> Option<R> {
        self.result.lock().take()
    }
}

impl<A, R> ProgressTracker<A, R> {
    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Whether the current run has established its goal.
    pub fn started(&self) -> bool {
        self.shared.state.lock().goal_set
    }

    /// Ask the worker to stop. It decides when.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
    }

    pub fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Caller-side progress update; see [`Progress::update`].
    pub fn update(&self, delta: i64) {
        Progress {
            shared: self.shared.clone(),
        }
        .update(delta)
    }

    pub fn sample(&self) -> Sample {
        let state = self.shared.state.lock();
        let now = Instant::now();

        let percent = if state.steps > 0 {
            (state.done as u128 * 100 / state.steps as u128) as u8
        } else {
            0
        };

        let eta = if percent > 0 {
            // Time to do the rest, less the time already spent since the
            // last update.
            let busy = state.updated.duration_since(state.since).as_secs_f64();
            let idle = now.duration_since(state.updated).as_secs_f64();
            let pc = f64::from(percent);
            let remaining = busy * (100.0 - pc) / pc - idle;
            Duration::from_secs_f64(remaining.max(0.0))
        } else {
            UNKNOWN_ETA
        };

        Sample {
            done: state.done,
            steps: state.steps,
            percent,
            elapsed: now.duration_since(state.since),
            eta,
        }
    }
}
