//! [`Worker`] – a module's independently scheduled unit of work.
//!
//! A worker wraps a module-supplied [`WorkerAction`] and runs it as a tokio
//! task that ticks at a fixed interval.  The control thread only blocks to
//! launch the task ([`Worker::start`]) and, bounded by a grace period, to wait
//! for it to finish ([`Worker::terminate`]).
//!
//! The action's hooks are synchronous and may block, so every call into them
//! (`on_start`, each `tick`, `on_stop`) is made on tokio's blocking pool.  The
//! async task only paces the ticks and reports heartbeats.
//!
//! # Stopping
//!
//! Termination is cooperative first: a shared run flag is cleared and the
//! task exits at its next tick boundary.  If it has not finished when the
//! grace period runs out, the task is aborted and no further tick starts.
//!
//! Aborting cannot interrupt a tick that is already executing.  That tick
//! runs to completion and [`Worker::is_alive`] keeps reporting `true` until
//! it returns.  Long ticks should poll [`TickContext::stop_requested`] and
//! return early.
//!
//! # Talking back to the owner
//!
//! A tick may ask its module to change state by returning
//! [`TickOutcome::RequestState`].  A hook that returns an error or panics is
//! a worker failure: it is logged, the loop ends and the module is asked to
//! move to `Error`.  Requests are handed to the owner on tokio's blocking
//! pool so the tick loop never waits on the owner's state machine.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use joan_news::News;
use joan_types::{JoanError, ModuleId, State};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::watchdog::Watchdog;

/// How often [`Worker::terminate`] checks whether the task has finished.
const TERMINATE_POLL: Duration = Duration::from_millis(2);

/// Callback the worker uses to request a state change of its owner.
pub type StateRequester = Arc<dyn Fn(State, String) + Send + Sync>;

/// What a tick wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Ask the owning module to transition.  The loop keeps ticking until
    /// the owner stops it.
    RequestState { target: State, reason: String },
}

/// Per-tick view handed to a [`WorkerAction`].
pub struct TickContext<'a> {
    module: ModuleId,
    news: &'a News,
    tick: u64,
    interval: Duration,
    run_flag: Option<&'a AtomicBool>,
}

impl<'a> TickContext<'a> {
    pub fn new(module: ModuleId, news: &'a News, tick: u64, interval: Duration) -> Self {
        Self {
            module,
            news,
            tick,
            interval,
            run_flag: None,
        }
    }

    /// Tie [`stop_requested`](Self::stop_requested) to a worker's run flag.
    pub fn with_run_flag(mut self, run_flag: &'a AtomicBool) -> Self {
        self.run_flag = Some(run_flag);
        self
    }

    /// The module this worker belongs to.
    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn news(&self) -> &'a News {
        self.news
    }

    /// Number of completed ticks before this one.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// `true` once the owner has asked the worker to stop.
    pub fn stop_requested(&self) -> bool {
        self.run_flag.is_some_and(|flag| !flag.load(Ordering::SeqCst))
    }
}

/// Domain work of a module, executed once per tick.
///
/// Every hook runs on a blocking-pool thread and may block.
pub trait WorkerAction: Send + 'static {
    /// Runs before the first tick.  An error or panic aborts the worker and
    /// drives the module to `Error`.
    fn on_start(&mut self, _ctx: &TickContext<'_>) -> Result<(), JoanError> {
        Ok(())
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, JoanError>;

    /// Runs after the last tick of a cooperative stop.  Not called when the
    /// task is aborted.
    fn on_stop(&mut self, _ctx: &TickContext<'_>) -> Result<(), JoanError> {
        Ok(())
    }
}

/// How a call to [`Worker::terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The worker was never started or had already finished.
    NotRunning,
    /// The task honoured the run flag within the grace period.
    Cooperative,
    /// The grace period ran out and the task was aborted.
    Forced,
}

/// Runtime wrapper around one [`WorkerAction`].
pub struct Worker {
    module: ModuleId,
    interval: Duration,
    news: Arc<News>,
    runtime: Handle,
    requester: StateRequester,
    watchdog: Option<(Arc<Watchdog>, Duration)>,
    action: Option<Box<dyn WorkerAction>>,
    run_flag: Arc<AtomicBool>,
    // Set while a hook is queued or executing on the blocking pool.
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Construct a worker.  Nothing runs until [`start`](Self::start).
    pub fn new(
        module: ModuleId,
        interval: Duration,
        news: Arc<News>,
        runtime: Handle,
        action: Box<dyn WorkerAction>,
        requester: StateRequester,
    ) -> Self {
        Self {
            module,
            interval,
            news,
            runtime,
            requester,
            watchdog: None,
            action: Some(action),
            run_flag: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Report a heartbeat to `watchdog` on every tick; the module counts as
    /// stalled after `timeout` without one.
    pub fn with_watchdog(mut self, watchdog: Arc<Watchdog>, timeout: Duration) -> Self {
        self.watchdog = Some((watchdog, timeout));
        self
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// `true` while the task is running or one of its hooks is still
    /// executing, including a tick left over from a forced stop.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished()) || self.busy.load(Ordering::SeqCst)
    }

    /// `true` once [`start`](Self::start) has consumed the action.
    pub fn has_started(&self) -> bool {
        self.action.is_none()
    }

    /// Launch the tick loop.
    ///
    /// # Errors
    ///
    /// [`JoanError::WorkerFailure`] when the tick interval is zero or the
    /// worker was already started; a worker runs at most once.
    pub fn start(&mut self) -> Result<(), JoanError> {
        if self.interval.is_zero() {
            return Err(JoanError::WorkerFailure {
                module: self.module,
                details: "tick interval must be non-zero".to_string(),
            });
        }
        let action = self.action.take().ok_or_else(|| JoanError::WorkerFailure {
            module: self.module,
            details: "worker was already started".to_string(),
        })?;

        if let Some((watchdog, timeout)) = &self.watchdog {
            watchdog.register(self.module, *timeout);
        }
        self.run_flag.store(true, Ordering::SeqCst);

        let task = TickLoop {
            module: self.module,
            interval: self.interval,
            news: Arc::clone(&self.news),
            runtime: self.runtime.clone(),
            requester: Arc::clone(&self.requester),
            watchdog: self.watchdog.as_ref().map(|(wd, _)| Arc::clone(wd)),
            run_flag: Arc::clone(&self.run_flag),
            busy: Arc::clone(&self.busy),
        };
        self.handle = Some(self.runtime.spawn(task.run(action)));
        info!(module = %self.module, interval = ?self.interval, "worker started");
        Ok(())
    }

    /// Stop the tick loop, waiting at most `grace` for it to exit on its own
    /// before aborting it.  Blocks the calling thread.
    ///
    /// After [`Termination::Forced`] the handle is kept, so
    /// [`is_alive`](Self::is_alive) stays truthful while an interrupted tick
    /// finishes.
    pub fn terminate(&mut self, grace: Duration) -> Termination {
        self.run_flag.store(false, Ordering::SeqCst);
        if let Some((watchdog, _)) = &self.watchdog {
            watchdog.deregister(self.module);
        }

        let Some(handle) = self.handle.as_ref() else {
            return Termination::NotRunning;
        };
        if handle.is_finished() {
            return Termination::NotRunning;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if handle.is_finished() {
                debug!(module = %self.module, "worker stopped");
                return Termination::Cooperative;
            }
            std::thread::sleep(TERMINATE_POLL);
        }
        if handle.is_finished() {
            return Termination::Cooperative;
        }

        handle.abort();
        warn!(
            module = %self.module,
            grace = ?grace,
            "worker did not stop within grace period; aborted"
        );
        Termination::Forced
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // A dropped JoinHandle detaches the task; make sure it winds down.
        self.run_flag.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("module", &self.module)
            .field("interval", &self.interval)
            .field("started", &self.has_started())
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tick loop
// ─────────────────────────────────────────────────────────────────────────────

struct TickLoop {
    module: ModuleId,
    interval: Duration,
    news: Arc<News>,
    runtime: Handle,
    requester: StateRequester,
    watchdog: Option<Arc<Watchdog>>,
    run_flag: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
}

type Called<T> = (Box<dyn WorkerAction>, Result<T, JoanError>);

impl TickLoop {
    async fn run(self, action: Box<dyn WorkerAction>) {
        let mut tick: u64 = 0;

        let Some((mut action, started)) = self.call(action, tick, |a, ctx| a.on_start(ctx)).await else {
            return;
        };
        if let Err(e) = started {
            error!(module = %self.module, error = %e, "worker failed to start");
            self.request(State::Error, e.to_string());
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.run_flag.load(Ordering::SeqCst) {
                break;
            }
            if let Some(watchdog) = &self.watchdog {
                watchdog.heartbeat(self.module);
            }

            let Some((returned, outcome)) = self.call(action, tick, |a, ctx| a.tick(ctx)).await else {
                return;
            };
            action = returned;
            match outcome {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::RequestState { target, reason }) => {
                    debug!(module = %self.module, to = %target, reason = %reason, "worker requested transition");
                    self.request(target, reason);
                }
                Err(e) => {
                    error!(module = %self.module, tick, error = %e, "worker tick failed");
                    self.run_flag.store(false, Ordering::SeqCst);
                    self.request(State::Error, e.to_string());
                    return;
                }
            }
            tick += 1;
        }

        if let Some((_, Err(e))) = self.call(action, tick, |a, ctx| a.on_stop(ctx)).await {
            warn!(module = %self.module, error = %e, "worker stop hook failed");
        }
    }

    /// Run one hook of `action` on the blocking pool and hand the action
    /// back.  A panic becomes [`JoanError::WorkerFailure`].  `None` when the
    /// runtime is shutting down.
    async fn call<T, F>(&self, mut action: Box<dyn WorkerAction>, tick: u64, hook: F) -> Option<Called<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn WorkerAction>, &TickContext<'_>) -> Result<T, JoanError> + Send + 'static,
    {
        let module = self.module;
        let interval = self.interval;
        let news = Arc::clone(&self.news);
        let run_flag = Arc::clone(&self.run_flag);
        let busy = Arc::clone(&self.busy);

        self.busy.store(true, Ordering::SeqCst);
        let joined = self
            .runtime
            .spawn_blocking(move || {
                let ctx = TickContext::new(module, &news, tick, interval).with_run_flag(&run_flag);
                let caught = panic::catch_unwind(AssertUnwindSafe(|| hook(&mut action, &ctx)));
                busy.store(false, Ordering::SeqCst);
                let outcome = caught.unwrap_or_else(|payload| {
                    Err(JoanError::WorkerFailure {
                        module,
                        details: format!("worker panicked: {}", panic_message(payload.as_ref())),
                    })
                });
                (action, outcome)
            })
            .await;

        match joined {
            Ok(called) => Some(called),
            Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                debug!(module = %self.module, error = %e, "worker hook did not complete");
                None
            }
        }
    }

    fn request(&self, target: State, reason: String) {
        let requester = Arc::clone(&self.requester);
        drop(self.runtime.spawn_blocking(move || requester(target, reason)));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
