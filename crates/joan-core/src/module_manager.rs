//! [`ModuleManager`] – binds one [`Module`] to its state machine, its bus
//! entry and its worker.
//!
//! # Lifecycle wiring
//!
//! | state | entry | exit |
//! |---|---|---|
//! | `Idle` | initialize | – |
//! | `Ready` | get_ready | – |
//! | `Running` | start | – |
//! | `Stopped` | stop | cleanup |
//! | `Error` | stop | – |
//!
//! * **initialize** – fresh shared values are published on the bus.
//! * **get_ready** – a new worker is built (not started).
//! * **start** – the prepared worker is started.
//! * **stop** – the worker is terminated.
//! * **cleanup** – the bus entry is removed.
//!
//! Every entry action also mirrors the new state into the published values.
//!
//! A freshly constructed manager is driven to `Stopped` immediately, so the
//! first transition an operator requests is `Stopped → Idle`.
//!
//! # Failures
//!
//! When an entry or exit action fails the transition stays committed and the
//! manager follows up with a transition to `Error` carrying the failure text.
//! The original [`JoanError::ActionFailed`] is still returned to the caller.
//!
//! # Worker requests
//!
//! Every worker built by `get_ready` carries a generation number; `stop` and
//! the next `get_ready` retire it.  A request from a retired worker, e.g. a
//! tick failure that raced with the operator stopping the module, is dropped
//! with [`JoanError::Superseded`] instead of hitting the next lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use joan_news::{News, Slot};
use joan_types::{JoanError, ModuleId, SharedValues, State};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::state_machine::{StateChange, StateMachine, Transition};
use crate::status::StatusRegistry;
use crate::watchdog::Watchdog;
use crate::worker::{StateRequester, Termination, Worker, WorkerAction};

/// Lower bound for a worker's watchdog deadline.
const MIN_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Module trait
// ─────────────────────────────────────────────────────────────────────────────

/// Domain behaviour of one pluggable module.
///
/// The manager owns the module and calls into it from lifecycle actions, so
/// every method runs on the thread that requested the transition.
pub trait Module: Send + Sync + 'static {
    fn id(&self) -> ModuleId;

    /// A fresh shared-values record.  Called on every entry to `Idle`.
    fn shared_values(&self) -> Box<dyn SharedValues>;

    /// The per-tick work for a new worker.  Called on every entry to `Ready`.
    ///
    /// # Errors
    ///
    /// Any error fails the `Ready` entry action and drives the module to
    /// `Error`.
    fn worker_action(&self) -> Result<Box<dyn WorkerAction>, JoanError>;

    /// Install transition guards on the module's own machine.  Called once
    /// during construction.
    fn install_guards(&self, _machine: &StateMachine) {}

    /// Runs at the start of the `Idle` entry action, before the shared values
    /// are published.
    fn on_initialize(&self) -> Result<(), JoanError> {
        Ok(())
    }

    /// Runs after the worker was terminated in the `Stopped` and `Error`
    /// entry actions.
    fn on_stop(&self) -> Result<(), JoanError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and services
// ─────────────────────────────────────────────────────────────────────────────

/// Per-module timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Worker tick interval.
    pub tick: Duration,
    /// How long `stop` waits for a cooperative worker exit before aborting.
    pub termination_grace: Duration,
    /// The worker counts as stalled after `tick * watchdog_factor` without a
    /// heartbeat.
    pub watchdog_factor: u32,
}

impl ManagerConfig {
    /// Same knobs, different tick.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Heartbeat deadline registered with the watchdog.
    pub fn watchdog_timeout(&self) -> Duration {
        self.tick
            .saturating_mul(self.watchdog_factor.max(1))
            .max(MIN_WATCHDOG_TIMEOUT)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            termination_grace: Duration::from_millis(500),
            watchdog_factor: 10,
        }
    }
}

/// Process-wide collaborators injected into every manager.
#[derive(Clone)]
pub struct Services {
    pub news: Arc<News>,
    pub status: Arc<StatusRegistry>,
    /// Runtime the workers are spawned on.
    pub runtime: Handle,
    pub watchdog: Option<Arc<Watchdog>>,
}

impl Services {
    /// Fresh bus and registry, no watchdog.
    pub fn new(runtime: Handle) -> Self {
        Self {
            news: Arc::new(News::new()),
            status: Arc::new(StatusRegistry::new()),
            runtime,
            watchdog: None,
        }
    }

    pub fn with_watchdog(mut self, watchdog: Arc<Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleManager
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of one module's state machine, bus slot and worker.
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    this: Weak<ManagerInner>,
    id: ModuleId,
    module: Box<dyn Module>,
    config: ManagerConfig,
    services: Services,
    machine: Arc<StateMachine>,
    shared: Mutex<Option<Slot>>,
    worker: Mutex<Option<Worker>>,
    // Force-stopped workers whose last hook has not returned yet.
    lingering: Mutex<Vec<Worker>>,
    generation: AtomicU64,
}

impl ModuleManager {
    /// Build the manager, register its machine in the status registry, wire
    /// the lifecycle actions, let the module install its guards and move to
    /// `Stopped`.
    ///
    /// # Errors
    ///
    /// [`JoanError::DuplicateModule`] when a module with the same id is
    /// already registered.  Any error of the initial `Stopped` transition;
    /// the machine is unregistered again in that case.
    pub fn new(
        module: Box<dyn Module>,
        services: Services,
        config: ManagerConfig,
    ) -> Result<Self, JoanError> {
        let id = module.id();
        let machine = Arc::new(StateMachine::new(id));
        services.status.register(Arc::clone(&machine))?;

        let inner = Arc::new_cyclic(|this| ManagerInner {
            this: this.clone(),
            id,
            module,
            config,
            services,
            machine,
            shared: Mutex::new(None),
            worker: Mutex::new(None),
            lingering: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        });
        ManagerInner::wire(&inner);
        inner.module.install_guards(&inner.machine);

        let manager = Self { inner };
        if let Err(e) = manager.request_state_change(State::Stopped, "module constructed") {
            manager.inner.services.status.unregister(&manager.inner.machine);
            return Err(e);
        }
        info!(module = %id, tick = ?config.tick, "module manager ready");
        Ok(manager)
    }

    pub fn id(&self) -> ModuleId {
        self.inner.id
    }

    pub fn module(&self) -> &dyn Module {
        self.inner.module.as_ref()
    }

    pub fn config(&self) -> ManagerConfig {
        self.inner.config
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.inner.machine
    }

    pub fn current_state(&self) -> State {
        self.inner.machine.current_state()
    }

    /// The bus slot published on the last entry to `Idle`, if the module is
    /// initialized.
    pub fn shared_values(&self) -> Option<Slot> {
        self.inner.shared.lock().clone()
    }

    /// `true` while the module's worker task is running, or a force-stopped
    /// worker is still finishing its last tick.
    pub fn worker_alive(&self) -> bool {
        if self.inner.worker.lock().as_ref().is_some_and(Worker::is_alive) {
            return true;
        }
        let mut lingering = self.inner.lingering.lock();
        lingering.retain(Worker::is_alive);
        !lingering.is_empty()
    }

    pub fn add_state_change_listener<F>(&self, listener: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.machine.add_state_change_listener(listener);
    }

    /// Ask the module to move to `target`.
    ///
    /// # Errors
    ///
    /// Everything [`StateMachine::request_state_change`] returns.  On
    /// [`JoanError::ActionFailed`] the module has additionally been driven to
    /// `Error`.
    pub fn request_state_change(&self, target: State, reason: &str) -> Result<Transition, JoanError> {
        self.inner.request(target, reason)
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("module", &self.inner.id)
            .field("state", &self.current_state())
            .field("worker_alive", &self.worker_alive())
            .finish()
    }
}

impl ManagerInner {
    fn wire(this: &Arc<Self>) {
        let machine = &this.machine;
        machine.set_entry_action(State::Idle, Self::action(this, Self::initialize));
        machine.set_entry_action(State::Ready, Self::action(this, Self::get_ready));
        machine.set_entry_action(State::Running, Self::action(this, Self::start));
        machine.set_entry_action(State::Stopped, Self::action(this, Self::stop));
        machine.set_exit_action(State::Stopped, Self::action(this, Self::cleanup));
        machine.set_entry_action(State::Error, Self::action(this, Self::stop));
    }

    /// Lifecycle action that calls `op` on the manager while it is alive.
    fn action(
        this: &Arc<Self>,
        op: fn(&Self) -> Result<(), JoanError>,
    ) -> impl Fn() -> Result<(), JoanError> + Send + Sync + 'static {
        let weak = Arc::downgrade(this);
        move || match weak.upgrade() {
            Some(inner) => op(&inner),
            None => Ok(()),
        }
    }

    /// Requester for the worker of `generation`.  Requests go through
    /// [`request_if`](Self::request_if) so action failures they cause are
    /// converted like any other, and are dropped once that worker is retired.
    fn requester(&self, generation: u64) -> StateRequester {
        let weak = self.this.clone();
        Arc::new(move |target, reason: String| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let current = || inner.generation.load(Ordering::SeqCst) == generation;
            if let Err(e) = inner.request_if(target, &reason, current) {
                debug!(module = %inner.id, to = %target, error = %e, "worker request not applied");
            }
        })
    }

    fn request(&self, target: State, reason: &str) -> Result<Transition, JoanError> {
        self.request_if(target, reason, || true)
    }

    fn request_if<P>(&self, target: State, reason: &str, still_valid: P) -> Result<Transition, JoanError>
    where
        P: FnOnce() -> bool,
    {
        match self.machine.request_state_change_if(target, reason, still_valid) {
            Err(err @ JoanError::ActionFailed { .. }) => {
                error!(module = %self.id, error = %err, "lifecycle action failed; entering Error");
                if self.machine.current_state() != State::Error
                    && let Err(follow_up) = self.machine.request_state_change(State::Error, &err.to_string())
                {
                    warn!(module = %self.id, error = %follow_up, "could not enter Error");
                }
                Err(err)
            }
            other => other,
        }
    }

    // ── lifecycle actions ────────────────────────────────────────────────────

    fn initialize(&self) -> Result<(), JoanError> {
        self.module.on_initialize()?;
        let mut values = self.module.shared_values();
        values.set_state(self.machine.current_state());
        let slot = self.services.news.write(self.id, values);
        *self.shared.lock() = Some(slot);
        debug!(module = %self.id, "initialized");
        Ok(())
    }

    fn get_ready(&self) -> Result<(), JoanError> {
        if self.config.tick.is_zero() {
            return Err(JoanError::WorkerFailure {
                module: self.id,
                details: "tick interval must be non-zero".to_string(),
            });
        }
        let action = self.module.worker_action()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut worker = Worker::new(
            self.id,
            self.config.tick,
            Arc::clone(&self.services.news),
            self.services.runtime.clone(),
            action,
            self.requester(generation),
        );
        if let Some(watchdog) = &self.services.watchdog {
            worker = worker.with_watchdog(Arc::clone(watchdog), self.config.watchdog_timeout());
        }

        let previous = self.worker.lock().replace(worker);
        if let Some(previous) = previous {
            self.retire(previous);
        }
        self.publish_state();
        Ok(())
    }

    fn start(&self) -> Result<(), JoanError> {
        self.publish_state();
        let mut slot = self.worker.lock();
        match slot.as_mut() {
            Some(worker) if !worker.has_started() => worker.start(),
            Some(worker) if worker.is_alive() => Ok(()),
            _ => Err(JoanError::WorkerFailure {
                module: self.id,
                details: "no prepared worker to start".to_string(),
            }),
        }
    }

    fn stop(&self) -> Result<(), JoanError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.publish_state();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            self.retire(worker);
        }
        self.module.on_stop()
    }

    /// Terminate `worker`; keep it around while an aborted tick finishes.
    fn retire(&self, mut worker: Worker) {
        if worker.terminate(self.config.termination_grace) == Termination::Forced {
            warn!(module = %self.id, "worker was force-stopped");
        }
        if worker.is_alive() {
            let mut lingering = self.lingering.lock();
            lingering.retain(Worker::is_alive);
            lingering.push(worker);
        }
    }

    fn cleanup(&self) -> Result<(), JoanError> {
        self.services.news.remove(self.id);
        *self.shared.lock() = None;
        debug!(module = %self.id, "cleaned up");
        Ok(())
    }

    fn publish_state(&self) {
        let slot = self.shared.lock().clone();
        if let Some(slot) = slot {
            slot.write().set_state(self.machine.current_state());
        }
    }
}
