//! [`StateMachine`] – per-module lifecycle state machine.
//!
//! Holds the current [`State`] of one module, validates requested transitions
//! against a fixed table plus optional guards, runs the exit action of the old
//! state and the entry action of the new one, and notifies listeners.
//!
//! # Transition table
//!
//! | from | allowed targets |
//! |---|---|
//! | `Idle` | `Ready`, `Stopped`, `Error` |
//! | `Ready` | `Running`, `Idle`, `Stopped`, `Error` |
//! | `Running` | `Ready`, `Stopped`, `Error` |
//! | `Stopped` | `Idle`, `Error` |
//! | `Error` | `Stopped`, `Idle` |
//!
//! # Commit semantics
//!
//! A transition is committed as soon as its guard passes.  If the exit or
//! entry action then fails, the new state stays in place, listeners are still
//! notified and the failure is returned as [`JoanError::ActionFailed`].  The
//! [`ModuleManager`](crate::ModuleManager) turns that error into a follow-up
//! transition to `Error`.
//!
//! # Example
//!
//! ```
//! use joan_core::StateMachine;
//! use joan_types::{ModuleId, State};
//!
//! let machine = StateMachine::new(ModuleId::CarlaInterface);
//! machine.set_transition_condition(State::Idle, State::Ready, || Err("not connected".into()));
//!
//! let err = machine.request_state_change(State::Ready, "").unwrap_err();
//! assert!(err.to_string().contains("not connected"));
//! assert_eq!(machine.current_state(), State::Idle);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use joan_types::{ActionPhase, JoanError, ModuleId, State};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Lifecycle hook bound to entering or leaving a state.
pub type ActionFn = Arc<dyn Fn() -> Result<(), JoanError> + Send + Sync>;

/// Side-effect-free predicate gating one edge.  `Err(reason)` rejects.
pub type GuardFn = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// Observer invoked after every committed transition.
pub type ListenerFn = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Allowed targets for each source state.
pub const fn allowed_targets(from: State) -> &'static [State] {
    match from {
        State::Idle => &[State::Ready, State::Stopped, State::Error],
        State::Ready => &[State::Running, State::Idle, State::Stopped, State::Error],
        State::Running => &[State::Ready, State::Stopped, State::Error],
        State::Stopped => &[State::Idle, State::Error],
        State::Error => &[State::Stopped, State::Idle],
    }
}

/// A committed transition, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub module: ModuleId,
    pub from: State,
    pub to: State,
    pub reason: String,
}

/// Successful outcome of [`StateMachine::request_state_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The machine was already in the requested state; nothing ran.
    Unchanged(State),
    /// The transition was committed and every action succeeded.
    Committed(StateChange),
}

impl Transition {
    /// State of the machine after the request.
    pub fn state(&self) -> State {
        match self {
            Transition::Unchanged(state) => *state,
            Transition::Committed(change) => change.to,
        }
    }
}

#[derive(Default)]
struct ActionTable {
    entry: [Option<ActionFn>; 5],
    exit: [Option<ActionFn>; 5],
}

/// Per-module finite-state machine.
///
/// All methods take `&self`; share the machine as `Arc<StateMachine>`.
/// Transitions are serialized: a request from another thread waits for the
/// in-progress transition to finish.  A request issued from inside one of
/// this machine's own actions or listeners is refused with
/// [`JoanError::ReentrantTransition`].
pub struct StateMachine {
    module: ModuleId,
    current: RwLock<State>,
    actions: RwLock<ActionTable>,
    guards: RwLock<HashMap<(State, State), GuardFn>>,
    listeners: RwLock<Vec<ListenerFn>>,
    transition: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

impl StateMachine {
    /// Create a machine for `module` in the `Idle` state with no actions,
    /// guards or listeners.
    pub fn new(module: ModuleId) -> Self {
        Self {
            module,
            current: RwLock::new(State::Idle),
            actions: RwLock::new(ActionTable::default()),
            guards: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            transition: Mutex::new(()),
            owner: Mutex::new(None),
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn current_state(&self) -> State {
        *self.current.read()
    }

    /// Targets reachable from the current state, guards not considered.
    pub fn allowed_targets(&self) -> &'static [State] {
        allowed_targets(self.current_state())
    }

    /// Bind `action` to entering `state`, replacing any previous one.
    pub fn set_entry_action<F>(&self, state: State, action: F)
    where
        F: Fn() -> Result<(), JoanError> + Send + Sync + 'static,
    {
        self.actions.write().entry[state.index()] = Some(Arc::new(action));
    }

    /// Bind `action` to leaving `state`, replacing any previous one.
    pub fn set_exit_action<F>(&self, state: State, action: F)
    where
        F: Fn() -> Result<(), JoanError> + Send + Sync + 'static,
    {
        self.actions.write().exit[state.index()] = Some(Arc::new(action));
    }

    /// Guard the edge `from → to`.  Replaces any previous guard on that edge.
    pub fn set_transition_condition<F>(&self, from: State, to: State, guard: F)
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.guards.write().insert((from, to), Arc::new(guard));
    }

    /// Register `listener`.  Listeners run synchronously, in registration
    /// order, after every committed transition.
    pub fn add_state_change_listener<F>(&self, listener: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Request a transition to `target`.
    ///
    /// # Errors
    ///
    /// - [`JoanError::IllegalTransition`] – the edge is not in the table.
    /// - [`JoanError::TransitionRejected`] – the edge's guard declined.
    /// - [`JoanError::ReentrantTransition`] – called from inside this
    ///   machine's own action or listener.
    /// - [`JoanError::ActionFailed`] – the transition *was* committed but an
    ///   exit or entry action failed.
    pub fn request_state_change(&self, target: State, reason: &str) -> Result<Transition, JoanError> {
        self.request_state_change_if(target, reason, || true)
    }

    /// Like [`request_state_change`](Self::request_state_change), but only
    /// proceeds if `still_valid` holds once earlier transitions have
    /// finished.  The check runs under the transition lock.
    ///
    /// # Errors
    ///
    /// [`JoanError::Superseded`] when `still_valid` returns `false`; the
    /// state is unchanged.  Otherwise as
    /// [`request_state_change`](Self::request_state_change).
    pub fn request_state_change_if<P>(
        &self,
        target: State,
        reason: &str,
        still_valid: P,
    ) -> Result<Transition, JoanError>
    where
        P: FnOnce() -> bool,
    {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            warn!(module = %self.module, to = %target, "re-entrant transition refused");
            return Err(JoanError::ReentrantTransition {
                module: self.module,
                to: target,
            });
        }

        let _serial = self.transition.lock();
        *self.owner.lock() = Some(me);
        let _owner = OwnerReset(&self.owner);

        if !still_valid() {
            debug!(module = %self.module, to = %target, reason, "superseded request dropped");
            return Err(JoanError::Superseded {
                module: self.module,
                to: target,
            });
        }

        let from = self.current_state();
        if from == target {
            return Ok(Transition::Unchanged(from));
        }

        if !allowed_targets(from).contains(&target) {
            warn!(module = %self.module, %from, to = %target, "illegal transition");
            return Err(JoanError::IllegalTransition {
                module: self.module,
                from,
                to: target,
            });
        }

        let guard = self.guards.read().get(&(from, target)).cloned();
        if let Some(guard) = guard
            && let Err(why) = guard()
        {
            warn!(module = %self.module, %from, to = %target, reason = %why, "transition rejected");
            return Err(JoanError::TransitionRejected {
                module: self.module,
                from,
                to: target,
                reason: why,
            });
        }

        let (exit, entry) = {
            let table = self.actions.read();
            (table.exit[from.index()].clone(), table.entry[target.index()].clone())
        };

        let mut failure = None;
        if let Some(exit) = exit
            && let Err(e) = exit()
        {
            failure = Some(self.action_failed(from, ActionPhase::Exit, &e));
        }

        *self.current.write() = target;
        info!(module = %self.module, %from, to = %target, reason, "state changed");

        if let Some(entry) = entry
            && let Err(e) = entry()
        {
            let err = self.action_failed(target, ActionPhase::Entry, &e);
            failure.get_or_insert(err);
        }

        let change = StateChange {
            module: self.module,
            from,
            to: target,
            reason: reason.to_string(),
        };
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener(&change);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(Transition::Committed(change)),
        }
    }

    fn action_failed(&self, state: State, phase: ActionPhase, cause: &JoanError) -> JoanError {
        error!(module = %self.module, %state, %phase, error = %cause, "lifecycle action failed");
        JoanError::ActionFailed {
            module: self.module,
            state,
            phase,
            reason: cause.to_string(),
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("module", &self.module)
            .field("current", &self.current_state())
            .field("guards", &self.guards.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

struct OwnerReset<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}
