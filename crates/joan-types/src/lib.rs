//! `joan-types` – shared vocabulary of the JOAN stack.
//!
//! Every other crate speaks in terms of the types defined here:
//!
//! - [`ModuleId`] – the globally unique tag of a module kind, used as the key
//!   of every bus and registry lookup.
//! - [`State`] – the lifecycle states every module moves through.
//! - [`SharedValues`] – the record a module publishes on the news bus.
//! - [`JoanError`] – the single error type of the core.

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use serde_json;

// ─────────────────────────────────────────────────────────────────────────────
// Module identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of a module kind.  Exactly one module of each kind exists per
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleId {
    /// Input devices: keyboard, joystick, steering wheel.
    HardwareManager,
    /// Bridge to the CARLA driving simulator.
    CarlaInterface,
    /// Steering-wheel torque controllers.
    SteeringWheelControl,
    /// Haptic shared-control controllers.
    HapticControllerManager,
    /// Records every other module's news to disk.
    DataRecorder,
    /// Live plots of recorded variables.
    DataPlotter,
    /// Plots of controller internals.
    ControllerPlotter,
    /// Records driven trajectories.
    TrajectoryRecorder,
    /// Experiment definition and condition sequencing.
    ExperimentManager,
    /// Minimal example module.
    Template,
}

impl ModuleId {
    /// Every module kind, in a fixed order.
    pub const ALL: [ModuleId; 10] = [
        ModuleId::HardwareManager,
        ModuleId::CarlaInterface,
        ModuleId::SteeringWheelControl,
        ModuleId::HapticControllerManager,
        ModuleId::DataRecorder,
        ModuleId::DataPlotter,
        ModuleId::ControllerPlotter,
        ModuleId::TrajectoryRecorder,
        ModuleId::ExperimentManager,
        ModuleId::Template,
    ];

    /// Stable snake_case key, as used in `joan.toml` and on the console.
    pub const fn key(self) -> &'static str {
        match self {
            ModuleId::HardwareManager => "hardware_manager",
            ModuleId::CarlaInterface => "carla_interface",
            ModuleId::SteeringWheelControl => "steering_wheel_control",
            ModuleId::HapticControllerManager => "haptic_controller_manager",
            ModuleId::DataRecorder => "data_recorder",
            ModuleId::DataPlotter => "data_plotter",
            ModuleId::ControllerPlotter => "controller_plotter",
            ModuleId::TrajectoryRecorder => "trajectory_recorder",
            ModuleId::ExperimentManager => "experiment_manager",
            ModuleId::Template => "template",
        }
    }

    /// Human-readable name for UI labels.
    pub const fn display_name(self) -> &'static str {
        match self {
            ModuleId::HardwareManager => "Hardware Manager",
            ModuleId::CarlaInterface => "Carla Interface",
            ModuleId::SteeringWheelControl => "Steering Wheel Control",
            ModuleId::HapticControllerManager => "Haptic Controller Manager",
            ModuleId::DataRecorder => "Data Recorder",
            ModuleId::DataPlotter => "Data Plotter",
            ModuleId::ControllerPlotter => "Controller Plotter",
            ModuleId::TrajectoryRecorder => "Trajectory Recorder",
            ModuleId::ExperimentManager => "Experiment Manager",
            ModuleId::Template => "Template",
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ModuleId {
    type Err = JoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ModuleId::ALL
            .into_iter()
            .find(|id| id.key() == wanted)
            .ok_or_else(|| JoanError::UnknownModule(s.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a module.  A module is in exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    /// Shared values exist; nothing is running.  Initial state.
    #[default]
    Idle,
    /// The worker has been constructed but not started.
    Ready,
    /// The worker is ticking.
    Running,
    /// Quiescent: worker halted, shared values about to be released.
    Stopped,
    /// Something went wrong; the worker has been halted.
    Error,
}

impl State {
    /// Every state, in table order.
    pub const ALL: [State; 5] = [
        State::Idle,
        State::Ready,
        State::Running,
        State::Stopped,
        State::Error,
    ];

    /// Position of the state in [`State::ALL`]; used to index fixed tables.
    pub const fn index(self) -> usize {
        match self {
            State::Idle => 0,
            State::Ready => 1,
            State::Running => 2,
            State::Stopped => 3,
            State::Error => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Ready => "READY",
            State::Running => "RUNNING",
            State::Stopped => "STOPPED",
            State::Error => "ERROR",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = JoanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| JoanError::Configuration(format!("unknown state '{s}'")))
    }
}

/// Which side of a transition an action is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPhase {
    Entry,
    Exit,
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPhase::Entry => f.write_str("entry"),
            ActionPhase::Exit => f.write_str("exit"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared values
// ─────────────────────────────────────────────────────────────────────────────

/// The record a module publishes on the news bus.
///
/// Only the owning module writes it; every other module reads it.  The
/// `state` field mirrors the owner's lifecycle state and is refreshed on every
/// transition.  [`snapshot`](SharedValues::snapshot) gives consumers that do
/// not know the concrete type (the data recorder, the console) a JSON view;
/// [`as_any`](SharedValues::as_any) lets consumers that do know it downcast.
///
/// Use [`impl_shared_values!`] for plain `Serialize` structs with a `state`
/// field.
pub trait SharedValues: Any + Send + Sync + fmt::Debug {
    fn state(&self) -> State;
    fn set_state(&mut self, state: State);
    fn snapshot(&self) -> serde_json::Value;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Implement [`SharedValues`] for a `Serialize` struct with a
/// `state: State` field.
///
/// ```
/// use joan_types::{impl_shared_values, SharedValues, State};
///
/// #[derive(Debug, serde::Serialize)]
/// struct Pedals { state: State, throttle: f64 }
/// impl_shared_values!(Pedals);
///
/// let mut p = Pedals { state: State::Idle, throttle: 0.3 };
/// p.set_state(State::Running);
/// assert_eq!(p.snapshot()["state"], "RUNNING");
/// ```
#[macro_export]
macro_rules! impl_shared_values {
    ($ty:ty) => {
        impl $crate::SharedValues for $ty {
            fn state(&self) -> $crate::State {
                self.state
            }

            fn set_state(&mut self, state: $crate::State) {
                self.state = state;
            }

            fn snapshot(&self) -> $crate::serde_json::Value {
                $crate::serde_json::to_value(self).unwrap_or($crate::serde_json::Value::Null)
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type of the JOAN core.
///
/// Absence of news is *not* an error: bus reads return `Option`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JoanError {
    /// A guard declined the transition.  The state is unchanged.
    #[error("{module}: transition {from} -> {to} rejected: {reason}")]
    TransitionRejected {
        module: ModuleId,
        from: State,
        to: State,
        reason: String,
    },

    /// The edge does not exist in the transition table.
    #[error("{module}: no transition from {from} to {to}")]
    IllegalTransition {
        module: ModuleId,
        from: State,
        to: State,
    },

    /// A transition was requested from inside the same machine's own action
    /// or listener.
    #[error("{module}: transition to {to} requested while a transition is in progress")]
    ReentrantTransition { module: ModuleId, to: State },

    /// An entry or exit action failed.  The transition itself was committed.
    #[error("{module}: {phase} action of {state} failed: {reason}")]
    ActionFailed {
        module: ModuleId,
        state: State,
        phase: ActionPhase,
        reason: String,
    },

    /// The worker failed to start, tick or stop cleanly.
    #[error("{module}: worker failure: {details}")]
    WorkerFailure { module: ModuleId, details: String },

    /// A conditional request whose precondition no longer held once the
    /// transition lock was taken, e.g. a request from a replaced worker.
    #[error("{module}: request for {to} was superseded")]
    Superseded { module: ModuleId, to: State },

    #[error("a state machine for {0} is already registered")]
    DuplicateModule(ModuleId),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("{0} is not registered")]
    NotRegistered(ModuleId),

    #[error("configuration error: {0}")]
    Configuration(String),
}
