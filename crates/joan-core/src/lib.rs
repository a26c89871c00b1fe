//! `joan-core` – Module Lifecycle
//!
//! Everything that turns a pluggable module into something the experiment
//! operator can drive through `Idle → Ready → Running → Stopped`.
//!
//! # Modules
//!
//! - [`state_machine`] – [`StateMachine`][state_machine::StateMachine]:
//!   the per-module finite-state machine with a fixed transition table,
//!   guards, entry/exit actions and change listeners.
//! - [`status`] – [`StatusRegistry`][status::StatusRegistry]:
//!   every module's machine by [`ModuleId`][joan_types::ModuleId], so modules
//!   can look up or subscribe to each other's state.
//! - [`module_manager`] – [`ModuleManager`][module_manager::ModuleManager]:
//!   binds a [`Module`][module_manager::Module] to its machine, its
//!   [`News`][joan_news::News] entry and its worker through the lifecycle
//!   wiring table.
//! - [`worker`] – [`Worker`][worker::Worker]:
//!   a tokio task ticking a module's [`WorkerAction`][worker::WorkerAction]
//!   at a fixed interval, with cooperative stop and a hard abort after a
//!   grace period.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]:
//!   heartbeat tracking for running workers so a supervisor can drive stalled
//!   modules to `Error`.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   global `tracing` subscriber with optional OTLP span export.

pub mod module_manager;
pub mod state_machine;
pub mod status;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

pub use module_manager::{ManagerConfig, Module, ModuleManager, Services};
pub use state_machine::{StateChange, StateMachine, Transition, allowed_targets};
pub use status::StatusRegistry;
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use watchdog::{ComponentHealth, Watchdog};
pub use worker::{StateRequester, Termination, TickContext, TickOutcome, Worker, WorkerAction};
