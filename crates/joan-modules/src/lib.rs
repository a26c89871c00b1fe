//! `joan-modules` – Concrete Modules
//!
//! Pluggable modules built on the [`joan_core::Module`] contract.  They carry
//! no simulator or device logic of their own; each one exercises a different
//! part of the core.
//!
//! | module | shows |
//! |---|---|
//! | [`HardwareManager`][hardware::HardwareManager] | publishing on every tick |
//! | [`CarlaInterface`][carla::CarlaInterface] | transition guards, reading another module's news, worker-requested `Error` |
//! | [`DataRecorder`][recorder::DataRecorder] | discovering modules through the bus, `on_start`/`on_stop` hooks |
//! | [`Template`][template::Template] | the minimal module |
//!
//! [`default_modules`][registry::default_modules] builds the enabled set from
//! [`ModulesConfig`][registry::ModulesConfig].

pub mod carla;
pub mod hardware;
pub mod recorder;
pub mod registry;
pub mod template;

pub use carla::{CarlaInterface, CarlaLink};
pub use hardware::HardwareManager;
pub use recorder::DataRecorder;
pub use registry::{ModuleSet, ModuleSettings, ModulesConfig, Plugin, default_modules};
pub use template::Template;
