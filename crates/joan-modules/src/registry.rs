//! Module settings and the factory that turns them into ready-to-manage
//! modules.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use joan_core::Module;
use joan_types::ModuleId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::carla::{CarlaInterface, CarlaLink};
use crate::hardware::HardwareManager;
use crate::recorder::DataRecorder;
use crate::template::Template;

/// Directory recordings go to when none is configured.
pub const DEFAULT_OUTPUT_DIR: &str = "recordings";

/// Settings of one module, as found under `[modules.<key>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleSettings {
    pub enabled: bool,
    /// Worker tick interval; the module's own default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_ms: Option<u64>,
    /// Only used by the data recorder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: None,
            output_dir: None,
        }
    }
}

/// Per-module settings keyed by module id.  Modules without an entry use
/// [`ModuleSettings::default`].
pub type ModulesConfig = BTreeMap<ModuleId, ModuleSettings>;

/// Tick interval a module runs at unless configured otherwise.
pub fn default_tick(id: ModuleId) -> Duration {
    Duration::from_millis(match id {
        ModuleId::HardwareManager | ModuleId::CarlaInterface => 5,
        ModuleId::SteeringWheelControl | ModuleId::HapticControllerManager => 10,
        ModuleId::DataRecorder => 200,
        _ => 100,
    })
}

/// A module paired with the tick interval its manager should use.
pub struct Plugin {
    pub module: Box<dyn Module>,
    pub tick: Duration,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("module", &self.module.id())
            .field("tick", &self.tick)
            .finish()
    }
}

/// Output of [`default_modules`].
#[derive(Debug)]
pub struct ModuleSet {
    /// Enabled modules in [`ModuleId::ALL`] order.
    pub plugins: Vec<Plugin>,
    /// Connection flag shared with the Carla interface.
    pub carla: CarlaLink,
}

/// Build every enabled module this crate implements.
///
/// Settings for module kinds without an implementation are ignored with a
/// warning.
pub fn default_modules(config: &ModulesConfig) -> ModuleSet {
    let carla = CarlaLink::new();
    let mut plugins = Vec::new();

    for id in ModuleId::ALL {
        let settings = config.get(&id).cloned().unwrap_or_default();
        if !settings.enabled {
            debug!(module = %id, "disabled by configuration");
            continue;
        }
        let module: Box<dyn Module> = match id {
            ModuleId::HardwareManager => Box::new(HardwareManager::new()),
            ModuleId::CarlaInterface => Box::new(CarlaInterface::new(carla.clone())),
            ModuleId::DataRecorder => Box::new(DataRecorder::new(
                settings
                    .output_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            )),
            ModuleId::Template => Box::new(Template),
            other => {
                if config.contains_key(&other) {
                    warn!(module = %other, "no implementation available; settings ignored");
                }
                continue;
            }
        };
        let tick = settings
            .tick_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| default_tick(id));
        plugins.push(Plugin { module, tick });
    }

    ModuleSet { plugins, carla }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(set: &ModuleSet) -> Vec<ModuleId> {
        set.plugins.iter().map(|p| p.module.id()).collect()
    }

    #[test]
    fn empty_config_builds_every_implemented_module() {
        let set = default_modules(&ModulesConfig::new());
        assert_eq!(
            ids(&set),
            vec![
                ModuleId::HardwareManager,
                ModuleId::CarlaInterface,
                ModuleId::DataRecorder,
                ModuleId::Template,
            ]
        );
        assert_eq!(set.plugins[2].tick, Duration::from_millis(200));
    }

    #[test]
    fn disabled_modules_are_skipped_and_ticks_overridden() {
        let mut config = ModulesConfig::new();
        config.insert(
            ModuleId::Template,
            ModuleSettings {
                enabled: false,
                ..ModuleSettings::default()
            },
        );
        config.insert(
            ModuleId::HardwareManager,
            ModuleSettings {
                tick_ms: Some(20),
                ..ModuleSettings::default()
            },
        );
        let set = default_modules(&config);
        assert!(!ids(&set).contains(&ModuleId::Template));
        assert_eq!(set.plugins[0].tick, Duration::from_millis(20));
    }

    #[test]
    fn settings_for_unimplemented_modules_are_ignored() {
        let mut config = ModulesConfig::new();
        config.insert(ModuleId::DataPlotter, ModuleSettings::default());
        assert!(!ids(&default_modules(&config)).contains(&ModuleId::DataPlotter));
    }

    #[test]
    fn carla_link_is_shared_with_the_module() {
        let set = default_modules(&ModulesConfig::new());
        assert!(!set.carla.is_connected());
        let carla = set.carla.clone();
        carla.connect();
        assert!(set.carla.is_connected());
    }

    #[test]
    fn settings_parse_from_toml_tables() {
        let config: ModulesConfig = toml::from_str(
            r#"
            [hardware_manager]
            tick_ms = 5

            [data_recorder]
            enabled = false
            output_dir = "out"
            "#,
        )
        .unwrap();
        assert_eq!(config[&ModuleId::HardwareManager].tick_ms, Some(5));
        assert!(config[&ModuleId::HardwareManager].enabled);
        assert_eq!(config[&ModuleId::DataRecorder].output_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn unknown_module_key_fails_to_parse() {
        let parsed: Result<ModulesConfig, _> = toml::from_str("[flux_capacitor]\nenabled = true\n");
        assert!(parsed.is_err());
    }
}
