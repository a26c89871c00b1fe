//! Session configuration – reads `joan.toml`.
//!
//! The file is looked up at `$JOAN_CONFIG` when set, else `./joan.toml`.
//!
//! ```toml
//! termination_grace_ms = 500
//! watchdog_factor = 10
//!
//! [modules.hardware_manager]
//! tick_ms = 5
//!
//! [modules.data_recorder]
//! tick_ms = 200
//! output_dir = "recordings"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use joan_core::ManagerConfig;
use joan_modules::ModulesConfig;
use joan_types::JoanError;
use serde::{Deserialize, Serialize};

/// Settings of one console session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// How long stopping a module waits for its worker before aborting it.
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,

    /// A worker is stalled after `tick * watchdog_factor` without a tick.
    #[serde(default = "default_watchdog_factor")]
    pub watchdog_factor: u32,

    /// How often the supervisor checks for stalled workers.
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,

    #[serde(default)]
    pub modules: ModulesConfig,
}

fn default_termination_grace_ms() -> u64 {
    500
}
fn default_watchdog_factor() -> u32 {
    10
}
fn default_supervisor_interval_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            termination_grace_ms: default_termination_grace_ms(),
            watchdog_factor: default_watchdog_factor(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            modules: ModulesConfig::new(),
        }
    }
}

impl Config {
    /// Manager settings for a module ticking at `tick`.
    pub fn manager_config(&self, tick: Duration) -> ManagerConfig {
        ManagerConfig {
            tick,
            termination_grace: Duration::from_millis(self.termination_grace_ms),
            watchdog_factor: self.watchdog_factor,
        }
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms.max(1))
    }

    /// Reject values that parse but cannot run.
    ///
    /// # Errors
    ///
    /// [`JoanError::Configuration`] naming the first module with
    /// `tick_ms = 0`.
    pub fn validate(&self) -> Result<(), JoanError> {
        if let Some((id, _)) = self.modules.iter().find(|(_, s)| s.tick_ms == Some(0)) {
            return Err(JoanError::Configuration(format!(
                "modules.{}.tick_ms must be greater than zero",
                id.key()
            )));
        }
        Ok(())
    }
}

/// `$JOAN_CONFIG`, or `joan.toml` in the working directory.
pub fn config_path() -> PathBuf {
    std::env::var_os("JOAN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("joan.toml"))
}

/// Load the config.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, JoanError> {
    load_from(&config_path())
}

/// Load the config from a specific path and apply `JOAN_*` overrides.
///
/// # Errors
///
/// [`JoanError::Configuration`] when the file cannot be read or parsed,
/// including `[modules.<key>]` tables naming no known module, or when it
/// fails [`Config::validate`].
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, JoanError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        JoanError::Configuration(format!("failed to read {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| JoanError::Configuration(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `JOAN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `JOAN_TERMINATION_GRACE_MS` | `termination_grace_ms` |
/// | `JOAN_WATCHDOG_FACTOR` | `watchdog_factor` |
/// | `JOAN_SUPERVISOR_INTERVAL_MS` | `supervisor_interval_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("JOAN_TERMINATION_GRACE_MS")
        && let Ok(ms) = v.trim().parse()
    {
        cfg.termination_grace_ms = ms;
    }
    if let Ok(v) = std::env::var("JOAN_WATCHDOG_FACTOR")
        && let Ok(factor) = v.trim().parse()
    {
        cfg.watchdog_factor = factor;
    }
    if let Ok(v) = std::env::var("JOAN_SUPERVISOR_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse()
    {
        cfg.supervisor_interval_ms = ms;
    }
}
