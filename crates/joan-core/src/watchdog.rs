//! [`Watchdog`] – worker liveness monitor.
//!
//! A running [`Worker`](crate::Worker) records a heartbeat on every tick.  The
//! watchdog remembers when each module last ticked and considers it *stalled*
//! once its deadline has passed, e.g. because a tick is stuck in a blocking
//! call.
//!
//! Call [`Watchdog::check_all`] from a supervisor loop to obtain the stalled
//! modules so they can be driven to `Error`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use joan_types::ModuleId;
use parking_lot::Mutex;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single module's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    /// The worker ticked within its deadline.
    Healthy,
    /// The worker has not ticked within its deadline.
    TimedOut,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct ComponentEntry {
    last_heartbeat: Instant,
    timeout: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks worker heartbeats and detects stalled modules.
///
/// Shared between workers (heartbeats) and the supervisor (checks) as
/// `Arc<Watchdog>`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use joan_core::watchdog::{ComponentHealth, Watchdog};
/// use joan_types::ModuleId;
///
/// let wd = Watchdog::new();
/// wd.register(ModuleId::HardwareManager, Duration::from_secs(1));
/// wd.heartbeat(ModuleId::HardwareManager);
///
/// assert_eq!(wd.health(ModuleId::HardwareManager), ComponentHealth::Healthy);
/// ```
#[derive(Default)]
pub struct Watchdog {
    components: Mutex<HashMap<ModuleId, ComponentEntry>>,
}

impl Watchdog {
    /// Create an empty watchdog with no registered modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` with a maximum heartbeat `timeout`.
    ///
    /// The last-heartbeat timestamp starts at now.  Re-registering resets the
    /// deadline.
    pub fn register(&self, module: ModuleId, timeout: Duration) {
        self.components.lock().insert(
            module,
            ComponentEntry {
                last_heartbeat: Instant::now(),
                timeout,
            },
        );
    }

    /// Stop tracking `module`.  No-op when it is not registered.
    pub fn deregister(&self, module: ModuleId) {
        self.components.lock().remove(&module);
    }

    /// Record a heartbeat for `module`.  No-op for unregistered modules.
    pub fn heartbeat(&self, module: ModuleId) {
        if let Some(entry) = self.components.lock().get_mut(&module) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Health of `module`; unregistered modules report
    /// [`ComponentHealth::TimedOut`].
    pub fn health(&self, module: ModuleId) -> ComponentHealth {
        match self.components.lock().get(&module) {
            Some(entry) if entry.last_heartbeat.elapsed() <= entry.timeout => {
                ComponentHealth::Healthy
            }
            _ => ComponentHealth::TimedOut,
        }
    }

    /// Every registered module whose deadline has passed, in id order.
    pub fn check_all(&self) -> Vec<ModuleId> {
        let mut stalled: Vec<ModuleId> = self
            .components
            .lock()
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > entry.timeout)
            .map(|(id, _)| *id)
            .collect();
        stalled.sort();
        stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_module_is_healthy() {
        let wd = Watchdog::new();
        wd.register(ModuleId::HardwareManager, Duration::from_secs(5));
        assert_eq!(wd.health(ModuleId::HardwareManager), ComponentHealth::Healthy);
    }

    #[test]
    fn heartbeat_resets_deadline() {
        let wd = Watchdog::new();
        wd.register(ModuleId::CarlaInterface, Duration::from_millis(40));
        thread::sleep(Duration::from_millis(20));
        wd.heartbeat(ModuleId::CarlaInterface);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(wd.health(ModuleId::CarlaInterface), ComponentHealth::Healthy);
    }

    #[test]
    fn module_times_out_when_silent() {
        let wd = Watchdog::new();
        wd.register(ModuleId::DataRecorder, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(wd.health(ModuleId::DataRecorder), ComponentHealth::TimedOut);
    }

    #[test]
    fn check_all_returns_stalled_modules() {
        let wd = Watchdog::new();
        wd.register(ModuleId::HardwareManager, Duration::from_millis(20));
        wd.register(ModuleId::Template, Duration::from_secs(60));

        thread::sleep(Duration::from_millis(30));

        assert_eq!(wd.check_all(), vec![ModuleId::HardwareManager]);
    }

    #[test]
    fn deregistered_module_is_not_reported() {
        let wd = Watchdog::new();
        wd.register(ModuleId::HardwareManager, Duration::from_millis(1));
        wd.deregister(ModuleId::HardwareManager);
        thread::sleep(Duration::from_millis(5));
        assert!(wd.check_all().is_empty());
    }

    #[test]
    fn unknown_module_health_is_timed_out() {
        let wd = Watchdog::new();
        assert_eq!(wd.health(ModuleId::Template), ComponentHealth::TimedOut);
    }

    #[test]
    fn reregister_resets_timer() {
        let wd = Watchdog::new();
        wd.register(ModuleId::Template, Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(wd.health(ModuleId::Template), ComponentHealth::TimedOut);
        wd.register(ModuleId::Template, Duration::from_secs(60));
        assert_eq!(wd.health(ModuleId::Template), ComponentHealth::Healthy);
    }
}
