//! The running session: one [`ModuleManager`] per enabled module plus the
//! shared bus, registry, watchdog and worker runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use joan_core::{ModuleManager, Services, StateChange, Transition, Watchdog};
use joan_modules::{CarlaLink, default_modules};
use joan_news::News;
use joan_types::{JoanError, ModuleId, State};
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use crate::config::Config;

/// Reason recorded when the supervisor fails a module.
pub const STALLED: &str = "worker stalled";

/// Which modules a console command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    One(ModuleId),
    All,
}

pub struct App {
    // Dropped before the runtime their workers run on.
    managers: Vec<Arc<ModuleManager>>,
    services: Services,
    watchdog: Arc<Watchdog>,
    carla: CarlaLink,
    _runtime: Runtime,
}

impl App {
    /// Start the worker runtime and construct every enabled module.  Each
    /// module ends up `Stopped`.
    ///
    /// A module whose manager cannot be constructed is logged and left out;
    /// the rest of the session continues.
    ///
    /// # Errors
    ///
    /// [`JoanError::Configuration`] when the worker runtime cannot start.
    pub fn build(config: &Config) -> Result<Self, JoanError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_time()
            .thread_name("joan-worker")
            .build()
            .map_err(|e| JoanError::Configuration(format!("cannot start worker runtime: {e}")))?;

        let watchdog = Arc::new(Watchdog::new());
        let services = Services::new(runtime.handle().clone()).with_watchdog(Arc::clone(&watchdog));

        let set = default_modules(&config.modules);
        let mut managers = Vec::with_capacity(set.plugins.len());
        for plugin in set.plugins {
            let id = plugin.module.id();
            match ModuleManager::new(plugin.module, services.clone(), config.manager_config(plugin.tick)) {
                Ok(manager) => managers.push(Arc::new(manager)),
                Err(e) => error!(module = %id, error = %e, "module left out of session"),
            }
        }
        info!(modules = managers.len(), "session built");

        Ok(Self {
            managers,
            services,
            watchdog,
            carla: set.carla,
            _runtime: runtime,
        })
    }

    pub fn managers(&self) -> &[Arc<ModuleManager>] {
        &self.managers
    }

    pub fn manager(&self, id: ModuleId) -> Option<&Arc<ModuleManager>> {
        self.managers.iter().find(|m| m.id() == id)
    }

    pub fn news(&self) -> &News {
        &self.services.news
    }

    pub fn carla(&self) -> &CarlaLink {
        &self.carla
    }

    /// Add `listener` to every module's state machine.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&StateChange) + Send + Sync + Clone + 'static,
    {
        for manager in &self.managers {
            manager.add_state_change_listener(listener.clone());
        }
    }

    /// Request `state` for `target`.  `All` walks the modules in order, and
    /// in reverse order for `Stopped`.
    ///
    /// # Errors
    ///
    /// [`JoanError::NotRegistered`] when a single target is not part of the
    /// session.  Per-module outcomes are returned otherwise.
    pub fn request(
        &self,
        target: Target,
        state: State,
        reason: &str,
    ) -> Result<Vec<(ModuleId, Result<Transition, JoanError>)>, JoanError> {
        match target {
            Target::One(id) => {
                let manager = self.manager(id).ok_or(JoanError::NotRegistered(id))?;
                Ok(vec![(id, manager.request_state_change(state, reason))])
            }
            Target::All => Ok(ordered(&self.managers, state)
                .map(|m| (m.id(), m.request_state_change(state, reason)))
                .collect()),
        }
    }

    /// Drive every module to `Stopped`.
    pub fn stop_all(&self, reason: &str) {
        stop_all(&self.managers, reason);
    }

    /// A closure that stops every module, for use from signal handlers.
    pub fn stopper(&self) -> impl Fn(&str) + Send + 'static {
        let managers = self.managers.clone();
        move |reason: &str| stop_all(&managers, reason)
    }

    /// Poll the watchdog every `interval` and drive stalled modules to
    /// `Error` until `shutdown` is set.
    pub fn spawn_supervisor(
        &self,
        shutdown: Arc<AtomicBool>,
        interval: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        let managers = self.managers.clone();
        let watchdog = Arc::clone(&self.watchdog);
        std::thread::Builder::new()
            .name("joan-supervisor".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    supervise(&managers, &watchdog);
                }
            })
    }
}

fn ordered(managers: &[Arc<ModuleManager>], state: State) -> Box<dyn Iterator<Item = &Arc<ModuleManager>> + '_> {
    if state == State::Stopped {
        Box::new(managers.iter().rev())
    } else {
        Box::new(managers.iter())
    }
}

fn stop_all(managers: &[Arc<ModuleManager>], reason: &str) {
    for manager in ordered(managers, State::Stopped) {
        if let Err(e) = manager.request_state_change(State::Stopped, reason) {
            warn!(module = %manager.id(), error = %e, "module did not stop cleanly");
        }
    }
}

/// One supervisor pass.  Returns the modules that were failed.
fn supervise(managers: &[Arc<ModuleManager>], watchdog: &Watchdog) -> Vec<ModuleId> {
    let stalled = watchdog.check_all();
    for id in &stalled {
        let Some(manager) = managers.iter().find(|m| m.id() == *id) else {
            watchdog.deregister(*id);
            continue;
        };
        warn!(module = %id, "worker stalled");
        if let Err(e) = manager.request_state_change(State::Error, STALLED) {
            error!(module = %id, error = %e, "could not fail stalled module");
        }
    }
    stalled
}

#[cfg(test)]
mod tests {
    use super::*;
    use joan_modules::ModuleSettings;

    fn only(ids: &[ModuleId], dir: &tempfile::TempDir) -> Config {
        let mut cfg = Config::default();
        for id in ModuleId::ALL {
            cfg.modules.insert(
                id,
                ModuleSettings {
                    enabled: ids.contains(&id),
                    tick_ms: Some(5),
                    output_dir: Some(dir.path().to_path_buf()),
                },
            );
        }
        cfg
    }

    #[test]
    fn every_module_starts_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(&only(&[ModuleId::HardwareManager, ModuleId::Template], &dir)).unwrap();
        let ids: Vec<_> = app.managers().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![ModuleId::HardwareManager, ModuleId::Template]);
        assert!(app.managers().iter().all(|m| m.current_state() == State::Stopped));
    }

    #[test]
    fn all_modules_walk_the_lifecycle_together() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(&only(&[ModuleId::HardwareManager, ModuleId::DataRecorder], &dir)).unwrap();

        for state in [State::Idle, State::Ready, State::Running] {
            let outcomes = app.request(Target::All, state, "test").unwrap();
            assert!(outcomes.iter().all(|(_, r)| r.is_ok()), "{state}: {outcomes:?}");
        }
        assert!(app.managers().iter().all(|m| m.worker_alive()));

        app.stop_all("test over");
        assert!(app.managers().iter().all(|m| m.current_state() == State::Stopped));
        assert!(app.managers().iter().all(|m| !m.worker_alive()));

        let recordings: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(recordings.len(), 1);
    }

    #[test]
    fn carla_needs_a_connection_to_get_ready() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(&only(&[ModuleId::CarlaInterface], &dir)).unwrap();
        let carla = Target::One(ModuleId::CarlaInterface);
        app.request(carla, State::Idle, "test").unwrap();

        let outcomes = app.request(carla, State::Ready, "test").unwrap();
        match &outcomes[0].1 {
            Err(JoanError::TransitionRejected { reason, .. }) => {
                assert_eq!(reason, joan_modules::carla::NOT_CONNECTED)
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        app.carla().connect();
        assert!(app.request(carla, State::Ready, "test").unwrap()[0].1.is_ok());
    }

    #[test]
    fn single_target_outside_session_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(&only(&[ModuleId::Template], &dir)).unwrap();
        let err = app
            .request(Target::One(ModuleId::HardwareManager), State::Idle, "test")
            .unwrap_err();
        assert_eq!(err, JoanError::NotRegistered(ModuleId::HardwareManager));
    }

    #[test]
    fn supervisor_pass_fails_stalled_modules() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(&only(&[ModuleId::Template], &dir)).unwrap();
        for state in [State::Idle, State::Ready, State::Running] {
            app.request(Target::All, state, "test").unwrap();
        }
        // Pretend the worker went silent.
        app.watchdog.register(ModuleId::Template, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(supervise(app.managers(), &app.watchdog), vec![ModuleId::Template]);
        let template = app.manager(ModuleId::Template).unwrap();
        assert_eq!(template.current_state(), State::Error);
        assert!(!template.worker_alive());
    }
}
