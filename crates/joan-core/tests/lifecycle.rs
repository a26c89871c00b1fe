//! End-to-end lifecycle of a module driven through its `ModuleManager`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use joan_core::{
    ManagerConfig, Module, ModuleManager, Services, StateMachine, TickContext, TickOutcome,
    Watchdog, WorkerAction,
};
use joan_types::{JoanError, ModuleId, SharedValues, State, impl_shared_values};
use parking_lot::Mutex;
use serde::Serialize;

// ── test doubles ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct ProbeValues {
    state: State,
    ticks: u64,
}
impl_shared_values!(ProbeValues);

#[derive(Clone, Copy)]
enum Behaviour {
    Count,
    FailOnTick(u64),
    BlockFor(Duration),
    RequestAfter(u64, State),
    Panic,
    /// Long tick that fails once the owner asks it to stop.
    FailWhenStopped,
}

struct Probe {
    id: ModuleId,
    behaviour: Behaviour,
    connected: Option<Arc<AtomicBool>>,
    refuse_worker: bool,
    refuse_stop: bool,
}

impl Probe {
    fn new(id: ModuleId) -> Self {
        Self {
            id,
            behaviour: Behaviour::Count,
            connected: None,
            refuse_worker: false,
            refuse_stop: false,
        }
    }

    fn behaving(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }
}

impl Module for Probe {
    fn id(&self) -> ModuleId {
        self.id
    }

    fn shared_values(&self) -> Box<dyn SharedValues> {
        Box::new(ProbeValues::default())
    }

    fn worker_action(&self) -> Result<Box<dyn WorkerAction>, JoanError> {
        if self.refuse_worker {
            return Err(JoanError::Configuration("no device configured".to_string()));
        }
        Ok(Box::new(ProbeAction {
            behaviour: self.behaviour,
        }))
    }

    fn install_guards(&self, machine: &StateMachine) {
        if let Some(flag) = &self.connected {
            let flag = Arc::clone(flag);
            machine.set_transition_condition(State::Idle, State::Ready, move || {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err("not connected".to_string())
                }
            });
        }
    }

    fn on_stop(&self) -> Result<(), JoanError> {
        if self.refuse_stop {
            return Err(JoanError::WorkerFailure {
                module: self.id,
                details: "device refused to park".to_string(),
            });
        }
        Ok(())
    }
}

struct ProbeAction {
    behaviour: Behaviour,
}

impl WorkerAction for ProbeAction {
    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, JoanError> {
        ctx.news()
            .update_as(ctx.module(), |v: &mut ProbeValues| v.ticks += 1);
        match self.behaviour {
            Behaviour::Count => Ok(TickOutcome::Continue),
            Behaviour::FailOnTick(n) if ctx.tick() >= n => Err(JoanError::WorkerFailure {
                module: ctx.module(),
                details: "device vanished".to_string(),
            }),
            Behaviour::FailOnTick(_) => Ok(TickOutcome::Continue),
            Behaviour::BlockFor(d) => {
                std::thread::sleep(d);
                Ok(TickOutcome::Continue)
            }
            Behaviour::RequestAfter(n, target) if ctx.tick() == n => Ok(TickOutcome::RequestState {
                target,
                reason: "run complete".to_string(),
            }),
            Behaviour::RequestAfter(..) => Ok(TickOutcome::Continue),
            Behaviour::Panic => panic!("driver crashed"),
            Behaviour::FailWhenStopped => {
                for _ in 0..200 {
                    if ctx.stop_requested() {
                        return Err(JoanError::WorkerFailure {
                            module: ctx.module(),
                            details: "interrupted mid-tick".to_string(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(TickOutcome::Continue)
            }
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .unwrap()
}

fn fast() -> ManagerConfig {
    ManagerConfig::default().with_tick(Duration::from_millis(2))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn published_state(services: &Services, id: ModuleId) -> Option<String> {
    services
        .news
        .snapshot(id)
        .and_then(|v| v["state"].as_str().map(str::to_string))
}

fn ticks(services: &Services, id: ModuleId) -> Option<u64> {
    services.news.read_as(id, |v: &ProbeValues| v.ticks)
}

// ── scenarios ────────────────────────────────────────────────────────────────

#[test]
fn construction_moves_module_to_stopped_without_publishing() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let manager = ModuleManager::new(Box::new(Probe::new(ModuleId::Template)), services.clone(), fast())
        .unwrap();

    assert_eq!(manager.current_state(), State::Stopped);
    assert!(services.news.is_empty());
    assert!(manager.shared_values().is_none());
    assert_eq!(services.status.current_state(ModuleId::Template), Some(State::Stopped));
}

#[test]
fn full_cycle_publishes_runs_worker_and_cleans_up() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let id = ModuleId::HardwareManager;
    let manager = ModuleManager::new(Box::new(Probe::new(id)), services.clone(), fast()).unwrap();

    manager.request_state_change(State::Idle, "operator").unwrap();
    assert_eq!(published_state(&services, id).as_deref(), Some("IDLE"));
    let first_slot = manager.shared_values().unwrap();

    manager.request_state_change(State::Ready, "operator").unwrap();
    assert_eq!(published_state(&services, id).as_deref(), Some("READY"));
    assert!(!manager.worker_alive());

    manager.request_state_change(State::Running, "operator").unwrap();
    assert!(manager.worker_alive());
    assert_eq!(published_state(&services, id).as_deref(), Some("RUNNING"));
    assert!(wait_until(Duration::from_secs(2), || ticks(&services, id) >= Some(3)));

    manager.request_state_change(State::Stopped, "operator").unwrap();
    assert!(!manager.worker_alive());
    assert_eq!(published_state(&services, id).as_deref(), Some("STOPPED"));
    let after_stop = ticks(&services, id);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ticks(&services, id), after_stop);

    // Leaving Stopped clears the entry; re-entering Idle publishes a fresh one.
    manager.request_state_change(State::Idle, "again").unwrap();
    assert_eq!(ticks(&services, id), Some(0));
    let second_slot = manager.shared_values().unwrap();
    assert!(!Arc::ptr_eq(&first_slot, &second_slot));
}

#[test]
fn leaving_stopped_for_error_removes_bus_entry() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let id = ModuleId::Template;
    let manager = ModuleManager::new(Box::new(Probe::new(id)), services.clone(), fast()).unwrap();

    manager.request_state_change(State::Idle, "").unwrap();
    manager.request_state_change(State::Stopped, "").unwrap();
    assert!(services.news.contains(id));

    manager.request_state_change(State::Error, "operator abort").unwrap();
    assert!(!services.news.contains(id));
    assert!(manager.shared_values().is_none());
}

#[test]
fn guarded_ready_reports_reason_until_connected() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let connected = Arc::new(AtomicBool::new(false));
    let probe = Probe {
        connected: Some(Arc::clone(&connected)),
        ..Probe::new(ModuleId::CarlaInterface)
    };
    let manager = ModuleManager::new(Box::new(probe), services.clone(), fast()).unwrap();
    manager.request_state_change(State::Idle, "").unwrap();

    match manager.request_state_change(State::Ready, "operator") {
        Err(JoanError::TransitionRejected { reason, .. }) => assert_eq!(reason, "not connected"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(manager.current_state(), State::Idle);

    connected.store(true, Ordering::SeqCst);
    manager.request_state_change(State::Ready, "operator").unwrap();
    assert_eq!(manager.current_state(), State::Ready);
}

#[test]
fn failing_tick_drives_module_to_error() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let id = ModuleId::DataRecorder;
    let probe = Probe::new(id).behaving(Behaviour::FailOnTick(2));
    let manager = ModuleManager::new(Box::new(probe), services.clone(), fast()).unwrap();

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&reasons);
    manager.add_state_change_listener(move |change| r.lock().push((change.to, change.reason.clone())));

    for target in [State::Idle, State::Ready, State::Running] {
        manager.request_state_change(target, "operator").unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || manager.current_state() == State::Error));
    assert!(wait_until(Duration::from_secs(2), || !manager.worker_alive()));
    assert_eq!(published_state(&services, id).as_deref(), Some("ERROR"));

    let reasons = reasons.lock();
    let (to, reason) = reasons.last().unwrap();
    assert_eq!(*to, State::Error);
    assert!(reason.contains("device vanished"));
}

#[test]
fn failing_entry_action_is_converted_into_error() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let probe = Probe {
        refuse_worker: true,
        ..Probe::new(ModuleId::SteeringWheelControl)
    };
    let manager = ModuleManager::new(Box::new(probe), services.clone(), fast()).unwrap();
    manager.request_state_change(State::Idle, "").unwrap();

    let err = manager.request_state_change(State::Ready, "operator").unwrap_err();
    assert!(matches!(err, JoanError::ActionFailed { state: State::Ready, .. }));
    assert_eq!(manager.current_state(), State::Error);

    // Error → Idle recovers with a fresh record.
    manager.request_state_change(State::Idle, "reset").unwrap();
    assert_eq!(
        published_state(&services, ModuleId::SteeringWheelControl).as_deref(),
        Some("IDLE")
    );
}

#[test]
fn worker_can_ask_its_module_to_stop() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let probe = Probe::new(ModuleId::ExperimentManager).behaving(Behaviour::RequestAfter(3, State::Stopped));
    let manager = ModuleManager::new(Box::new(probe), services, fast()).unwrap();

    for target in [State::Idle, State::Ready, State::Running] {
        manager.request_state_change(target, "operator").unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || manager.current_state() == State::Stopped));
    assert!(wait_until(Duration::from_secs(2), || !manager.worker_alive()));
}

#[test]
fn stuck_worker_is_aborted_on_stop() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let probe = Probe::new(ModuleId::Template).behaving(Behaviour::BlockFor(Duration::from_millis(300)));
    let config = ManagerConfig {
        termination_grace: Duration::from_millis(20),
        ..fast()
    };
    let manager = ModuleManager::new(Box::new(probe), services.clone(), config).unwrap();
    for target in [State::Idle, State::Ready, State::Running] {
        manager.request_state_change(target, "operator").unwrap();
    }
    std::thread::sleep(Duration::from_millis(30));

    let started = Instant::now();
    manager.request_state_change(State::Stopped, "operator").unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_eq!(manager.current_state(), State::Stopped);

    // The interrupted tick is still sleeping and is reported as such.
    assert!(manager.worker_alive());
    assert!(wait_until(Duration::from_secs(2), || !manager.worker_alive()));
    let settled = ticks(&services, ModuleId::Template);
    assert_eq!(settled, Some(1));
    std::thread::sleep(Duration::from_millis(350));
    assert_eq!(ticks(&services, ModuleId::Template), settled);
}

#[test]
fn watchdog_reports_stalled_worker() {
    let rt = runtime();
    let watchdog = Arc::new(Watchdog::new());
    let services = Services::new(rt.handle().clone()).with_watchdog(Arc::clone(&watchdog));
    let probe = Probe::new(ModuleId::Template).behaving(Behaviour::BlockFor(Duration::from_millis(400)));
    let config = ManagerConfig {
        tick: Duration::from_millis(5),
        termination_grace: Duration::from_millis(20),
        watchdog_factor: 2,
    };
    let manager = ModuleManager::new(Box::new(probe), services, config).unwrap();
    for target in [State::Idle, State::Ready, State::Running] {
        manager.request_state_change(target, "operator").unwrap();
    }

    assert!(wait_until(Duration::from_secs(1), || watchdog.check_all() == vec![ModuleId::Template]));
    manager.request_state_change(State::Error, "worker stalled").unwrap();
    assert!(watchdog.check_all().is_empty());
}

#[test]
fn second_manager_for_same_module_is_refused() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let _first = ModuleManager::new(Box::new(Probe::new(ModuleId::DataPlotter)), services.clone(), fast())
        .unwrap();
    let err = ModuleManager::new(Box::new(Probe::new(ModuleId::DataPlotter)), services, fast()).unwrap_err();
    assert_eq!(err, JoanError::DuplicateModule(ModuleId::DataPlotter));
}

#[test]
fn modules_observe_each_other_through_status_registry() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let hardware =
        ModuleManager::new(Box::new(Probe::new(ModuleId::HardwareManager)), services.clone(), fast()).unwrap();
    let _carla =
        ModuleManager::new(Box::new(Probe::new(ModuleId::CarlaInterface)), services.clone(), fast()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    services
        .status
        .subscribe(ModuleId::HardwareManager, move |change| s.lock().push(change.to))
        .unwrap();

    hardware.request_state_change(State::Idle, "").unwrap();
    hardware.request_state_change(State::Ready, "").unwrap();
    assert_eq!(*seen.lock(), vec![State::Idle, State::Ready]);
    assert_eq!(
        services.status.states(),
        vec![
            (ModuleId::HardwareManager, State::Ready),
            (ModuleId::CarlaInterface, State::Stopped),
        ]
    );
}

#[test]
fn panicking_tick_drives_module_to_error() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let probe = Probe::new(ModuleId::HardwareManager).behaving(Behaviour::Panic);
    let manager = ModuleManager::new(Box::new(probe), services, fast()).unwrap();

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&reasons);
    manager.add_state_change_listener(move |change| r.lock().push((change.to, change.reason.clone())));

    for target in [State::Idle, State::Ready, State::Running] {
        manager.request_state_change(target, "operator").unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || manager.current_state() == State::Error));
    assert!(wait_until(Duration::from_secs(2), || !manager.worker_alive()));

    let reasons = reasons.lock();
    let (to, reason) = reasons.last().unwrap();
    assert_eq!(*to, State::Error);
    assert!(reason.contains("driver crashed"), "{reason}");
}

#[test]
fn zero_tick_fails_get_ready_instead_of_running_without_worker() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let config = ManagerConfig::default().with_tick(Duration::ZERO);
    let manager = ModuleManager::new(Box::new(Probe::new(ModuleId::Template)), services, config).unwrap();
    manager.request_state_change(State::Idle, "").unwrap();

    match manager.request_state_change(State::Ready, "operator") {
        Err(JoanError::ActionFailed { state: State::Ready, reason, .. }) => {
            assert!(reason.contains("non-zero"), "{reason}")
        }
        other => panic!("expected failed get_ready, got {other:?}"),
    }
    assert_eq!(manager.current_state(), State::Error);
    assert!(!manager.worker_alive());
}

#[test]
fn failure_from_stopped_worker_does_not_reach_next_lifecycle() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let probe = Probe::new(ModuleId::Template).behaving(Behaviour::FailWhenStopped);
    let manager = ModuleManager::new(Box::new(probe), services, fast()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    manager.add_state_change_listener(move |change| s.lock().push(change.to));

    for target in [State::Idle, State::Ready, State::Running] {
        manager.request_state_change(target, "operator").unwrap();
    }
    std::thread::sleep(Duration::from_millis(30));

    // The tick fails as it notices the stop; its Error request arrives late.
    manager.request_state_change(State::Stopped, "operator").unwrap();
    manager.request_state_change(State::Idle, "next run").unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(manager.current_state(), State::Idle);
    assert!(!seen.lock().contains(&State::Error));
}

#[test]
fn failed_construction_leaves_module_registrable() {
    let rt = runtime();
    let services = Services::new(rt.handle().clone());
    let stubborn = Probe {
        refuse_stop: true,
        ..Probe::new(ModuleId::HapticControllerManager)
    };
    let err = ModuleManager::new(Box::new(stubborn), services.clone(), fast()).unwrap_err();
    assert!(matches!(err, JoanError::ActionFailed { state: State::Stopped, .. }));
    assert!(services.status.get(ModuleId::HapticControllerManager).is_none());

    let manager =
        ModuleManager::new(Box::new(Probe::new(ModuleId::HapticControllerManager)), services, fast()).unwrap();
    assert_eq!(manager.current_state(), State::Stopped);
}
