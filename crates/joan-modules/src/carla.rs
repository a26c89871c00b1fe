//! [`CarlaInterface`] – simulator bridge stub.
//!
//! No simulator is attached; a [`CarlaLink`] flag stands in for the network
//! connection and is flipped by the operator.  The module refuses to get
//! ready, start or pause while disconnected, and once running it forwards the
//! hardware manager's latest input as the "applied" vehicle control.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use joan_core::{Module, StateMachine, TickContext, TickOutcome, WorkerAction};
use joan_types::{JoanError, ModuleId, SharedValues, State, impl_shared_values};
use serde::Serialize;
use tracing::{info, warn};

use crate::hardware::HardwareValues;

pub const NOT_CONNECTED: &str = "Carla is not connected";
pub const DISCONNECTED: &str = "Carla disconnected";

/// Shared connection flag between the operator and the module.
#[derive(Debug, Clone, Default)]
pub struct CarlaLink(Arc<AtomicBool>);

impl CarlaLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            info!("connected to Carla");
        }
    }

    pub fn disconnect(&self) {
        if self.0.swap(false, Ordering::SeqCst) {
            info!("disconnected from Carla");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn require(&self) -> Result<(), String> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(NOT_CONNECTED.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CarlaValues {
    pub state: State,
    pub connected: bool,
    /// Frames sent to the simulator since the worker started.
    pub frames: u64,
    pub applied_steering: f64,
    pub applied_throttle: f64,
}
impl_shared_values!(CarlaValues);

pub struct CarlaInterface {
    link: CarlaLink,
}

impl CarlaInterface {
    pub fn new(link: CarlaLink) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &CarlaLink {
        &self.link
    }
}

impl Module for CarlaInterface {
    fn id(&self) -> ModuleId {
        ModuleId::CarlaInterface
    }

    fn shared_values(&self) -> Box<dyn SharedValues> {
        Box::new(CarlaValues {
            connected: self.link.is_connected(),
            ..CarlaValues::default()
        })
    }

    fn worker_action(&self) -> Result<Box<dyn WorkerAction>, JoanError> {
        Ok(Box::new(Bridge {
            link: self.link.clone(),
            frames: 0,
            lost: false,
        }))
    }

    fn install_guards(&self, machine: &StateMachine) {
        for (from, to) in [
            (State::Idle, State::Ready),
            (State::Ready, State::Running),
            (State::Running, State::Ready),
        ] {
            let link = self.link.clone();
            machine.set_transition_condition(from, to, move || link.require());
        }
    }
}

struct Bridge {
    link: CarlaLink,
    frames: u64,
    lost: bool,
}

impl WorkerAction for Bridge {
    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, JoanError> {
        let news = ctx.news();
        if !self.link.is_connected() {
            news.update_as(ctx.module(), |v: &mut CarlaValues| v.connected = false);
            if self.lost {
                return Ok(TickOutcome::Continue);
            }
            self.lost = true;
            warn!(module = %ctx.module(), "lost connection while running");
            return Ok(TickOutcome::RequestState {
                target: State::Error,
                reason: DISCONNECTED.to_string(),
            });
        }

        // The hardware manager may not be initialized; hold neutral input.
        let (steering, throttle) = news
            .read_as(ModuleId::HardwareManager, |hw: &HardwareValues| {
                (hw.steering_angle, hw.throttle - hw.brake)
            })
            .unwrap_or((0.0, 0.0));

        self.frames += 1;
        let frames = self.frames;
        news.update_as(ctx.module(), |v: &mut CarlaValues| {
            v.connected = true;
            v.frames = frames;
            v.applied_steering = steering;
            v.applied_throttle = throttle;
        });
        Ok(TickOutcome::Continue)
    }
}
