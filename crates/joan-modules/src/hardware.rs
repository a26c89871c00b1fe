//! [`HardwareManager`] – synthetic driver input.
//!
//! Stands in for the keyboard, joystick and steering-wheel readers.  Every
//! tick it publishes one [`HardwareValues`] sample generated from the tick
//! counter, so downstream modules see a repeatable input trace.

use joan_core::{Module, TickContext, TickOutcome, WorkerAction};
use joan_types::{JoanError, ModuleId, SharedValues, State, impl_shared_values};
use serde::Serialize;

/// Period of the synthetic input cycle, in ticks.
const CYCLE: u64 = 200;

/// Largest steering angle produced, in radians.
const MAX_STEERING_RAD: f64 = 0.5;

/// Latest driver input.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareValues {
    pub state: State,
    /// Radians, positive to the left.
    pub steering_angle: f64,
    /// `0.0..=1.0`
    pub throttle: f64,
    /// `0.0..=1.0`
    pub brake: f64,
    pub tick: u64,
}
impl_shared_values!(HardwareValues);

/// Input sample for `tick`.
///
/// Over one cycle the throttle ramps up and back down during the first half
/// and the brake does the same during the second half.  Steering follows a
/// triangle wave between `-MAX_STEERING_RAD` and `MAX_STEERING_RAD`.
pub fn sample(tick: u64) -> (f64, f64, f64) {
    let phase = tick % CYCLE;
    let half = CYCLE / 2;
    let quarter = CYCLE / 4;

    let ramp = |p: u64| {
        let up = if p <= quarter { p } else { half - p };
        up as f64 / quarter as f64
    };
    let (throttle, brake) = if phase < half {
        (ramp(phase), 0.0)
    } else {
        (0.0, ramp(phase - half))
    };

    let steering = if phase < half {
        -MAX_STEERING_RAD + 2.0 * MAX_STEERING_RAD * phase as f64 / half as f64
    } else {
        MAX_STEERING_RAD - 2.0 * MAX_STEERING_RAD * (phase - half) as f64 / half as f64
    };

    (steering, throttle, brake)
}

#[derive(Debug, Default)]
pub struct HardwareManager;

impl HardwareManager {
    pub fn new() -> Self {
        Self
    }
}

impl Module for HardwareManager {
    fn id(&self) -> ModuleId {
        ModuleId::HardwareManager
    }

    fn shared_values(&self) -> Box<dyn SharedValues> {
        Box::new(HardwareValues::default())
    }

    fn worker_action(&self) -> Result<Box<dyn WorkerAction>, JoanError> {
        Ok(Box::new(InputSampler))
    }
}

struct InputSampler;

impl WorkerAction for InputSampler {
    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, JoanError> {
        let tick = ctx.tick();
        let (steering_angle, throttle, brake) = sample(tick);
        ctx.news().update_as(ctx.module(), |v: &mut HardwareValues| {
            v.steering_angle = steering_angle;
            v.throttle = throttle;
            v.brake = brake;
            v.tick = tick;
        });
        Ok(TickOutcome::Continue)
    }
}
