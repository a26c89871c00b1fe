//! [`Template`] – the smallest possible module.  Copy it to start a new one.

use joan_core::{Module, TickContext, TickOutcome, WorkerAction};
use joan_types::{JoanError, ModuleId, SharedValues, State, impl_shared_values};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemplateValues {
    pub state: State,
    pub ticks: u64,
}
impl_shared_values!(TemplateValues);

#[derive(Debug, Default)]
pub struct Template;

impl Module for Template {
    fn id(&self) -> ModuleId {
        ModuleId::Template
    }

    fn shared_values(&self) -> Box<dyn SharedValues> {
        Box::new(TemplateValues::default())
    }

    fn worker_action(&self) -> Result<Box<dyn WorkerAction>, JoanError> {
        Ok(Box::new(Counter))
    }
}

struct Counter;

impl WorkerAction for Counter {
    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, JoanError> {
        ctx.news()
            .update_as(ctx.module(), |v: &mut TemplateValues| v.ticks += 1);
        Ok(TickOutcome::Continue)
    }
}
